use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Progress, ProgressObserver};
use crate::cli::args::{ConfigAction, ConfigArgs, InitArgs, OutputFormat, RunArgs};
use crate::config::loader::get_config_path;
use crate::config::types::{CommandToolConfig, ToolscriptConfig};
use crate::error::{Result, ToolscriptError};
use crate::executor::{ExecuteOptions, ExecutionOutput};
use crate::sandbox::available_backends;
use crate::session::{parse_duration, Session};
use crate::tools::CommandDispatcher;

/// Logs what the guest reports while it runs.
struct LogObserver;

impl ProgressObserver for LogObserver {
    fn on_progress(&self, progress: &Progress) {
        debug!(
            line = progress.line,
            total = progress.total_lines,
            source = progress.source.as_deref().unwrap_or("").trim(),
            "Script progress"
        );
    }

    fn on_update(&self, message: &str) {
        info!(message = %message, "Script update");
    }
}

/// Execute a script with the configured command tools
pub async fn run(args: RunArgs, mut config: ToolscriptConfig, format: OutputFormat) -> Result<()> {
    let script = read_script(&args.script).await?;
    let cwd = match args.cwd {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    if let Some(backend) = args.backend {
        config.sandbox.backend = backend;
    }
    let timeout = args.timeout.as_deref().map(parse_duration).transpose()?;
    if let Some(timeout) = timeout {
        apply_timeout_override(&mut config, timeout);
    }

    info!(script = %args.script, cwd = %cwd.display(), "Running script");

    let catalog = Arc::new(CommandDispatcher::catalog(&config.tools));
    let dispatcher = Arc::new(CommandDispatcher::new(&config.tools).with_workdir(&cwd));
    let session = Session::start(&config.sandbox, catalog, dispatcher).await?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling execution");
            interrupt.cancel();
        }
    });

    let result = session
        .execute(
            &script,
            ExecuteOptions {
                working_dir: Some(cwd),
                cancel,
                observer: Some(Arc::new(LogObserver)),
                timeout,
            },
        )
        .await;

    ctrl_c.abort();
    if let Err(e) = session.shutdown().await {
        warn!(error = %e, "Failed to shut down sandbox");
    }

    match result {
        Ok(output) => {
            output_execution(&output, format)?;
            Ok(())
        }
        Err(e) => {
            match format {
                OutputFormat::Text => eprintln!("{e}"),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({
                        "error": e.to_string(),
                        "timed_out": e.is_timeout(),
                        "cancelled": e.is_cancelled(),
                    })
                ),
            }
            std::process::exit(1);
        }
    }
}

/// Print the stubs scripts would see with the configured tools
pub async fn stubs(config: ToolscriptConfig) -> Result<()> {
    let descriptors: Vec<_> = config
        .tools
        .iter()
        .map(CommandToolConfig::descriptor)
        .collect();
    print!("{}", crate::stubs::generate(&descriptors));
    Ok(())
}

/// List sandbox backends and their availability
pub async fn backends(config: ToolscriptConfig, format: OutputFormat) -> Result<()> {
    let backends = available_backends(&config.sandbox.python).await;

    match format {
        OutputFormat::Text => {
            println!("{:<10} {:<10} DESCRIPTION", "BACKEND", "STATUS");
            println!("{}", "-".repeat(70));
            for backend in backends {
                let status = if backend.available {
                    "available"
                } else {
                    "missing"
                };
                match backend.unavailable_reason {
                    Some(reason) => println!(
                        "{:<10} {:<10} {} ({})",
                        backend.name, status, backend.description, reason
                    ),
                    None => println!("{:<10} {:<10} {}", backend.name, status, backend.description),
                }
            }
            println!();
            println!("Configured: {:?}", config.sandbox.backend);
        }
        OutputFormat::Json => {
            let json: Vec<_> = backends
                .iter()
                .map(|b| {
                    serde_json::json!({
                        "name": b.name,
                        "available": b.available,
                        "description": b.description,
                        "unavailable_reason": b.unavailable_reason,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    write_default_config(&config_path)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Add tools under [[tools]] in the config, then inspect their stubs");
    println!("  toolscript stubs");
    println!();
    println!("  # Run a script; its return value is printed");
    println!("  echo 'return 1 + 1' | toolscript run -");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: ToolscriptConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| ToolscriptError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

async fn read_script(source: &str) -> Result<String> {
    if source == "-" {
        let mut script = String::new();
        tokio::io::stdin().read_to_string(&mut script).await?;
        return Ok(script);
    }

    let path = PathBuf::from(source);
    if !path.exists() {
        return Err(ToolscriptError::ScriptNotFound {
            path: path.display().to_string(),
        });
    }
    Ok(tokio::fs::read_to_string(&path).await?)
}

/// The override also becomes the container idle window.
fn apply_timeout_override(config: &mut ToolscriptConfig, timeout: Duration) {
    let secs = timeout.as_secs_f64().ceil() as u64;
    config.sandbox.timeout_seconds = secs.max(1);
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(&ToolscriptConfig::default())
        .map_err(|e| ToolscriptError::Config(e.to_string()))?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

fn output_execution(output: &ExecutionOutput, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("{}", output.text);
            if output.truncated {
                warn!("Output was truncated");
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(output)?);
        }
    }
    Ok(())
}
