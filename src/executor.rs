use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelOptions, ProgressObserver, RpcChannel};
use crate::config::types::SandboxConfig;
use crate::error::{ExecutionError, Result, ToolscriptError};
use crate::guest;
use crate::sandbox::SandboxBackend;
use crate::stubs;
use crate::tools::{ToolCatalog, ToolDispatcher};

/// Final result of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutput {
    pub text: String,
    pub truncated: bool,
}

/// Per-call knobs for [`Executor::execute`].
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Defaults to the host process's current directory
    pub working_dir: Option<PathBuf>,
    pub cancel: CancellationToken,
    pub observer: Option<Arc<dyn ProgressObserver>>,
    /// Overrides the configured timeout for this call
    pub timeout: Option<Duration>,
}

/// Limits applied to every execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub grace: Duration,
    pub max_output_chars: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl From<&SandboxConfig> for ExecutionLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            timeout: config.timeout(),
            grace: config.grace(),
            max_output_chars: config.max_output_chars,
        }
    }
}

/// Runs scripts against a backend and a tool catalogue.
pub struct Executor {
    backend: Arc<dyn SandboxBackend>,
    catalog: Arc<dyn ToolCatalog>,
    dispatcher: Arc<dyn ToolDispatcher>,
    limits: ExecutionLimits,
}

impl Executor {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        catalog: Arc<dyn ToolCatalog>,
        dispatcher: Arc<dyn ToolDispatcher>,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            backend,
            catalog,
            dispatcher,
            limits,
        }
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Stub source for the catalogue as it is right now.
    pub fn stubs(&self) -> String {
        stubs::generate(&self.catalog.snapshot())
    }

    /// Run one script to completion.
    ///
    /// The catalogue is snapshotted up front; tools registered or removed
    /// while the script runs do not affect it. Every failure comes back as
    /// [`ToolscriptError::Execution`].
    pub async fn execute(&self, script: &str, options: ExecuteOptions) -> Result<ExecutionOutput> {
        if options.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled.into());
        }

        let tools = self.catalog.snapshot();
        let program = guest::compose(&stubs::generate(&tools), script);
        let working_dir = match options.working_dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let timeout = options.timeout.unwrap_or(self.limits.timeout);

        info!(
            backend = self.backend.name(),
            tools = tools.len(),
            script_lines = program.total_lines,
            workdir = %working_dir.display(),
            "Starting execution"
        );
        let started = Instant::now();

        let guest = self
            .backend
            .spawn(&program.source, &working_dir)
            .await
            .map_err(spawn_error)?;

        let channel = RpcChannel::new(
            guest,
            &tools,
            Arc::clone(&self.dispatcher),
            script,
            ChannelOptions {
                timeout,
                grace: self.limits.grace,
                cancel: options.cancel,
                observer: options.observer,
            },
        );

        match channel.run().await {
            Ok(text) => {
                let output = truncate_output(text, self.limits.max_output_chars);
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    truncated = output.truncated,
                    "Execution complete"
                );
                Ok(output)
            }
            Err(e) => {
                warn!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "Execution failed"
                );
                Err(e.into())
            }
        }
    }
}

/// Failures to start the guest surface as execution errors like any other.
fn spawn_error(err: ToolscriptError) -> ToolscriptError {
    match err {
        ToolscriptError::Execution(_) | ToolscriptError::SandboxClosed => err,
        other => ExecutionError::Spawn(other.to_string()).into(),
    }
}

/// Cut `text` to its first `max_chars` characters and append a notice with
/// the original length. Shorter text is returned as is.
pub fn truncate_output(text: String, max_chars: usize) -> ExecutionOutput {
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return ExecutionOutput {
            text,
            truncated: false,
        };
    };

    let original = text.chars().count();
    debug!(original, max_chars, "Truncating output");

    let mut truncated = String::with_capacity(cut + 80);
    truncated.push_str(&text[..cut]);
    truncated.push_str(&format!(
        "\n\n[Output truncated: original length was {original} characters]"
    ));
    ExecutionOutput {
        text: truncated,
        truncated: true,
    }
}
