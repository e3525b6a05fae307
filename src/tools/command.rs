//! Tools backed by host commands.
//!
//! Each configured tool is a program that reads the call's params as JSON on
//! stdin and answers on stdout. This runs on the HOST with the caller's
//! permissions; only configure commands you trust.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::types::CommandToolConfig;
use crate::error::ToolError;
use crate::tools::{StaticCatalog, ToolDispatcher, ToolOutput};

pub struct CommandDispatcher {
    tools: HashMap<String, CommandToolConfig>,
    workdir: Option<PathBuf>,
}

impl CommandDispatcher {
    pub fn new(tools: &[CommandToolConfig]) -> Self {
        Self {
            tools: tools.iter().map(|t| (t.name.clone(), t.clone())).collect(),
            workdir: None,
        }
    }

    /// Run tool commands from this directory instead of the current one.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Catalogue describing the same tools this dispatcher serves.
    pub fn catalog(tools: &[CommandToolConfig]) -> StaticCatalog {
        StaticCatalog::new(tools.iter().map(CommandToolConfig::descriptor).collect())
    }
}

#[async_trait]
impl ToolDispatcher for CommandDispatcher {
    async fn dispatch(&self, name: &str, params: Value) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::new(format!("Unknown tool: {name}")))?;
        let (program, args) = tool
            .command
            .split_first()
            .ok_or_else(|| ToolError::new(format!("tool '{name}' has an empty command")))?;

        debug!(tool = %name, program = %program, "Running command tool");

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::new(format!("Failed to spawn '{program}': {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&params)
                .map_err(|e| ToolError::new(format!("Failed to encode params: {e}")))?;
            // A command that ignores stdin may close it early; that is not a failure.
            let _ = stdin.write_all(&payload).await;
            let _ = stdin.shutdown().await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ToolError::new(format!("Failed to wait for '{program}': {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        debug!(
            tool = %name,
            exit_code = ?output.status.code(),
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Command tool completed"
        );

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr.trim().to_string()
            };
            return Err(ToolError::new(format!("{name}: {detail}")));
        }

        Ok(ToolOutput::text(stdout))
    }
}
