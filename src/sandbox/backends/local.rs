use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Result, ToolscriptError};
use crate::sandbox::traits::{BackendCapabilities, SandboxBackend, SandboxInfo};
use crate::sandbox::GuestProcess;

/// Ephemeral process backend.
///
/// Every program gets a fresh interpreter process with unbuffered output,
/// running in the caller's working directory with the caller's environment.
/// Nothing outlives the execution, so there is nothing to shut down.
pub struct ProcessBackend {
    python: PathBuf,
}

impl ProcessBackend {
    pub fn new(python: &str) -> Result<Self> {
        let resolved = which::which(python).map_err(|e| ToolscriptError::BackendNotAvailable {
            backend: "process".to_string(),
            reason: format!("interpreter '{python}' not found: {e}"),
        })?;

        info!(python = %resolved.display(), "Process backend initialized");
        Ok(Self { python: resolved })
    }

    /// Check if the interpreter can be found on this system.
    pub fn is_available(python: &str) -> bool {
        which::which(python).is_ok()
    }

    pub fn interpreter(&self) -> &Path {
        &self.python
    }
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    async fn spawn(&self, program: &str, workdir: &Path) -> Result<GuestProcess> {
        debug!(
            workdir = %workdir.display(),
            program_len = program.len(),
            "Spawning guest interpreter"
        );

        let mut cmd = Command::new(&self.python);
        cmd.arg("-u").arg("-c").arg(program);
        cmd.current_dir(workdir);
        cmd.env("PYTHONIOENCODING", "utf-8");
        cmd.env("PYTHONUNBUFFERED", "1");

        GuestProcess::spawn(cmd, None)
    }

    fn info(&self) -> SandboxInfo {
        SandboxInfo {
            backend_type: "process".to_string(),
            instance_id: None,
            running: true,
            metadata: HashMap::from([(
                "python".to_string(),
                self.python.display().to_string(),
            )]),
        }
    }
}
