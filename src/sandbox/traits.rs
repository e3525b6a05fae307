use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::sandbox::GuestProcess;

/// Capability flags indicating what the backend provides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Guest has no network access
    pub network_isolated: bool,
    /// Guest sees the working directory read-only
    pub readonly_workdir: bool,
    /// CPU and memory ceilings are enforced
    pub resource_limits: bool,
    /// The environment outlives a single execution
    pub reusable: bool,
}

/// Information about the running sandbox instance
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    /// Backend type identifier
    pub backend_type: String,
    /// Instance identifier (container ID), if one is live
    pub instance_id: Option<String>,
    /// Whether the backend still accepts executions
    pub running: bool,
    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for sandbox execution backends.
///
/// A backend owns the isolated environment and starts guest programs inside
/// it. The process and container variants are interchangeable: callers only
/// see a [`GuestProcess`] with piped stdio.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Returns the backend name (e.g., "process", "docker")
    fn name(&self) -> &str;

    /// Returns the capabilities of this backend
    fn capabilities(&self) -> BackendCapabilities;

    /// Start a guest program with `workdir` as the caller's working directory.
    async fn spawn(&self, program: &str, workdir: &Path) -> Result<GuestProcess>;

    /// Get information about the sandbox instance
    fn info(&self) -> SandboxInfo;

    /// Release everything the backend holds.
    /// Must be safe to call more than once. Default is a no-op for stateless backends.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Check if the backend is healthy and ready to accept programs.
    /// Default implementation runs a trivial program and checks its exit code.
    async fn health_check(&self) -> Result<bool> {
        let workdir = std::env::current_dir()?;
        let mut guest = match self.spawn("import sys; sys.exit(0)", &workdir).await {
            Ok(guest) => guest,
            Err(_) => return Ok(false),
        };
        // Closing stdin lets a guest that waits on it exit.
        drop(guest.take_stdio());
        Ok(guest.wait().await.map(|s| s.success()).unwrap_or(false))
    }
}
