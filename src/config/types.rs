use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::tools::ToolDescriptor;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolscriptConfig {
    pub sandbox: SandboxConfig,
    /// Tools exposed to scripts run from the command line.
    pub tools: Vec<CommandToolConfig>,
}

/// The type of sandbox backend to use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Fresh interpreter process per execution
    Process,
    /// Long-lived container reused across executions
    Docker,
    /// Docker when the daemon answers, otherwise a local process
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Which backend to use
    pub backend: BackendType,
    /// Guest interpreter (resolved on PATH for the process backend)
    pub python: String,
    /// Wall-clock ceiling for one execution, also the container idle window
    pub timeout_seconds: u64,
    /// Time between the graceful and the forced termination signal
    pub grace_seconds: u64,
    /// Final output is cut to this many characters
    pub max_output_chars: usize,
    /// Docker-specific configuration
    pub docker: DockerConfig,
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            python: "python3".to_string(),
            timeout_seconds: 270,
            grace_seconds: 5,
            max_output_chars: 100_000,
            docker: DockerConfig::default(),
        }
    }
}

/// Docker-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Image that provides the guest interpreter
    pub image: String,
    /// Memory ceiling in MB
    pub memory_limit_mb: u64,
    /// CPU ceiling (fractional cores)
    pub cpus: f64,
    /// Maximum number of processes inside the container
    pub pids_limit: u32,
    /// Mount point of the caller's working directory (read-only)
    pub workdir: String,
    /// How often the idle reaper checks the container
    pub reaper_interval_seconds: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            memory_limit_mb: 512,
            cpus: 1.0,
            pids_limit: 256,
            workdir: "/workspace".to_string(),
            reaper_interval_seconds: 30,
        }
    }
}

/// A host tool backed by a local command.
///
/// The command receives the call's params as JSON on stdin; its stdout
/// becomes the tool's text result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandToolConfig {
    pub name: String,
    pub description: String,
    /// Program and arguments, e.g. `["jq", "-r", ".text"]`
    pub command: Vec<String>,
    /// JSON-Schema-like parameter description
    pub parameters: serde_json::Value,
}

impl CommandToolConfig {
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            parameter_schema: self.parameters.clone(),
        }
    }
}
