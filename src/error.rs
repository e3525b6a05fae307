use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolscriptError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Sandbox errors
    #[error("Sandbox initialization failed: {0}")]
    SandboxInit(String),

    #[error("Backend '{backend}' is not available: {reason}")]
    BackendNotAvailable { backend: String, reason: String },

    #[error("Sandbox has been shut down")]
    SandboxClosed,

    // Execution errors
    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Script not found: {path}")]
    ScriptNotFound { path: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ToolscriptError {
    /// The terminal execution failure, if this error carries one.
    pub fn execution(&self) -> Option<&ExecutionError> {
        match self {
            Self::Execution(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Timeout { .. }))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Cancelled))
    }
}

/// Terminal failure of a single script execution.
///
/// Tool-level failures never show up here: they travel back to the guest as
/// `tool_result.error` and the script decides what to do with them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Unhandled exception in the guest script.
    #[error("{}", format_guest_error(.message, .traceback.as_deref()))]
    Guest {
        message: String,
        traceback: Option<String>,
    },

    /// The guest process died or exited without reporting a result.
    #[error("{0}")]
    Process(String),

    /// The guest process (or its container) could not be started.
    #[error("failed to start guest: {0}")]
    Spawn(String),

    #[error("script timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("execution aborted")]
    Cancelled,
}

fn format_guest_error(message: &str, traceback: Option<&str>) -> String {
    match traceback.map(str::trim_end).filter(|t| !t.is_empty()) {
        Some(tb) => format!("{message}\n\n{tb}"),
        None => message.to_string(),
    }
}

/// Failure reported by a host tool implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ToolscriptError>;
