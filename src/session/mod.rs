//! Session-scoped execution context.
//!
//! A [`Session`] owns one sandbox backend and one executor for the lifetime
//! of its host (an agent conversation, a CLI invocation). Nothing is global:
//! callers create a session, run scripts through it, and shut it down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::types::SandboxConfig;
use crate::error::{Result, ToolscriptError};
use crate::executor::{ExecuteOptions, ExecutionLimits, ExecutionOutput, Executor};
use crate::sandbox::{create_backend, SandboxBackend, SandboxInfo};
use crate::tools::{ToolCatalog, ToolDispatcher};

pub struct Session {
    /// Short unique identifier, used in logs
    id: String,
    created_at: DateTime<Utc>,
    executor: Executor,
    executions: AtomicU64,
    closed: AtomicBool,
}

impl Session {
    /// Probe for a backend per `config` and bind it to the tool seams.
    pub async fn start(
        config: &SandboxConfig,
        catalog: Arc<dyn ToolCatalog>,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> Result<Self> {
        let backend = create_backend(config).await?;
        Ok(Self::with_backend(
            backend,
            catalog,
            dispatcher,
            ExecutionLimits::from(config),
        ))
    }

    /// Build a session around an already created backend.
    pub fn with_backend(
        backend: Arc<dyn SandboxBackend>,
        catalog: Arc<dyn ToolCatalog>,
        dispatcher: Arc<dyn ToolDispatcher>,
        limits: ExecutionLimits,
    ) -> Self {
        let id = generate_session_id();
        info!(id = %id, backend = backend.name(), "Session started");
        Self {
            id,
            created_at: Utc::now(),
            executor: Executor::new(backend, catalog, dispatcher, limits),
            executions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Number of executions started in this session
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        self.executor.backend()
    }

    pub fn info(&self) -> SandboxInfo {
        self.executor.backend().info()
    }

    pub fn stubs(&self) -> String {
        self.executor.stubs()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run one script. Concurrent calls are allowed and share the backend.
    pub async fn execute(&self, script: &str, options: ExecuteOptions) -> Result<ExecutionOutput> {
        if self.is_closed() {
            return Err(ToolscriptError::SandboxClosed);
        }
        let n = self.executions.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(session = %self.id, execution = n, "Executing script");
        self.executor.execute(script, options).await
    }

    /// Release the backend. Later calls are no-ops.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(id = %self.id, executions = self.executions(), "Session shutting down");
        self.executor.backend().shutdown().await
    }
}

/// Generate a short, unique session ID
fn generate_session_id() -> String {
    static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);

    // Base36 of timestamp and counter
    let combined = (timestamp & 0xFFFFFF) << 8 | (counter as u64 & 0xFF);
    format_base36(combined)
}

/// Format a number as base36 string
fn format_base36(mut n: u64) -> String {
    const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if n == 0 {
        return "0".to_string();
    }

    let mut result = String::new();
    while n > 0 {
        result.insert(0, CHARS[(n % 36) as usize] as char);
        n /= 36;
    }
    result
}

/// Parse a duration string (e.g., "30s", "5m", "1h", or bare seconds)
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    if s.is_empty() {
        return Err(ToolscriptError::Config("Empty duration value".to_string()));
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("ms") {
        let ms: u64 = n
            .parse()
            .map_err(|_| ToolscriptError::Config(format!("Invalid duration: {}", s)))?;
        return Ok(Duration::from_millis(ms));
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1u64)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60u64)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600u64)
    } else {
        // Assume seconds if no suffix
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| ToolscriptError::Config(format!("Invalid duration: {}", s)))?;

    if num == 0 {
        return Err(ToolscriptError::Config("Duration must be positive".to_string()));
    }

    Ok(Duration::from_secs(num * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ProcessBackend;
    use crate::tools::{FnDispatcher, StaticCatalog};

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("0").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_format_base36() {
        assert_eq!(format_base36(0), "0");
        assert_eq!(format_base36(10), "a");
        assert_eq!(format_base36(35), "z");
        assert_eq!(format_base36(36), "10");
    }

    #[test]
    fn session_ids_differ() {
        assert_ne!(generate_session_id(), generate_session_id());
    }

    #[tokio::test]
    async fn closed_session_rejects_executions() {
        if !ProcessBackend::is_available("python3") {
            return;
        }
        let session = Session::with_backend(
            Arc::new(ProcessBackend::new("python3").unwrap()),
            Arc::new(StaticCatalog::default()),
            Arc::new(FnDispatcher::new()),
            ExecutionLimits::default(),
        );
        session.shutdown().await.unwrap();
        session.shutdown().await.unwrap();
        assert!(session.is_closed());

        let err = session
            .execute("return 1", ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolscriptError::SandboxClosed));
        assert_eq!(session.executions(), 0);
    }
}
