use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::types::DockerConfig;
use crate::error::{Result, ToolscriptError};
use crate::sandbox::process::ContainerTarget;
use crate::sandbox::traits::{BackendCapabilities, SandboxBackend, SandboxInfo};
use crate::sandbox::GuestProcess;

/// Reusable container backend.
///
/// One container stays up between executions of a session and programs run
/// inside it via `docker exec`. The container has networking disabled, the
/// caller's working directory mounted read-only, and fixed CPU/memory
/// ceilings. A background reaper stops it once no exec has run in it for
/// longer than the idle window; a container with a live exec is never idle.
///
/// Creation and teardown of the container are serialized. Concurrent
/// executions are not: two overlapping programs exec into the same container.
pub struct DockerBackend {
    shared: Arc<Shared>,
    config: DockerConfig,
    python: String,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    runtime: PathBuf,
    idle_timeout: Duration,
    state: AsyncMutex<State>,
}

#[derive(Default)]
struct State {
    container: Option<Container>,
    closed: bool,
    created: u64,
}

#[derive(Debug)]
struct Container {
    id: String,
    /// Host directory mounted at the configured workdir
    mount: PathBuf,
    activity: Arc<Activity>,
}

impl Container {
    fn new(id: String, mount: PathBuf) -> Self {
        Self {
            id,
            mount,
            activity: Arc::new(Activity::new()),
        }
    }

    fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }
}

/// Live execs and last use of one container.
#[derive(Debug)]
struct Activity {
    live: AtomicUsize,
    last_used: Mutex<(Instant, DateTime<Utc>)>,
}

impl Activity {
    fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
            last_used: Mutex::new((Instant::now(), Utc::now())),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = (Instant::now(), Utc::now());
    }

    fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used.lock().unwrap_or_else(|e| e.into_inner()).1
    }

    /// Zero while any exec is running.
    fn idle_for(&self) -> Duration {
        if self.live.load(Ordering::Acquire) > 0 {
            return Duration::ZERO;
        }
        self.last_used.lock().unwrap_or_else(|e| e.into_inner()).0.elapsed()
    }
}

/// Counts one exec as live in its container until dropped.
struct ExecLease(Arc<Activity>);

impl ExecLease {
    fn new(activity: Arc<Activity>) -> Self {
        activity.touch();
        activity.live.fetch_add(1, Ordering::AcqRel);
        Self(activity)
    }
}

impl Drop for ExecLease {
    fn drop(&mut self) {
        self.0.touch();
        self.0.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DockerBackend {
    /// Create a new Docker backend and start its idle reaper.
    ///
    /// No container is created until the first program runs.
    pub async fn new(config: DockerConfig, python: String, idle_timeout: Duration) -> Result<Self> {
        if !Self::is_available().await {
            return Err(ToolscriptError::BackendNotAvailable {
                backend: "docker".to_string(),
                reason: "Docker daemon is not accessible. Ensure Docker is installed and running."
                    .to_string(),
            });
        }
        Self::with_probed_daemon(config, python, idle_timeout)
    }

    /// Like [`DockerBackend::new`] for callers that already probed the daemon.
    pub(crate) fn with_probed_daemon(
        config: DockerConfig,
        python: String,
        idle_timeout: Duration,
    ) -> Result<Self> {
        let runtime = which::which("docker").map_err(|e| ToolscriptError::BackendNotAvailable {
            backend: "docker".to_string(),
            reason: format!("docker CLI not found: {e}"),
        })?;

        let shared = Arc::new(Shared {
            runtime,
            idle_timeout,
            state: AsyncMutex::new(State::default()),
        });

        let interval = Duration::from_secs(config.reaper_interval_seconds.max(1));
        let reaper = tokio::spawn(reap_idle(Arc::downgrade(&shared), interval));

        info!(
            image = %config.image,
            idle_timeout_secs = idle_timeout.as_secs(),
            "Docker backend initialized"
        );

        Ok(Self {
            shared,
            config,
            python,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Check if the Docker backend is available on this system.
    ///
    /// Returns true if Docker daemon is accessible. Side-effect free.
    pub async fn is_available() -> bool {
        match Command::new("docker")
            .args(["info"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    /// Return a live container for `workdir`, creating one if needed.
    ///
    /// A container is reused when it mounts the same directory and has been
    /// used within the idle window; its timestamp is refreshed. Otherwise any
    /// stale container is stopped and a new one started.
    pub async fn acquire(&self, workdir: &Path) -> Result<String> {
        let (id, _lease) = self.checkout(workdir).await?;
        Ok(id)
    }

    /// [`DockerBackend::acquire`], holding the container live until the
    /// returned lease drops.
    async fn checkout(&self, workdir: &Path) -> Result<(String, ExecLease)> {
        let mount = workdir.canonicalize().map_err(|e| {
            ToolscriptError::SandboxInit(format!(
                "Cannot resolve working directory {}: {}",
                workdir.display(),
                e
            ))
        })?;

        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(ToolscriptError::SandboxClosed);
        }

        if let Some(container) = state.container.as_ref() {
            if container.mount == mount && container.idle_for() < self.shared.idle_timeout {
                debug!(container_id = %container.id, "Reusing container");
                let lease = ExecLease::new(Arc::clone(&container.activity));
                return Ok((container.id.clone(), lease));
            }
        }

        if let Some(stale) = state.container.take() {
            info!(container_id = %stale.id, "Replacing stale container");
            stop_container(&self.shared.runtime, &stale.id).await;
        }

        let id = self.start_container(&mount).await?;
        let container = Container::new(id.clone(), mount);
        let lease = ExecLease::new(Arc::clone(&container.activity));
        state.container = Some(container);
        state.created += 1;
        Ok((id, lease))
    }

    /// Number of containers this backend has started.
    pub async fn containers_created(&self) -> u64 {
        self.shared.state.lock().await.created
    }

    /// ID of the live container, if any.
    pub async fn current_container(&self) -> Option<String> {
        let state = self.shared.state.lock().await;
        state.container.as_ref().map(|c| c.id.clone())
    }

    async fn start_container(&self, mount: &Path) -> Result<String> {
        let name = format!("toolscript-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        info!(name = %name, mount = %mount.display(), "Starting container...");

        let output = Command::new(&self.shared.runtime)
            .args(self.run_args(&name, mount))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                ToolscriptError::SandboxInit(format!("Failed to start container: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolscriptError::SandboxInit(format!(
                "Failed to start container: {}",
                stderr.trim()
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(ToolscriptError::SandboxInit(
                "Container runtime returned no container ID".to_string(),
            ));
        }
        info!(container_id = %container_id, "Container started");
        Ok(container_id)
    }

    /// Arguments for `docker run` that create the long-lived container.
    fn run_args(&self, name: &str, mount: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "--name".into(),
            name.into(),
            "--label".into(),
            "toolscript=1".into(),
            // Network isolation
            "--network=none".into(),
            // Resource ceilings
            format!("--memory={}m", self.config.memory_limit_mb),
            format!("--cpus={}", self.config.cpus),
            format!("--pids-limit={}", self.config.pids_limit),
            "--cap-drop=ALL".into(),
            "--security-opt=no-new-privileges".into(),
        ];

        // Working directory, read-only
        args.push("-v".into());
        args.push(format!("{}:{}:ro", mount.display(), self.config.workdir));
        args.push("-w".into());
        args.push(self.config.workdir.clone());

        args.push("-e".into());
        args.push("PYTHONUNBUFFERED=1".into());
        args.push("-e".into());
        args.push("PYTHONIOENCODING=utf-8".into());

        // Image and command to keep container running
        args.push(self.config.image.clone());
        args.extend(["tail", "-f", "/dev/null"].map(String::from));
        args
    }

    /// Arguments for `docker exec` that run one guest program.
    ///
    /// `marker` is passed as the program's first argument so the process can
    /// be found inside the container on cancellation.
    fn exec_args(&self, container_id: &str, program: &str, marker: &str) -> Vec<String> {
        vec![
            "exec".into(),
            "-i".into(),
            "-w".into(),
            self.config.workdir.clone(),
            container_id.into(),
            self.python.clone(),
            "-u".into(),
            "-c".into(),
            program.into(),
            marker.into(),
        ]
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            network_isolated: true,
            readonly_workdir: true,
            resource_limits: true,
            reusable: true,
        }
    }

    async fn spawn(&self, program: &str, workdir: &Path) -> Result<GuestProcess> {
        let (container_id, lease) = self.checkout(workdir).await?;
        let marker = format!("toolscript-exec-{}", uuid::Uuid::new_v4().simple());

        debug!(
            container_id = %container_id,
            marker = %marker,
            program_len = program.len(),
            "Executing via docker exec"
        );

        let mut cmd = Command::new(&self.shared.runtime);
        cmd.args(self.exec_args(&container_id, program, &marker));

        let guest = GuestProcess::spawn(
            cmd,
            Some(ContainerTarget {
                runtime: self.shared.runtime.clone(),
                container_id,
                python: self.python.clone(),
                marker,
            }),
        )?;
        Ok(guest.holding(lease))
    }

    fn info(&self) -> SandboxInfo {
        let mut metadata = HashMap::from([
            ("image".to_string(), self.config.image.clone()),
            ("workdir".to_string(), self.config.workdir.clone()),
            (
                "memory_limit_mb".to_string(),
                self.config.memory_limit_mb.to_string(),
            ),
            ("cpus".to_string(), self.config.cpus.to_string()),
            ("networking".to_string(), "false".to_string()),
        ]);

        // Reporting only; skip the details while an acquire holds the lock.
        let (instance_id, running) = match self.shared.state.try_lock() {
            Ok(state) => {
                if let Some(container) = &state.container {
                    metadata.insert(
                        "last_used_at".to_string(),
                        container.activity.last_used_at().to_rfc3339(),
                    );
                    metadata.insert(
                        "mount".to_string(),
                        container.mount.display().to_string(),
                    );
                }
                metadata.insert("containers_created".to_string(), state.created.to_string());
                (state.container.as_ref().map(|c| c.id.clone()), !state.closed)
            }
            Err(_) => (None, true),
        };

        SandboxInfo {
            backend_type: "docker".to_string(),
            instance_id,
            running,
            metadata,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(reaper) = self.reaper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reaper.abort();
        }

        let mut state = self.shared.state.lock().await;
        state.closed = true;
        if let Some(container) = state.container.take() {
            stop_container(&self.shared.runtime, &container.id).await;
        }
        Ok(())
    }
}

impl Drop for DockerBackend {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reaper.abort();
        }
        // Shutdown was skipped; remove the container without waiting on it.
        if let Ok(mut state) = self.shared.state.try_lock() {
            if let Some(container) = state.container.take() {
                warn!(container_id = %container.id, "Docker backend dropped without shutdown");
                let _ = std::process::Command::new(&self.shared.runtime)
                    .args(["rm", "-f", &container.id])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn();
            }
        }
    }
}

/// Periodically stop the container once it has idled past the window.
/// Exits when the backend is gone.
async fn reap_idle(shared: Weak<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        reap_once(&shared).await;
    }
}

/// Stop the container if it has idled past the window. Returns whether one
/// was stopped.
async fn reap_once(shared: &Shared) -> bool {
    let mut state = shared.state.lock().await;
    let expired = state
        .container
        .as_ref()
        .is_some_and(|c| c.idle_for() > shared.idle_timeout);
    if !expired {
        return false;
    }
    match state.container.take() {
        Some(container) => {
            info!(
                container_id = %container.id,
                idle_secs = container.idle_for().as_secs(),
                "Stopping idle container"
            );
            stop_container(&shared.runtime, &container.id).await;
            true
        }
        None => false,
    }
}

/// Stop and remove a container. Failures are logged, not returned.
async fn stop_container(runtime: &Path, container_id: &str) {
    info!(container_id = %container_id, "Stopping container...");

    match Command::new(runtime)
        .args(["stop", "-t", "1", container_id])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
    {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(container_id = %container_id, error = %stderr.trim(), "Failed to stop container");
        }
        Err(e) => {
            warn!(container_id = %container_id, error = %e, "Failed to stop container");
        }
        Ok(_) => {}
    }

    // --rm usually removed it already
    let _ = Command::new(runtime)
        .args(["rm", "-f", container_id])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    info!(container_id = %container_id, "Container stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_for_args() -> DockerBackend {
        DockerBackend {
            shared: Arc::new(Shared {
                runtime: PathBuf::from("docker"),
                idle_timeout: Duration::from_secs(270),
                state: AsyncMutex::new(State::default()),
            }),
            config: DockerConfig::default(),
            python: "python3".to_string(),
            reaper: Mutex::new(None),
        }
    }

    #[test]
    fn run_args_isolate_the_container() {
        let backend = backend_for_args();
        let args = backend.run_args("toolscript-test", Path::new("/home/me/project"));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"--cpus=1".to_string()));
        assert!(args.contains(&"/home/me/project:/workspace:ro".to_string()));
        assert_eq!(&args[args.len() - 4..], &["python:3.12-slim", "tail", "-f", "/dev/null"]);
    }

    #[test]
    fn exec_args_run_inside_existing_container() {
        let backend = backend_for_args();
        let args = backend.exec_args("abc123", "print(1)", "toolscript-exec-x");
        assert_eq!(args[0], "exec");
        assert!(args.contains(&"-i".to_string()));
        assert_eq!(
            &args[4..],
            &["abc123", "python3", "-u", "-c", "print(1)", "toolscript-exec-x"]
        );
    }

    #[tokio::test]
    async fn shutdown_twice_is_a_noop_without_container() {
        let backend = backend_for_args();
        backend.shutdown().await.unwrap();
        backend.shutdown().await.unwrap();
        assert!(!backend.info().running);
        let err = backend.acquire(Path::new(".")).await.unwrap_err();
        assert!(matches!(err, ToolscriptError::SandboxClosed));
    }

    #[tokio::test]
    async fn reaper_spares_a_container_with_a_live_exec() {
        // `true` accepts the stop/rm arguments and succeeds.
        let shared = Shared {
            runtime: PathBuf::from("true"),
            idle_timeout: Duration::from_millis(100),
            state: AsyncMutex::new(State::default()),
        };
        let container = Container::new("c1".to_string(), PathBuf::from("/tmp"));
        let lease = ExecLease::new(Arc::clone(&container.activity));
        shared.state.lock().await.container = Some(container);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!reap_once(&shared).await);
        assert!(shared.state.lock().await.container.is_some());

        // Exit refreshes the clock.
        drop(lease);
        assert!(!reap_once(&shared).await);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(reap_once(&shared).await);
        assert!(shared.state.lock().await.container.is_none());
    }

    #[test]
    fn leases_count_live_execs() {
        let activity = Arc::new(Activity::new());
        let first = ExecLease::new(Arc::clone(&activity));
        let second = ExecLease::new(Arc::clone(&activity));
        assert_eq!(activity.live.load(Ordering::Acquire), 2);
        drop(first);
        assert_eq!(activity.idle_for(), Duration::ZERO);
        drop(second);
        assert_eq!(activity.live.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn sequential_acquires_reuse_one_container() {
        if !DockerBackend::is_available().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let backend = DockerBackend::new(
            DockerConfig::default(),
            "python3".to_string(),
            Duration::from_secs(270),
        )
        .await
        .unwrap();

        let first = match backend.acquire(dir.path()).await {
            Ok(id) => id,
            // Image not pullable here (offline runner)
            Err(_) => return,
        };
        let second = backend.acquire(dir.path()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.containers_created().await, 1);

        backend.shutdown().await.unwrap();
        backend.shutdown().await.unwrap();
        assert!(backend.current_container().await.is_none());
    }
}
