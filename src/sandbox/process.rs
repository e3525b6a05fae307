//! Handle to a running guest program.
//!
//! The host end of the guest is always a local child process: the
//! interpreter itself, or the container runtime's `exec` client. Termination
//! goes to the child's whole process group, and for container execs also to
//! the tagged process inside the container, which the local signal cannot
//! reach.

use std::any::Any;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::{ExecutionError, Result};

/// Signals a tagged process inside a container. Runs with the container's
/// own interpreter, so the image needs nothing beyond Python.
const CONTAINER_KILL_SCRIPT: &str = r#"
import os, sys
marker, sig = sys.argv[1].encode(), int(sys.argv[2])
me = os.getpid()
for entry in os.listdir("/proc"):
    if not entry.isdigit() or int(entry) == me:
        continue
    pid = int(entry)
    try:
        with open("/proc/%d/cmdline" % pid, "rb") as f:
            if marker not in f.read().split(b"\0"):
                continue
        if os.getpgid(pid) == pid:
            os.killpg(pid, sig)
        else:
            os.kill(pid, sig)
    except OSError:
        pass
"#;

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// Guest running inside a container, identified by a marker argument.
#[derive(Debug, Clone)]
pub struct ContainerTarget {
    pub runtime: PathBuf,
    pub container_id: String,
    pub python: String,
    pub marker: String,
}

impl ContainerTarget {
    async fn signal(&self, signal: i32) {
        let result = Command::new(&self.runtime)
            .arg("exec")
            .arg(&self.container_id)
            .arg(&self.python)
            .arg("-c")
            .arg(CONTAINER_KILL_SCRIPT)
            .arg(&self.marker)
            .arg(signal.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                debug!(container_id = %self.container_id, signal, "Signalled guest in container");
            }
            Ok(output) => {
                warn!(
                    container_id = %self.container_id,
                    signal,
                    error = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Failed to signal guest in container"
                );
            }
            Err(e) => {
                warn!(
                    container_id = %self.container_id,
                    error = %e,
                    "Failed to run container exec"
                );
            }
        }
    }
}

/// Piped standard streams of a guest.
pub struct GuestStdio {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

pub struct GuestProcess {
    child: Child,
    stdio: Option<GuestStdio>,
    container: Option<ContainerTarget>,
    terminated: bool,
    /// Released when the guest is dropped
    _hold: Option<Box<dyn Any + Send + Sync>>,
}

impl GuestProcess {
    /// Spawn `cmd` with piped stdio in its own process group.
    pub fn spawn(mut cmd: Command, container: Option<ContainerTarget>) -> Result<Self> {
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutionError::Spawn(e.to_string()))?;

        let stdio = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => GuestStdio {
                stdin,
                stdout,
                stderr,
            },
            _ => {
                let _ = child.start_kill();
                return Err(ExecutionError::Spawn("failed to capture guest stdio".into()).into());
            }
        };

        debug!(pid = ?child.id(), in_container = container.is_some(), "Guest process started");

        Ok(Self {
            child,
            stdio: Some(stdio),
            container,
            terminated: false,
            _hold: None,
        })
    }

    /// Keep `guard` alive for as long as this guest is.
    pub fn holding(mut self, guard: impl Any + Send + Sync) -> Self {
        self._hold = Some(Box::new(guard));
        self
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn container(&self) -> Option<&ContainerTarget> {
        self.container.as_ref()
    }

    /// Take the piped streams. Returns `None` after the first call.
    pub fn take_stdio(&mut self) -> Option<GuestStdio> {
        self.stdio.take()
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Graceful then forced termination.
    ///
    /// Sends SIGTERM to the guest's process group, waits up to `grace` for it
    /// to exit, then SIGKILLs it. A second call is a no-op.
    pub async fn terminate(&mut self, grace: Duration) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        if let Ok(Some(_)) = self.child.try_wait() {
            if let Some(container) = &self.container {
                container.signal(SIGTERM).await;
            }
            return;
        }

        debug!(pid = ?self.child.id(), "Terminating guest");
        self.signal_group(SIGTERM);
        if let Some(container) = &self.container {
            container.signal(SIGTERM).await;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => {
                debug!("Guest exited after SIGTERM");
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Guest ignored SIGTERM, killing");
                self.signal_group(SIGKILL);
                if let Some(container) = &self.container {
                    container.signal(SIGKILL).await;
                }
                let _ = self.child.kill().await;
            }
        }
    }

    #[cfg(unix)]
    fn signal_group(&mut self, signal: i32) {
        if let Some(pid) = self.child.id() {
            // Negative pid addresses the process group created at spawn.
            let rc = unsafe { libc::kill(-(pid as i32), signal) };
            if rc != 0 {
                let error = std::io::Error::last_os_error();
                debug!(pid, signal, error = %error, "Group signal failed");
                let _ = self.child.start_kill();
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: i32) {
        let _ = self.child.start_kill();
    }
}
