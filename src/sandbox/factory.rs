use std::sync::Arc;

use crate::config::types::{BackendType, SandboxConfig};
use crate::error::{Result, ToolscriptError};
use crate::sandbox::backends::ProcessBackend;
use crate::sandbox::traits::SandboxBackend;

#[cfg(feature = "docker")]
use crate::sandbox::backends::DockerBackend;

const DOCKER_UNREACHABLE: &str =
    "Docker daemon is not accessible. Ensure Docker is installed and running.";

/// Create a sandbox backend based on the configuration.
///
/// The container backend's idle window is the execution timeout. Containers
/// with a running exec are never reaped.
pub async fn create_backend(config: &SandboxConfig) -> Result<Arc<dyn SandboxBackend>> {
    let backend_type = resolve_backend_type(&config.backend, &config.python).await?;

    match backend_type {
        BackendType::Process => {
            let backend = ProcessBackend::new(&config.python)?;
            Ok(Arc::new(backend))
        }

        #[cfg(feature = "docker")]
        BackendType::Docker => {
            // The daemon was probed during resolution.
            let backend = DockerBackend::with_probed_daemon(
                config.docker.clone(),
                config.python.clone(),
                config.timeout(),
            )?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "docker"))]
        BackendType::Docker => Err(ToolscriptError::BackendNotAvailable {
            backend: "docker".to_string(),
            reason: "Docker support was not compiled in. Rebuild with --features docker"
                .to_string(),
        }),

        BackendType::Auto => Err(ToolscriptError::BackendNotAvailable {
            backend: "auto".to_string(),
            reason: "backend selection did not resolve".to_string(),
        }),
    }
}

/// Resolve the backend type, handling Auto selection.
///
/// Auto prefers the container backend and falls back to a local process.
pub async fn resolve_backend_type(requested: &BackendType, python: &str) -> Result<BackendType> {
    match requested {
        BackendType::Auto => {
            if docker_available().await {
                return Ok(BackendType::Docker);
            }
            if ProcessBackend::is_available(python) {
                return Ok(BackendType::Process);
            }
            Err(ToolscriptError::BackendNotAvailable {
                backend: "auto".to_string(),
                reason: format!("No sandbox backends available (no Docker daemon, no '{python}')"),
            })
        }
        BackendType::Docker => {
            if !docker_available().await {
                return Err(ToolscriptError::BackendNotAvailable {
                    backend: "docker".to_string(),
                    reason: DOCKER_UNREACHABLE.to_string(),
                });
            }
            Ok(BackendType::Docker)
        }
        BackendType::Process => {
            if !ProcessBackend::is_available(python) {
                return Err(ToolscriptError::BackendNotAvailable {
                    backend: "process".to_string(),
                    reason: format!("interpreter '{python}' not found on PATH"),
                });
            }
            Ok(BackendType::Process)
        }
    }
}

#[cfg(feature = "docker")]
async fn docker_available() -> bool {
    DockerBackend::is_available().await
}

#[cfg(not(feature = "docker"))]
async fn docker_available() -> bool {
    false
}

/// Get information about available backends on this system.
pub async fn available_backends(python: &str) -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    let process = ProcessBackend::is_available(python);
    backends.push(BackendInfo {
        name: "process",
        available: process,
        description: "Fresh local interpreter per execution (no isolation)",
        unavailable_reason: if process {
            None
        } else {
            Some("Python interpreter not found on PATH")
        },
    });

    #[cfg(feature = "docker")]
    {
        let docker = DockerBackend::is_available().await;
        backends.push(BackendInfo {
            name: "docker",
            available: docker,
            description: "Reusable container, no network, read-only workdir",
            unavailable_reason: if docker {
                None
            } else {
                Some("Docker daemon not accessible")
            },
        });
    }

    #[cfg(not(feature = "docker"))]
    {
        backends.push(BackendInfo {
            name: "docker",
            available: false,
            description: "Reusable container, no network, read-only workdir",
            unavailable_reason: Some("Not compiled in (use --features docker)"),
        });
    }

    backends
}

/// Information about a sandbox backend.
pub struct BackendInfo {
    pub name: &'static str,
    pub available: bool,
    pub description: &'static str,
    pub unavailable_reason: Option<&'static str>,
}
