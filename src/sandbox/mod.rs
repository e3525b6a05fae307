mod backends;
mod factory;
mod process;
mod traits;

#[cfg(feature = "docker")]
pub use backends::DockerBackend;
pub use backends::ProcessBackend;

pub use factory::{available_backends, create_backend, resolve_backend_type, BackendInfo};
pub use process::{ContainerTarget, GuestProcess, GuestStdio};
pub use traits::{BackendCapabilities, SandboxBackend, SandboxInfo};
