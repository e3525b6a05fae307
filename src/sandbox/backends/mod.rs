#[cfg(feature = "docker")]
mod docker;
mod local;

#[cfg(feature = "docker")]
pub use docker::DockerBackend;
pub use local::ProcessBackend;
