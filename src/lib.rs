pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod guest;
pub mod protocol;
pub mod sandbox;
pub mod session;
pub mod stubs;
pub mod tools;

pub use error::{Result, ToolscriptError};
pub use executor::{ExecuteOptions, ExecutionOutput, Executor};
pub use session::Session;
