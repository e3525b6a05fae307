use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::types::BackendType;

#[derive(Parser, Debug)]
#[clap(name = "toolscript")]
#[clap(version, about = "Run a Python script that calls host tools, inside a sandbox")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "TOOLSCRIPT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a script with the configured tools
    Run(RunArgs),

    /// Print the generated tool stubs
    Stubs,

    /// List sandbox backends and whether they are usable here
    Backends,

    /// Initialize a new toolscript configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Script file, or "-" to read it from stdin
    pub script: String,

    /// Working directory handed to the sandbox (defaults to the current one)
    #[clap(long)]
    pub cwd: Option<PathBuf>,

    /// Override the configured backend
    #[clap(long, value_enum)]
    pub backend: Option<BackendType>,

    /// Execution timeout (e.g., "30s", "5m", "1h")
    #[clap(long)]
    pub timeout: Option<String>,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
