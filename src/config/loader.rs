use std::path::{Path, PathBuf};

use crate::config::types::ToolscriptConfig;
use crate::error::{Result, ToolscriptError};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "toolscript", "toolscript") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        dirs_fallback().join(".toolscript").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values.
///
/// An explicitly requested file must exist; the default location may be absent.
pub fn load_config(config_path: Option<&Path>) -> Result<ToolscriptConfig> {
    let path = match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(ToolscriptError::ConfigNotFound {
                    path: path.display().to_string(),
                });
            }
            path.to_path_buf()
        }
        None => get_config_path(),
    };

    if !path.exists() {
        return Ok(ToolscriptConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<ToolscriptConfig> {
    let config: ToolscriptConfig =
        toml::from_str(content).map_err(|e| ToolscriptError::TomlParse(e.to_string()))?;

    for (i, tool) in config.tools.iter().enumerate() {
        if tool.name.is_empty() {
            return Err(ToolscriptError::Config(format!("tools[{i}] has no name")));
        }
        if tool.command.is_empty() {
            return Err(ToolscriptError::Config(format!(
                "tool '{}' has an empty command",
                tool.name
            )));
        }
        if config.tools[..i].iter().any(|t| t.name == tool.name) {
            return Err(ToolscriptError::Config(format!(
                "tool '{}' is defined twice",
                tool.name
            )));
        }
    }

    Ok(config)
}
