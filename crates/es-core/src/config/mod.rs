//! Configuration management for the EasyShell agent

mod agent;
pub mod serde_utils;

pub use agent::AgentConfig;

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("easyshell")
}

/// Get the default agent configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("agent.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}
