//! Configuration Storage
//!
//! Reads the optional JSON configuration file named by `RELAY_CONFIG`.

use std::path::Path;
use tokio::fs;

use super::RelayConfig;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Key error: {0}")]
    Key(String),
}

/// Load a configuration file. Missing fields take their defaults.
pub async fn load_config_file(path: &Path) -> Result<RelayConfig, ConfigError> {
    let content = fs::read_to_string(path).await?;
    let config: RelayConfig = serde_json::from_str(&content)?;
    Ok(config)
}
