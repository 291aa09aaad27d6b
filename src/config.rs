//! Client configuration management

use crate::error::{LabError, LabResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for talking to a lab server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server base URL, without the `/api/app/lab` path
    pub base_url: String,

    /// Module used when none is given on the command line
    pub default_module: String,

    /// Bound on establishing the TCP connection, in seconds.
    /// Streams themselves are never timed out.
    pub connect_timeout_secs: u64,

    /// Verbose logging
    pub debug: bool,

    /// Arguments passed to streamed module runs
    pub args: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            default_module: "foo".to_string(),
            connect_timeout_secs: 10,
            debug: false,
            args: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<config dir>/lab-client/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("lab-client").join("config.toml"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Load configuration from file; a missing file yields defaults
    pub async fn load_from_file(path: &Path) -> LabResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LabError::config_error(format!("Failed to read config: {}", e)))?;

        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> LabResult<Self> {
        toml::from_str(content)
            .map_err(|e| LabError::config_error(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> LabResult<()> {
        self.validate()?;

        let content = toml::to_string_pretty(self)
            .map_err(|e| LabError::config_error(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                LabError::config_error(format!("Failed to create config directory: {}", e))
            })?;
        }

        tokio::fs::write(path, content)
            .await
            .map_err(|e| LabError::config_error(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Validate configuration settings
    pub fn validate(&self) -> LabResult<()> {
        let url = url::Url::parse(&self.base_url)
            .map_err(|e| LabError::config_error(format!("Invalid base URL {}: {}", self.base_url, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(LabError::config_error(format!(
                "Base URL must be http or https, got {}",
                url.scheme()
            )));
        }

        if self.default_module.trim().is_empty() {
            return Err(LabError::config_error("Default module cannot be empty"));
        }

        if self.connect_timeout_secs == 0 {
            return Err(LabError::config_error("Connect timeout must be greater than 0"));
        }

        Ok(())
    }
}
