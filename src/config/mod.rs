//! Configuration management for Strata

pub mod schema;

pub use schema::{CacheConfig, Config, PoolConfig, PoolsConfig};

use crate::error::{StrataError, StrataResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata")
    }

    /// Get the audit log path
    pub fn audit_log_path() -> PathBuf {
        Self::state_dir().join("audit.log")
    }

    /// Get the default directory of the node-local disk tier
    pub fn default_tier_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata")
            .join("tier")
    }

    /// Disk tier directory from config, or the default
    pub fn tier_dir(config: &Config) -> PathBuf {
        config
            .cache
            .disk_dir
            .clone()
            .unwrap_or_else(Self::default_tier_dir)
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> StrataResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load and validate configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> StrataResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| StrataError::io(format!("reading config from {}", path.display()), e))?;

        let config: Config = toml::from_str(&content).map_err(|e| StrataError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> StrataResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            StrataError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> StrataResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StrataError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure the state directory exists
    pub async fn ensure_state_dirs() -> StrataResult<()> {
        let dir = Self::state_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StrataError::io(format!("creating directory {}", dir.display()), e))
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
