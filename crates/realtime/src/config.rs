//! Client configuration.

use crate::log::{FileOperationLog, LogResult, MemoryOperationLog, OperationLog};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors in a client configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// Offline availability settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OfflineConfig {
    /// Whether models may be subscribed for offline use
    pub enabled: bool,
    /// Directory of the file log. `None` keeps offline data in memory.
    pub storage_path: Option<PathBuf>,
}

/// Reconnect behaviour.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResyncConfig {
    /// Keep models open on the server after a reconnect resync
    pub reopen_after_resync: bool,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            reopen_after_resync: true,
        }
    }
}

/// Client configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub offline: OfflineConfig,
    pub resync: ResyncConfig,
}

impl ClientConfig {
    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Enable offline support backed by files under `path`.
    pub fn with_offline_storage(mut self, path: impl Into<PathBuf>) -> Self {
        self.offline.enabled = true;
        self.offline.storage_path = Some(path.into());
        self
    }

    /// Enable offline support backed by memory.
    pub fn with_offline_in_memory(mut self) -> Self {
        self.offline.enabled = true;
        self.offline.storage_path = None;
        self
    }

    pub fn with_reopen_after_resync(mut self, reopen: bool) -> Self {
        self.resync.reopen_after_resync = reopen;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.offline.storage_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "offline storage path must not be empty".to_string(),
                ));
            }
            if !self.offline.enabled {
                return Err(ConfigError::Invalid(
                    "offline storage path set but offline support is disabled".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Create the operation log this configuration asks for, if any.
    pub fn open_log(&self) -> LogResult<Option<Arc<dyn OperationLog>>> {
        if !self.offline.enabled {
            return Ok(None);
        }
        let log: Arc<dyn OperationLog> = match &self.offline.storage_path {
            Some(path) => Arc::new(FileOperationLog::new(path)?),
            None => Arc::new(MemoryOperationLog::new()),
        };
        Ok(Some(log))
    }
}
