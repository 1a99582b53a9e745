//! Application configuration.

use crate::error::{AppError, AppResult};
use livedash_buffer::BufferConfig;
use livedash_sync::SyncConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Config file used when neither `--config` nor `LIVEDASH_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "LIVEDASH_CONFIG";

/// Dashboard client runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Batching tick for buffer ingestion and change notification (ms).
    /// Default: 16.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Capacity for widgets whose buffer settings request 0. Default: 100.
    #[serde(default = "default_max_count")]
    pub default_max_count: usize,
    /// How often aged-out buffer entries are evicted (ms). Default: 1,000.
    #[serde(default = "default_expiry_interval_ms")]
    pub expiry_interval_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    16
}

fn default_max_count() -> usize {
    100
}

fn default_expiry_interval_ms() -> u64 {
    1_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            default_max_count: default_max_count(),
            expiry_interval_ms: default_expiry_interval_ms(),
        }
    }
}

impl ClientConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_interval_ms.max(1))
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl AppConfig {
    /// Load from a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or return defaults when the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Config path: explicit argument > `LIVEDASH_CONFIG` > default path.
    pub fn resolve_path(explicit: Option<String>) -> String {
        explicit
            .or_else(|| std::env::var(CONFIG_ENV_VAR).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    pub fn validate(&self) -> AppResult<()> {
        self.buffer
            .validate()
            .map_err(|e| AppError::Config(e.to_string()))?;
        if self.sync.max_dashboards == 0 {
            return Err(AppError::Config(
                "sync.max_dashboards must be positive".to_string(),
            ));
        }
        if self.client.default_max_count == 0 {
            return Err(AppError::Config(
                "client.default_max_count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
