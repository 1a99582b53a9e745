//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory for local dashboards. Default: "data/dashboards".
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// KV bucket holding shared dashboards. Default: "dashboards".
    #[serde(default = "default_shared_bucket")]
    pub shared_bucket: String,
    /// Key prefix for shared dashboards. Default: "dash".
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Maximum number of local dashboards. Default: 50.
    #[serde(default = "default_max_dashboards")]
    pub max_dashboards: usize,
    /// Byte quota for local storage; unlimited when absent.
    #[serde(default)]
    pub local_quota_bytes: Option<u64>,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("data/dashboards")
}

fn default_shared_bucket() -> String {
    "dashboards".to_string()
}

fn default_key_prefix() -> String {
    "dash".to_string()
}

fn default_max_dashboards() -> usize {
    50
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            shared_bucket: default_shared_bucket(),
            key_prefix: default_key_prefix(),
            max_dashboards: default_max_dashboards(),
            local_quota_bytes: None,
        }
    }
}
