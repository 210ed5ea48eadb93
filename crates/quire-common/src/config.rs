//! Configuration types for Quire
//!
//! Every section deserializes with defaults so a partial file (or none at
//! all) yields a working configuration.

use crate::types::KeyRange;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for Quire
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuireConfig {
    /// Local storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Remote change feed configuration
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the redb database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Entries pulled per read chunk while iterating
    #[serde(default = "default_scan_chunk")]
    pub scan_chunk: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            scan_chunk: default_scan_chunk(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./quire-data/quire.redb")
}

fn default_scan_chunk() -> usize {
    256
}

/// How a store with no cursor is first populated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialSync {
    /// One full-range read of the remote, then incremental catch-up
    #[default]
    Full,
    /// Replay the change feed from its beginning
    Changes,
}

/// Remote change feed configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Database URL (e.g., "http://localhost:5984/quire")
    #[serde(default)]
    pub url: Option<String>,
    /// Changes requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Ids belonging to the synced entity
    #[serde(default)]
    pub key_range: KeyRange,
    /// Strategy used when no cursor is stored
    #[serde(default)]
    pub initial: InitialSync,
    /// Stop after this many pages in one run (unbounded when absent)
    #[serde(default)]
    pub max_pages: Option<usize>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            page_size: default_page_size(),
            timeout_ms: default_timeout_ms(),
            key_range: KeyRange::default(),
            initial: InitialSync::default(),
            max_pages: None,
        }
    }
}

fn default_page_size() -> usize {
    150
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
