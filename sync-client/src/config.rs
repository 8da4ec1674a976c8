//! Engine configuration.
//!
//! Loaded from the `[engine]` table of the CLI config file, or built in code.
//! Every key is optional.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use sync_core::{AssetPolicy, SyncWindow};
use sync_types::{FieldSet, FieldTag, Timestamp};

/// Tuning knobs for [`SyncOrchestrator`](crate::SyncOrchestrator).
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on pages fetched in one run (default: 500).
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Local changes per upload batch when the provider has no preference (default: 50).
    #[serde(default = "default_upload_batch_size")]
    pub upload_batch_size: usize,
    /// Download attempts per asset, across runs, before its reference is dropped (default: 3).
    #[serde(default = "default_max_asset_attempts")]
    pub max_asset_attempts: u32,
    /// Concurrent asset downloads (default: 4).
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    /// How long a run waits for queued downloads before committing (default: 30).
    #[serde(default = "default_asset_drain_timeout_secs")]
    pub asset_drain_timeout_secs: u64,
    /// Only entities updated within this many seconds are fetched. Unset means unbounded.
    #[serde(default)]
    pub sync_window_secs: Option<u64>,
    /// Payload fields that never travel in either direction.
    #[serde(default)]
    pub ignored_fields: Vec<String>,
    /// Token refreshes allowed per run after an auth failure (default: 1).
    #[serde(default = "default_max_auth_restarts")]
    pub max_auth_restarts: u32,
}

fn default_max_pages() -> u32 {
    500
}

fn default_upload_batch_size() -> usize {
    50
}

fn default_max_asset_attempts() -> u32 {
    3
}

fn default_max_concurrent_downloads() -> usize {
    4
}

fn default_asset_drain_timeout_secs() -> u64 {
    30
}

fn default_max_auth_restarts() -> u32 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            upload_batch_size: default_upload_batch_size(),
            max_asset_attempts: default_max_asset_attempts(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            asset_drain_timeout_secs: default_asset_drain_timeout_secs(),
            sync_window_secs: None,
            ignored_fields: Vec::new(),
            max_auth_restarts: default_max_auth_restarts(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file containing only engine keys.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Set the page limit.
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Set the fallback upload batch size.
    pub fn with_upload_batch_size(mut self, size: usize) -> Self {
        self.upload_batch_size = size;
        self
    }

    /// Set the per-asset attempt bound.
    pub fn with_max_asset_attempts(mut self, attempts: u32) -> Self {
        self.max_asset_attempts = attempts;
        self
    }

    /// Set the download concurrency.
    pub fn with_max_concurrent_downloads(mut self, n: usize) -> Self {
        self.max_concurrent_downloads = n;
        self
    }

    /// Set the asset drain timeout.
    pub fn with_asset_drain_timeout(mut self, timeout: Duration) -> Self {
        self.asset_drain_timeout_secs = timeout.as_secs();
        self
    }

    /// Restrict fetches to a trailing window.
    pub fn with_sync_window(mut self, secs: u64) -> Self {
        self.sync_window_secs = Some(secs);
        self
    }

    /// Add an ignored field.
    pub fn with_ignored_field(mut self, field: &str) -> Self {
        self.ignored_fields.push(field.to_string());
        self
    }

    /// Set the auth restart budget.
    pub fn with_max_auth_restarts(mut self, n: u32) -> Self {
        self.max_auth_restarts = n;
        self
    }

    /// Ignored fields as a set.
    pub fn ignored_field_set(&self) -> FieldSet {
        self.ignored_fields.iter().map(|f| FieldTag::from(f.as_str())).collect()
    }

    /// Asset retry policy.
    pub fn asset_policy(&self) -> AssetPolicy {
        AssetPolicy {
            max_attempts: self.max_asset_attempts.max(1),
        }
    }

    /// Drain timeout as a [`Duration`].
    pub fn asset_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.asset_drain_timeout_secs)
    }

    /// Fetch window ending at `now`.
    pub fn sync_window(&self, now: Timestamp) -> SyncWindow {
        SyncWindow::trailing(now, self.sync_window_secs)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
