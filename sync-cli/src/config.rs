//! Configuration file for the `socialsync` binary.
//!
//! One TOML file per data directory:
//!
//! ```toml
//! [provider]
//! collection = "contacts"
//! endpoint = "https://api.example.com/v1/contacts"
//!
//! [engine]
//! max_concurrent_downloads = 4
//!
//! [storage]
//! database = "socialsync.db"
//! assets = "assets"
//!
//! [auth]
//! token_env = "SOCIALSYNC_TOKEN"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use sync_client::{EngineConfig, FeedSettings};
use sync_types::CollectionType;

/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "socialsync.toml";

/// Full application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Remote feed.
    pub provider: FeedSettings,
    /// Where data lives.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Where the access token comes from.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// `[storage]` table. Relative paths resolve against the data directory.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Directory for downloaded assets.
    #[serde(default = "default_assets")]
    pub assets: PathBuf,
}

fn default_database() -> PathBuf {
    PathBuf::from("socialsync.db")
}

fn default_assets() -> PathBuf {
    PathBuf::from("assets")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            assets: default_assets(),
        }
    }
}

impl StorageConfig {
    /// Database path under `data_dir`.
    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.database)
    }

    /// Asset directory under `data_dir`.
    pub fn assets_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.assets)
    }
}

/// `[auth]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Environment variable holding the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_token_env() -> String {
    "SOCIALSYNC_TOKEN".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
        }
    }
}

impl CliConfig {
    /// Load the config file from a data directory.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .context("Not configured. Run 'socialsync init' first.")?;
        Self::parse(&contents).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse config text.
    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Check if a config file exists.
    pub async fn exists(data_dir: &Path) -> bool {
        data_dir.join(CONFIG_FILE).exists()
    }

    /// Starter config for one feed.
    pub fn template(collection: CollectionType, endpoint: &str, writable: bool) -> String {
        format!(
            r#"[provider]
collection = "{collection}"
endpoint = "{endpoint}"
writable = {writable}
incremental = false
page_size = 100

[engine]
max_pages = 500
max_concurrent_downloads = 4
asset_drain_timeout_secs = 30
ignored_fields = []

[storage]
database = "socialsync.db"
assets = "assets"

[auth]
token_env = "SOCIALSYNC_TOKEN"
"#
        )
    }
}

/// Set directory permissions to 0700 (owner only) on Unix.
/// No-op on non-Unix platforms.
pub async fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to set directory permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
