//! CLI command implementations.

pub mod assets;
pub mod init;
pub mod purge;
pub mod status;
pub mod sync;

use anyhow::{Context, Result};
use std::path::Path;
use sync_store::SqliteStore;
use sync_types::{CollectionType, SyncScope};

use crate::config::CliConfig;

/// Open the configured database, creating it on first use.
pub async fn open_store(data_dir: &Path, config: &CliConfig) -> Result<SqliteStore> {
    let path = config.storage.database_path(data_dir);
    SqliteStore::new(&path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))
}

/// Scope for `account`, defaulting to the configured collection.
pub fn scope_for(
    config: &CliConfig,
    account: &str,
    collection: Option<CollectionType>,
) -> SyncScope {
    SyncScope::new(account, collection.unwrap_or(config.provider.collection))
}
