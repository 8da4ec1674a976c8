//! Drop a checkpoint so the next run resyncs from scratch.

use anyhow::Result;
use std::path::Path;
use sync_client::CheckpointStore;
use sync_types::CollectionType;

use super::{open_store, scope_for};
use crate::config::CliConfig;

/// Run the purge command.
pub async fn run(data_dir: &Path, account: &str, collection: Option<CollectionType>) -> Result<()> {
    let config = CliConfig::load(data_dir).await?;
    let scope = scope_for(&config, account, collection);
    let store = open_store(data_dir, &config).await?;

    // An unreadable checkpoint still counts as one
    let exists = store.load(&scope).await.map_or(true, |c| c.is_some());
    if !exists {
        println!("No checkpoint for {}", scope);
        return Ok(());
    }

    store.purge(&scope).await?;
    println!("Purged checkpoint for {}", scope);
    println!("The next sync re-fetches everything and adopts existing rows.");
    Ok(())
}
