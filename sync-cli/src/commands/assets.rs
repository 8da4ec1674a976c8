//! List outstanding asset downloads.

use anyhow::Result;
use std::path::Path;
use sync_client::CheckpointStore;
use sync_types::CollectionType;

use super::{open_store, scope_for};
use crate::config::CliConfig;

/// Run the assets command.
pub async fn run(data_dir: &Path, account: &str, collection: Option<CollectionType>) -> Result<()> {
    let config = CliConfig::load(data_dir).await?;
    let scope = scope_for(&config, account, collection);
    let store = open_store(data_dir, &config).await?;

    let pending = match store.load(&scope).await? {
        Some(checkpoint) => checkpoint.pending_assets,
        None => Default::default(),
    };

    if pending.is_empty() {
        println!("No pending assets for {}", scope);
        return Ok(());
    }

    println!("Pending assets for {} ({}):", scope, pending.len());
    for (id, asset) in &pending {
        println!(
            "  {}  attempts {}/{}  {}",
            id, asset.attempts, config.engine.max_asset_attempts, asset.url
        );
    }
    Ok(())
}
