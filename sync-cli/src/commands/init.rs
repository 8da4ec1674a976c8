//! Write a starter config file.

use anyhow::{Context, Result};
use std::path::Path;
use sync_types::CollectionType;

use crate::config::{set_dir_permissions_0700, CliConfig, CONFIG_FILE};

/// Run the init command.
pub async fn run(
    data_dir: &Path,
    collection: CollectionType,
    endpoint: &str,
    writable: bool,
) -> Result<()> {
    // Check if already initialized
    if CliConfig::exists(data_dir).await {
        anyhow::bail!(
            "Already configured. Edit or delete {} to start over.",
            data_dir.join(CONFIG_FILE).display()
        );
    }

    let path = data_dir.join(CONFIG_FILE);
    tokio::fs::write(&path, CliConfig::template(collection, endpoint, writable))
        .await
        .context("Failed to write config file")?;
    set_dir_permissions_0700(data_dir).await?;

    println!("Config written to {}", path.display());
    println!();
    println!("  Collection: {}", collection);
    println!("  Endpoint:   {}", endpoint);
    println!("  Uploads:    {}", if writable { "enabled" } else { "disabled" });
    println!();
    println!("Next steps:");
    println!("  1. export SOCIALSYNC_TOKEN=<access token>");
    println!("  2. socialsync sync --account <id>");

    Ok(())
}
