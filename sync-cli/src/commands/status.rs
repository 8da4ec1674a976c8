//! Show stored checkpoints.

use anyhow::Result;
use std::path::Path;

use super::open_store;
use crate::config::CliConfig;

/// Run the status command.
pub async fn run(data_dir: &Path) -> Result<()> {
    println!("=== socialsync status ===");
    println!();

    let config = match CliConfig::load(data_dir).await {
        Ok(config) => config,
        Err(_) => {
            println!("Config: NOT INITIALIZED");
            println!();
            println!("Run 'socialsync init --endpoint <url>' to get started.");
            return Ok(());
        }
    };

    println!("Feed:");
    println!("  Name:       {}", config.provider.name);
    println!("  Collection: {}", config.provider.collection);
    println!("  Endpoint:   {}", config.provider.endpoint);
    println!(
        "  Mode:       {}",
        if config.provider.incremental {
            "incremental"
        } else {
            "full"
        }
    );
    println!();

    let store = open_store(data_dir, &config).await?;
    let summaries = store.checkpoint_summaries().await?;
    if summaries.is_empty() {
        println!("Checkpoints: none yet");
        println!();
        println!("Run 'socialsync sync --account <id>' to start syncing.");
        return Ok(());
    }

    println!("Checkpoints:");
    for summary in summaries {
        let tracked = match summary.tracked {
            Some(n) => n.to_string(),
            None => "unreadable (next run resyncs)".to_string(),
        };
        println!("  {}", summary.scope);
        println!("    Tracked:        {}", tracked);
        println!("    Pending assets: {}", summary.pending_assets);
        println!("    Last commit:    {}", format_timestamp(summary.updated_at));
    }

    Ok(())
}

/// Format a Unix timestamp as a human-readable string.
fn format_timestamp(ts: i64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let diff = now.saturating_sub(ts).max(0);

    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{} minutes ago", diff / 60)
    } else if diff < 86400 {
        format!("{} hours ago", diff / 3600)
    } else {
        format!("{} days ago", diff / 86400)
    }
}
