//! # socialsync
//!
//! Command-line runner for a socialsync feed.
//!
//! ## Commands
//!
//! - `init`: Write a starter config for one feed
//! - `sync`: Run one sync for an account
//! - `status`: Show stored checkpoints
//! - `assets`: List outstanding asset downloads
//! - `purge`: Drop a checkpoint to force a full resync
//!
//! ## Example
//!
//! ```bash
//! socialsync init --collection contacts --endpoint https://api.example.com/v1/contacts
//!
//! export SOCIALSYNC_TOKEN=...
//! socialsync sync --account 42
//!
//! socialsync status
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use sync_types::CollectionType;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{assets, init, purge, status, sync};

/// Command-line runner for socialsync feeds.
#[derive(Parser, Debug)]
#[command(name = "socialsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for config, database and downloaded assets
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter config file
    Init {
        /// Remote collection URL
        #[arg(long)]
        endpoint: String,

        /// Collection served by the endpoint
        #[arg(long, short, default_value = "contacts")]
        collection: CollectionType,

        /// Upload local changes back to the endpoint
        #[arg(long)]
        writable: bool,
    },

    /// Run one sync for an account
    Sync {
        /// Remote account id
        #[arg(long, short)]
        account: String,

        /// Access token (defaults to the configured environment variable)
        #[arg(long)]
        token: Option<String>,
    },

    /// Show stored checkpoints
    Status,

    /// List outstanding asset downloads
    Assets {
        /// Remote account id
        #[arg(long, short)]
        account: String,

        /// Collection (defaults to the configured one)
        #[arg(long, short)]
        collection: Option<CollectionType>,
    },

    /// Drop a checkpoint so the next sync starts over
    Purge {
        /// Remote account id
        #[arg(long, short)]
        account: String,

        /// Collection (defaults to the configured one)
        #[arg(long, short)]
        collection: Option<CollectionType>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Determine data directory
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    // Ensure data directory exists
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;

    match cli.command {
        Commands::Init {
            endpoint,
            collection,
            writable,
        } => {
            init::run(&data_dir, collection, &endpoint, writable).await?;
        }
        Commands::Sync { account, token } => {
            sync::run(&data_dir, &account, token).await?;
        }
        Commands::Status => {
            status::run(&data_dir).await?;
        }
        Commands::Assets {
            account,
            collection,
        } => {
            assets::run(&data_dir, &account, collection).await?;
        }
        Commands::Purge {
            account,
            collection,
        } => {
            purge::run(&data_dir, &account, collection).await?;
        }
    }

    Ok(())
}

/// Get the default data directory for socialsync.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "ydun", "socialsync")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
