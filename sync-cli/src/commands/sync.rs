//! Run one sync for an account.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use sync_client::{
    AbortSignal, CachedTokenProvider, HttpAssetFetcher, JsonFeedProvider, ReqwestTransport,
    StaticTokenProvider, SyncOrchestrator, SyncReport, Transport, DEFAULT_REQUEST_TIMEOUT,
};
use sync_types::AccountId;
use tokio::sync::mpsc;

use super::open_store;
use crate::config::CliConfig;

const USER_AGENT: &str = concat!("socialsync/", env!("CARGO_PKG_VERSION"));

/// Run the sync command.
pub async fn run(data_dir: &Path, account: &str, token: Option<String>) -> Result<()> {
    let config = CliConfig::load(data_dir).await?;
    let token = match token {
        Some(token) => token,
        None => std::env::var(&config.auth.token_env).with_context(|| {
            format!(
                "No access token. Pass --token or set {}.",
                config.auth.token_env
            )
        })?,
    };

    let transport = ReqwestTransport::new(USER_AGENT, DEFAULT_REQUEST_TIMEOUT)
        .context("Failed to build HTTP client")?;
    let report = run_with(data_dir, &config, account, &token, Arc::new(transport)).await?;
    print_report(&report);
    Ok(())
}

/// Sync `account` over the given transport.
pub async fn run_with(
    data_dir: &Path,
    config: &CliConfig,
    account: &str,
    token: &str,
    transport: Arc<dyn Transport>,
) -> Result<SyncReport> {
    let store = open_store(data_dir, config).await?;
    let auth = CachedTokenProvider::new(Arc::new(
        StaticTokenProvider::new().with_token(account, token),
    ));
    let fetcher = HttpAssetFetcher::new(transport.clone(), config.storage.assets_dir(data_dir));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = SyncOrchestrator::new(
        config.engine.clone(),
        Arc::new(auth),
        transport,
        Arc::new(store.clone()),
        Arc::new(store),
        Arc::new(fetcher),
    )
    .with_events(tx);
    let provider = JsonFeedProvider::new(config.provider.clone());

    let abort = AbortSignal::new();
    let interrupt = {
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, aborting run");
                abort.abort();
            }
        })
    };
    let events = tokio::spawn(async move {
        while let Some(scoped) = rx.recv().await {
            tracing::debug!(scope = %scoped.scope, event = ?scoped.event, "sync event");
        }
    });

    let result = orchestrator
        .sync(&AccountId::new(account), &provider, &abort)
        .await;

    interrupt.abort();
    // Closes the event channel
    drop(orchestrator);
    let _ = events.await;

    result.with_context(|| format!("Sync failed for account {}", account))
}

fn print_report(report: &SyncReport) {
    println!("Synced {} in {:.1?}", report.scope, report.duration);
    println!();
    println!("Remote:");
    println!("  Added:    {}", report.remote_added);
    println!("  Modified: {}", report.remote_modified);
    println!("  Removed:  {}", report.remote_removed);
    println!("  Pages:    {}", report.pages);
    if report.window_truncated {
        println!("  (stopped at the sync window)");
    }
    if report.page_limited {
        println!("  (stopped at max_pages; removals wait for a complete fetch)");
    }
    println!();
    println!("Local:");
    println!("  Applied:  {}", report.applied);
    println!("  Skipped:  {}", report.skipped);
    println!("  Deleted:  {}", report.removed_local);
    println!("  Uploaded: {}", report.uploaded);
    println!();
    println!("Assets:");
    println!("  Downloaded: {}", report.assets.downloaded);
    println!("  Failed:     {}", report.assets.failed);
    println!("  Attached:   {}", report.assets_attached);
    println!("  Retired:    {}", report.assets_retired);
    if report.assets.timed_out {
        println!("  (drain timed out; remaining downloads resume next run)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_client::{CheckpointStore, MockTransport};
    use sync_types::{CollectionType, ExternalId, SyncScope};
    use tempfile::tempdir;

    fn config() -> CliConfig {
        CliConfig::parse(&CliConfig::template(
            CollectionType::Contacts,
            "https://api/contacts",
            false,
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn sync_persists_checkpoint_and_rows() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        transport.queue_json(json!({"items": [
            {"id": "p1", "etag": "e1", "fields": {"name": "Ada"}},
            {"id": "p2", "etag": "e1", "fields": {"name": "Grace"}}
        ]}));

        let report = run_with(dir.path(), &config(), "42", "tok", Arc::new(transport.clone()))
            .await
            .unwrap();
        assert_eq!(report.remote_added, 2);
        assert_eq!(
            transport.last_sent().unwrap().header("authorization"),
            Some("Bearer tok")
        );

        let store = open_store(dir.path(), &config()).await.unwrap();
        let scope = SyncScope::new("42", CollectionType::Contacts);
        let checkpoint = store.load(&scope).await.unwrap().unwrap();
        assert!(checkpoint.id_map.contains_key(&ExternalId::new("p1")));
        assert_eq!(store.count(&scope).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sync_failure_is_reported() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new();
        transport.fail_next_request("connection reset");

        let err = run_with(dir.path(), &config(), "42", "tok", Arc::new(transport))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Sync failed for account 42"));
    }

    #[tokio::test]
    async fn missing_token_is_explained() {
        let dir = tempdir().unwrap();
        let text = CliConfig::template(CollectionType::Contacts, "https://api/contacts", false)
            .replace("SOCIALSYNC_TOKEN", "SOCIALSYNC_TEST_TOKEN_UNSET");
        tokio::fs::write(dir.path().join(crate::config::CONFIG_FILE), text)
            .await
            .unwrap();

        let err = run(dir.path(), "42", None).await.unwrap_err();
        assert!(err.to_string().contains("SOCIALSYNC_TEST_TOKEN_UNSET"));
    }
}
