//! Asset side channel.
//!
//! Entities may reference a binary asset (avatar, photo). Downloads are
//! queued while the remote delta is applied and drained afterwards with
//! bounded concurrency. Each entity's progress is an
//! [`AssetState`] machine; its pending row is written through the
//! [`CheckpointStore`] as soon as a download starts, so an interrupted run
//! resumes the retry count instead of starting over.
//!
//! Nothing in here fails a sync run. Download and persistence errors are
//! logged and retried on a later run, up to the attempt bound.

use crate::auth::AccessToken;
use crate::store::CheckpointStore;
use crate::transport::{HttpRequest, Transport};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sync_core::{AssetAction, AssetEvent, AssetPolicy, AssetState};
use sync_types::{DownloadError, ExternalId, PendingAsset, SyncScope};
use tracing::{debug, warn};

/// Downloads one asset to local storage.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Fetch `url` and return the local path it was written to.
    async fn download(&self, url: &str, token: &AccessToken) -> Result<String, DownloadError>;
}

/// Fetcher writing assets under a directory, named by the SHA-256 of the URL.
pub struct HttpAssetFetcher {
    transport: Arc<dyn Transport>,
    dir: PathBuf,
}

impl HttpAssetFetcher {
    /// Fetcher writing into `dir` (created on first download).
    pub fn new(transport: Arc<dyn Transport>, dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            dir: dir.into(),
        }
    }

    /// Where the asset for `url` is stored.
    pub fn path_for(&self, url: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(url.as_bytes()));
        match extension(url) {
            Some(ext) => self.dir.join(format!("{}.{}", name, ext)),
            None => self.dir.join(name),
        }
    }
}

/// Short alphanumeric extension of the URL's last path segment.
fn extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    let valid = (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(ext)
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn download(&self, url: &str, token: &AccessToken) -> Result<String, DownloadError> {
        let response = self
            .transport
            .request(HttpRequest::get(url).bearer(token.as_str()))
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        if !(200..300).contains(&response.status) {
            return Err(DownloadError::Status(response.status));
        }

        let path = self.path_for(url);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DownloadError::Io(e.to_string()))?;
        tokio::fs::write(&path, &response.body)
            .await
            .map_err(|e| DownloadError::Io(e.to_string()))?;
        debug!("Stored {} bytes from {} at {}", response.body.len(), url, path.display());
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Outcome of one [`AssetReconciler::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetReport {
    /// Downloads started.
    pub scheduled: usize,
    /// Downloads that succeeded.
    pub downloaded: usize,
    /// Downloads that failed.
    pub failed: usize,
    /// The drain timeout expired with downloads still running.
    pub timed_out: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-run asset queue for one (account, collection).
pub struct AssetReconciler {
    scope: SyncScope,
    policy: AssetPolicy,
    max_concurrent: usize,
    states: DashMap<ExternalId, AssetState>,
    queue: Mutex<VecDeque<(ExternalId, String)>>,
    attachments: Mutex<Vec<(ExternalId, String)>>,
    dropped: Mutex<Vec<ExternalId>>,
    checkpoints: Arc<dyn CheckpointStore>,
    fetcher: Arc<dyn AssetFetcher>,
}

impl AssetReconciler {
    /// Empty reconciler.
    pub fn new(
        scope: SyncScope,
        policy: AssetPolicy,
        max_concurrent: usize,
        checkpoints: Arc<dyn CheckpointStore>,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> Self {
        Self {
            scope,
            policy,
            max_concurrent: max_concurrent.max(1),
            states: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            attachments: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
            checkpoints,
            fetcher,
        }
    }

    /// Restore the pending rows left by earlier runs.
    ///
    /// Nothing is queued yet; see [`retry_restored`](Self::retry_restored).
    pub fn resume(&self, pending: &BTreeMap<ExternalId, PendingAsset>) {
        for (id, row) in pending {
            self.states.insert(id.clone(), AssetState::restored(row));
        }
    }

    /// Queue retries for restored assets this run has not touched since.
    ///
    /// Returns how many were retried or retired.
    pub async fn retry_restored(&self) -> usize {
        let stale: Vec<(ExternalId, String)> = self
            .states
            .iter()
            .filter_map(|entry| match entry.value() {
                AssetState::Failed { url, .. } => Some((entry.key().clone(), url.clone())),
                _ => None,
            })
            .collect();
        for (id, url) in &stale {
            self.enqueue(id, url).await;
        }
        stale.len()
    }

    /// Note that entity `id` references `url`.
    ///
    /// Returns true when this started a new download.
    pub async fn enqueue(&self, id: &ExternalId, url: &str) -> bool {
        let actions = self.transition(id, AssetEvent::Enqueue { url: url.to_string() });
        let started = actions
            .iter()
            .any(|a| matches!(a, AssetAction::StartDownload { .. }));
        self.execute(id, actions).await;
        started
    }

    /// The entity was removed; forget its asset.
    pub async fn clear(&self, id: &ExternalId) {
        let actions = self.transition(id, AssetEvent::Cleared);
        self.execute(id, actions).await;
    }

    /// The entity was saved with its downloaded path.
    pub async fn mark_attached(&self, id: &ExternalId) {
        let actions = self.transition(id, AssetEvent::Attached);
        self.execute(id, actions).await;
    }

    /// Current state for `id`.
    pub fn state(&self, id: &ExternalId) -> Option<AssetState> {
        self.states.get(id).map(|s| s.value().clone())
    }

    /// Downloads waiting for [`drain`](Self::drain).
    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Downloaded paths waiting to be saved onto their entities.
    pub fn take_attachments(&self) -> Vec<(ExternalId, String)> {
        std::mem::take(&mut *lock(&self.attachments))
    }

    /// Entities whose asset reference should be dropped.
    pub fn take_dropped(&self) -> Vec<ExternalId> {
        std::mem::take(&mut *lock(&self.dropped))
    }

    /// Run queued downloads, at most `max_concurrent` at a time, in queue
    /// order, for up to `timeout`.
    ///
    /// Downloads still running at the timeout are abandoned; their pending
    /// rows stay behind and the next run retries them.
    pub async fn drain(&self, token: &AccessToken, timeout: Duration) -> AssetReport {
        let jobs: Vec<(ExternalId, String)> = lock(&self.queue).drain(..).collect();
        let mut report = AssetReport {
            scheduled: jobs.len(),
            ..AssetReport::default()
        };
        if jobs.is_empty() {
            return report;
        }

        let fetcher = &self.fetcher;
        let mut results = stream::iter(jobs)
            .map(|(id, url)| async move {
                let result = fetcher.download(&url, token).await;
                (id, url, result)
            })
            .buffer_unordered(self.max_concurrent);

        let processing = async {
            while let Some((id, url, result)) = results.next().await {
                let event = match result {
                    Ok(path) => {
                        report.downloaded += 1;
                        AssetEvent::DownloadSucceeded { url, path }
                    }
                    Err(e) => {
                        warn!("{}: asset for {} failed: {}", self.scope, id, e);
                        report.failed += 1;
                        AssetEvent::DownloadFailed {
                            url,
                            error: e.to_string(),
                        }
                    }
                };
                let actions = self.transition(&id, event);
                self.execute(&id, actions).await;
            }
        };

        if tokio::time::timeout(timeout, processing).await.is_err() {
            warn!(
                "{}: asset drain timed out after {:?}, remaining downloads retry next run",
                self.scope, timeout
            );
            report.timed_out = true;
        }
        report
    }

    fn transition(&self, id: &ExternalId, event: AssetEvent) -> Vec<AssetAction> {
        let mut entry = self.states.entry(id.clone()).or_default();
        let state = std::mem::take(entry.value_mut());
        let (next, actions) = state.on_event(event, &self.policy);
        *entry.value_mut() = next;
        actions
    }

    async fn execute(&self, id: &ExternalId, actions: Vec<AssetAction>) {
        for action in actions {
            match action {
                AssetAction::StartDownload { url } => {
                    lock(&self.queue).push_back((id.clone(), url));
                }
                AssetAction::PersistPending { url, attempts } => {
                    let row = PendingAsset { url, attempts };
                    let persisted = self
                        .checkpoints
                        .upsert_pending_asset(&self.scope, id, &row)
                        .await;
                    if let Err(e) = persisted {
                        warn!("{}: could not persist pending asset for {}: {}", self.scope, id, e);
                    }
                }
                AssetAction::ClearPending => {
                    if let Err(e) = self.checkpoints.remove_pending_asset(&self.scope, id).await {
                        warn!("{}: could not clear pending asset for {}: {}", self.scope, id, e);
                    }
                }
                AssetAction::ScheduleAttach { path } => {
                    lock(&self.attachments).push((id.clone(), path));
                }
                AssetAction::DropReference => {
                    warn!("{}: giving up on asset for {}", self.scope, id);
                    lock(&self.dropped).push(id.clone());
                }
            }
        }
    }
}
