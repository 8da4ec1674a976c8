//! SyncOrchestrator - one sync run per (account, collection).
//!
//! # Architecture
//!
//! The orchestrator drives the pure phase machine from sync-core and performs
//! the I/O its actions call for:
//!
//! ```text
//! authenticate → fetch pages → remote delta → apply locally
//!      → local delta → upload batches → drain assets → commit checkpoint
//! ```
//!
//! The new checkpoint is built in memory and only written when the machine
//! emits [`PhaseAction::CommitCheckpoint`]. Any run-level error discards it,
//! so the last committed checkpoint stays authoritative. Entity-level
//! failures (a rejected save, an asset that will not download) are logged,
//! counted and skipped.

use crate::abort::AbortSignal;
use crate::assets::{AssetFetcher, AssetReconciler, AssetReport};
use crate::auth::AuthProvider;
use crate::config::EngineConfig;
use crate::pager::{FetchOutcome, RemotePager};
use crate::provider::{Provider, RequestContext, UploadAck};
use crate::store::{CheckpointStore, LocalStore};
use crate::transport::Transport;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use sync_core::{
    DeltaEngine, FetchMode, PhaseAction, PhaseEvent, RunEchoes, SyncEvent, SyncPhase, UploadBatch,
    UploadOp, UploadQueue,
};
use sync_types::{
    AccountId, DeltaSet, Entity, ExternalId, FieldSet, LocalId, RemoteMarker, StoreError,
    SyncCheckpoint, SyncError, SyncScope, Timestamp, VersionTag,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A [`SyncEvent`] tagged with the pair it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedEvent {
    /// Account and collection of the run.
    pub scope: SyncScope,
    /// What happened.
    pub event: SyncEvent,
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// Account and collection synced.
    pub scope: SyncScope,
    /// Remote adds in the delta.
    pub remote_added: usize,
    /// Remote modifications in the delta.
    pub remote_modified: usize,
    /// Remote removals in the delta.
    pub remote_removed: usize,
    /// Remote adds and modifications saved locally.
    pub applied: usize,
    /// Records skipped: unreadable on the wire or rejected by the local store.
    pub skipped: usize,
    /// Local entities deleted.
    pub removed_local: usize,
    /// Local changes acknowledged by the remote.
    pub uploaded: usize,
    /// Pages fetched in the final fetch attempt.
    pub pages: u32,
    /// The sync window cut the fetch short.
    pub window_truncated: bool,
    /// The page limit cut the fetch short; no removals were inferred.
    pub page_limited: bool,
    /// Fetch restarts after an expired token.
    pub auth_restarts: u32,
    /// Asset drain outcome.
    pub assets: AssetReport,
    /// Entities saved with a downloaded asset path.
    pub assets_attached: usize,
    /// Entities whose asset reference was dropped.
    pub assets_retired: usize,
    /// Wall time of the run.
    pub duration: Duration,
}

impl SyncReport {
    fn new(scope: SyncScope) -> Self {
        Self {
            scope,
            remote_added: 0,
            remote_modified: 0,
            remote_removed: 0,
            applied: 0,
            skipped: 0,
            removed_local: 0,
            uploaded: 0,
            pages: 0,
            window_truncated: false,
            page_limited: false,
            auth_restarts: 0,
            assets: AssetReport::default(),
            assets_attached: 0,
            assets_retired: 0,
            duration: Duration::ZERO,
        }
    }
}

fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as Timestamp)
        .unwrap_or_default()
}

/// Removes the pair from the in-flight set when the run ends, however it ends.
struct RunGuard<'a> {
    active: &'a DashMap<SyncScope, ()>,
    scope: SyncScope,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.scope);
    }
}

/// Phase machine plus event publishing for one run.
struct Run<'a> {
    scope: SyncScope,
    phase: SyncPhase,
    events: Option<&'a mpsc::UnboundedSender<ScopedEvent>>,
}

impl<'a> Run<'a> {
    fn new(scope: SyncScope, events: Option<&'a mpsc::UnboundedSender<ScopedEvent>>) -> Self {
        Self {
            scope,
            phase: SyncPhase::new(),
            events,
        }
    }

    fn step(&mut self, event: PhaseEvent) -> Vec<PhaseAction> {
        let before = self.phase.name();
        let (next, actions) = std::mem::take(&mut self.phase).on_event(event);
        if next.name() != before {
            debug!("{}: {} -> {}", self.scope, before, next.name());
        }
        self.phase = next;

        for action in &actions {
            if let PhaseAction::EmitEvent(event) = action {
                if let Some(tx) = self.events {
                    // A dropped receiver just means nobody is listening
                    let _ = tx.send(ScopedEvent {
                        scope: self.scope.clone(),
                        event: event.clone(),
                    });
                }
            }
        }
        actions
    }
}

/// Runs syncs for any number of (account, collection) pairs.
///
/// Distinct pairs may sync concurrently through one orchestrator; a second
/// request for a pair that is already syncing fails with [`SyncError::Busy`].
pub struct SyncOrchestrator {
    config: EngineConfig,
    auth: Arc<dyn AuthProvider>,
    transport: Arc<dyn Transport>,
    local: Arc<dyn LocalStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    fetcher: Arc<dyn AssetFetcher>,
    active: DashMap<SyncScope, ()>,
    events: Option<mpsc::UnboundedSender<ScopedEvent>>,
}

impl SyncOrchestrator {
    /// Create an orchestrator over the given collaborators.
    pub fn new(
        config: EngineConfig,
        auth: Arc<dyn AuthProvider>,
        transport: Arc<dyn Transport>,
        local: Arc<dyn LocalStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> Self {
        Self {
            config,
            auth,
            transport,
            local,
            checkpoints,
            fetcher,
            active: DashMap::new(),
            events: None,
        }
    }

    /// Publish run events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ScopedEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// True while a run for `scope` is in flight.
    pub fn is_running(&self, scope: &SyncScope) -> bool {
        self.active.contains_key(scope)
    }

    /// Sync one collection of one account.
    ///
    /// On error nothing is committed. Errors for which
    /// [`SyncError::requires_resync`] is true also purge the stored
    /// checkpoint, so the next run starts over with a full fetch.
    pub async fn sync(
        &self,
        account: &AccountId,
        provider: &dyn Provider,
        abort: &AbortSignal,
    ) -> Result<SyncReport, SyncError> {
        let scope = SyncScope::new(account.clone(), provider.collection());
        let _guard = self.acquire(&scope)?;
        let started = Instant::now();

        let mut run = Run::new(scope.clone(), self.events.as_ref());
        run.step(PhaseEvent::SyncRequested);
        info!("{}: sync started ({})", scope, provider.name());

        match self.execute(&mut run, provider, abort).await {
            Ok(mut report) => {
                report.duration = started.elapsed();
                info!(
                    "{}: sync complete: +{} ~{} -{} remote, {} uploaded, {} skipped in {:?}",
                    scope,
                    report.remote_added,
                    report.remote_modified,
                    report.remote_removed,
                    report.uploaded,
                    report.skipped,
                    report.duration
                );
                Ok(report)
            }
            Err(e) => {
                let actions = run.step(PhaseEvent::Failed {
                    reason: e.to_string(),
                    resync: e.requires_resync(),
                });
                if actions.contains(&PhaseAction::PurgeCheckpoint) {
                    match self.checkpoints.purge(&scope).await {
                        Ok(()) => warn!("{}: checkpoint purged, next run resyncs fully", scope),
                        Err(purge_err) => {
                            error!("{}: could not purge checkpoint: {}", scope, purge_err)
                        }
                    }
                }
                run.step(PhaseEvent::Reset);
                error!("{}: sync failed, will retry next scheduled run: {}", scope, e);
                Err(e)
            }
        }
    }

    fn acquire(&self, scope: &SyncScope) -> Result<RunGuard<'_>, SyncError> {
        match self.active.entry(scope.clone()) {
            Entry::Occupied(_) => {
                debug!("{}: run already in flight", scope);
                Err(SyncError::Busy {
                    account: scope.account.to_string(),
                    collection: scope.collection.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(RunGuard {
                    active: &self.active,
                    scope: scope.clone(),
                })
            }
        }
    }

    async fn execute(
        &self,
        run: &mut Run<'_>,
        provider: &dyn Provider,
        abort: &AbortSignal,
    ) -> Result<SyncReport, SyncError> {
        let scope = run.scope.clone();
        let run_started_at = unix_now();
        let mut report = SyncReport::new(scope.clone());

        let mut token = self.auth.obtain_token(&scope.account).await?;
        abort.check()?;

        let previous = self.load_checkpoint(&scope).await?;
        let mut next = previous.clone();
        if previous.is_first_run() {
            self.adopt_local(&scope, &mut next).await?;
        }
        let assets = AssetReconciler::new(
            scope.clone(),
            self.config.asset_policy(),
            self.config.max_concurrent_downloads,
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.fetcher),
        );
        assets.resume(&previous.pending_assets);
        run.step(PhaseEvent::Authenticated);

        // Fetch, restarting from the first page after an expired token
        let fetch: FetchOutcome = loop {
            let ctx = RequestContext {
                account: &scope.account,
                token: &token,
                since: previous.remote_since.as_ref(),
            };
            let pager = RemotePager::new(self.transport.as_ref(), provider)
                .with_max_pages(self.config.max_pages)
                .with_window(self.config.sync_window(run_started_at));
            let result = pager
                .fetch_all(&ctx, abort, |_| {
                    run.step(PhaseEvent::PageFetched);
                })
                .await;

            match result {
                Ok(outcome) => break outcome,
                Err(e) if e.is_auth() && report.auth_restarts < self.config.max_auth_restarts => {
                    warn!("{}: {}, re-authenticating and restarting fetch", scope, e);
                    let actions = run.step(PhaseEvent::TokenExpired);
                    if actions.contains(&PhaseAction::InvalidateToken) {
                        self.auth.invalidate(&scope.account).await;
                    }
                    token = self.auth.obtain_token(&scope.account).await?;
                    run.step(PhaseEvent::Authenticated);
                    report.auth_restarts += 1;
                }
                Err(e) => return Err(e),
            }
        };
        report.pages = fetch.pages;
        report.skipped += fetch.skipped;
        report.window_truncated = fetch.window_truncated;
        report.page_limited = fetch.hit_page_limit();
        run.step(PhaseEvent::FetchExhausted);

        // Ids on pages never fetched are not gone
        let mode = if report.page_limited {
            warn!(
                "{}: stopped at {} pages, treating the fetch as partial",
                scope, fetch.pages
            );
            FetchMode::Incremental
        } else {
            provider.fetch_mode()
        };
        let engine = DeltaEngine::new(mode);
        let remote = engine.remote_delta(next.previous_snapshot(), fetch.entities);
        report.remote_added = remote.added.len();
        report.remote_modified = remote.modified.len();
        report.remote_removed = remote.removed.len();
        debug!(
            "{}: remote delta +{} ~{} -{}",
            scope, report.remote_added, report.remote_modified, report.remote_removed
        );
        run.step(PhaseEvent::DeltaComputed {
            added: report.remote_added,
            modified: report.remote_modified,
            removed: report.remote_removed,
        });

        let ignored = self.config.ignored_field_set();
        let echoes = self
            .apply_remote(
                &scope,
                provider,
                remote,
                &ignored,
                &assets,
                &mut next,
                &mut report,
                abort,
            )
            .await?;
        run.step(PhaseEvent::RemoteApplied);

        let batch_size = provider
            .upload_batch_size()
            .unwrap_or(self.config.upload_batch_size);
        let mut queue = UploadQueue::new(batch_size);
        if provider.supports_upload() {
            abort.check()?;
            let log = self.local.changes_since(&scope, previous.local_since).await?;
            let local = engine.local_delta(log.delta, &ignored, &echoes);
            let queued = queue.enqueue_delta(local)?;
            debug!("{}: {} local changes to upload", scope, queued);
            next.local_since = Some(log.marker);
        } else {
            debug!("{}: {} is read-only, skipping upload", scope, provider.name());
        }
        run.step(PhaseEvent::LocalDeltaComputed);

        let mut unacknowledged = 0usize;
        while let Some(batch) = queue.dequeue_batch() {
            abort.check()?;
            let ctx = RequestContext {
                account: &scope.account,
                token: &token,
                since: previous.remote_since.as_ref(),
            };
            let request = provider.upload_request(&ctx, &batch)?;
            let response = self
                .transport
                .request(request)
                .await
                .map_err(SyncError::from)?
                .error_for_status()?;
            let acks = provider.parse_upload_acks(&response.body)?;
            unacknowledged += self
                .apply_acks(&scope, &batch, acks, &mut next, &mut report)
                .await?;
            debug!("{}: batch {} acknowledged", scope, batch.id);
            run.step(PhaseEvent::BatchUploaded);
        }
        if unacknowledged > 0 {
            // Keep the old marker so the next run reads these creates again
            warn!(
                "{}: {} creates not acknowledged, local changes stay pending",
                scope, unacknowledged
            );
            next.local_since = previous.local_since;
        }
        run.step(PhaseEvent::UploadsFinished);

        assets.retry_restored().await;
        report.assets = assets
            .drain(&token, self.config.asset_drain_timeout())
            .await;
        self.attach_assets(&scope, &assets, &next, &mut report).await;
        let actions = run.step(PhaseEvent::AssetsDrained);

        if actions.contains(&PhaseAction::CommitCheckpoint) {
            abort.check()?;
            // An incremental feed must resume before the pages it never served
            let resume_before =
                report.page_limited && provider.fetch_mode() == FetchMode::Incremental;
            if !resume_before {
                next.remote_since = Some(match fetch.sync_token {
                    Some(token) => RemoteMarker::Token(token),
                    None => RemoteMarker::Timestamp(run_started_at),
                });
            }
            self.checkpoints.commit(&scope, &next).await?;
            run.step(PhaseEvent::Committed);
        }
        Ok(report)
    }

    async fn load_checkpoint(&self, scope: &SyncScope) -> Result<SyncCheckpoint, SyncError> {
        match self.checkpoints.load(scope).await {
            Ok(Some(checkpoint)) => Ok(checkpoint),
            Ok(None) => Ok(SyncCheckpoint::new()),
            Err(e) if e.requires_resync() => {
                warn!("{}: stored checkpoint unusable ({}), starting over", scope, e);
                self.checkpoints.purge(scope).await?;
                Ok(SyncCheckpoint::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Map local entities that already carry a remote id, so a full resync
    /// merges into them instead of inserting duplicates.
    ///
    /// Adopted ids enter the snapshot with an empty version: fetched ones
    /// show up as modified, missing ones as removed.
    async fn adopt_local(
        &self,
        scope: &SyncScope,
        next: &mut SyncCheckpoint,
    ) -> Result<(), SyncError> {
        let local = self.local.fetch_since(scope, None).await?;
        let mut adopted = 0usize;
        for entity in local {
            if entity.external_id.is_unassigned() {
                continue;
            }
            if let Some(local_id) = entity.local_id {
                next.record_applied(entity.external_id, local_id, VersionTag::new(""));
                adopted += 1;
            }
        }
        if adopted > 0 {
            info!("{}: adopted {} existing local entities", scope, adopted);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_remote(
        &self,
        scope: &SyncScope,
        provider: &dyn Provider,
        remote: DeltaSet,
        ignored: &FieldSet,
        assets: &AssetReconciler,
        next: &mut SyncCheckpoint,
        report: &mut SyncReport,
        abort: &AbortSignal,
    ) -> Result<RunEchoes, SyncError> {
        let resolver = provider.conflict_resolver(ignored.clone());
        let mut echoes = RunEchoes::new();

        let known: Vec<LocalId> = remote
            .added
            .iter()
            .chain(&remote.modified)
            .filter_map(|e| next.local_id(&e.external_id).cloned())
            .collect();
        let existing: HashMap<LocalId, Entity> = if known.is_empty() {
            HashMap::new()
        } else {
            self.local
                .fetch_existing(scope, &known)
                .await?
                .into_iter()
                .filter_map(|e| e.local_id.clone().map(|id| (id, e)))
                .collect()
        };

        // The remote still has these, so earlier refused removals are moot
        for entity in remote.added.iter().chain(&remote.modified) {
            next.pending_removals.remove(&entity.external_id);
        }
        let mut removals = remote.removed;
        for external_id in &next.pending_removals {
            if !removals.contains(external_id) {
                removals.push(external_id.clone());
            }
        }

        for entity in remote.added.into_iter().chain(remote.modified) {
            abort.check()?;
            let external_id = entity.external_id.clone();
            // Versions come from the remote representation, before any merge
            let version = entity.effective_version();
            let local = next.local_id(&external_id).and_then(|id| existing.get(id));
            let merged = match local {
                Some(local) => resolver.merge(entity, local),
                None => entity.without_fields(ignored),
            };

            let local_id = match self.local.save(scope, &merged).await {
                Ok(local_id) => local_id,
                Err(e @ StoreError::Rejected { .. }) => {
                    warn!("{}: skipping {}: {}", scope, external_id, e);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            echoes.saved.insert(local_id.clone());
            next.record_applied(external_id.clone(), local_id, version);
            report.applied += 1;

            match &merged.asset {
                Some(asset) if asset.local_path.is_none() => {
                    assets.enqueue(&external_id, &asset.url).await;
                }
                Some(_) => {}
                None if assets.state(&external_id).is_some() => assets.clear(&external_id).await,
                None => {}
            }
        }

        for external_id in &removals {
            abort.check()?;
            if let Some(local_id) = next.local_id(external_id).cloned() {
                match self.local.remove(scope, &local_id).await {
                    Ok(()) => report.removed_local += 1,
                    Err(e @ StoreError::Rejected { .. }) => {
                        warn!("{}: could not remove {}: {}", scope, external_id, e);
                        report.skipped += 1;
                        next.pending_removals.insert(external_id.clone());
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            echoes.removed.insert(external_id.clone());
            next.forget(external_id);
            assets.clear(external_id).await;
        }

        debug!(
            "{}: applied {}, removed {}, skipped {}",
            scope, report.applied, report.removed_local, report.skipped
        );
        Ok(echoes)
    }

    /// Record acknowledged uploads. Returns the number of creates the
    /// remote did not acknowledge.
    async fn apply_acks(
        &self,
        scope: &SyncScope,
        batch: &UploadBatch,
        acks: Vec<UploadAck>,
        next: &mut SyncCheckpoint,
        report: &mut SyncReport,
    ) -> Result<usize, SyncError> {
        let mut by_local: HashMap<LocalId, UploadAck> = HashMap::new();
        let mut by_external: HashMap<ExternalId, UploadAck> = HashMap::new();
        for ack in acks {
            match ack.local_id.clone() {
                Some(local_id) => by_local.insert(local_id, ack),
                None => by_external.insert(ack.external_id.clone(), ack),
            };
        }

        // Uploaded entities had ignored fields stripped; re-read the full ones
        let touched: Vec<LocalId> = batch
            .ops
            .iter()
            .filter_map(|op| op.entity().and_then(|e| e.local_id.clone()))
            .collect();
        let current: HashMap<LocalId, Entity> = if touched.is_empty() {
            HashMap::new()
        } else {
            self.local
                .fetch_existing(scope, &touched)
                .await?
                .into_iter()
                .filter_map(|e| e.local_id.clone().map(|id| (id, e)))
                .collect()
        };

        let mut unacknowledged = 0usize;
        for op in &batch.ops {
            match op {
                UploadOp::Create(entity) => {
                    let Some(local_id) = entity.local_id.clone() else {
                        continue;
                    };
                    let Some(ack) = by_local.remove(&local_id) else {
                        warn!("{}: no acknowledgement for created {}", scope, local_id);
                        unacknowledged += 1;
                        continue;
                    };
                    let mut saved = current
                        .get(&local_id)
                        .cloned()
                        .unwrap_or_else(|| entity.clone());
                    saved.external_id = ack.external_id.clone();
                    saved.version_tag = ack.version_tag.clone();
                    let version = ack
                        .version_tag
                        .clone()
                        .unwrap_or_else(|| entity.effective_version());
                    self.save_quietly(scope, &saved).await?;
                    next.record_applied(ack.external_id, local_id, version);
                    report.uploaded += 1;
                }
                UploadOp::Update(entity) => {
                    let ack = by_external.remove(&entity.external_id);
                    let version_tag = ack.and_then(|a| a.version_tag);
                    if let Some(local_id) = entity.local_id.clone() {
                        if let (Some(tag), Some(current)) = (&version_tag, current.get(&local_id)) {
                            let mut saved = current.clone();
                            saved.version_tag = Some(tag.clone());
                            self.save_quietly(scope, &saved).await?;
                        }
                        let version = version_tag.unwrap_or_else(|| entity.effective_version());
                        next.record_applied(entity.external_id.clone(), local_id, version);
                    }
                    report.uploaded += 1;
                }
                UploadOp::Delete(external_id) => {
                    next.forget(external_id);
                    report.uploaded += 1;
                }
            }
        }
        Ok(unacknowledged)
    }

    /// Save after an upload. A rejection only loses the local copy of the
    /// remote id or version; the mapping is still recorded by the caller.
    async fn save_quietly(&self, scope: &SyncScope, entity: &Entity) -> Result<(), SyncError> {
        match self.local.save(scope, entity).await {
            Ok(_) => Ok(()),
            Err(e @ StoreError::Rejected { .. }) => {
                warn!("{}: could not record upload of {}: {}", scope, entity.external_id, e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Save downloaded paths onto entities and drop retired references.
    ///
    /// Best effort: failures are logged and retried on a later run.
    async fn attach_assets(
        &self,
        scope: &SyncScope,
        assets: &AssetReconciler,
        next: &SyncCheckpoint,
        report: &mut SyncReport,
    ) {
        let attachments = assets.take_attachments();
        let dropped = assets.take_dropped();
        if attachments.is_empty() && dropped.is_empty() {
            return;
        }

        let ids: Vec<LocalId> = attachments
            .iter()
            .map(|(id, _)| id)
            .chain(&dropped)
            .filter_map(|id| next.local_id(id).cloned())
            .collect();
        let fetched = self.local.fetch_existing(scope, &ids).await;
        let existing: HashMap<ExternalId, Entity> = match fetched {
            Ok(entities) => entities
                .into_iter()
                .map(|e| (e.external_id.clone(), e))
                .collect(),
            Err(e) => {
                warn!("{}: could not load entities for asset attach: {}", scope, e);
                return;
            }
        };

        for (external_id, path) in attachments {
            let Some(mut entity) = existing.get(&external_id).cloned() else {
                continue;
            };
            let Some(asset) = entity.asset.as_mut() else {
                continue;
            };
            asset.local_path = Some(path);
            match self.local.save(scope, &entity).await {
                Ok(_) => {
                    assets.mark_attached(&external_id).await;
                    report.assets_attached += 1;
                }
                Err(e) => warn!("{}: could not attach asset to {}: {}", scope, external_id, e),
            }
        }

        for external_id in dropped {
            let Some(mut entity) = existing.get(&external_id).cloned() else {
                continue;
            };
            entity.asset = None;
            match self.local.save(scope, &entity).await {
                Ok(_) => report.assets_retired += 1,
                Err(e) => warn!("{}: could not drop asset of {}: {}", scope, external_id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessToken, StaticTokenProvider};
    use crate::feed::{FeedSettings, JsonFeedProvider};
    use crate::memory::{MemoryCheckpointStore, MemoryLocalStore};
    use crate::transport::{HttpResponse, MockTransport};
    use async_trait::async_trait;
    use serde_json::json;
    use sync_types::{CollectionType, DownloadError};

    struct NoAssets;

    #[async_trait]
    impl AssetFetcher for NoAssets {
        async fn download(&self, url: &str, _token: &AccessToken) -> Result<String, DownloadError> {
            Err(DownloadError::Network(format!("offline: {}", url)))
        }
    }

    struct Harness {
        transport: MockTransport,
        local: MemoryLocalStore,
        checkpoints: MemoryCheckpointStore,
        orchestrator: SyncOrchestrator,
    }

    fn harness(config: EngineConfig) -> Harness {
        let transport = MockTransport::new();
        let local = MemoryLocalStore::new();
        let checkpoints = MemoryCheckpointStore::new();
        let auth = StaticTokenProvider::new().with_token("42", "tok");
        let orchestrator = SyncOrchestrator::new(
            config,
            Arc::new(auth),
            Arc::new(transport.clone()),
            Arc::new(local.clone()),
            Arc::new(checkpoints.clone()),
            Arc::new(NoAssets),
        );
        Harness {
            transport,
            local,
            checkpoints,
            orchestrator,
        }
    }

    fn provider() -> JsonFeedProvider {
        JsonFeedProvider::new(FeedSettings::new(CollectionType::Contacts, "https://api/contacts"))
    }

    fn scope() -> SyncScope {
        SyncScope::new("42", CollectionType::Contacts)
    }

    fn record(id: &str, etag: &str) -> serde_json::Value {
        json!({"id": id, "etag": etag, "fields": {"name": id}})
    }

    fn writable() -> JsonFeedProvider {
        JsonFeedProvider::new(FeedSettings {
            writable: true,
            ..FeedSettings::new(CollectionType::Contacts, "https://api/contacts")
        })
    }

    fn incremental() -> JsonFeedProvider {
        JsonFeedProvider::new(FeedSettings {
            incremental: true,
            ..FeedSettings::new(CollectionType::Contacts, "https://api/contacts")
        })
    }

    const BATCH: &str = "https://api/contacts/batch";

    async fn sync(h: &Harness) -> Result<SyncReport, SyncError> {
        sync_with(h, &provider()).await
    }

    async fn sync_with(h: &Harness, provider: &JsonFeedProvider) -> Result<SyncReport, SyncError> {
        h.orchestrator
            .sync(&AccountId::new("42"), provider, &AbortSignal::new())
            .await
    }

    // ===========================================
    // Happy path
    // ===========================================

    #[tokio::test]
    async fn first_run_inserts_and_commits() {
        let h = harness(EngineConfig::default());
        h.transport
            .queue_json(json!({"items": [record("p1", "e1"), record("p2", "e1")]}));

        let report = sync(&h).await.unwrap();

        assert_eq!(report.remote_added, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(h.local.entities(&scope()).len(), 2);
        let committed = h.checkpoints.committed(&scope()).unwrap();
        assert_eq!(committed.id_map.len(), 2);
        assert!(matches!(committed.remote_since, Some(RemoteMarker::Timestamp(_))));
    }

    #[tokio::test]
    async fn second_identical_fetch_is_empty() {
        let h = harness(EngineConfig::default());
        h.transport.queue_json(json!({"items": [record("p1", "e1")]}));
        h.transport.queue_json(json!({"items": [record("p1", "e1")]}));

        sync(&h).await.unwrap();
        let report = sync(&h).await.unwrap();

        assert_eq!(report.remote_added + report.remote_modified + report.remote_removed, 0);
        assert_eq!(h.checkpoints.commit_count(), 2);
    }

    #[tokio::test]
    async fn sync_token_becomes_marker() {
        let h = harness(EngineConfig::default());
        h.transport
            .queue_json(json!({"items": [], "sync_token": "st-1"}));

        sync(&h).await.unwrap();

        let committed = h.checkpoints.committed(&scope()).unwrap();
        assert_eq!(committed.remote_since, Some(RemoteMarker::Token("st-1".into())));
    }

    #[tokio::test]
    async fn events_follow_the_run() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut h = harness(EngineConfig::default());
        h.orchestrator = h.orchestrator.with_events(tx);
        h.transport.queue_json(json!({"items": [record("p1", "e1")]}));

        sync(&h).await.unwrap();

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            assert_eq!(e.scope, scope());
            events.push(e.event);
        }
        assert_eq!(events.first(), Some(&SyncEvent::Started));
        assert!(events.contains(&SyncEvent::FetchProgress { pages: 1 }));
        assert_eq!(events.last(), Some(&SyncEvent::Completed));
    }

    // ===========================================
    // Failure handling
    // ===========================================

    #[tokio::test]
    async fn transient_failure_keeps_checkpoint() {
        let h = harness(EngineConfig::default());
        h.transport.queue_json(json!({"items": [record("p1", "e1")]}));
        sync(&h).await.unwrap();
        let before = h.checkpoints.committed(&scope());

        h.transport.queue_response(HttpResponse::new(503, "busy"));
        let err = sync(&h).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(h.checkpoints.committed(&scope()), before);
        assert!(!h.orchestrator.is_running(&scope()));
    }

    #[tokio::test]
    async fn missing_token_fails_before_fetch() {
        let h = harness(EngineConfig::default());
        let err = h
            .orchestrator
            .sync(&AccountId::new("7"), &provider(), &AbortSignal::new())
            .await
            .unwrap_err();

        assert!(err.is_auth());
        assert!(h.transport.sent_requests().is_empty());
    }

    #[tokio::test]
    async fn gone_purges_checkpoint() {
        let h = harness(EngineConfig::default());
        h.transport.queue_json(json!({"items": [record("p1", "e1")]}));
        sync(&h).await.unwrap();

        h.transport.queue_response(HttpResponse::new(410, "sync token expired"));
        let err = sync(&h).await.unwrap_err();

        assert!(err.requires_resync());
        assert!(h.checkpoints.committed(&scope()).is_none());
    }

    #[tokio::test]
    async fn failed_commit_is_run_failure() {
        let h = harness(EngineConfig::default());
        h.transport.queue_json(json!({"items": [record("p1", "e1")]}));
        h.checkpoints.fail_next_commit("disk full");

        assert!(sync(&h).await.is_err());
        assert!(h.checkpoints.committed(&scope()).is_none());
    }

    #[tokio::test]
    async fn aborted_run_commits_nothing() {
        let h = harness(EngineConfig::default());
        h.transport.queue_json(json!({"items": [record("p1", "e1")]}));
        let abort = AbortSignal::new();
        abort.abort();

        let err = h
            .orchestrator
            .sync(&AccountId::new("42"), &provider(), &abort)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(h.checkpoints.commit_count(), 0);
    }

    // ===========================================
    // Local side
    // ===========================================

    #[tokio::test]
    async fn rejected_entity_retries_as_added() {
        let h = harness(EngineConfig::default());
        h.local.reject_external_id("bad");
        h.transport
            .queue_json(json!({"items": [record("ok", "e1"), record("bad", "e1")]}));

        let report = sync(&h).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(!h
            .checkpoints
            .committed(&scope())
            .unwrap()
            .id_map
            .contains_key(&ExternalId::new("bad")));

        h.local.heal();
        h.transport
            .queue_json(json!({"items": [record("ok", "e1"), record("bad", "e1")]}));
        let report = sync(&h).await.unwrap();
        assert_eq!(report.remote_added, 1);
        assert_eq!(report.applied, 1);
    }

    #[tokio::test]
    async fn ignored_fields_survive_remote_update() {
        let h = harness(EngineConfig::default().with_ignored_field("note"));
        h.transport.queue_json(json!({"items": [record("c1", "e1")]}));
        sync(&h).await.unwrap();

        let local = h.local.find(&scope(), "c1").unwrap();
        h.local.edit(local.local_id.as_ref().unwrap(), "note", json!("call back"));

        h.transport.queue_json(json!({"items": [
            {"id": "c1", "etag": "e2", "fields": {"name": "Ada", "note": "remote"}}
        ]}));
        sync(&h).await.unwrap();

        let merged = h.local.find(&scope(), "c1").unwrap();
        assert_eq!(merged.field("name"), Some(&json!("Ada")));
        assert_eq!(merged.field("note"), Some(&json!("call back")));
    }

    #[tokio::test]
    async fn refused_removal_is_retried_after_the_tombstone() {
        let h = harness(EngineConfig::default());
        h.transport.queue_json(json!({
            "items": [record("p1", "e1"), record("p2", "e1")],
            "sync_token": "st-1"
        }));
        sync_with(&h, &incremental()).await.unwrap();

        h.local.reject_external_id("p2");
        h.transport.queue_json(json!({
            "items": [{"id": "p2", "deleted": true}],
            "sync_token": "st-2"
        }));
        let report = sync_with(&h, &incremental()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(h.local.find(&scope(), "p2").is_some());
        let committed = h.checkpoints.committed(&scope()).unwrap();
        assert!(committed.pending_removals.contains(&ExternalId::new("p2")));

        // The feed never repeats the tombstone
        h.local.heal();
        h.transport
            .queue_json(json!({"items": [], "sync_token": "st-3"}));
        let report = sync_with(&h, &incremental()).await.unwrap();
        assert_eq!(report.removed_local, 1);
        assert!(h.local.find(&scope(), "p2").is_none());
        let committed = h.checkpoints.committed(&scope()).unwrap();
        assert!(committed.pending_removals.is_empty());
        assert!(!committed.id_map.contains_key(&ExternalId::new("p2")));
    }

    #[tokio::test]
    async fn reappearing_entity_cancels_refused_removal() {
        let h = harness(EngineConfig::default());
        h.transport
            .queue_json(json!({"items": [record("p1", "e1")], "sync_token": "st-1"}));
        sync_with(&h, &incremental()).await.unwrap();

        h.local.reject_external_id("p1");
        h.transport.queue_json(json!({
            "items": [{"id": "p1", "deleted": true}],
            "sync_token": "st-2"
        }));
        sync_with(&h, &incremental()).await.unwrap();

        h.local.heal();
        h.transport
            .queue_json(json!({"items": [record("p1", "e2")], "sync_token": "st-3"}));
        let report = sync_with(&h, &incremental()).await.unwrap();
        assert_eq!(report.removed_local, 0);
        assert!(h.local.find(&scope(), "p1").is_some());
        assert!(h.checkpoints.committed(&scope()).unwrap().pending_removals.is_empty());
    }

    #[tokio::test]
    async fn resync_adopts_existing_rows() {
        let h = harness(EngineConfig::default());
        h.transport
            .queue_json(json!({"items": [record("p1", "e1"), record("p2", "e1")]}));
        sync(&h).await.unwrap();

        h.checkpoints.purge(&scope()).await.unwrap();
        h.transport.queue_json(json!({"items": [record("p1", "e1")]}));
        let report = sync(&h).await.unwrap();

        // p1 merged into its old row, p2 gone remotely
        let entities = h.local.entities(&scope());
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].external_id.as_str(), "p1");
        assert_eq!(report.remote_added, 0);
        assert_eq!(report.remote_removed, 1);
    }

    // ===========================================
    // Page limit
    // ===========================================

    #[tokio::test]
    async fn page_limit_does_not_remove_unfetched_ids() {
        let h = harness(EngineConfig::default().with_max_pages(1));
        h.transport
            .queue_json(json!({"items": [record("p1", "e1"), record("p2", "e1")]}));
        sync(&h).await.unwrap();

        // p2 sits on a second page that is never requested
        h.transport
            .queue_json(json!({"items": [record("p1", "e1")], "next_cursor": "c2"}));
        let report = sync(&h).await.unwrap();

        assert!(report.page_limited);
        assert_eq!(report.remote_removed, 0);
        assert_eq!(h.transport.queued(), 0);
        assert_eq!(h.local.entities(&scope()).len(), 2);
        let committed = h.checkpoints.committed(&scope()).unwrap();
        assert!(committed.id_map.contains_key(&ExternalId::new("p2")));
    }

    #[tokio::test]
    async fn complete_fetch_after_page_limit_removes_again() {
        let h = harness(EngineConfig::default().with_max_pages(2));
        h.transport
            .queue_json(json!({"items": [record("p1", "e1"), record("p2", "e1")]}));
        sync(&h).await.unwrap();

        h.transport
            .queue_json(json!({"items": [record("p1", "e1")], "next_cursor": "c2"}));
        h.transport.queue_json(json!({"items": []}));
        let report = sync(&h).await.unwrap();

        assert!(!report.page_limited);
        assert_eq!(report.remote_removed, 1);
        assert_eq!(h.local.entities(&scope()).len(), 1);
    }

    #[tokio::test]
    async fn page_limited_incremental_fetch_keeps_marker() {
        let h = harness(EngineConfig::default().with_max_pages(1));
        h.transport
            .queue_json(json!({"items": [record("p1", "e1")], "sync_token": "st-1"}));
        sync_with(&h, &incremental()).await.unwrap();

        h.transport.queue_json(json!({
            "items": [record("p2", "e1")],
            "next_cursor": "c2",
            "sync_token": "st-2"
        }));
        let report = sync_with(&h, &incremental()).await.unwrap();

        assert!(report.page_limited);
        assert_eq!(report.applied, 1);
        let committed = h.checkpoints.committed(&scope()).unwrap();
        assert_eq!(committed.remote_since, Some(RemoteMarker::Token("st-1".into())));
    }

    // ===========================================
    // Upload acknowledgements
    // ===========================================

    #[tokio::test]
    async fn unacknowledged_create_is_uploaded_again() {
        let h = harness(EngineConfig::default());
        h.transport.queue_json(json!({"items": [record("p1", "e1")]}));
        sync_with(&h, &writable()).await.unwrap();

        let created = h.local.create(
            &scope(),
            Entity::new(ExternalId::unassigned()).with_field("name", json!("Grace")),
        );
        h.transport.route(BATCH, HttpResponse::json(&json!({"results": []})));
        h.transport.queue_json(json!({"items": [record("p1", "e1")]}));
        let report = sync_with(&h, &writable()).await.unwrap();

        assert_eq!(report.uploaded, 0);
        assert_eq!(h.transport.count_requests(BATCH), 1);
        assert!(h.local.get(&created).unwrap().external_id.is_unassigned());

        h.transport.route(
            BATCH,
            HttpResponse::json(&json!({"results": [
                {"local_id": created.as_str(), "id": "srv-1", "etag": "v1"}
            ]})),
        );
        h.transport.queue_json(json!({"items": [record("p1", "e1")]}));
        let report = sync_with(&h, &writable()).await.unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(h.transport.count_requests(BATCH), 2);
        assert_eq!(h.local.get(&created).unwrap().external_id.as_str(), "srv-1");
        let committed = h.checkpoints.committed(&scope()).unwrap();
        assert_eq!(committed.id_map[&ExternalId::new("srv-1")], created);
    }

    #[tokio::test]
    async fn acknowledged_creates_advance_local_marker() {
        let h = harness(EngineConfig::default());
        h.transport.queue_json(json!({"items": []}));
        sync_with(&h, &writable()).await.unwrap();

        let created = h.local.create(
            &scope(),
            Entity::new(ExternalId::unassigned()).with_field("name", json!("Grace")),
        );
        h.transport.route(
            BATCH,
            HttpResponse::json(&json!({"results": [
                {"local_id": created.as_str(), "id": "srv-1"}
            ]})),
        );
        h.transport.queue_json(json!({"items": []}));
        sync_with(&h, &writable()).await.unwrap();

        h.transport
            .queue_json(json!({"items": [{"id": "srv-1", "fields": {"name": "Grace"}}]}));
        let report = sync_with(&h, &writable()).await.unwrap();
        assert_eq!(report.uploaded, 0);
        assert_eq!(h.transport.count_requests(BATCH), 1);
    }
}
