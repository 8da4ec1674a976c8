//! In-memory stores for tests and embedding.
//!
//! [`MemoryLocalStore`] keeps an application-side change log so it can play
//! both roles in a test: the app editing entities and the engine syncing them.
//! [`MemoryCheckpointStore`] stores the encoded checkpoint bytes, so a
//! round-trip through it exercises the same codec as the SQLite store.

use crate::store::{collapse_changes, ChangeLog, CheckpointStore, LocalStore, LoggedChange};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_types::{
    DeltaSet, Entity, ExternalId, FieldSet, FieldTag, LocalId, PendingAsset, StoreError,
    SyncCheckpoint, SyncError, SyncScope, Timestamp,
};
use uuid::Uuid;

// ===========================================
// Local store
// ===========================================

#[derive(Debug, Clone)]
struct Change {
    seq: Timestamp,
    scope: SyncScope,
    local_id: LocalId,
    kind: LoggedChange,
}

#[derive(Debug, Default)]
struct LocalInner {
    records: BTreeMap<LocalId, (SyncScope, Entity)>,
    log: Vec<Change>,
    seq: Timestamp,
    rejected: BTreeSet<ExternalId>,
    fail_after_saves: Option<usize>,
    saves: usize,
}

impl LocalInner {
    fn log(&mut self, scope: &SyncScope, local_id: &LocalId, kind: LoggedChange) {
        self.seq += 1;
        self.log.push(Change {
            seq: self.seq,
            scope: scope.clone(),
            local_id: local_id.clone(),
            kind,
        });
    }
}

/// Entity store held in memory.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    inner: Arc<Mutex<LocalInner>>,
}

impl Clone for MemoryLocalStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl MemoryLocalStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, LocalInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Application-side insert. Logged as an add.
    pub fn create(&self, scope: &SyncScope, entity: Entity) -> LocalId {
        let mut inner = self.inner();
        let id = LocalId::new(Uuid::new_v4().to_string());
        let mut entity = entity;
        entity.local_id = Some(id.clone());
        entity.dirty_fields.clear();
        inner.records.insert(id.clone(), (scope.clone(), entity));
        inner.log(scope, &id, LoggedChange::Added);
        id
    }

    /// Application-side field edit. Logged as a modification of that field.
    ///
    /// Returns false for unknown ids.
    pub fn edit(&self, id: &LocalId, field: &str, value: serde_json::Value) -> bool {
        let mut inner = self.inner();
        let Some((scope, entity)) = inner.records.get_mut(id) else {
            return false;
        };
        entity.payload.insert(FieldTag::from(field), value);
        let scope = scope.clone();
        let dirty: FieldSet = [FieldTag::from(field)].into_iter().collect();
        inner.log(&scope, id, LoggedChange::Modified(dirty));
        true
    }

    /// Application-side delete. Logged as a removal.
    pub fn delete(&self, id: &LocalId) -> bool {
        let mut inner = self.inner();
        let Some((scope, entity)) = inner.records.remove(id) else {
            return false;
        };
        inner.log(&scope, id, LoggedChange::Removed(entity.external_id));
        true
    }

    /// Entity by local id.
    pub fn get(&self, id: &LocalId) -> Option<Entity> {
        self.inner().records.get(id).map(|(_, e)| e.clone())
    }

    /// Entity of `scope` with the given external id.
    pub fn find(&self, scope: &SyncScope, external_id: &str) -> Option<Entity> {
        self.inner()
            .records
            .values()
            .find(|(s, e)| s == scope && e.external_id.as_str() == external_id)
            .map(|(_, e)| e.clone())
    }

    /// All entities of `scope`, ordered by external id.
    pub fn entities(&self, scope: &SyncScope) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .inner()
            .records
            .values()
            .filter(|(s, _)| s == scope)
            .map(|(_, e)| e.clone())
            .collect();
        entities.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        entities
    }

    /// Make every engine save or removal of this external id fail with
    /// `Rejected`.
    pub fn reject_external_id(&self, id: &str) {
        self.inner().rejected.insert(ExternalId::new(id));
    }

    /// Make engine saves fail with `Unavailable` once `n` have succeeded.
    pub fn fail_saves_after(&self, n: usize) {
        self.inner().fail_after_saves = Some(n);
    }

    /// Clear injected failures.
    pub fn heal(&self) {
        let mut inner = self.inner();
        inner.rejected.clear();
        inner.fail_after_saves = None;
    }

    /// Successful engine saves so far.
    pub fn save_count(&self) -> usize {
        self.inner().saves
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn fetch_since(
        &self,
        scope: &SyncScope,
        since: Option<Timestamp>,
    ) -> Result<Vec<Entity>, StoreError> {
        Ok(self
            .entities(scope)
            .into_iter()
            .filter(|e| match since {
                None => true,
                Some(since) => e.updated_at.is_some_and(|u| u >= since),
            })
            .collect())
    }

    async fn fetch_existing(
        &self,
        scope: &SyncScope,
        ids: &[LocalId],
    ) -> Result<Vec<Entity>, StoreError> {
        let inner = self.inner();
        Ok(ids
            .iter()
            .filter_map(|id| inner.records.get(id))
            .filter(|(s, _)| s == scope)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn save(&self, scope: &SyncScope, entity: &Entity) -> Result<LocalId, StoreError> {
        let mut inner = self.inner();
        if inner.fail_after_saves.is_some_and(|n| inner.saves >= n) {
            return Err(StoreError::unavailable("disk full"));
        }
        if inner.rejected.contains(&entity.external_id) {
            return Err(StoreError::rejected(format!(
                "constraint violation on {}",
                entity.external_id
            )));
        }

        let id = entity
            .local_id
            .clone()
            .unwrap_or_else(|| LocalId::new(Uuid::new_v4().to_string()));
        let mut stored = entity.clone();
        stored.local_id = Some(id.clone());
        stored.dirty_fields.clear();
        inner.records.insert(id.clone(), (scope.clone(), stored));
        inner.saves += 1;
        Ok(id)
    }

    async fn remove(&self, _scope: &SyncScope, id: &LocalId) -> Result<(), StoreError> {
        let mut inner = self.inner();
        if inner.fail_after_saves.is_some_and(|n| inner.saves >= n) {
            return Err(StoreError::unavailable("disk full"));
        }
        if let Some((_, entity)) = inner.records.get(id) {
            if inner.rejected.contains(&entity.external_id) {
                return Err(StoreError::rejected(format!(
                    "{} is still referenced",
                    entity.external_id
                )));
            }
        }
        inner.records.remove(id);
        Ok(())
    }

    async fn changes_since(
        &self,
        scope: &SyncScope,
        marker: Option<Timestamp>,
    ) -> Result<ChangeLog, StoreError> {
        let inner = self.inner();
        let since = marker.unwrap_or(0);

        let log = inner
            .log
            .iter()
            .filter(|c| c.seq > since && &c.scope == scope)
            .map(|c| (c.local_id.clone(), c.kind.clone()));

        let mut delta = DeltaSet::new();
        for (id, change) in collapse_changes(log) {
            match change {
                // Already acknowledged by the remote: no longer an add
                LoggedChange::Added => match inner.records.get(&id) {
                    Some((_, entity)) if entity.external_id.is_unassigned() => {
                        delta.added.push(entity.clone())
                    }
                    Some((_, entity)) => delta.modified.push(entity.clone()),
                    None => {}
                },
                LoggedChange::Modified(fields) => {
                    if let Some((_, entity)) = inner.records.get(&id) {
                        let mut entity = entity.clone();
                        entity.dirty_fields = fields;
                        delta.modified.push(entity);
                    }
                }
                LoggedChange::Removed(external_id) => delta.removed.push(external_id),
            }
        }

        Ok(ChangeLog {
            delta,
            marker: inner.seq,
        })
    }
}

// ===========================================
// Checkpoint store
// ===========================================

#[derive(Debug, Default)]
struct CheckpointInner {
    bodies: BTreeMap<SyncScope, Vec<u8>>,
    pending: BTreeMap<SyncScope, BTreeMap<ExternalId, PendingAsset>>,
    commits: usize,
    fail_next_commit: Option<String>,
}

/// Checkpoint store held in memory.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<CheckpointInner>>,
}

impl Clone for MemoryCheckpointStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl MemoryCheckpointStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, CheckpointInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Committed checkpoint for `scope`, without pending assets.
    pub fn committed(&self, scope: &SyncScope) -> Option<SyncCheckpoint> {
        self.inner()
            .bodies
            .get(scope)
            .and_then(|b| SyncCheckpoint::from_bytes(b).ok())
    }

    /// Pending-asset rows for `scope`.
    pub fn pending(&self, scope: &SyncScope) -> BTreeMap<ExternalId, PendingAsset> {
        self.inner().pending.get(scope).cloned().unwrap_or_default()
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> usize {
        self.inner().commits
    }

    /// Overwrite the stored body with raw bytes.
    pub fn put_raw(&self, scope: &SyncScope, bytes: Vec<u8>) {
        self.inner().bodies.insert(scope.clone(), bytes);
    }

    /// Cause the next commit to fail.
    pub fn fail_next_commit(&self, error: &str) {
        self.inner().fail_next_commit = Some(error.to_string());
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, scope: &SyncScope) -> Result<Option<SyncCheckpoint>, SyncError> {
        let inner = self.inner();
        let pending = inner.pending.get(scope).cloned().unwrap_or_default();
        let mut checkpoint = match inner.bodies.get(scope) {
            Some(bytes) => SyncCheckpoint::from_bytes(bytes)?,
            None if pending.is_empty() => return Ok(None),
            None => SyncCheckpoint::new(),
        };
        checkpoint.pending_assets = pending;
        Ok(Some(checkpoint))
    }

    async fn commit(
        &self,
        scope: &SyncScope,
        checkpoint: &SyncCheckpoint,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner();
        if let Some(error) = inner.fail_next_commit.take() {
            return Err(SyncError::CheckpointStore(error));
        }
        let bytes = checkpoint.to_bytes()?;
        inner.bodies.insert(scope.clone(), bytes);
        inner.commits += 1;
        Ok(())
    }

    async fn purge(&self, scope: &SyncScope) -> Result<(), SyncError> {
        let mut inner = self.inner();
        inner.bodies.remove(scope);
        inner.pending.remove(scope);
        Ok(())
    }

    async fn upsert_pending_asset(
        &self,
        scope: &SyncScope,
        id: &ExternalId,
        pending: &PendingAsset,
    ) -> Result<(), SyncError> {
        self.inner()
            .pending
            .entry(scope.clone())
            .or_default()
            .insert(id.clone(), pending.clone());
        Ok(())
    }

    async fn remove_pending_asset(
        &self,
        scope: &SyncScope,
        id: &ExternalId,
    ) -> Result<(), SyncError> {
        if let Some(rows) = self.inner().pending.get_mut(scope) {
            rows.remove(id);
        }
        Ok(())
    }
}
