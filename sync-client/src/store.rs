//! Local persistence seams.
//!
//! [`LocalStore`] is the host application's entity database.
//! [`CheckpointStore`] keeps one [`SyncCheckpoint`] per (account, collection)
//! plus the pending-asset rows the asset side channel writes as it goes.

use async_trait::async_trait;
use std::collections::HashMap;
use sync_types::{
    DeltaSet, Entity, ExternalId, FieldSet, LocalId, PendingAsset, StoreError, SyncCheckpoint,
    SyncError, SyncScope, Timestamp,
};

/// Local changes since a marker, and the marker they bring the caller up to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeLog {
    /// Local adds, edits and deletes. Added entities carry no external id.
    pub delta: DeltaSet,
    /// Marker to pass to the next `changes_since` call.
    pub marker: Timestamp,
}

/// One application edit, as a change log records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggedChange {
    /// Entity created.
    Added,
    /// These fields changed (empty when unknown).
    Modified(FieldSet),
    /// Entity deleted; carries its remote id, if it had one.
    Removed(ExternalId),
}

/// Collapse an ordered change log to one net change per entity.
///
/// Entities keep the position of their first change. Add then delete
/// cancels out and add then edit stays an add. Edits union their fields.
/// Any other change followed by a delete is a delete.
pub fn collapse_changes<I>(log: I) -> Vec<(LocalId, LoggedChange)>
where
    I: IntoIterator<Item = (LocalId, LoggedChange)>,
{
    let mut order: Vec<LocalId> = Vec::new();
    let mut net: HashMap<LocalId, Option<LoggedChange>> = HashMap::new();

    for (local_id, change) in log {
        let merged = match (net.remove(&local_id), change) {
            (None, change) => {
                order.push(local_id.clone());
                Some(change)
            }
            // Created and deleted since the marker: nothing to report
            (Some(None), _) => None,
            (Some(Some(LoggedChange::Added)), LoggedChange::Removed(_)) => None,
            (Some(Some(LoggedChange::Added)), _) => Some(LoggedChange::Added),
            (Some(Some(LoggedChange::Modified(mut a))), LoggedChange::Modified(b)) => {
                // An empty set means "unknown" and absorbs the other
                if a.is_empty() || b.is_empty() {
                    a.clear();
                } else {
                    a.extend(b);
                }
                Some(LoggedChange::Modified(a))
            }
            (Some(Some(_)), change) => Some(change),
        };
        net.insert(local_id, merged);
    }

    order
        .into_iter()
        .filter_map(|id| net.remove(&id).flatten().map(|change| (id, change)))
        .collect()
}

/// The host application's entity database.
///
/// Writes made through `save` and `remove` come from the sync engine and must
/// not be reported by `changes_since`; only edits the application makes on
/// its own belong in the change log.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Entities of `scope` updated at or after `since` (all when `None`).
    async fn fetch_since(
        &self,
        scope: &SyncScope,
        since: Option<Timestamp>,
    ) -> Result<Vec<Entity>, StoreError>;

    /// Current local state of the given entities. Unknown ids are omitted.
    async fn fetch_existing(
        &self,
        scope: &SyncScope,
        ids: &[LocalId],
    ) -> Result<Vec<Entity>, StoreError>;

    /// Insert or update. Returns the entity's local id, assigning one on insert.
    async fn save(&self, scope: &SyncScope, entity: &Entity) -> Result<LocalId, StoreError>;

    /// Delete by local id. Deleting an unknown id succeeds.
    async fn remove(&self, scope: &SyncScope, id: &LocalId) -> Result<(), StoreError>;

    /// Application edits after `marker` (all when `None`).
    async fn changes_since(
        &self,
        scope: &SyncScope,
        marker: Option<Timestamp>,
    ) -> Result<ChangeLog, StoreError>;
}

/// Durable checkpoint storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Stored checkpoint with its pending assets, or `None` on first run.
    ///
    /// An unreadable body fails with an error for which
    /// [`SyncError::requires_resync`] is true.
    async fn load(&self, scope: &SyncScope) -> Result<Option<SyncCheckpoint>, SyncError>;

    /// Atomically replace everything except the pending-asset rows.
    async fn commit(&self, scope: &SyncScope, checkpoint: &SyncCheckpoint) -> Result<(), SyncError>;

    /// Drop the checkpoint and its pending-asset rows.
    async fn purge(&self, scope: &SyncScope) -> Result<(), SyncError>;

    /// Insert or update one pending-asset row.
    async fn upsert_pending_asset(
        &self,
        scope: &SyncScope,
        id: &ExternalId,
        pending: &PendingAsset,
    ) -> Result<(), SyncError>;

    /// Delete one pending-asset row. Missing rows are fine.
    async fn remove_pending_asset(
        &self,
        scope: &SyncScope,
        id: &ExternalId,
    ) -> Result<(), SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::FieldTag;

    fn id(s: &str) -> LocalId {
        LocalId::new(s)
    }

    fn fields(names: &[&str]) -> FieldSet {
        names.iter().map(|n| FieldTag::from(*n)).collect()
    }

    // ===========================================
    // Change collapse
    // ===========================================

    #[test]
    fn add_then_delete_cancels() {
        let out = collapse_changes(vec![
            (id("a"), LoggedChange::Added),
            (id("a"), LoggedChange::Removed(ExternalId::unassigned())),
        ]);
        assert!(out.is_empty());
    }

    #[test]
    fn add_then_edit_stays_add() {
        let out = collapse_changes(vec![
            (id("a"), LoggedChange::Added),
            (id("a"), LoggedChange::Modified(fields(&["name"]))),
        ]);
        assert_eq!(out, vec![(id("a"), LoggedChange::Added)]);
    }

    #[test]
    fn edits_union_fields_in_first_seen_order() {
        let out = collapse_changes(vec![
            (id("b"), LoggedChange::Modified(fields(&["name"]))),
            (id("a"), LoggedChange::Added),
            (id("b"), LoggedChange::Modified(fields(&["email"]))),
        ]);
        assert_eq!(
            out,
            vec![
                (id("b"), LoggedChange::Modified(fields(&["email", "name"]))),
                (id("a"), LoggedChange::Added),
            ]
        );
    }

    #[test]
    fn unknown_fields_absorb_known_ones() {
        let out = collapse_changes(vec![
            (id("a"), LoggedChange::Modified(fields(&["name"]))),
            (id("a"), LoggedChange::Modified(FieldSet::new())),
        ]);
        assert_eq!(out, vec![(id("a"), LoggedChange::Modified(FieldSet::new()))]);
    }

    #[test]
    fn edit_then_delete_is_delete() {
        let out = collapse_changes(vec![
            (id("a"), LoggedChange::Modified(fields(&["name"]))),
            (id("a"), LoggedChange::Removed(ExternalId::new("7"))),
        ]);
        assert_eq!(out, vec![(id("a"), LoggedChange::Removed(ExternalId::new("7")))]);
    }
}
