//! Remote and local delta computation.
//!
//! The remote delta compares a fresh fetch against the version map stored
//! in the last committed checkpoint. The local delta filters the local
//! store's change log down to what should be uploaded.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use sync_types::{DeltaSet, Entity, ExternalId, FieldSet, LocalId, VersionTag};

/// How a provider's fetch relates to the remote collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// Each fetch returns the whole collection; missing ids were deleted.
    #[default]
    Full,
    /// Each fetch returns changes since the last marker; only tombstones delete.
    Incremental,
}

/// Entities the orchestrator itself wrote during the current run.
///
/// They show up in the local change log but must not be echoed back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunEchoes {
    /// Local ids saved while applying the remote delta.
    pub saved: BTreeSet<LocalId>,
    /// External ids removed while applying the remote delta.
    pub removed: BTreeSet<ExternalId>,
}

impl RunEchoes {
    /// Nothing written yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `entity` was written by this run.
    pub fn contains(&self, entity: &Entity) -> bool {
        entity
            .local_id
            .as_ref()
            .is_some_and(|id| self.saved.contains(id))
    }
}

/// Computes delta sets. Pure and deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaEngine {
    mode: FetchMode,
}

impl DeltaEngine {
    /// Engine for the given fetch mode.
    pub fn new(mode: FetchMode) -> Self {
        Self { mode }
    }

    /// Fetch mode in use.
    pub fn mode(&self) -> FetchMode {
        self.mode
    }

    /// Diff `fresh` against `previous`.
    ///
    /// - absent from `previous` → added
    /// - present with a different version (tag or payload digest) → modified
    /// - in `previous` but not fetched → removed (full mode only)
    /// - any tombstone occurrence → removed, wherever it sits in the fetch
    ///
    /// When an id occurs more than once, the last occurrence wins. Output
    /// keeps first-occurrence order for added/modified; removed is sorted.
    pub fn remote_delta(
        &self,
        previous: &BTreeMap<ExternalId, VersionTag>,
        fresh: Vec<Entity>,
    ) -> DeltaSet {
        let mut order: Vec<ExternalId> = Vec::new();
        let mut latest: HashMap<ExternalId, Entity> = HashMap::new();
        let mut tombstoned: HashSet<ExternalId> = HashSet::new();

        for entity in fresh {
            if entity.external_id.is_unassigned() {
                continue;
            }
            if entity.deleted {
                tombstoned.insert(entity.external_id.clone());
            }
            if !latest.contains_key(&entity.external_id) {
                order.push(entity.external_id.clone());
            }
            latest.insert(entity.external_id.clone(), entity);
        }

        let mut delta = DeltaSet::new();
        let mut removed: BTreeSet<ExternalId> = tombstoned.iter().cloned().collect();

        for id in &order {
            if tombstoned.contains(id) {
                continue;
            }
            let Some(entity) = latest.remove(id) else {
                continue;
            };
            match previous.get(id) {
                None => delta.added.push(entity),
                Some(version) if *version != entity.effective_version() => {
                    delta.modified.push(entity)
                }
                Some(_) => {}
            }
        }

        if self.mode == FetchMode::Full {
            let visited: HashSet<&ExternalId> = order.iter().collect();
            removed.extend(
                previous
                    .keys()
                    .filter(|id| !visited.contains(id))
                    .cloned(),
            );
        }

        delta.removed = removed.into_iter().collect();
        delta
    }

    /// Filter the local change log down to uploadable changes.
    ///
    /// - modifications that only touched `ignored` fields are dropped
    /// - entities written by this run are dropped
    /// - removals of entities never uploaded are dropped
    /// - `ignored` fields are stripped from everything that remains
    pub fn local_delta(
        &self,
        changes: DeltaSet,
        ignored: &FieldSet,
        echoes: &RunEchoes,
    ) -> DeltaSet {
        let only_ignored = |entity: &Entity| {
            !entity.dirty_fields.is_empty() && entity.dirty_fields.is_subset(ignored)
        };

        let added = changes
            .added
            .into_iter()
            .filter(|e| !e.deleted && !echoes.contains(e))
            .map(|e| e.without_fields(ignored))
            .collect();

        let modified = changes
            .modified
            .into_iter()
            .filter(|e| !e.deleted && !echoes.contains(e) && !only_ignored(e))
            .map(|e| e.without_fields(ignored))
            .collect();

        let removed = changes
            .removed
            .into_iter()
            .filter(|id| !id.is_unassigned() && !echoes.removed.contains(id))
            .collect();

        DeltaSet {
            added,
            modified,
            removed,
        }
    }
}
