//! Durable per-(account, collection) sync state.

use crate::entity::Timestamp;
use crate::error::SyncError;
use crate::ids::{ExternalId, LocalId, VersionTag};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Schema version written in front of every encoded checkpoint.
pub const CHECKPOINT_SCHEMA_VERSION: u8 = 1;

/// Marks the last successfully applied remote state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteMarker {
    /// Remote changes up to this time have been applied.
    Timestamp(Timestamp),
    /// Provider-issued sync token.
    Token(String),
}

/// An asset download still outstanding for an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAsset {
    /// Remote URL.
    pub url: String,
    /// Download attempts made so far, across runs.
    pub attempts: u32,
}

/// Checkpoint for one (account, collection) pair.
///
/// Read when a run starts, mutated in memory, and persisted only after a
/// fully successful run. `pending_assets` is owned by the asset side channel
/// and written per key; the other fields are written together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    /// Last applied remote state. `None` forces a full resync.
    pub remote_since: Option<RemoteMarker>,
    /// Last uploaded local state.
    pub local_since: Option<Timestamp>,
    /// externalId -> localId.
    pub id_map: BTreeMap<ExternalId, LocalId>,
    /// externalId -> last applied version (etag or payload digest).
    pub version_map: BTreeMap<ExternalId, VersionTag>,
    /// externalId -> outstanding asset download.
    #[serde(skip)]
    pub pending_assets: BTreeMap<ExternalId, PendingAsset>,
    /// Remote removals the local store refused; retried every run.
    #[serde(default)]
    pub pending_removals: BTreeSet<ExternalId>,
}

impl SyncCheckpoint {
    /// Empty checkpoint (first run).
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing has ever been committed.
    pub fn is_first_run(&self) -> bool {
        self.remote_since.is_none()
    }

    /// Remote snapshot to diff a fresh fetch against.
    pub fn previous_snapshot(&self) -> &BTreeMap<ExternalId, VersionTag> {
        &self.version_map
    }

    /// Local id mapped to an external id.
    pub fn local_id(&self, external_id: &ExternalId) -> Option<&LocalId> {
        self.id_map.get(external_id)
    }

    /// Record a successful save.
    pub fn record_applied(
        &mut self,
        external_id: ExternalId,
        local_id: LocalId,
        version: VersionTag,
    ) {
        self.version_map.insert(external_id.clone(), version);
        self.id_map.insert(external_id, local_id);
    }

    /// Forget an entity entirely.
    pub fn forget(&mut self, external_id: &ExternalId) {
        self.id_map.remove(external_id);
        self.version_map.remove(external_id);
        self.pending_assets.remove(external_id);
        self.pending_removals.remove(external_id);
    }

    /// Encode everything except `pending_assets` as MessagePack, prefixed by
    /// the schema version.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        let body = rmp_serde::to_vec(self).map_err(SyncError::CheckpointEncode)?;
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(CHECKPOINT_SCHEMA_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode a checkpoint written by [`SyncCheckpoint::to_bytes`].
    ///
    /// `pending_assets` comes back empty; callers load it separately.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        match bytes.split_first() {
            Some((&CHECKPOINT_SCHEMA_VERSION, body)) => {
                rmp_serde::from_slice(body).map_err(SyncError::CheckpointDecode)
            }
            Some((&version, _)) => Err(SyncError::UnsupportedCheckpoint(version)),
            None => Err(SyncError::UnsupportedCheckpoint(0)),
        }
    }
}
