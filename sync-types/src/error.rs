//! Error taxonomy for socialsync.
//!
//! Errors split into two tiers. Entity-level errors ([`StoreError::Rejected`],
//! [`DownloadError`]) are contained: the affected record is skipped and the run
//! continues. Every other variant is run-level and aborts the run without
//! committing the checkpoint.

use thiserror::Error;

/// Errors reported by a local store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store refused this one entity (constraint, validation).
    #[error("entity rejected: {reason}")]
    Rejected {
        /// Store-specific reason.
        reason: String,
    },

    /// The store itself is unusable (disk, connection, schema).
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Store-specific reason.
        reason: String,
    },
}

impl StoreError {
    /// Shorthand for [`StoreError::Rejected`].
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`StoreError::Unavailable`].
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Errors from the asset side channel. Never fail a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    /// Remote answered with a non-success status.
    #[error("asset download returned HTTP {0}")]
    Status(u16),

    /// Network failure.
    #[error("asset download failed: {0}")]
    Network(String),

    /// Could not write the downloaded file.
    #[error("asset write failed: {0}")]
    Io(String),
}

/// Errors that can occur in socialsync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Token missing, expired or refused.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network failure or rate limit. The run aborts; the next scheduled run retries.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The provider returned something we cannot interpret.
    #[error("provider data error: {0}")]
    ProviderData(String),

    /// The provider no longer accepts our sync marker; a full resync is needed.
    #[error("full resync required: {0}")]
    ResyncRequired(String),

    /// Local store failure.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    /// Asset download failure.
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Checkpoint persistence failure.
    #[error("checkpoint store error: {0}")]
    CheckpointStore(String),

    /// MessagePack encoding of a checkpoint failed.
    #[error("checkpoint encoding failed: {0}")]
    CheckpointEncode(#[source] rmp_serde::encode::Error),

    /// MessagePack decoding of a checkpoint failed.
    #[error("checkpoint decoding failed: {0}")]
    CheckpointDecode(#[source] rmp_serde::decode::Error),

    /// Checkpoint written by an unknown schema.
    #[error("unsupported checkpoint schema version: {0}")]
    UnsupportedCheckpoint(u8),

    /// Another run for the same (account, collection) is in flight.
    #[error("sync already running for {account}/{collection}")]
    Busy {
        /// Account of the in-flight run.
        account: String,
        /// Collection of the in-flight run.
        collection: String,
    },

    /// The abort signal fired.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Errors the next scheduled run may clear on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Busy { .. })
    }

    /// Errors that only affect a single entity or asset.
    pub fn is_entity_level(&self) -> bool {
        matches!(
            self,
            SyncError::Store(StoreError::Rejected { .. }) | SyncError::Download(_)
        )
    }

    /// Errors that take the re-authentication path.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }

    /// Errors after which the stored checkpoint must be purged.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            SyncError::ResyncRequired(_)
                | SyncError::CheckpointDecode(_)
                | SyncError::UnsupportedCheckpoint(_)
        )
    }
}
