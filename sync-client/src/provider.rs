//! Provider capability trait.
//!
//! A provider knows one remote API for one collection: how to ask for a page,
//! how to read one, how to turn a raw record into an [`Entity`], and, if the
//! API is writable, how to push a batch of local changes. Everything else
//! (paging, diffing, retries, checkpoints) lives in the engine.

use crate::auth::AccessToken;
use crate::transport::HttpRequest;
use sync_core::{ConflictResolver, FetchMode, UploadBatch};
use sync_types::{
    AccountId, CollectionType, Entity, ExternalId, FieldSet, LocalId, Page, RemoteMarker,
    SyncCursor, SyncError, VersionTag,
};

/// One record as the remote API returned it.
pub type RawRecord = serde_json::Value;

/// Per-request context handed to providers.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    /// Account being synced.
    pub account: &'a AccountId,
    /// Current access token.
    pub token: &'a AccessToken,
    /// Marker from the last committed run, if any.
    pub since: Option<&'a RemoteMarker>,
}

/// A parsed page of raw records.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePage {
    /// Records and continuation cursor.
    pub page: Page<RawRecord>,
    /// Sync token the provider issued for the next incremental fetch.
    pub sync_token: Option<String>,
}

/// Remote acknowledgement of one uploaded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAck {
    /// Local id of a created entity.
    pub local_id: Option<LocalId>,
    /// Remote id, assigned by the remote for creates.
    pub external_id: ExternalId,
    /// New remote version, if the API returns one.
    pub version_tag: Option<VersionTag>,
}

/// One remote collection API.
pub trait Provider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Collection this provider syncs.
    fn collection(&self) -> CollectionType;

    /// Whether a fetch returns the whole collection or only changes.
    fn fetch_mode(&self) -> FetchMode {
        FetchMode::Full
    }

    /// Request for the page after `cursor` (first page when `None`).
    fn page_request(
        &self,
        ctx: &RequestContext<'_>,
        cursor: Option<&SyncCursor>,
    ) -> Result<HttpRequest, SyncError>;

    /// Parse a 2xx page body. Fails with [`SyncError::ProviderData`] when the
    /// page as a whole is unreadable.
    fn parse_page(&self, body: &[u8]) -> Result<RemotePage, SyncError>;

    /// Map one raw record. A failure skips only that record.
    fn map_to_entity(&self, raw: &RawRecord) -> Result<Entity, SyncError>;

    /// False for read-only APIs; the upload phase is then skipped.
    fn supports_upload(&self) -> bool {
        false
    }

    /// Preferred upload batch size, overriding the engine default.
    fn upload_batch_size(&self) -> Option<usize> {
        None
    }

    /// Request pushing one batch.
    fn upload_request(
        &self,
        _ctx: &RequestContext<'_>,
        _batch: &UploadBatch,
    ) -> Result<HttpRequest, SyncError> {
        Err(SyncError::ProviderData(format!(
            "{} does not accept uploads",
            self.name()
        )))
    }

    /// Parse the 2xx body of an upload response.
    fn parse_upload_acks(&self, _body: &[u8]) -> Result<Vec<UploadAck>, SyncError> {
        Ok(Vec::new())
    }

    /// Resolver for entities that exist on both sides.
    fn conflict_resolver(&self, ignored_fields: FieldSet) -> ConflictResolver {
        ConflictResolver::new(ignored_fields)
    }
}
