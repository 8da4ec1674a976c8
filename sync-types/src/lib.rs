//! # sync-types
//!
//! Data model shared by every socialsync crate.
//!
//! - [`AccountId`], [`CollectionType`], [`ExternalId`], [`LocalId`], [`VersionTag`],
//!   [`SyncCursor`] - identity and ordering types
//! - [`Entity`] - a remote-sourced record and its payload
//! - [`DeltaSet`], [`Page`] - fetch and diff results
//! - [`SyncCheckpoint`] - durable per-(account, collection) sync state
//! - [`SyncError`] - error taxonomy (auth, transient, provider data, store, download)

#![warn(missing_docs)]
#![warn(clippy::all)]

mod checkpoint;
mod delta;
mod entity;
mod error;
mod ids;

pub use checkpoint::{PendingAsset, RemoteMarker, SyncCheckpoint, CHECKPOINT_SCHEMA_VERSION};
pub use delta::{DeltaSet, Page};
pub use entity::{AssetRef, Entity, FieldSet, Payload, Timestamp};
pub use error::{DownloadError, StoreError, SyncError};
pub use ids::{
    AccountId, CollectionType, ExternalId, FieldTag, LocalId, NamespacedKey, SyncCursor,
    SyncScope, UnknownCollection, VersionTag,
};
