//! # sync-store
//!
//! SQLite persistence for socialsync.
//!
//! [`SqliteStore`] implements both store traits the engine needs:
//!
//! - [`CheckpointStore`](sync_client::CheckpointStore): one encoded checkpoint
//!   per (account, collection), plus per-key pending-asset rows
//! - [`LocalStore`](sync_client::LocalStore): the entity table and the change
//!   log of edits made by the application
//!
//! Engine writes go through the trait and are never logged; application
//! writes go through [`SqliteStore::insert_local`] and friends.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod checkpoint;
mod entities;
mod error;
mod sqlite;

pub use error::{StorageError, StorageResult};
pub use sqlite::{CheckpointSummary, SqliteStore};
