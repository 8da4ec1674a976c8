//! # sync-client
//!
//! Async sync engine for socialsync adaptors.
//!
//! This is the library an adaptor embeds: it pages through a remote
//! collection, diffs it against the last checkpoint, applies the delta to
//! the local store, uploads local edits, downloads referenced assets and
//! commits the new checkpoint.
//!
//! ## Features
//!
//! - **Pure State Machine**: phase and asset logic come from sync-core
//! - **Provider Trait**: one small trait per remote API, plus a generic JSON feed
//! - **Transport Abstraction**: pluggable HTTP layer (reqwest, mock)
//! - **Atomic Checkpoints**: nothing is committed unless the whole run succeeds
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{AbortSignal, EngineConfig, JsonFeedProvider, SyncOrchestrator};
//!
//! let orchestrator = SyncOrchestrator::new(config, auth, transport, local, checkpoints, fetcher);
//! let provider = JsonFeedProvider::new(settings);
//!
//! let report = orchestrator.sync(&account, &provider, &AbortSignal::new()).await?;
//! println!("+{} ~{} -{}", report.remote_added, report.remote_modified, report.remote_removed);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod abort;
pub mod assets;
pub mod auth;
pub mod config;
pub mod feed;
pub mod memory;
pub mod orchestrator;
pub mod pager;
pub mod provider;
pub mod store;
pub mod transport;

pub use abort::AbortSignal;
pub use assets::{AssetFetcher, AssetReconciler, AssetReport, HttpAssetFetcher};
pub use auth::{AccessToken, AuthProvider, CachedTokenProvider, StaticTokenProvider};
pub use config::{ConfigError, EngineConfig};
pub use feed::{FeedSettings, JsonFeedProvider};
pub use memory::{MemoryCheckpointStore, MemoryLocalStore};
pub use orchestrator::{ScopedEvent, SyncOrchestrator, SyncReport};
pub use pager::{FetchOutcome, FetchedPage, RemotePager};
pub use provider::{Provider, RawRecord, RemotePage, RequestContext, UploadAck};
pub use store::{collapse_changes, ChangeLog, CheckpointStore, LocalStore, LoggedChange};
pub use transport::{
    classify_status, HttpRequest, HttpResponse, Method, MockTransport, ReqwestTransport,
    Transport, TransportError, DEFAULT_REQUEST_TIMEOUT,
};
