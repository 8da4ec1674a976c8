//! # sync-core
//!
//! Pure logic for socialsync (no I/O, instant tests).
//!
//! This crate implements the algorithms and state machines of a sync run
//! without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (HTTP, local store, checkpoint persistence) is performed by
//! `sync-client`, which interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod asset;
pub mod buffer;
pub mod conflict;
pub mod cursor;
pub mod delta;
pub mod state;
pub mod window;

pub use asset::{AssetAction, AssetEvent, AssetPolicy, AssetState};
pub use buffer::{QueueError, UploadBatch, UploadOp, UploadQueue};
pub use conflict::{ConflictPolicy, ConflictResolver};
pub use cursor::{Exhaustion, PageCursor, PageStep};
pub use delta::{DeltaEngine, FetchMode, RunEchoes};
pub use state::{PhaseAction, PhaseEvent, SyncEvent, SyncPhase};
pub use window::SyncWindow;
