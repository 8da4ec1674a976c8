//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sync_types::SyncError;

/// Cancellation flag checked at every suspension point of a run.
///
/// Clones share the flag. Aborting never commits the checkpoint; the next
/// run resumes from the previous one.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    /// Fresh, un-fired signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once [`abort`](Self::abort) was called.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(SyncError::Cancelled)` once aborted.
    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_aborted() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}
