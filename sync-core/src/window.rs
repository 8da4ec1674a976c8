//! Sync window for newest-first early exit.

use sync_types::{Entity, Timestamp};

/// Oldest `updated_at` a run cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncWindow {
    oldest: Option<Timestamp>,
}

impl SyncWindow {
    /// No lower bound.
    pub fn unbounded() -> Self {
        Self { oldest: None }
    }

    /// Window covering the last `window_secs` seconds before `now`.
    pub fn trailing(now: Timestamp, window_secs: Option<u64>) -> Self {
        Self {
            oldest: window_secs.map(|secs| now.saturating_sub(secs as i64)),
        }
    }

    /// Lower bound, if any.
    pub fn oldest(&self) -> Option<Timestamp> {
        self.oldest
    }

    /// Entities without a timestamp are always admitted.
    pub fn admits(&self, entity: &Entity) -> bool {
        match (self.oldest, entity.updated_at) {
            (Some(oldest), Some(updated)) => updated >= oldest,
            _ => true,
        }
    }

    /// Keep items up to the first one outside the window.
    ///
    /// Pages arrive newest first, so everything after that item is older too.
    /// Returns the kept items and whether anything was cut.
    pub fn truncate(&self, items: Vec<Entity>) -> (Vec<Entity>, bool) {
        match items.iter().position(|e| !self.admits(e)) {
            Some(cut) => {
                let mut items = items;
                items.truncate(cut);
                (items, true)
            }
            None => (items, false),
        }
    }
}
