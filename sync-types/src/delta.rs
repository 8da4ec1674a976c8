//! Fetch and diff results.

use crate::entity::Entity;
use crate::ids::{ExternalId, SyncCursor};

/// One page returned by a paginated fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Records on this page, in provider order.
    pub items: Vec<T>,
    /// Continuation token; `None` or empty means exhausted.
    pub next_cursor: Option<SyncCursor>,
}

impl<T> Page<T> {
    /// Last page.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }

    /// Page followed by `cursor`.
    pub fn with_next(items: Vec<T>, cursor: impl Into<String>) -> Self {
        Self {
            items,
            next_cursor: Some(SyncCursor::new(cursor)),
        }
    }
}

/// Three disjoint change lists keyed by external id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaSet {
    /// Entities new since the baseline.
    pub added: Vec<Entity>,
    /// Entities whose version moved since the baseline.
    pub modified: Vec<Entity>,
    /// Entities gone since the baseline.
    pub removed: Vec<ExternalId>,
}

impl DeltaSet {
    /// Empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Total number of changes.
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    /// External ids of added entities, in order.
    pub fn added_ids(&self) -> Vec<&ExternalId> {
        self.added.iter().map(|e| &e.external_id).collect()
    }

    /// External ids of modified entities, in order.
    pub fn modified_ids(&self) -> Vec<&ExternalId> {
        self.modified.iter().map(|e| &e.external_id).collect()
    }
}
