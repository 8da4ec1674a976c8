//! Upload queue for local changes.
//!
//! Local changes flow through the queue in bounded batches:
//! 1. `enqueue_delta()` - add a local delta as operations
//! 2. `dequeue_batch()` - take up to `batch_size` operations
//!
//! A failed batch aborts the run, so nothing is ever put back.

use std::collections::VecDeque;
use sync_types::{DeltaSet, Entity, ExternalId, StoreError, SyncError};
use thiserror::Error;

/// Error type for queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// A locally added entity has no local id to match its acknowledgement.
    #[error("local add without a local id (payload fields: {fields})")]
    MissingLocalId {
        /// Number of payload fields, to help find the record.
        fields: usize,
    },
}

impl From<QueueError> for SyncError {
    fn from(err: QueueError) -> Self {
        SyncError::Store(StoreError::unavailable(err.to_string()))
    }
}

/// One local change to push.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOp {
    /// Create a locally added entity.
    Create(Entity),
    /// Update an entity the remote already knows.
    Update(Entity),
    /// Delete an entity on the remote.
    Delete(ExternalId),
}

impl UploadOp {
    /// Entity carried by create/update operations.
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            UploadOp::Create(e) | UploadOp::Update(e) => Some(e),
            UploadOp::Delete(_) => None,
        }
    }
}

/// A batch handed to the uploader.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadBatch {
    /// Queue-assigned id, increasing from 1.
    pub id: u64,
    /// Operations in delta order.
    pub ops: Vec<UploadOp>,
}

/// Batching queue over one run's local delta.
#[derive(Debug)]
pub struct UploadQueue {
    /// Maximum operations per batch.
    batch_size: usize,
    /// Operations waiting to be sent.
    queue: VecDeque<UploadOp>,
    next_id: u64,
}

impl UploadQueue {
    /// Create a queue. A zero `batch_size` is treated as one.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            queue: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Queue a local delta: creates, then updates, then deletes.
    ///
    /// Returns the number of operations queued. Nothing is queued when an
    /// add lacks a local id.
    pub fn enqueue_delta(&mut self, delta: DeltaSet) -> Result<usize, QueueError> {
        if let Some(orphan) = delta.added.iter().find(|e| e.local_id.is_none()) {
            return Err(QueueError::MissingLocalId {
                fields: orphan.payload.len(),
            });
        }
        let ops: Vec<UploadOp> = delta
            .added
            .into_iter()
            .map(UploadOp::Create)
            .chain(delta.modified.into_iter().map(UploadOp::Update))
            .chain(delta.removed.into_iter().map(UploadOp::Delete))
            .collect();
        let count = ops.len();
        self.queue.extend(ops);
        Ok(count)
    }

    /// Take the next batch.
    pub fn dequeue_batch(&mut self) -> Option<UploadBatch> {
        if self.queue.is_empty() {
            return None;
        }
        let take = self.batch_size.min(self.queue.len());
        let batch = UploadBatch {
            id: self.next_id,
            ops: self.queue.drain(..take).collect(),
        };
        self.next_id += 1;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creates(n: usize) -> DeltaSet {
        DeltaSet {
            added: (0..n)
                .map(|i| Entity::new(ExternalId::unassigned()).with_local_id(format!("l{}", i)))
                .collect(),
            ..DeltaSet::new()
        }
    }

    #[test]
    fn batches_are_bounded() {
        let mut queue = UploadQueue::new(2);
        assert_eq!(queue.enqueue_delta(creates(5)).unwrap(), 5);

        let batches: Vec<UploadBatch> = std::iter::from_fn(|| queue.dequeue_batch()).collect();

        let sizes: Vec<usize> = batches.iter().map(|b| b.ops.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let ids: Vec<u64> = batches.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn delta_order_is_creates_updates_deletes() {
        let mut queue = UploadQueue::new(10);
        let delta = DeltaSet {
            added: vec![Entity::new(ExternalId::unassigned()).with_local_id("new")],
            modified: vec![Entity::new("m").with_local_id("mod")],
            removed: vec![ExternalId::new("gone")],
        };

        assert_eq!(queue.enqueue_delta(delta).unwrap(), 3);
        let batch = queue.dequeue_batch().unwrap();

        assert!(matches!(batch.ops[0], UploadOp::Create(_)));
        assert!(matches!(batch.ops[1], UploadOp::Update(_)));
        assert!(matches!(batch.ops[2], UploadOp::Delete(_)));
        assert!(queue.dequeue_batch().is_none());
    }

    #[test]
    fn add_without_local_id_queues_nothing() {
        let mut queue = UploadQueue::new(10);
        let delta = DeltaSet {
            added: vec![Entity::new(ExternalId::unassigned())],
            removed: vec![ExternalId::new("gone")],
            ..DeltaSet::new()
        };

        assert_eq!(
            queue.enqueue_delta(delta),
            Err(QueueError::MissingLocalId { fields: 0 })
        );
        assert!(queue.dequeue_batch().is_none());
    }

    #[test]
    fn queue_errors_fail_the_run() {
        let err: SyncError = QueueError::MissingLocalId { fields: 2 }.into();
        assert!(!err.is_entity_level());
    }

    #[test]
    fn dequeue_returns_none_when_empty() {
        let mut queue = UploadQueue::new(2);
        assert!(queue.dequeue_batch().is_none());
    }

    #[test]
    fn zero_batch_size_still_makes_progress() {
        let mut queue = UploadQueue::new(0);
        queue.enqueue_delta(creates(1)).unwrap();
        assert_eq!(queue.dequeue_batch().unwrap().ops.len(), 1);
    }
}
