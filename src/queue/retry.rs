//! Retry queue — failover bookkeeping for segments that have failed on
//! some pools
//!
//! Requeued segments are partitioned into buckets keyed by the set of pools
//! that have already failed them, represented as a bitmask over pool indices.
//! A pool looking for retry work only inspects buckets whose mask excludes its
//! own bit, so it never re-attempts a segment it has already failed. Buckets
//! are created lazily on first insert; for P pools at most 2^P−1 masks can
//! ever occur, but in practice only a handful materialize.

use super::QueuedSegment;
use crate::types::PoolId;
use std::collections::BinaryHeap;
use std::collections::HashMap;

#[derive(Debug)]
pub(crate) struct RetryQueue {
    buckets: HashMap<u32, BinaryHeap<QueuedSegment>>,
    len: usize,
}

impl RetryQueue {
    pub(crate) fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            len: 0,
        }
    }

    /// Insert a segment under the bucket for its failed-pool mask.
    ///
    /// `failed_mask` must be non-zero; segments with no failures belong in
    /// the main queue.
    pub(crate) fn push(&mut self, failed_mask: u32, entry: QueuedSegment) {
        debug_assert!(failed_mask != 0, "retry entries must have failures");
        self.buckets.entry(failed_mask).or_default().push(entry);
        self.len += 1;
    }

    /// Pop the best-priority segment eligible for `pool` (i.e. from any bucket
    /// whose mask excludes the pool's bit). Priority order is the same as the
    /// main queue's, so within-file sequencing survives failover.
    pub(crate) fn pop_for_pool(&mut self, pool: PoolId) -> Option<QueuedSegment> {
        let best_mask = self
            .buckets
            .iter()
            .filter(|(mask, bucket)| (*mask & pool.bit()) == 0 && !bucket.is_empty())
            .max_by(|(_, a), (_, b)| {
                // QueuedSegment's Ord is reversed for min-heap use, so the
                // "max" peek is the lowest-priority-value entry
                a.peek().cmp(&b.peek())
            })
            .map(|(mask, _)| *mask)?;

        let bucket = self.buckets.get_mut(&best_mask)?;
        let entry = bucket.pop()?;
        self.len -= 1;
        if bucket.is_empty() {
            self.buckets.remove(&best_mask);
        }
        Some(entry)
    }

    /// Whether any bucket holds work eligible for `pool`
    #[cfg(test)]
    pub(crate) fn has_work_for_pool(&self, pool: PoolId) -> bool {
        self.buckets
            .iter()
            .any(|(mask, bucket)| (*mask & pool.bit()) == 0 && !bucket.is_empty())
    }

    /// Total entries across all buckets
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Drop entries the filter rejects (stale entries of canceled archives or
    /// already-decoded segments) and discard emptied buckets
    pub(crate) fn retain_live(&mut self, mut live: impl FnMut(&QueuedSegment) -> bool) {
        self.buckets.retain(|_, bucket| {
            bucket.retain(|entry| live(entry));
            !bucket.is_empty()
        });
        self.len = self.buckets.values().map(BinaryHeap::len).sum();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop all entries (archive cancellation rebuilds from the arena)
    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }
}
