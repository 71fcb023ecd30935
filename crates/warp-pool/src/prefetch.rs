//! Prefetch queue

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::TensorId;

/// Priority of pipeline look-ahead items; above any predicted item
pub const SEQUENTIAL_PRIORITY: u32 = 200;

/// Why a tensor was queued
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PrefetchReason {
    /// Co-access prediction after a read
    Predicted {
        /// Predictor confidence
        confidence: f64,
    },
    /// Look-ahead of a sequential pipeline
    Sequential {
        /// Step index being prefetched
        step: usize,
    },
    /// Requested by the caller
    Manual,
}

/// A queued prefetch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrefetchItem {
    /// Tensor to bring local
    pub tensor_id: TensorId,
    /// Higher runs first
    pub priority: u32,
    /// Source of the request
    pub reason: PrefetchReason,
}

impl PrefetchItem {
    /// Item for a co-access prediction; priority scales with confidence
    pub fn predicted(tensor_id: TensorId, confidence: f64) -> Self {
        Self {
            tensor_id,
            priority: (confidence.clamp(0.0, 1.0) * 100.0) as u32,
            reason: PrefetchReason::Predicted { confidence },
        }
    }

    /// Item for a step a sequential run will reach soon
    pub fn sequential(tensor_id: TensorId, step: usize) -> Self {
        Self {
            tensor_id,
            priority: SEQUENTIAL_PRIORITY,
            reason: PrefetchReason::Sequential { step },
        }
    }
}

impl Eq for PrefetchItem {}

impl Ord for PrefetchItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority.cmp(&other.priority)
    }
}

impl PartialOrd for PrefetchItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Bounded priority queue of tensors to bring local
pub struct Prefetcher {
    queue: Mutex<BinaryHeap<PrefetchItem>>,
    capacity: usize,
    enqueued: AtomicU64,
    merged: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

impl Prefetcher {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::with_capacity(capacity)),
            capacity: capacity.max(1),
            enqueued: AtomicU64::new(0),
            merged: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Queue an item; returns whether it is now queued
    ///
    /// A tensor already queued keeps the higher of the two priorities. When
    /// full, the lowest-priority item makes room only for a higher newcomer.
    pub fn enqueue(&self, item: PrefetchItem) -> bool {
        let mut queue = self.queue.lock();

        if let Some(existing) = queue.iter().find(|i| i.tensor_id == item.tensor_id).copied() {
            self.merged.fetch_add(1, Ordering::Relaxed);
            if item.priority > existing.priority {
                queue.retain(|i| i.tensor_id != item.tensor_id);
                queue.push(item);
            }
            return true;
        }

        if queue.len() >= self.capacity {
            let lowest = queue.iter().min().copied();
            match lowest {
                Some(low) if item.priority > low.priority => {
                    queue.retain(|i| i.tensor_id != low.tensor_id);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
        }

        queue.push(item);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Pop up to `max` items, highest priority first
    pub fn pop_batch(&self, max: usize) -> Vec<PrefetchItem> {
        let mut queue = self.queue.lock();
        let n = max.min(queue.len());
        (0..n).filter_map(|_| queue.pop()).collect()
    }

    /// Forget a tensor (freed or reclaimed)
    pub fn remove(&self, tensor: TensorId) {
        self.queue.lock().retain(|i| i.tensor_id != tensor);
    }

    /// Queued items
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items accepted as new entries
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Newcomers refused because the queue was full
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Items displaced by higher-priority newcomers
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: TensorId, priority: u32) -> PrefetchItem {
        PrefetchItem {
            tensor_id: id,
            priority,
            reason: PrefetchReason::Manual,
        }
    }

    #[test]
    fn test_priority_order() {
        let q = Prefetcher::new(8);
        let ids: Vec<TensorId> = (0..3).map(|_| TensorId::new()).collect();
        q.enqueue(item(ids[0], 10));
        q.enqueue(item(ids[1], 90));
        q.enqueue(item(ids[2], 50));

        let batch = q.pop_batch(2);
        assert_eq!(batch[0].tensor_id, ids[1]);
        assert_eq!(batch[1].tensor_id, ids[2]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_sequential_outranks_predictions() {
        let q = Prefetcher::new(8);
        let predicted = TensorId::new();
        let ahead = TensorId::new();
        q.enqueue(PrefetchItem::predicted(predicted, 1.0));
        q.enqueue(PrefetchItem::sequential(ahead, 7));

        let first = q.pop_batch(1)[0];
        assert_eq!(first.tensor_id, ahead);
        assert_eq!(first.reason, PrefetchReason::Sequential { step: 7 });
    }

    #[test]
    fn test_duplicates_merge_to_max() {
        let q = Prefetcher::new(8);
        let id = TensorId::new();
        q.enqueue(item(id, 10));
        q.enqueue(item(id, 70));
        q.enqueue(item(id, 30));

        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_batch(1)[0].priority, 70);
    }

    #[test]
    fn test_full_queue_drops_lowest_or_rejects() {
        let q = Prefetcher::new(2);
        let (a, b, c, d) = (TensorId::new(), TensorId::new(), TensorId::new(), TensorId::new());
        q.enqueue(item(a, 10));
        q.enqueue(item(b, 20));

        assert!(!q.enqueue(item(c, 5)));
        assert_eq!(q.rejected(), 1);

        assert!(q.enqueue(item(d, 30)));
        assert_eq!(q.dropped(), 1);

        let ids: Vec<TensorId> = q.pop_batch(10).into_iter().map(|i| i.tensor_id).collect();
        assert_eq!(ids, vec![d, b]);
    }

    #[test]
    fn test_predicted_priority() {
        let id = TensorId::new();
        assert_eq!(PrefetchItem::predicted(id, 0.75).priority, 75);
        assert_eq!(PrefetchItem::predicted(id, 3.0).priority, 100);
    }

    #[test]
    fn test_remove() {
        let q = Prefetcher::new(4);
        let id = TensorId::new();
        q.enqueue(item(id, 1));
        q.remove(id);
        assert!(q.is_empty());
    }
}
