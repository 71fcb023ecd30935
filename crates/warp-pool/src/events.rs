//! Pool events for observers (dashboards, tests)

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::prefetch::PrefetchReason;
use crate::types::{NodeId, Tier, TensorId};

/// Default broadcast capacity
pub const EVENT_CAPACITY: usize = 1024;

/// Something that happened to a tensor or the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// Tensor reserved
    Allocated {
        /// Tensor id
        tensor: TensorId,
        /// Logical size
        size: u64,
        /// Chunk count
        chunks: u32,
        /// Initial tier
        tier: Tier,
    },
    /// Caller data stored
    Written {
        /// Tensor id
        tensor: TensorId,
        /// New generation
        generation: u64,
    },
    /// Tensor released
    Freed {
        /// Tensor id
        tensor: TensorId,
    },
    /// Moved fully local
    Promoted {
        /// Tensor id
        tensor: TensorId,
        /// Chunks moved
        chunks: usize,
    },
    /// Moved off the local node on request
    Demoted {
        /// Tensor id
        tensor: TensorId,
        /// Chunks moved
        chunks: usize,
        /// Tier after the move
        tier: Tier,
    },
    /// Local chunks compressed
    Compressed {
        /// Tensor id
        tensor: TensorId,
        /// Bytes before compression
        before: u64,
        /// Bytes after compression
        after: u64,
    },
    /// Moved off the local node under memory pressure
    Evicted {
        /// Tensor id
        tensor: TensorId,
        /// Local bytes released
        freed: u64,
    },
    /// Queued for prefetch
    PrefetchQueued {
        /// Tensor id
        tensor: TensorId,
        /// Why it was queued
        reason: PrefetchReason,
    },
    /// Freed by its TTL
    Reclaimed {
        /// Tensor id
        tensor: TensorId,
    },
    /// A pressure relief pass ran
    PressureRelief {
        /// Node under pressure
        node: NodeId,
        /// Bytes requested
        needed: u64,
        /// Bytes freed
        freed: u64,
    },
}

impl PoolEvent {
    /// Tensor the event concerns, if any
    pub fn tensor(&self) -> Option<TensorId> {
        match self {
            PoolEvent::Allocated { tensor, .. }
            | PoolEvent::Written { tensor, .. }
            | PoolEvent::Freed { tensor }
            | PoolEvent::Promoted { tensor, .. }
            | PoolEvent::Demoted { tensor, .. }
            | PoolEvent::Compressed { tensor, .. }
            | PoolEvent::Evicted { tensor, .. }
            | PoolEvent::PrefetchQueued { tensor, .. }
            | PoolEvent::Reclaimed { tensor } => Some(*tensor),
            PoolEvent::PressureRelief { .. } => None,
        }
    }
}

/// Broadcast bus for [`PoolEvent`]s
///
/// Publishing never blocks; slow subscribers observe `Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; dropped when nobody listens
    pub fn publish(&self, event: PoolEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}
