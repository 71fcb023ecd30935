//! Placement - decides which node holds each chunk
//!
//! [`PlacementPredictor`] is the seam: the pool only asks "where should this
//! chunk go" and "which tensors tend to follow this one". The learned side
//! is a simple co-access model: every time tensor B is read right after A,
//! the A→B edge gains weight, and `predict_related(A)` returns successors
//! with `confidence = edge / total outgoing`.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};
use crate::types::{AllocationHint, NodeDescriptor, NodeId, NodeRole, TensorId};

/// Why placement is being asked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementOperation {
    /// New chunk reservation
    Allocate,
    /// Moving an existing chunk off the local node
    Migrate,
}

/// Local node plus known peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    /// This node
    pub local: NodeDescriptor,
    /// Remote peers
    pub peers: Vec<NodeDescriptor>,
}

impl ClusterTopology {
    /// Every node, local first
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        std::iter::once(&self.local).chain(self.peers.iter())
    }

    /// Look up a node by id
    pub fn find(&self, id: &NodeId) -> Option<&NodeDescriptor> {
        self.nodes().find(|n| &n.id == id)
    }

    /// Peer with the most free memory that can hold `size`
    pub fn roomiest_peer(&self, size: u64) -> Option<&NodeDescriptor> {
        self.peers
            .iter()
            .filter(|p| p.ram_free >= size)
            .max_by_key(|p| p.ram_free)
    }

    /// Charge `size` against a node's free memory in this snapshot
    pub fn reserve(&mut self, id: &NodeId, size: u64) {
        if self.local.id == *id {
            self.local.ram_free = self.local.ram_free.saturating_sub(size);
        } else if let Some(peer) = self.peers.iter_mut().find(|p| p.id == *id) {
            peer.ram_free = peer.ram_free.saturating_sub(size);
        }
    }
}

/// One placement question
#[derive(Debug, Clone)]
pub struct PlacementRequest<'a> {
    /// Allocate or migrate
    pub operation: PlacementOperation,
    /// Tensor the chunk belongs to
    pub tensor: TensorId,
    /// Chunk index
    pub chunk_index: u32,
    /// Chunk size in bytes
    pub size: u64,
    /// Caller hint
    pub hint: &'a AllocationHint,
    /// Current view of the cluster
    pub topology: &'a ClusterTopology,
}

/// A tensor predicted to be accessed soon
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelatedTensor {
    /// Tensor id
    pub tensor_id: TensorId,
    /// Probability-like score in `[0, 1]`
    pub confidence: f64,
}

/// Observations fed back to the predictor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternEvent {
    /// A tensor was read
    Access(TensorId),
    /// A sequential pipeline moved from one step to the next
    Sequential {
        /// Previous step
        from: TensorId,
        /// Next step
        to: TensorId,
    },
    /// A tensor was freed; forget it
    Freed(TensorId),
}

/// Placement policy
pub trait PlacementPredictor: Send + Sync {
    /// Choose a node for one chunk
    fn predict(&self, request: &PlacementRequest<'_>) -> PoolResult<NodeId>;

    /// Tensors likely to be accessed after `tensor`, best first
    fn predict_related(&self, tensor: TensorId) -> Vec<RelatedTensor>;

    /// Learn from an observed access
    fn record_pattern(&self, event: PatternEvent);
}

/// Everything stays on the local node
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOnlyPredictor;

impl PlacementPredictor for LocalOnlyPredictor {
    fn predict(&self, request: &PlacementRequest<'_>) -> PoolResult<NodeId> {
        match request.operation {
            PlacementOperation::Allocate => Ok(request.topology.local.id.clone()),
            PlacementOperation::Migrate => request
                .topology
                .roomiest_peer(request.size)
                .map(|p| p.id.clone())
                .ok_or_else(|| no_target(request)),
        }
    }

    fn predict_related(&self, _tensor: TensorId) -> Vec<RelatedTensor> {
        Vec::new()
    }

    fn record_pattern(&self, _event: PatternEvent) {}
}

fn no_target(request: &PlacementRequest<'_>) -> PoolError {
    PoolError::Allocation {
        tensor: request.tensor,
        chunk: request.chunk_index,
        reason: format!(
            "no node can hold {} bytes for {:?}",
            request.size, request.operation
        ),
    }
}

#[derive(Default)]
struct CoAccess {
    last: Option<TensorId>,
    follows: HashMap<TensorId, HashMap<TensorId, u64>>,
}

impl CoAccess {
    fn bump(&mut self, from: TensorId, to: TensorId) {
        if from == to {
            return;
        }
        *self.follows.entry(from).or_default().entry(to).or_insert(0) += 1;
    }

    fn forget(&mut self, tensor: TensorId) {
        self.follows.remove(&tensor);
        for successors in self.follows.values_mut() {
            successors.remove(&tensor);
        }
        if self.last == Some(tensor) {
            self.last = None;
        }
    }
}

/// Load-aware placement biased by node role, plus co-access learning
///
/// Allocation keeps chunks local while the local node stays under its
/// pressure threshold, then spreads to peers by role weight times free
/// fraction. Migration never picks the local node and prefers overflow and
/// cache nodes.
pub struct RoleAwarePredictor {
    pressure_threshold: f64,
    co_access: Mutex<CoAccess>,
}

impl RoleAwarePredictor {
    /// Create a predictor that keeps local usage under `pressure_threshold`
    pub fn new(pressure_threshold: f64) -> Self {
        Self {
            pressure_threshold,
            co_access: Mutex::new(CoAccess::default()),
        }
    }

    fn role_weight(operation: PlacementOperation, role: NodeRole) -> f64 {
        match (operation, role) {
            (PlacementOperation::Allocate, NodeRole::Cache) => 1.0,
            (PlacementOperation::Allocate, NodeRole::Worker) => 0.8,
            (PlacementOperation::Allocate, NodeRole::Overflow) => 0.6,
            (PlacementOperation::Allocate, NodeRole::Compute) => 0.4,
            (PlacementOperation::Migrate, NodeRole::Overflow) => 1.0,
            (PlacementOperation::Migrate, NodeRole::Cache) => 0.9,
            (PlacementOperation::Migrate, NodeRole::Worker) => 0.5,
            (PlacementOperation::Migrate, NodeRole::Compute) => 0.2,
        }
    }

    fn local_fits(&self, local: &NodeDescriptor, size: u64) -> bool {
        if local.ram_free < size || local.ram_total == 0 {
            return false;
        }
        let used_after = local.ram_total - local.ram_free + size;
        used_after as f64 / local.ram_total as f64 <= self.pressure_threshold
    }

    fn best_peer(&self, request: &PlacementRequest<'_>) -> Option<NodeId> {
        request
            .topology
            .peers
            .iter()
            .filter(|p| p.ram_free >= request.size)
            .map(|p| {
                let score = Self::role_weight(request.operation, p.role) * p.free_fraction();
                (p, score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.id.cmp(&a.0.id)))
            .map(|(p, _)| p.id.clone())
    }
}

impl Default for RoleAwarePredictor {
    fn default() -> Self {
        Self::new(0.85)
    }
}

impl PlacementPredictor for RoleAwarePredictor {
    fn predict(&self, request: &PlacementRequest<'_>) -> PoolResult<NodeId> {
        let local = &request.topology.local;
        match request.operation {
            PlacementOperation::Allocate => {
                if self.local_fits(local, request.size) {
                    return Ok(local.id.clone());
                }
                if let Some(peer) = self.best_peer(request) {
                    return Ok(peer);
                }
                // Over the threshold but still under budget: pressure relief
                // runs before the reservation.
                if local.ram_free >= request.size {
                    return Ok(local.id.clone());
                }
                Err(no_target(request))
            }
            PlacementOperation::Migrate => self.best_peer(request).ok_or_else(|| no_target(request)),
        }
    }

    fn predict_related(&self, tensor: TensorId) -> Vec<RelatedTensor> {
        let co = self.co_access.lock();
        let Some(successors) = co.follows.get(&tensor) else {
            return Vec::new();
        };
        let total: u64 = successors.values().sum();
        if total == 0 {
            return Vec::new();
        }
        let mut related: Vec<RelatedTensor> = successors
            .iter()
            .map(|(id, count)| RelatedTensor {
                tensor_id: *id,
                confidence: *count as f64 / total as f64,
            })
            .collect();
        related.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        related
    }

    fn record_pattern(&self, event: PatternEvent) {
        let mut co = self.co_access.lock();
        match event {
            PatternEvent::Access(tensor) => {
                if let Some(prev) = co.last {
                    co.bump(prev, tensor);
                }
                co.last = Some(tensor);
            }
            PatternEvent::Sequential { from, to } => co.bump(from, to),
            PatternEvent::Freed(tensor) => co.forget(tensor),
        }
    }
}
