//! Chunk allocator - splits tensors into chunks and reserves them
//!
//! ```text
//!   size ──► chunk_layout ──► [c0, c1, .., cn-1]
//!                               │
//!                    for each:  predict(Allocate) ──► NodeId
//!                               │
//!               ┌───────────────┴────────────────┐
//!          local: relieve pressure,          remote: Transport::
//!          NodeAgent::allocate_local         allocate_remote
//!               └───────────────┬────────────────┘
//!                               ▼
//!                any failure: roll back everything reserved so far
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::agent::NodeAgent;
use crate::error::{PoolError, PoolResult};
use crate::metrics::PoolMetrics;
use crate::placement::{ClusterTopology, PlacementOperation, PlacementPredictor, PlacementRequest};
use crate::transport::Transport;
use crate::types::{AllocationHint, ChunkId, ChunkRef, NodeId, TensorId};

/// Split `size` into chunk sizes: full chunks plus a remainder
pub fn chunk_layout(size: u64, chunk_size: u64) -> Vec<u64> {
    if size == 0 || chunk_size == 0 {
        return Vec::new();
    }
    let full = size / chunk_size;
    let rem = size % chunk_size;
    let mut layout = vec![chunk_size; full as usize];
    if rem > 0 {
        layout.push(rem);
    }
    layout
}

/// Frees local memory before a reservation that would cross the threshold
#[async_trait]
pub trait PressureValve: Send + Sync {
    /// Try to free at least `needed` bytes; returns bytes actually freed
    async fn relieve(&self, needed: u64) -> u64;
}

/// Valve that never frees anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRelief;

#[async_trait]
impl PressureValve for NoRelief {
    async fn relieve(&self, _needed: u64) -> u64 {
        0
    }
}

/// Reserves chunks across the pool
pub struct ChunkAllocator {
    chunk_size: u64,
    agent: Arc<NodeAgent>,
    transport: Arc<dyn Transport>,
    predictor: Arc<dyn PlacementPredictor>,
    metrics: Arc<PoolMetrics>,
}

impl ChunkAllocator {
    /// Create an allocator
    pub fn new(
        chunk_size: u64,
        agent: Arc<NodeAgent>,
        transport: Arc<dyn Transport>,
        predictor: Arc<dyn PlacementPredictor>,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            chunk_size,
            agent,
            transport,
            predictor,
            metrics,
        }
    }

    /// Configured chunk size
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Current view of the cluster
    pub fn topology(&self) -> ClusterTopology {
        ClusterTopology {
            local: self.agent.descriptor(),
            peers: self.transport.peers(),
        }
    }

    /// Reserve every chunk of a `size`-byte tensor
    ///
    /// Either every chunk is reserved or none is.
    pub async fn allocate(
        &self,
        tensor: TensorId,
        size: u64,
        hint: &AllocationHint,
        valve: &dyn PressureValve,
    ) -> PoolResult<Vec<ChunkRef>> {
        let layout = chunk_layout(size, self.chunk_size);
        if layout.is_empty() {
            return Err(PoolError::Allocation {
                tensor,
                chunk: 0,
                reason: "zero-size tensor".into(),
            });
        }

        let mut topology = self.topology();
        let mut reserved: Vec<ChunkRef> = Vec::with_capacity(layout.len());

        for (index, chunk_size) in layout.into_iter().enumerate() {
            let index = index as u32;
            match self
                .reserve_one(tensor, index, chunk_size, hint, &mut topology, valve)
                .await
            {
                Ok(chunk) => reserved.push(chunk),
                Err(e) => {
                    self.metrics.record_allocation_error();
                    warn!(%tensor, chunk = index, error = %e, "allocation failed, rolling back");
                    self.release(&reserved).await;
                    return Err(match e {
                        PoolError::Allocation { .. } => e,
                        other => PoolError::Allocation {
                            tensor,
                            chunk: index,
                            reason: other.to_string(),
                        },
                    });
                }
            }
        }

        debug!(
            %tensor,
            chunks = reserved.len(),
            local = reserved.iter().filter(|c| c.is_on(self.agent.id())).count(),
            "reserved tensor chunks"
        );
        Ok(reserved)
    }

    async fn reserve_one(
        &self,
        tensor: TensorId,
        index: u32,
        size: u64,
        hint: &AllocationHint,
        topology: &mut ClusterTopology,
        valve: &dyn PressureValve,
    ) -> PoolResult<ChunkRef> {
        let id = ChunkId::new(tensor, index);
        let node = match self.predict(tensor, index, size, hint, topology) {
            Ok(node) => node,
            Err(e) => {
                // Nowhere has room: free local memory, then ask again.
                let needed = self.agent.pressure_excess(size);
                if needed == 0 {
                    self.metrics.record_placement_error();
                    return Err(e);
                }
                let freed = valve.relieve(needed).await;
                debug!(%tensor, chunk = index, needed, freed, "relieved memory pressure before placement");
                topology.local = self.agent.descriptor();
                self.predict(tensor, index, size, hint, topology)
                    .inspect_err(|_| self.metrics.record_placement_error())?
            }
        };

        if &node == self.agent.id() {
            let excess = self.agent.pressure_excess(size);
            if excess > 0 {
                let freed = valve.relieve(excess).await;
                debug!(%tensor, chunk = index, excess, freed, "relieved memory pressure");
            }
            self.agent.allocate_local(id, size)?;
            topology.local = self.agent.descriptor();
        } else {
            self.transport
                .allocate_remote(&node, id, size)
                .await
                .inspect_err(|_| self.metrics.record_transfer_error())?;
            topology.reserve(&node, size);
        }

        Ok(ChunkRef {
            id,
            byte_size: size,
            node_id: node,
            compressed: false,
        })
    }

    fn predict(
        &self,
        tensor: TensorId,
        index: u32,
        size: u64,
        hint: &AllocationHint,
        topology: &ClusterTopology,
    ) -> PoolResult<NodeId> {
        self.predictor.predict(&PlacementRequest {
            operation: PlacementOperation::Allocate,
            tensor,
            chunk_index: index,
            size,
            hint,
            topology,
        })
    }

    /// Release chunks wherever they live; failures are logged
    pub async fn release(&self, chunks: &[ChunkRef]) {
        for chunk in chunks {
            let result = if chunk.is_on(self.agent.id()) {
                self.agent.release_local(&chunk.id)
            } else {
                self.transport.release_remote(&chunk.node_id, chunk.id).await
            };
            if let Err(e) = result {
                self.metrics.record_transfer_error();
                warn!(chunk = %chunk.id, node = %chunk.node_id, error = %e, "chunk release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::{LocalOnlyPredictor, RoleAwarePredictor};
    use crate::transport::{InMemoryCluster, LocalOnlyTransport};
    use crate::types::NodeRole;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    fn local_allocator(budget: u64, chunk_size: u64) -> (ChunkAllocator, Arc<NodeAgent>) {
        let agent = Arc::new(NodeAgent::new(
            NodeId::from("local"),
            NodeRole::Compute,
            budget,
            0.85,
        ));
        let allocator = ChunkAllocator::new(
            chunk_size,
            agent.clone(),
            Arc::new(LocalOnlyTransport),
            Arc::new(LocalOnlyPredictor),
            Arc::new(PoolMetrics::new()),
        );
        (allocator, agent)
    }

    #[test]
    fn test_chunk_layout() {
        assert_eq!(
            chunk_layout(200 * MIB, 64 * MIB),
            vec![64 * MIB, 64 * MIB, 64 * MIB, 8 * MIB]
        );
        assert_eq!(chunk_layout(128, 64), vec![64, 64]);
        assert_eq!(chunk_layout(1, 64), vec![1]);
        assert!(chunk_layout(0, 64).is_empty());
    }

    proptest! {
        #[test]
        fn prop_layout_covers_size(size in 1u64..10_000_000, chunk in 1u64..1_000_000) {
            let layout = chunk_layout(size, chunk);
            prop_assert_eq!(layout.iter().sum::<u64>(), size);
            prop_assert_eq!(layout.len() as u64, size.div_ceil(chunk));
            prop_assert!(layout.iter().all(|c| *c > 0 && *c <= chunk));
        }
    }

    #[tokio::test]
    async fn test_local_allocation() {
        let (allocator, agent) = local_allocator(1024, 100);
        let tensor = TensorId::new();
        let chunks = allocator
            .allocate(tensor, 250, &AllocationHint::default(), &NoRelief)
            .await
            .unwrap();

        assert_eq!(chunks.len(), 3);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index(), i as u32);
            assert_eq!(c.tensor_id(), tensor);
        }
        assert_eq!(chunks[2].byte_size, 50);
        assert_eq!(agent.used(), 250);
    }

    #[tokio::test]
    async fn test_zero_size_rejected() {
        let (allocator, _) = local_allocator(1024, 100);
        let err = allocator
            .allocate(TensorId::new(), 0, &AllocationHint::default(), &NoRelief)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Allocation { chunk: 0, .. }));
    }

    #[tokio::test]
    async fn test_rollback_on_exhaustion() {
        let (allocator, agent) = local_allocator(250, 100);
        let tensor = TensorId::new();
        let err = allocator
            .allocate(tensor, 300, &AllocationHint::default(), &NoRelief)
            .await
            .unwrap_err();

        match err {
            PoolError::Allocation { tensor: t, chunk, .. } => {
                assert_eq!(t, tensor);
                assert_eq!(chunk, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(agent.used(), 0);
        assert_eq!(agent.chunk_count(), 0);
    }

    struct CountingValve(parking_lot::Mutex<Vec<u64>>);

    #[async_trait]
    impl PressureValve for CountingValve {
        async fn relieve(&self, needed: u64) -> u64 {
            self.0.lock().push(needed);
            0
        }
    }

    #[tokio::test]
    async fn test_valve_consulted_above_threshold() {
        let (allocator, _) = local_allocator(1000, 100);
        let valve = CountingValve(parking_lot::Mutex::new(Vec::new()));
        allocator
            .allocate(TensorId::new(), 900, &AllocationHint::default(), &valve)
            .await
            .unwrap();
        // 800 + 100 crosses 850 by 50
        assert_eq!(*valve.0.lock(), vec![50]);
    }

    /// Frees one pre-filled chunk when asked
    struct FreeingValve {
        agent: Arc<NodeAgent>,
        filler: ChunkId,
        asked: parking_lot::Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl PressureValve for FreeingValve {
        async fn relieve(&self, needed: u64) -> u64 {
            self.asked.lock().push(needed);
            let before = self.agent.used();
            let _ = self.agent.release_local(&self.filler);
            before - self.agent.used()
        }
    }

    #[tokio::test]
    async fn test_placement_retried_after_relief() {
        let agent = Arc::new(NodeAgent::new(NodeId::from("gpu-0"), NodeRole::Compute, 1000, 0.85));
        let allocator = ChunkAllocator::new(
            500,
            agent.clone(),
            Arc::new(LocalOnlyTransport),
            Arc::new(RoleAwarePredictor::new(0.85)),
            Arc::new(PoolMetrics::new()),
        );
        let filler = ChunkId::new(TensorId::new(), 0);
        agent.allocate_local(filler, 600).unwrap();
        let valve = FreeingValve {
            agent: agent.clone(),
            filler,
            asked: parking_lot::Mutex::new(Vec::new()),
        };

        let chunks = allocator
            .allocate(TensorId::new(), 500, &AllocationHint::default(), &valve)
            .await
            .unwrap();

        assert_eq!(chunks[0].node_id, NodeId::from("gpu-0"));
        // 600 + 500 crosses 850 by 250
        assert_eq!(*valve.asked.lock(), vec![250]);
        assert_eq!(agent.used(), 500);
    }

    #[tokio::test]
    async fn test_placement_fails_when_relief_frees_nothing() {
        let agent = Arc::new(NodeAgent::new(NodeId::from("gpu-0"), NodeRole::Compute, 1000, 0.85));
        let metrics = Arc::new(PoolMetrics::new());
        let allocator = ChunkAllocator::new(
            500,
            agent.clone(),
            Arc::new(LocalOnlyTransport),
            Arc::new(RoleAwarePredictor::new(0.85)),
            metrics.clone(),
        );
        agent.allocate_local(ChunkId::new(TensorId::new(), 0), 600).unwrap();
        let valve = CountingValve(parking_lot::Mutex::new(Vec::new()));

        let err = allocator
            .allocate(TensorId::new(), 500, &AllocationHint::default(), &valve)
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Allocation { chunk: 0, .. }));
        assert_eq!(*valve.0.lock(), vec![250]);
        assert_eq!(metrics.errors().placement, 1);
        assert_eq!(agent.used(), 600);
    }

    #[tokio::test]
    async fn test_spill_to_peers_and_rollback_remote() {
        let cluster = Arc::new(InMemoryCluster::new());
        let peer = Arc::new(NodeAgent::new(NodeId::from("cache-1"), NodeRole::Cache, 1000, 0.9));
        cluster.add_node(peer.clone());

        let agent = Arc::new(NodeAgent::new(NodeId::from("gpu-0"), NodeRole::Compute, 200, 0.85));
        let allocator = ChunkAllocator::new(
            100,
            agent.clone(),
            cluster.clone(),
            Arc::new(RoleAwarePredictor::new(0.85)),
            Arc::new(PoolMetrics::new()),
        );

        let chunks = allocator
            .allocate(TensorId::new(), 400, &AllocationHint::default(), &NoRelief)
            .await
            .unwrap();
        assert_eq!(chunks[0].node_id, NodeId::from("gpu-0"));
        assert!(chunks[1..].iter().all(|c| c.node_id == NodeId::from("cache-1")));
        assert_eq!(peer.used(), 300);

        allocator.release(&chunks).await;
        assert_eq!(peer.used(), 0);
        assert_eq!(agent.used(), 0);
    }
}
