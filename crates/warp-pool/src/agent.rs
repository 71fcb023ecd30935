//! Node agent - owns this node's chunk buffers and memory budget

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;
use warp_telemetry::NodeTelemetry;

use crate::error::{PoolError, PoolResult};
use crate::types::{ChunkId, NodeDescriptor, NodeId, NodeRole};

/// A chunk held by this node
#[derive(Debug, Clone)]
struct LocalChunk {
    /// Logical size reserved at allocation
    capacity: u64,
    /// Stored bytes; `None` until first write
    data: Option<Bytes>,
    /// `data` is a compressed frame
    compressed: bool,
    /// Bytes currently charged against the budget
    charged: u64,
}

/// Local chunk store with budget accounting
///
/// Uncompressed chunks are charged at their reserved capacity, compressed
/// chunks at their stored frame length.
pub struct NodeAgent {
    id: NodeId,
    role: NodeRole,
    budget: u64,
    pressure_threshold: f64,
    chunks: DashMap<ChunkId, LocalChunk>,
    used: AtomicU64,
}

impl NodeAgent {
    /// Create an agent with the given budget
    pub fn new(id: NodeId, role: NodeRole, budget: u64, pressure_threshold: f64) -> Self {
        Self {
            id,
            role,
            budget,
            pressure_threshold,
            chunks: DashMap::new(),
            used: AtomicU64::new(0),
        }
    }

    /// Node id
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Node role
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Budget in bytes
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Bytes currently charged
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Budget not yet charged
    pub fn free(&self) -> u64 {
        self.budget.saturating_sub(self.used())
    }

    /// Chunks held by this node
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Whether this node holds `chunk`
    pub fn contains(&self, chunk: &ChunkId) -> bool {
        self.chunks.contains_key(chunk)
    }

    /// Fraction of the budget charged
    pub fn pressure(&self) -> f64 {
        if self.budget == 0 {
            return 1.0;
        }
        self.used() as f64 / self.budget as f64
    }

    /// Whether charging `extra` more bytes would cross the pressure threshold
    pub fn would_cross_pressure(&self, extra: u64) -> bool {
        if self.budget == 0 {
            return true;
        }
        let projected = self.used().saturating_add(extra) as f64 / self.budget as f64;
        projected > self.pressure_threshold
    }

    /// Bytes that must be freed so charging `extra` stays at the threshold
    pub fn pressure_excess(&self, extra: u64) -> u64 {
        let ceiling = (self.budget as f64 * self.pressure_threshold) as u64;
        self.used().saturating_add(extra).saturating_sub(ceiling)
    }

    /// Snapshot for placement
    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            id: self.id.clone(),
            role: self.role,
            ram_total: self.budget,
            ram_free: self.free(),
        }
    }

    /// Telemetry report for this node
    pub fn telemetry(&self) -> NodeTelemetry {
        NodeTelemetry::now(self.id.as_str(), self.free(), self.budget, self.chunk_count())
    }

    fn charge(&self, chunk: ChunkId, bytes: u64) -> PoolResult<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|next| *next <= self.budget)
            })
            .map(|_| ())
            .map_err(|used| PoolError::Allocation {
                tensor: chunk.tensor,
                chunk: chunk.index,
                reason: format!(
                    "node {} needs {bytes} bytes but has {} of {} free",
                    self.id,
                    self.budget.saturating_sub(used),
                    self.budget
                ),
            })
    }

    fn uncharge(&self, bytes: u64) {
        // Saturating so a double release can never wrap the counter.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Reserve `size` bytes for a chunk
    pub fn allocate_local(&self, chunk: ChunkId, size: u64) -> PoolResult<()> {
        if self.chunks.contains_key(&chunk) {
            return Err(PoolError::Protocol(format!("chunk {chunk} already allocated")));
        }
        self.charge(chunk, size)?;
        self.chunks.insert(
            chunk,
            LocalChunk {
                capacity: size,
                data: None,
                compressed: false,
                charged: size,
            },
        );
        trace!(%chunk, size, used = self.used(), "reserved local chunk");
        Ok(())
    }

    /// Store bytes for a reserved chunk
    ///
    /// Raw writes must match the reserved capacity; compressed frames are
    /// charged at their own length.
    pub fn write_local(&self, chunk: ChunkId, data: Bytes, compressed: bool) -> PoolResult<()> {
        let mut entry = self
            .chunks
            .get_mut(&chunk)
            .ok_or_else(|| PoolError::NotFound(format!("chunk {chunk} on {}", self.id)))?;

        let new_charge = if compressed {
            data.len() as u64
        } else {
            if data.len() as u64 != entry.capacity {
                return Err(PoolError::Protocol(format!(
                    "chunk {chunk} holds {} bytes, got {}",
                    entry.capacity,
                    data.len()
                )));
            }
            entry.capacity
        };

        if new_charge > entry.charged {
            self.charge(chunk, new_charge - entry.charged)?;
        } else {
            self.uncharge(entry.charged - new_charge);
        }

        entry.charged = new_charge;
        entry.data = Some(data);
        entry.compressed = compressed;
        Ok(())
    }

    /// Extra bytes a raw rewrite of `chunk` would charge
    ///
    /// Non-zero only for chunks currently held as compressed frames.
    pub fn rewrite_growth(&self, chunk: &ChunkId) -> u64 {
        self.chunks
            .get(chunk)
            .map(|e| e.capacity.saturating_sub(e.charged))
            .unwrap_or(0)
    }

    /// Read a chunk's stored bytes and whether they are a compressed frame
    ///
    /// Never-written chunks read as zeros.
    pub fn read_local(&self, chunk: &ChunkId) -> PoolResult<(Bytes, bool)> {
        let entry = self
            .chunks
            .get(chunk)
            .ok_or_else(|| PoolError::NotFound(format!("chunk {chunk} on {}", self.id)))?;
        match &entry.data {
            Some(data) => Ok((data.clone(), entry.compressed)),
            None => Ok((Bytes::from(vec![0u8; entry.capacity as usize]), false)),
        }
    }

    /// Drop a chunk and return its charge to the budget
    pub fn release_local(&self, chunk: &ChunkId) -> PoolResult<()> {
        let (_, entry) = self
            .chunks
            .remove(chunk)
            .ok_or_else(|| PoolError::NotFound(format!("chunk {chunk} on {}", self.id)))?;
        self.uncharge(entry.charged);
        trace!(%chunk, freed = entry.charged, used = self.used(), "released local chunk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TensorId;

    fn agent(budget: u64) -> NodeAgent {
        NodeAgent::new(NodeId::from("local"), NodeRole::Compute, budget, 0.85)
    }

    #[test]
    fn test_allocate_and_release() {
        let agent = agent(1000);
        let chunk = ChunkId::new(TensorId::new(), 0);

        agent.allocate_local(chunk, 400).unwrap();
        assert_eq!(agent.used(), 400);
        assert_eq!(agent.free(), 600);
        assert_eq!(agent.chunk_count(), 1);

        agent.release_local(&chunk).unwrap();
        assert_eq!(agent.used(), 0);
        assert!(agent.release_local(&chunk).is_err());
    }

    #[test]
    fn test_budget_enforced() {
        let agent = agent(1000);
        let tensor = TensorId::new();
        agent.allocate_local(ChunkId::new(tensor, 0), 800).unwrap();

        let err = agent.allocate_local(ChunkId::new(tensor, 1), 300).unwrap_err();
        match err {
            PoolError::Allocation { tensor: t, chunk, reason } => {
                assert_eq!(t, tensor);
                assert_eq!(chunk, 1);
                assert!(reason.contains("200 of 1000"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(agent.used(), 800);
    }

    #[test]
    fn test_unwritten_reads_zero() {
        let agent = agent(1000);
        let chunk = ChunkId::new(TensorId::new(), 0);
        agent.allocate_local(chunk, 16).unwrap();

        let (data, compressed) = agent.read_local(&chunk).unwrap();
        assert_eq!(&data[..], &[0u8; 16]);
        assert!(!compressed);
    }

    #[test]
    fn test_raw_write_must_match_capacity() {
        let agent = agent(1000);
        let chunk = ChunkId::new(TensorId::new(), 0);
        agent.allocate_local(chunk, 16).unwrap();

        assert!(agent.write_local(chunk, Bytes::from(vec![1u8; 8]), false).is_err());
        agent.write_local(chunk, Bytes::from(vec![1u8; 16]), false).unwrap();
        assert_eq!(agent.read_local(&chunk).unwrap().0.len(), 16);
    }

    #[test]
    fn test_compressed_chunks_charged_at_stored_size() {
        let agent = agent(1000);
        let chunk = ChunkId::new(TensorId::new(), 0);
        agent.allocate_local(chunk, 500).unwrap();

        agent.write_local(chunk, Bytes::from(vec![7u8; 50]), true).unwrap();
        assert_eq!(agent.used(), 50);
        assert_eq!(agent.rewrite_growth(&chunk), 450);

        let (_, compressed) = agent.read_local(&chunk).unwrap();
        assert!(compressed);

        agent.write_local(chunk, Bytes::from(vec![7u8; 500]), false).unwrap();
        assert_eq!(agent.used(), 500);
        assert_eq!(agent.rewrite_growth(&chunk), 0);

        agent.release_local(&chunk).unwrap();
        assert_eq!(agent.used(), 0);
    }

    #[test]
    fn test_pressure() {
        let agent = agent(1000);
        agent.allocate_local(ChunkId::new(TensorId::new(), 0), 800).unwrap();
        assert!((agent.pressure() - 0.8).abs() < 1e-9);
        assert!(!agent.would_cross_pressure(50));
        assert!(agent.would_cross_pressure(100));
        assert_eq!(agent.pressure_excess(50), 0);
        assert_eq!(agent.pressure_excess(100), 50);
    }

    #[test]
    fn test_descriptor_and_telemetry() {
        let agent = agent(1000);
        agent.allocate_local(ChunkId::new(TensorId::new(), 0), 100).unwrap();

        let desc = agent.descriptor();
        assert_eq!(desc.ram_free, 900);
        assert_eq!(desc.role, NodeRole::Compute);

        let report = agent.telemetry();
        assert_eq!(report.node_id, "local");
        assert_eq!(report.local_chunk_count, 1);
    }
}
