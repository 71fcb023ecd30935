//! Transport - moves chunks between nodes
//!
//! ```text
//!   MemoryPool ──► Transport ──┬── LocalOnlyTransport   (single node)
//!                              ├── InMemoryCluster      (in-process peers)
//!                              └── TcpTransport         (net::client)
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use warp_telemetry::NodeTelemetry;

use crate::agent::NodeAgent;
use crate::error::{PoolError, PoolResult};
use crate::types::{ChunkId, NodeDescriptor, NodeId};

/// Remote chunk operations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Reserve `size` bytes for `chunk` on `node`
    async fn allocate_remote(&self, node: &NodeId, chunk: ChunkId, size: u64) -> PoolResult<()>;

    /// Store bytes for a chunk already reserved on `node`
    async fn transfer_to_node(
        &self,
        node: &NodeId,
        chunk: ChunkId,
        data: Bytes,
        compressed: bool,
    ) -> PoolResult<()>;

    /// Fetch a chunk's stored bytes and whether they are a compressed frame
    async fn fetch_from_node(&self, node: &NodeId, chunk: ChunkId) -> PoolResult<(Bytes, bool)>;

    /// Drop a chunk on `node`
    async fn release_remote(&self, node: &NodeId, chunk: ChunkId) -> PoolResult<()>;

    /// Currently known peers
    fn peers(&self) -> Vec<NodeDescriptor>;

    /// Share this node's telemetry with peers
    async fn publish_telemetry(&self, _report: &NodeTelemetry) -> PoolResult<()> {
        Ok(())
    }
}

/// Transport for a pool with no peers
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOnlyTransport;

impl LocalOnlyTransport {
    fn no_peers(node: &NodeId, chunk: ChunkId) -> PoolError {
        PoolError::transfer(node, chunk, "no remote peers in local-only mode")
    }
}

#[async_trait]
impl Transport for LocalOnlyTransport {
    async fn allocate_remote(&self, node: &NodeId, chunk: ChunkId, _size: u64) -> PoolResult<()> {
        Err(Self::no_peers(node, chunk))
    }

    async fn transfer_to_node(
        &self,
        node: &NodeId,
        chunk: ChunkId,
        _data: Bytes,
        _compressed: bool,
    ) -> PoolResult<()> {
        Err(Self::no_peers(node, chunk))
    }

    async fn fetch_from_node(&self, node: &NodeId, chunk: ChunkId) -> PoolResult<(Bytes, bool)> {
        Err(Self::no_peers(node, chunk))
    }

    async fn release_remote(&self, node: &NodeId, chunk: ChunkId) -> PoolResult<()> {
        Err(Self::no_peers(node, chunk))
    }

    fn peers(&self) -> Vec<NodeDescriptor> {
        Vec::new()
    }
}

/// In-process cluster of peer agents
///
/// Used by tests and `simulate`. Nodes can be marked unreachable, and
/// every operation is counted.
#[derive(Default)]
pub struct InMemoryCluster {
    nodes: DashMap<NodeId, Arc<NodeAgent>>,
    unreachable: RwLock<HashSet<NodeId>>,
    allocations: AtomicU64,
    transfers: AtomicU64,
    fetches: AtomicU64,
    releases: AtomicU64,
    reports: Mutex<Vec<NodeTelemetry>>,
}

impl InMemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer
    pub fn add_node(&self, agent: Arc<NodeAgent>) {
        self.nodes.insert(agent.id().clone(), agent);
    }

    /// Look up a peer agent
    pub fn node(&self, id: &NodeId) -> Option<Arc<NodeAgent>> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    /// Simulate a network partition to/from `id`
    pub fn set_unreachable(&self, id: &NodeId, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(id.clone());
        } else {
            set.remove(id);
        }
    }

    /// Remote reservations served
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Chunk uploads served
    pub fn transfer_count(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    /// Chunk fetches served
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Remote releases served
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    /// Telemetry reports received
    pub fn telemetry_reports(&self) -> Vec<NodeTelemetry> {
        self.reports.lock().clone()
    }

    fn reach(&self, node: &NodeId, chunk: ChunkId) -> PoolResult<Arc<NodeAgent>> {
        if self.unreachable.read().contains(node) {
            return Err(PoolError::transfer(node, chunk, "node unreachable"));
        }
        self.node(node)
            .ok_or_else(|| PoolError::transfer(node, chunk, "unknown node"))
    }
}

#[async_trait]
impl Transport for InMemoryCluster {
    async fn allocate_remote(&self, node: &NodeId, chunk: ChunkId, size: u64) -> PoolResult<()> {
        let agent = self.reach(node, chunk)?;
        agent
            .allocate_local(chunk, size)
            .map_err(|e| PoolError::transfer(node, chunk, e))?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn transfer_to_node(
        &self,
        node: &NodeId,
        chunk: ChunkId,
        data: Bytes,
        compressed: bool,
    ) -> PoolResult<()> {
        let agent = self.reach(node, chunk)?;
        agent
            .write_local(chunk, data, compressed)
            .map_err(|e| PoolError::transfer(node, chunk, e))?;
        self.transfers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn fetch_from_node(&self, node: &NodeId, chunk: ChunkId) -> PoolResult<(Bytes, bool)> {
        let agent = self.reach(node, chunk)?;
        let out = agent
            .read_local(&chunk)
            .map_err(|e| PoolError::transfer(node, chunk, e))?;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    async fn release_remote(&self, node: &NodeId, chunk: ChunkId) -> PoolResult<()> {
        let agent = self.reach(node, chunk)?;
        agent
            .release_local(&chunk)
            .map_err(|e| PoolError::transfer(node, chunk, e))?;
        self.releases.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn peers(&self) -> Vec<NodeDescriptor> {
        let unreachable = self.unreachable.read();
        let mut peers: Vec<NodeDescriptor> = self
            .nodes
            .iter()
            .filter(|n| !unreachable.contains(n.key()))
            .map(|n| n.value().descriptor())
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    async fn publish_telemetry(&self, report: &NodeTelemetry) -> PoolResult<()> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}
