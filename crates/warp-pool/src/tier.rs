//! Tier manager - promotion, demotion, idle compression and pressure relief
//!
//! Every placement change takes the tensor's write guard, so readers see
//! each chunk either before or after a move. Background passes use
//! `try_write` and skip tensors that are busy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLockWriteGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warp_compress::{CompressionSelector, SelectionHint};
use warp_config::TieringConfig;

use crate::agent::NodeAgent;
use crate::allocator::PressureValve;
use crate::cache::HotCache;
use crate::error::{PoolError, PoolResult};
use crate::events::{EventBus, PoolEvent};
use crate::io::{decode_chunk, encode_chunk, is_lossy_frame};
use crate::metrics::PoolMetrics;
use crate::placement::{ClusterTopology, PlacementOperation, PlacementPredictor, PlacementRequest};
use crate::registry::{TensorEntry, TensorRegistry, TensorState};
use crate::transport::Transport;
use crate::types::{calculate_tier, ChunkRef, NodeId, Tier, TensorLifecycle};

/// Why chunks are leaving the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationReason {
    /// Caller or pipeline asked for it
    Demote,
    /// Memory pressure
    Evict,
}

/// Where a pushed chunk landed and how it was stored
struct PushedChunk {
    node: NodeId,
    compressed: bool,
    lossy: bool,
}

/// Outcome of moving a tensor's local chunks to peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Chunks moved
    pub chunks: usize,
    /// Local bytes released
    pub freed: u64,
}

/// Outcome of compressing a tensor's local chunks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionOutcome {
    /// Chunks stored as frames after the pass
    pub chunks: usize,
    /// Local bytes charged before
    pub before: u64,
    /// Local bytes charged after
    pub after: u64,
}

/// Moves tensors between tiers
pub struct TierManager {
    config: TieringConfig,
    agent: Arc<NodeAgent>,
    transport: Arc<dyn Transport>,
    predictor: Arc<dyn PlacementPredictor>,
    selector: Arc<CompressionSelector>,
    registry: Arc<TensorRegistry>,
    cache: Arc<HotCache>,
    events: EventBus,
    metrics: Arc<PoolMetrics>,
}

impl TierManager {
    /// Create a tier manager
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TieringConfig,
        agent: Arc<NodeAgent>,
        transport: Arc<dyn Transport>,
        predictor: Arc<dyn PlacementPredictor>,
        selector: Arc<CompressionSelector>,
        registry: Arc<TensorRegistry>,
        cache: Arc<HotCache>,
        events: EventBus,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            config,
            agent,
            transport,
            predictor,
            selector,
            registry,
            cache,
            events,
            metrics,
        }
    }

    fn local(&self) -> &NodeId {
        self.agent.id()
    }

    fn retier(&self, state: &mut TensorState) {
        state.tier = calculate_tier(&state.chunks, self.local());
    }

    /// Stored bytes no longer match what was written; cached reads are stale
    fn content_changed(&self, entry: &TensorEntry, state: &mut TensorState) {
        state.generation += 1;
        self.cache.invalidate(entry.id());
        debug!(tensor = %entry.id(), generation = state.generation, "stored lossily, dropped cached reads");
    }

    /// Move every chunk of `entry` to the local node, waiting for the lock
    pub async fn promote(&self, entry: &TensorEntry, token: &CancellationToken) -> PoolResult<usize> {
        let mut state = entry.state().write().await;
        self.promote_locked(entry, &mut state, token).await
    }

    /// Promote if the tensor is not busy; `None` when skipped
    pub async fn try_promote(
        &self,
        entry: &TensorEntry,
        token: &CancellationToken,
    ) -> PoolResult<Option<usize>> {
        match entry.state().try_write() {
            Ok(mut state) => self.promote_locked(entry, &mut state, token).await.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn promote_locked(
        &self,
        entry: &TensorEntry,
        state: &mut RwLockWriteGuard<'_, TensorState>,
        token: &CancellationToken,
    ) -> PoolResult<usize> {
        if state.tier == Tier::L1Local {
            return Ok(0);
        }

        let mut moved = 0;
        let mut result = Ok(());
        for index in 0..state.chunks.len() {
            if token.is_cancelled() {
                result = Err(PoolError::Cancelled);
                break;
            }
            let chunk = state.chunks[index].clone();
            if chunk.is_on(self.local()) {
                continue;
            }
            match self.pull_chunk(&chunk).await {
                Ok(()) => {
                    let slot = &mut state.chunks[index];
                    slot.node_id = self.local().clone();
                    slot.compressed = false;
                    moved += 1;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.retier(state);
        let mut local = state.chunks.iter().filter(|c| c.is_on(self.local())).peekable();
        let all_framed = local.peek().is_some() && local.all(|c| c.compressed);
        state.compressed = all_framed;

        if moved > 0 {
            entry.set_lifecycle(TensorLifecycle::Promoted);
            self.metrics.record_promotion();
            self.events.publish(PoolEvent::Promoted {
                tensor: entry.id(),
                chunks: moved,
            });
            info!(tensor = %entry.id(), chunks = moved, tier = %state.tier, "promoted tensor");
        }
        result.map(|_| moved)
    }

    /// Fetch one remote chunk, store it raw locally, release the remote copy
    async fn pull_chunk(&self, chunk: &ChunkRef) -> PoolResult<()> {
        let (data, compressed) = self
            .transport
            .fetch_from_node(&chunk.node_id, chunk.id)
            .await
            .inspect_err(|_| self.metrics.record_transfer_error())?;
        let raw = decode_chunk(self.selector.clone(), chunk, data, compressed).await?;

        let excess = self.agent.pressure_excess(chunk.byte_size);
        if excess > 0 {
            self.relieve_pressure(excess).await;
        }
        self.agent.allocate_local(chunk.id, chunk.byte_size)?;
        if let Err(e) = self.agent.write_local(chunk.id, raw, false) {
            let _ = self.agent.release_local(&chunk.id);
            return Err(e);
        }

        if let Err(e) = self.transport.release_remote(&chunk.node_id, chunk.id).await {
            // The local copy is authoritative now; the remote one is orphaned.
            self.metrics.record_transfer_error();
            warn!(chunk = %chunk.id, node = %chunk.node_id, error = %e, "remote release failed after promotion");
        }
        Ok(())
    }

    /// Move local chunks to peers, waiting for the lock
    pub async fn demote(
        &self,
        entry: &TensorEntry,
        token: &CancellationToken,
    ) -> PoolResult<MigrationOutcome> {
        let mut state = entry.state().write().await;
        self.migrate_out(entry, &mut state, MigrationReason::Demote, token)
            .await
    }

    async fn migrate_out(
        &self,
        entry: &TensorEntry,
        state: &mut RwLockWriteGuard<'_, TensorState>,
        reason: MigrationReason,
        token: &CancellationToken,
    ) -> PoolResult<MigrationOutcome> {
        let used_before = self.agent.used();
        let mut topology = ClusterTopology {
            local: self.agent.descriptor(),
            peers: self.transport.peers(),
        };
        let hint = SelectionHint {
            allow_lossy: entry.hint().lossy,
        };

        let mut moved = 0;
        let mut lossy = false;
        let mut result = Ok(());
        for index in 0..state.chunks.len() {
            if token.is_cancelled() {
                result = Err(PoolError::Cancelled);
                break;
            }
            let chunk = state.chunks[index].clone();
            if !chunk.is_on(self.local()) {
                continue;
            }
            match self.push_chunk(entry, &chunk, hint, &mut topology).await {
                Ok(pushed) => {
                    let slot = &mut state.chunks[index];
                    slot.node_id = pushed.node;
                    slot.compressed = pushed.compressed;
                    lossy |= pushed.lossy;
                    moved += 1;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.retier(state);
        if lossy {
            self.content_changed(entry, state);
        }

        let outcome = MigrationOutcome {
            chunks: moved,
            freed: used_before.saturating_sub(self.agent.used()),
        };
        if moved > 0 {
            match reason {
                MigrationReason::Demote => {
                    entry.set_lifecycle(TensorLifecycle::Demoted);
                    self.metrics.record_demotion();
                    self.events.publish(PoolEvent::Demoted {
                        tensor: entry.id(),
                        chunks: moved,
                        tier: state.tier,
                    });
                }
                MigrationReason::Evict => {
                    entry.set_lifecycle(TensorLifecycle::Evicted);
                    self.cache.invalidate(entry.id());
                    self.metrics.record_eviction();
                    self.events.publish(PoolEvent::Evicted {
                        tensor: entry.id(),
                        freed: outcome.freed,
                    });
                }
            }
            debug!(tensor = %entry.id(), ?reason, chunks = moved, freed = outcome.freed, "moved chunks off node");
        }
        result.map(|_| outcome)
    }

    /// Compress one local chunk and hand it to a peer chosen by the predictor
    async fn push_chunk(
        &self,
        entry: &TensorEntry,
        chunk: &ChunkRef,
        hint: SelectionHint,
        topology: &mut ClusterTopology,
    ) -> PoolResult<PushedChunk> {
        let (stored, already_framed) = self.agent.read_local(&chunk.id)?;
        let (payload, compressed) = if already_framed {
            (stored, true)
        } else {
            encode_chunk(self.selector.clone(), stored, hint).await?
        };
        // Frames stored earlier were accounted for when they were made.
        let lossy = !already_framed && compressed && is_lossy_frame(&payload);

        let target = self.migration_target(entry, chunk, payload.len() as u64, topology)?;
        let len = payload.len() as u64;

        self.transport
            .allocate_remote(&target, chunk.id, chunk.byte_size)
            .await
            .inspect_err(|_| self.metrics.record_transfer_error())?;
        if let Err(e) = self
            .transport
            .transfer_to_node(&target, chunk.id, payload, compressed)
            .await
        {
            self.metrics.record_transfer_error();
            if let Err(release_err) = self.transport.release_remote(&target, chunk.id).await {
                self.metrics.record_transfer_error();
                warn!(chunk = %chunk.id, node = %target, error = %release_err, "remote release failed after aborted push");
            }
            return Err(e);
        }
        self.metrics.record_transfer(len);
        topology.reserve(&target, len);

        self.agent.release_local(&chunk.id)?;
        Ok(PushedChunk {
            node: target,
            compressed,
            lossy,
        })
    }

    fn migration_target(
        &self,
        entry: &TensorEntry,
        chunk: &ChunkRef,
        size: u64,
        topology: &ClusterTopology,
    ) -> PoolResult<NodeId> {
        let request = PlacementRequest {
            operation: PlacementOperation::Migrate,
            tensor: entry.id(),
            chunk_index: chunk.index(),
            size: chunk.byte_size,
            hint: entry.hint(),
            topology,
        };
        match self.predictor.predict(&request) {
            Ok(node) if &node != self.local() => Ok(node),
            Ok(_) | Err(_) => {
                self.metrics.record_placement_error();
                topology
                    .roomiest_peer(size)
                    .map(|p| p.id.clone())
                    .ok_or_else(|| PoolError::transfer(self.local(), chunk.id, "no peer can take the chunk"))
            }
        }
    }

    /// Compress every raw local chunk, waiting for the lock
    pub async fn compress(&self, entry: &TensorEntry) -> PoolResult<CompressionOutcome> {
        let mut state = entry.state().write().await;
        self.compress_locked(entry, &mut state).await
    }

    async fn compress_locked(
        &self,
        entry: &TensorEntry,
        state: &mut RwLockWriteGuard<'_, TensorState>,
    ) -> PoolResult<CompressionOutcome> {
        let hint = SelectionHint {
            allow_lossy: entry.hint().lossy,
        };
        let before = self.agent.used();

        let mut framed = 0;
        let mut lossy = false;
        for index in 0..state.chunks.len() {
            let chunk = state.chunks[index].clone();
            if !chunk.is_on(self.local()) {
                continue;
            }
            if chunk.compressed {
                framed += 1;
                continue;
            }
            let (raw, _) = self.agent.read_local(&chunk.id)?;
            let (payload, compressed) = encode_chunk(self.selector.clone(), raw, hint).await?;
            if compressed {
                lossy |= is_lossy_frame(&payload);
                self.agent.write_local(chunk.id, payload, true)?;
                state.chunks[index].compressed = true;
                framed += 1;
            }
        }
        state.compressed = true;
        if lossy {
            self.content_changed(entry, state);
        }

        let outcome = CompressionOutcome {
            chunks: framed,
            before,
            after: self.agent.used(),
        };
        entry.set_lifecycle(TensorLifecycle::Compressed);
        self.metrics.record_compression();
        self.events.publish(PoolEvent::Compressed {
            tensor: entry.id(),
            before: outcome.before,
            after: outcome.after,
        });
        debug!(tensor = %entry.id(), before, after = outcome.after, "compressed local chunks");
        Ok(outcome)
    }

    /// Promote tensors accessed more than the threshold inside the window
    ///
    /// Returns the number of tensors promoted.
    pub async fn promotion_tick(&self, budget: usize, token: &CancellationToken) -> PoolResult<usize> {
        let window = self.config.monitoring_window();
        let mut candidates: Vec<(u64, Arc<TensorEntry>)> = self
            .registry
            .entries()
            .into_iter()
            .filter(|e| e.lifecycle() != TensorLifecycle::Freed)
            .map(|e| (e.accesses_within(window), e))
            .filter(|(hits, _)| *hits > self.config.access_threshold)
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let mut promoted = 0;
        let mut first_error = None;
        for (_, entry) in candidates.into_iter().take(budget) {
            match self.try_promote(&entry, token).await {
                Ok(Some(n)) if n > 0 => promoted += 1,
                Ok(_) => {}
                Err(PoolError::Cancelled) => return Err(PoolError::Cancelled),
                Err(e) => {
                    warn!(tensor = %entry.id(), error = %e, "promotion failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if promoted == 0 => Err(e),
            _ => Ok(promoted),
        }
    }

    /// Compress local chunks of tensors idle longer than the threshold
    ///
    /// Returns the number of tensors compressed.
    pub async fn idle_tick(&self, budget: usize) -> PoolResult<usize> {
        let threshold = self.config.idle_threshold();
        let mut idle: Vec<(Duration, Arc<TensorEntry>)> = self
            .registry
            .entries()
            .into_iter()
            .filter(|e| e.lifecycle() != TensorLifecycle::Freed)
            .map(|e| (e.idle_for(), e))
            .filter(|(idle, _)| *idle > threshold)
            .collect();
        idle.sort_by(|a, b| b.0.cmp(&a.0));

        let mut compressed = 0;
        for (_, entry) in idle {
            if compressed >= budget {
                break;
            }
            let Ok(mut state) = entry.state().try_write() else {
                continue;
            };
            if state.compressed {
                continue;
            }
            match self.compress_locked(&entry, &mut state).await {
                Ok(_) => compressed += 1,
                Err(e) => {
                    self.metrics.record_compression_error();
                    warn!(tensor = %entry.id(), error = %e, "idle compression failed");
                }
            }
        }
        Ok(compressed)
    }

    /// Free at least `needed` local bytes: compress the coldest tensors,
    /// then evict them to peers
    pub async fn relieve_pressure(&self, needed: u64) -> u64 {
        let start = self.agent.used();
        let freed = || start.saturating_sub(self.agent.used());

        let mut coldest: Vec<(Duration, Arc<TensorEntry>)> = self
            .registry
            .entries()
            .into_iter()
            .map(|e| (e.idle_for(), e))
            .collect();
        coldest.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, entry) in &coldest {
            if freed() >= needed {
                break;
            }
            let Ok(mut state) = entry.state().try_write() else {
                continue;
            };
            if state.compressed || !state.chunks.iter().any(|c| c.is_on(self.local())) {
                continue;
            }
            if let Err(e) = self.compress_locked(entry, &mut state).await {
                self.metrics.record_compression_error();
                warn!(tensor = %entry.id(), error = %e, "compression under pressure failed");
            }
        }

        if freed() < needed && !self.transport.peers().is_empty() {
            let token = CancellationToken::new();
            for (_, entry) in &coldest {
                if freed() >= needed {
                    break;
                }
                let Ok(mut state) = entry.state().try_write() else {
                    continue;
                };
                if let Err(e) = self
                    .migrate_out(entry, &mut state, MigrationReason::Evict, &token)
                    .await
                {
                    warn!(tensor = %entry.id(), error = %e, "eviction under pressure failed");
                }
            }
        }

        let total = freed();
        self.events.publish(PoolEvent::PressureRelief {
            node: self.local().clone(),
            needed,
            freed: total,
        });
        if total < needed {
            warn!(needed, freed = total, "pressure relief fell short");
        } else {
            debug!(needed, freed = total, "pressure relieved");
        }
        total
    }
}

#[async_trait]
impl PressureValve for TierManager {
    async fn relieve(&self, needed: u64) -> u64 {
        self.relieve_pressure(needed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::RoleAwarePredictor;
    use crate::transport::InMemoryCluster;
    use crate::types::{AllocationHint, ChunkId, NodeDescriptor, NodeRole, TensorId};
    use bytes::Bytes;

    struct Fixture {
        tier: TierManager,
        agent: Arc<NodeAgent>,
        peer: Arc<NodeAgent>,
        registry: Arc<TensorRegistry>,
    }

    fn fixture(budget: u64) -> Fixture {
        let cluster = Arc::new(InMemoryCluster::new());
        let peer = Arc::new(NodeAgent::new(NodeId::from("overflow-1"), NodeRole::Overflow, 1 << 20, 0.9));
        cluster.add_node(peer.clone());
        let agent = Arc::new(NodeAgent::new(NodeId::from("gpu-0"), NodeRole::Compute, budget, 0.85));
        let registry = Arc::new(TensorRegistry::new());
        let tier = TierManager::new(
            TieringConfig::default(),
            agent.clone(),
            cluster,
            Arc::new(RoleAwarePredictor::new(0.85)),
            Arc::new(CompressionSelector::default()),
            registry.clone(),
            Arc::new(HotCache::new(1 << 20, Duration::from_secs(30))),
            EventBus::default(),
            Arc::new(PoolMetrics::new()),
        );
        Fixture {
            tier,
            agent,
            peer,
            registry,
        }
    }

    /// Register a tensor of `chunks` x `size` zero-filled local chunks
    fn local_tensor(f: &Fixture, chunks: u32, size: u64) -> Arc<TensorEntry> {
        let data = vec![Bytes::from(vec![0u8; size as usize]); chunks as usize];
        stored_tensor(f, AllocationHint::default(), &data)
    }

    /// Register a tensor with one raw local chunk per element of `data`
    fn stored_tensor(f: &Fixture, hint: AllocationHint, data: &[Bytes]) -> Arc<TensorEntry> {
        let id = TensorId::new();
        let refs: Vec<ChunkRef> = data
            .iter()
            .enumerate()
            .map(|(i, d)| ChunkRef {
                id: ChunkId::new(id, i as u32),
                byte_size: d.len() as u64,
                node_id: f.agent.id().clone(),
                compressed: false,
            })
            .collect();
        for (r, d) in refs.iter().zip(data) {
            f.agent.allocate_local(r.id, r.byte_size).unwrap();
            f.agent.write_local(r.id, d.clone(), false).unwrap();
        }
        let state = TensorState {
            chunks: refs.clone(),
            tier: Tier::L1Local,
            compressed: false,
            generation: 1,
            written: true,
        };
        let len = data.iter().map(|d| d.len() as u64).sum();
        let entry = Arc::new(TensorEntry::new(id, len, hint, state));
        f.registry.insert(entry.clone(), &refs);
        entry
    }

    fn sine_floats(count: usize) -> Bytes {
        (0..count)
            .flat_map(|i| ((i as f32 * 0.37).sin() * 3.0).to_le_bytes())
            .collect::<Vec<u8>>()
            .into()
    }

    /// Peer that accepts reservations but fails every write and release
    struct RefusingPeer {
        peer: NodeDescriptor,
    }

    #[async_trait]
    impl Transport for RefusingPeer {
        async fn allocate_remote(&self, _node: &NodeId, _chunk: ChunkId, _size: u64) -> PoolResult<()> {
            Ok(())
        }

        async fn transfer_to_node(
            &self,
            node: &NodeId,
            chunk: ChunkId,
            _data: Bytes,
            _compressed: bool,
        ) -> PoolResult<()> {
            Err(PoolError::transfer(node, chunk, "link dropped"))
        }

        async fn fetch_from_node(&self, node: &NodeId, chunk: ChunkId) -> PoolResult<(Bytes, bool)> {
            Err(PoolError::transfer(node, chunk, "link dropped"))
        }

        async fn release_remote(&self, node: &NodeId, chunk: ChunkId) -> PoolResult<()> {
            Err(PoolError::transfer(node, chunk, "link dropped"))
        }

        fn peers(&self) -> Vec<NodeDescriptor> {
            vec![self.peer.clone()]
        }
    }

    #[tokio::test]
    async fn test_demote_then_promote() {
        let f = fixture(1 << 20);
        let entry = local_tensor(&f, 2, 4096);
        let token = CancellationToken::new();

        let out = f.tier.demote(&entry, &token).await.unwrap();
        assert_eq!(out.chunks, 2);
        assert_eq!(out.freed, 8192);
        assert_eq!(f.agent.used(), 0);
        {
            let state = entry.state().read().await;
            assert_eq!(state.tier, Tier::L3Remote);
            assert!(state.chunks.iter().all(|c| c.compressed));
        }
        assert_eq!(entry.lifecycle(), TensorLifecycle::Demoted);

        let moved = f.tier.promote(&entry, &token).await.unwrap();
        assert_eq!(moved, 2);
        assert_eq!(f.peer.used(), 0);
        assert_eq!(f.agent.used(), 8192);
        let state = entry.state().read().await;
        assert_eq!(state.tier, Tier::L1Local);
        assert!(state.chunks.iter().all(|c| !c.compressed));
    }

    #[tokio::test]
    async fn test_compress_charges_stored_size() {
        let f = fixture(1 << 20);
        let entry = local_tensor(&f, 1, 64 * 1024);

        let out = f.tier.compress(&entry).await.unwrap();
        assert_eq!(out.before, 64 * 1024);
        assert!(out.after < out.before / 10);
        assert!(entry.state().read().await.compressed);
        assert_eq!(entry.lifecycle(), TensorLifecycle::Compressed);
    }

    #[tokio::test]
    async fn test_idle_tick_skips_busy_tensors() {
        let mut f = fixture(1 << 20);
        f.tier.config.idle_threshold_secs = 0;
        let busy = local_tensor(&f, 1, 4096);
        let free = local_tensor(&f, 1, 4096);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let guard = busy.state().read().await;
        let compressed = f.tier.idle_tick(16).await.unwrap();
        drop(guard);

        assert_eq!(compressed, 1);
        assert!(free.state().read().await.compressed);
        assert!(!busy.state().read().await.compressed);
    }

    #[tokio::test]
    async fn test_pressure_relief_compresses_coldest() {
        let f = fixture(1 << 20);
        let cold = local_tensor(&f, 4, 64 * 1024);
        let before = f.agent.used();

        let freed = f.tier.relieve_pressure(64 * 1024).await;
        assert!(freed >= 64 * 1024);
        assert_eq!(f.agent.used(), before - freed);
        assert!(cold.state().read().await.compressed);
    }

    #[tokio::test]
    async fn test_promotion_tick_threshold() {
        let f = fixture(1 << 20);
        let entry = local_tensor(&f, 2, 1024);
        let token = CancellationToken::new();
        f.tier.demote(&entry, &token).await.unwrap();

        for _ in 0..10 {
            entry.record_access();
        }
        assert_eq!(f.tier.promotion_tick(16, &token).await.unwrap(), 0);

        entry.record_access();
        assert_eq!(f.tier.promotion_tick(16, &token).await.unwrap(), 1);
        assert_eq!(entry.state().read().await.tier, Tier::L1Local);
    }

    #[tokio::test]
    async fn test_demote_without_peers_fails_cleanly() {
        let agent = Arc::new(NodeAgent::new(NodeId::from("solo"), NodeRole::Compute, 1 << 20, 0.85));
        let registry = Arc::new(TensorRegistry::new());
        let tier = TierManager::new(
            TieringConfig::default(),
            agent.clone(),
            Arc::new(crate::transport::LocalOnlyTransport),
            Arc::new(RoleAwarePredictor::default()),
            Arc::new(CompressionSelector::default()),
            registry.clone(),
            Arc::new(HotCache::new(1024, Duration::from_secs(1))),
            EventBus::default(),
            Arc::new(PoolMetrics::new()),
        );
        let f = Fixture {
            tier,
            agent: agent.clone(),
            peer: agent,
            registry,
        };
        let entry = local_tensor(&f, 1, 128);

        assert!(f.tier.demote(&entry, &CancellationToken::new()).await.is_err());
        let state = entry.state().read().await;
        assert_eq!(state.tier, Tier::L1Local);
        assert_eq!(f.agent.used(), 128);
    }

    #[tokio::test]
    async fn test_lossy_compression_drops_cached_reads() {
        let f = fixture(1 << 20);
        let original = sine_floats(4096);
        let entry = stored_tensor(&f, AllocationHint::default().with_lossy(), &[original.clone()]);
        f.tier.cache.insert(entry.id(), 1, original);

        f.tier.compress(&entry).await.unwrap();

        let state = entry.state().read().await;
        assert!(state.chunks[0].compressed);
        assert_eq!(state.generation, 2);
        assert!(f.tier.cache.get(entry.id(), 1).is_none());
        let (frame, _) = f.agent.read_local(&state.chunks[0].id).unwrap();
        assert!(is_lossy_frame(&frame));
    }

    #[tokio::test]
    async fn test_lossless_compression_keeps_generation() {
        let f = fixture(1 << 20);
        let entry = local_tensor(&f, 1, 16 * 1024);

        f.tier.compress(&entry).await.unwrap();
        assert_eq!(entry.state().read().await.generation, 1);
    }

    #[tokio::test]
    async fn test_lossy_demotion_drops_cached_reads() {
        let f = fixture(1 << 20);
        let original = sine_floats(4096);
        let entry = stored_tensor(&f, AllocationHint::default().with_lossy(), &[original.clone()]);
        f.tier.cache.insert(entry.id(), 1, original);

        f.tier.demote(&entry, &CancellationToken::new()).await.unwrap();

        assert_eq!(entry.state().read().await.generation, 2);
        assert!(f.tier.cache.get(entry.id(), 1).is_none());
    }

    #[tokio::test]
    async fn test_promoted_tensor_compressible_again() {
        let mut f = fixture(1 << 20);
        f.tier.config.idle_threshold_secs = 0;
        let entry = local_tensor(&f, 2, 4096);
        let token = CancellationToken::new();

        f.tier.compress(&entry).await.unwrap();
        f.tier.demote(&entry, &token).await.unwrap();
        f.tier.promote(&entry, &token).await.unwrap();
        {
            let state = entry.state().read().await;
            assert_eq!(state.tier, Tier::L1Local);
            assert!(!state.compressed);
        }
        assert_eq!(f.agent.used(), 8192);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(f.tier.idle_tick(16).await.unwrap(), 1);
        assert!(entry.state().read().await.compressed);
        assert!(f.agent.used() < 8192);
    }

    #[tokio::test]
    async fn test_aborted_push_counts_failed_release() {
        let agent = Arc::new(NodeAgent::new(NodeId::from("gpu-0"), NodeRole::Compute, 1 << 20, 0.85));
        let peer = Arc::new(NodeAgent::new(NodeId::from("overflow-1"), NodeRole::Overflow, 1 << 20, 0.9));
        let metrics = Arc::new(PoolMetrics::new());
        let registry = Arc::new(TensorRegistry::new());
        let tier = TierManager::new(
            TieringConfig::default(),
            agent.clone(),
            Arc::new(RefusingPeer {
                peer: peer.descriptor(),
            }),
            Arc::new(RoleAwarePredictor::default()),
            Arc::new(CompressionSelector::default()),
            registry.clone(),
            Arc::new(HotCache::new(1024, Duration::from_secs(1))),
            EventBus::default(),
            metrics.clone(),
        );
        let f = Fixture {
            tier,
            agent,
            peer,
            registry,
        };
        let entry = local_tensor(&f, 1, 256);

        let err = f.tier.demote(&entry, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::Transfer { .. }));
        // One for the failed write, one for the failed rollback release.
        assert_eq!(metrics.errors().transfer, 2);
        assert_eq!(entry.state().read().await.tier, Tier::L1Local);
        assert_eq!(f.agent.used(), 256);
    }
}
