//! Memory pool - main interface for tensor allocation and access

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warp_compress::{CompressionSelector, ContentStore, DedupBackend, SelectionHint, SelectorConfig};
use warp_config::PoolConfig;
use warp_telemetry::{TelemetrySink, TracingSink};

use crate::agent::NodeAgent;
use crate::allocator::ChunkAllocator;
use crate::cache::HotCache;
use crate::daemon::BackgroundScheduler;
use crate::error::{PoolError, PoolResult};
use crate::events::{EventBus, PoolEvent};
use crate::io::ChunkIo;
use crate::metrics::{
    BackgroundTask, MemoryStatus, NodeStatus, PoolMetrics, PoolStatus, TensorStatus,
};
use crate::pipeline::{PipelineOptimizer, PipelineReport};
use crate::placement::{PatternEvent, PlacementPredictor, RoleAwarePredictor};
use crate::prefetch::{PrefetchItem, PrefetchReason, Prefetcher};
use crate::registry::{TensorEntry, TensorRegistry, TensorState};
use crate::tier::{CompressionOutcome, MigrationOutcome, TierManager};
use crate::transport::{LocalOnlyTransport, Transport};
use crate::types::{
    calculate_tier, AllocationHint, ChunkRef, NodeId, NodeRole, Tier, TensorId, TensorLifecycle,
};

/// Snapshot of one tensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Tensor id
    pub id: TensorId,
    /// Logical size
    pub total_size: u64,
    /// Caller label
    pub label: Option<String>,
    /// Lossy storage allowed
    pub lossy: bool,
    /// Chunks in index order
    pub chunks: Vec<ChunkRef>,
    /// Current tier
    pub tier: Tier,
    /// Local chunks passed through the selector since the last write
    pub compressed: bool,
    /// Lifecycle stage
    pub lifecycle: TensorLifecycle,
    /// Write generation
    pub generation: u64,
    /// Lifetime access count
    pub access_count: u64,
    /// Milliseconds since the last access
    pub idle_ms: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Milliseconds until TTL reclamation
    pub expires_in_ms: Option<u64>,
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) agent: Arc<NodeAgent>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) predictor: Arc<dyn PlacementPredictor>,
    pub(crate) selector: Arc<CompressionSelector>,
    pub(crate) registry: Arc<TensorRegistry>,
    pub(crate) allocator: ChunkAllocator,
    pub(crate) io: ChunkIo,
    pub(crate) tier: TierManager,
    pub(crate) cache: Arc<HotCache>,
    pub(crate) prefetcher: Prefetcher,
    pub(crate) events: EventBus,
    pub(crate) metrics: Arc<PoolMetrics>,
    pub(crate) sink: Arc<dyn TelemetrySink>,
    pub(crate) shutdown: CancellationToken,
    scheduler: Mutex<Option<BackgroundScheduler>>,
}

/// Builder for [`MemoryPool`]
pub struct MemoryPoolBuilder {
    config: PoolConfig,
    transport: Option<Arc<dyn Transport>>,
    predictor: Option<Arc<dyn PlacementPredictor>>,
    dedup: Option<Arc<dyn DedupBackend>>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl MemoryPoolBuilder {
    /// Move chunks between nodes with `transport` (default: local only)
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Place chunks with `predictor` (default: [`RoleAwarePredictor`])
    pub fn predictor(mut self, predictor: Arc<dyn PlacementPredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    /// Deduplicate chunks against `backend`
    pub fn dedup_backend(mut self, backend: Arc<dyn DedupBackend>) -> Self {
        self.dedup = Some(backend);
        self
    }

    /// Deliver node telemetry to `sink` (default: [`TracingSink`])
    pub fn telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration and assemble the pool
    pub fn build(self) -> PoolResult<MemoryPool> {
        let config = self.config;
        config.validate()?;

        let node_id = NodeId::new(config.node.id.clone());
        let role = match &config.node.role {
            Some(role) => role.parse()?,
            None => NodeRole::from_hostname(&config.node.id),
        };
        let agent = Arc::new(NodeAgent::new(
            node_id,
            role,
            config.memory.budget_bytes,
            config.memory.pressure_threshold,
        ));

        let mut selector = CompressionSelector::new(SelectorConfig {
            zstd_level: config.compression.zstd_level,
            enable_lz4: config.compression.enable_lz4,
            dedup_min_size: config.compression.dedup_min_size,
        })
        .map_err(|e| PoolError::Configuration(e.to_string()))?;
        let dedup = match self.dedup {
            Some(backend) => Some(backend),
            None if config.compression.dedup_enabled => {
                Some(Arc::new(ContentStore::new()) as Arc<dyn DedupBackend>)
            }
            None => None,
        };
        if let Some(backend) = dedup {
            selector = selector.with_dedup(backend);
        }
        let selector = Arc::new(selector);

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LocalOnlyTransport));
        let predictor = self.predictor.unwrap_or_else(|| {
            Arc::new(RoleAwarePredictor::new(config.memory.pressure_threshold))
        });
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));

        let metrics = Arc::new(PoolMetrics::new());
        let registry = Arc::new(TensorRegistry::new());
        let cache = Arc::new(HotCache::new(config.cache.capacity_bytes, config.cache.ttl()));
        let events = EventBus::default();

        let allocator = ChunkAllocator::new(
            config.chunk.chunk_size,
            agent.clone(),
            transport.clone(),
            predictor.clone(),
            metrics.clone(),
        );
        let io = ChunkIo::new(
            agent.clone(),
            transport.clone(),
            selector.clone(),
            metrics.clone(),
            config.io.max_inflight_chunk_ops,
        );
        let tier = TierManager::new(
            config.tiering.clone(),
            agent.clone(),
            transport.clone(),
            predictor.clone(),
            selector.clone(),
            registry.clone(),
            cache.clone(),
            events.clone(),
            metrics.clone(),
        );
        let prefetcher = Prefetcher::new(config.prefetch.queue_capacity);

        info!(
            node = %agent.id(),
            role = %agent.role(),
            budget = config.memory.budget_bytes,
            chunk_size = config.chunk.chunk_size,
            peers = transport.peers().len(),
            "memory pool ready"
        );

        Ok(MemoryPool {
            inner: Arc::new(PoolInner {
                config,
                agent,
                transport,
                predictor,
                selector,
                registry,
                allocator,
                io,
                tier,
                cache,
                prefetcher,
                events,
                metrics,
                sink,
                shutdown: CancellationToken::new(),
                scheduler: Mutex::new(None),
            }),
        })
    }
}

/// Distributed tiered memory pool
///
/// Cheap to clone; every clone shares the same registry and node.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    /// Start building a pool from `config`
    pub fn builder(config: PoolConfig) -> MemoryPoolBuilder {
        MemoryPoolBuilder {
            config,
            transport: None,
            predictor: None,
            dedup: None,
            sink: None,
        }
    }

    /// Single-node pool with default collaborators
    pub fn new(config: PoolConfig) -> PoolResult<Self> {
        Self::builder(config).build()
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }

    /// Local node id
    pub fn node_id(&self) -> &NodeId {
        self.inner.agent.id()
    }

    /// Local node role
    pub fn role(&self) -> NodeRole {
        self.inner.agent.role()
    }

    /// Local node agent (shared with a [`ChunkServer`](crate::net::ChunkServer))
    pub fn agent(&self) -> Arc<NodeAgent> {
        self.inner.agent.clone()
    }

    /// Effective configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Raw counters
    pub fn metrics(&self) -> &PoolMetrics {
        &self.inner.metrics
    }

    /// Subscribe to pool events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    fn entry(&self, id: TensorId) -> PoolResult<Arc<TensorEntry>> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| PoolError::not_found(id))
    }

    fn token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Reserve a tensor of `size` bytes
    pub async fn allocate(&self, size: u64, hint: AllocationHint) -> PoolResult<TensorId> {
        let id = TensorId::new();
        let chunks = self
            .inner
            .allocator
            .allocate(id, size, &hint, &self.inner.tier)
            .await?;

        let tier = calculate_tier(&chunks, self.node_id());
        let chunk_count = chunks.len() as u32;
        let state = TensorState {
            chunks: chunks.clone(),
            tier,
            compressed: false,
            generation: 0,
            written: false,
        };
        let label = hint.label.clone();
        let entry = Arc::new(TensorEntry::new(id, size, hint, state));
        self.inner.registry.insert(entry, &chunks);

        self.inner.metrics.record_allocation();
        self.inner.events.publish(PoolEvent::Allocated {
            tensor: id,
            size,
            chunks: chunk_count,
            tier,
        });
        info!(tensor = %id, size, chunks = chunk_count, %tier, label = ?label, "allocated tensor");
        Ok(id)
    }

    /// Replace a tensor's contents; `data` must be exactly `total_size` bytes
    pub async fn write(&self, id: TensorId, data: impl Into<Bytes>) -> PoolResult<()> {
        self.write_with_token(id, data, &self.token()).await
    }

    /// [`write`](Self::write) that stops at the next chunk boundary once
    /// `token` fires
    pub async fn write_with_token(
        &self,
        id: TensorId,
        data: impl Into<Bytes>,
        token: &CancellationToken,
    ) -> PoolResult<()> {
        let data = data.into();
        let entry = self.entry(id)?;
        if data.len() as u64 != entry.total_size() {
            return Err(PoolError::SizeMismatch {
                tensor: id,
                expected: entry.total_size(),
                actual: data.len() as u64,
            });
        }
        let hint = SelectionHint {
            allow_lossy: entry.hint().lossy,
        };

        let mut state = entry.state().write().await;
        // Stale copies must never outlive the write, even a failed one.
        self.inner.cache.invalidate(id);
        let len = data.len() as u64;

        // Compressed local chunks give back their reservation, so a raw
        // rewrite has to win that space back first.
        let growth: u64 = state
            .chunks
            .iter()
            .filter(|c| c.is_on(self.node_id()))
            .map(|c| self.inner.agent.rewrite_growth(&c.id))
            .sum();
        let excess = self.inner.agent.pressure_excess(growth);
        if excess > 0 {
            let freed = self.inner.tier.relieve_pressure(excess).await;
            debug!(tensor = %id, growth, excess, freed, "relieved pressure before rewrite");
        }

        let result = self
            .inner
            .io
            .write(&mut state.chunks, data, hint, token)
            .await;

        state.generation += 1;
        state.compressed = false;
        result?;
        state.written = true;
        let generation = state.generation;
        drop(state);

        entry.set_lifecycle(TensorLifecycle::Written);
        self.inner.metrics.record_write(len);
        self.inner
            .events
            .publish(PoolEvent::Written { tensor: id, generation });
        debug!(tensor = %id, len, generation, "wrote tensor");
        Ok(())
    }

    /// Read a tensor's full contents
    pub async fn read(&self, id: TensorId) -> PoolResult<Bytes> {
        self.read_with_token(id, &self.token()).await
    }

    /// [`read`](Self::read) that stops at the next chunk boundary once
    /// `token` fires
    pub async fn read_with_token(&self, id: TensorId, token: &CancellationToken) -> PoolResult<Bytes> {
        let entry = self.entry(id)?;
        entry.record_access();
        self.inner.predictor.record_pattern(PatternEvent::Access(id));

        let state = entry.state().read().await;
        let generation = state.generation;

        if let Some(data) = self.inner.cache.get(id, generation) {
            drop(state);
            self.inner.metrics.record_cache_hit();
            self.inner.metrics.record_read(data.len() as u64);
            entry.set_lifecycle(TensorLifecycle::Cached);
            self.spawn_related_prefetch(id);
            return Ok(data);
        }
        self.inner.metrics.record_cache_miss();

        let data = self
            .inner
            .io
            .read(&state.chunks, entry.total_size(), token)
            .await?;
        drop(state);

        self.inner.cache.insert(id, generation, data.clone());
        self.inner.metrics.record_read(data.len() as u64);
        self.spawn_related_prefetch(id);
        Ok(data)
    }

    fn spawn_related_prefetch(&self, id: TensorId) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let threshold = inner.config.prefetch.confidence_threshold;
            for related in inner.predictor.predict_related(id) {
                if related.confidence <= threshold || !inner.registry.contains(related.tensor_id) {
                    continue;
                }
                let item = PrefetchItem::predicted(related.tensor_id, related.confidence);
                if inner.prefetcher.enqueue(item) {
                    inner.events.publish(PoolEvent::PrefetchQueued {
                        tensor: related.tensor_id,
                        reason: item.reason,
                    });
                }
            }
        });
    }

    /// Queue a tensor for prefetch by the background drain
    pub fn prefetch(&self, id: TensorId, priority: u32) -> PoolResult<bool> {
        if !self.inner.registry.contains(id) {
            return Err(PoolError::not_found(id));
        }
        let reason = PrefetchReason::Manual;
        let queued = self.inner.prefetcher.enqueue(PrefetchItem {
            tensor_id: id,
            priority,
            reason,
        });
        if queued {
            self.inner
                .events
                .publish(PoolEvent::PrefetchQueued { tensor: id, reason });
        }
        Ok(queued)
    }

    /// Release a tensor and every chunk it holds
    pub async fn free(&self, id: TensorId) -> PoolResult<()> {
        let entry = self
            .inner
            .registry
            .remove(id)
            .ok_or_else(|| PoolError::not_found(id))?;
        let state = entry.state().write().await;
        self.inner.allocator.release(&state.chunks).await;
        drop(state);

        self.forget(&entry);
        self.inner.metrics.record_free();
        self.inner.events.publish(PoolEvent::Freed { tensor: id });
        info!(tensor = %id, "freed tensor");
        Ok(())
    }

    fn forget(&self, entry: &TensorEntry) {
        let id = entry.id();
        entry.set_lifecycle(TensorLifecycle::Freed);
        self.inner.cache.invalidate(id);
        self.inner.prefetcher.remove(id);
        self.inner.predictor.record_pattern(PatternEvent::Freed(id));
    }

    /// Snapshot of one tensor
    pub async fn describe(&self, id: TensorId) -> PoolResult<TensorInfo> {
        let entry = self.entry(id)?;
        let state = entry.state().read().await;
        let now = Instant::now();
        Ok(TensorInfo {
            id,
            total_size: entry.total_size(),
            label: entry.hint().label.clone(),
            lossy: entry.hint().lossy,
            chunks: state.chunks.clone(),
            tier: state.tier,
            compressed: state.compressed,
            lifecycle: entry.lifecycle(),
            generation: state.generation,
            access_count: entry.access_count(),
            idle_ms: entry.idle_for().as_millis() as u64,
            created_at: entry.created_utc(),
            expires_in_ms: entry
                .expires_at()
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        })
    }

    /// Pool status snapshot
    pub async fn status(&self) -> PoolStatus {
        let agent = &self.inner.agent;
        let mut tensors = TensorStatus::default();
        for entry in self.inner.registry.entries() {
            let state = entry.state().read().await;
            tensors.total += 1;
            tensors.allocated_bytes += entry.total_size();
            match state.tier {
                Tier::L1Local => tensors.l1_local += 1,
                Tier::L2Mixed => tensors.l2_mixed += 1,
                Tier::L3Remote => tensors.l3_remote += 1,
            }
            if state.compressed {
                tensors.compressed += 1;
            }
        }

        PoolStatus {
            node: NodeStatus {
                id: agent.id().clone(),
                role: agent.role(),
                peers: self.inner.transport.peers().len(),
            },
            memory: MemoryStatus {
                ram_total: agent.budget(),
                ram_free: agent.free(),
                used: agent.used(),
                pressure: agent.pressure(),
                local_chunks: agent.chunk_count(),
            },
            tensors,
            performance: self
                .inner
                .metrics
                .performance(self.inner.selector.stats().ratio()),
            errors: self.inner.metrics.errors(),
        }
    }

    /// Move every chunk of a tensor to this node
    pub async fn promote(&self, id: TensorId) -> PoolResult<usize> {
        let entry = self.entry(id)?;
        self.inner.tier.promote(&entry, &self.token()).await
    }

    /// Move a tensor's local chunks to peers
    pub async fn demote(&self, id: TensorId) -> PoolResult<MigrationOutcome> {
        let entry = self.entry(id)?;
        self.inner.tier.demote(&entry, &self.token()).await
    }

    /// Compress a tensor's local chunks in place
    pub async fn compress_tensor(&self, id: TensorId) -> PoolResult<CompressionOutcome> {
        let entry = self.entry(id)?;
        self.inner.tier.compress(&entry).await
    }

    /// Stream `steps` in order through `consumer`, prefetching ahead and
    /// evicting behind
    pub async fn run_sequential<F>(&self, steps: &[TensorId], consumer: F) -> PoolResult<PipelineReport>
    where
        F: FnMut(usize, Bytes) -> PoolResult<()>,
    {
        self.run_sequential_with_token(steps, consumer, &self.token())
            .await
    }

    /// [`run_sequential`](Self::run_sequential) with caller cancellation
    pub async fn run_sequential_with_token<F>(
        &self,
        steps: &[TensorId],
        consumer: F,
        token: &CancellationToken,
    ) -> PoolResult<PipelineReport>
    where
        F: FnMut(usize, Bytes) -> PoolResult<()>,
    {
        PipelineOptimizer::new(self, self.inner.config.prefetch.lookahead)
            .run(steps, consumer, token)
            .await
    }

    /// One promotion pass; returns tensors promoted
    pub async fn run_promotion_tick(&self) -> PoolResult<usize> {
        self.inner
            .tier
            .promotion_tick(self.inner.config.tiering.promotion_budget, &self.token())
            .await
    }

    /// One idle-compression pass; returns tensors compressed
    pub async fn run_idle_tick(&self) -> PoolResult<usize> {
        self.inner
            .tier
            .idle_tick(self.inner.config.tiering.idle_budget)
            .await
    }

    /// Drain up to `max_items_per_tick` prefetches; returns tensors promoted
    pub async fn run_prefetch_tick(&self) -> PoolResult<usize> {
        let token = self.token();
        let batch = self
            .inner
            .prefetcher
            .pop_batch(self.inner.config.prefetch.max_items_per_tick);

        let mut promoted = 0;
        let mut first_error = None;
        for item in batch {
            let Some(entry) = self.inner.registry.get(item.tensor_id) else {
                continue;
            };
            match self.inner.tier.try_promote(&entry, &token).await {
                Ok(Some(n)) => {
                    self.inner.metrics.record_prefetch();
                    if n > 0 {
                        promoted += 1;
                    }
                }
                Ok(None) => debug!(tensor = %item.tensor_id, "prefetch skipped busy tensor"),
                Err(e) => {
                    warn!(tensor = %item.tensor_id, error = %e, "prefetch failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if promoted == 0 => Err(e),
            _ => Ok(promoted),
        }
    }

    /// Free tensors whose TTL ran out; returns tensors reclaimed
    pub async fn reclaim_expired(&self) -> PoolResult<usize> {
        let now = Instant::now();
        let expired: Vec<Arc<TensorEntry>> = self
            .inner
            .registry
            .entries()
            .into_iter()
            .filter(|e| e.is_expired(now))
            .take(self.inner.config.reclaim.budget)
            .collect();

        let mut reclaimed = 0;
        for entry in expired {
            let Ok(state) = entry.state().try_write() else {
                continue;
            };
            if self.inner.registry.remove(entry.id()).is_none() {
                continue;
            }
            self.inner.allocator.release(&state.chunks).await;
            drop(state);

            self.forget(&entry);
            self.inner.metrics.record_reclaim();
            self.inner
                .events
                .publish(PoolEvent::Reclaimed { tensor: entry.id() });
            info!(tensor = %entry.id(), "reclaimed expired tensor");
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /// Send this node's telemetry to the sink and, if enabled, to peers
    pub async fn emit_telemetry(&self) -> PoolResult<usize> {
        let report = self.inner.agent.telemetry();
        self.inner.sink.emit(&report)?;
        if self.inner.config.telemetry.publish_to_peers && !self.inner.transport.peers().is_empty() {
            self.inner.transport.publish_telemetry(&report).await?;
        }
        Ok(1)
    }

    pub(crate) async fn run_task(&self, task: BackgroundTask) -> PoolResult<usize> {
        match task {
            BackgroundTask::Promotion => self.run_promotion_tick().await,
            BackgroundTask::IdleCompression => self.run_idle_tick().await,
            BackgroundTask::Prefetch => self.run_prefetch_tick().await,
            BackgroundTask::Reclaim => self.reclaim_expired().await,
            BackgroundTask::Telemetry => self.emit_telemetry().await,
        }
    }

    /// Start the background tasks; no-op when already running
    pub fn start(&self) {
        let mut scheduler = self.inner.scheduler.lock();
        if scheduler.is_none() {
            *scheduler = Some(BackgroundScheduler::start(
                &self.inner,
                self.inner.shutdown.child_token(),
            ));
        }
    }

    /// Whether background tasks are running
    pub fn is_running(&self) -> bool {
        self.inner.scheduler.lock().is_some()
    }

    /// Stop background tasks, keeping the pool usable
    pub async fn stop(&self) {
        let scheduler = self.inner.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
    }

    /// Cancel every in-flight operation and stop background tasks
    pub async fn shutdown(&self) {
        info!(node = %self.node_id(), "shutting down memory pool");
        self.inner.shutdown.cancel();
        self.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(budget: u64, chunk: u64) -> PoolConfig {
        let mut config = PoolConfig::default();
        config.node.id = "gpu-test".into();
        config.memory.budget_bytes = budget;
        config.chunk.chunk_size = chunk;
        config
    }

    #[tokio::test]
    async fn test_allocate_write_read_free() {
        let pool = MemoryPool::new(config(1 << 20, 1024)).unwrap();
        let id = pool.allocate(2500, AllocationHint::labeled("w")).await.unwrap();

        let info = pool.describe(id).await.unwrap();
        assert_eq!(info.chunks.len(), 3);
        assert_eq!(info.tier, Tier::L1Local);
        assert_eq!(info.lifecycle, TensorLifecycle::Allocated);
        assert_eq!(info.label.as_deref(), Some("w"));

        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        pool.write(id, data.clone()).await.unwrap();
        assert_eq!(&pool.read(id).await.unwrap()[..], &data[..]);

        pool.free(id).await.unwrap();
        assert!(matches!(pool.read(id).await, Err(PoolError::NotFound(_))));
        assert!(matches!(pool.free(id).await, Err(PoolError::NotFound(_))));
        assert_eq!(pool.agent().used(), 0);
    }

    #[tokio::test]
    async fn test_size_mismatch() {
        let pool = MemoryPool::new(config(1 << 20, 1024)).unwrap();
        let id = pool.allocate(100, AllocationHint::default()).await.unwrap();
        let err = pool.write(id, vec![0u8; 99]).await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::SizeMismatch { expected: 100, actual: 99, .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let err = MemoryPool::new(config(1 << 20, 0)).err().unwrap();
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_allocation_rescued_by_compression() {
        let pool = MemoryPool::new(config(1000, 500)).unwrap();
        let a = pool.allocate(500, AllocationHint::default()).await.unwrap();
        pool.write(a, vec![0u8; 500]).await.unwrap();
        let b = pool.allocate(500, AllocationHint::default()).await.unwrap();
        pool.write(b, vec![0u8; 500]).await.unwrap();

        // No room for a raw chunk until an idle tensor is compressed.
        let c = pool.allocate(500, AllocationHint::default()).await.unwrap();

        assert_eq!(pool.describe(c).await.unwrap().tier, Tier::L1Local);
        assert!(pool.describe(b).await.unwrap().compressed);
        assert!(pool.agent().used() <= 1000);
        assert_eq!(&pool.read(a).await.unwrap()[..], &[0u8; 500]);
    }

    #[tokio::test]
    async fn test_rewrite_after_compression_on_full_node() {
        let mut cfg = config(1000, 500);
        cfg.memory.pressure_threshold = 1.0;
        let pool = MemoryPool::new(cfg).unwrap();

        let a = pool.allocate(500, AllocationHint::default()).await.unwrap();
        pool.write(a, vec![0u8; 500]).await.unwrap();
        pool.compress_tensor(a).await.unwrap();
        let b = pool.allocate(500, AllocationHint::default()).await.unwrap();
        pool.write(b, vec![0u8; 500]).await.unwrap();
        let c = pool.allocate(400, AllocationHint::default()).await.unwrap();
        pool.write(c, vec![0u8; 400]).await.unwrap();
        assert!(pool.agent().used() + 500 > 1000);

        pool.write(a, vec![1u8; 500]).await.unwrap();

        assert_eq!(&pool.read(a).await.unwrap()[..], &[1u8; 500]);
        assert!(!pool.describe(a).await.unwrap().compressed);
        assert!(pool.agent().used() <= 1000);
    }

    #[tokio::test]
    async fn test_lossy_tiny_values_survive_compression() {
        let pool = MemoryPool::new(config(1 << 20, 4096)).unwrap();
        let data: Vec<u8> = (1..=1024u32)
            .flat_map(|i| (i as f32 * 1e-41).to_le_bytes())
            .collect();
        let id = pool
            .allocate(data.len() as u64, AllocationHint::default().with_lossy())
            .await
            .unwrap();
        pool.write(id, data.clone()).await.unwrap();

        pool.compress_tensor(id).await.unwrap();

        assert_eq!(&pool.read(id).await.unwrap()[..], &data[..]);
    }

    #[tokio::test]
    async fn test_write_bumps_generation_and_invalidates_cache() {
        let pool = MemoryPool::new(config(1 << 20, 1024)).unwrap();
        let id = pool.allocate(8, AllocationHint::default()).await.unwrap();

        pool.write(id, vec![1u8; 8]).await.unwrap();
        assert_eq!(&pool.read(id).await.unwrap()[..], &[1u8; 8]);
        pool.write(id, vec![2u8; 8]).await.unwrap();
        assert_eq!(&pool.read(id).await.unwrap()[..], &[2u8; 8]);
        assert_eq!(pool.describe(id).await.unwrap().generation, 2);
    }

    #[tokio::test]
    async fn test_ttl_reclaim() {
        let pool = MemoryPool::new(config(1 << 20, 1024)).unwrap();
        let mut events = pool.subscribe();
        let short = pool
            .allocate(64, AllocationHint::default().with_ttl(Duration::from_millis(5)))
            .await
            .unwrap();
        let keep = pool.allocate(64, AllocationHint::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.reclaim_expired().await.unwrap(), 1);
        assert!(pool.describe(short).await.is_err());
        assert!(pool.describe(keep).await.is_ok());

        let mut saw_reclaim = false;
        while let Ok(event) = events.try_recv() {
            if event == (PoolEvent::Reclaimed { tensor: short }) {
                saw_reclaim = true;
            }
        }
        assert!(saw_reclaim);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let pool = MemoryPool::new(config(1 << 20, 1024)).unwrap();
        let id = pool.allocate(4096, AllocationHint::default()).await.unwrap();
        pool.write(id, vec![0u8; 4096]).await.unwrap();
        pool.compress_tensor(id).await.unwrap();

        let status = pool.status().await;
        assert_eq!(status.tensors.total, 1);
        assert_eq!(status.tensors.l1_local, 1);
        assert_eq!(status.tensors.compressed, 1);
        assert_eq!(status.tensors.allocated_bytes, 4096);
        assert!(status.memory.used < 4096);
        assert_eq!(status.node.role, NodeRole::Compute);

        // Compressed chunks still read back exactly
        assert_eq!(&pool.read(id).await.unwrap()[..], &[0u8; 4096]);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let pool = MemoryPool::new(config(1 << 20, 1024)).unwrap();
        pool.start();
        pool.start();
        assert!(pool.is_running());
        pool.stop().await;
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_io() {
        let pool = MemoryPool::new(config(1 << 20, 1024)).unwrap();
        let id = pool.allocate(64, AllocationHint::default()).await.unwrap();
        pool.shutdown().await;
        assert!(matches!(pool.read(id).await, Err(PoolError::Cancelled)));
    }
}
