//! Tensor registry: arena of tensor entries keyed by id

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::types::{AllocationHint, ChunkId, ChunkRef, Tier, TensorId, TensorLifecycle};

/// Timestamps kept per tensor for windowed access counts
pub const ACCESS_LOG_CAPACITY: usize = 256;

/// Mutable placement state, guarded by the per-tensor lock
///
/// Readers hold the read guard for a whole read so they never observe a
/// chunk halfway through migration; migrations take the write guard.
#[derive(Debug, Clone)]
pub struct TensorState {
    /// Chunks ordered by index
    pub chunks: Vec<ChunkRef>,
    /// Current tier
    pub tier: Tier,
    /// Local chunks passed through the selector since the last write
    pub compressed: bool,
    /// Bumped on every write
    pub generation: u64,
    /// Has been written at least once
    pub written: bool,
}

impl TensorState {
    /// Chunk holding `index`
    pub fn chunk_mut(&mut self, index: u32) -> Option<&mut ChunkRef> {
        self.chunks.get_mut(index as usize)
    }
}

/// A registered tensor
pub struct TensorEntry {
    id: TensorId,
    total_size: u64,
    hint: AllocationHint,
    created_at: Instant,
    created_utc: DateTime<Utc>,
    expires_at: Option<Instant>,
    chunk_count: u32,
    state: RwLock<TensorState>,
    lifecycle: Mutex<TensorLifecycle>,
    access_count: AtomicU64,
    /// Nanoseconds after `created_at`
    last_access_ns: AtomicU64,
    access_log: Mutex<VecDeque<Instant>>,
}

impl TensorEntry {
    /// Create an entry for freshly reserved chunks
    pub fn new(id: TensorId, total_size: u64, hint: AllocationHint, state: TensorState) -> Self {
        let created_at = Instant::now();
        let expires_at = hint.ttl.map(|ttl| created_at + ttl);
        let chunk_count = state.chunks.len() as u32;
        Self {
            id,
            total_size,
            hint,
            created_at,
            created_utc: Utc::now(),
            expires_at,
            chunk_count,
            state: RwLock::new(state),
            lifecycle: Mutex::new(TensorLifecycle::Allocated),
            access_count: AtomicU64::new(0),
            last_access_ns: AtomicU64::new(0),
            access_log: Mutex::new(VecDeque::with_capacity(ACCESS_LOG_CAPACITY)),
        }
    }

    /// Tensor id
    pub fn id(&self) -> TensorId {
        self.id
    }

    /// Logical size
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Allocation hint
    pub fn hint(&self) -> &AllocationHint {
        &self.hint
    }

    /// Wall-clock creation time
    pub fn created_utc(&self) -> DateTime<Utc> {
        self.created_utc
    }

    /// Placement state lock
    pub fn state(&self) -> &RwLock<TensorState> {
        &self.state
    }

    /// Current lifecycle stage
    pub fn lifecycle(&self) -> TensorLifecycle {
        *self.lifecycle.lock()
    }

    /// Move to a new lifecycle stage; `Freed` is terminal
    pub fn set_lifecycle(&self, next: TensorLifecycle) {
        let mut current = self.lifecycle.lock();
        if *current != TensorLifecycle::Freed {
            *current = next;
        }
    }

    /// Record an access now
    pub fn record_access(&self) {
        let now = Instant::now();
        self.access_count.fetch_add(1, Ordering::Relaxed);
        let offset = now.duration_since(self.created_at).as_nanos() as u64;
        self.last_access_ns.fetch_max(offset, Ordering::Relaxed);

        let mut log = self.access_log.lock();
        if log.len() == ACCESS_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(now);
    }

    /// Lifetime access count
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Accesses within the trailing `window`
    pub fn accesses_within(&self, window: Duration) -> u64 {
        let log = self.access_log.lock();
        log.iter().rev().take_while(|t| t.elapsed() <= window).count() as u64
    }

    /// Time since the last access (or since creation if never accessed)
    pub fn idle_for(&self) -> Duration {
        let offset = Duration::from_nanos(self.last_access_ns.load(Ordering::Relaxed));
        (self.created_at + offset).elapsed()
    }

    /// When the tensor's TTL runs out
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Whether the TTL has run out
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Number of chunks (fixed at creation)
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }
}

/// Registry of all live tensors plus a chunk -> tensor index
#[derive(Default)]
pub struct TensorRegistry {
    tensors: DashMap<TensorId, Arc<TensorEntry>>,
    chunk_index: DashMap<ChunkId, TensorId>,
}

impl TensorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tensor and index its chunks
    pub fn insert(&self, entry: Arc<TensorEntry>, chunks: &[ChunkRef]) {
        for chunk in chunks {
            self.chunk_index.insert(chunk.id, entry.id());
        }
        self.tensors.insert(entry.id(), entry);
    }

    /// Look up a tensor
    pub fn get(&self, id: TensorId) -> Option<Arc<TensorEntry>> {
        self.tensors.get(&id).map(|e| e.value().clone())
    }

    /// Unregister a tensor and its chunk index entries
    pub fn remove(&self, id: TensorId) -> Option<Arc<TensorEntry>> {
        let (_, entry) = self.tensors.remove(&id)?;
        for index in 0..entry.chunk_count() {
            self.chunk_index.remove(&ChunkId::new(id, index));
        }
        Some(entry)
    }

    /// Tensor owning a chunk
    pub fn owner_of(&self, chunk: &ChunkId) -> Option<TensorId> {
        self.chunk_index.get(chunk).map(|t| *t)
    }

    /// Whether a tensor is registered
    pub fn contains(&self, id: TensorId) -> bool {
        self.tensors.contains_key(&id)
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<Arc<TensorEntry>> {
        self.tensors.iter().map(|e| e.value().clone()).collect()
    }

    /// Registered tensor count
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether no tensors are registered
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Indexed chunk count
    pub fn chunk_count(&self) -> usize {
        self.chunk_index.len()
    }

    /// Sum of logical tensor sizes
    pub fn total_bytes(&self) -> u64 {
        self.tensors.iter().map(|e| e.total_size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    fn entry(chunks: u32, hint: AllocationHint) -> (Arc<TensorEntry>, Vec<ChunkRef>) {
        let id = TensorId::new();
        let refs: Vec<ChunkRef> = (0..chunks)
            .map(|i| ChunkRef {
                id: ChunkId::new(id, i),
                byte_size: 10,
                node_id: NodeId::from("local"),
                compressed: false,
            })
            .collect();
        let state = TensorState {
            chunks: refs.clone(),
            tier: Tier::L1Local,
            compressed: false,
            generation: 0,
            written: false,
        };
        (
            Arc::new(TensorEntry::new(id, 10 * chunks as u64, hint, state)),
            refs,
        )
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = TensorRegistry::new();
        let (e, refs) = entry(3, AllocationHint::default());
        let id = e.id();
        registry.insert(e, &refs);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.chunk_count(), 3);
        assert_eq!(registry.owner_of(&ChunkId::new(id, 2)), Some(id));
        assert_eq!(registry.total_bytes(), 30);

        assert!(registry.remove(id).is_some());
        assert!(registry.is_empty());
        assert_eq!(registry.chunk_count(), 0);
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn test_access_window() {
        let (e, _) = entry(1, AllocationHint::default());
        for _ in 0..12 {
            e.record_access();
        }
        assert_eq!(e.access_count(), 12);
        assert_eq!(e.accesses_within(Duration::from_secs(60)), 12);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(e.accesses_within(Duration::from_millis(1)), 0);
    }

    #[test]
    fn test_access_log_bounded() {
        let (e, _) = entry(1, AllocationHint::default());
        for _ in 0..ACCESS_LOG_CAPACITY + 10 {
            e.record_access();
        }
        assert_eq!(
            e.accesses_within(Duration::from_secs(60)),
            ACCESS_LOG_CAPACITY as u64
        );
    }

    #[test]
    fn test_ttl_expiry() {
        let (e, _) = entry(1, AllocationHint::default().with_ttl(Duration::from_millis(5)));
        assert!(!e.is_expired(Instant::now()));
        assert!(e.is_expired(Instant::now() + Duration::from_millis(10)));

        let (forever, _) = entry(1, AllocationHint::default());
        assert!(!forever.is_expired(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn test_freed_is_terminal() {
        let (e, _) = entry(1, AllocationHint::default());
        e.set_lifecycle(TensorLifecycle::Written);
        e.set_lifecycle(TensorLifecycle::Freed);
        e.set_lifecycle(TensorLifecycle::Cached);
        assert_eq!(e.lifecycle(), TensorLifecycle::Freed);
    }
}
