//! Pool metrics collection

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{NodeId, NodeRole};

/// Background tasks run by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundTask {
    /// Promotion scan
    Promotion,
    /// Idle compression scan
    IdleCompression,
    /// Prefetch queue drain
    Prefetch,
    /// TTL reclamation
    Reclaim,
    /// Telemetry emission
    Telemetry,
}

impl BackgroundTask {
    /// Every task, in start order
    pub const ALL: [BackgroundTask; 5] = [
        BackgroundTask::Promotion,
        BackgroundTask::IdleCompression,
        BackgroundTask::Prefetch,
        BackgroundTask::Reclaim,
        BackgroundTask::Telemetry,
    ];
}

impl fmt::Display for BackgroundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackgroundTask::Promotion => "promotion",
            BackgroundTask::IdleCompression => "idle-compression",
            BackgroundTask::Prefetch => "prefetch",
            BackgroundTask::Reclaim => "reclaim",
            BackgroundTask::Telemetry => "telemetry",
        })
    }
}

/// Pool counters
#[derive(Default)]
pub struct PoolMetrics {
    start_time: RwLock<Option<Instant>>,

    allocations: AtomicU64,
    frees: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    transfers: AtomicU64,
    bytes_transferred: AtomicU64,
    remote_fetches: AtomicU64,

    promotions: AtomicU64,
    demotions: AtomicU64,
    evictions: AtomicU64,
    compressions: AtomicU64,
    prefetches: AtomicU64,
    reclaimed: AtomicU64,
    pipeline_steps: AtomicU64,

    allocation_errors: AtomicU64,
    transfer_errors: AtomicU64,
    compression_errors: AtomicU64,
    placement_errors: AtomicU64,
    promotion_task_errors: AtomicU64,
    idle_task_errors: AtomicU64,
    prefetch_task_errors: AtomicU64,
    reclaim_task_errors: AtomicU64,
    telemetry_task_errors: AtomicU64,
}

macro_rules! counter {
    ($($(#[$doc:meta])* $name:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl PoolMetrics {
    /// Create new metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record background scheduler start
    pub fn record_start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    /// Record background scheduler stop
    pub fn record_stop(&self) {
        *self.start_time.write() = None;
    }

    /// Time since the background scheduler started
    pub fn uptime(&self) -> Option<Duration> {
        self.start_time.read().as_ref().map(|t| t.elapsed())
    }

    counter! {
        /// Record a tensor allocation
        record_allocation => allocations;
        /// Record a tensor free
        record_free => frees;
        /// Record a hot-cache hit
        record_cache_hit => cache_hits;
        /// Record a hot-cache miss
        record_cache_miss => cache_misses;
        /// Record a chunk fetched from a peer
        record_remote_fetch => remote_fetches;
        /// Record a tensor promotion
        record_promotion => promotions;
        /// Record a tensor demotion
        record_demotion => demotions;
        /// Record a pressure eviction
        record_eviction => evictions;
        /// Record a tensor compression
        record_compression => compressions;
        /// Record a prefetch executed
        record_prefetch => prefetches;
        /// Record a TTL reclamation
        record_reclaim => reclaimed;
        /// Record a pipeline step
        record_pipeline_step => pipeline_steps;
        /// Record a failed allocation
        record_allocation_error => allocation_errors;
        /// Record a failed chunk transfer
        record_transfer_error => transfer_errors;
        /// Record a codec failure
        record_compression_error => compression_errors;
        /// Record a placement failure
        record_placement_error => placement_errors;
    }

    /// Record bytes written by callers
    pub fn record_write(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes returned to callers
    pub fn record_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a chunk moved to a peer
    pub fn record_transfer(&self, bytes: u64) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a failed background tick
    pub fn record_task_error(&self, task: BackgroundTask) {
        let counter = match task {
            BackgroundTask::Promotion => &self.promotion_task_errors,
            BackgroundTask::IdleCompression => &self.idle_task_errors,
            BackgroundTask::Prefetch => &self.prefetch_task_errors,
            BackgroundTask::Reclaim => &self.reclaim_task_errors,
            BackgroundTask::Telemetry => &self.telemetry_task_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Hot-cache hits
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Chunks fetched from peers
    pub fn remote_fetches(&self) -> u64 {
        self.remote_fetches.load(Ordering::Relaxed)
    }

    /// Promotions completed
    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    /// Fraction of reads served from the hot cache
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let total = hits + self.cache_misses.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Performance section of the status snapshot
    pub fn performance(&self, compression_ratio: f64) -> PerformanceStatus {
        PerformanceStatus {
            compression_ratio,
            cache_hit_rate: self.cache_hit_rate(),
            transfers_completed: self.transfers.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            remote_fetches: self.remote_fetches(),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            promotions: self.promotions(),
            demotions: self.demotions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            compressions: self.compressions.load(Ordering::Relaxed),
            prefetches: self.prefetches.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            pipeline_steps: self.pipeline_steps.load(Ordering::Relaxed),
            uptime_secs: self.uptime().map(|d| d.as_secs()).unwrap_or(0),
        }
    }

    /// Error section of the status snapshot
    pub fn errors(&self) -> ErrorCounters {
        ErrorCounters {
            allocation: self.allocation_errors.load(Ordering::Relaxed),
            transfer: self.transfer_errors.load(Ordering::Relaxed),
            compression: self.compression_errors.load(Ordering::Relaxed),
            placement: self.placement_errors.load(Ordering::Relaxed),
            promotion_task: self.promotion_task_errors.load(Ordering::Relaxed),
            idle_compression_task: self.idle_task_errors.load(Ordering::Relaxed),
            prefetch_task: self.prefetch_task_errors.load(Ordering::Relaxed),
            reclaim_task: self.reclaim_task_errors.load(Ordering::Relaxed),
            telemetry_task: self.telemetry_task_errors.load(Ordering::Relaxed),
        }
    }
}

/// Pool status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Node identity
    pub node: NodeStatus,
    /// Local memory
    pub memory: MemoryStatus,
    /// Registered tensors
    pub tensors: TensorStatus,
    /// Throughput and tiering counters
    pub performance: PerformanceStatus,
    /// Per-subsystem error counters
    pub errors: ErrorCounters,
}

/// Node section of [`PoolStatus`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node id
    pub id: NodeId,
    /// Node role
    pub role: NodeRole,
    /// Peers currently known to the transport
    pub peers: usize,
}

/// Memory section of [`PoolStatus`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStatus {
    /// Local budget
    pub ram_total: u64,
    /// Budget not yet charged
    pub ram_free: u64,
    /// Bytes charged
    pub used: u64,
    /// `used / ram_total`
    pub pressure: f64,
    /// Chunks held locally
    pub local_chunks: usize,
}

/// Tensor section of [`PoolStatus`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TensorStatus {
    /// Registered tensors
    pub total: usize,
    /// Tensors fully local
    pub l1_local: usize,
    /// Tensors mostly local
    pub l2_mixed: usize,
    /// Tensors mostly remote
    pub l3_remote: usize,
    /// Tensors with compressed chunks
    pub compressed: usize,
    /// Sum of logical tensor sizes
    pub allocated_bytes: u64,
}

/// Performance section of [`PoolStatus`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceStatus {
    /// Aggregate selector ratio
    pub compression_ratio: f64,
    /// Fraction of reads served from the hot cache
    pub cache_hit_rate: f64,
    /// Chunks moved to peers
    pub transfers_completed: u64,
    /// Bytes moved to peers
    pub bytes_transferred: u64,
    /// Chunks fetched from peers
    pub remote_fetches: u64,
    /// Bytes written by callers
    pub bytes_written: u64,
    /// Bytes returned to callers
    pub bytes_read: u64,
    /// Tensors allocated
    pub allocations: u64,
    /// Tensors freed
    pub frees: u64,
    /// Promotions to the local tier
    pub promotions: u64,
    /// Explicit demotions
    pub demotions: u64,
    /// Pressure evictions
    pub evictions: u64,
    /// Tensor compressions
    pub compressions: u64,
    /// Prefetches executed
    pub prefetches: u64,
    /// Tensors reclaimed by TTL
    pub reclaimed: u64,
    /// Pipeline steps completed
    pub pipeline_steps: u64,
    /// Seconds since background tasks started
    pub uptime_secs: u64,
}

/// Error counters of [`PoolStatus`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounters {
    /// Failed allocations
    pub allocation: u64,
    /// Failed chunk transfers
    pub transfer: u64,
    /// Codec failures
    pub compression: u64,
    /// Placement failures
    pub placement: u64,
    /// Failed promotion ticks
    pub promotion_task: u64,
    /// Failed idle-compression ticks
    pub idle_compression_task: u64,
    /// Failed prefetch ticks
    pub prefetch_task: u64,
    /// Failed reclaim ticks
    pub reclaim_task: u64,
    /// Failed telemetry ticks
    pub telemetry_task: u64,
}
