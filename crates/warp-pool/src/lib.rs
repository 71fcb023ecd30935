//! warp-pool: distributed tiered memory pool
//!
//! Tensors are split into fixed-size chunks and spread across the RAM of a
//! set of nodes. Hot tensors are pulled onto the local node, cold ones are
//! compressed in place or pushed to peers, and sequential workloads get
//! lookahead prefetch.
//!
//! ```text
//!   ┌────────────────────────── MemoryPool ───────────────────────────┐
//!   │  allocate / write / read / free / run_sequential / status       │
//!   └──┬──────────────┬───────────────┬──────────────┬────────────────┘
//!      │              │               │              │
//!  ┌───▼──────┐  ┌────▼─────┐   ┌─────▼──────┐  ┌────▼──────────────┐
//!  │ Chunk    │  │ ChunkIo  │   │ TierManager│  │ BackgroundScheduler│
//!  │ Allocator│  │ (plan,   │   │ promote /  │  │ promotion, idle,   │
//!  │ +Predict │  │ encode)  │   │ demote /   │  │ prefetch, reclaim, │
//!  └───┬──────┘  └────┬─────┘   │ compress   │  │ telemetry          │
//!      │              │         └─────┬──────┘  └────────────────────┘
//!  ┌───▼──────────────▼───────────────▼───┐
//!  │ NodeAgent (local RAM)  │  Transport  │──── peers (TCP / in-memory)
//!  └──────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use warp_config::PoolConfig;
//! use warp_pool::{AllocationHint, MemoryPool};
//!
//! # async fn demo() -> warp_pool::PoolResult<()> {
//! let pool = MemoryPool::new(PoolConfig::default())?;
//! let id = pool.allocate(1024, AllocationHint::labeled("embeddings")).await?;
//! pool.write(id, vec![0u8; 1024]).await?;
//! let data = pool.read(id).await?;
//! assert_eq!(data.len(), 1024);
//! pool.free(id).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod agent;
pub mod allocator;
pub mod cache;
mod daemon;
pub mod engine;
pub mod error;
pub mod events;
pub mod io;
pub mod metrics;
pub mod net;
pub mod pipeline;
pub mod placement;
pub mod prefetch;
pub mod registry;
pub mod tier;
pub mod transport;
pub mod types;

pub use agent::NodeAgent;
pub use allocator::{chunk_layout, ChunkAllocator, NoRelief, PressureValve};
pub use cache::HotCache;
pub use engine::{MemoryPool, MemoryPoolBuilder, TensorInfo};
pub use error::{PoolError, PoolResult};
pub use events::{EventBus, PoolEvent};
pub use metrics::{BackgroundTask, PoolMetrics, PoolStatus};
pub use net::{ChunkServer, TcpTransport};
pub use pipeline::{PipelineOptimizer, PipelineReport};
pub use placement::{
    ClusterTopology, LocalOnlyPredictor, PatternEvent, PlacementOperation, PlacementPredictor,
    PlacementRequest, RelatedTensor, RoleAwarePredictor,
};
pub use prefetch::{PrefetchItem, PrefetchReason, Prefetcher};
pub use tier::{CompressionOutcome, MigrationOutcome, TierManager};
pub use transport::{InMemoryCluster, LocalOnlyTransport, Transport};
pub use types::{
    calculate_tier, AllocationHint, ChunkId, ChunkRef, NodeDescriptor, NodeId, NodeRole, Tier,
    TensorId, TensorLifecycle,
};
