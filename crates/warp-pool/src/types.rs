//! Core identifiers and value types

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PoolError;

/// Tensor identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(Uuid);

impl TensorId {
    /// Generate a new random tensor ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TensorId {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| PoolError::NotFound(format!("invalid tensor id {s}: {e}")))
    }
}

/// Chunk identifier: owning tensor plus position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    /// Owning tensor
    pub tensor: TensorId,
    /// Position inside the tensor, `0..n`
    pub index: u32,
}

impl ChunkId {
    /// Create a chunk id
    pub fn new(tensor: TensorId, index: u32) -> Self {
        Self { tensor, index }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tensor, self.index)
    }
}

/// Node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// As string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What a node is for; biases placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Runs the consumers; keeps hot data local
    Compute,
    /// Large-memory cache node
    Cache,
    /// Spill target for cold data
    Overflow,
    /// General purpose
    Worker,
}

impl NodeRole {
    /// Derive a role from naming conventions in the host name
    pub fn from_hostname(hostname: &str) -> Self {
        let name = hostname.to_lowercase();
        if name.contains("gpu") || name.contains("compute") {
            NodeRole::Compute
        } else if name.contains("cache") || name.contains("mem") {
            NodeRole::Cache
        } else if name.contains("overflow") || name.contains("spill") {
            NodeRole::Overflow
        } else {
            NodeRole::Worker
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeRole::Compute => "compute",
            NodeRole::Cache => "cache",
            NodeRole::Overflow => "overflow",
            NodeRole::Worker => "worker",
        })
    }
}

impl FromStr for NodeRole {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compute" => Ok(NodeRole::Compute),
            "cache" => Ok(NodeRole::Cache),
            "overflow" => Ok(NodeRole::Overflow),
            "worker" => Ok(NodeRole::Worker),
            other => Err(PoolError::Configuration(format!("unknown node role: {other}"))),
        }
    }
}

/// A pool member as seen by placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Node id
    pub id: NodeId,
    /// Node role
    pub role: NodeRole,
    /// Memory budget
    pub ram_total: u64,
    /// Budget not yet charged
    pub ram_free: u64,
}

impl NodeDescriptor {
    /// Fraction of the budget still free
    pub fn free_fraction(&self) -> f64 {
        if self.ram_total == 0 {
            return 0.0;
        }
        self.ram_free as f64 / self.ram_total as f64
    }
}

/// Placement tier of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Every chunk is on this node
    L1Local,
    /// More than half the chunks are on this node
    L2Mixed,
    /// Half or fewer of the chunks are on this node
    L3Remote,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::L1Local => "L1-local",
            Tier::L2Mixed => "L2-mixed",
            Tier::L3Remote => "L3-remote",
        })
    }
}

/// Caller hints supplied at allocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationHint {
    /// Free-form label for logs and `describe`
    pub label: Option<String>,
    /// Contents are `f32` data that may be stored quantized
    pub lossy: bool,
    /// Reclaim automatically after this long
    pub ttl: Option<Duration>,
}

impl AllocationHint {
    /// Hint with a label
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Default::default()
        }
    }

    /// Allow lossy storage
    pub fn with_lossy(mut self) -> Self {
        self.lossy = true;
        self
    }

    /// Reclaim after `ttl`
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Where one chunk of a tensor lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Chunk id
    pub id: ChunkId,
    /// Logical (uncompressed) size
    pub byte_size: u64,
    /// Node holding the authoritative bytes
    pub node_id: NodeId,
    /// Stored as a compressed frame
    pub compressed: bool,
}

impl ChunkRef {
    /// Owning tensor
    pub fn tensor_id(&self) -> TensorId {
        self.id.tensor
    }

    /// Position in the tensor
    pub fn index(&self) -> u32 {
        self.id.index
    }

    /// Whether the chunk lives on `node`
    pub fn is_on(&self, node: &NodeId) -> bool {
        &self.node_id == node
    }
}

/// Per-tensor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorLifecycle {
    /// Chunks reserved, never written
    Allocated,
    /// Holds caller data
    Written,
    /// Last read was served from the hot cache
    Cached,
    /// Moved fully local
    Promoted,
    /// Moved off the local node on request
    Demoted,
    /// Local chunks stored compressed
    Compressed,
    /// Moved off the local node under memory pressure
    Evicted,
    /// Released; terminal
    Freed,
}

/// Classify chunk placement relative to `local`
pub fn calculate_tier(chunks: &[ChunkRef], local: &NodeId) -> Tier {
    let local_count = chunks.iter().filter(|c| c.is_on(local)).count();
    if local_count == chunks.len() {
        Tier::L1Local
    } else if local_count * 2 > chunks.len() {
        Tier::L2Mixed
    } else {
        Tier::L3Remote
    }
}
