//! Pool configuration structures

use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use warp_telemetry::{LogConfig, LogLevel};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "WARP_POOL_";

/// Main configuration structure for a pool node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Node identity and peers
    pub node: NodeConfig,
    /// Local memory budget
    pub memory: MemoryConfig,
    /// Chunking
    pub chunk: ChunkConfig,
    /// Read/write pipeline
    pub io: IoConfig,
    /// Hot read cache
    pub cache: CacheConfig,
    /// Promotion and idle compression
    pub tiering: TieringConfig,
    /// Prefetch queue
    pub prefetch: PrefetchConfig,
    /// Codec selection
    pub compression: CompressionConfig,
    /// Telemetry emission
    pub telemetry: TelemetryConfig,
    /// TTL reclamation
    pub reclaim: ReclaimConfig,
    /// Logging
    pub logging: LogConfig,
}

/// Node identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id, defaults to the host name
    pub id: String,
    /// Role override (`compute`, `cache`, `overflow`, `worker`); derived
    /// from the node id when unset
    pub role: Option<String>,
    /// Address the chunk server binds in networked mode
    pub listen_addr: Option<String>,
    /// Statically configured peers
    pub peers: Vec<PeerConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            role: None,
            listen_addr: None,
            peers: Vec::new(),
        }
    }
}

/// A statically configured peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer node id
    pub id: String,
    /// `host:port` of the peer's chunk server
    pub addr: String,
    /// Role override
    #[serde(default)]
    pub role: Option<String>,
    /// Peer memory budget, used until its first telemetry report arrives
    #[serde(default)]
    pub ram_total: u64,
}

/// Local memory budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Bytes this node may hold in chunks
    pub budget_bytes: u64,
    /// Fraction of the budget at which pressure relief starts
    pub pressure_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 8 * GIB,
            pressure_threshold: 0.85,
        }
    }
}

/// Chunking configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Chunk size in bytes
    pub chunk_size: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * MIB,
        }
    }
}

/// Read/write pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Chunk operations in flight per tensor
    pub max_inflight_chunk_ops: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            max_inflight_chunk_ops: 3,
        }
    }
}

/// Hot read cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total bytes held by the cache
    pub capacity_bytes: u64,
    /// Entry lifetime in seconds
    pub ttl_secs: u64,
}

impl CacheConfig {
    /// Entry lifetime
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: GIB,
            ttl_secs: 30,
        }
    }
}

/// Tiering configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    /// Promote once accesses inside the window exceed this
    pub access_threshold: u64,
    /// Access counting window in seconds
    pub monitoring_window_secs: u64,
    /// Compress once a tensor has been idle this long
    pub idle_threshold_secs: u64,
    /// Promotion scan period in milliseconds
    pub promotion_interval_ms: u64,
    /// Idle scan period in milliseconds
    pub idle_interval_ms: u64,
    /// Tensors promoted per tick
    pub promotion_budget: usize,
    /// Tensors compressed per tick
    pub idle_budget: usize,
}

impl TieringConfig {
    /// Access counting window
    pub fn monitoring_window(&self) -> Duration {
        Duration::from_secs(self.monitoring_window_secs)
    }

    /// Idle threshold
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    /// Promotion scan period
    pub fn promotion_interval(&self) -> Duration {
        Duration::from_millis(self.promotion_interval_ms)
    }

    /// Idle scan period
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            access_threshold: 10,
            monitoring_window_secs: 60,
            idle_threshold_secs: 60,
            promotion_interval_ms: 1_000,
            idle_interval_ms: 5_000,
            promotion_budget: 16,
            idle_budget: 16,
        }
    }
}

/// Prefetch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Queue capacity
    pub queue_capacity: usize,
    /// Minimum predictor confidence to enqueue a related tensor
    pub confidence_threshold: f64,
    /// Items drained per tick
    pub max_items_per_tick: usize,
    /// Pipeline lookahead in steps
    pub lookahead: usize,
    /// Drain period in milliseconds
    pub interval_ms: u64,
}

impl PrefetchConfig {
    /// Drain period
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            confidence_threshold: 0.7,
            max_items_per_tick: 2,
            lookahead: 2,
            interval_ms: 100,
        }
    }
}

/// Compression configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// zstd level (1-22)
    pub zstd_level: i32,
    /// Try lz4 as well as zstd
    pub enable_lz4: bool,
    /// Attach the in-memory content store
    pub dedup_enabled: bool,
    /// Buffers smaller than this skip dedup
    pub dedup_min_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            zstd_level: 3,
            enable_lz4: true,
            dedup_enabled: false,
            dedup_min_size: MIB as usize,
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Emit reports at all
    pub enabled: bool,
    /// Report period in seconds
    pub interval_secs: u64,
    /// Also send reports to peers through the transport
    pub publish_to_peers: bool,
}

impl TelemetryConfig {
    /// Report period
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
            publish_to_peers: true,
        }
    }
}

/// TTL reclamation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Scan period in seconds
    pub interval_secs: u64,
    /// Tensors freed per tick
    pub budget: usize,
}

impl ReclaimConfig {
    /// Scan period
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            budget: 64,
        }
    }
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl PoolConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load from an optional file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WARP_POOL_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `WARP_POOL_*` overrides from an arbitrary lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(id) = var("NODE_ID") {
            self.node.id = id;
        }
        if let Some(role) = var("NODE_ROLE") {
            self.node.role = Some(role);
        }
        if let Some(addr) = var("LISTEN_ADDR") {
            self.node.listen_addr = Some(addr);
        }
        if let Some(budget) = var("BUDGET_BYTES") {
            self.memory.budget_bytes = parse_env("BUDGET_BYTES", &budget)?;
        }
        if let Some(threshold) = var("PRESSURE_THRESHOLD") {
            self.memory.pressure_threshold = parse_env("PRESSURE_THRESHOLD", &threshold)?;
        }
        if let Some(size) = var("CHUNK_SIZE") {
            self.chunk.chunk_size = parse_env("CHUNK_SIZE", &size)?;
        }
        if let Some(inflight) = var("MAX_INFLIGHT") {
            self.io.max_inflight_chunk_ops = parse_env("MAX_INFLIGHT", &inflight)?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level
                .parse::<LogLevel>()
                .map_err(|e| env_error("LOG_LEVEL", e))?;
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| env_error(name, format!("{value:?}: {e}")))
}

fn env_error(name: &str, message: impl ToString) -> ConfigError {
    ConfigError::Env {
        var: format!("{ENV_PREFIX}{name}"),
        message: message.to_string(),
    }
}
