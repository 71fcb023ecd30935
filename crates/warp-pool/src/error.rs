//! Error types for the memory pool

use thiserror::Error;

use crate::types::{ChunkId, NodeId, TensorId};

/// Memory pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// A chunk could not be reserved; nothing from the request stays reserved
    #[error("allocation of tensor {tensor} failed at chunk {chunk}: {reason}")]
    Allocation {
        /// Tensor being allocated
        tensor: TensorId,
        /// Index of the chunk that failed
        chunk: u32,
        /// Underlying cause
        reason: String,
    },

    /// A chunk could not be moved to or from a node
    #[error("transfer of chunk {chunk} via node {node} failed: {reason}")]
    Transfer {
        /// Peer involved
        node: NodeId,
        /// Chunk being moved
        chunk: ChunkId,
        /// Underlying cause
        reason: String,
    },

    /// Codec failure
    #[error("compression error: {0}")]
    Compression(#[from] warp_compress::Error),

    /// Unknown tensor or chunk
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Write length does not match the allocation
    #[error("size mismatch for tensor {tensor}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Tensor written
        tensor: TensorId,
        /// Allocated size
        expected: u64,
        /// Supplied size
        actual: u64,
    },

    /// Operation was cancelled at a chunk boundary
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed or unexpected wire message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Telemetry sink rejected a report
    #[error("telemetry error: {0}")]
    Telemetry(#[from] warp_telemetry::TelemetryError),

    /// A spawned chunk task panicked or was aborted
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<warp_config::ConfigError> for PoolError {
    fn from(err: warp_config::ConfigError) -> Self {
        PoolError::Configuration(err.to_string())
    }
}

impl PoolError {
    pub(crate) fn not_found(tensor: TensorId) -> Self {
        PoolError::NotFound(format!("tensor {tensor}"))
    }

    pub(crate) fn transfer(node: &NodeId, chunk: ChunkId, reason: impl ToString) -> Self {
        PoolError::Transfer {
            node: node.clone(),
            chunk,
            reason: reason.to_string(),
        }
    }
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;
