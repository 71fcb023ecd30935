//! warp-compress: chunk codecs and codec selection
//!
//! Codecs available to the pool:
//! - lossless: zstd, lz4
//! - lossy: symmetric 8-bit quantization of `f32` payloads (caller opt-in)
//! - content-addressed deduplication against a [`DedupBackend`]
//!
//! [`CompressionSelector`] runs every eligible codec over the same buffer and
//! keeps the one with the best ratio. Compressed chunks travel and rest as
//! self-describing frames (see [`frame`]).

#![warn(missing_docs)]

pub mod cpu;
pub mod dedup;
pub mod frame;
pub mod quantize;
pub mod selector;

pub use cpu::{Lz4Compressor, ZstdCompressor};
pub use dedup::{ContentStore, DedupBackend};
pub use frame::{decode_frame, encode_frame, FRAME_HEADER_LEN};
pub use quantize::QuantizeCompressor;
pub use selector::{
    calculate_entropy, CompressionMethod, CompressionResult, CompressionSelector, SelectionHint,
    SelectorConfig, SelectorStats,
};

/// Compression error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Compression failed
    #[error("compression error: {0}")]
    Compression(String),

    /// Decompression failed
    #[error("decompression error: {0}")]
    Decompression(String),

    /// Invalid compression level
    #[error("invalid compression level: {0}")]
    InvalidLevel(i32),

    /// Codec cannot encode this input
    #[error("unsupported input for {codec}: {reason}")]
    UnsupportedInput {
        /// Codec name
        codec: &'static str,
        /// Why the input was rejected
        reason: String,
    },

    /// Frame carries a method tag this build does not know
    #[error("unknown compression method tag: {0}")]
    UnknownMethod(u8),

    /// Malformed frame
    #[error("malformed frame: {0}")]
    Frame(String),

    /// Deduplication backend failure
    #[error("dedup error: {0}")]
    Dedup(String),
}

/// Result type for compression operations
pub type Result<T> = std::result::Result<T, Error>;

/// A single codec
pub trait Compressor: Send + Sync {
    /// Compress data
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// Codec name
    fn name(&self) -> &'static str;
}
