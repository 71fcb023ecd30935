//! Zstandard codec

use crate::{Compressor, Error, Result};

/// Level used for near-random data where effort buys nothing
const FAST_LEVEL: i32 = 1;

/// Normalized entropy above which the fast level is used
const HIGH_ENTROPY: f64 = 0.8;

/// Zstd compressor
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    /// Create a new Zstd compressor
    ///
    /// Level range: 1-22
    pub fn new(level: i32) -> Result<Self> {
        if !(1..=22).contains(&level) {
            return Err(Error::InvalidLevel(level));
        }
        Ok(Self { level })
    }

    /// Pick the level for a buffer with the given normalized entropy.
    ///
    /// High-entropy buffers drop to the fast level, everything else keeps
    /// this compressor's level.
    pub fn for_entropy(&self, entropy: f64) -> Self {
        if entropy > HIGH_ENTROPY {
            Self { level: FAST_LEVEL }
        } else {
            *self
        }
    }

    /// Configured level
    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(input, self.level).map_err(|e| Error::Compression(e.to_string()))
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        // Streaming decode: the frame knows its own size, no capacity guess needed
        zstd::stream::decode_all(input).map_err(|e| Error::Decompression(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "zstd"
    }
}
