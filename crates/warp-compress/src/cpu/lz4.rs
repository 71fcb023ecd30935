//! LZ4 codec

use crate::{Compressor, Error, Result};

/// LZ4 block compressor with the uncompressed size prepended
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

impl Lz4Compressor {
    /// Create a new LZ4 compressor
    pub fn new() -> Self {
        Self
    }
}

impl Compressor for Lz4Compressor {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(input))
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(input).map_err(|e| Error::Decompression(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "lz4"
    }
}
