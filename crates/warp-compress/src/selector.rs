//! Best-ratio codec selection
//!
//! Every eligible codec runs over the same input and the smallest output
//! wins. Candidates are tried in a fixed order (zstd, lz4, dedup, quantized)
//! and a later candidate only replaces the current best when it is strictly
//! smaller, so ties go to the lossless codecs. A codec that fails is counted
//! and skipped; if nothing beats the raw size the buffer is kept verbatim.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::dedup::DedupBackend;
use crate::frame::{decode_frame, encode_frame};
use crate::{Compressor, Error, Lz4Compressor, QuantizeCompressor, Result, ZstdCompressor};

/// Bytes sampled when estimating entropy
const ENTROPY_SAMPLE: usize = 64 * 1024;

/// Codec that produced a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionMethod {
    /// Stored verbatim
    None,
    /// Zstandard
    Zstd,
    /// LZ4 block
    Lz4,
    /// Content reference into a dedup backend
    Dedup,
    /// 8-bit quantized `f32` payload (lossy)
    Quantized,
}

impl CompressionMethod {
    /// Wire tag
    pub fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zstd => 1,
            Self::Lz4 => 2,
            Self::Dedup => 3,
            Self::Quantized => 4,
        }
    }

    /// Parse a wire tag
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Zstd),
            2 => Ok(Self::Lz4),
            3 => Ok(Self::Dedup),
            4 => Ok(Self::Quantized),
            other => Err(Error::UnknownMethod(other)),
        }
    }

    /// Whether decompression restores the exact input
    pub fn is_lossless(self) -> bool {
        !matches!(self, Self::Quantized)
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Zstd => "zstd",
            Self::Lz4 => "lz4",
            Self::Dedup => "dedup",
            Self::Quantized => "quantized",
        };
        f.write_str(name)
    }
}

/// Outcome of a selection run
#[derive(Debug, Clone)]
pub struct CompressionResult {
    /// Winning codec
    pub method: CompressionMethod,
    /// `original_size / data.len()`
    pub ratio: f64,
    /// Encoded payload
    pub data: Bytes,
    /// Input size in bytes
    pub original_size: u64,
}

impl CompressionResult {
    fn verbatim(input: &[u8]) -> Self {
        Self {
            method: CompressionMethod::None,
            ratio: 1.0,
            data: Bytes::copy_from_slice(input),
            original_size: input.len() as u64,
        }
    }

    /// Encoded payload size
    pub fn compressed_size(&self) -> usize {
        self.data.len()
    }

    /// Encode as a self-describing frame
    pub fn to_frame(&self) -> Bytes {
        encode_frame(self)
    }
}

/// Caller-declared constraints for one selection run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionHint {
    /// Payload may be stored lossily (quantization allowed)
    pub allow_lossy: bool,
}

impl SelectionHint {
    /// Hint that permits lossy codecs
    pub fn lossy() -> Self {
        Self { allow_lossy: true }
    }
}

/// Selector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Zstd level for compressible data (1-22)
    pub zstd_level: i32,
    /// Try lz4 alongside zstd
    pub enable_lz4: bool,
    /// Buffers below this size skip dedup
    pub dedup_min_size: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            zstd_level: 3,
            enable_lz4: true,
            dedup_min_size: 1024 * 1024, // 1 MiB
        }
    }
}

/// Selector counters
#[derive(Debug, Default)]
pub struct SelectorStats {
    runs: AtomicU64,
    codec_failures: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl SelectorStats {
    /// Selection runs performed
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Individual codec failures that were skipped
    pub fn codec_failures(&self) -> u64 {
        self.codec_failures.load(Ordering::Relaxed)
    }

    /// Input bytes seen
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Output bytes produced
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Aggregate ratio over every run (1.0 before the first run)
    pub fn ratio(&self) -> f64 {
        let out = self.bytes_out();
        if out == 0 {
            return 1.0;
        }
        self.bytes_in() as f64 / out as f64
    }
}

/// Runs candidate codecs and keeps the best ratio
pub struct CompressionSelector {
    config: SelectorConfig,
    zstd: ZstdCompressor,
    lz4: Lz4Compressor,
    quantizer: QuantizeCompressor,
    dedup: Option<Arc<dyn DedupBackend>>,
    stats: SelectorStats,
}

impl CompressionSelector {
    /// Create a selector
    pub fn new(config: SelectorConfig) -> Result<Self> {
        let zstd = ZstdCompressor::new(config.zstd_level)?;
        Ok(Self {
            config,
            zstd,
            lz4: Lz4Compressor::new(),
            quantizer: QuantizeCompressor::new(),
            dedup: None,
            stats: SelectorStats::default(),
        })
    }

    /// Attach a dedup backend
    pub fn with_dedup(mut self, backend: Arc<dyn DedupBackend>) -> Self {
        self.dedup = Some(backend);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Get counters
    pub fn stats(&self) -> &SelectorStats {
        &self.stats
    }

    /// Compress `input`, keeping the best-ratio candidate.
    ///
    /// Never fails: codec errors fall back to the next-best candidate and
    /// ultimately to storing the input verbatim.
    pub fn compress(&self, input: &[u8], hint: SelectionHint) -> CompressionResult {
        if input.is_empty() {
            return CompressionResult::verbatim(input);
        }
        self.stats.runs.fetch_add(1, Ordering::Relaxed);

        let mut best: Option<(CompressionMethod, Vec<u8>)> = None;

        let sample = &input[..input.len().min(ENTROPY_SAMPLE)];
        let zstd = self.zstd.for_entropy(calculate_entropy(sample));
        self.consider(&mut best, CompressionMethod::Zstd, zstd.compress(input));

        if self.config.enable_lz4 {
            self.consider(&mut best, CompressionMethod::Lz4, self.lz4.compress(input));
        }

        if let Some(backend) = &self.dedup {
            if input.len() >= self.config.dedup_min_size {
                match backend.deduplicate(input) {
                    Ok(Some(reference)) => {
                        self.consider(&mut best, CompressionMethod::Dedup, Ok(reference))
                    }
                    Ok(None) => {}
                    Err(e) => self.consider(&mut best, CompressionMethod::Dedup, Err(e)),
                }
            }
        }

        if hint.allow_lossy && QuantizeCompressor::is_candidate(input) {
            self.consider(
                &mut best,
                CompressionMethod::Quantized,
                self.quantizer.compress(input),
            );
        }

        let result = match best {
            Some((method, data)) if data.len() < input.len() => CompressionResult {
                method,
                ratio: input.len() as f64 / data.len().max(1) as f64,
                data: Bytes::from(data),
                original_size: input.len() as u64,
            },
            _ => CompressionResult::verbatim(input),
        };

        self.stats
            .bytes_in
            .fetch_add(input.len() as u64, Ordering::Relaxed);
        self.stats
            .bytes_out
            .fetch_add(result.data.len() as u64, Ordering::Relaxed);

        trace!(
            method = %result.method,
            ratio = result.ratio,
            size = input.len(),
            "codec selected"
        );
        result
    }

    fn consider(
        &self,
        best: &mut Option<(CompressionMethod, Vec<u8>)>,
        method: CompressionMethod,
        outcome: Result<Vec<u8>>,
    ) {
        match outcome {
            Ok(data) => {
                let better = best
                    .as_ref()
                    .map_or(true, |(_, current)| data.len() < current.len());
                if better {
                    *best = Some((method, data));
                }
            }
            Err(e) => {
                self.stats.codec_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%method, error = %e, "codec failed, skipping candidate");
            }
        }
    }

    /// Decompress a payload produced by `method`
    pub fn decompress(
        &self,
        method: CompressionMethod,
        payload: &[u8],
        original_size: u64,
    ) -> Result<Vec<u8>> {
        let out = match method {
            CompressionMethod::None => payload.to_vec(),
            CompressionMethod::Zstd => self.zstd.decompress(payload)?,
            CompressionMethod::Lz4 => self.lz4.decompress(payload)?,
            CompressionMethod::Dedup => self
                .dedup
                .as_ref()
                .ok_or_else(|| Error::Dedup("no dedup backend configured".to_string()))?
                .rehydrate(payload)?,
            CompressionMethod::Quantized => self.quantizer.decompress(payload)?,
        };

        if out.len() as u64 != original_size {
            return Err(Error::Decompression(format!(
                "{method} produced {} bytes, expected {original_size}",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Decompress a self-describing frame
    pub fn decompress_frame(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let (method, original_size, payload) = decode_frame(frame)?;
        self.decompress(method, payload, original_size)
    }
}

impl Default for CompressionSelector {
    fn default() -> Self {
        Self {
            config: SelectorConfig::default(),
            zstd: ZstdCompressor::default(),
            lz4: Lz4Compressor::new(),
            quantizer: QuantizeCompressor::new(),
            dedup: None,
            stats: SelectorStats::default(),
        }
    }
}

/// Calculate entropy of data (0.0 = compressible, 1.0 = random)
pub fn calculate_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0u64; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    let mut entropy = 0.0;

    for &count in &freq {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }

    entropy / 8.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::ContentStore;
    use crate::frame::FRAME_HEADER_LEN;

    fn floats(values: impl Iterator<Item = f32>) -> Vec<u8> {
        values.flat_map(|v| v.to_le_bytes()).collect()
    }

    fn pseudo_random(len: usize) -> Vec<u8> {
        let mut x = 0x2545_f491_4f6c_dd1du64;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 24) as u8
            })
            .collect()
    }

    struct BrokenBackend;

    impl DedupBackend for BrokenBackend {
        fn deduplicate(&self, _buffer: &[u8]) -> Result<Option<Vec<u8>>> {
            Err(Error::Dedup("backend offline".to_string()))
        }

        fn rehydrate(&self, _reference: &[u8]) -> Result<Vec<u8>> {
            Err(Error::Dedup("backend offline".to_string()))
        }
    }

    #[test]
    fn test_zero_buffer_picks_lossless() {
        let selector = CompressionSelector::default();
        let data = vec![0u8; 10 * 1024 * 1024];

        let result = selector.compress(&data, SelectionHint::default());

        assert!(result.method.is_lossless());
        assert_ne!(result.method, CompressionMethod::None);
        assert!(result.ratio > 100.0, "ratio {}", result.ratio);

        let restored = selector
            .decompress(result.method, &result.data, result.original_size)
            .unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_quantization_requires_opt_in() {
        let selector = CompressionSelector::default();
        let data = floats((0..4096).map(|i| (i as f32 * 0.37).sin() * 3.0));

        let lossless = selector.compress(&data, SelectionHint::default());
        assert_ne!(lossless.method, CompressionMethod::Quantized);

        let lossy = selector.compress(&data, SelectionHint::lossy());
        assert_eq!(lossy.method, CompressionMethod::Quantized);
        assert_eq!(lossy.data.len(), 4 + 4096);
    }

    #[test]
    fn test_lossless_wins_on_compressible_floats() {
        // zstd crushes zero floats far below one byte per value
        let selector = CompressionSelector::default();
        let data = vec![0u8; 16 * 1024];
        let result = selector.compress(&data, SelectionHint::lossy());
        assert!(result.method.is_lossless());
    }

    #[test]
    fn test_incompressible_kept_verbatim() {
        let selector = CompressionSelector::default();
        let data = pseudo_random(64 * 1024);

        let result = selector.compress(&data, SelectionHint::default());
        assert_eq!(result.method, CompressionMethod::None);
        assert_eq!(result.data.as_ref(), data.as_slice());
        assert_eq!(result.ratio, 1.0);
    }

    #[test]
    fn test_recompression_is_bounded() {
        let selector = CompressionSelector::default();
        let data: Vec<u8> = (0..256 * 1024).map(|i| (i % 97) as u8).collect();

        let first = selector.compress(&data, SelectionHint::default()).to_frame();
        let second = selector.compress(&first, SelectionHint::default()).to_frame();

        assert!(second.len() <= first.len() + FRAME_HEADER_LEN);
    }

    #[test]
    fn test_dedup_wins_on_repeat() {
        let store = Arc::new(ContentStore::new());
        let selector = CompressionSelector::new(SelectorConfig {
            dedup_min_size: 1024,
            ..Default::default()
        })
        .unwrap()
        .with_dedup(store.clone());
        let data = pseudo_random(8 * 1024);

        let first = selector.compress(&data, SelectionHint::default());
        assert_ne!(first.method, CompressionMethod::Dedup);

        let second = selector.compress(&data, SelectionHint::default());
        assert_eq!(second.method, CompressionMethod::Dedup);
        assert_eq!(
            selector.decompress_frame(&second.to_frame()).unwrap(),
            data
        );
    }

    #[test]
    fn test_dedup_skipped_for_small_buffers() {
        let store = Arc::new(ContentStore::new());
        let selector = CompressionSelector::default().with_dedup(store.clone());

        selector.compress(&[5u8; 4096], SelectionHint::default());
        assert!(store.is_empty());
    }

    #[test]
    fn test_failing_codec_falls_back() {
        let selector = CompressionSelector::new(SelectorConfig {
            dedup_min_size: 0,
            ..Default::default()
        })
        .unwrap()
        .with_dedup(Arc::new(BrokenBackend));
        let data = vec![3u8; 8192];

        let result = selector.compress(&data, SelectionHint::default());
        assert!(matches!(
            result.method,
            CompressionMethod::Zstd | CompressionMethod::Lz4
        ));
        assert_eq!(selector.stats().codec_failures(), 1);
    }

    #[test]
    fn test_decompress_size_check() {
        let selector = CompressionSelector::default();
        let result = selector.compress(&[1u8; 1000], SelectionHint::default());
        assert!(selector
            .decompress(result.method, &result.data, 999)
            .is_err());
    }

    #[test]
    fn test_stats_ratio() {
        let selector = CompressionSelector::default();
        assert_eq!(selector.stats().ratio(), 1.0);
        selector.compress(&vec![0u8; 1 << 20], SelectionHint::default());
        assert_eq!(selector.stats().runs(), 1);
        assert!(selector.stats().ratio() > 100.0);
    }

    #[test]
    fn test_entropy_bounds() {
        assert!(calculate_entropy(&[0u8; 1000]) < 0.1);
        let spread: Vec<u8> = (0..=255).cycle().take(4096).collect();
        assert!(calculate_entropy(&spread) > 0.9);
    }
}
