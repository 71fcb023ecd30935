//! Lossy 8-bit quantization for `f32` payloads
//!
//! Layout: `[scale: f32 LE][q_0: i8][q_1: i8]...` where
//! `scale = 127 / max(|v|)` and `q_i = round(v_i * scale)`.
//! Dequantization is `q_i / scale`, so every value is recovered to within
//! half a quantization step (`0.5 / scale`).
//!
//! Buffer length being a multiple of four is the only signal that a payload
//! holds `f32`s, so the selector only tries this codec when the caller has
//! opted in to lossy storage.

use crate::{Compressor, Error, Result};

/// Size of the scale header
pub const SCALE_HEADER_LEN: usize = 4;

const CODEC: &str = "quantize-i8";

/// Symmetric per-buffer 8-bit quantizer
#[derive(Debug, Clone, Copy, Default)]
pub struct QuantizeCompressor;

impl QuantizeCompressor {
    /// Create a new quantizer
    pub fn new() -> Self {
        Self
    }

    /// Whether the buffer can be interpreted as packed `f32`s
    pub fn is_candidate(input: &[u8]) -> bool {
        !input.is_empty() && input.len() % 4 == 0
    }

    /// Scale that would be used for this payload
    pub fn scale_for(input: &[u8]) -> Result<f32> {
        if !Self::is_candidate(input) {
            return Err(Error::UnsupportedInput {
                codec: CODEC,
                reason: format!("length {} is not a non-zero multiple of 4", input.len()),
            });
        }

        let mut max_abs = 0.0f32;
        for v in floats(input) {
            if !v.is_finite() {
                return Err(Error::UnsupportedInput {
                    codec: CODEC,
                    reason: "payload contains non-finite values".to_string(),
                });
            }
            max_abs = max_abs.max(v.abs());
        }

        if max_abs == 0.0 {
            return Ok(1.0);
        }
        let scale = 127.0 / max_abs;
        if !scale.is_finite() {
            return Err(Error::UnsupportedInput {
                codec: CODEC,
                reason: format!("max magnitude {max_abs:e} is too small to scale"),
            });
        }
        Ok(scale)
    }
}

fn floats(input: &[u8]) -> impl Iterator<Item = f32> + '_ {
    input
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

impl Compressor for QuantizeCompressor {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let scale = Self::scale_for(input)?;

        let mut out = Vec::with_capacity(SCALE_HEADER_LEN + input.len() / 4);
        out.extend_from_slice(&scale.to_le_bytes());
        out.extend(floats(input).map(|v| (v * scale).round().clamp(-127.0, 127.0) as i8 as u8));
        Ok(out)
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        if input.len() < SCALE_HEADER_LEN {
            return Err(Error::Decompression(format!(
                "quantized payload shorter than its scale header ({} bytes)",
                input.len()
            )));
        }

        let scale = f32::from_le_bytes([input[0], input[1], input[2], input[3]]);
        if !scale.is_finite() || scale <= 0.0 {
            return Err(Error::Decompression(format!("invalid scale {scale}")));
        }

        let mut out = Vec::with_capacity((input.len() - SCALE_HEADER_LEN) * 4);
        for &q in &input[SCALE_HEADER_LEN..] {
            let v = f32::from(q as i8) / scale;
            out.extend_from_slice(&v.to_le_bytes());
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        CODEC
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: dequantized values stay within half a step of the input
        #[test]
        fn quantize_error_bounded(values in prop::collection::vec(-1.0e4f32..1.0e4f32, 1..2048)) {
            let input: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            let q = QuantizeCompressor::new();
            let scale = QuantizeCompressor::scale_for(&input).unwrap();

            let restored = q.decompress(&q.compress(&input).unwrap()).unwrap();
            prop_assert_eq!(restored.len(), input.len());

            let max_abs = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let bound = 0.5 / scale + max_abs * 1e-5;
            for (a, b) in values.iter().zip(floats(&restored)) {
                prop_assert!((a - b).abs() <= bound);
            }
        }

        /// Property: whatever the magnitude, a compressed payload decompresses
        #[test]
        fn quantize_any_magnitude_decodes(
            exp in -45i32..38,
            mantissas in prop::collection::vec(-1.0f32..1.0f32, 1..256),
        ) {
            let factor = 10f32.powi(exp);
            let input: Vec<u8> = mantissas.iter().flat_map(|m| (m * factor).to_le_bytes()).collect();
            let q = QuantizeCompressor::new();
            if let Ok(packed) = q.compress(&input) {
                let restored = q.decompress(&packed).unwrap();
                prop_assert_eq!(restored.len(), input.len());
            }
        }
    }
}
