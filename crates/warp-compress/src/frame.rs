//! Self-describing frames for compressed chunks
//!
//! ```text
//! ┌────────────┬──────────────────────┬──────────────────┐
//! │ method: u8 │ original_size: u64LE │ payload ...      │
//! └────────────┴──────────────────────┴──────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::selector::{CompressionMethod, CompressionResult};
use crate::{Error, Result};

/// Frame header size in bytes
pub const FRAME_HEADER_LEN: usize = 9;

/// Encode a compression result as a frame
pub fn encode_frame(result: &CompressionResult) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + result.data.len());
    buf.put_u8(result.method.as_u8());
    buf.put_u64_le(result.original_size);
    buf.put_slice(&result.data);
    buf.freeze()
}

/// Split a frame into its method, original size and payload
pub fn decode_frame(frame: &[u8]) -> Result<(CompressionMethod, u64, &[u8])> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(Error::Frame(format!(
            "frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }

    let mut header = &frame[..FRAME_HEADER_LEN];
    let method = CompressionMethod::from_u8(header.get_u8())?;
    let original_size = header.get_u64_le();
    Ok((method, original_size, &frame[FRAME_HEADER_LEN..]))
}
