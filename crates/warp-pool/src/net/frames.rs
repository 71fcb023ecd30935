//! Wire frames for the chunk protocol
//!
//! ```text
//! ┌──────┬───────┬──────────┬─────────────┬──────────────┬──────────────┐
//! │ type │ flags │ meta_len │ payload_len │ meta (rmp)   │ payload      │
//! │ u8   │ u8    │ u16 LE   │ u32 LE      │ meta_len B   │ payload_len B│
//! └──────┴───────┴──────────┴─────────────┴──────────────┴──────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PoolError, PoolResult};
use crate::types::ChunkId;

/// Frame type identifiers
pub mod frame_type {
    // Requests
    pub const ALLOCATE: u8 = 0x01;
    pub const PUT: u8 = 0x02;
    pub const GET: u8 = 0x03;
    pub const RELEASE: u8 = 0x04;
    pub const TELEMETRY: u8 = 0x05;

    // Responses
    pub const DATA: u8 = 0x10;
    pub const ACK: u8 = 0x20;
    pub const ERROR: u8 = 0x40;
}

/// Payload is a compressed frame
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Largest payload accepted from the wire
pub const MAX_PAYLOAD_LEN: u32 = 1 << 31;

/// Frame header (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type
    pub frame_type: u8,
    /// Flags
    pub flags: u8,
    /// Metadata length
    pub meta_len: u16,
    /// Payload length
    pub payload_len: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Encode header to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.frame_type);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.meta_len);
        buf.put_u32_le(self.payload_len);
    }

    /// Decode header from bytes
    pub fn decode(buf: &mut impl Buf) -> PoolResult<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(PoolError::Protocol("incomplete header".into()));
        }

        Ok(Self {
            frame_type: buf.get_u8(),
            flags: buf.get_u8(),
            meta_len: buf.get_u16_le(),
            payload_len: buf.get_u32_le(),
        })
    }
}

/// Metadata for chunk requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    /// Target chunk
    pub chunk: ChunkId,
    /// Reservation size (ALLOCATE only)
    pub size: u64,
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Frame type
    pub frame_type: u8,
    /// Flags
    pub flags: u8,
    /// rmp-encoded metadata
    pub meta: Bytes,
    /// Raw payload
    pub payload: Bytes,
}

impl Message {
    /// Empty message of the given type
    pub fn new(frame_type: u8) -> Self {
        Self {
            frame_type,
            flags: 0,
            meta: Bytes::new(),
            payload: Bytes::new(),
        }
    }

    /// Attach serialized metadata
    pub fn with_meta<T: Serialize>(mut self, meta: &T) -> PoolResult<Self> {
        let encoded = rmp_serde::to_vec(meta).map_err(|e| PoolError::Protocol(e.to_string()))?;
        if encoded.len() > u16::MAX as usize {
            return Err(PoolError::Protocol(format!(
                "metadata of {} bytes exceeds frame limit",
                encoded.len()
            )));
        }
        self.meta = Bytes::from(encoded);
        Ok(self)
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Bytes, compressed: bool) -> Self {
        self.payload = payload;
        if compressed {
            self.flags |= FLAG_COMPRESSED;
        }
        self
    }

    /// ACK response
    pub fn ack() -> Self {
        Self::new(frame_type::ACK)
    }

    /// ERROR response carrying a reason
    pub fn error(reason: impl ToString) -> Self {
        let reason = reason.to_string();
        Self::new(frame_type::ERROR)
            .with_meta(&reason)
            .unwrap_or_else(|_| Self::new(frame_type::ERROR))
    }

    /// Decode metadata
    pub fn meta<T: DeserializeOwned>(&self) -> PoolResult<T> {
        rmp_serde::from_slice(&self.meta).map_err(|e| PoolError::Protocol(e.to_string()))
    }

    /// Payload is a compressed frame
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Reason carried by an ERROR message
    pub fn error_reason(&self) -> String {
        self.meta::<String>()
            .unwrap_or_else(|_| "unspecified remote error".to_string())
    }

    /// Encode to a contiguous buffer
    pub fn encode(&self) -> PoolResult<BytesMut> {
        let payload_len = u32::try_from(self.payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_LEN)
            .ok_or_else(|| {
                PoolError::Protocol(format!(
                    "payload of {} bytes exceeds frame limit",
                    self.payload.len()
                ))
            })?;
        let header = FrameHeader {
            frame_type: self.frame_type,
            flags: self.flags,
            meta_len: self.meta.len() as u16,
            payload_len,
        };

        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + self.meta.len() + self.payload.len());
        header.encode(&mut buf);
        buf.put_slice(&self.meta);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Write to a stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> PoolResult<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next message; `None` on clean end of stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> PoolResult<Option<Self>> {
        let mut head = [0u8; FrameHeader::SIZE];
        match reader.read_exact(&mut head).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header = FrameHeader::decode(&mut &head[..])?;
        if header.payload_len > MAX_PAYLOAD_LEN {
            return Err(PoolError::Protocol(format!(
                "payload length {} exceeds limit",
                header.payload_len
            )));
        }

        let mut meta = vec![0u8; header.meta_len as usize];
        reader.read_exact(&mut meta).await?;
        let mut payload = vec![0u8; header.payload_len as usize];
        reader.read_exact(&mut payload).await?;

        Ok(Some(Self {
            frame_type: header.frame_type,
            flags: header.flags,
            meta: Bytes::from(meta),
            payload: Bytes::from(payload),
        }))
    }
}
