//! Chunk I/O - bounded-concurrency read and write plans
//!
//! ```text
//!   plan: [local chunks ..., remote chunks ...]   (offsets by index)
//!            │
//!            ▼  Semaphore(max_inflight) + JoinSet
//!   write:  local  ─► NodeAgent::write_local(raw)
//!           remote ─► spawn_blocking(select codec) ─► Transport::transfer_to_node
//!   read:   local  ─► NodeAgent::read_local
//!           remote ─► Transport::fetch_from_node
//!           frames ─► spawn_blocking(decompress) ─► place at offset
//! ```

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use warp_compress::{decode_frame, CompressionMethod, CompressionSelector, SelectionHint};

use crate::agent::NodeAgent;
use crate::error::{PoolError, PoolResult};
use crate::metrics::PoolMetrics;
use crate::transport::Transport;
use crate::types::{ChunkRef, NodeId};

/// One chunk in an I/O plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChunk {
    /// Chunk to move
    pub chunk: ChunkRef,
    /// Byte offset of the chunk inside the tensor
    pub offset: u64,
}

/// Order chunks local-first, remembering each chunk's tensor offset
///
/// Offsets follow chunk index order regardless of execution order.
pub fn plan(chunks: &[ChunkRef], local: &NodeId) -> Vec<PlannedChunk> {
    let mut sorted: Vec<&ChunkRef> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.index());

    let mut offset = 0;
    let mut planned: Vec<PlannedChunk> = sorted
        .into_iter()
        .map(|chunk| {
            let p = PlannedChunk {
                chunk: chunk.clone(),
                offset,
            };
            offset += chunk.byte_size;
            p
        })
        .collect();
    // Stable: keeps index order within each group.
    planned.sort_by_key(|p| !p.chunk.is_on(local));
    planned
}

/// Encode `data` for storage, on the blocking pool
///
/// Returns the bytes to store and whether they are a compressed frame.
pub async fn encode_chunk(
    selector: Arc<CompressionSelector>,
    data: Bytes,
    hint: SelectionHint,
) -> PoolResult<(Bytes, bool)> {
    tokio::task::spawn_blocking(move || {
        let result = selector.compress(&data, hint);
        if result.method == CompressionMethod::None {
            (data, false)
        } else {
            (result.to_frame(), true)
        }
    })
    .await
    .map_err(PoolError::from)
}

/// Whether a stored frame decodes to something other than its input
pub fn is_lossy_frame(frame: &[u8]) -> bool {
    matches!(decode_frame(frame), Ok((method, _, _)) if !method.is_lossless())
}

/// Decode stored bytes back to the chunk's logical contents
pub async fn decode_chunk(
    selector: Arc<CompressionSelector>,
    chunk: &ChunkRef,
    data: Bytes,
    compressed: bool,
) -> PoolResult<Bytes> {
    let raw = if compressed {
        let out = tokio::task::spawn_blocking(move || selector.decompress_frame(&data)).await??;
        Bytes::from(out)
    } else {
        data
    };
    if raw.len() as u64 != chunk.byte_size {
        return Err(PoolError::transfer(
            &chunk.node_id,
            chunk.id,
            format!("chunk holds {} bytes, expected {}", raw.len(), chunk.byte_size),
        ));
    }
    Ok(raw)
}

/// Executes read and write plans
#[derive(Clone)]
pub struct ChunkIo {
    agent: Arc<NodeAgent>,
    transport: Arc<dyn Transport>,
    selector: Arc<CompressionSelector>,
    metrics: Arc<PoolMetrics>,
    max_inflight: usize,
}

impl ChunkIo {
    /// Create an executor allowing `max_inflight` concurrent chunk ops
    pub fn new(
        agent: Arc<NodeAgent>,
        transport: Arc<dyn Transport>,
        selector: Arc<CompressionSelector>,
        metrics: Arc<PoolMetrics>,
        max_inflight: usize,
    ) -> Self {
        Self {
            agent,
            transport,
            selector,
            metrics,
            max_inflight: max_inflight.max(1),
        }
    }

    /// Store `data` across `chunks`, updating each chunk's `compressed` flag
    ///
    /// Local chunks are written raw; remote chunks are compressed first.
    /// `data.len()` must equal the sum of chunk sizes.
    pub async fn write(
        &self,
        chunks: &mut [ChunkRef],
        data: Bytes,
        hint: SelectionHint,
        token: &CancellationToken,
    ) -> PoolResult<()> {
        let planned = plan(chunks, self.agent.id());
        let semaphore = Arc::new(Semaphore::new(self.max_inflight));
        let mut tasks: JoinSet<PoolResult<(u32, bool)>> = JoinSet::new();

        for p in planned {
            let permit = self.acquire(&semaphore, token).await?;
            let start = p.offset as usize;
            let slice = data.slice(start..start + p.chunk.byte_size as usize);
            let io = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let compressed = io.write_chunk(&p.chunk, slice, hint).await?;
                Ok((p.chunk.index(), compressed))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(PoolError::from).and_then(|r| r) {
                Ok((index, compressed)) => {
                    if let Some(chunk) = chunks.get_mut(index as usize) {
                        chunk.compressed = compressed;
                    }
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn write_chunk(&self, chunk: &ChunkRef, data: Bytes, hint: SelectionHint) -> PoolResult<bool> {
        if chunk.is_on(self.agent.id()) {
            self.agent.write_local(chunk.id, data, false)?;
            trace!(chunk = %chunk.id, "wrote local chunk");
            return Ok(false);
        }

        let (payload, compressed) = encode_chunk(self.selector.clone(), data, hint).await?;
        let len = payload.len() as u64;
        self.transport
            .transfer_to_node(&chunk.node_id, chunk.id, payload, compressed)
            .await
            .inspect_err(|_| self.metrics.record_transfer_error())?;
        self.metrics.record_transfer(len);
        trace!(chunk = %chunk.id, node = %chunk.node_id, len, compressed, "sent remote chunk");
        Ok(compressed)
    }

    /// Read and reassemble a tensor of `total_size` bytes
    pub async fn read(
        &self,
        chunks: &[ChunkRef],
        total_size: u64,
        token: &CancellationToken,
    ) -> PoolResult<Bytes> {
        let planned = plan(chunks, self.agent.id());
        let semaphore = Arc::new(Semaphore::new(self.max_inflight));
        let mut tasks: JoinSet<PoolResult<(u64, Bytes)>> = JoinSet::new();

        for p in planned {
            let permit = self.acquire(&semaphore, token).await?;
            let io = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let data = io.read_chunk(&p.chunk).await?;
                Ok((p.offset, data))
            });
        }

        let mut out = BytesMut::zeroed(total_size as usize);
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(PoolError::from).and_then(|r| r) {
                Ok((offset, data)) => {
                    let start = offset as usize;
                    let end = start + data.len();
                    if end > out.len() {
                        tasks.abort_all();
                        return Err(PoolError::Protocol(format!(
                            "chunk at offset {start} overruns tensor of {total_size} bytes"
                        )));
                    }
                    out[start..end].copy_from_slice(&data);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }
        Ok(out.freeze())
    }

    /// Fetch one chunk wherever it lives and decode it
    pub async fn read_chunk(&self, chunk: &ChunkRef) -> PoolResult<Bytes> {
        let (data, compressed) = if chunk.is_on(self.agent.id()) {
            self.agent.read_local(&chunk.id)?
        } else {
            let fetched = self
                .transport
                .fetch_from_node(&chunk.node_id, chunk.id)
                .await
                .inspect_err(|_| self.metrics.record_transfer_error())?;
            self.metrics.record_remote_fetch();
            fetched
        };
        decode_chunk(self.selector.clone(), chunk, data, compressed)
            .await
            .inspect_err(|e| {
                if matches!(e, PoolError::Compression(_)) {
                    self.metrics.record_compression_error();
                }
            })
    }

    async fn acquire(
        &self,
        semaphore: &Arc<Semaphore>,
        token: &CancellationToken,
    ) -> PoolResult<tokio::sync::OwnedSemaphorePermit> {
        if token.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                permit.map_err(|_| PoolError::Cancelled)
            }
            _ = token.cancelled() => Err(PoolError::Cancelled),
        }
    }
}
