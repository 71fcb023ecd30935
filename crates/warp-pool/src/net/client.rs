//! TCP transport - talks to remote chunk servers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use warp_config::PoolConfig;
use warp_telemetry::{NodeTelemetry, TelemetrySink};

use super::frames::{frame_type, ChunkRequest, Message};
use crate::error::{PoolError, PoolResult};
use crate::transport::Transport;
use crate::types::{ChunkId, NodeDescriptor, NodeId, NodeRole};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct Peer {
    addr: String,
    descriptor: RwLock<NodeDescriptor>,
    /// One reusable connection; requests to the same peer are serialized
    conn: Mutex<Option<TcpStream>>,
}

/// Transport over per-peer TCP connections
#[derive(Default)]
pub struct TcpTransport {
    peers: DashMap<NodeId, Arc<Peer>>,
}

impl TcpTransport {
    /// Create a transport with no peers
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the configured static peer list
    pub fn from_config(config: &PoolConfig) -> PoolResult<Self> {
        let transport = Self::new();
        for peer in &config.node.peers {
            let role = match &peer.role {
                Some(role) => role.parse()?,
                None => NodeRole::from_hostname(&peer.id),
            };
            transport.add_peer(
                NodeDescriptor {
                    id: NodeId::new(peer.id.clone()),
                    role,
                    ram_total: peer.ram_total,
                    ram_free: peer.ram_total,
                },
                peer.addr.clone(),
            );
        }
        Ok(transport)
    }

    /// Register a peer reachable at `addr`
    pub fn add_peer(&self, descriptor: NodeDescriptor, addr: impl Into<String>) {
        let id = descriptor.id.clone();
        self.peers.insert(
            id,
            Arc::new(Peer {
                addr: addr.into(),
                descriptor: RwLock::new(descriptor),
                conn: Mutex::new(None),
            }),
        );
    }

    /// Update a peer's free memory from its telemetry
    pub fn observe(&self, report: &NodeTelemetry) {
        if let Some(peer) = self.peers.get(&NodeId::new(report.node_id.clone())) {
            let mut desc = peer.descriptor.write();
            desc.ram_total = report.ram_total;
            desc.ram_free = report.ram_free;
        }
    }

    /// One request/response exchange; remote ERROR replies become `Protocol`
    async fn request(&self, node: &NodeId, msg: Message) -> PoolResult<Message> {
        let peer = self
            .peers
            .get(node)
            .map(|p| p.value().clone())
            .ok_or_else(|| PoolError::NotFound(format!("peer {node}")))?;
        let mut conn = peer.conn.lock().await;

        if conn.is_none() {
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&peer.addr))
                .await
                .map_err(|_| PoolError::Protocol(format!("connect to {} timed out", peer.addr)))??;
            stream.set_nodelay(true)?;
            debug!(%node, addr = %peer.addr, "connected to peer");
            *conn = Some(stream);
        }

        let result = match conn.as_mut() {
            Some(stream) => tokio::time::timeout(REQUEST_TIMEOUT, round_trip(stream, &msg))
                .await
                .unwrap_or_else(|_| Err(PoolError::Protocol("request timed out".into()))),
            None => Err(PoolError::Protocol("connection unavailable".into())),
        };

        match result {
            Ok(response) if response.frame_type == frame_type::ERROR => {
                Err(PoolError::Protocol(response.error_reason()))
            }
            Ok(response) => Ok(response),
            Err(e) => {
                // The stream may be mid-frame; reconnect on next use.
                *conn = None;
                warn!(%node, error = %e, "peer request failed");
                Err(e)
            }
        }
    }

    async fn chunk_op(&self, node: &NodeId, chunk: ChunkId, msg: Message, expect: u8) -> PoolResult<Message> {
        let response = self
            .request(node, msg)
            .await
            .map_err(|e| PoolError::transfer(node, chunk, e))?;
        if response.frame_type != expect {
            return Err(PoolError::transfer(
                node,
                chunk,
                format!("unexpected response type {:#04x}", response.frame_type),
            ));
        }
        Ok(response)
    }

    fn chunk_request(ty: u8, chunk: ChunkId, size: u64) -> PoolResult<Message> {
        Message::new(ty).with_meta(&ChunkRequest { chunk, size })
    }
}

async fn round_trip(stream: &mut TcpStream, msg: &Message) -> PoolResult<Message> {
    msg.write_to(stream).await?;
    Message::read_from(stream)
        .await?
        .ok_or_else(|| PoolError::Protocol("peer closed connection".into()))
}

#[async_trait]
impl Transport for TcpTransport {
    async fn allocate_remote(&self, node: &NodeId, chunk: ChunkId, size: u64) -> PoolResult<()> {
        let msg = Self::chunk_request(frame_type::ALLOCATE, chunk, size)?;
        self.chunk_op(node, chunk, msg, frame_type::ACK).await?;
        Ok(())
    }

    async fn transfer_to_node(
        &self,
        node: &NodeId,
        chunk: ChunkId,
        data: Bytes,
        compressed: bool,
    ) -> PoolResult<()> {
        let msg = Self::chunk_request(frame_type::PUT, chunk, data.len() as u64)?
            .with_payload(data, compressed);
        self.chunk_op(node, chunk, msg, frame_type::ACK).await?;
        Ok(())
    }

    async fn fetch_from_node(&self, node: &NodeId, chunk: ChunkId) -> PoolResult<(Bytes, bool)> {
        let msg = Self::chunk_request(frame_type::GET, chunk, 0)?;
        let response = self.chunk_op(node, chunk, msg, frame_type::DATA).await?;
        let compressed = response.is_compressed();
        Ok((response.payload, compressed))
    }

    async fn release_remote(&self, node: &NodeId, chunk: ChunkId) -> PoolResult<()> {
        let msg = Self::chunk_request(frame_type::RELEASE, chunk, 0)?;
        self.chunk_op(node, chunk, msg, frame_type::ACK).await?;
        Ok(())
    }

    fn peers(&self) -> Vec<NodeDescriptor> {
        let mut peers: Vec<NodeDescriptor> = self
            .peers
            .iter()
            .map(|p| p.descriptor.read().clone())
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    async fn publish_telemetry(&self, report: &NodeTelemetry) -> PoolResult<()> {
        let msg = Message::new(frame_type::TELEMETRY).with_meta(report)?;
        let ids: Vec<NodeId> = self.peers.iter().map(|p| p.key().clone()).collect();

        let mut failed = Vec::new();
        for node in ids {
            if let Err(e) = self.request(&node, msg.clone()).await {
                failed.push(format!("{node}: {e}"));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Protocol(format!(
                "telemetry not delivered to {}",
                failed.join(", ")
            )))
        }
    }
}

/// Peer reports update the transport's view of peer free memory
impl TelemetrySink for TcpTransport {
    fn emit(&self, report: &NodeTelemetry) -> warp_telemetry::Result<()> {
        self.observe(report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NodeAgent;
    use crate::net::ChunkServer;
    use crate::types::TensorId;
    use tokio_util::sync::CancellationToken;

    async fn spawn_server(id: &str) -> (Arc<NodeAgent>, String, CancellationToken) {
        let agent = Arc::new(NodeAgent::new(NodeId::from(id), NodeRole::Cache, 1 << 20, 0.9));
        let server = ChunkServer::bind("127.0.0.1:0".parse().unwrap(), agent.clone())
            .await
            .unwrap();
        let addr = server.local_addr().to_string();
        let token = CancellationToken::new();
        tokio::spawn(server.serve(token.clone()));
        (agent, addr, token)
    }

    fn descriptor(id: &str) -> NodeDescriptor {
        NodeDescriptor {
            id: NodeId::from(id),
            role: NodeRole::Cache,
            ram_total: 1 << 20,
            ram_free: 1 << 20,
        }
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let (agent, addr, token) = spawn_server("cache-a").await;
        let transport = TcpTransport::new();
        transport.add_peer(descriptor("cache-a"), addr);

        let node = NodeId::from("cache-a");
        let chunk = ChunkId::new(TensorId::new(), 0);

        transport.allocate_remote(&node, chunk, 5).await.unwrap();
        transport
            .transfer_to_node(&node, chunk, Bytes::from_static(b"hello"), false)
            .await
            .unwrap();
        assert_eq!(agent.chunk_count(), 1);

        let (data, compressed) = transport.fetch_from_node(&node, chunk).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert!(!compressed);

        transport.release_remote(&node, chunk).await.unwrap();
        assert_eq!(agent.chunk_count(), 0);

        token.cancel();
    }

    #[tokio::test]
    async fn test_remote_error_becomes_transfer_error() {
        let (_agent, addr, token) = spawn_server("cache-b").await;
        let transport = TcpTransport::new();
        transport.add_peer(descriptor("cache-b"), addr);

        let node = NodeId::from("cache-b");
        let chunk = ChunkId::new(TensorId::new(), 0);
        let err = transport.fetch_from_node(&node, chunk).await.unwrap_err();
        assert!(matches!(err, PoolError::Transfer { .. }));

        // Connection is still usable after an application-level error.
        transport.allocate_remote(&node, chunk, 1).await.unwrap();
        token.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let transport = TcpTransport::new();
        // Port 9 on localhost is almost never listening.
        transport.add_peer(descriptor("ghost"), "127.0.0.1:9");
        let err = transport
            .allocate_remote(&NodeId::from("ghost"), ChunkId::new(TensorId::new(), 0), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Transfer { .. }));
    }

    #[test]
    fn test_observe_updates_descriptor() {
        let transport = TcpTransport::new();
        transport.add_peer(descriptor("cache-c"), "127.0.0.1:1");
        transport
            .emit(&NodeTelemetry::now("cache-c", 10, 1 << 20, 4))
            .unwrap();
        assert_eq!(transport.peers()[0].ram_free, 10);
    }
}
