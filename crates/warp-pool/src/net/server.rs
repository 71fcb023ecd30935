//! TCP chunk server - serves a node agent to remote pools

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warp_telemetry::{NodeTelemetry, TelemetrySink, TracingSink};

use super::frames::{frame_type, ChunkRequest, Message};
use crate::agent::NodeAgent;
use crate::error::PoolResult;

/// Listener serving ALLOCATE/PUT/GET/RELEASE/TELEMETRY for one agent
pub struct ChunkServer {
    listener: TcpListener,
    bind_addr: SocketAddr,
    agent: Arc<NodeAgent>,
    sink: Arc<dyn TelemetrySink>,
}

impl ChunkServer {
    /// Bind to an address
    pub async fn bind(addr: SocketAddr, agent: Arc<NodeAgent>) -> PoolResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bind_addr = listener.local_addr()?;

        info!(addr = %bind_addr, node = %agent.id(), "chunk server bound");

        Ok(Self {
            listener,
            bind_addr,
            agent,
            sink: Arc::new(TracingSink),
        })
    }

    /// Route peer telemetry reports to `sink`
    pub fn with_telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Get bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) -> PoolResult<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            let agent = self.agent.clone();
                            let sink = self.sink.clone();
                            let token = shutdown.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, agent, sink, token).await {
                                    warn!(%peer, error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(addr = %self.bind_addr, "shutting down chunk server");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    agent: Arc<NodeAgent>,
    sink: Arc<dyn TelemetrySink>,
    shutdown: CancellationToken,
) -> PoolResult<()> {
    stream.set_nodelay(true)?;
    loop {
        let request = tokio::select! {
            msg = Message::read_from(&mut stream) => msg?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let Some(request) = request else {
            return Ok(());
        };
        let response = dispatch(&agent, sink.as_ref(), request);
        response.write_to(&mut stream).await?;
    }
}

fn dispatch(agent: &NodeAgent, sink: &dyn TelemetrySink, request: Message) -> Message {
    match handle(agent, sink, &request) {
        Ok(response) => response,
        Err(e) => Message::error(e),
    }
}

fn handle(agent: &NodeAgent, sink: &dyn TelemetrySink, request: &Message) -> PoolResult<Message> {
    match request.frame_type {
        frame_type::ALLOCATE => {
            let req: ChunkRequest = request.meta()?;
            agent.allocate_local(req.chunk, req.size)?;
            Ok(Message::ack())
        }
        frame_type::PUT => {
            let req: ChunkRequest = request.meta()?;
            agent.write_local(req.chunk, request.payload.clone(), request.is_compressed())?;
            Ok(Message::ack())
        }
        frame_type::GET => {
            let req: ChunkRequest = request.meta()?;
            let (data, compressed) = agent.read_local(&req.chunk)?;
            Ok(Message::new(frame_type::DATA).with_payload(data, compressed))
        }
        frame_type::RELEASE => {
            let req: ChunkRequest = request.meta()?;
            agent.release_local(&req.chunk)?;
            Ok(Message::ack())
        }
        frame_type::TELEMETRY => {
            let report: NodeTelemetry = request.meta()?;
            if let Err(e) = sink.emit(&report) {
                warn!(node = %report.node_id, error = %e, "telemetry sink rejected report");
            }
            Ok(Message::ack())
        }
        other => Ok(Message::error(format!("unknown frame type {other:#04x}"))),
    }
}
