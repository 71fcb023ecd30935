//! serve command - run a networked pool node
//!
//! Binds a chunk server over the local agent so peers can place chunks
//! here, dials configured peers through the TCP transport, and runs the
//! background tasks until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use tokio_util::sync::CancellationToken;
use warp_config::PoolConfig;
use warp_pool::{ChunkServer, MemoryPool, TcpTransport};
use warp_telemetry::{NodeTelemetry, TelemetrySink, TracingSink};

use super::format_bytes;

const DEFAULT_LISTEN: &str = "0.0.0.0:7070";

/// Feeds peer telemetry into the transport's view of the cluster
struct PeerView {
    transport: Arc<TcpTransport>,
}

impl TelemetrySink for PeerView {
    fn emit(&self, report: &NodeTelemetry) -> warp_telemetry::Result<()> {
        self.transport.observe(report);
        TracingSink.emit(report)
    }
}

/// Execute the serve command
pub async fn execute(config: PoolConfig, listen: Option<String>, status_interval: u64) -> Result<()> {
    let addr: SocketAddr = listen
        .or_else(|| config.node.listen_addr.clone())
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
        .parse()
        .context("Invalid listen address")?;

    let transport = Arc::new(TcpTransport::from_config(&config).context("Invalid peer configuration")?);
    let peer_count = config.node.peers.len();
    let pool = MemoryPool::builder(config)
        .transport(transport.clone())
        .build()
        .context("Failed to build memory pool")?;

    let server = ChunkServer::bind(addr, pool.agent())
        .await
        .with_context(|| format!("Failed to bind chunk server on {addr}"))?
        .with_telemetry_sink(Arc::new(PeerView { transport }));
    let bound = server.local_addr();

    println!("{}", style("warp-pool node").bold().cyan());
    println!("{}", style("=".repeat(40)).dim());
    println!("Node:    {} ({})", style(pool.node_id()).green(), pool.role());
    println!("Listen:  {}", bound);
    println!("Budget:  {}", format_bytes(pool.config().memory.budget_bytes));
    println!("Chunk:   {}", format_bytes(pool.config().chunk.chunk_size));
    println!("Peers:   {}", peer_count);
    println!();

    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server.serve(shutdown.clone()));
    pool.start();

    let mut ticker = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = pool.status().await;
                tracing::info!(
                    used = status.memory.used,
                    free = status.memory.ram_free,
                    local_chunks = status.memory.local_chunks,
                    tensors = status.tensors.total,
                    "node status"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    println!("{}", style("Shutting down...").yellow());
    shutdown.cancel();
    pool.shutdown().await;
    serving
        .await
        .context("Chunk server task failed")?
        .context("Chunk server error")?;
    Ok(())
}
