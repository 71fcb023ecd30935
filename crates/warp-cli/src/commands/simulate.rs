//! simulate command - layer-wise streaming over an in-memory cluster
//!
//! Builds a local node sized to hold `resident` layers plus `peers`
//! in-process peers, allocates every layer (overflow spills to peers), then
//! streams the layers in order through the pipeline optimizer.

use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use console::style;
use indicatif::ProgressBar;
use serde::Serialize;
use warp_config::PoolConfig;
use warp_pool::{
    AllocationHint, InMemoryCluster, MemoryPool, NodeAgent, NodeId, NodeRole, PipelineReport,
    PoolStatus, TensorId,
};

use super::{bar_style, format_bytes};

/// Shape of the simulated workload
#[derive(Debug, Clone, Serialize)]
pub struct SimulateOptions {
    /// Number of layers
    pub layers: usize,
    /// Bytes per layer
    pub layer_size: u64,
    /// Layers that fit on the local node
    pub resident: usize,
    /// In-memory peers
    pub peers: usize,
}

#[derive(Serialize)]
struct SimulateReport {
    options: SimulateOptions,
    pipeline: PipelineReport,
    status: PoolStatus,
    peer_usage: Vec<(NodeId, u64)>,
}

fn peer_role(i: usize) -> (NodeId, NodeRole) {
    if i % 2 == 0 {
        (NodeId::new(format!("cache-{i}")), NodeRole::Cache)
    } else {
        (NodeId::new(format!("overflow-{i}")), NodeRole::Overflow)
    }
}

fn simulated_config(mut config: PoolConfig, opts: &SimulateOptions) -> PoolConfig {
    config.chunk.chunk_size = config.chunk.chunk_size.min(opts.layer_size);
    let resident = opts.layer_size * opts.resident.max(1) as u64;
    // One chunk of headroom so the last resident layer stays under the threshold
    config.memory.budget_bytes = (resident as f64 / config.memory.pressure_threshold).ceil() as u64
        + config.chunk.chunk_size;
    config.telemetry.enabled = false;
    config
}

/// Execute the simulate command
pub async fn execute(config: PoolConfig, opts: SimulateOptions, json: bool) -> Result<()> {
    ensure!(opts.layers > 0, "At least one layer is required");
    ensure!(opts.peers > 0, "At least one peer is required to spill layers");

    let cluster = Arc::new(InMemoryCluster::new());
    let mut peers = Vec::with_capacity(opts.peers);
    for i in 0..opts.peers {
        let (id, role) = peer_role(i);
        let agent = Arc::new(NodeAgent::new(
            id,
            role,
            opts.layer_size * opts.layers as u64,
            config.memory.pressure_threshold,
        ));
        cluster.add_node(agent.clone());
        peers.push(agent);
    }

    let pool = MemoryPool::builder(simulated_config(config, &opts))
        .transport(cluster.clone())
        .build()
        .context("Failed to build memory pool")?;

    let progress = if json {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(opts.layers as u64);
        bar.set_style(bar_style()?);
        bar.set_message("allocating layers");
        bar
    };

    let mut layers: Vec<TensorId> = Vec::with_capacity(opts.layers);
    for i in 0..opts.layers {
        let id = pool
            .allocate(opts.layer_size, AllocationHint::labeled(format!("layer-{i}")))
            .await
            .with_context(|| format!("Failed to allocate layer {i}"))?;
        pool.write(id, vec![(i % 256) as u8; opts.layer_size as usize])
            .await
            .with_context(|| format!("Failed to write layer {i}"))?;
        layers.push(id);
        progress.inc(1);
    }

    progress.set_position(0);
    progress.set_message("streaming");
    let pipeline = pool
        .run_sequential(&layers, |i, data| {
            if data.first().copied() != Some((i % 256) as u8) {
                return Err(warp_pool::PoolError::Protocol(format!("layer {i} returned wrong data")));
            }
            progress.inc(1);
            Ok(())
        })
        .await
        .context("Sequential run failed")?;
    progress.finish_and_clear();

    let report = SimulateReport {
        options: opts,
        pipeline,
        status: pool.status().await,
        peer_usage: peers.iter().map(|p| (p.id().clone(), p.used())).collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    pool.shutdown().await;
    Ok(())
}

fn print_report(report: &SimulateReport) {
    let p = &report.pipeline;
    println!("{}", style("Layer Streaming Simulation").bold().cyan());
    println!("{}", style("=".repeat(40)).dim());
    println!(
        "Layers:      {} x {} ({} resident)",
        report.options.layers,
        format_bytes(report.options.layer_size),
        report.options.resident
    );
    println!("Elapsed:     {} ms", p.elapsed.as_millis());
    println!("Prefetched:  {}", style(p.prefetched).green());
    println!("Queued:      {}", p.queued);
    println!("Evicted:     {}", style(p.evicted).yellow());
    println!("Stalls:      {}", style(p.stalls).red());
    println!();
    println!("{}", style("Local node").bold().underlined());
    println!(
        "Used:        {} of {}",
        format_bytes(report.status.memory.used),
        format_bytes(report.status.memory.ram_total)
    );
    println!(
        "Tiers:       L1={} L2={} L3={}",
        report.status.tensors.l1_local, report.status.tensors.l2_mixed, report.status.tensors.l3_remote
    );
    println!("Compression: {:.2}x", report.status.performance.compression_ratio);
    println!();
    println!("{}", style("Peers").bold().underlined());
    for (id, used) in &report.peer_usage {
        println!("{:<12} {}", id.to_string(), format_bytes(*used));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_config_fits_resident_layers() {
        let opts = SimulateOptions {
            layers: 8,
            layer_size: 1 << 20,
            resident: 3,
            peers: 2,
        };
        let config = simulated_config(PoolConfig::default(), &opts);
        let threshold = config.memory.pressure_threshold;
        let usable = (config.memory.budget_bytes as f64 * threshold) as u64;
        assert!(usable >= 3 << 20);
        assert!(config.chunk.chunk_size <= opts.layer_size);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_peer_roles_alternate() {
        assert_eq!(peer_role(0).1, NodeRole::Cache);
        assert_eq!(peer_role(1).1, NodeRole::Overflow);
        assert_eq!(peer_role(3).0, NodeId::from("overflow-3"));
    }

    #[tokio::test]
    async fn test_simulation_streams_all_layers() {
        let mut config = PoolConfig::default();
        config.node.id = "gpu-sim".into();
        let opts = SimulateOptions {
            layers: 6,
            layer_size: 8 << 10,
            resident: 2,
            peers: 2,
        };
        execute(config, opts, true).await.unwrap();
    }
}
