//! bench command - time allocate/write/read/free on a single node

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use console::style;
use indicatif::ProgressBar;
use serde::Serialize;
use warp_config::PoolConfig;
use warp_pool::{AllocationHint, MemoryPool};

use super::{bar_style, format_bytes, parse_size};

/// Timings of one bench run
#[derive(Debug, Default, Serialize)]
pub struct BenchReport {
    /// Tensor size in bytes
    pub size: u64,
    /// Cycles run
    pub iterations: u32,
    /// Chunks per tensor
    pub chunks: usize,
    /// Mean allocate latency (ms)
    pub allocate_ms: f64,
    /// Mean write throughput (MB/s)
    pub write_mbps: f64,
    /// Mean cold read throughput (MB/s)
    pub read_mbps: f64,
    /// Mean cached read throughput (MB/s)
    pub cached_read_mbps: f64,
    /// Mean free latency (ms)
    pub free_ms: f64,
}

#[derive(Default)]
struct Totals {
    allocate: Duration,
    write: Duration,
    read: Duration,
    cached: Duration,
    free: Duration,
}

/// Execute the bench command
pub async fn execute(config: PoolConfig, size: &str, iterations: u32, json: bool) -> Result<()> {
    let size = parse_size(size)?;
    let iterations = iterations.max(1);
    let pool = MemoryPool::new(config).context("Failed to build memory pool")?;
    let payload = Bytes::from((0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>());

    let progress = if json {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(u64::from(iterations));
        bar.set_style(bar_style()?);
        bar
    };

    let mut totals = Totals::default();
    let mut chunks = 0;
    for i in 0..iterations {
        progress.set_message(format!("cycle {}", i + 1));

        let start = Instant::now();
        let id = pool
            .allocate(size, AllocationHint::labeled("bench"))
            .await
            .with_context(|| format!("Allocation of {} failed; check memory.budget_bytes", format_bytes(size)))?;
        totals.allocate += start.elapsed();
        chunks = pool.describe(id).await?.chunks.len();

        let start = Instant::now();
        pool.write(id, payload.clone()).await?;
        totals.write += start.elapsed();

        let start = Instant::now();
        let data = pool.read(id).await?;
        totals.read += start.elapsed();
        anyhow::ensure!(data == payload, "read returned different bytes than written");

        let start = Instant::now();
        pool.read(id).await?;
        totals.cached += start.elapsed();

        let start = Instant::now();
        pool.free(id).await?;
        totals.free += start.elapsed();

        progress.inc(1);
    }
    progress.finish_and_clear();

    let report = summarize(size, iterations, chunks, &totals);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn summarize(size: u64, iterations: u32, chunks: usize, totals: &Totals) -> BenchReport {
    let n = f64::from(iterations);
    let mb = size as f64 / (1024.0 * 1024.0);
    let rate = |total: Duration| {
        let secs = total.as_secs_f64() / n;
        if secs > 0.0 {
            mb / secs
        } else {
            0.0
        }
    };
    BenchReport {
        size,
        iterations,
        chunks,
        allocate_ms: totals.allocate.as_secs_f64() * 1000.0 / n,
        write_mbps: rate(totals.write),
        read_mbps: rate(totals.read),
        cached_read_mbps: rate(totals.cached),
        free_ms: totals.free.as_secs_f64() * 1000.0 / n,
    }
}

fn print_report(report: &BenchReport) {
    println!("{}", style("Pool Benchmark").bold().cyan());
    println!("{}", style("=".repeat(40)).dim());
    println!("Tensor:       {} in {} chunks", format_bytes(report.size), report.chunks);
    println!("Iterations:   {}", report.iterations);
    println!();
    println!("Allocate:     {:.3} ms", report.allocate_ms);
    println!("Write:        {} MB/s", style(format!("{:.1}", report.write_mbps)).green());
    println!("Read (cold):  {} MB/s", style(format!("{:.1}", report.read_mbps)).green());
    println!("Read (cache): {} MB/s", style(format!("{:.1}", report.cached_read_mbps)).green());
    println!("Free:         {:.3} ms", report.free_ms);
}
