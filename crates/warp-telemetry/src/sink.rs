//! Node telemetry reports and their sinks
//!
//! Every node periodically publishes a [`NodeTelemetry`] record so that
//! placement decisions can weigh free memory across the cluster. The pool
//! hands each record to a [`TelemetrySink`]; what happens next is up to the
//! sink (log it, fan it out in-process, forward it to peers).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::{Result, TelemetryError};

/// A point-in-time memory report for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTelemetry {
    /// Reporting node
    pub node_id: String,
    /// Bytes still available under the node's budget
    pub ram_free: u64,
    /// The node's total memory budget
    pub ram_total: u64,
    /// Chunks currently resident on the node
    pub local_chunk_count: usize,
    /// When the report was taken
    pub timestamp: DateTime<Utc>,
}

impl NodeTelemetry {
    /// Build a report stamped with the current time
    pub fn now(node_id: impl Into<String>, ram_free: u64, ram_total: u64, local_chunk_count: usize) -> Self {
        Self {
            node_id: node_id.into(),
            ram_free,
            ram_total,
            local_chunk_count,
            timestamp: Utc::now(),
        }
    }

    /// Fraction of the budget in use, in `[0, 1]`
    pub fn utilization(&self) -> f64 {
        if self.ram_total == 0 {
            return 0.0;
        }
        let used = self.ram_total.saturating_sub(self.ram_free);
        used as f64 / self.ram_total as f64
    }
}

/// Receives node telemetry reports
pub trait TelemetrySink: Send + Sync {
    /// Publish one report
    fn emit(&self, report: &NodeTelemetry) -> Result<()>;
}

/// Writes each report as a structured `info!` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, report: &NodeTelemetry) -> Result<()> {
        info!(
            node_id = %report.node_id,
            ram_free = report.ram_free,
            ram_total = report.ram_total,
            local_chunk_count = report.local_chunk_count,
            utilization = report.utilization(),
            "node telemetry"
        );
        Ok(())
    }
}

/// Fans reports out to in-process subscribers
///
/// Also remembers the most recent report so late readers can catch up
/// without waiting for the next tick.
pub struct ChannelSink {
    tx: broadcast::Sender<NodeTelemetry>,
    last: Mutex<Option<NodeTelemetry>>,
}

impl ChannelSink {
    /// Create a sink with the given broadcast capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            last: Mutex::new(None),
        }
    }

    /// Subscribe to future reports
    pub fn subscribe(&self) -> broadcast::Receiver<NodeTelemetry> {
        self.tx.subscribe()
    }

    /// Most recently emitted report
    pub fn last(&self) -> Option<NodeTelemetry> {
        self.last.lock().clone()
    }
}

impl TelemetrySink for ChannelSink {
    fn emit(&self, report: &NodeTelemetry) -> Result<()> {
        *self.last.lock() = Some(report.clone());
        // No receivers is not an error; the report is still kept in `last`.
        if self.tx.receiver_count() > 0 {
            self.tx
                .send(report.clone())
                .map_err(|e| TelemetryError::Sink(e.to_string()))?;
        }
        Ok(())
    }
}
