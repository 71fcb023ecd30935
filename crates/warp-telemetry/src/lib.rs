//! warp-telemetry: logging setup and node telemetry
//!
//! - [`logging`]: `tracing-subscriber` initialisation from a [`LogConfig`]
//! - [`sink`]: periodic `{ram_free, ram_total, local_chunk_count}` reports
//!   and the sinks that receive them

#![warn(missing_docs)]

pub mod logging;
pub mod sink;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel, LogOutput};
pub use sink::{ChannelSink, NodeTelemetry, TelemetrySink, TracingSink};

use thiserror::Error;

/// Telemetry errors
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Subscriber could not be installed
    #[error("failed to initialise logging: {0}")]
    Init(String),

    /// Bad logging configuration
    #[error("logging configuration error: {0}")]
    Logging(String),

    /// Sink rejected a report
    #[error("telemetry sink error: {0}")]
    Sink(String),

    /// I/O error (log file creation)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;
