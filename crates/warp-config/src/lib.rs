//! Configuration for a warp-pool node
//!
//! A node reads one TOML document (see [`PoolConfig`]), then applies
//! `WARP_POOL_*` environment overrides, then validates the result. Every
//! section has defaults, so an empty file or no file at all yields a
//! working single-node pool.

pub mod config;
pub mod validate;

pub use config::*;

use thiserror::Error;

/// Errors raised while loading or checking a [`PoolConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for [`PoolConfig`]
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be rendered back to TOML
    #[error("failed to render config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Required field is empty
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Field holds an out-of-range value
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Dotted field path, e.g. `memory.pressure_threshold`
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// Fields are individually valid but conflict
    #[error("inconsistent config: {0}")]
    Validation(String),

    /// Override variable could not be parsed
    #[error("bad override {var}: {message}")]
    Env {
        /// Full variable name
        var: String,
        /// Parse failure
        message: String,
    },
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;
