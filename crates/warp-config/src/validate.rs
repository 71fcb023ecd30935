//! Configuration validation

use crate::{ConfigError, PoolConfig, Result};

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

impl PoolConfig {
    /// Check value ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.node.id.trim().is_empty() {
            return Err(ConfigError::MissingField("node.id"));
        }

        if self.memory.budget_bytes == 0 {
            return Err(invalid("memory.budget_bytes", "must be greater than zero"));
        }
        let threshold = self.memory.pressure_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(invalid(
                "memory.pressure_threshold",
                format!("{threshold} is outside (0, 1]"),
            ));
        }

        if self.chunk.chunk_size == 0 {
            return Err(invalid("chunk.chunk_size", "must be greater than zero"));
        }
        if self.chunk.chunk_size > self.memory.budget_bytes {
            return Err(invalid(
                "chunk.chunk_size",
                format!(
                    "{} exceeds the memory budget of {}",
                    self.chunk.chunk_size, self.memory.budget_bytes
                ),
            ));
        }

        if self.io.max_inflight_chunk_ops == 0 {
            return Err(invalid("io.max_inflight_chunk_ops", "must be at least 1"));
        }

        if self.cache.capacity_bytes == 0 {
            return Err(invalid("cache.capacity_bytes", "must be greater than zero"));
        }

        let confidence = self.prefetch.confidence_threshold;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(invalid(
                "prefetch.confidence_threshold",
                format!("{confidence} is outside [0, 1]"),
            ));
        }
        if self.prefetch.queue_capacity == 0 {
            return Err(invalid("prefetch.queue_capacity", "must be at least 1"));
        }

        if !(1..=22).contains(&self.compression.zstd_level) {
            return Err(invalid(
                "compression.zstd_level",
                format!("{} is outside 1..=22", self.compression.zstd_level),
            ));
        }

        for (field, value) in [
            ("tiering.promotion_interval_ms", self.tiering.promotion_interval_ms),
            ("tiering.idle_interval_ms", self.tiering.idle_interval_ms),
            ("prefetch.interval_ms", self.prefetch.interval_ms),
            ("telemetry.interval_secs", self.telemetry.interval_secs),
            ("reclaim.interval_secs", self.reclaim.interval_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "interval must be non-zero"));
            }
        }

        for peer in &self.node.peers {
            if peer.id == self.node.id {
                return Err(ConfigError::Validation(format!(
                    "peer list contains this node ({})",
                    peer.id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerConfig;

    fn field_of(err: ConfigError) -> String {
        match err {
            ConfigError::InvalidValue { field, .. } => field,
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn test_default_is_valid() {
        PoolConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_chunk_size() {
        let mut config = PoolConfig::default();
        config.chunk.chunk_size = 0;
        assert_eq!(field_of(config.validate().unwrap_err()), "chunk.chunk_size");
    }

    #[test]
    fn test_chunk_larger_than_budget() {
        let mut config = PoolConfig::default();
        config.memory.budget_bytes = 1024;
        config.chunk.chunk_size = 2048;
        assert_eq!(field_of(config.validate().unwrap_err()), "chunk.chunk_size");
    }

    #[test]
    fn test_zero_budget() {
        let mut config = PoolConfig::default();
        config.memory.budget_bytes = 0;
        assert_eq!(field_of(config.validate().unwrap_err()), "memory.budget_bytes");
    }

    #[test]
    fn test_pressure_threshold_range() {
        let mut config = PoolConfig::default();
        config.memory.pressure_threshold = 1.5;
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "memory.pressure_threshold"
        );
        config.memory.pressure_threshold = 1.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_inflight() {
        let mut config = PoolConfig::default();
        config.io.max_inflight_chunk_ops = 0;
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "io.max_inflight_chunk_ops"
        );
    }

    #[test]
    fn test_self_as_peer() {
        let mut config = PoolConfig::default();
        config.node.id = "a".into();
        config.node.peers.push(PeerConfig {
            id: "a".into(),
            addr: "127.0.0.1:1".into(),
            role: None,
            ram_total: 0,
        });
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::Validation(_)
        ));
    }
}
