//! config command - print the effective configuration

use anyhow::{Context, Result};
use warp_config::PoolConfig;

/// Print `config` as TOML, or JSON with `json`
pub fn execute(config: &PoolConfig, json: bool) -> Result<()> {
    println!("{}", render(config, json)?);
    Ok(())
}

fn render(config: &PoolConfig, json: bool) -> Result<String> {
    if json {
        serde_json::to_string_pretty(config).context("Failed to serialize configuration")
    } else {
        config.to_toml().context("Failed to serialize configuration")
    }
}
