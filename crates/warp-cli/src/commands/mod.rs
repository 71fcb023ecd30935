//! CLI command implementations

pub mod bench;
pub mod completions;
pub mod config;
pub mod serve;
pub mod simulate;

use anyhow::{bail, Context, Result};
use indicatif::ProgressStyle;

/// Parse a human size such as `512`, `64K`, `8M`, `1G` (binary units)
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim().to_uppercase();
    let s = s.strip_suffix("IB").or_else(|| s.strip_suffix('B')).unwrap_or(&s);
    let (digits, shift) = match s.chars().last() {
        Some('K') => (&s[..s.len() - 1], 10),
        Some('M') => (&s[..s.len() - 1], 20),
        Some('G') => (&s[..s.len() - 1], 30),
        Some('T') => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("Invalid size: {input}"))?;
    match value.checked_mul(1u64 << shift) {
        Some(0) => bail!("Size must be greater than zero: {input}"),
        Some(bytes) => Ok(bytes),
        None => bail!("Size overflows: {input}"),
    }
}

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

pub(crate) fn bar_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::with_template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
        .progress_chars("=> "))
}
