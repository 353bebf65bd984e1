//! Subcommand implementations.
//!
//! - [`contours`] - generate contours for an area
//! - [`cache`] - inspect and prune the cache

pub mod cache;
pub mod contours;

use std::path::{Path, PathBuf};

use keyline_engine::EngineConfig;

use crate::error::CliError;

/// Load the config file (or defaults), then apply environment and flag overrides.
pub fn load_config(path: Option<&Path>, cache_root: Option<PathBuf>) -> Result<EngineConfig, CliError> {
    let mut config = match path {
        Some(p) => EngineConfig::load(p)?,
        None => EngineConfig::default(),
    };
    config.apply_env();
    if let Some(root) = cache_root {
        config.cache_root = root;
    }
    Ok(config)
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
