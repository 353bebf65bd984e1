//! Cache management commands.

use std::time::SystemTime;

use clap::Subcommand;
use keyline_engine::cache::prune;
use keyline_engine::{ContentAddressedCache, EngineConfig};

use super::format_size;
use crate::error::CliError;

/// Cache actions.
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show tile and artifact counts and sizes
    Stats,
    /// Remove expired and least-recently-used entries
    Prune {
        /// Override the derived-entry TTL in days
        #[arg(long)]
        ttl_days: Option<u64>,

        /// Override the derived namespace size limit in MiB
        #[arg(long)]
        max_mib: Option<u64>,
    },
}

/// Run a cache action.
pub fn run(action: CacheAction, config: &EngineConfig) -> Result<(), CliError> {
    let cache = ContentAddressedCache::open(&config.cache_root)?;
    match action {
        CacheAction::Stats => {
            let stats = cache.stats()?;
            println!("Cache: {}", cache.root().display());
            println!("  Raw tiles:      {} ({})", stats.raw_tiles, format_size(stats.raw_bytes));
            println!("  Derived entries: {} ({})", stats.derived_entries, format_size(stats.derived_bytes));
        }
        CacheAction::Prune { ttl_days, max_mib } => {
            let mut policy = config.eviction.clone();
            if let Some(days) = ttl_days {
                policy.ttl_days = days;
            }
            if let Some(mib) = max_mib {
                policy.max_derived_bytes = mib.saturating_mul(1024 * 1024);
            }
            let report = prune(&cache, &policy, SystemTime::now())?;
            println!("Pruned cache: {}", cache.root().display());
            println!("  Derived expired: {}", report.derived_expired);
            println!("  Derived evicted: {}", report.derived_evicted);
            println!("  Raw expired:     {}", report.raw_expired);
            println!("  Temp removed:    {}", report.temp_removed);
            println!("  Freed:           {}", format_size(report.bytes_freed));
        }
    }
    Ok(())
}
