//! Cache eviction.
//!
//! Derived entries are removed when unused for longer than the TTL, then
//! least-recently-used entries go until the namespace fits
//! `max_derived_bytes`. Raw tiles are only removed by TTL; they are cheap to
//! keep and expensive to fetch. Abandoned temporary files and directories
//! older than `temp_max_age_secs` are removed from both namespaces.
//!
//! Last use is the modification time of an entry's record file, which cache
//! hits bump.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::derived::ENTRY_FILE;
use crate::cache::raw::{item_dirs, tile_name_of_metadata};
use crate::cache::{dir_size, is_temporary_name, modified, ContentAddressedCache};
use crate::telemetry::CACHE_EVICTIONS;
use crate::{EngineError, Result};

const SECONDS_PER_DAY: u64 = 86_400;

/// Eviction limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvictionPolicy {
    /// Entries unused for longer than this many days are removed.
    pub ttl_days: u64,
    /// Size limit for the derived namespace.
    pub max_derived_bytes: u64,
    /// Age after which leftover temporary files count as abandoned.
    pub temp_max_age_secs: u64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            ttl_days: 30,
            max_derived_bytes: 2 * 1024 * 1024 * 1024,
            temp_max_age_secs: 3_600,
        }
    }
}

impl EvictionPolicy {
    fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_days.saturating_mul(SECONDS_PER_DAY))
    }
}

/// What a prune pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Derived entries removed because their TTL expired.
    pub derived_expired: usize,
    /// Derived entries removed to respect the size limit.
    pub derived_evicted: usize,
    /// Raw tiles removed because their TTL expired.
    pub raw_expired: usize,
    /// Abandoned temporary files and directories removed.
    pub temp_removed: usize,
    /// Total bytes freed.
    pub bytes_freed: u64,
}

struct DerivedCandidate {
    path: PathBuf,
    last_used: SystemTime,
    size: u64,
}

fn age(now: SystemTime, then: SystemTime) -> Duration {
    now.duration_since(then).unwrap_or(Duration::ZERO)
}

fn remove_path(path: &Path) -> Result<u64> {
    let (size, result) = if path.is_dir() {
        (dir_size(path)?, fs::remove_dir_all(path))
    } else {
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        (size, fs::remove_file(path))
    };
    match result {
        Ok(()) => Ok(size),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(EngineError::io(path, e)),
    }
}

/// Apply `policy` to `cache` as of `now`.
pub fn prune(cache: &ContentAddressedCache, policy: &EvictionPolicy, now: SystemTime) -> Result<PruneReport> {
    let mut report = PruneReport::default();
    let temp_max_age = Duration::from_secs(policy.temp_max_age_secs);

    // Derived namespace.
    let derived_dir = cache.derived().dir();
    let mut candidates = Vec::new();
    for entry in fs::read_dir(derived_dir).map_err(|e| EngineError::io(derived_dir, e))? {
        let entry = entry.map_err(|e| EngineError::io(derived_dir, e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        if is_temporary_name(&name) {
            if age(now, modified(&path)?) > temp_max_age {
                report.bytes_freed += remove_path(&path)?;
                report.temp_removed += 1;
            }
            continue;
        }
        if !path.is_dir() {
            continue;
        }

        // An entry without a readable record is treated as last used at its
        // directory's mtime so it still ages out.
        let record = path.join(ENTRY_FILE);
        let last_used = modified(&record).or_else(|_| modified(&path))?;
        let size = dir_size(&path)?;
        if age(now, last_used) > policy.ttl() {
            debug!(entry = %name, "Removing expired derived entry");
            report.bytes_freed += remove_path(&path)?;
            report.derived_expired += 1;
            metrics::counter!(CACHE_EVICTIONS.name, "namespace" => "derived", "reason" => "ttl").increment(1);
        } else {
            candidates.push(DerivedCandidate { path, last_used, size });
        }
    }

    let mut total: u64 = candidates.iter().map(|c| c.size).sum();
    candidates.sort_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| a.path.cmp(&b.path)));
    for candidate in candidates {
        if total <= policy.max_derived_bytes {
            break;
        }
        debug!(entry = %candidate.path.display(), "Evicting least recently used derived entry");
        report.bytes_freed += remove_path(&candidate.path)?;
        total = total.saturating_sub(candidate.size);
        report.derived_evicted += 1;
        metrics::counter!(CACHE_EVICTIONS.name, "namespace" => "derived", "reason" => "size").increment(1);
    }

    // Raw namespace.
    for item_dir in item_dirs(cache.raw().dir())? {
        for entry in fs::read_dir(&item_dir).map_err(|e| EngineError::io(&item_dir, e))? {
            let entry = entry.map_err(|e| EngineError::io(&item_dir, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if is_temporary_name(&name) {
                if age(now, modified(&path)?) > temp_max_age {
                    report.bytes_freed += remove_path(&path)?;
                    report.temp_removed += 1;
                }
                continue;
            }
            let Some(tile_name) = tile_name_of_metadata(&name) else {
                continue;
            };
            if age(now, modified(&path)?) > policy.ttl() {
                report.bytes_freed += remove_path(&item_dir.join(tile_name))?;
                report.bytes_freed += remove_path(&path)?;
                report.raw_expired += 1;
                metrics::counter!(CACHE_EVICTIONS.name, "namespace" => "raw", "reason" => "ttl").increment(1);
            }
        }
        let empty = fs::read_dir(&item_dir).map(|mut d| d.next().is_none()).unwrap_or(false);
        if empty {
            if let Err(e) = fs::remove_dir(&item_dir) {
                warn!(dir = %item_dir.display(), error = %e, "Failed to remove empty tile directory");
            }
        }
    }

    info!(
        derived_expired = report.derived_expired,
        derived_evicted = report.derived_evicted,
        raw_expired = report.raw_expired,
        temp_removed = report.temp_removed,
        bytes_freed = report.bytes_freed,
        "Cache pruned"
    );
    Ok(report)
}
