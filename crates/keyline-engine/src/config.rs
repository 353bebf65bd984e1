//! Engine configuration.
//!
//! Loaded from YAML; every field has a default so an empty file is valid.
//!
//! ```yaml
//! cache_root: /var/cache/keyline
//! download_timeout_secs: 60
//! max_concurrent_downloads: 2
//! retry:
//!   max_attempts: 5
//! eviction:
//!   ttl_days: 14
//! gdal:
//!   warp: /opt/gdal/bin/gdalwarp
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::EvictionPolicy;
use crate::catalog::{STAC_API_URL, SWISSALTI3D_COLLECTION};
use crate::retry::{self, RetryPolicy};
use crate::stage::GdalBinaries;
use crate::{EngineError, Result};

/// Environment variable overriding the network timeout, in seconds.
pub const DOWNLOAD_TIMEOUT_ENV: &str = "KEYLINE_DOWNLOAD_TIMEOUT";

/// Network timeout used when nothing valid is configured.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 120;

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Root of the tile and artifact cache.
    pub cache_root: PathBuf,
    /// STAC API base URL.
    pub catalog_url: String,
    /// STAC collection holding the elevation tiles.
    pub collection: String,
    /// Timeout for each catalog request and tile download.
    pub download_timeout_secs: u64,
    /// Timeout for each external tool invocation.
    pub tool_timeout_secs: u64,
    /// Upper bound on parallel tile downloads.
    pub max_concurrent_downloads: usize,
    /// Backoff for catalog queries and downloads.
    pub retry: RetryPolicy,
    /// Cache eviction limits.
    pub eviction: EvictionPolicy,
    /// GDAL tool locations.
    pub gdal: GdalBinaries,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            catalog_url: STAC_API_URL.to_string(),
            collection: SWISSALTI3D_COLLECTION.to_string(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            tool_timeout_secs: 600,
            max_concurrent_downloads: 4,
            retry: RetryPolicy::default(),
            eviction: EvictionPolicy::default(),
            gdal: GdalBinaries::default(),
        }
    }
}

/// `$HOME/.cache/keyline-planner`, or `.cache/keyline-planner` without a home.
pub fn default_cache_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join("keyline-planner")
}

impl EngineConfig {
    /// Parse and validate YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = if text.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        Self::from_yaml_str(&text).map_err(|e| match e {
            EngineError::Config(msg) => EngineError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.download_timeout_secs == 0 {
            return Err(EngineError::Config("download_timeout_secs must be positive".into()));
        }
        if self.tool_timeout_secs == 0 {
            return Err(EngineError::Config("tool_timeout_secs must be positive".into()));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(EngineError::Config("max_concurrent_downloads must be at least 1".into()));
        }
        if self.catalog_url.trim().is_empty() || self.collection.trim().is_empty() {
            return Err(EngineError::Config("catalog_url and collection must be set".into()));
        }
        retry::validate(&self.retry)
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self) {
        let value = std::env::var(DOWNLOAD_TIMEOUT_ENV).ok();
        self.apply_download_timeout_override(value.as_deref());
    }

    /// Apply a `KEYLINE_DOWNLOAD_TIMEOUT` value.
    ///
    /// Invalid or non-positive values fall back to the default with a warning.
    pub fn apply_download_timeout_override(&mut self, value: Option<&str>) {
        let Some(raw) = value else {
            return;
        };
        match raw.trim().parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs > 0.0 => {
                self.download_timeout_secs = secs.ceil() as u64;
            }
            _ => {
                warn!(
                    variable = DOWNLOAD_TIMEOUT_ENV,
                    value = raw,
                    fallback_secs = DEFAULT_DOWNLOAD_TIMEOUT_SECS,
                    "Ignoring invalid timeout override"
                );
                self.download_timeout_secs = DEFAULT_DOWNLOAD_TIMEOUT_SECS;
            }
        }
    }

    /// Network timeout.
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// External tool timeout.
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}
