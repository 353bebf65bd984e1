//! Tile download capability.

use std::io::Write;
use std::time::Duration;

use tracing::debug;

use crate::catalog::DiscoveredTile;
use crate::{EngineError, Result};

/// Downloads tile content.
///
/// Implementations stream the body into `sink` and return the byte count.
/// Transient failures are reported as [`EngineError::TileDownload`]; the
/// caller decides whether to retry.
pub trait TileFetcher: Send + Sync {
    /// Write the content of `tile` into `sink`.
    fn fetch(&self, tile: &DiscoveredTile, sink: &mut dyn Write) -> Result<u64>;
}

/// [`TileFetcher`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpTileFetcher {
    client: reqwest::blocking::Client,
}

impl HttpTileFetcher {
    /// Create a fetcher with a per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("keyline-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::TileDownload {
                item_id: String::new(),
                reason: format!("cannot build HTTP client: {}", e),
                timed_out: false,
            })?;
        Ok(Self { client })
    }
}

impl TileFetcher for HttpTileFetcher {
    fn fetch(&self, tile: &DiscoveredTile, sink: &mut dyn Write) -> Result<u64> {
        let item_id = &tile.identity.item_id;
        let download_error = |e: reqwest::Error| EngineError::TileDownload {
            item_id: item_id.clone(),
            reason: e.to_string(),
            timed_out: e.is_timeout(),
        };

        debug!(item = %item_id, url = %tile.href, "Downloading tile");
        let mut response = self.client.get(&tile.href).send().map_err(download_error)?;

        if !response.status().is_success() {
            return Err(EngineError::TileDownload {
                item_id: item_id.clone(),
                reason: format!("HTTP {}", response.status()),
                timed_out: false,
            });
        }

        response.copy_to(sink).map_err(download_error)
    }
}
