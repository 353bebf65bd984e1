//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use keyline_engine::catalog::footprint_from_item_id;
use keyline_engine::stage::prepare;
use keyline_engine::{
    BBox, CancellationToken, CatalogSource, ContentAddressedCache, DiscoveredTile, EngineError, Orchestrator,
    OrchestratorOptions, Resolution, Result, RetryPolicy, StageKind, StageParams, StageRunner, TileFetcher,
    TileIdentity,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

pub const COLLECTION: &str = "ch.swisstopo.swissalti3d";

/// Bytes served for a tile.
pub fn tile_bytes(item_id: &str) -> Vec<u8> {
    format!("GeoTIFF payload of {}", item_id).into_bytes()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A 1 km tile at the given kilometre grid position.
pub fn km_tile(e: u32, n: u32, freshness: &str) -> DiscoveredTile {
    let item_id = format!("swissalti3d_2019_{}-{}", e, n);
    DiscoveredTile {
        identity: TileIdentity {
            collection_id: COLLECTION.to_string(),
            item_id: item_id.clone(),
            file_id: format!("{}_2_2056_5728.tif", item_id),
            checksum: Some(sha256_hex(&tile_bytes(&item_id))),
            freshness: Some(freshness.to_string()),
        },
        href: format!("https://data.example.invalid/{}.tif", item_id),
        footprint: footprint_from_item_id(&item_id).expect("valid grid id"),
    }
}

/// The four tiles around (2 601 000, 1 201 000).
pub fn four_tiles() -> Vec<DiscoveredTile> {
    vec![
        km_tile(2601, 1201, "2021-01-01T00:00:00Z"),
        km_tile(2600, 1200, "2021-01-01T00:00:00Z"),
        km_tile(2601, 1200, "2021-01-01T00:00:00Z"),
        km_tile(2600, 1201, "2021-01-01T00:00:00Z"),
    ]
}

// ============================================================================
// Catalog
// ============================================================================

/// Catalog returning a configurable tile list, optionally failing first.
#[derive(Clone, Default)]
pub struct FakeCatalog {
    pub tiles: Arc<Mutex<Vec<DiscoveredTile>>>,
    pub calls: Arc<AtomicUsize>,
    pub failures_before_success: Arc<AtomicUsize>,
}

impl FakeCatalog {
    pub fn new(tiles: Vec<DiscoveredTile>) -> Self {
        Self {
            tiles: Arc::new(Mutex::new(tiles)),
            ..Self::default()
        }
    }

    pub fn failing(self, failures: usize) -> Self {
        self.failures_before_success.store(failures, Ordering::SeqCst);
        self
    }

    pub fn set_tiles(&self, tiles: Vec<DiscoveredTile>) {
        *self.tiles.lock().unwrap() = tiles;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CatalogSource for FakeCatalog {
    fn search(&self, _wgs84_bbox: &BBox, _resolution: Resolution) -> Result<Vec<DiscoveredTile>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_before_success.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_before_success.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::CatalogUnavailable {
                reason: "HTTP 503 Service Unavailable".to_string(),
                timed_out: false,
            });
        }
        Ok(self.tiles.lock().unwrap().clone())
    }
}

// ============================================================================
// Fetcher
// ============================================================================

/// Fetcher serving [`tile_bytes`], with optional corruption or transient
/// failures per item.
#[derive(Clone, Default)]
pub struct FakeFetcher {
    pub downloads: Arc<Mutex<Vec<String>>>,
    pub corrupt: Arc<Mutex<HashSet<String>>>,
    /// Remaining failed attempts per item before it downloads cleanly.
    pub failures: Arc<Mutex<HashMap<String, usize>>>,
}

impl FakeFetcher {
    pub fn corrupting(item_id: &str) -> Self {
        let fetcher = Self::default();
        fetcher.corrupt.lock().unwrap().insert(item_id.to_string());
        fetcher
    }

    /// The first `failures` attempts on `item_id` drop the connection halfway.
    pub fn flaky(item_id: &str, failures: usize) -> Self {
        let fetcher = Self::default();
        fetcher.failures.lock().unwrap().insert(item_id.to_string(), failures);
        fetcher
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }

    pub fn downloads_of(&self, item_id: &str) -> usize {
        self.downloads.lock().unwrap().iter().filter(|d| *d == item_id).count()
    }
}

impl TileFetcher for FakeFetcher {
    fn fetch(&self, tile: &DiscoveredTile, sink: &mut dyn Write) -> Result<u64> {
        let item_id = tile.identity.item_id.clone();
        self.downloads.lock().unwrap().push(item_id.clone());
        let mut bytes = tile_bytes(&item_id);
        if let Some(remaining) = self.failures.lock().unwrap().get_mut(&item_id) {
            if *remaining > 0 {
                *remaining -= 1;
                let _ = sink.write_all(&bytes[..bytes.len() / 2]);
                return Err(EngineError::TileDownload {
                    item_id,
                    reason: "connection reset by peer".to_string(),
                    timed_out: false,
                });
            }
        }
        if self.corrupt.lock().unwrap().contains(&item_id) {
            bytes.extend_from_slice(b" (truncated)");
        }
        sink.write_all(&bytes).map_err(|e| EngineError::TileDownload {
            item_id,
            reason: e.to_string(),
            timed_out: false,
        })?;
        Ok(bytes.len() as u64)
    }
}

// ============================================================================
// Toolchain
// ============================================================================

/// Terrain the fake contour stage pretends to trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Surface {
    /// Three nested contours at 500, 502 and 504 m.
    Hill,
    /// No contours at all.
    Flat,
    /// A single contour.
    Terrace,
}

/// Toolchain writing canned outputs.
///
/// Contours are emitted in a different order on every call, and each ring
/// starts at a different vertex and flips direction, the way a real tool's
/// traversal may change between runs.
#[derive(Clone)]
pub struct FakeToolchain {
    pub surface: Surface,
    pub calls: Arc<Mutex<Vec<StageKind>>>,
    pub params_seen: Arc<Mutex<Vec<StageParams>>>,
    pub fail_at: Option<StageKind>,
    pub cancel_at: Option<(StageKind, CancellationToken)>,
    /// Added to the call count when choosing feature order and ring traversal.
    pub order_offset: usize,
}

impl FakeToolchain {
    pub fn new(surface: Surface) -> Self {
        Self {
            surface,
            calls: Arc::new(Mutex::new(Vec::new())),
            params_seen: Arc::new(Mutex::new(Vec::new())),
            fail_at: None,
            cancel_at: None,
            order_offset: 0,
        }
    }

    pub fn calls(&self) -> Vec<StageKind> {
        self.calls.lock().unwrap().clone()
    }

    fn contours(&self, attribute: &str, call: usize) -> serde_json::Value {
        let levels: Vec<f64> = match self.surface {
            Surface::Hill => vec![500.0, 502.0, 504.0],
            Surface::Flat => vec![],
            Surface::Terrace => vec![500.0],
        };
        let mut features: Vec<serde_json::Value> = levels
            .iter()
            .enumerate()
            .map(|(i, level)| {
                let inset = 100.0 * (i as f64 + 1.0) + 0.004;
                let (x0, y0) = (2_600_500.0 + inset, 1_200_500.0 + inset);
                let (x1, y1) = (2_601_500.0 - inset, 1_201_500.0 - inset);
                let xm = (x0 + x1) / 2.0;
                // Sub-metre wobbles that a 1 m simplification removes.
                let mut ring = vec![[x0, y0], [xm, y0 + 0.3], [x1, y0], [x1, y1], [xm, y1 + 0.2], [x0, y1]];
                let turn = call + self.order_offset + i;
                let ring_len = ring.len();
                ring.rotate_left(turn % ring_len);
                if turn % 2 == 1 {
                    ring.reverse();
                }
                ring.push(ring[0]);
                let coordinates: Vec<[f64; 3]> = ring.iter().map(|p| [p[0], p[1], *level]).collect();

                let mut props = serde_json::Map::new();
                props.insert("ID".to_string(), json!(i));
                props.insert(attribute.to_string(), json!(level));
                json!({
                    "type": "Feature",
                    "properties": props,
                    "geometry": { "type": "LineString", "coordinates": coordinates }
                })
            })
            .collect();
        if (call + self.order_offset) % 2 == 1 {
            features.reverse();
        }
        json!({ "type": "FeatureCollection", "name": "contours", "features": features })
    }
}

impl StageRunner for FakeToolchain {
    fn run(&self, kind: StageKind, inputs: &[PathBuf], params: &StageParams, workdir: &Path) -> Result<PathBuf> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(kind);
            calls.len()
        };
        self.params_seen.lock().unwrap().push(params.clone());
        if let Some((stage, token)) = &self.cancel_at {
            if *stage == kind {
                token.cancel();
            }
        }

        let output = prepare(kind, inputs, workdir)?;
        if self.fail_at == Some(kind) {
            return Err(EngineError::ExternalTool {
                stage: kind,
                status: Some(1),
                diagnostics: format!("ERROR 1: {}: simulated failure\n", kind),
                timed_out: false,
            });
        }

        let content = match kind {
            StageKind::Mosaic => inputs
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join("\n")
                .into_bytes(),
            StageKind::Clip => b"clipped dem".to_vec(),
            StageKind::Contours => serde_json::to_vec(&self.contours(&params.attribute_name, call))?,
        };
        fs::write(&output, content).map_err(|e| EngineError::io(&output, e))?;
        Ok(output)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 2,
        jitter: 0.0,
    }
}

pub type FakeOrchestrator = Orchestrator<FakeCatalog, FakeFetcher, FakeToolchain>;

pub struct Harness {
    pub dir: TempDir,
    pub cache: Arc<ContentAddressedCache>,
    pub catalog: FakeCatalog,
    pub fetcher: FakeFetcher,
    pub toolchain: FakeToolchain,
    pub orchestrator: FakeOrchestrator,
}

impl Harness {
    pub fn new(catalog: FakeCatalog, fetcher: FakeFetcher, toolchain: FakeToolchain) -> Self {
        Self::with_retry(catalog, fetcher, toolchain, fast_retry(3))
    }

    pub fn with_retry(catalog: FakeCatalog, fetcher: FakeFetcher, toolchain: FakeToolchain, retry: RetryPolicy) -> Self {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ContentAddressedCache::open(dir.path().join("cache")).unwrap());
        let orchestrator = Orchestrator::new(
            catalog.clone(),
            fetcher.clone(),
            toolchain.clone(),
            Arc::clone(&cache),
            OrchestratorOptions {
                retry,
                max_concurrent_downloads: 4,
            },
        )
        .unwrap();
        Self {
            dir,
            cache,
            catalog,
            fetcher,
            toolchain,
            orchestrator,
        }
    }

    pub fn output_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Names of everything directly under the derived namespace.
    pub fn derived_listing(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.cache.derived().dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// Count of files per tile in the raw namespace, keyed by item id.
pub fn raw_files(cache: &ContentAddressedCache) -> HashMap<String, usize> {
    let mut out = HashMap::new();
    let collection = cache.raw().dir().join(COLLECTION);
    if let Ok(items) = fs::read_dir(collection) {
        for item in items {
            let item = item.unwrap();
            let count = fs::read_dir(item.path()).unwrap().count();
            out.insert(item.file_name().to_string_lossy().into_owned(), count);
        }
    }
    out
}
