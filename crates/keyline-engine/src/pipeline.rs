//! Pipeline orchestration.
//!
//! A run walks a fixed sequence of states:
//!
//! ```text
//! Start -> Normalized -> TilesDiscovered -> TilesCached -> MosaicBuilt
//!       -> Clipped -> ContoursExtracted -> Canonicalized -> Completed
//! ```
//!
//! Any error ends the run in `Failed`: the caller receives
//! [`EngineError::Pipeline`] carrying the last state reached and the
//! originating error, or [`EngineError::Cancelled`] when the cancellation
//! token was observed between two states.
//!
//! The cache key is derived right after discovery. When the derived cache
//! already holds a valid entry for it, tile fetching and all three external
//! stages are skipped and only canonicalization and manifest assembly run.
//!
//! Only catalog queries and tile downloads are retried, under the injected
//! [`RetryPolicy`]. Tile downloads run in parallel on a dedicated pool
//! bounded by `max_concurrent_downloads`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::area::{normalize, Area, AreaInput, Crs};
use crate::cache::derived::DerivedEntry;
use crate::cache::{CacheKey, ContentAddressedCache};
use crate::canonical::{canonicalize, elevation_range, parse_geojson_features, to_geojson_string};
use crate::catalog::{CatalogSource, DiscoveredTile, TileCatalogClient, TileIdentity};
use crate::config::EngineConfig;
use crate::fetch::TileFetcher;
use crate::manifest::{
    AreaSummary, Manifest, OutputFiles, ProcessingResult, ProcessingSettings, StageTiming, ATTRIBUTION,
};
use crate::params::ContourParams;
use crate::retry::RetryPolicy;
use crate::stage::{ResampleMethod, StageKind, StageParams, StageRunner, NODATA};
use crate::telemetry::{PIPELINE_RUNS, STAGE_DURATION};
use crate::{EngineError, Result};

/// Clip artifact name inside a derived entry.
pub const DEM_ARTIFACT: &str = "dem_clip.tif";

/// Raw contour artifact name inside a derived entry.
pub const CONTOURS_ARTIFACT: &str = "contours_raw.geojson";

const CUTLINE_FILE: &str = "cutline.geojson";

/// Position of a run in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum PipelineState {
    /// Nothing done yet.
    Start,
    /// Area validated and in LV95.
    Normalized,
    /// Covering tiles known.
    TilesDiscovered,
    /// All tiles in the raw cache.
    TilesCached,
    /// Mosaic built.
    MosaicBuilt,
    /// Mosaic clipped to the area.
    Clipped,
    /// Raw contours extracted.
    ContoursExtracted,
    /// Features rounded and ordered.
    Canonicalized,
    /// Result delivered.
    Completed,
    /// Run aborted.
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Cooperative cancellation flag shared between a run and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; observed at the next state boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One contour generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    /// Area of interest as supplied.
    pub area: AreaInput,
    /// CRS of `area`.
    pub crs: Crs,
    /// Processing parameters.
    pub params: ContourParams,
    /// Directory receiving `contours.geojson` and `manifest.json`, if any.
    pub output_dir: Option<PathBuf>,
}

/// Tunables of the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorOptions {
    /// Backoff for catalog queries and tile downloads.
    pub retry: RetryPolicy,
    /// Upper bound on parallel tile downloads.
    pub max_concurrent_downloads: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrent_downloads: 4,
        }
    }
}

impl From<&EngineConfig> for OrchestratorOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            max_concurrent_downloads: config.max_concurrent_downloads,
        }
    }
}

/// Outcome of [`Orchestrator::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    /// Contours and manifest.
    pub result: ProcessingResult,
    /// Files written, when the request named an output directory.
    pub files: Option<OutputFiles>,
    /// Whether the derived cache served the computation.
    pub cache_hit: bool,
}

/// Mutable bookkeeping of one run.
struct RunState {
    state: PipelineState,
    timings: Vec<StageTiming>,
}

impl RunState {
    fn advance(&mut self, state: PipelineState, cancel: &CancellationToken) -> Result<()> {
        self.state = state;
        info!(state = %state, "Pipeline state reached");
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled { state });
        }
        Ok(())
    }

    fn time(&mut self, stage: &str, started: Instant, cached: bool) {
        let elapsed = started.elapsed();
        metrics::histogram!(STAGE_DURATION.name, "stage" => stage.to_string()).record(elapsed.as_secs_f64() * 1000.0);
        self.timings.push(StageTiming {
            stage: stage.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            cached,
        });
    }
}

/// Drives one pipeline run from user input to canonical contours.
pub struct Orchestrator<S, F, R> {
    catalog: TileCatalogClient<S>,
    fetcher: F,
    stages: R,
    cache: Arc<ContentAddressedCache>,
    retry: RetryPolicy,
    pool: rayon::ThreadPool,
}

impl<S, F, R> Orchestrator<S, F, R>
where
    S: CatalogSource,
    F: TileFetcher,
    R: StageRunner,
{
    /// Assemble an orchestrator from its capabilities and an opened cache.
    pub fn new(catalog: S, fetcher: F, stages: R, cache: Arc<ContentAddressedCache>, options: OrchestratorOptions) -> Result<Self> {
        let threads = options.max_concurrent_downloads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("keyline-fetch-{}", i))
            .build()
            .map_err(|e| EngineError::Config(format!("cannot start download pool: {}", e)))?;
        Ok(Self {
            catalog: TileCatalogClient::new(catalog),
            fetcher,
            stages,
            cache,
            retry: options.retry,
            pool,
        })
    }

    /// The cache this orchestrator reads and writes.
    pub fn cache(&self) -> &ContentAddressedCache {
        &self.cache
    }

    /// Execute `request`. No partial result is returned on failure.
    pub fn run(&self, request: &PipelineRequest, cancel: &CancellationToken) -> Result<RunOutput> {
        let mut run = RunState {
            state: PipelineState::Start,
            timings: Vec::new(),
        };
        match self.execute(request, cancel, &mut run) {
            Ok(output) => {
                metrics::counter!(PIPELINE_RUNS.name, "outcome" => "success").increment(1);
                Ok(output)
            }
            Err(err) => {
                metrics::counter!(PIPELINE_RUNS.name, "outcome" => err.kind()).increment(1);
                warn!(state = %run.state, error = %err, "Pipeline failed");
                Err(match err {
                    EngineError::Cancelled { .. } => err,
                    source => EngineError::Pipeline {
                        state: run.state,
                        source: Box::new(source),
                    },
                })
            }
        }
    }

    fn execute(&self, request: &PipelineRequest, cancel: &CancellationToken, run: &mut RunState) -> Result<RunOutput> {
        let params = &request.params;
        params.validate()?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled { state: run.state });
        }

        let started = Instant::now();
        let area = normalize(&request.area, request.crs)?;
        run.time("normalize", started, false);
        info!(hash = %area.canonical_hash(), area_m2 = area.area_m2(), "Area normalized");
        run.advance(PipelineState::Normalized, cancel)?;

        let started = Instant::now();
        let tiles = self
            .retry
            .run("catalog query", cancel, |_| self.catalog.discover(&area, params.resolution))?;
        run.time("discover", started, false);
        run.advance(PipelineState::TilesDiscovered, cancel)?;

        let identities: Vec<TileIdentity> = tiles.iter().map(|t| t.identity.clone()).collect();
        let key = CacheKey::derive(&area, params, &identities)?;
        debug!(key = %key, tiles = identities.len(), "Derived cache key");

        let (entry, cache_hit) = self
            .cache
            .derived()
            .get_or_compute(&key, &identities, |staging| self.compute(&area, &tiles, params, staging, cancel, run))?;

        if cache_hit {
            info!(key = %key, "Derived cache hit; skipping download and processing");
            for stage in ["fetch", "mosaic", "clip", "contours"] {
                run.timings.push(StageTiming {
                    stage: stage.to_string(),
                    duration_ms: 0,
                    cached: true,
                });
            }
            for state in [
                PipelineState::TilesCached,
                PipelineState::MosaicBuilt,
                PipelineState::Clipped,
                PipelineState::ContoursExtracted,
            ] {
                run.advance(state, cancel)?;
            }
        }

        let started = Instant::now();
        let features = self.read_contours(&entry, params)?;
        let geojson = to_geojson_string(&features, &params.attribute_name)?;
        run.time("canonicalize", started, false);
        if features.len() <= 1 {
            warn!(
                features = features.len(),
                interval = params.interval,
                "Surface is flat within the contour interval; few or no contours produced"
            );
        }
        run.advance(PipelineState::Canonicalized, cancel)?;

        let manifest = Manifest {
            engine_version: crate::VERSION.to_string(),
            created_at: Utc::now().to_rfc3339(),
            area: AreaSummary::of(&area),
            parameters: params.clone(),
            processing: ProcessingSettings::from(&stage_params(params)),
            cache_key: key.to_string(),
            tiles: identities,
            timings: std::mem::take(&mut run.timings),
            contour_count: features.len(),
            elevation_range: elevation_range(&features).map(|(lo, hi)| [lo, hi]),
            attribution: ATTRIBUTION.to_string(),
        };
        let result = ProcessingResult {
            features,
            geojson,
            manifest,
        };
        let files = match &request.output_dir {
            Some(dir) => Some(result.write_to(dir)?),
            None => None,
        };

        run.state = PipelineState::Completed;
        info!(contours = result.features.len(), cache_hit, "Pipeline completed");
        Ok(RunOutput {
            result,
            files,
            cache_hit,
        })
    }

    /// Cold path: fetch tiles and run the three stages inside `staging`.
    fn compute(
        &self,
        area: &Area,
        tiles: &[DiscoveredTile],
        params: &ContourParams,
        staging: &Path,
        cancel: &CancellationToken,
        run: &mut RunState,
    ) -> Result<Vec<String>> {
        let started = Instant::now();
        let tile_paths = self.fetch_tiles(tiles, cancel)?;
        run.time("fetch", started, false);
        run.advance(PipelineState::TilesCached, cancel)?;

        let stage_params = stage_params(params);

        let mosaic = self.run_stage(StageKind::Mosaic, &tile_paths, &stage_params, staging, run)?;
        run.advance(PipelineState::MosaicBuilt, cancel)?;

        let cutline = write_cutline(area, &staging.join("cutline"))?;
        let clipped = self.run_stage(StageKind::Clip, &[mosaic, cutline], &stage_params, staging, run)?;
        run.advance(PipelineState::Clipped, cancel)?;

        let contours = self.run_stage(StageKind::Contours, &[clipped.clone()], &stage_params, staging, run)?;

        // Keep only the artifacts in the entry.
        for (from, name) in [(&clipped, DEM_ARTIFACT), (&contours, CONTOURS_ARTIFACT)] {
            let to = staging.join(name);
            fs::rename(from, &to).map_err(|e| EngineError::io(&to, e))?;
        }
        for kind in StageKind::ALL {
            let dir = stage_workdir(staging, kind);
            fs::remove_dir_all(&dir).map_err(|e| EngineError::io(&dir, e))?;
        }
        let cutline_dir = staging.join("cutline");
        fs::remove_dir_all(&cutline_dir).map_err(|e| EngineError::io(&cutline_dir, e))?;

        run.advance(PipelineState::ContoursExtracted, cancel)?;
        Ok(vec![DEM_ARTIFACT.to_string(), CONTOURS_ARTIFACT.to_string()])
    }

    fn run_stage(
        &self,
        kind: StageKind,
        inputs: &[PathBuf],
        params: &StageParams,
        staging: &Path,
        run: &mut RunState,
    ) -> Result<PathBuf> {
        let started = Instant::now();
        let output = self.stages.run(kind, inputs, params, &stage_workdir(staging, kind))?;
        run.time(kind.as_str(), started, false);
        Ok(output)
    }

    /// Bring every tile into the raw cache, in parallel, preserving order.
    fn fetch_tiles(&self, tiles: &[DiscoveredTile], cancel: &CancellationToken) -> Result<Vec<PathBuf>> {
        let raw = self.cache.raw();
        self.pool.install(|| {
            tiles
                .par_iter()
                .map(|tile| {
                    if cancel.is_cancelled() {
                        return Err(EngineError::Cancelled {
                            state: PipelineState::TilesDiscovered,
                        });
                    }
                    let label = format!("download {}", tile.identity.item_id);
                    self.retry.run(&label, cancel, |_| {
                        raw.get_or_fetch(&tile.identity, |sink| self.fetcher.fetch(tile, sink))
                    })
                })
                .collect()
        })
    }

    fn read_contours(&self, entry: &DerivedEntry, params: &ContourParams) -> Result<Vec<crate::canonical::ContourFeature>> {
        let path = entry.file(CONTOURS_ARTIFACT);
        let text = fs::read_to_string(&path).map_err(|e| EngineError::io(&path, e))?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        let raw = parse_geojson_features(&value, &params.attribute_name)?;
        Ok(canonicalize(raw, params.simplify_tolerance))
    }
}

/// Stage parameters for a request. Contours feed off the clip, so the kernel
/// is fixed to a smoothing one.
fn stage_params(params: &ContourParams) -> StageParams {
    StageParams {
        interval: params.interval,
        attribute_name: params.attribute_name.clone(),
        resample: ResampleMethod::Cubic,
        nodata: NODATA,
    }
}

fn stage_workdir(staging: &Path, kind: StageKind) -> PathBuf {
    staging.join(format!("work-{}", kind))
}

/// Write the area as a GeoJSON cutline that names its CRS explicitly.
fn write_cutline(area: &Area, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| EngineError::io(dir, e))?;
    let path = dir.join(CUTLINE_FILE);
    let cutline = json!({
        "type": "FeatureCollection",
        "crs": {
            "type": "name",
            "properties": { "name": format!("urn:ogc:def:crs:EPSG::{}", Crs::Lv95.epsg_code()) }
        },
        "features": [{
            "type": "Feature",
            "properties": {},
            "geometry": area.to_geojson()
        }]
    });
    fs::write(&path, serde_json::to_vec(&cutline)?).map_err(|e| EngineError::io(&path, e))?;
    Ok(path)
}
