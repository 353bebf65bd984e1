//! # keyline-engine
//!
//! Contour line generation from swisstopo swissALTI3D elevation tiles, with a
//! content-addressed on-disk cache.
//!
//! ## Overview
//!
//! A run takes an area of interest (GeoJSON polygon or box, in LV95 or WGS84)
//! and a contour interval, and produces a GeoJSON FeatureCollection of
//! isolines plus a provenance manifest:
//!
//! 1. [`area::normalize`] validates the area and reprojects it to LV95
//!    (EPSG:2056).
//! 2. [`catalog::TileCatalogClient`] finds the tiles covering it in the
//!    swisstopo STAC catalog and checks that they cover it completely.
//! 3. [`cache::RawTileCache`] downloads each tile once, verifies its SHA-256
//!    checksum and publishes it atomically.
//! 4. [`stage::StageRunner`] builds a mosaic, clips it to the area with a
//!    smoothing resample and extracts contours (GDAL by default).
//! 5. [`canonical::canonicalize`] rounds and orders the features so that
//!    equal inputs always serialize to the same bytes.
//!
//! Results of steps 3 and 4 are stored under a [`cache::CacheKey`]; a repeat
//! run with the same inputs only re-runs step 5.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keyline_engine::{
//!     AreaInput, CancellationToken, ContentAddressedCache, ContourParams, Crs, EngineConfig,
//!     GdalToolchain, HttpTileFetcher, Orchestrator, OrchestratorOptions, PipelineRequest, StacCatalog,
//! };
//!
//! let config = EngineConfig::default();
//! let cache = Arc::new(ContentAddressedCache::open(&config.cache_root)?);
//! let orchestrator = Orchestrator::new(
//!     StacCatalog::new(&config.catalog_url, &config.collection, config.download_timeout())?,
//!     HttpTileFetcher::new(config.download_timeout())?,
//!     GdalToolchain::new(config.gdal.clone(), config.tool_timeout()),
//!     cache,
//!     OrchestratorOptions::from(&config),
//! )?;
//!
//! let request = PipelineRequest {
//!     area: AreaInput::BBox([2600000.0, 1200000.0, 2601000.0, 1201000.0]),
//!     crs: Crs::Lv95,
//!     params: ContourParams::with_interval(2.0),
//!     output_dir: Some("out".into()),
//! };
//! let output = orchestrator.run(&request, &CancellationToken::new())?;
//! println!("{} contours", output.result.manifest.contour_count);
//! # Ok::<(), keyline_engine::EngineError>(())
//! ```

pub mod area;
pub mod cache;
pub mod canonical;
pub mod catalog;
pub mod config;
mod error;
pub mod fetch;
pub mod manifest;
pub mod params;
pub mod pipeline;
pub mod retry;
pub mod stage;
pub mod swiss;
pub mod telemetry;

pub use area::{normalize, Area, AreaInput, BBox, Crs};
pub use cache::{CacheKey, CacheStats, ContentAddressedCache, EvictionPolicy, PruneReport};
pub use canonical::{canonicalize, ContourFeature};
pub use catalog::{CatalogSource, DiscoveredTile, StacCatalog, TileCatalogClient, TileIdentity};
pub use config::EngineConfig;
pub use error::{AreaViolation, EngineError};
pub use fetch::{HttpTileFetcher, TileFetcher};
pub use manifest::{Manifest, ProcessingResult, ATTRIBUTION};
pub use params::{ContourParams, Resolution};
pub use pipeline::{CancellationToken, Orchestrator, OrchestratorOptions, PipelineRequest, PipelineState, RunOutput};
pub use retry::RetryPolicy;
pub use stage::{GdalBinaries, GdalToolchain, StageKind, StageParams, StageRunner};

/// Engine version recorded in manifests and cache entries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
