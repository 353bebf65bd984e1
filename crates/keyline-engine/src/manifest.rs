//! Run provenance and result files.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::area::{Area, Crs};
use crate::canonical::ContourFeature;
use crate::catalog::TileIdentity;
use crate::params::ContourParams;
use crate::stage::{ResampleMethod, StageParams};
use crate::{EngineError, Result};

/// Attribution required by the elevation data licence.
pub const ATTRIBUTION: &str = "Source: Federal Office of Topography swisstopo";

/// Output file name of the contour collection.
pub const CONTOURS_FILE: &str = "contours.geojson";

/// Output file name of the manifest.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Wall time of one step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    /// Step name (`normalize`, `discover`, `fetch`, `mosaic`, `clip`, `contours`, `canonicalize`).
    pub stage: String,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the step was satisfied from the cache.
    pub cached: bool,
}

/// Description of the processed area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaSummary {
    /// Working CRS (always LV95).
    pub crs: Crs,
    /// CRS the area was supplied in.
    pub source_crs: Crs,
    /// Canonical geometry hash.
    pub hash: String,
    /// Bounding box in LV95 as [xmin, ymin, xmax, ymax].
    pub bbox: [f64; 4],
    /// Area in square metres.
    pub area_m2: f64,
}

impl AreaSummary {
    /// Summarise a normalized area.
    pub fn of(area: &Area) -> Self {
        let b = area.bbox();
        Self {
            crs: area.crs(),
            source_crs: area.source_crs(),
            hash: area.canonical_hash(),
            bbox: [b.xmin, b.ymin, b.xmax, b.ymax],
            area_m2: area.area_m2(),
        }
    }
}

/// Raster settings the engine applies on its own, next to [`ContourParams`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSettings {
    /// Kernel used when clipping the mosaic.
    pub resample: ResampleMethod,
    /// Nodata value of the clipped raster, ignored by contouring.
    pub nodata: f64,
}

impl From<&StageParams> for ProcessingSettings {
    fn from(params: &StageParams) -> Self {
        Self {
            resample: params.resample,
            nodata: params.nodata,
        }
    }
}

/// Provenance record written next to every result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Engine version that produced the result.
    pub engine_version: String,
    /// Completion time (RFC 3339).
    pub created_at: String,
    /// Processed area.
    pub area: AreaSummary,
    /// Exact parameters used.
    pub parameters: ContourParams,
    /// Fixed raster settings used.
    pub processing: ProcessingSettings,
    /// Derived-cache key of the computation.
    pub cache_key: String,
    /// Contributing tiles, in canonical order.
    pub tiles: Vec<TileIdentity>,
    /// Per-step timings, in execution order.
    pub timings: Vec<StageTiming>,
    /// Number of contour features.
    pub contour_count: usize,
    /// Lowest and highest contour elevation; absent without features.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub elevation_range: Option<[f64; 2]>,
    /// Data attribution.
    pub attribution: String,
}

/// Contours plus manifest, returned to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingResult {
    /// Canonical features.
    pub features: Vec<ContourFeature>,
    /// Canonical GeoJSON serialization of `features`.
    pub geojson: String,
    /// Provenance.
    pub manifest: Manifest,
}

/// Paths written by [`ProcessingResult::write_to`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFiles {
    /// Contour collection.
    pub contours: PathBuf,
    /// Manifest.
    pub manifest: PathBuf,
}

impl ProcessingResult {
    /// Manifest as pretty JSON with a trailing newline.
    pub fn manifest_json(&self) -> Result<String> {
        let mut text = serde_json::to_string_pretty(&self.manifest)?;
        text.push('\n');
        Ok(text)
    }

    /// Write the contour collection and manifest into `dir`.
    ///
    /// Both files are staged in a private `.tmp-*` directory inside `dir`.
    /// An existing pair is moved into the staging directory before the new
    /// pair is renamed into place, and moved back if that fails, so `dir`
    /// never holds one file from this run next to one from an earlier run.
    /// Other files in `dir` are left alone.
    pub fn write_to(&self, dir: &Path) -> Result<OutputFiles> {
        fs::create_dir_all(dir).map_err(|e| EngineError::io(dir, e))?;
        let manifest_text = self.manifest_json()?;

        let staging = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(dir)
            .map_err(|e| EngineError::io(dir, e))?;
        let names = [CONTOURS_FILE, MANIFEST_FILE];
        for (name, bytes) in names.iter().zip([self.geojson.as_bytes(), manifest_text.as_bytes()]) {
            write_synced(&staging.path().join(name), bytes)?;
        }

        let mut previous = Vec::new();
        for name in names {
            let target = dir.join(name);
            let aside = staging.path().join(format!("previous-{}", name));
            match fs::rename(&target, &aside) {
                Ok(()) => previous.push((aside, target)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    restore(&previous);
                    return Err(EngineError::io(&target, e));
                }
            }
        }
        if !previous.is_empty() {
            debug!(dir = %dir.display(), "Replacing previous output");
        }

        let mut placed: Vec<PathBuf> = Vec::new();
        for name in names {
            let target = dir.join(name);
            if let Err(e) = fs::rename(staging.path().join(name), &target) {
                for path in &placed {
                    if let Err(rm) = fs::remove_file(path) {
                        warn!(path = %path.display(), error = %rm, "Could not remove partial output");
                    }
                }
                restore(&previous);
                return Err(EngineError::io(&target, e));
            }
            placed.push(target);
        }

        let staging_path = staging.path().to_path_buf();
        if let Err(e) = staging.close() {
            warn!(path = %staging_path.display(), error = %e, "Could not remove output staging directory");
        }
        Ok(OutputFiles {
            contours: dir.join(CONTOURS_FILE),
            manifest: dir.join(MANIFEST_FILE),
        })
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| EngineError::io(path, e))?;
    file.write_all(bytes).map_err(|e| EngineError::io(path, e))?;
    file.sync_all().map_err(|e| EngineError::io(path, e))
}

/// Move previous output files back from the staging directory.
fn restore(previous: &[(PathBuf, PathBuf)]) {
    for (aside, target) in previous {
        if let Err(e) = fs::rename(aside, target) {
            warn!(path = %target.display(), error = %e, "Could not restore previous output");
        }
    }
}
