//! Error types for the contour engine.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::PipelineState;
use crate::stage::StageKind;

/// The specific reason an area of interest was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum AreaViolation {
    /// The geometry has no vertices or no rings.
    EmptyGeometry,
    /// Neither or both of a GeoJSON geometry and a bbox were supplied.
    AmbiguousInput,
    /// The GeoJSON type is not a Polygon or MultiPolygon.
    UnsupportedGeometryType(String),
    /// A ring has fewer than four positions or is not closed.
    MalformedRing {
        /// Index of the polygon within the area.
        polygon: usize,
        /// Index of the ring within the polygon.
        ring: usize,
    },
    /// A box with zero (or negative) width or height.
    DegenerateBox {
        /// Box width in input units.
        width: f64,
        /// Box height in input units.
        height: f64,
    },
    /// A ring encloses no area.
    ZeroArea,
    /// Two non-adjacent edges of the geometry cross.
    SelfIntersection {
        /// Approximate x coordinate of the crossing.
        x: f64,
        /// Approximate y coordinate of the crossing.
        y: f64,
    },
    /// A coordinate is NaN or infinite.
    NonFiniteCoordinate,
    /// The area lies outside the supported territory.
    OutOfBounds {
        /// Bounding box of the area as (xmin, ymin, xmax, ymax).
        bbox: (f64, f64, f64, f64),
    },
}

impl fmt::Display for AreaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AreaViolation::EmptyGeometry => write!(f, "geometry is empty"),
            AreaViolation::AmbiguousInput => {
                write!(f, "provide exactly one of a GeoJSON geometry or a bbox")
            }
            AreaViolation::UnsupportedGeometryType(kind) => write!(
                f,
                "unsupported geometry type '{}', expected Polygon or MultiPolygon",
                kind
            ),
            AreaViolation::MalformedRing { polygon, ring } => write!(
                f,
                "ring {} of polygon {} must be closed and have at least 4 positions",
                ring, polygon
            ),
            AreaViolation::DegenerateBox { width, height } => write!(
                f,
                "degenerate box with zero extent (width={}, height={})",
                width, height
            ),
            AreaViolation::ZeroArea => write!(f, "geometry encloses zero area"),
            AreaViolation::SelfIntersection { x, y } => {
                write!(f, "geometry self-intersects near ({:.3}, {:.3})", x, y)
            }
            AreaViolation::NonFiniteCoordinate => write!(f, "geometry contains a non-finite coordinate"),
            AreaViolation::OutOfBounds { bbox } => write!(
                f,
                "area bbox ({}, {}, {}, {}) is outside Swiss territory; check the CRS and coordinates",
                bbox.0, bbox.1, bbox.2, bbox.3
            ),
        }
    }
}

/// Errors produced by the contour engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The area of interest failed validation.
    #[error("Invalid area: {0}")]
    InvalidArea(AreaViolation),

    /// A processing parameter is out of range.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// A coordinate could not be transformed, or did not survive the round trip.
    #[error("Reprojection of ({x}, {y}) failed: {reason}")]
    Reprojection {
        /// Input x coordinate.
        x: f64,
        /// Input y coordinate.
        y: f64,
        /// Transform error or round-trip residual.
        reason: String,
    },

    /// The tile catalog could not be queried.
    #[error("Tile catalog unavailable: {reason}")]
    CatalogUnavailable {
        /// What went wrong (HTTP status, parse error, ...).
        reason: String,
        /// Whether the request timed out.
        timed_out: bool,
    },

    /// The discovered tiles do not cover the requested area.
    #[error("Discovered {tiles} tile(s) leave {uncovered_m2:.2} m² of the area uncovered")]
    IncompleteCoverage {
        /// Number of tiles that were discovered.
        tiles: usize,
        /// Uncovered area in square metres.
        uncovered_m2: f64,
    },

    /// Downloading a tile failed.
    #[error("Failed to download tile {item_id}: {reason}")]
    TileDownload {
        /// Catalog item identifier.
        item_id: String,
        /// Reason for failure.
        reason: String,
        /// Whether the download timed out.
        timed_out: bool,
    },

    /// A downloaded tile did not match its expected checksum.
    #[error("Checksum mismatch for tile {item_id}: expected {expected}, got {actual}")]
    Integrity {
        /// Catalog item identifier.
        item_id: String,
        /// Expected SHA-256 hex digest.
        expected: String,
        /// Actual SHA-256 hex digest.
        actual: String,
    },

    /// An external processing tool failed.
    #[error("{stage} stage failed ({}): {diagnostics}", describe_exit(.status, .timed_out))]
    ExternalTool {
        /// Which stage was running.
        stage: StageKind,
        /// Exit status, if the process exited.
        status: Option<i32>,
        /// Captured standard error (verbatim).
        diagnostics: String,
        /// Whether the invocation was killed after its timeout.
        timed_out: bool,
    },

    /// The run was cancelled between stages.
    #[error("Pipeline cancelled after reaching {state}")]
    Cancelled {
        /// Last state reached before cancellation.
        state: PipelineState,
    },

    /// A pipeline stage failed.
    #[error("Pipeline failed at {state}: {source}")]
    Pipeline {
        /// State at which the failure occurred.
        state: PipelineState,
        /// The originating error.
        #[source]
        source: Box<EngineError>,
    },

    /// I/O error on a cache or output path.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cache lock was poisoned (a thread panicked while holding the lock).
    #[error("Tile cache lock was poisoned")]
    CacheLockPoisoned,
}

fn describe_exit(status: &Option<i32>, timed_out: &bool) -> String {
    match (*status, *timed_out) {
        (_, true) => "timed out".to_string(),
        (Some(code), false) => format!("exit status {}", code),
        (None, false) => "terminated by signal".to_string(),
    }
}

impl EngineError {
    /// Build an [`EngineError::Io`] for a path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the orchestrator may retry the operation that produced this error.
    ///
    /// Only catalog queries and tile downloads are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::CatalogUnavailable { .. } | EngineError::TileDownload { .. }
        )
    }

    /// The error that started a failure chain, looking through pipeline wrappers.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            EngineError::Pipeline { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Stable short name of the error kind, used in manifests and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidArea(_) => "InvalidAreaError",
            EngineError::InvalidParameters(_) => "InvalidParametersError",
            EngineError::Reprojection { .. } => "ReprojectionError",
            EngineError::CatalogUnavailable { .. } => "CatalogUnavailableError",
            EngineError::IncompleteCoverage { .. } => "IncompleteCoverageError",
            EngineError::TileDownload { .. } => "TileDownloadError",
            EngineError::Integrity { .. } => "IntegrityError",
            EngineError::ExternalTool { .. } => "ExternalToolError",
            EngineError::Cancelled { .. } => "Cancelled",
            EngineError::Pipeline { source, .. } => source.kind(),
            EngineError::Io { .. } => "IoError",
            EngineError::Json(_) => "JsonError",
            EngineError::Config(_) => "ConfigError",
            EngineError::CacheLockPoisoned => "CacheLockPoisoned",
        }
    }
}
