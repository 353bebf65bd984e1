//! External processing stages: mosaic, clip and contour extraction.
//!
//! A stage is one external-tool invocation run inside a working directory
//! owned by the caller. [`StageRunner`] is the seam between the orchestrator
//! and the toolchain: [`GdalToolchain`] shells out to GDAL, tests substitute a
//! fake that writes canned outputs.
//!
//! Argument lists are built by [`build_args`] from the inputs and parameters
//! alone, so the same request always produces the same command line.

use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::area::Crs;
use crate::telemetry::TOOL_INVOCATIONS;
use crate::{EngineError, Result};

/// Nodata value written by the clip stage and honoured by the contour stage.
pub const NODATA: f64 = -9999.0;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// The three processing steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Build a virtual mosaic from the tile set.
    Mosaic,
    /// Clip the mosaic to the area with a smoothing resample.
    Clip,
    /// Extract isolines from the clipped raster.
    Contours,
}

impl StageKind {
    /// All stages in execution order.
    pub const ALL: [StageKind; 3] = [StageKind::Mosaic, StageKind::Clip, StageKind::Contours];

    /// Lowercase stage name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            StageKind::Mosaic => "mosaic",
            StageKind::Clip => "clip",
            StageKind::Contours => "contours",
        }
    }

    /// File name of the stage output inside its working directory.
    pub const fn output_file_name(&self) -> &'static str {
        match self {
            StageKind::Mosaic => "mosaic.vrt",
            StageKind::Clip => "dem_clip.tif",
            StageKind::Contours => "contours_raw.geojson",
        }
    }

    fn check_arity(&self, inputs: &[PathBuf]) -> Result<()> {
        let ok = match self {
            StageKind::Mosaic => !inputs.is_empty(),
            StageKind::Clip => inputs.len() == 2,
            StageKind::Contours => inputs.len() == 1,
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::InvalidParameters(format!(
                "{} stage received {} input(s)",
                self,
                inputs.len()
            )))
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raster resampling kernels accepted by the clip stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleMethod {
    /// Nearest neighbour. Produces stair-step contours; rejected for clipping.
    Nearest,
    /// Bilinear interpolation.
    Bilinear,
    /// Cubic convolution.
    Cubic,
    /// Cubic B-spline.
    CubicSpline,
}

impl ResampleMethod {
    /// Name understood by `gdalwarp -r`.
    pub const fn as_gdal(&self) -> &'static str {
        match self {
            ResampleMethod::Nearest => "near",
            ResampleMethod::Bilinear => "bilinear",
            ResampleMethod::Cubic => "cubic",
            ResampleMethod::CubicSpline => "cubicspline",
        }
    }

    /// Whether the kernel interpolates between cells.
    pub const fn is_smoothing(&self) -> bool {
        !matches!(self, ResampleMethod::Nearest)
    }
}

/// Parameters shared by all stages; each stage reads the fields it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageParams {
    /// Contour interval in metres.
    pub interval: f64,
    /// Elevation attribute written by the contour stage.
    pub attribute_name: String,
    /// Clip resampling kernel; must be smoothing.
    pub resample: ResampleMethod,
    /// Output nodata value for the clip stage.
    pub nodata: f64,
}

/// Runs one processing stage.
///
/// `inputs` are, per stage: Mosaic = tile rasters; Clip = [mosaic, cutline];
/// Contours = [clipped raster]. The output is written inside `workdir`
/// and its path returned.
pub trait StageRunner: Send + Sync {
    /// Execute `kind` and return the path of its output.
    fn run(&self, kind: StageKind, inputs: &[PathBuf], params: &StageParams, workdir: &Path) -> Result<PathBuf>;
}

/// Validate inputs and prepare `workdir` for a stage; returns the output path.
///
/// Any stale output from a previous run in the same directory is removed.
pub fn prepare(kind: StageKind, inputs: &[PathBuf], workdir: &Path) -> Result<PathBuf> {
    kind.check_arity(inputs)?;
    for input in inputs {
        if !input.is_file() {
            return Err(EngineError::io(
                input,
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("{} stage input is missing", kind)),
            ));
        }
    }
    fs::create_dir_all(workdir).map_err(|e| EngineError::io(workdir, e))?;
    let output = workdir.join(kind.output_file_name());
    match fs::remove_file(&output) {
        Ok(()) => debug!(path = %output.display(), "Removed stale stage output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(EngineError::io(&output, e)),
    }
    Ok(output)
}

/// Build the argument list (without the program name) for a stage.
pub fn build_args(kind: StageKind, inputs: &[PathBuf], params: &StageParams, output: &Path) -> Result<Vec<String>> {
    kind.check_arity(inputs)?;
    let path = |p: &Path| p.display().to_string();
    let args = match kind {
        StageKind::Mosaic => {
            let mut args = vec!["-q".to_string(), "-overwrite".to_string(), path(output)];
            args.extend(inputs.iter().map(|p| path(p)));
            args
        }
        StageKind::Clip => {
            if !params.resample.is_smoothing() {
                return Err(EngineError::InvalidParameters(format!(
                    "clip resampling must be smoothing, got '{}'",
                    params.resample.as_gdal()
                )));
            }
            vec![
                "-q".to_string(),
                "-overwrite".to_string(),
                "-of".to_string(),
                "GTiff".to_string(),
                "-t_srs".to_string(),
                format!("EPSG:{}", Crs::Lv95.epsg_code()),
                "-r".to_string(),
                params.resample.as_gdal().to_string(),
                "-cutline".to_string(),
                path(&inputs[1]),
                "-crop_to_cutline".to_string(),
                "-dstnodata".to_string(),
                params.nodata.to_string(),
                "-co".to_string(),
                "COMPRESS=DEFLATE".to_string(),
                path(&inputs[0]),
                path(output),
            ]
        }
        // gdal_contour has no overwrite switch; `prepare` has removed any stale output.
        StageKind::Contours => vec![
            "-q".to_string(),
            "-f".to_string(),
            "GeoJSON".to_string(),
            "-i".to_string(),
            params.interval.to_string(),
            "-a".to_string(),
            params.attribute_name.clone(),
            "-snodata".to_string(),
            params.nodata.to_string(),
            path(&inputs[0]),
            path(output),
        ],
    };
    Ok(args)
}

/// Paths of the GDAL command-line tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GdalBinaries {
    /// `gdalbuildvrt`
    pub buildvrt: PathBuf,
    /// `gdalwarp`
    pub warp: PathBuf,
    /// `gdal_contour`
    pub contour: PathBuf,
}

impl Default for GdalBinaries {
    fn default() -> Self {
        Self {
            buildvrt: PathBuf::from("gdalbuildvrt"),
            warp: PathBuf::from("gdalwarp"),
            contour: PathBuf::from("gdal_contour"),
        }
    }
}

impl GdalBinaries {
    fn program(&self, kind: StageKind) -> &Path {
        match kind {
            StageKind::Mosaic => &self.buildvrt,
            StageKind::Clip => &self.warp,
            StageKind::Contours => &self.contour,
        }
    }
}

/// [`StageRunner`] that invokes the GDAL command-line tools.
#[derive(Debug, Clone)]
pub struct GdalToolchain {
    binaries: GdalBinaries,
    timeout: Duration,
}

impl GdalToolchain {
    /// Create a toolchain with the given binaries and per-invocation timeout.
    pub fn new(binaries: GdalBinaries, timeout: Duration) -> Self {
        Self { binaries, timeout }
    }
}

impl StageRunner for GdalToolchain {
    fn run(&self, kind: StageKind, inputs: &[PathBuf], params: &StageParams, workdir: &Path) -> Result<PathBuf> {
        let output = prepare(kind, inputs, workdir)?;
        let args = build_args(kind, inputs, params, &output)?;
        let program = self.binaries.program(kind);

        let result = run_tool(kind, program, &args, workdir, self.timeout).and_then(|()| {
            if output.is_file() {
                Ok(())
            } else {
                Err(EngineError::ExternalTool {
                    stage: kind,
                    status: Some(0),
                    diagnostics: format!("{} exited successfully but wrote no output", program.display()),
                    timed_out: false,
                })
            }
        });

        let outcome = match &result {
            Ok(()) => "ok",
            Err(EngineError::ExternalTool { timed_out: true, .. }) => "timeout",
            Err(_) => "failed",
        };
        metrics::counter!(TOOL_INVOCATIONS.name, "stage" => kind.as_str(), "outcome" => outcome).increment(1);

        if let Err(err) = result {
            match fs::remove_file(&output) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %output.display(), error = %e, "Failed to remove partial tool output"),
            }
            return Err(err);
        }
        Ok(output)
    }
}

/// Run `program` in `workdir`, capturing stderr, killing it after `timeout`.
fn run_tool(kind: StageKind, program: &Path, args: &[String], workdir: &Path, timeout: Duration) -> Result<()> {
    debug!(stage = %kind, program = %program.display(), args = ?args, "Running external tool");

    let mut child = Command::new(program)
        .args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::ExternalTool {
            stage: kind,
            status: None,
            diagnostics: format!("failed to start {}: {}", program.display(), e),
            timed_out: false,
        })?;

    let stderr_reader = child.stderr.take().map(|mut stderr| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            if let Err(e) = stderr.read_to_end(&mut buf) {
                warn!(stage = %kind, error = %e, "Failed to read tool stderr");
            }
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    let started = Instant::now();
    let status: Option<ExitStatus> = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if started.elapsed() >= timeout => {
                warn!(stage = %kind, timeout_s = timeout.as_secs_f64(), "External tool timed out; killing it");
                if let Err(e) = child.kill().and_then(|()| child.wait().map(drop)) {
                    warn!(stage = %kind, error = %e, "Failed to kill timed-out tool");
                }
                break None;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                if let Err(kill_err) = child.kill() {
                    warn!(stage = %kind, error = %kill_err, "Failed to kill tool");
                }
                return Err(EngineError::io(program, e));
            }
        }
    };

    let diagnostics = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    match status {
        None => Err(EngineError::ExternalTool {
            stage: kind,
            status: None,
            diagnostics,
            timed_out: true,
        }),
        Some(status) if status.success() => {
            if !diagnostics.trim().is_empty() {
                debug!(stage = %kind, diagnostics = %diagnostics.trim_end(), "External tool diagnostics");
            }
            Ok(())
        }
        Some(status) => Err(EngineError::ExternalTool {
            stage: kind,
            status: status.code(),
            diagnostics,
            timed_out: false,
        }),
    }
}
