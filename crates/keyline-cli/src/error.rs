//! CLI errors and exit codes.

use std::path::PathBuf;
use std::process;

use keyline_engine::EngineError;
use thiserror::Error;

/// Exit code for invalid input or configuration.
pub const EXIT_USAGE: i32 = 2;
/// Exit code for catalog, download and coverage failures.
pub const EXIT_DATA: i32 = 3;
/// Exit code for external tool failures.
pub const EXIT_TOOL: i32 = 4;
/// Exit code after Ctrl-C.
pub const EXIT_CANCELLED: i32 = 130;

/// Errors surfaced by the `keyline` binary.
#[derive(Debug, Error)]
pub enum CliError {
    /// Logging could not be set up.
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// An input file could not be read.
    #[error("Cannot read '{}': {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid command-line argument.
    #[error("{0}")]
    Usage(String),

    /// Ctrl-C handler could not be installed.
    #[error("Failed to install Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),

    /// Engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Input { .. } | CliError::Usage(_) => EXIT_USAGE,
            CliError::LoggingInit(_) | CliError::Signal(_) => 1,
            CliError::Engine(e) => match e.root_cause() {
                EngineError::Cancelled { .. } => EXIT_CANCELLED,
                EngineError::InvalidArea(_)
                | EngineError::InvalidParameters(_)
                | EngineError::Reprojection { .. }
                | EngineError::Config(_) => EXIT_USAGE,
                EngineError::CatalogUnavailable { .. }
                | EngineError::IncompleteCoverage { .. }
                | EngineError::TileDownload { .. }
                | EngineError::Integrity { .. } => EXIT_DATA,
                EngineError::ExternalTool { .. } => EXIT_TOOL,
                _ => 1,
            },
        }
    }

    /// Print the error to stderr and exit.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);
        if let CliError::Engine(e) = self {
            let root = e.root_cause();
            eprintln!("  kind: {}", root.kind());
            if let EngineError::Pipeline { state, .. } = e {
                eprintln!("  failed after: {}", state);
            }
            match root {
                EngineError::ExternalTool { .. } => {
                    eprintln!();
                    eprintln!("Check that GDAL is installed and on PATH, or set the tool paths under `gdal:` in the config file.");
                }
                EngineError::CatalogUnavailable { timed_out: true, .. } | EngineError::TileDownload { timed_out: true, .. } => {
                    eprintln!();
                    eprintln!("Raise the network timeout with --timeout or KEYLINE_DOWNLOAD_TIMEOUT.");
                }
                _ => {}
            }
        }
        process::exit(self.exit_code())
    }
}
