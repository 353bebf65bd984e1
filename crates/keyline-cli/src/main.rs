//! keyline - contour lines from swissALTI3D elevation data.

mod commands;
mod error;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keyline_engine::{telemetry, CancellationToken};
use tracing::warn;

use commands::cache::CacheAction;
use commands::contours::ContoursArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "keyline")]
#[command(version, about = "Generate contour lines from swisstopo elevation tiles", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Cache directory (overrides the config file)
    #[arg(long, global = true, value_name = "DIR")]
    cache: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate contours for an area
    Contours(ContoursArgs),
    /// Inspect or prune the cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        e.exit();
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    logging::init(cli.verbose)?;
    telemetry::describe_metrics();

    let config = commands::load_config(cli.config.as_deref(), cli.cache)?;
    match cli.command {
        Command::Contours(args) => {
            let cancel = CancellationToken::new();
            let handler_token = cancel.clone();
            ctrlc::set_handler(move || {
                warn!("Interrupted; stopping at the next pipeline step");
                handler_token.cancel();
            })?;
            commands::contours::run(args, config, cancel)
        }
        Command::Cache { action } => commands::cache::run(action, &config),
    }
}
