//! Tether CLI - drive and inspect the Tether scheduler.
//!
//! # Configuration
//!
//! Settings are read from `--config PATH`, or else from `tether.yml` /
//! `tether.yaml` in the current directory, or else built-in defaults.
//!
//! # Logging
//!
//! `-v` enables debug output for Tether crates. Without it `RUST_LOG` is
//! honoured, defaulting to `warn`.

mod config_cli;
mod simulate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tether_core::TetherConfig;
use tracing_subscriber::EnvFilter;

/// Tether - share one task runner between a work queue and a human
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: tether.yml or tether.yaml in the current directory)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scripted scenario against an in-memory runner
    Simulate(simulate::SimulateArgs),

    /// Validate a config file and print the effective settings
    CheckConfig(config_cli::CheckConfigArgs),
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,tether_core=debug,tether_cli=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads the explicit config file, or the first candidate in `root`, or
/// the defaults.
pub(crate) fn load_config(explicit: Option<&Path>, root: &Path) -> Result<TetherConfig> {
    if let Some(path) = explicit {
        return TetherConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }
    match TetherConfig::discover(root) {
        Some(path) => TetherConfig::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(TetherConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Simulate(args) => simulate::execute(args, cli.config.as_deref()).await,
        Commands::CheckConfig(args) => config_cli::execute(&args, cli.config.as_deref()),
    }
}
