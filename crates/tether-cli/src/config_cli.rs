//! `tether check-config`: validate a config file.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::{Path, PathBuf};
use tether_core::TetherConfig;

#[derive(Parser, Debug)]
pub struct CheckConfigArgs {
    /// Config file to check (default: --config, then tether.yml/tether.yaml)
    pub path: Option<PathBuf>,
}

pub fn execute(args: &CheckConfigArgs, global: Option<&Path>) -> Result<()> {
    let root = std::env::current_dir().context("Failed to read current directory")?;
    let explicit = args.path.as_deref().or(global);
    let source = explicit
        .map(Path::to_path_buf)
        .or_else(|| TetherConfig::discover(&root));

    let config = crate::load_config(explicit, &root)?;
    match &source {
        Some(path) => println!("{} {}", "✓".green().bold(), path.display()),
        None => println!(
            "{} no config file found; using defaults",
            "•".yellow().bold()
        ),
    }

    let rendered = serde_yaml::to_string(&config).context("Failed to render config")?;
    print!("{rendered}");
    Ok(())
}
