use std::path::PathBuf;

use clap::Parser;

/// Demo runner for the roiflow engine.
///
/// Builds a source → resize → version-tracker pipeline over a synthetic
/// gradient image, pulls the output tile by tile in parallel, then dirties
/// part of the source and reports what went stale downstream.
#[derive(Parser, Debug)]
#[command(name = "roiflow", about = "Run a lazy resize pipeline on the roiflow scheduler")]
pub struct CliArgs {
    /// Path to a TOML config file (defaults plus environment when absent)
    #[arg(long, env = "ROIFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Worker threads (overrides config and ROIFLOW_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Edge length of the square source image
    #[arg(long, default_value_t = 512)]
    pub size: usize,

    /// Downscale factor applied to both axes
    #[arg(long, default_value_t = 2)]
    pub scale: usize,

    /// Edge length of the requested output tiles
    #[arg(long, default_value_t = 64)]
    pub tile: usize,
}
