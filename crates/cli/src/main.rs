mod cli;
mod pipeline;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use roiflow_core::config::load_dotenv;
use roiflow_core::RoiflowConfig;
use roiflow_scheduler::Scheduler;

use crate::cli::CliArgs;

fn main() -> Result<()> {
    load_dotenv();
    let args = CliArgs::parse();

    let mut config = RoiflowConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(workers) = args.workers {
        config.scheduler.worker_threads = workers;
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.filter)),
        )
        .with_target(false)
        .init();

    config.log_summary();

    let scheduler = Scheduler::start(&config.scheduler).context("failed to start the scheduler")?;
    info!(workers = scheduler.worker_count(), "scheduler started");

    let outcome = pipeline::run(&scheduler, args.size, args.scale, args.tile);
    scheduler.stop();

    match outcome {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "pipeline failed");
            Err(e)
        }
    }
}
