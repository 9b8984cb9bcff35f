//! Implementation of the `medai-runner run` command.

use anyhow::{Context, Result};
use clap::Args;

use crate::cli::runtime::Runtime;
use crate::domain::models::Config;

/// Arguments of `run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Skip the startup warm-worker reconciliation
    #[arg(long)]
    pub no_warm_workers: bool,
}

/// Run until Ctrl-C, then stop both loops and wait for them.
pub async fn execute(args: RunArgs, config: &Config, json_mode: bool) -> Result<()> {
    let runtime = Runtime::build(config).await?;

    if !args.no_warm_workers {
        match runtime.driver.warm_workers().await {
            Ok(started) => tracing::info!(started, "warm workers reconciled"),
            Err(e) => tracing::warn!(error = %e, "warm worker reconciliation failed"),
        }
    }

    let ingestor_handle = runtime.ingestor.start();
    let driver_handle = runtime.driver.start();

    if !json_mode {
        println!("MedAI Runner started");
        println!("   Archive: {}", config.archive.url);
        println!("   Engine: {}", config.dispatcher.engine);
        println!("   Tick: {}ms", config.scheduler.tick_interval_ms);
        println!("Press Ctrl-C to stop.");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested");
    runtime.driver.stop();
    runtime.ingestor.stop();
    let (driver_result, ingestor_result) = tokio::join!(driver_handle, ingestor_handle);
    if let Err(e) = driver_result {
        tracing::error!(error = %e, "driver task ended abnormally");
    }
    if let Err(e) = ingestor_result {
        tracing::error!(error = %e, "ingestor task ended abnormally");
    }

    if !json_mode {
        println!("MedAI Runner stopped");
    }
    Ok(())
}
