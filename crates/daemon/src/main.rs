// Conductor driver host
//
// Design Decision: Flags with CONDUCTOR_* environment fallbacks; a .env file is loaded first.
// Design Decision: Ctrl-C and SIGTERM start a graceful drain; in-flight batches always finish.

mod cli;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use conductor_driver::{Driver, HttpRemoteStore};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    telemetry::init_logging(cli.log_format);

    let store_config = cli.store_config();
    tracing::info!(
        base_url = %store_config.base_url,
        app_services_url = %store_config.app_services_url,
        "conductor-driverd starting..."
    );

    let store = HttpRemoteStore::new(store_config).context("Failed to create data services client")?;
    let driver = Arc::new(
        Driver::new(Arc::new(store), cli.driver_config()).context("Invalid driver configuration")?,
    );

    let runner = Arc::clone(&driver);
    let mut run = tokio::spawn(async move { runner.run().await });

    let outcome = tokio::select! {
        result = &mut run => result,
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal, draining in-flight batches");
            driver.shutdown();
            run.await
        }
    };

    let summary = outcome.context("Driver task failed")??;
    tracing::info!(
        processed = summary.processed,
        errors = summary.errors,
        abandoned = summary.abandoned,
        batches = summary.batches,
        "Driver shutdown complete"
    );
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
