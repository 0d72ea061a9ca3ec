//! Surface Indexer Main Entry Point
//!
//! Rebuilds the configured materialized views and search index once and
//! publishes every generation that passes its checks.

use dotenv::dotenv;
use std::env;
use surface_indexer::{Dependencies, IndexingError};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging.
fn init_tracing() -> Result<(), IndexingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("surface_indexer=info,surface_indexer_repository=info")
    });

    let json = env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()
            .map_err(|e| IndexingError::config(format!("Failed to initialize tracing: {}", e)))?;

        info!(
            service_name = "surface-indexer",
            service_version = env!("CARGO_PKG_VERSION"),
            "Tracing initialized with JSON format"
        );
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true).pretty())
            .try_init()
            .map_err(|e| IndexingError::config(format!("Failed to initialize tracing: {}", e)))?;

        info!(
            service_name = "surface-indexer",
            service_version = env!("CARGO_PKG_VERSION"),
            "Tracing initialized with console output"
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), IndexingError> {
    // Load environment variables from .env file
    dotenv().ok();

    init_tracing()?;

    info!("Starting surface indexer");

    let deps = match Dependencies::new().await {
        Ok(deps) => {
            info!("Dependencies initialized successfully");
            deps
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize dependencies");
            return Err(e);
        }
    };

    let report = deps.orchestrator.run().await;
    if report.is_success() {
        info!("Surface rebuild completed successfully");
        Ok(())
    } else {
        let failed: Vec<String> = report
            .views
            .iter()
            .filter(|v| matches!(v.outcome, Err(ref e) if !e.is_rejection()))
            .map(|v| v.view.clone())
            .chain(
                report
                    .index
                    .iter()
                    .filter(|i| i.outcome.is_err())
                    .map(|i| i.target.clone()),
            )
            .collect();
        error!(failed = ?failed, cancelled = report.cancelled, "Surface rebuild failed");
        Err(IndexingError::RunFailed(failed.join(", ")))
    }
}
