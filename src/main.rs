//! # OData Sync Scheduler
//!
//! Loads every job definition and runs the enabled ones on their cron
//! schedules until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use odata_sync::{
    config::ConfigLoader,
    db,
    jobs::load_registry,
    logging::ErrorReporter,
    scheduler::Scheduler,
    sync_executor::JobRunner,
    telemetry::init_tracing,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from layered env files and variables
    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    init_tracing(&config).context("initializing tracing")?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let registry = load_registry(&config.sync.jobs_dir).context("loading job definitions")?;
    if registry.is_empty() {
        info!(dir = %config.sync.jobs_dir.display(), "No jobs defined");
    }

    let reporter = Arc::new(ErrorReporter::new(&config.logging).context("opening error log")?);
    if let Some(path) = reporter.file_path() {
        info!(path = %path.display(), "Writing errors to file");
    }

    let db = Arc::new(
        db::init_pool(&config.database)
            .await
            .context("initializing database connection pool")?,
    );
    db::health_check(&db).await?;
    let runner = Arc::new(JobRunner::from_config(&config, db, reporter)?);

    let scheduler = Scheduler::new(registry.jobs().to_vec(), runner)
        .with_run_on_boot(config.sync.run_on_boot);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(err) => error!(error = %err, "Failed to listen for Ctrl-C"),
        }
        signal.cancel();
    });

    scheduler.run(shutdown).await?;
    Ok(())
}
