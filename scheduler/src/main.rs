// Scheduler binary entry point

use anyhow::{anyhow, Context};
use common::bootstrap;
use common::config::Settings;
use common::executor::ExecutionAggregator;
use common::scheduler::{Scheduler, SchedulerEngine};
use common::sync::SyncCoordinator;
use common::telemetry::{self, LogChannel};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.log_dir.as_deref(),
    )?;

    telemetry::log(LogChannel::Operational, "Starting snippet cron scheduler");

    settings.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        anyhow!(e)
    })?;

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        ledger_backend = ?settings.ledger.backend,
        module_dir = %settings.packages.module_dir.display(),
        concurrency = settings.worker.concurrency,
        "Configuration loaded"
    );

    let ledger = bootstrap::init_ledger(&settings).await?;
    let resolver = bootstrap::init_dependency_resolver(&settings)?;
    let context = bootstrap::init_context(&resolver).await;
    let sandbox = bootstrap::init_sandbox(&settings).await?;

    let (registration_tx, registration_rx) = mpsc::unbounded_channel();
    let coordinator = Arc::new(
        SyncCoordinator::new(ledger, resolver, sandbox.clone(), context.clone())
            .with_registrations(registration_tx),
    );
    let aggregator = Arc::new(ExecutionAggregator::new(
        sandbox,
        context,
        settings.worker.concurrency,
    ));

    let scheduler = Arc::new(SchedulerEngine::new(
        bootstrap::scheduler_config(&settings)?,
        coordinator,
        aggregator,
        registration_rx,
    ));
    info!("Scheduler engine created");

    let scheduler_for_shutdown = scheduler.clone();
    let shutdown = tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        if let Err(e) = scheduler_for_shutdown.stop().await {
            error!(error = %e, "Error during scheduler shutdown");
        }
    });

    scheduler
        .start()
        .await
        .map_err(|e| anyhow!("Scheduler error: {}", e))?;
    shutdown.await.context("Shutdown task failed")?;

    info!("Scheduler stopped");
    Ok(())
}
