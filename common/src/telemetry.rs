// Telemetry module for structured logging and metrics
// Three log channels (operational, dependency install, job execution) map to tracing targets.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

/// Tracing target of the operational channel
pub const OPS: &str = "ops";
/// Tracing target of the dependency-install channel
pub const DEPS: &str = "deps";
/// Tracing target of the per-job execution channel
pub const JOBS: &str = "jobs";

/// Named log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogChannel {
    Operational,
    Dependency,
    Job,
}

impl LogChannel {
    pub fn target(self) -> &'static str {
        match self {
            LogChannel::Operational => OPS,
            LogChannel::Dependency => DEPS,
            LogChannel::Job => JOBS,
        }
    }
}

/// Emit an INFO message on a channel
pub fn log(channel: LogChannel, message: &str) {
    match channel {
        LogChannel::Operational => tracing::info!(target: OPS, "{}", message),
        LogChannel::Dependency => tracing::info!(target: DEPS, "{}", message),
        LogChannel::Job => tracing::info!(target: JOBS, "{}", message),
    }
}

static FILE_GUARDS: OnceLock<Vec<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging
///
/// Console output is JSON filtered by `RUST_LOG` or `log_level`. When
/// `log_dir` is given, three files are written there as well:
/// - `app.log`: every channel
/// - `deps.log`: dependency-install channel only
/// - `jobs.log`: job execution channel only
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, log_dir: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let console_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_filter(env_filter);

    let level = log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    let mut guards = Vec::new();

    let (app_layer, deps_layer, jobs_layer) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow::anyhow!("Failed to create log directory {}: {}", dir.display(), e))?;

            let (app_writer, app_guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, "app.log"));
            let (deps_writer, deps_guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, "deps.log"));
            let (jobs_writer, jobs_guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, "jobs.log"));
            guards.extend([app_guard, deps_guard, jobs_guard]);

            (
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(app_writer)
                        .with_filter(Targets::new().with_default(level)),
                ),
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(deps_writer)
                        .with_filter(Targets::new().with_target(DEPS, level)),
                ),
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(jobs_writer)
                        .with_filter(Targets::new().with_target(JOBS, level)),
                ),
            )
        }
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(app_layer)
        .with(deps_layer)
        .with(jobs_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    // Writers flush on guard drop, so the guards live for the whole process.
    let _ = FILE_GUARDS.set(guards);

    tracing::info!(
        target: OPS,
        log_level = log_level,
        log_dir = ?log_dir,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize Prometheus metrics exporter
///
/// Registers:
/// - job_success_total / job_failed_total: counters per job
/// - job_duration_seconds: histogram per job
/// - sync_cycles_total: counter labelled by outcome
/// - bucket_units: gauge per bucket key
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "job_success_total",
        "Total number of job runs that finished without a fault"
    );
    describe_counter!("job_failed_total", "Total number of job runs that faulted");
    describe_histogram!("job_duration_seconds", "Duration of job runs in seconds");
    describe_counter!("sync_cycles_total", "Total number of sync cycles by outcome");
    describe_gauge!("bucket_units", "Number of units held by a bucket");

    tracing::info!(
        target: OPS,
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_job_success(job_id: &Uuid, bucket: &str) {
    counter!("job_success_total", "job_id" => job_id.to_string(), "bucket" => bucket.to_string())
        .increment(1);
}

#[inline]
pub fn record_job_failure(job_id: &Uuid, bucket: &str, reason: &str) {
    counter!(
        "job_failed_total",
        "job_id" => job_id.to_string(),
        "bucket" => bucket.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_duration(job_id: &Uuid, bucket: &str, duration_seconds: f64) {
    histogram!(
        "job_duration_seconds",
        "job_id" => job_id.to_string(),
        "bucket" => bucket.to_string()
    )
    .record(duration_seconds);
}

#[inline]
pub fn record_sync_cycle(outcome: &'static str) {
    counter!("sync_cycles_total", "outcome" => outcome).increment(1);
}

#[inline]
pub fn update_bucket_units(bucket: &str, units: usize) {
    gauge!("bucket_units", "bucket" => bucket.to_string()).set(units as f64);
}
