// Scheduler engine implementation
// Drives sync cycles on a fixed cadence and fires bucket runs from their cron rules.

use crate::executor::ExecutionAggregator;
use crate::ledger::SyncMode;
use crate::models::{BucketKey, ScheduleRegistration};
use crate::schedule::{resolve_timezone, BucketTrigger};
use crate::sync::SyncCoordinator;
use crate::telemetry::{JOBS, OPS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to run an incremental sync cycle
    pub sync_interval: Duration,
    /// How often to look for due buckets
    pub tick_interval: Duration,
    /// Timezone for records that carry none
    pub default_timezone: Tz,
    /// Run the first cycle over every record instead of only unsynced ones
    pub full_resync_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(3600),
            tick_interval: Duration::from_secs(1),
            default_timezone: Tz::UTC,
            full_resync_on_start: true,
        }
    }
}

/// Scheduler trait for bucket scheduling operations
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Start the scheduler loop; returns after `stop`
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Stop the scheduler and wait for in-flight work
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Arm pending registrations and fire every bucket due at `now`
    async fn tick(&self, now: DateTime<Utc>) -> Result<usize, Box<dyn std::error::Error + Send + Sync>>;
}

/// Main scheduler engine implementation
pub struct SchedulerEngine {
    config: SchedulerConfig,
    coordinator: Arc<SyncCoordinator>,
    aggregator: Arc<ExecutionAggregator>,
    registrations: Mutex<mpsc::UnboundedReceiver<ScheduleRegistration>>,
    triggers: Mutex<HashMap<BucketKey, BucketTrigger>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        coordinator: Arc<SyncCoordinator>,
        aggregator: Arc<ExecutionAggregator>,
        registrations: mpsc::UnboundedReceiver<ScheduleRegistration>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Self {
            config,
            coordinator,
            aggregator,
            registrations: Mutex::new(registrations),
            triggers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Next fire time of a bucket, if one is armed
    pub async fn next_fire(&self, bucket: &BucketKey) -> Option<DateTime<Utc>> {
        self.triggers.lock().await.get(bucket).and_then(BucketTrigger::next_fire)
    }

    pub async fn armed_buckets(&self) -> usize {
        self.triggers.lock().await.len()
    }

    /// Run a sync cycle on its own task so ticks keep firing during installs
    async fn spawn_sync(&self, mode: SyncMode) {
        let coordinator = self.coordinator.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = coordinator.cycle(mode).await {
                // Retried on the next sync tick.
                warn!(target: OPS, error = %e, "Sync cycle failed");
            }
        });
        self.track(handle).await;
    }

    fn spawn_bucket_run(&self, bucket: BucketKey) -> JoinHandle<()> {
        let aggregator = self.aggregator.clone();
        tokio::spawn(async move {
            aggregator.run_report(&bucket).await;
        })
    }

    /// Keep a handle and reap the finished ones; worker panics are re-raised
    async fn track(&self, handle: JoinHandle<()>) {
        let mut in_flight = self.in_flight.lock().await;
        let (finished, running): (Vec<_>, Vec<_>) =
            in_flight.drain(..).partition(JoinHandle::is_finished);
        *in_flight = running;
        in_flight.push(handle);
        drop(in_flight);

        for handle in finished {
            Self::reap(handle).await;
        }
    }

    async fn reap(handle: JoinHandle<()>) {
        if let Err(e) = handle.await {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
        }
    }

    /// Arm or re-time triggers for every queued registration
    async fn drain_registrations(&self, now: DateTime<Utc>) {
        let mut registrations = self.registrations.lock().await;
        let mut triggers = self.triggers.lock().await;

        while let Ok(registration) = registrations.try_recv() {
            let timezone = match resolve_timezone(
                registration.timezone.as_deref(),
                self.config.default_timezone,
            ) {
                Ok(tz) => tz,
                Err(e) => {
                    error!(target: OPS, job_id = %registration.job_id, error = %e, "Cannot schedule job");
                    continue;
                }
            };

            if let Some(trigger) = triggers.get_mut(&registration.bucket_key) {
                trigger.retime(timezone, now);
                debug!(target: OPS, bucket = %registration.bucket_key, job_id = %registration.job_id, "Bucket already armed");
                continue;
            }

            match BucketTrigger::new(registration.bucket_key.clone(), &registration.schedule, timezone, now) {
                Ok(trigger) => {
                    info!(
                        target: OPS,
                        bucket = %registration.bucket_key,
                        expression = trigger.expression(),
                        timezone = %timezone,
                        next_fire = ?trigger.next_fire(),
                        "Armed bucket"
                    );
                    triggers.insert(registration.bucket_key, trigger);
                }
                Err(e) => {
                    error!(
                        target: OPS,
                        bucket = %registration.bucket_key,
                        job_id = %registration.job_id,
                        error = %e,
                        "Cannot schedule job"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            target: OPS,
            sync_interval_seconds = self.config.sync_interval.as_secs(),
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            "Starting scheduler engine"
        );

        let first_mode = if self.config.full_resync_on_start {
            SyncMode::Full
        } else {
            SyncMode::Incremental
        };
        self.spawn_sync(first_mode).await;

        let mut sync_interval = interval_at(
            Instant::now() + self.config.sync_interval,
            self.config.sync_interval,
        );
        sync_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick_interval = interval(self.config.tick_interval);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = self.shutdown_receiver();

        loop {
            tokio::select! {
                _ = sync_interval.tick() => {
                    debug!(target: OPS, "Sync interval elapsed");
                    self.spawn_sync(SyncMode::Incremental).await;
                }
                _ = tick_interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(0) => {}
                        Ok(count) => debug!(target: JOBS, buckets_fired = count, "Fired due buckets"),
                        Err(e) => error!(target: OPS, error = %e, "Error firing due buckets"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(target: OPS, "Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        info!(target: OPS, "Scheduler engine stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(target: OPS, "Stopping scheduler engine");

        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.in_flight.lock().await.drain(..).collect();
        info!(target: OPS, in_flight = handles.len(), "Waiting for in-flight work");
        for handle in handles {
            Self::reap(handle).await;
        }

        info!(target: OPS, "Scheduler engine stopped gracefully");
        Ok(())
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        self.drain_registrations(now).await;

        let due: Vec<BucketKey> = {
            let mut triggers = self.triggers.lock().await;
            let mut due = Vec::new();
            for trigger in triggers.values_mut() {
                if trigger.is_due(now) {
                    due.push(trigger.bucket().clone());
                    if trigger.advance(now).is_none() {
                        info!(target: OPS, bucket = %trigger.bucket(), "Bucket schedule has no further fire times");
                    }
                }
            }
            due
        };

        for bucket in &due {
            debug!(target: JOBS, bucket = %bucket, "Bucket is due");
            let handle = self.spawn_bucket_run(bucket.clone());
            self.track(handle).await;
        }

        Ok(due.len())
    }
}
