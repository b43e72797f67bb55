// Synchronization coordinator
// Reconciles the ledger with the bucket store and the installed package set.
//
// A cycle runs four phases in order: deletion, selection, dependency,
// materialization. Cycles never overlap.

use crate::context::AppContext;
use crate::errors::SyncError;
use crate::ledger::{JobLedger, SyncMode};
use crate::models::{BucketKey, JobRecord, ScheduleRegistration};
use crate::packages::{compute_missing, DependencyResolver};
use crate::sandbox::{Sandbox, Unit};
use crate::telemetry::{self, DEPS, OPS};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub deleted: usize,
    pub selected: usize,
    pub missing_dependencies: BTreeSet<String>,
    pub install_attempted: bool,
    pub install_failed: bool,
}

impl SyncReport {
    /// True when the cycle changed nothing
    pub fn is_noop(&self) -> bool {
        self.deleted == 0 && self.selected == 0 && !self.install_attempted
    }
}

/// Result of the dependency phase
#[derive(Debug, Default)]
struct DependencyOutcome {
    missing: BTreeSet<String>,
    attempted: bool,
    failed: bool,
}

pub struct SyncCoordinator {
    ledger: Arc<dyn JobLedger>,
    resolver: DependencyResolver,
    sandbox: Arc<Sandbox>,
    context: Arc<AppContext>,
    registrations: Option<mpsc::UnboundedSender<ScheduleRegistration>>,
    cycle_lock: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        resolver: DependencyResolver,
        sandbox: Arc<Sandbox>,
        context: Arc<AppContext>,
    ) -> Self {
        Self {
            ledger,
            resolver,
            sandbox,
            context,
            registrations: None,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Emit a registration request per materialized record on `sender`
    pub fn with_registrations(mut self, sender: mpsc::UnboundedSender<ScheduleRegistration>) -> Self {
        self.registrations = Some(sender);
        self
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    /// Run one full synchronization cycle.
    ///
    /// A ledger failure aborts the cycle; the next tick retries it.
    #[instrument(skip(self))]
    pub async fn cycle(&self, mode: SyncMode) -> Result<SyncReport, SyncError> {
        let _guard = self.cycle_lock.lock().await;

        let result = self.run_phases(mode).await;
        match &result {
            Ok(report) if report.is_noop() => {
                debug!(target: OPS, "Sync cycle found nothing to do");
                telemetry::record_sync_cycle("noop");
            }
            Ok(report) => {
                info!(
                    target: OPS,
                    deleted = report.deleted,
                    selected = report.selected,
                    missing_dependencies = report.missing_dependencies.len(),
                    install_failed = report.install_failed,
                    "Sync cycle complete"
                );
                telemetry::record_sync_cycle("ok");
            }
            Err(e) => {
                error!(target: OPS, error = %e, "Sync cycle aborted");
                telemetry::record_sync_cycle("aborted");
            }
        }
        result
    }

    async fn run_phases(&self, mode: SyncMode) -> Result<SyncReport, SyncError> {
        let deleted = self.delete_marked().await?;
        let (records, required) = self.select(mode).await?;
        let dependencies = self.reconcile_dependencies(&required).await;
        let selected = self.materialize(records).await?;

        Ok(SyncReport {
            deleted,
            selected,
            missing_dependencies: dependencies.missing,
            install_attempted: dependencies.attempted,
            install_failed: dependencies.failed,
        })
    }

    /// Phase 1: strip Units marked for deletion, then delete their records
    async fn delete_marked(&self) -> Result<usize, SyncError> {
        let doomed = self.ledger.find_pending_deletion().await?;
        if doomed.is_empty() {
            return Ok(0);
        }

        info!(target: OPS, count = doomed.len(), "Deleting jobs marked for deletion");

        let mut ids_by_bucket: BTreeMap<BucketKey, HashSet<Uuid>> = BTreeMap::new();
        for record in &doomed {
            ids_by_bucket
                .entry(record.bucket_key())
                .or_default()
                .insert(record.id);
        }

        let all_ids: HashSet<Uuid> = doomed.iter().map(|r| r.id).collect();
        for key in ids_by_bucket.keys() {
            let removed = self.context.store.exclude(key, &all_ids).await;
            debug!(target: OPS, bucket = %key, removed, "Bucket pruned");
            telemetry::update_bucket_units(key.as_str(), self.context.store.len(key).await);
        }

        for record in &doomed {
            self.ledger.delete(record.id).await?;
        }

        info!(
            target: OPS,
            count = all_ids.len(),
            ids = ?all_ids,
            "Deleted jobs"
        );
        Ok(doomed.len())
    }

    /// Phase 2: pick records to process and collect their requirements
    async fn select(&self, mode: SyncMode) -> Result<(Vec<JobRecord>, BTreeSet<String>), SyncError> {
        let records = self.ledger.find_for_sync(mode).await?;

        let required: BTreeSet<String> = records
            .iter()
            .flat_map(|r| r.dependencies.iter().cloned())
            .collect();

        info!(target: OPS, mode = ?mode, count = records.len(), "Fetched jobs");
        Ok((records, required))
    }

    /// Phase 3: install whatever is missing and refresh the installed set.
    ///
    /// Install failures are logged and do not abort the cycle.
    async fn reconcile_dependencies(&self, required: &BTreeSet<String>) -> DependencyOutcome {
        let installed = self.context.dependencies.snapshot().await;
        let missing = compute_missing(required, &installed);

        info!(target: OPS, count = missing.len(), "Need to install packages");
        if missing.is_empty() {
            return DependencyOutcome::default();
        }

        let failed = self.resolver.install(&missing).await.is_err();
        self.resolver.settle().await;

        match self.resolver.refresh().await {
            Ok(refreshed) => {
                info!(target: DEPS, installed = ?refreshed, "Installed packages after sync");
                self.context.dependencies.replace(refreshed).await;
            }
            Err(e) => {
                warn!(target: DEPS, error = %e, "Keeping previous package set");
            }
        }

        DependencyOutcome {
            missing,
            attempted: true,
            failed,
        }
    }

    /// Phase 4: compile, flag as synced, then publish into the store.
    ///
    /// Units are staged until the ledger accepted the batch update, so an
    /// aborted cycle leaves the store untouched.
    async fn materialize(&self, records: Vec<JobRecord>) -> Result<usize, SyncError> {
        if records.is_empty() {
            return Ok(0);
        }

        let staged: Vec<(BucketKey, Unit)> = records
            .iter()
            .map(|record| {
                let unit = self.sandbox.compile(record.id, &record.source_code);
                if unit.is_faulted() {
                    warn!(target: OPS, job_id = %record.id, "Job source failed to compile; it will report the fault when run");
                }
                (record.bucket_key(), unit)
            })
            .collect();

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let updated = self.ledger.mark_synced(&ids).await?;
        debug!(target: OPS, updated, "Marked jobs as synced");

        let touched: BTreeSet<BucketKey> = staged.iter().map(|(key, _)| key.clone()).collect();
        self.context.store.append_all(staged).await;
        for key in &touched {
            telemetry::update_bucket_units(key.as_str(), self.context.store.len(key).await);
        }

        if let Some(sender) = &self.registrations {
            for record in &records {
                if sender.send(ScheduleRegistration::from(record)).is_err() {
                    warn!(target: OPS, job_id = %record.id, "Schedule registration receiver is gone");
                    break;
                }
            }
        }

        Ok(records.len())
    }
}
