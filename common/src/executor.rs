// Bucket execution
// Runs every Unit of a due bucket on the blocking pool and collects per-job results.

use crate::context::AppContext;
use crate::errors::JobFault;
use crate::models::BucketKey;
use crate::sandbox::{Execution, Sandbox, Unit};
use crate::telemetry::{self, JOBS};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Result of one job within a bucket run
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub output: String,
    pub fault: Option<JobFault>,
    pub duration: Duration,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.fault.is_none()
    }

    /// Text reported for this job; a fault replaces the output
    pub fn result_text(&self) -> String {
        Execution {
            output: self.output.clone(),
            fault: self.fault.clone(),
        }
        .into_text()
    }
}

/// All outcomes of one bucket run, in bucket order
#[derive(Debug, Clone)]
pub struct BucketRun {
    pub bucket: BucketKey,
    pub outcomes: Vec<JobOutcome>,
}

impl BucketRun {
    pub fn results(&self) -> HashMap<Uuid, String> {
        self.outcomes
            .iter()
            .map(|outcome| (outcome.job_id, outcome.result_text()))
            .collect()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.succeeded()).count()
    }
}

pub struct ExecutionAggregator {
    sandbox: Arc<Sandbox>,
    context: Arc<AppContext>,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl ExecutionAggregator {
    /// `concurrency` bounds how many Units of one bucket run at once
    pub fn new(sandbox: Arc<Sandbox>, context: Arc<AppContext>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            sandbox,
            context,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run a bucket and return job id → captured text
    pub async fn run(&self, bucket: &BucketKey) -> HashMap<Uuid, String> {
        self.run_report(bucket).await.results()
    }

    /// Run a bucket, keeping output, fault and timing per job.
    ///
    /// Works on a snapshot: Units appended or removed while the run is in
    /// flight do not affect it. A panic inside a worker is re-raised.
    #[instrument(skip(self), fields(bucket = %bucket))]
    pub async fn run_report(&self, bucket: &BucketKey) -> BucketRun {
        let units = self.context.store.snapshot(bucket).await;
        if units.is_empty() {
            info!(target: JOBS, bucket = %bucket, "Bucket is empty, nothing to run");
            return BucketRun {
                bucket: bucket.clone(),
                outcomes: Vec::new(),
            };
        }

        info!(target: JOBS, bucket = %bucket, units = units.len(), "Running bucket");

        let tasks = units.into_iter().map(|unit| self.dispatch(unit));
        let mut outcomes = Vec::new();
        for joined in join_all(tasks).await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => warn!(target: JOBS, bucket = %bucket, error = %e, "Job task was cancelled"),
            }
        }

        for outcome in &outcomes {
            self.report(bucket, outcome);
        }

        let run = BucketRun {
            bucket: bucket.clone(),
            outcomes,
        };
        info!(
            target: JOBS,
            bucket = %bucket,
            jobs = run.outcomes.len(),
            failed = run.failed(),
            "Bucket run complete"
        );
        run
    }

    async fn dispatch(&self, unit: Unit) -> Result<JobOutcome, tokio::task::JoinError> {
        // Never closed.
        let permit = self.permits.clone().acquire_owned().await.ok();
        let sandbox = self.sandbox.clone();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let started = Instant::now();
            let execution = sandbox.execute(&unit);
            JobOutcome {
                job_id: unit.id(),
                output: execution.output,
                fault: execution.fault,
                duration: started.elapsed(),
            }
        })
        .await
    }

    /// One consolidated log line and the metrics for a finished job
    fn report(&self, bucket: &BucketKey, outcome: &JobOutcome) {
        let seconds = outcome.duration.as_secs_f64();
        telemetry::record_job_duration(&outcome.job_id, bucket.as_str(), seconds);

        match &outcome.fault {
            None => {
                telemetry::record_job_success(&outcome.job_id, bucket.as_str());
                info!(
                    target: JOBS,
                    job_id = %outcome.job_id,
                    bucket = %bucket,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "Job {} output:\n{}",
                    outcome.job_id,
                    outcome.output
                );
            }
            Some(fault) => {
                let reason = match fault {
                    JobFault::Compile(_) => "compile",
                    JobFault::Runtime(_) => "runtime",
                    JobFault::Timeout(_) => "timeout",
                };
                telemetry::record_job_failure(&outcome.job_id, bucket.as_str(), reason);
                warn!(
                    target: JOBS,
                    job_id = %outcome.job_id,
                    bucket = %bucket,
                    reason,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "Job {} output:\n{}",
                    outcome.job_id,
                    outcome.result_text()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScheduleSpec;
    use crate::sandbox::SandboxConfig;

    fn bucket() -> BucketKey {
        BucketKey::from_spec(&ScheduleSpec::new().with("hour", "11"))
    }

    fn setup(concurrency: usize) -> (Arc<Sandbox>, Arc<AppContext>, ExecutionAggregator) {
        let sandbox = Arc::new(Sandbox::default());
        let context = Arc::new(AppContext::new());
        let aggregator = ExecutionAggregator::new(sandbox.clone(), context.clone(), concurrency);
        (sandbox, context, aggregator)
    }

    #[tokio::test]
    async fn test_run_collects_output_per_job() {
        let (sandbox, context, aggregator) = setup(5);
        let a = sandbox.compile(Uuid::new_v4(), "print(\"a\");");
        let b = sandbox.compile(Uuid::new_v4(), "print(\"b\"); print(\"c\");");
        context.store.append(bucket(), a.clone()).await;
        context.store.append(bucket(), b.clone()).await;

        let results = aggregator.run(&bucket()).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[&a.id()], "a\n");
        assert_eq!(results[&b.id()], "b\nc\n");
    }

    #[tokio::test]
    async fn test_faulting_job_does_not_affect_sibling() {
        let (sandbox, context, aggregator) = setup(2);
        let bad = sandbox.compile(Uuid::new_v4(), "print(1/0);");
        let good = sandbox.compile(Uuid::new_v4(), "print(\"ok\");");
        context.store.append(bucket(), bad.clone()).await;
        context.store.append(bucket(), good.clone()).await;

        let run = aggregator.run_report(&bucket()).await;
        assert_eq!(run.failed(), 1);

        let results = run.results();
        assert!(results[&bad.id()].to_lowercase().contains("division by zero"));
        assert_eq!(results[&good.id()], "ok\n");
    }

    #[tokio::test]
    async fn test_compile_fault_is_reported_as_text() {
        let (sandbox, context, aggregator) = setup(1);
        let broken = sandbox.compile(Uuid::new_v4(), "print(");
        context.store.append(bucket(), broken.clone()).await;

        let run = aggregator.run_report(&bucket()).await;
        let outcome = &run.outcomes[0];
        assert!(matches!(outcome.fault, Some(JobFault::Compile(_))));
        assert!(!run.results()[&broken.id()].trim().is_empty());
    }

    #[tokio::test]
    async fn test_empty_bucket_runs_nothing() {
        let (_, _, aggregator) = setup(1);
        assert!(aggregator.run(&bucket()).await.is_empty());
    }

    #[tokio::test]
    async fn test_more_units_than_permits() {
        let (sandbox, context, aggregator) = setup(2);
        let mut ids = Vec::new();
        for n in 0..12 {
            let unit = sandbox.compile(Uuid::new_v4(), &format!("print({});", n));
            ids.push((unit.id(), format!("{}\n", n)));
            context.store.append(bucket(), unit).await;
        }

        let results = aggregator.run(&bucket()).await;
        assert_eq!(results.len(), 12);
        for (id, expected) in ids {
            assert_eq!(results[&id], expected);
        }
    }

    #[tokio::test]
    async fn test_timeout_is_contained() {
        let sandbox = Arc::new(Sandbox::new(SandboxConfig {
            timeout: Some(Duration::from_millis(100)),
            ..SandboxConfig::default()
        }));
        let context = Arc::new(AppContext::new());
        let aggregator = ExecutionAggregator::new(sandbox.clone(), context.clone(), 2);

        let spin = sandbox.compile(Uuid::new_v4(), "loop { }");
        let quick = sandbox.compile(Uuid::new_v4(), "print(\"done\");");
        context.store.append(bucket(), spin.clone()).await;
        context.store.append(bucket(), quick.clone()).await;

        let results = aggregator.run(&bucket()).await;
        assert!(results[&spin.id()].contains("timeout"));
        assert_eq!(results[&quick.id()], "done\n");
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let aggregator =
            ExecutionAggregator::new(Arc::new(Sandbox::default()), Arc::new(AppContext::new()), 0);
        assert_eq!(aggregator.concurrency(), 1);
    }
}
