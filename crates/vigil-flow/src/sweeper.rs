//! Timeout sweeper for work that stopped reporting.
//!
//! A runner or summarizer still in `CREATED`, `QUEUED`, or `IN_PROGRESS`
//! whose last status change is older than twice the runner interval is
//! marked `TIMEOUT`. Parent jobs that are not terminal after the job budget
//! are marked `TIMEOUT` as well. Both use the message [`TIMEOUT_MESSAGE`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use vigil_core::{ComplianceJobId, RunnerId, SummarizerId};

use crate::config::FlowConfig;
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::store::ComplianceStore;

/// Failure message stored on timed-out rows.
pub const TIMEOUT_MESSAGE: &str = "Job timed out";

/// Rows timed out by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Parent jobs moved to `TIMEOUT`.
    pub jobs: Vec<ComplianceJobId>,
    /// Runners moved to `TIMEOUT`.
    pub runners: Vec<RunnerId>,
    /// Summarizers moved to `TIMEOUT`.
    pub summarizers: Vec<SummarizerId>,
}

impl SweepReport {
    /// Total rows timed out.
    #[must_use]
    pub fn total(&self) -> usize {
        self.jobs.len() + self.runners.len() + self.summarizers.len()
    }
}

/// Marks stale in-flight work as timed out.
#[derive(Clone)]
pub struct TimeoutSweeper {
    store: Arc<dyn ComplianceStore>,
    runner_timeout: chrono::Duration,
    job_timeout: chrono::Duration,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for TimeoutSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutSweeper")
            .field("runner_timeout", &self.runner_timeout)
            .field("job_timeout", &self.job_timeout)
            .finish_non_exhaustive()
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| Error::configuration(format!("timeout out of range: {e}")))
}

impl TimeoutSweeper {
    /// Creates a sweeper with explicit budgets.
    #[must_use]
    pub fn new(
        store: Arc<dyn ComplianceStore>,
        runner_timeout: chrono::Duration,
        job_timeout: chrono::Duration,
    ) -> Self {
        Self {
            store,
            runner_timeout,
            job_timeout,
            metrics: FlowMetrics::new(),
        }
    }

    /// Creates a sweeper from configuration: runners get twice the runner
    /// interval, jobs get the job timeout.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a budget does not fit a timestamp offset.
    pub fn from_config(store: Arc<dyn ComplianceStore>, config: &FlowConfig) -> Result<Self> {
        Ok(Self::new(
            store,
            to_chrono(config.runner_timeout())?,
            to_chrono(config.job_timeout)?,
        ))
    }

    /// Times out stale rows as of `now`.
    ///
    /// # Errors
    ///
    /// Returns the first store error; rows already updated stay updated.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let runner_cutoff = now - self.runner_timeout;
        let job_cutoff = now - self.job_timeout;

        let runners = self
            .store
            .timeout_runners_before(runner_cutoff, TIMEOUT_MESSAGE)
            .await?;
        let summarizers = self
            .store
            .timeout_summarizers_before(runner_cutoff, TIMEOUT_MESSAGE)
            .await?;
        let jobs = self
            .store
            .timeout_jobs_before(job_cutoff, TIMEOUT_MESSAGE)
            .await?;

        let report = SweepReport {
            jobs,
            runners,
            summarizers,
        };
        if report.total() > 0 {
            self.metrics.record_timeouts("runner", report.runners.len());
            self.metrics
                .record_timeouts("summarizer", report.summarizers.len());
            self.metrics.record_timeouts("job", report.jobs.len());
            tracing::warn!(
                jobs = report.jobs.len(),
                runners = report.runners.len(),
                summarizers = report.summarizers.len(),
                "timed out stale compliance work"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Caller, NewComplianceJob, NewRunner};
    use crate::status::{ComplianceJobStatus, RunnerStatus, TriggerType};
    use crate::store::memory::InMemoryComplianceStore;

    async fn seeded() -> Result<(Arc<InMemoryComplianceStore>, ComplianceJobId, RunnerId)> {
        let store = Arc::new(InMemoryComplianceStore::new());
        let job = store.create_job(NewComplianceJob::default()).await?;
        let runner = store
            .insert_runners(vec![NewRunner {
                parent_job_id: job.id,
                framework_id: "cis".into(),
                control_id: "c1".into(),
                policy_id: "p1".into(),
                integration_id: None,
                resource_collection_id: None,
                callers: vec![Caller {
                    root_benchmark: "cis".into(),
                    parent_benchmark_ids: vec!["cis".into()],
                    control_id: "c1".into(),
                    control_severity: String::new(),
                }],
                trigger_type: TriggerType::Scheduled,
            }])
            .await?
            .remove(0);
        Ok((store, job.id, runner.id))
    }

    #[tokio::test]
    async fn fresh_work_is_left_alone() -> Result<()> {
        let (store, _, _) = seeded().await?;
        let sweeper = TimeoutSweeper::from_config(store, &FlowConfig::default())?;
        let report = sweeper.sweep(Utc::now()).await?;
        assert_eq!(report.total(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn runners_time_out_after_twice_the_interval() -> Result<()> {
        let (store, job_id, runner_id) = seeded().await?;
        let sweeper = TimeoutSweeper::from_config(store.clone(), &FlowConfig::default())?;

        let report = sweeper.sweep(Utc::now() + chrono::Duration::minutes(90)).await?;
        assert!(report.runners.is_empty());

        let report = sweeper
            .sweep(Utc::now() + chrono::Duration::minutes(121))
            .await?;
        assert_eq!(report.runners, vec![runner_id]);
        assert!(report.jobs.is_empty());

        let runner = store.get_runner(runner_id).await?.expect("runner");
        assert_eq!(runner.status, RunnerStatus::Timeout);
        assert_eq!(runner.failure_message, TIMEOUT_MESSAGE);

        let report = sweeper.sweep(Utc::now() + chrono::Duration::hours(25)).await?;
        assert_eq!(report.jobs, vec![job_id]);
        let job = store.get_job(job_id).await?.expect("job");
        assert_eq!(job.status, ComplianceJobStatus::Timeout);
        Ok(())
    }
}
