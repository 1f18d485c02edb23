//! Status aggregator: derives parent job progress from its children.
//!
//! Runs on the scheduler's cadence. Each tick walks the non-terminal parent
//! phases in order:
//!
//! | Phase | Advances when | To |
//! |-------|---------------|----|
//! | `RUNNERS_IN_PROGRESS` | every runner is terminal | `SINK_IN_PROGRESS`, or `FAILED` if no runner succeeded |
//! | `SINK_IN_PROGRESS` | the sink reports the job flushed | `SUMMARIZER_IN_PROGRESS` |
//! | `SUMMARIZER_IN_PROGRESS` | every summarizer is terminal | `SUCCEEDED`, or `FAILED` if any did not succeed |
//!
//! The runner status vector is recomputed and stored on every visit.

use std::sync::Arc;

use tracing::Instrument;

use vigil_core::observability::compliance_job_span;

use crate::config::FlowConfig;
use crate::error::Result;
use crate::metrics::FlowMetrics;
use crate::model::ComplianceJob;
use crate::sink::{ResultSink, SummaryBuilder};
use crate::status::{ComplianceJobStatus, RunnerStatus, RunnersStatus, StepFailed};
use crate::store::{ComplianceStore, JobStatusUpdate};

/// What one aggregator tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorTickReport {
    /// Parent jobs moved to a later phase.
    pub advanced: usize,
    /// Parent jobs that reached `SUCCEEDED`.
    pub succeeded: usize,
    /// Parent jobs that reached `FAILED`.
    pub failed: usize,
}

/// Advances parent jobs through the sink and summarizer phases.
pub struct StatusAggregator {
    config: FlowConfig,
    store: Arc<dyn ComplianceStore>,
    sink: Arc<dyn ResultSink>,
    summaries: Arc<dyn SummaryBuilder>,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for StatusAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusAggregator")
            .field("batch", &self.config.publish_batch_size)
            .finish_non_exhaustive()
    }
}

impl StatusAggregator {
    /// Creates an aggregator.
    #[must_use]
    pub fn new(
        config: FlowConfig,
        store: Arc<dyn ComplianceStore>,
        sink: Arc<dyn ResultSink>,
        summaries: Arc<dyn SummaryBuilder>,
    ) -> Self {
        Self {
            config,
            store,
            sink,
            summaries,
            metrics: FlowMetrics::new(),
        }
    }

    /// Runs one aggregation pass over every in-flight parent job.
    ///
    /// # Errors
    ///
    /// Returns an error only if listing parent jobs fails; per-job failures
    /// are logged and retried on the next tick.
    pub async fn run_aggregator_tick(&self) -> Result<AggregatorTickReport> {
        let _timer = self.metrics.time_tick("aggregator");
        let mut report = AggregatorTickReport::default();
        let batch = self.config.publish_batch_size;

        for phase in [
            ComplianceJobStatus::RunnersInProgress,
            ComplianceJobStatus::SinkInProgress,
            ComplianceJobStatus::SummarizerInProgress,
        ] {
            for job in self.store.list_jobs_by_status(phase, batch).await? {
                let span = compliance_job_span("aggregate", job.id.get());
                match self.advance(&job).instrument(span).await {
                    Ok(Some(next)) => {
                        report.advanced += 1;
                        match next {
                            ComplianceJobStatus::Succeeded => report.succeeded += 1,
                            ComplianceJobStatus::Failed => report.failed += 1,
                            _ => {}
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(job_id = %job.id, error = %err, "aggregation deferred to next tick");
                    }
                }
            }
        }
        Ok(report)
    }

    async fn advance(&self, job: &ComplianceJob) -> Result<Option<ComplianceJobStatus>> {
        match job.status {
            ComplianceJobStatus::RunnersInProgress => self.advance_runners(job).await,
            ComplianceJobStatus::SinkInProgress => self.advance_sink(job).await,
            ComplianceJobStatus::SummarizerInProgress => self.advance_summarizers(job).await,
            _ => Ok(None),
        }
    }

    async fn advance_runners(&self, job: &ComplianceJob) -> Result<Option<ComplianceJobStatus>> {
        let runners = self.store.list_runners_by_parent(job.id).await?;
        let status = RunnersStatus::from_statuses(runners.iter().map(|r| r.status));
        self.store.set_runners_status(job.id, status).await?;

        if !status.all_terminal() {
            return Ok(None);
        }
        if status.total_count > 0 && status.runners_succeeded == 0 {
            let message = format!("all {} runners failed", status.total_count);
            return self
                .transition(job, JobStatusUpdate::failed(StepFailed::Runners, message))
                .await;
        }
        self.transition(job, JobStatusUpdate::to(ComplianceJobStatus::SinkInProgress))
            .await
    }

    async fn advance_sink(&self, job: &ComplianceJob) -> Result<Option<ComplianceJobStatus>> {
        if !self.sink.is_flushed(job.id).await? {
            return Ok(None);
        }
        let summarizers = self
            .store
            .create_summarizers(job.id, &job.framework_ids, job.trigger_type)
            .await?;
        tracing::info!(summarizers = summarizers.len(), "results flushed");
        self.transition(
            job,
            JobStatusUpdate::to(ComplianceJobStatus::SummarizerInProgress),
        )
        .await
    }

    async fn advance_summarizers(
        &self,
        job: &ComplianceJob,
    ) -> Result<Option<ComplianceJobStatus>> {
        for summarizer in self.store.list_summarizers_by_parent(job.id).await? {
            if summarizer.status != RunnerStatus::Created {
                continue;
            }
            let started = self
                .store
                .update_summarizer_status(summarizer.id, RunnerStatus::InProgress, "")
                .await?;
            if !started.is_applied() {
                continue;
            }
            let (status, message) = match self.summaries.build_summary(&summarizer).await {
                Ok(()) => (RunnerStatus::Succeeded, String::new()),
                Err(err) => {
                    tracing::warn!(benchmark_id = %summarizer.benchmark_id, error = %err, "summary failed");
                    (RunnerStatus::Failed, err.to_string())
                }
            };
            self.store
                .update_summarizer_status(summarizer.id, status, &message)
                .await?;
        }

        let summarizers = self.store.list_summarizers_by_parent(job.id).await?;
        if summarizers.iter().any(|s| !s.status.is_terminal()) {
            return Ok(None);
        }
        if let Some(failed) = summarizers
            .iter()
            .find(|s| s.status != RunnerStatus::Succeeded)
        {
            let message = if failed.failure_message.is_empty() {
                format!("summary of {} {}", failed.benchmark_id, failed.status.as_label())
            } else {
                failed.failure_message.clone()
            };
            return self
                .transition(job, JobStatusUpdate::failed(StepFailed::Summarizer, message))
                .await;
        }
        self.transition(job, JobStatusUpdate::to(ComplianceJobStatus::Succeeded))
            .await
    }

    async fn transition(
        &self,
        job: &ComplianceJob,
        update: JobStatusUpdate,
    ) -> Result<Option<ComplianceJobStatus>> {
        let target = update.status;
        let outcome = self.store.update_job_status(job.id, update).await?;
        if !outcome.is_applied() {
            tracing::debug!(?outcome, "parent job transition skipped");
            return Ok(None);
        }
        self.metrics
            .record_job_transition(job.status.as_label(), target.as_label());
        tracing::info!(
            from = job.status.as_label(),
            to = target.as_label(),
            "compliance job advanced"
        );
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewComplianceJob, NewRunner};
    use crate::sink::{InMemoryResultSink, InMemorySummaryBuilder};
    use crate::status::TriggerType;
    use crate::store::RunnerResultUpdate;
    use crate::store::memory::InMemoryComplianceStore;

    struct Fixture {
        store: Arc<InMemoryComplianceStore>,
        sink: Arc<InMemoryResultSink>,
        summaries: Arc<InMemorySummaryBuilder>,
        aggregator: StatusAggregator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryComplianceStore::new());
        let sink = Arc::new(InMemoryResultSink::new());
        let summaries = Arc::new(InMemorySummaryBuilder::new(sink.clone()));
        let aggregator = StatusAggregator::new(
            FlowConfig::default(),
            store.clone(),
            sink.clone(),
            summaries.clone(),
        );
        Fixture {
            store,
            sink,
            summaries,
            aggregator,
        }
    }

    async fn job_with_runners(
        store: &InMemoryComplianceStore,
        controls: &[&str],
    ) -> Result<ComplianceJob> {
        let job = store
            .create_job(NewComplianceJob {
                framework_ids: vec!["cis".into()],
                ..NewComplianceJob::default()
            })
            .await?;
        let runners = controls
            .iter()
            .map(|control| NewRunner {
                parent_job_id: job.id,
                framework_id: "cis".into(),
                control_id: (*control).into(),
                policy_id: "p1".into(),
                integration_id: None,
                resource_collection_id: None,
                callers: Vec::new(),
                trigger_type: TriggerType::Scheduled,
            })
            .collect();
        store.insert_runners(runners).await?;
        store
            .update_job_status(
                job.id,
                JobStatusUpdate::to(ComplianceJobStatus::RunnersInProgress),
            )
            .await?;
        Ok(job)
    }

    async fn finish_all(store: &InMemoryComplianceStore, job: &ComplianceJob, status: RunnerStatus) -> Result<()> {
        for runner in store.list_runners_by_parent(job.id).await? {
            let mut update = RunnerResultUpdate::failed(&runner, "");
            update.status = status;
            store.apply_runner_result(update).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn waits_for_runners_and_records_status_vector() -> Result<()> {
        let fx = fixture();
        let job = job_with_runners(&fx.store, &["c1", "c2"]).await?;

        let report = fx.aggregator.run_aggregator_tick().await?;
        assert_eq!(report.advanced, 0);
        let stored = fx.store.get_job(job.id).await?.expect("job");
        let status = stored.runners_status.expect("status vector");
        assert_eq!(status.runners_created, 2);
        assert_eq!(status.counted(), status.total_count);
        assert!(!stored.are_all_runners_queued);
        Ok(())
    }

    #[tokio::test]
    async fn walks_sink_and_summarizer_phases_to_success() -> Result<()> {
        let fx = fixture();
        let job = job_with_runners(&fx.store, &["c1", "c2"]).await?;
        finish_all(&fx.store, &job, RunnerStatus::Succeeded).await?;
        fx.sink.hold(job.id)?;

        fx.aggregator.run_aggregator_tick().await?;
        let stored = fx.store.get_job(job.id).await?.expect("job");
        assert_eq!(stored.status, ComplianceJobStatus::SinkInProgress);

        // Held sink keeps the job in the sink phase.
        fx.aggregator.run_aggregator_tick().await?;
        let stored = fx.store.get_job(job.id).await?.expect("job");
        assert_eq!(stored.status, ComplianceJobStatus::SinkInProgress);

        fx.sink.release(job.id)?;
        let report = fx.aggregator.run_aggregator_tick().await?;
        // Sink and summarizer phases both complete within one tick.
        assert_eq!(report.succeeded, 1);
        let stored = fx.store.get_job(job.id).await?.expect("job");
        assert_eq!(stored.status, ComplianceJobStatus::Succeeded);

        let summarizers = fx.store.list_summarizers_by_parent(job.id).await?;
        assert_eq!(summarizers.len(), 1);
        assert_eq!(summarizers[0].status, RunnerStatus::Succeeded);
        Ok(())
    }

    #[tokio::test]
    async fn all_failed_runners_fail_the_job() -> Result<()> {
        let fx = fixture();
        let job = job_with_runners(&fx.store, &["c1", "c2"]).await?;
        finish_all(&fx.store, &job, RunnerStatus::Failed).await?;

        let report = fx.aggregator.run_aggregator_tick().await?;
        assert_eq!(report.failed, 1);
        let stored = fx.store.get_job(job.id).await?.expect("job");
        assert_eq!(stored.status, ComplianceJobStatus::Failed);
        assert_eq!(stored.step_failed, Some(StepFailed::Runners));
        assert_eq!(stored.failure_message, "all 2 runners failed");
        Ok(())
    }

    #[tokio::test]
    async fn failed_summary_fails_the_job() -> Result<()> {
        let fx = fixture();
        let job = job_with_runners(&fx.store, &["c1"]).await?;
        finish_all(&fx.store, &job, RunnerStatus::Succeeded).await?;
        fx.summaries.fail_benchmark("cis")?;

        fx.aggregator.run_aggregator_tick().await?;
        let stored = fx.store.get_job(job.id).await?.expect("job");
        assert_eq!(stored.status, ComplianceJobStatus::Failed);
        assert_eq!(stored.step_failed, Some(StepFailed::Summarizer));
        assert!(!stored.failure_message.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn job_without_runners_succeeds() -> Result<()> {
        let fx = fixture();
        let job = job_with_runners(&fx.store, &[]).await?;

        let report = fx.aggregator.run_aggregator_tick().await?;
        assert_eq!(report.succeeded, 1);
        let stored = fx.store.get_job(job.id).await?.expect("job");
        assert_eq!(stored.status, ComplianceJobStatus::Succeeded);
        Ok(())
    }
}
