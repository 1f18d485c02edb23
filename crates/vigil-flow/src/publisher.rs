//! Scheduler/publisher: expands new compliance jobs into runners and
//! publishes runners to the job queue.
//!
//! One tick:
//!
//! 1. sweeps timed-out work
//! 2. validates automatically triggered `CREATED` jobs (cached per framework)
//! 3. expands each job into one runner per (control, integration) and moves
//!    it to `RUNNERS_IN_PROGRESS`
//! 4. publishes every `CREATED` runner under its deterministic key and marks
//!    it `QUEUED`
//!
//! A missing stream is provisioned once and the publish retried once; any
//! other publish failure marks that runner `FAILED` with the error text.
//! Expansion is idempotent because runners are keyed by
//! [`crate::model::runner_key_identifier`], and re-publishing is idempotent
//! because the broker deduplicates by message key.

use std::sync::Arc;

use chrono::Utc;
use tracing::Instrument;

use vigil_core::observability::{compliance_job_span, runner_span};

use crate::config::FlowConfig;
use crate::content::{ComplianceContent, framework_controls};
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::model::{ComplianceJob, ComplianceRunner, NewRunner};
use crate::queue::{JobQueue, PublishResult, message_key};
use crate::status::{ComplianceJobStatus, RunnerStatus, StepFailed};
use crate::store::{ComplianceStore, JobStatusUpdate, RunnerResultUpdate};
use crate::sweeper::{SweepReport, TimeoutSweeper};
use crate::validation::{FrameworkValidator, ValidationCache, ValidationVerdict};

/// What one publisher tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherTickReport {
    /// Rows timed out by the sweep.
    pub swept: SweepReport,
    /// Jobs expanded and moved to `RUNNERS_IN_PROGRESS`.
    pub jobs_expanded: usize,
    /// Jobs failed during validation or expansion.
    pub jobs_failed: usize,
    /// Runners published (or found already published) and marked `QUEUED`.
    pub runners_published: usize,
    /// Runners marked `FAILED` because they could not be published.
    pub runners_failed: usize,
}

enum JobOutcome {
    Expanded,
    Failed,
}

enum RunnerOutcome {
    Published,
    Failed,
}

/// Discovers pending work and dispatches it.
pub struct Publisher {
    config: FlowConfig,
    store: Arc<dyn ComplianceStore>,
    queue: Arc<dyn JobQueue>,
    content: Arc<dyn ComplianceContent>,
    validator: FrameworkValidator,
    sweeper: TimeoutSweeper,
    validation_cache: ValidationCache,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("config", &self.config)
            .field("validation_cache", &self.validation_cache)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// Creates a publisher.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the timeout budgets are out of range.
    pub fn new(
        config: FlowConfig,
        store: Arc<dyn ComplianceStore>,
        queue: Arc<dyn JobQueue>,
        content: Arc<dyn ComplianceContent>,
        validator: FrameworkValidator,
    ) -> Result<Self> {
        let sweeper = TimeoutSweeper::from_config(Arc::clone(&store), &config)?;
        Ok(Self {
            config,
            store,
            queue,
            content,
            validator,
            sweeper,
            validation_cache: ValidationCache::new(),
            metrics: FlowMetrics::new(),
        })
    }

    /// Validation verdicts cached across ticks.
    #[must_use]
    pub fn validation_cache(&self) -> &ValidationCache {
        &self.validation_cache
    }

    /// Runs one publisher tick.
    ///
    /// Per-job and per-runner failures are recorded on the rows and do not
    /// abort the tick.
    ///
    /// # Errors
    ///
    /// Returns an error only if listing pending jobs or runners fails.
    pub async fn run_publisher_tick(&mut self) -> Result<PublisherTickReport> {
        let _timer = self.metrics.time_tick("publisher");
        let mut report = PublisherTickReport::default();

        self.validation_cache.evict_unversioned();

        match self.sweeper.sweep(Utc::now()).await {
            Ok(swept) => report.swept = swept,
            Err(err) => tracing::error!(error = %err, "timeout sweep failed"),
        }

        let batch = self.config.publish_batch_size;
        let jobs = self
            .store
            .list_jobs_by_status(ComplianceJobStatus::Created, batch)
            .await?;
        for job in jobs {
            let span = compliance_job_span("expand", job.id.get());
            match self.process_job(&job).instrument(span).await {
                Ok(JobOutcome::Expanded) => report.jobs_expanded += 1,
                Ok(JobOutcome::Failed) => report.jobs_failed += 1,
                Err(err) => {
                    tracing::error!(job_id = %job.id, error = %err, "job expansion deferred to next tick");
                }
            }
        }

        let runners = self
            .store
            .list_runners_by_status(RunnerStatus::Created, batch)
            .await?;
        for runner in runners {
            let span = runner_span("publish", runner.id.get(), runner.parent_job_id.get());
            match self.publish_runner(&runner).instrument(span).await {
                Ok(RunnerOutcome::Published) => report.runners_published += 1,
                Ok(RunnerOutcome::Failed) => report.runners_failed += 1,
                Err(err) => {
                    tracing::error!(runner_id = %runner.id, error = %err, "runner publish deferred to next tick");
                }
            }
        }

        if report != PublisherTickReport::default() {
            tracing::info!(
                jobs_expanded = report.jobs_expanded,
                jobs_failed = report.jobs_failed,
                runners_published = report.runners_published,
                runners_failed = report.runners_failed,
                "publisher tick"
            );
        }
        Ok(report)
    }

    async fn process_job(&mut self, job: &ComplianceJob) -> Result<JobOutcome> {
        if job.trigger_type.is_automatic() {
            for framework_id in &job.framework_ids {
                let verdict = self
                    .validator
                    .validate_cached(&mut self.validation_cache, framework_id)
                    .await?;
                if let ValidationVerdict::Invalid(message) = verdict {
                    tracing::warn!(%framework_id, %message, "framework failed validation");
                    self.fail_job(job, StepFailed::Validation, message).await?;
                    return Ok(JobOutcome::Failed);
                }
            }
        }

        let runners = match self.build_runners(job).await {
            Ok(runners) => runners,
            Err(err @ Error::NotFound { .. }) => {
                self.fail_job(job, StepFailed::Validation, err.to_string())
                    .await?;
                return Ok(JobOutcome::Failed);
            }
            Err(err) => return Err(err),
        };

        let count = runners.len();
        self.store.insert_runners(runners).await?;
        let outcome = self
            .store
            .update_job_status(
                job.id,
                JobStatusUpdate::to(ComplianceJobStatus::RunnersInProgress),
            )
            .await?;
        if outcome.is_applied() {
            self.metrics.record_job_transition(
                ComplianceJobStatus::Created.as_label(),
                ComplianceJobStatus::RunnersInProgress.as_label(),
            );
        }
        tracing::info!(runners = count, "compliance job expanded");
        Ok(JobOutcome::Expanded)
    }

    async fn fail_job(&self, job: &ComplianceJob, step: StepFailed, message: String) -> Result<()> {
        let outcome = self
            .store
            .update_job_status(job.id, JobStatusUpdate::failed(step, message))
            .await?;
        if outcome.is_applied() {
            self.metrics.record_job_transition(
                job.status.as_label(),
                ComplianceJobStatus::Failed.as_label(),
            );
        }
        Ok(())
    }

    /// One runner per (control, integration); a single runner with no
    /// integration when the job targets all integrations.
    async fn build_runners(&self, job: &ComplianceJob) -> Result<Vec<NewRunner>> {
        let integrations: Vec<Option<String>> = if job.integration_ids.is_empty() {
            vec![None]
        } else {
            job.integration_ids.iter().cloned().map(Some).collect()
        };

        let mut runners = Vec::new();
        for framework_id in &job.framework_ids {
            let controls = framework_controls(self.content.as_ref(), framework_id).await?;
            for control in controls {
                for integration_id in &integrations {
                    runners.push(NewRunner {
                        parent_job_id: job.id,
                        framework_id: framework_id.clone(),
                        control_id: control.control.id.clone(),
                        policy_id: control.policy_id.clone(),
                        integration_id: integration_id.clone(),
                        resource_collection_id: None,
                        callers: control.callers.clone(),
                        trigger_type: job.trigger_type,
                    });
                }
            }
        }
        Ok(runners)
    }

    async fn publish_runner(&self, runner: &ComplianceRunner) -> Result<RunnerOutcome> {
        if runner.callers.is_empty() {
            return self.fail_runner(runner, "runner has no callers").await;
        }

        let payload = serde_json::to_vec(&runner.to_job())?;
        let topic = self.config.topics.job_topic_for(runner.trigger_type);
        let key = message_key::runner(&self.config.kind, runner.id, runner.retry_count);

        match self.publish_with_provisioning(&topic, &key, payload).await {
            Ok(published) => {
                self.metrics.record_publish("runner", published.as_label());
                self.store
                    .mark_runner_queued(runner.id, published.sequence())
                    .await?;
                tracing::debug!(%topic, %key, sequence = published.sequence(), "runner queued");
                Ok(RunnerOutcome::Published)
            }
            Err(err) => {
                self.metrics.record_publish("runner", "failed");
                tracing::warn!(%topic, %key, error = %err, "runner publish failed");
                self.fail_runner(runner, &err.to_string()).await
            }
        }
    }

    async fn fail_runner(&self, runner: &ComplianceRunner, message: &str) -> Result<RunnerOutcome> {
        self.store
            .apply_runner_result(RunnerResultUpdate::failed(runner, message))
            .await?;
        Ok(RunnerOutcome::Failed)
    }

    /// Publishes once; on a missing stream, provisions it and publishes exactly once more.
    async fn publish_with_provisioning(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<PublishResult> {
        match self.queue.publish(topic, key, payload.clone()).await {
            Err(err) if err.is_stream_not_found() => {
                tracing::warn!(topic, "stream missing, provisioning");
                let stream = self.config.stream_config();
                if let Err(provision_err) = self.queue.create_stream(&stream).await {
                    self.metrics.record_stream_provision("failed");
                    return Err(provision_err);
                }
                self.metrics.record_stream_provision("created");
                self.queue.publish(topic, key, payload).await
            }
            other => other,
        }
    }
}
