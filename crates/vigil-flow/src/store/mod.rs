//! Runner state store.
//!
//! The [`ComplianceStore`] trait persists parent jobs, runners, and
//! summarizers. Every update is scoped to one row and guarded by the state
//! machines in [`crate::status`]:
//!
//! - re-applying the current status reports [`UpdateResult::Unchanged`]
//! - a transition the state machine forbids leaves the row untouched and
//!   reports [`UpdateResult::InvalidTransition`]
//! - runner results carrying an older retry count are [`UpdateResult::Stale`]

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vigil_core::{ComplianceJobId, RunnerId, SummarizerId};

use crate::error::Result;
use crate::model::{
    ComplianceJob, ComplianceRunner, ComplianceSummarizer, NewComplianceJob, NewRunner,
};
use crate::status::{ComplianceJobStatus, RunnerStatus, RunnersStatus, StepFailed, TriggerType};

/// Result of a guarded row update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResult {
    /// The update was applied.
    Applied,
    /// The row was already in the requested state.
    Unchanged,
    /// No row with that ID exists.
    NotFound,
    /// The state machine forbids the transition.
    InvalidTransition {
        /// Status the row is in.
        from: String,
        /// Status that was requested.
        to: String,
    },
    /// The update refers to an older dispatch attempt.
    Stale {
        /// Retry count currently stored on the row.
        current_retry: u32,
    },
}

impl UpdateResult {
    /// Returns true if the row changed.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    /// Returns true if the row is in the requested state afterwards.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Applied | Self::Unchanged)
    }
}

/// Requested parent job status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusUpdate {
    /// Target status.
    pub status: ComplianceJobStatus,
    /// Failed phase, for `FAILED`.
    pub step_failed: Option<StepFailed>,
    /// Failure message to store, if any.
    pub failure_message: Option<String>,
}

impl JobStatusUpdate {
    /// A plain phase change.
    #[must_use]
    pub const fn to(status: ComplianceJobStatus) -> Self {
        Self {
            status,
            step_failed: None,
            failure_message: None,
        }
    }

    /// A failure in `step` with a message.
    #[must_use]
    pub fn failed(step: StepFailed, message: impl Into<String>) -> Self {
        Self {
            status: ComplianceJobStatus::Failed,
            step_failed: Some(step),
            failure_message: Some(message.into()),
        }
    }

    /// A timeout with a message.
    #[must_use]
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            status: ComplianceJobStatus::Timeout,
            step_failed: None,
            failure_message: Some(message.into()),
        }
    }
}

/// Outcome reported for a runner, by a worker or by the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerResultUpdate {
    /// Runner being updated.
    pub runner_id: RunnerId,
    /// Dispatch attempt the outcome belongs to.
    pub retry_count: u32,
    /// Reported status.
    pub status: RunnerStatus,
    /// When a worker picked the runner up.
    pub started_at: Option<DateTime<Utc>>,
    /// Failure message, empty on success.
    pub failure_message: String,
    /// Retained findings on success.
    pub total_finding_count: Option<u64>,
    /// Worker that reported the outcome.
    pub worker_identity: Option<String>,
}

impl RunnerResultUpdate {
    /// A publisher-side failure for the current attempt of `runner`.
    #[must_use]
    pub fn failed(runner: &ComplianceRunner, message: impl Into<String>) -> Self {
        Self {
            runner_id: runner.id,
            retry_count: runner.retry_count,
            status: RunnerStatus::Failed,
            started_at: None,
            failure_message: message.into(),
            total_finding_count: None,
            worker_identity: None,
        }
    }
}

/// Storage for compliance jobs, runners, and summarizers.
#[async_trait]
pub trait ComplianceStore: Send + Sync {
    // --- Parent jobs ---

    /// Inserts a new parent job in `CREATED`.
    async fn create_job(&self, new: NewComplianceJob) -> Result<ComplianceJob>;

    /// Gets a parent job by ID.
    async fn get_job(&self, id: ComplianceJobId) -> Result<Option<ComplianceJob>>;

    /// Lists parent jobs in `status`, oldest first, at most `limit`.
    async fn list_jobs_by_status(
        &self,
        status: ComplianceJobStatus,
        limit: usize,
    ) -> Result<Vec<ComplianceJob>>;

    /// Moves a parent job to a new status.
    async fn update_job_status(
        &self,
        id: ComplianceJobId,
        update: JobStatusUpdate,
    ) -> Result<UpdateResult>;

    /// Stores the derived runner counters and the all-queued flag.
    async fn set_runners_status(&self, id: ComplianceJobId, status: RunnersStatus) -> Result<()>;

    /// Times out non-terminal parent jobs created before `cutoff`.
    async fn timeout_jobs_before(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<ComplianceJobId>>;

    // --- Runners ---

    /// Inserts runners. A runner whose key identifier already exists under
    /// the same parent is not inserted again; the stored row is returned.
    async fn insert_runners(&self, runners: Vec<NewRunner>) -> Result<Vec<ComplianceRunner>>;

    /// Gets a runner by ID.
    async fn get_runner(&self, id: RunnerId) -> Result<Option<ComplianceRunner>>;

    /// Lists every runner of a parent job.
    async fn list_runners_by_parent(
        &self,
        parent_job_id: ComplianceJobId,
    ) -> Result<Vec<ComplianceRunner>>;

    /// Lists runners in `status`, oldest first, at most `limit`.
    async fn list_runners_by_status(
        &self,
        status: RunnerStatus,
        limit: usize,
    ) -> Result<Vec<ComplianceRunner>>;

    /// Records a successful publish. Applies only while the runner is still `CREATED`.
    async fn mark_runner_queued(&self, id: RunnerId, sequence: u64) -> Result<UpdateResult>;

    /// Applies a reported runner outcome.
    ///
    /// An `IN_PROGRESS` report for a runner already `IN_PROGRESS` is
    /// [`UpdateResult::Unchanged`] but refreshes its heartbeat timestamp.
    async fn apply_runner_result(&self, update: RunnerResultUpdate) -> Result<UpdateResult>;

    /// Times out runners in `CREATED`, `QUEUED`, or `IN_PROGRESS` that have
    /// been silent since before `cutoff`. An `IN_PROGRESS` runner is measured
    /// from its last heartbeat, any other from its last status change.
    async fn timeout_runners_before(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<RunnerId>>;

    // --- Summarizers ---

    /// Creates one summarizer per benchmark. Existing (parent, benchmark)
    /// pairs are returned instead of being duplicated.
    async fn create_summarizers(
        &self,
        parent_job_id: ComplianceJobId,
        benchmark_ids: &[String],
        trigger_type: TriggerType,
    ) -> Result<Vec<ComplianceSummarizer>>;

    /// Lists the summarizers of a parent job.
    async fn list_summarizers_by_parent(
        &self,
        parent_job_id: ComplianceJobId,
    ) -> Result<Vec<ComplianceSummarizer>>;

    /// Moves a summarizer to a new status.
    async fn update_summarizer_status(
        &self,
        id: SummarizerId,
        status: RunnerStatus,
        failure_message: &str,
    ) -> Result<UpdateResult>;

    /// Times out non-terminal summarizers whose last status change is before `cutoff`.
    async fn timeout_summarizers_before(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<SummarizerId>>;
}
