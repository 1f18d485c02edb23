//! Status vocabulary and state machines for jobs, runners, and summarizers.
//!
//! This module provides:
//! - [`RunnerStatus`]: the lifecycle of one dispatched unit (runners and summarizers)
//! - [`ComplianceJobStatus`]: the lifecycle of a parent compliance job
//! - [`RunnersStatus`]: the derived per-status counters stored on the parent
//! - [`TriggerType`] and [`StepFailed`]
//!
//! Terminal states are final. Re-applying the state an entity is already in
//! is an idempotent no-op, never an error, so redelivered messages cannot
//! corrupt the store.

use serde::{Deserialize, Serialize};

/// Lifecycle of a compliance runner or summarizer.
///
/// ```text
/// ┌─────────┐ published ┌────────┐ first heartbeat ┌─────────────┐
/// │ CREATED │──────────►│ QUEUED │────────────────►│ IN_PROGRESS │
/// └─────────┘           └────────┘                 └─────────────┘
///      │                     │                            │
///      └─────────────────────┴──────────────┬─────────────┘
///                                           ▼
///             SUCCEEDED | FAILED | TIMEOUT | CANCELED  (terminal)
/// ```
///
/// `CREATED` and `QUEUED` may skip straight ahead: the worker can report
/// progress before the publisher has recorded the queue sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerStatus {
    /// Persisted, not yet published.
    #[default]
    Created,
    /// Published to the job queue.
    Queued,
    /// A worker picked the message up.
    InProgress,
    /// Completed without error.
    Succeeded,
    /// Completed with an error.
    Failed,
    /// Exceeded its in-flight budget without a result.
    Timeout,
    /// Cancellation observed before completion.
    Canceled,
}

/// Summarizers share the runner vocabulary.
pub type SummarizerStatus = RunnerStatus;

impl RunnerStatus {
    /// Every runner status, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Created,
        Self::Queued,
        Self::InProgress,
        Self::Succeeded,
        Self::Failed,
        Self::Timeout,
        Self::Canceled,
    ];

    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Timeout | Self::Canceled
        )
    }

    /// Returns true if the transition from self to target is valid.
    ///
    /// Self-transitions are not considered valid here; callers treat them as
    /// no-ops before consulting this table.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Created => !matches!(target, Self::Created),
            Self::Queued => !matches!(target, Self::Created | Self::Queued),
            Self::InProgress => target.is_terminal(),
            Self::Succeeded | Self::Failed | Self::Timeout | Self::Canceled => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Queued => write!(f, "QUEUED"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// Lifecycle of a parent compliance job.
///
/// ```text
/// CREATED → RUNNERS_IN_PROGRESS → SINK_IN_PROGRESS → SUMMARIZER_IN_PROGRESS → SUCCEEDED
///     └──────────────┴────────────────────┴──────────────────┴──► FAILED | TIMEOUT | CANCELED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceJobStatus {
    /// Created by the originating service, not yet expanded.
    #[default]
    Created,
    /// Runners dispatched, awaiting completion.
    RunnersInProgress,
    /// Waiting for results to become durable in the search index.
    SinkInProgress,
    /// Post-aggregation summarizers running.
    SummarizerInProgress,
    /// All phases completed.
    Succeeded,
    /// A phase failed.
    Failed,
    /// Exceeded the job budget.
    Timeout,
    /// Cancelled by an operator or user.
    Canceled,
}

impl ComplianceJobStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Timeout | Self::Canceled
        )
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(target, Self::Failed | Self::Timeout | Self::Canceled) {
            return true;
        }
        matches!(
            (self, target),
            (Self::Created, Self::RunnersInProgress)
                | (Self::RunnersInProgress, Self::SinkInProgress)
                | (Self::SinkInProgress, Self::SummarizerInProgress)
                | (Self::SummarizerInProgress, Self::Succeeded)
        )
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::RunnersInProgress => "runners_in_progress",
            Self::SinkInProgress => "sink_in_progress",
            Self::SummarizerInProgress => "summarizer_in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for ComplianceJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::RunnersInProgress => write!(f, "RUNNERS_IN_PROGRESS"),
            Self::SinkInProgress => write!(f, "SINK_IN_PROGRESS"),
            Self::SummarizerInProgress => write!(f, "SUMMARIZER_IN_PROGRESS"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// How a compliance job was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Triggered by the internal scheduler.
    #[default]
    Scheduled,
    /// Triggered by a user.
    Manual,
}

impl TriggerType {
    /// Returns true for automatically triggered jobs.
    #[must_use]
    pub const fn is_automatic(&self) -> bool {
        matches!(self, Self::Scheduled)
    }
}

/// The phase in which a parent job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepFailed {
    /// Validation or expansion before dispatch.
    Validation,
    /// Runner dispatch or evaluation.
    Runners,
    /// Result persistence.
    Sink,
    /// Summary computation.
    Summarizer,
}

/// Per-status counters over a parent job's runners.
///
/// Cancelled runners are counted as failed so the six counters always sum to
/// the total number of runners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunnersStatus {
    /// Runners persisted but not yet published.
    pub runners_created: u64,
    /// Runners published, not yet picked up.
    pub runners_queued: u64,
    /// Runners being evaluated.
    pub runners_running: u64,
    /// Runners that failed or were cancelled.
    pub runners_failed: u64,
    /// Runners that succeeded.
    pub runners_succeeded: u64,
    /// Runners that timed out.
    pub runners_timed_out: u64,
    /// Total runners of the job.
    pub total_count: u64,
}

impl RunnersStatus {
    /// Counts statuses into a status vector.
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = RunnerStatus>,
    {
        let mut status = Self::default();
        for runner_status in statuses {
            status.record(runner_status);
        }
        status
    }

    /// Adds one runner to the vector.
    pub fn record(&mut self, runner_status: RunnerStatus) {
        match runner_status {
            RunnerStatus::Created => self.runners_created += 1,
            RunnerStatus::Queued => self.runners_queued += 1,
            RunnerStatus::InProgress => self.runners_running += 1,
            RunnerStatus::Failed | RunnerStatus::Canceled => self.runners_failed += 1,
            RunnerStatus::Succeeded => self.runners_succeeded += 1,
            RunnerStatus::Timeout => self.runners_timed_out += 1,
        }
        self.total_count += 1;
    }

    /// Sum of the per-status counters.
    #[must_use]
    pub const fn counted(&self) -> u64 {
        self.runners_created
            + self.runners_queued
            + self.runners_running
            + self.runners_failed
            + self.runners_succeeded
            + self.runners_timed_out
    }

    /// Returns true when every runner reached a terminal state.
    #[must_use]
    pub const fn all_terminal(&self) -> bool {
        self.runners_created == 0 && self.runners_queued == 0 && self.runners_running == 0
    }

    /// Returns true when no runner is left in `CREATED`.
    #[must_use]
    pub const fn all_queued(&self) -> bool {
        self.runners_created == 0
    }
}
