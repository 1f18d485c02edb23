//! Rows and wire messages of the compliance pipeline.
//!
//! Wire types ([`Job`], [`Caller`], [`JobResult`], [`ComplianceResult`]) keep
//! the PascalCase field names other services already consume. Row types
//! ([`ComplianceJob`], [`ComplianceRunner`], [`ComplianceSummarizer`]) mirror
//! the state store tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vigil_core::{ComplianceJobId, RunnerId, SummarizerId};

use crate::status::{
    ComplianceJobStatus, RunnerStatus, RunnersStatus, StepFailed, SummarizerStatus, TriggerType,
};

/// Severity applied when a control declares none.
pub const DEFAULT_SEVERITY: &str = "none";

/// Identifier rendered for runners that target every integration.
pub const ALL_INTEGRATIONS: &str = "all";

/// One benchmark path that reaches a control.
///
/// A control may be referenced from several benchmark trees; each path
/// produces its own caller so results can be attributed to every tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    /// Root benchmark (framework) of the path.
    #[serde(rename = "RootBenchmark")]
    pub root_benchmark: String,
    /// Benchmarks from the root down to the direct parent of the control.
    #[serde(rename = "ParentBenchmarkIDs")]
    pub parent_benchmark_ids: Vec<String>,
    /// Control reached by this path.
    #[serde(rename = "ControlID")]
    pub control_id: String,
    /// Severity declared on the control, if any.
    #[serde(rename = "ControlSeverity")]
    pub control_severity: String,
}

impl Caller {
    /// Returns the declared severity or [`DEFAULT_SEVERITY`].
    #[must_use]
    pub fn severity(&self) -> &str {
        let severity = self.control_severity.trim();
        if severity.is_empty() {
            DEFAULT_SEVERITY
        } else {
            severity
        }
    }
}

/// The dispatch message for one runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Runner ID.
    #[serde(rename = "ID")]
    pub id: RunnerId,
    /// Umbrella compliance run.
    #[serde(rename = "ParentJobID")]
    pub parent_job_id: ComplianceJobId,
    /// Dispatch attempt counter.
    #[serde(rename = "RetryCount")]
    pub retry_count: u32,
    /// Framework (root benchmark) being evaluated.
    #[serde(rename = "FrameworkID")]
    pub framework_id: String,
    /// Control being evaluated.
    #[serde(rename = "ControlID")]
    pub control_id: String,
    /// Policy (query) backing the control.
    #[serde(rename = "PolicyID")]
    pub policy_id: String,
    /// Integration to evaluate; `None` means all integrations.
    #[serde(rename = "IntegrationID")]
    pub integration_id: Option<String>,
    /// Every benchmark path referencing the control.
    #[serde(rename = "Callers")]
    pub callers: Vec<Caller>,
    /// When the runner was created.
    #[serde(rename = "CreatedAt", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Message published by a worker back to the result topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// The job this result reports on.
    #[serde(rename = "Job")]
    pub job: Job,
    /// When the worker picked the message up.
    #[serde(rename = "StartedAt")]
    pub started_at: DateTime<Utc>,
    /// Reported status.
    #[serde(rename = "Status")]
    pub status: RunnerStatus,
    /// Error text, empty on success.
    #[serde(rename = "Error", default)]
    pub error: String,
    /// Number of retained findings, set on completion.
    #[serde(rename = "TotalComplianceResultCount", default)]
    pub total_compliance_result_count: Option<u64>,
    /// Worker that produced the result.
    #[serde(
        rename = "WorkerIdentity",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub worker_identity: Option<String>,
}

impl JobResult {
    /// Builds the in-progress snapshot published when a worker starts a job.
    #[must_use]
    pub fn in_progress(job: Job, started_at: DateTime<Utc>) -> Self {
        Self {
            job,
            started_at,
            status: RunnerStatus::InProgress,
            error: String::new(),
            total_compliance_result_count: None,
            worker_identity: None,
        }
    }

    /// Stamps the reporting worker.
    #[must_use]
    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker_identity = Some(worker.into());
        self
    }
}

/// One finding extracted from query output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComplianceResult {
    /// Benchmark the finding is attributed to.
    #[serde(rename = "BenchmarkID")]
    pub benchmark_id: String,
    /// Evaluated control.
    #[serde(rename = "ControlID")]
    pub control_id: String,
    /// Integration the resource belongs to.
    #[serde(rename = "IntegrationID")]
    pub integration_id: String,
    /// Integration type of the resource.
    pub integration_type: String,
    /// Resource identifier.
    #[serde(rename = "ResourceID")]
    pub resource_id: String,
    /// Display name of the resource.
    pub resource_name: String,
    /// Resource type.
    pub resource_type: String,
    /// Platform-level resource identifier.
    #[serde(rename = "PlatformResourceID")]
    pub platform_resource_id: String,
    /// `ok` or `alarm`.
    pub status: String,
    /// Control severity.
    pub severity: String,
    /// Reason reported by the query.
    pub reason: String,
    /// Estimated cost impact.
    pub cost_impact: f64,
    /// Reference codes from the root benchmark down to the control.
    pub control_path: String,
    /// Runner that produced the finding.
    #[serde(rename = "RunnerID")]
    pub runner_id: RunnerId,
    /// Parent compliance job.
    #[serde(rename = "ComplianceJobID")]
    pub compliance_job_id: ComplianceJobId,
    /// Evaluation timestamp.
    pub evaluated_at: DateTime<Utc>,
    /// Benchmarks from the root down to the control's direct parent.
    pub parent_benchmarks: Vec<String>,
}

/// Builds the idempotency identifier of a runner within its parent job.
#[must_use]
pub fn runner_key_identifier(
    framework_id: &str,
    control_id: &str,
    integration_id: Option<&str>,
    parent_job_id: ComplianceJobId,
) -> String {
    format!(
        "{framework_id}|{control_id}|{}|{parent_job_id}",
        integration_id.unwrap_or(ALL_INTEGRATIONS)
    )
}

/// Fields supplied by the originating service when creating a parent job.
#[derive(Debug, Clone, Default)]
pub struct NewComplianceJob {
    /// Frameworks to evaluate.
    pub framework_ids: Vec<String>,
    /// Integrations to evaluate; empty means all.
    pub integration_ids: Vec<String>,
    /// Scheduled or manual.
    pub trigger_type: TriggerType,
    /// Job this one re-runs, if any.
    pub parent_id: Option<ComplianceJobId>,
    /// Principal that created the job.
    pub created_by: String,
}

/// Parent compliance job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceJob {
    /// Row ID.
    pub id: ComplianceJobId,
    /// Frameworks to evaluate.
    pub framework_ids: Vec<String>,
    /// Integrations to evaluate; empty means all.
    pub integration_ids: Vec<String>,
    /// Current status.
    pub status: ComplianceJobStatus,
    /// Derived runner counters.
    pub runners_status: Option<RunnersStatus>,
    /// Phase that failed.
    pub step_failed: Option<StepFailed>,
    /// Failure message surfaced to callers.
    pub failure_message: String,
    /// Scheduled or manual.
    pub trigger_type: TriggerType,
    /// True once no runner is left in `CREATED`.
    pub are_all_runners_queued: bool,
    /// Job this one re-runs, if any.
    pub parent_id: Option<ComplianceJobId>,
    /// Principal that created the job.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl ComplianceJob {
    /// Materializes a new row in `CREATED`.
    #[must_use]
    pub fn from_new(id: ComplianceJobId, new: NewComplianceJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            framework_ids: new.framework_ids,
            integration_ids: new.integration_ids,
            status: ComplianceJobStatus::Created,
            runners_status: None,
            step_failed: None,
            failure_message: String::new(),
            trigger_type: new.trigger_type,
            are_all_runners_queued: false,
            parent_id: new.parent_id,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields required to persist a runner.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRunner {
    /// Parent job.
    pub parent_job_id: ComplianceJobId,
    /// Framework being evaluated.
    pub framework_id: String,
    /// Control being evaluated.
    pub control_id: String,
    /// Policy backing the control.
    pub policy_id: String,
    /// Integration to evaluate; `None` means all.
    pub integration_id: Option<String>,
    /// Resource collection scope, if any.
    pub resource_collection_id: Option<String>,
    /// Benchmark paths reaching the control.
    pub callers: Vec<Caller>,
    /// Scheduled or manual.
    pub trigger_type: TriggerType,
}

impl NewRunner {
    /// Returns the idempotency identifier of this runner.
    #[must_use]
    pub fn key_identifier(&self) -> String {
        runner_key_identifier(
            &self.framework_id,
            &self.control_id,
            self.integration_id.as_deref(),
            self.parent_job_id,
        )
    }
}

/// Runner row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRunner {
    /// Row ID.
    pub id: RunnerId,
    /// Parent job.
    pub parent_job_id: ComplianceJobId,
    /// Framework being evaluated.
    pub framework_id: String,
    /// Control being evaluated.
    pub control_id: String,
    /// Policy backing the control.
    pub policy_id: String,
    /// Integration to evaluate; `None` means all.
    pub integration_id: Option<String>,
    /// Resource collection scope, if any.
    pub resource_collection_id: Option<String>,
    /// Benchmark paths reaching the control.
    pub callers: Vec<Caller>,
    /// Current status.
    pub status: RunnerStatus,
    /// When a worker picked the runner up.
    pub started_at: Option<DateTime<Utc>>,
    /// Retained findings on success.
    pub total_finding_count: Option<u64>,
    /// Failure message surfaced to callers.
    pub failure_message: String,
    /// Dispatch attempt counter.
    pub retry_count: u32,
    /// Scheduled or manual.
    pub trigger_type: TriggerType,
    /// Broker sequence number assigned on publish.
    pub queue_sequence_number: Option<u64>,
    /// Worker that reported progress.
    pub worker_identity: Option<String>,
    /// Last `IN_PROGRESS` snapshot accepted from a worker.
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl ComplianceRunner {
    /// Materializes a new row in `CREATED`.
    #[must_use]
    pub fn from_new(id: RunnerId, new: NewRunner, now: DateTime<Utc>) -> Self {
        Self {
            id,
            parent_job_id: new.parent_job_id,
            framework_id: new.framework_id,
            control_id: new.control_id,
            policy_id: new.policy_id,
            integration_id: new.integration_id,
            resource_collection_id: new.resource_collection_id,
            callers: new.callers,
            status: RunnerStatus::Created,
            started_at: None,
            total_finding_count: None,
            failure_message: String::new(),
            retry_count: 0,
            trigger_type: new.trigger_type,
            queue_sequence_number: None,
            worker_identity: None,
            last_heartbeat_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the idempotency identifier of this runner.
    #[must_use]
    pub fn key_identifier(&self) -> String {
        runner_key_identifier(
            &self.framework_id,
            &self.control_id,
            self.integration_id.as_deref(),
            self.parent_job_id,
        )
    }

    /// Builds the dispatch message for this runner.
    #[must_use]
    pub fn to_job(&self) -> Job {
        Job {
            id: self.id,
            parent_job_id: self.parent_job_id,
            retry_count: self.retry_count,
            framework_id: self.framework_id.clone(),
            control_id: self.control_id.clone(),
            policy_id: self.policy_id.clone(),
            integration_id: self.integration_id.clone(),
            callers: self.callers.clone(),
            created_at: self.created_at,
        }
    }
}

/// Summarizer row: aggregates one benchmark's runners into a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSummarizer {
    /// Row ID.
    pub id: SummarizerId,
    /// Parent job.
    pub parent_job_id: ComplianceJobId,
    /// Benchmark being summarized.
    pub benchmark_id: String,
    /// Current status.
    pub status: SummarizerStatus,
    /// When the summarizer started.
    pub started_at: Option<DateTime<Utc>>,
    /// Failure message surfaced to callers.
    pub failure_message: String,
    /// Attempt counter.
    pub retry_count: u32,
    /// Scheduled or manual.
    pub trigger_type: TriggerType,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller(root: &str) -> Caller {
        Caller {
            root_benchmark: root.into(),
            parent_benchmark_ids: vec![root.into()],
            control_id: "ctrl-1".into(),
            control_severity: String::new(),
        }
    }

    #[test]
    fn job_message_uses_wire_field_names() {
        let job = Job {
            id: RunnerId::new(3),
            parent_job_id: ComplianceJobId::new(9),
            retry_count: 0,
            framework_id: "cis".into(),
            control_id: "ctrl-1".into(),
            policy_id: "pol-1".into(),
            integration_id: None,
            callers: vec![caller("cis")],
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["ID"], 3);
        assert_eq!(json["ParentJobID"], 9);
        assert!(json["IntegrationID"].is_null());
        assert_eq!(json["Callers"][0]["RootBenchmark"], "cis");
        assert_eq!(json["Callers"][0]["ParentBenchmarkIDs"][0], "cis");
    }

    #[test]
    fn job_message_without_created_at_parses() {
        let raw = r#"{"ID":1,"ParentJobID":2,"RetryCount":0,"FrameworkID":"f","ControlID":"c",
            "PolicyID":"p","IntegrationID":"acc-1","Callers":[]}"#;
        let job: Job = serde_json::from_str(raw).unwrap();
        assert_eq!(job.integration_id.as_deref(), Some("acc-1"));
    }

    #[test]
    fn key_identifier_renders_all_for_null_integration() {
        let key = runner_key_identifier("cis", "ctrl-1", None, ComplianceJobId::new(4));
        assert_eq!(key, "cis|ctrl-1|all|4");
        let key = runner_key_identifier("cis", "ctrl-1", Some("acc"), ComplianceJobId::new(4));
        assert_eq!(key, "cis|ctrl-1|acc|4");
    }

    #[test]
    fn caller_severity_defaults_to_none() {
        assert_eq!(caller("cis").severity(), "none");
        let mut high = caller("cis");
        high.control_severity = "high".into();
        assert_eq!(high.severity(), "high");
    }

    #[test]
    fn result_message_round_trips_status() {
        let job: Job = serde_json::from_str(
            r#"{"ID":1,"ParentJobID":2,"RetryCount":1,"FrameworkID":"f","ControlID":"c",
            "PolicyID":"p","IntegrationID":null,"Callers":[]}"#,
        )
        .unwrap();
        let result = JobResult::in_progress(job, Utc::now());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["Status"], "IN_PROGRESS");
        assert!(json["TotalComplianceResultCount"].is_null());
    }
}
