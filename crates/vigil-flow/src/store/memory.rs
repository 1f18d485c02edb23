//! In-memory store implementation for testing.
//!
//! [`InMemoryComplianceStore`] keeps every table in ordered maps behind one
//! lock. IDs are assigned sequentially per table, starting at 1.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vigil_core::{ComplianceJobId, RunnerId, SummarizerId};

use super::{ComplianceStore, JobStatusUpdate, RunnerResultUpdate, UpdateResult};
use crate::error::{Error, Result};
use crate::model::{
    ComplianceJob, ComplianceRunner, ComplianceSummarizer, NewComplianceJob, NewRunner,
};
use crate::status::{ComplianceJobStatus, RunnerStatus, RunnersStatus, TriggerType};

#[derive(Debug, Default)]
struct StoreState {
    jobs: BTreeMap<ComplianceJobId, ComplianceJob>,
    runners: BTreeMap<RunnerId, ComplianceRunner>,
    runner_keys: HashMap<String, RunnerId>,
    summarizers: BTreeMap<SummarizerId, ComplianceSummarizer>,
    next_job_id: u64,
    next_runner_id: u64,
    next_summarizer_id: u64,
    failing_runner_results: usize,
}

/// In-memory compliance store.
#[derive(Debug, Default)]
pub struct InMemoryComplianceStore {
    state: RwLock<StoreState>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("store lock poisoned")
}

const fn is_in_flight(status: RunnerStatus) -> bool {
    matches!(
        status,
        RunnerStatus::Created | RunnerStatus::Queued | RunnerStatus::InProgress
    )
}

impl InMemoryComplianceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runners across all jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn runner_count(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.runners.len())
    }

    /// Makes the next `count` runner result writes fail with a storage error.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_next_runner_results(&self, count: usize) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.failing_runner_results = count;
        Ok(())
    }
}

/// Instant the sweeper measures a runner's silence from.
fn last_activity(runner: &ComplianceRunner) -> DateTime<Utc> {
    match (runner.status, runner.last_heartbeat_at) {
        (RunnerStatus::InProgress, Some(heartbeat)) => heartbeat.max(runner.updated_at),
        _ => runner.updated_at,
    }
}

#[async_trait]
impl ComplianceStore for InMemoryComplianceStore {
    async fn create_job(&self, new: NewComplianceJob) -> Result<ComplianceJob> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.next_job_id += 1;
        let job = ComplianceJob::from_new(ComplianceJobId::new(state.next_job_id), new, Utc::now());
        state.jobs.insert(job.id, job.clone());
        drop(state);
        Ok(job)
    }

    async fn get_job(&self, id: ComplianceJobId) -> Result<Option<ComplianceJob>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn list_jobs_by_status(
        &self,
        status: ComplianceJobStatus,
        limit: usize,
    ) -> Result<Vec<ComplianceJob>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_job_status(
        &self,
        id: ComplianceJobId,
        update: JobStatusUpdate,
    ) -> Result<UpdateResult> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(UpdateResult::NotFound);
        };
        if job.status == update.status {
            return Ok(UpdateResult::Unchanged);
        }
        if !job.status.can_transition_to(update.status) {
            return Ok(UpdateResult::InvalidTransition {
                from: job.status.to_string(),
                to: update.status.to_string(),
            });
        }

        job.status = update.status;
        if update.step_failed.is_some() {
            job.step_failed = update.step_failed;
        }
        if let Some(message) = update.failure_message {
            job.failure_message = message;
        }
        job.updated_at = Utc::now();
        Ok(UpdateResult::Applied)
    }

    async fn set_runners_status(&self, id: ComplianceJobId, status: RunnersStatus) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("job", id))?;
        job.are_all_runners_queued = status.all_queued();
        job.runners_status = Some(status);
        Ok(())
    }

    async fn timeout_jobs_before(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<ComplianceJobId>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let now = Utc::now();
        let mut timed_out = Vec::new();
        for job in state.jobs.values_mut() {
            if !job.status.is_terminal() && job.created_at < cutoff {
                job.status = ComplianceJobStatus::Timeout;
                job.failure_message = message.to_string();
                job.updated_at = now;
                timed_out.push(job.id);
            }
        }
        Ok(timed_out)
    }

    async fn insert_runners(&self, runners: Vec<NewRunner>) -> Result<Vec<ComplianceRunner>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let now = Utc::now();
        let mut stored = Vec::with_capacity(runners.len());
        for new in runners {
            let key = new.key_identifier();
            if let Some(existing) = state
                .runner_keys
                .get(&key)
                .and_then(|id| state.runners.get(id))
            {
                stored.push(existing.clone());
                continue;
            }
            state.next_runner_id += 1;
            let runner = ComplianceRunner::from_new(RunnerId::new(state.next_runner_id), new, now);
            state.runner_keys.insert(key, runner.id);
            state.runners.insert(runner.id, runner.clone());
            stored.push(runner);
        }
        Ok(stored)
    }

    async fn get_runner(&self, id: RunnerId) -> Result<Option<ComplianceRunner>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.runners.get(&id).cloned())
    }

    async fn list_runners_by_parent(
        &self,
        parent_job_id: ComplianceJobId,
    ) -> Result<Vec<ComplianceRunner>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .runners
            .values()
            .filter(|runner| runner.parent_job_id == parent_job_id)
            .cloned()
            .collect())
    }

    async fn list_runners_by_status(
        &self,
        status: RunnerStatus,
        limit: usize,
    ) -> Result<Vec<ComplianceRunner>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .runners
            .values()
            .filter(|runner| runner.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_runner_queued(&self, id: RunnerId, sequence: u64) -> Result<UpdateResult> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(runner) = state.runners.get_mut(&id) else {
            return Ok(UpdateResult::NotFound);
        };
        match runner.status {
            RunnerStatus::Created => {
                runner.status = RunnerStatus::Queued;
                runner.queue_sequence_number = Some(sequence);
                runner.updated_at = Utc::now();
                Ok(UpdateResult::Applied)
            }
            RunnerStatus::Queued => Ok(UpdateResult::Unchanged),
            other => {
                // The worker already reported; keep its status but remember the sequence.
                runner.queue_sequence_number.get_or_insert(sequence);
                Ok(UpdateResult::InvalidTransition {
                    from: other.to_string(),
                    to: RunnerStatus::Queued.to_string(),
                })
            }
        }
    }

    async fn apply_runner_result(&self, update: RunnerResultUpdate) -> Result<UpdateResult> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.failing_runner_results > 0 {
            state.failing_runner_results -= 1;
            return Err(Error::storage("injected runner result failure"));
        }
        let Some(runner) = state.runners.get_mut(&update.runner_id) else {
            return Ok(UpdateResult::NotFound);
        };
        if update.retry_count < runner.retry_count {
            return Ok(UpdateResult::Stale {
                current_retry: runner.retry_count,
            });
        }
        if runner.status == update.status {
            if update.status == RunnerStatus::InProgress {
                runner.last_heartbeat_at = Some(Utc::now());
            }
            return Ok(UpdateResult::Unchanged);
        }
        if !runner.status.can_transition_to(update.status) {
            return Ok(UpdateResult::InvalidTransition {
                from: runner.status.to_string(),
                to: update.status.to_string(),
            });
        }

        runner.status = update.status;
        runner.retry_count = update.retry_count;
        if let Some(started_at) = update.started_at {
            runner.started_at = Some(started_at);
        }
        if let Some(worker) = update.worker_identity {
            runner.worker_identity = Some(worker);
        }
        if update.status.is_terminal() {
            runner.failure_message = update.failure_message;
            runner.total_finding_count = update.total_finding_count;
        }
        let now = Utc::now();
        if update.status == RunnerStatus::InProgress {
            runner.last_heartbeat_at = Some(now);
        }
        runner.updated_at = now;
        Ok(UpdateResult::Applied)
    }

    async fn timeout_runners_before(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<RunnerId>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let now = Utc::now();
        let mut timed_out = Vec::new();
        for runner in state.runners.values_mut() {
            if is_in_flight(runner.status) && last_activity(runner) < cutoff {
                runner.status = RunnerStatus::Timeout;
                runner.failure_message = message.to_string();
                runner.updated_at = now;
                timed_out.push(runner.id);
            }
        }
        Ok(timed_out)
    }

    async fn create_summarizers(
        &self,
        parent_job_id: ComplianceJobId,
        benchmark_ids: &[String],
        trigger_type: TriggerType,
    ) -> Result<Vec<ComplianceSummarizer>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let now = Utc::now();
        let mut created = Vec::with_capacity(benchmark_ids.len());
        for benchmark_id in benchmark_ids {
            if let Some(existing) = state
                .summarizers
                .values()
                .find(|s| s.parent_job_id == parent_job_id && &s.benchmark_id == benchmark_id)
            {
                created.push(existing.clone());
                continue;
            }
            state.next_summarizer_id += 1;
            let summarizer = ComplianceSummarizer {
                id: SummarizerId::new(state.next_summarizer_id),
                parent_job_id,
                benchmark_id: benchmark_id.clone(),
                status: RunnerStatus::Created,
                started_at: None,
                failure_message: String::new(),
                retry_count: 0,
                trigger_type,
                created_at: now,
                updated_at: now,
            };
            state.summarizers.insert(summarizer.id, summarizer.clone());
            created.push(summarizer);
        }
        Ok(created)
    }

    async fn list_summarizers_by_parent(
        &self,
        parent_job_id: ComplianceJobId,
    ) -> Result<Vec<ComplianceSummarizer>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .summarizers
            .values()
            .filter(|s| s.parent_job_id == parent_job_id)
            .cloned()
            .collect())
    }

    async fn update_summarizer_status(
        &self,
        id: SummarizerId,
        status: RunnerStatus,
        failure_message: &str,
    ) -> Result<UpdateResult> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(summarizer) = state.summarizers.get_mut(&id) else {
            return Ok(UpdateResult::NotFound);
        };
        if summarizer.status == status {
            return Ok(UpdateResult::Unchanged);
        }
        if !summarizer.status.can_transition_to(status) {
            return Ok(UpdateResult::InvalidTransition {
                from: summarizer.status.to_string(),
                to: status.to_string(),
            });
        }
        let now = Utc::now();
        if status == RunnerStatus::InProgress {
            summarizer.started_at = Some(now);
        }
        summarizer.status = status;
        summarizer.failure_message = failure_message.to_string();
        summarizer.updated_at = now;
        Ok(UpdateResult::Applied)
    }

    async fn timeout_summarizers_before(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<SummarizerId>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let now = Utc::now();
        let mut timed_out = Vec::new();
        for summarizer in state.summarizers.values_mut() {
            if is_in_flight(summarizer.status) && summarizer.updated_at < cutoff {
                summarizer.status = RunnerStatus::Timeout;
                summarizer.failure_message = message.to_string();
                summarizer.updated_at = now;
                timed_out.push(summarizer.id);
            }
        }
        Ok(timed_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Caller;
    use crate::status::StepFailed;
    use chrono::Duration;

    fn new_job() -> NewComplianceJob {
        NewComplianceJob {
            framework_ids: vec!["cis".into()],
            integration_ids: vec!["acc-1".into()],
            trigger_type: TriggerType::Scheduled,
            parent_id: None,
            created_by: "scheduler".into(),
        }
    }

    fn new_runner(parent: ComplianceJobId, control: &str) -> NewRunner {
        NewRunner {
            parent_job_id: parent,
            framework_id: "cis".into(),
            control_id: control.into(),
            policy_id: format!("{control}-policy"),
            integration_id: Some("acc-1".into()),
            resource_collection_id: None,
            callers: vec![Caller {
                root_benchmark: "cis".into(),
                parent_benchmark_ids: vec!["cis".into()],
                control_id: control.into(),
                control_severity: "high".into(),
            }],
            trigger_type: TriggerType::Scheduled,
        }
    }

    fn result(runner: &ComplianceRunner, status: RunnerStatus) -> RunnerResultUpdate {
        RunnerResultUpdate {
            runner_id: runner.id,
            retry_count: runner.retry_count,
            status,
            started_at: Some(Utc::now()),
            failure_message: String::new(),
            total_finding_count: Some(3),
            worker_identity: Some("worker-a".into()),
        }
    }

    #[tokio::test]
    async fn insert_runners_is_idempotent_by_key() -> Result<()> {
        let store = InMemoryComplianceStore::new();
        let job = store.create_job(new_job()).await?;

        let first = store
            .insert_runners(vec![new_runner(job.id, "c1"), new_runner(job.id, "c2")])
            .await?;
        let again = store.insert_runners(vec![new_runner(job.id, "c1")]).await?;

        assert_eq!(store.runner_count()?, 2);
        assert_eq!(again[0].id, first[0].id);
        Ok(())
    }

    #[tokio::test]
    async fn queued_only_applies_from_created() -> Result<()> {
        let store = InMemoryComplianceStore::new();
        let job = store.create_job(new_job()).await?;
        let runner = store.insert_runners(vec![new_runner(job.id, "c1")]).await?.remove(0);

        store
            .apply_runner_result(result(&runner, RunnerStatus::InProgress))
            .await?;
        let outcome = store.mark_runner_queued(runner.id, 9).await?;
        assert!(matches!(outcome, UpdateResult::InvalidTransition { .. }));

        let stored = store.get_runner(runner.id).await?.expect("runner");
        assert_eq!(stored.status, RunnerStatus::InProgress);
        assert_eq!(stored.queue_sequence_number, Some(9));
        assert_eq!(stored.worker_identity.as_deref(), Some("worker-a"));
        Ok(())
    }

    #[tokio::test]
    async fn redelivered_results_are_idempotent() -> Result<()> {
        let store = InMemoryComplianceStore::new();
        let job = store.create_job(new_job()).await?;
        let runner = store.insert_runners(vec![new_runner(job.id, "c1")]).await?.remove(0);

        let done = result(&runner, RunnerStatus::Succeeded);
        assert_eq!(store.apply_runner_result(done.clone()).await?, UpdateResult::Applied);
        assert_eq!(store.apply_runner_result(done).await?, UpdateResult::Unchanged);

        let late_progress = store
            .apply_runner_result(result(&runner, RunnerStatus::InProgress))
            .await?;
        assert!(!late_progress.is_settled());

        let stored = store.get_runner(runner.id).await?.expect("runner");
        assert_eq!(stored.status, RunnerStatus::Succeeded);
        assert_eq!(stored.total_finding_count, Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn job_transitions_are_guarded() -> Result<()> {
        let store = InMemoryComplianceStore::new();
        let job = store.create_job(new_job()).await?;

        let skip = store
            .update_job_status(job.id, JobStatusUpdate::to(ComplianceJobStatus::Succeeded))
            .await?;
        assert!(matches!(skip, UpdateResult::InvalidTransition { .. }));

        let failed = store
            .update_job_status(job.id, JobStatusUpdate::failed(StepFailed::Validation, "bad"))
            .await?;
        assert!(failed.is_applied());

        let stored = store.get_job(job.id).await?.expect("job");
        assert_eq!(stored.status, ComplianceJobStatus::Failed);
        assert_eq!(stored.step_failed, Some(StepFailed::Validation));
        assert_eq!(stored.failure_message, "bad");
        Ok(())
    }

    #[tokio::test]
    async fn timeouts_only_touch_in_flight_rows() -> Result<()> {
        let store = InMemoryComplianceStore::new();
        let job = store.create_job(new_job()).await?;
        let runners = store
            .insert_runners(vec![new_runner(job.id, "c1"), new_runner(job.id, "c2")])
            .await?;
        store
            .apply_runner_result(result(&runners[0], RunnerStatus::Succeeded))
            .await?;

        let future = Utc::now() + Duration::hours(3);
        let timed_out = store.timeout_runners_before(future, "Job timed out").await?;
        assert_eq!(timed_out, vec![runners[1].id]);

        let stored = store.get_runner(runners[1].id).await?.expect("runner");
        assert_eq!(stored.status, RunnerStatus::Timeout);
        assert_eq!(stored.failure_message, "Job timed out");

        let jobs = store.timeout_jobs_before(future, "Job timed out").await?;
        assert_eq!(jobs, vec![job.id]);
        assert!(store.timeout_jobs_before(future, "Job timed out").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn progress_snapshots_keep_a_runner_alive() -> Result<()> {
        let store = InMemoryComplianceStore::new();
        let job = store.create_job(new_job()).await?;
        let runners = store
            .insert_runners(vec![new_runner(job.id, "c1"), new_runner(job.id, "c2")])
            .await?;
        for runner in &runners {
            let started = store
                .apply_runner_result(result(runner, RunnerStatus::InProgress))
                .await?;
            assert!(started.is_applied());
        }

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let beat = store
            .apply_runner_result(result(&runners[0], RunnerStatus::InProgress))
            .await?;
        assert_eq!(beat, UpdateResult::Unchanged);
        let stored = store.get_runner(runners[0].id).await?.expect("runner");
        assert!(stored.last_heartbeat_at.is_some_and(|at| at > cutoff));

        let timed_out = store.timeout_runners_before(cutoff, "Job timed out").await?;
        assert_eq!(timed_out, vec![runners[1].id]);
        let alive = store.get_runner(runners[0].id).await?.expect("runner");
        assert_eq!(alive.status, RunnerStatus::InProgress);
        Ok(())
    }

    #[tokio::test]
    async fn injected_result_failures_are_consumed() -> Result<()> {
        let store = InMemoryComplianceStore::new();
        let job = store.create_job(new_job()).await?;
        let runner = store.insert_runners(vec![new_runner(job.id, "c1")]).await?.remove(0);
        store.fail_next_runner_results(1)?;

        let done = result(&runner, RunnerStatus::Succeeded);
        let err = store.apply_runner_result(done.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert_eq!(store.apply_runner_result(done).await?, UpdateResult::Applied);
        Ok(())
    }

    #[tokio::test]
    async fn summarizers_are_unique_per_benchmark() -> Result<()> {
        let store = InMemoryComplianceStore::new();
        let job = store.create_job(new_job()).await?;
        let ids = vec!["cis".to_string(), "soc2".to_string()];

        let first = store
            .create_summarizers(job.id, &ids, TriggerType::Scheduled)
            .await?;
        let second = store
            .create_summarizers(job.id, &ids, TriggerType::Scheduled)
            .await?;
        assert_eq!(first, second);
        assert_eq!(store.list_summarizers_by_parent(job.id).await?.len(), 2);

        let applied = store
            .update_summarizer_status(first[0].id, RunnerStatus::InProgress, "")
            .await?;
        assert!(applied.is_applied());
        Ok(())
    }

    #[tokio::test]
    async fn runners_status_sets_all_queued_flag() -> Result<()> {
        let store = InMemoryComplianceStore::new();
        let job = store.create_job(new_job()).await?;
        store
            .set_runners_status(job.id, RunnersStatus::from_statuses([RunnerStatus::Queued]))
            .await?;
        let stored = store.get_job(job.id).await?.expect("job");
        assert!(stored.are_all_runners_queued);
        assert_eq!(stored.runners_status.map(|s| s.total_count), Some(1));
        Ok(())
    }
}
