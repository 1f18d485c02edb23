//! Runner worker: pulls runner jobs, evaluates them, and reports results.
//!
//! For each delivery the worker:
//!
//! 1. decodes the [`Job`] (undecodable payloads are acked and logged)
//! 2. publishes an `IN_PROGRESS` [`JobResult`]
//! 3. starts a heartbeat task extending the delivery's ack deadline, a
//!    progress task republishing the `IN_PROGRESS` snapshot so the state
//!    store sees the runner as alive, and a cancellation task polling the
//!    parent job's status
//! 4. evaluates the runner: loads its policy, resolves the resource type,
//!    runs the query, extracts findings, and writes them to the sink
//! 5. publishes the final [`JobResult`] through a [`ResultObligation`]
//! 6. acks the delivery once the final result is published
//!
//! The side tasks stop before the final result is published. A `CANCELED`
//! parent ends the evaluation at its next suspension point and is reported
//! as `CANCELED` with no failure message.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use vigil_core::{ComplianceJobId, WorkerId};
use vigil_core::observability::runner_span;

use crate::config::FlowConfig;
use crate::content::{ComplianceContent, ParameterSource};
use crate::engine::{QueryEngine, QueryRequest};
use crate::error::{Error, Result};
use crate::extract::{ExtractionContext, ReferenceCodeCache, extract_results, resolve_resource_type};
use crate::metrics::FlowMetrics;
use crate::model::{Job, JobResult};
use crate::queue::{ConsumerConfig, Delivery, JobQueue, PublishResult, message_key};
use crate::registry::IntegrationTypeRegistry;
use crate::sink::ResultSink;
use crate::status::{ComplianceJobStatus, RunnerStatus, TriggerType};
use crate::status_client::JobStatusClient;

/// Pause between pulls when the consumer has nothing to deliver.
const IDLE_BACKOFF: Duration = Duration::from_millis(500);

/// Failure reported when a worker stops without settling a result.
pub const ABANDONED_MESSAGE: &str = "worker stopped before reporting a result";

/// External capabilities a worker evaluates runners with.
#[derive(Clone)]
pub struct WorkerServices {
    /// Broker carrying runner jobs and results.
    pub queue: Arc<dyn JobQueue>,
    /// Benchmark, control, and policy content.
    pub content: Arc<dyn ComplianceContent>,
    /// Query parameter values.
    pub parameters: Arc<dyn ParameterSource>,
    /// Table to resource type mapping.
    pub registry: Arc<IntegrationTypeRegistry>,
    /// Query execution.
    pub engine: Arc<dyn QueryEngine>,
    /// Destination for findings.
    pub sink: Arc<dyn ResultSink>,
    /// Parent job status lookups.
    pub status_client: Arc<dyn JobStatusClient>,
}

impl std::fmt::Debug for WorkerServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerServices")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Attempts made to publish a final result before giving up.
const PUBLISH_ATTEMPTS: u32 = 3;

/// Delay before the first final-result retry; doubles per attempt.
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Publishes `payload`, retrying broker failures with exponential backoff.
async fn publish_with_retry(
    queue: &dyn JobQueue,
    topic: &str,
    key: &str,
    payload: &[u8],
) -> Result<PublishResult> {
    let mut delay = PUBLISH_RETRY_DELAY;
    let mut attempt = 1;
    loop {
        match queue.publish(topic, key, payload.to_vec()).await {
            Ok(published) => return Ok(published),
            Err(err) if attempt < PUBLISH_ATTEMPTS => {
                tracing::warn!(%key, attempt, error = %err, "runner result publish failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Guarantees a final result is published for a started job.
///
/// Created once a job is decoded. [`Self::fulfil`] publishes the final
/// result, retrying broker failures. The obligation stays armed until a
/// publish succeeds: if it is dropped first (the evaluation future was
/// dropped during shutdown, or every attempt failed), the pending result is
/// published on a detached task instead. Before `fulfil` is called the
/// pending result is the `IN_PROGRESS` snapshot reported as `FAILED`.
#[must_use = "an obligation publishes a failure when dropped unfulfilled"]
pub struct ResultObligation {
    queue: Arc<dyn JobQueue>,
    topic: String,
    key: String,
    pending: Option<JobResult>,
}

impl std::fmt::Debug for ResultObligation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultObligation")
            .field("topic", &self.topic)
            .field("key", &self.key)
            .field("fulfilled", &self.pending.is_none())
            .finish()
    }
}

impl ResultObligation {
    /// Creates an obligation whose fallback is `snapshot` reported as `FAILED`.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        topic: impl Into<String>,
        key: impl Into<String>,
        snapshot: &JobResult,
    ) -> Self {
        let mut fallback = snapshot.clone();
        fallback.status = RunnerStatus::Failed;
        fallback.error = ABANDONED_MESSAGE.to_string();
        Self {
            queue,
            topic: topic.into(),
            key: key.into(),
            pending: Some(fallback),
        }
    }

    /// Result key this obligation publishes under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publishes the final result.
    ///
    /// # Errors
    ///
    /// Returns the serialization error, or the last broker error once every
    /// attempt has failed. In both cases the obligation is dropped still
    /// armed and its pending result is republished in the background.
    pub async fn fulfil(mut self, result: JobResult) -> Result<PublishResult> {
        let payload = serde_json::to_vec(&result)?;
        self.pending = Some(result);
        let published =
            publish_with_retry(self.queue.as_ref(), &self.topic, &self.key, &payload).await?;
        self.pending = None;
        Ok(published)
    }
}

impl Drop for ResultObligation {
    fn drop(&mut self) {
        let Some(result) = self.pending.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(key = %self.key, "no runtime to publish abandoned runner result");
            return;
        };
        let payload = match serde_json::to_vec(&result) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(key = %self.key, error = %err, "failed to encode abandoned runner result");
                return;
            }
        };
        let queue = Arc::clone(&self.queue);
        let topic = std::mem::take(&mut self.topic);
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            if let Err(err) = publish_with_retry(queue.as_ref(), &topic, &key, &payload).await {
                tracing::error!(%key, error = %err, "failed to publish abandoned runner result");
            }
        });
    }
}

/// What the side tasks of one delivery report on.
struct WatchTarget {
    consumer: String,
    delivery_id: String,
    parent_job_id: ComplianceJobId,
    progress_topic: String,
    snapshot: JobResult,
}

/// Heartbeat, progress, and cancellation tasks bound to one delivery.
struct Watchers {
    scope: CancellationToken,
    heartbeat: JoinHandle<()>,
    progress: JoinHandle<()>,
    cancellation: JoinHandle<()>,
}

impl Watchers {
    fn spawn(
        config: &FlowConfig,
        services: &WorkerServices,
        target: WatchTarget,
        execution: CancellationToken,
        scope: CancellationToken,
    ) -> Self {
        let metrics = FlowMetrics::new();
        let WatchTarget {
            consumer,
            delivery_id,
            parent_job_id,
            progress_topic,
            snapshot,
        } = target;

        let queue = Arc::clone(&services.queue);
        let heartbeat_interval = config.heartbeat_interval;
        let heartbeat_scope = scope.clone();
        let heartbeat = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = heartbeat_scope.cancelled() => break,
                        () = tokio::time::sleep(heartbeat_interval) => {
                            match queue.in_progress(&consumer, &delivery_id).await {
                                Ok(()) => metrics.record_heartbeat("ok"),
                                Err(err) => {
                                    metrics.record_heartbeat("failed");
                                    tracing::warn!(error = %err, "heartbeat failed");
                                }
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        let queue = Arc::clone(&services.queue);
        let kind = config.kind.clone();
        let progress_interval = config.progress_interval;
        let progress_scope = scope.clone();
        let progress = tokio::spawn(
            async move {
                let mut beat = 0_u64;
                loop {
                    tokio::select! {
                        () = progress_scope.cancelled() => break,
                        () = tokio::time::sleep(progress_interval) => {
                            beat += 1;
                            let key = message_key::progress(
                                &kind,
                                snapshot.job.id,
                                snapshot.job.retry_count,
                                beat,
                            );
                            publish_progress(queue.as_ref(), &progress_topic, &key, &snapshot)
                                .await;
                        }
                    }
                }
            }
            .in_current_span(),
        );

        let status_client = Arc::clone(&services.status_client);
        let poll_interval = config.cancellation_poll_interval;
        let cancellation_scope = scope.clone();
        let cancellation = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = cancellation_scope.cancelled() => break,
                        () = tokio::time::sleep(poll_interval) => {
                            match status_client.job_status(parent_job_id).await {
                                Ok(ComplianceJobStatus::Canceled) => {
                                    tracing::info!(%parent_job_id, "parent job canceled");
                                    metrics.record_cancellation();
                                    execution.cancel();
                                    break;
                                }
                                Ok(_) => {}
                                Err(err) => {
                                    tracing::warn!(error = %err, "parent status poll failed");
                                }
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        Self {
            scope,
            heartbeat,
            progress,
            cancellation,
        }
    }

    async fn shutdown(self) {
        self.scope.cancel();
        for (name, handle) in [
            ("heartbeat", self.heartbeat),
            ("progress", self.progress),
            ("cancellation", self.cancellation),
        ] {
            if let Err(err) = handle.await {
                tracing::error!(task = name, error = %err, "runner side task failed");
            }
        }
    }
}

/// Publishes an `IN_PROGRESS` snapshot; failures are logged and skipped.
async fn publish_progress(queue: &dyn JobQueue, topic: &str, key: &str, snapshot: &JobResult) {
    match serde_json::to_vec(snapshot) {
        Ok(payload) => {
            if let Err(err) = queue.publish(topic, key, payload).await {
                tracing::warn!(%key, error = %err, "failed to publish in-progress result");
            }
        }
        Err(err) => tracing::warn!(%key, error = %err, "failed to encode in-progress result"),
    }
}

/// Evaluates runner jobs from one consumer group.
pub struct RunnerWorker {
    config: FlowConfig,
    consumer: ConsumerConfig,
    identity: WorkerId,
    services: WorkerServices,
    reference_codes: ReferenceCodeCache,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for RunnerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerWorker")
            .field("identity", &self.identity)
            .field("consumer", &self.consumer)
            .field("reference_codes", &self.reference_codes.len())
            .finish_non_exhaustive()
    }
}

impl RunnerWorker {
    /// Creates a worker consuming the `trigger` group.
    #[must_use]
    pub fn new(config: FlowConfig, trigger: TriggerType, services: WorkerServices) -> Self {
        let consumer = config.job_consumer(trigger);
        Self {
            config,
            consumer,
            identity: WorkerId::generate(),
            services,
            reference_codes: ReferenceCodeCache::new(),
            metrics: FlowMetrics::new(),
        }
    }

    /// Identity stamped on every result this worker publishes.
    #[must_use]
    pub fn identity(&self) -> WorkerId {
        self.identity
    }

    /// Consumer group this worker pulls from.
    #[must_use]
    pub fn consumer(&self) -> &ConsumerConfig {
        &self.consumer
    }

    /// Provisions the stream and this worker's consumer.
    ///
    /// # Errors
    ///
    /// Returns the broker error if provisioning fails.
    pub async fn ensure_consumer(&self) -> Result<()> {
        let stream = self.config.stream_config();
        self.services.queue.create_stream(&stream).await?;
        self.services
            .queue
            .create_consumer(&stream.name, &self.consumer)
            .await
    }

    /// Pulls until `shutdown` is cancelled, then drains the consumer.
    ///
    /// A job already being evaluated when shutdown is requested runs to
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns an error if provisioning or draining the consumer fails.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        self.ensure_consumer().await?;
        tracing::info!(worker = %self.identity, consumer = %self.consumer.name, "runner worker started");

        while !shutdown.is_cancelled() {
            match self.process_next().await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.reference_codes.clear();
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(IDLE_BACKOFF) => {}
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "runner delivery failed");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(IDLE_BACKOFF) => {}
                    }
                }
            }
        }

        self.services.queue.drain(&self.consumer.name).await?;
        tracing::info!(worker = %self.identity, "runner worker stopped");
        Ok(())
    }

    /// Pulls and handles one delivery.
    ///
    /// Returns the reported status, or `None` if nothing was delivered or
    /// the payload could not be decoded.
    ///
    /// # Errors
    ///
    /// Returns an error if pulling, publishing the final result, or acking fails.
    pub async fn process_next(&mut self) -> Result<Option<RunnerStatus>> {
        match self.services.queue.pull(&self.consumer.name).await? {
            Some(delivery) => self.handle_delivery(delivery).await,
            None => Ok(None),
        }
    }

    async fn handle_delivery(&mut self, delivery: Delivery) -> Result<Option<RunnerStatus>> {
        let job: Job = match serde_json::from_slice(&delivery.payload) {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(
                    key = %delivery.key,
                    sequence = delivery.sequence,
                    error = %err,
                    "dropping undecodable runner job"
                );
                self.services
                    .queue
                    .ack(&self.consumer.name, &delivery.delivery_id)
                    .await?;
                return Ok(None);
            }
        };

        let span = runner_span("evaluate", job.id.get(), job.parent_job_id.get());
        self.evaluate_delivery(job, delivery).instrument(span).await.map(Some)
    }

    async fn evaluate_delivery(&mut self, job: Job, delivery: Delivery) -> Result<RunnerStatus> {
        let started = tokio::time::Instant::now();
        let queue = Arc::clone(&self.services.queue);
        let topic = self.config.topics.result_topic.clone();
        let key = message_key::result(&self.config.kind, job.id, job.retry_count);

        let snapshot =
            JobResult::in_progress(job.clone(), Utc::now()).with_worker(self.identity.to_string());
        let obligation = ResultObligation::new(Arc::clone(&queue), &topic, &key, &snapshot);

        let progress_key = message_key::progress(&self.config.kind, job.id, job.retry_count, 0);
        publish_progress(queue.as_ref(), &topic, &progress_key, &snapshot).await;

        let scope = CancellationToken::new();
        let execution = scope.child_token();
        let watchers = Watchers::spawn(
            &self.config,
            &self.services,
            WatchTarget {
                consumer: self.consumer.name.clone(),
                delivery_id: delivery.delivery_id.clone(),
                parent_job_id: job.parent_job_id,
                progress_topic: topic.clone(),
                snapshot: snapshot.clone(),
            },
            execution.clone(),
            scope,
        );

        let outcome = AssertUnwindSafe(self.evaluate(&job, &execution))
            .catch_unwind()
            .await;
        watchers.shutdown().await;

        let mut result = snapshot;
        match outcome {
            Ok(Ok(count)) => {
                result.status = RunnerStatus::Succeeded;
                result.total_compliance_result_count = Some(count);
            }
            Ok(Err(Error::Cancelled)) => {
                result.status = RunnerStatus::Canceled;
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "runner evaluation failed");
                result.status = RunnerStatus::Failed;
                result.error = err.to_string();
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(%message, "runner evaluation panicked");
                result.status = RunnerStatus::Failed;
                result.error = format!("runner evaluation panicked: {message}");
            }
        }

        let status = result.status;
        obligation.fulfil(result).await?;
        self.metrics
            .record_runner_result(status.as_label(), started.elapsed());
        queue.ack(&self.consumer.name, &delivery.delivery_id).await?;
        tracing::info!(status = status.as_label(), "runner finished");
        Ok(status)
    }

    /// Runs the query for `job` and writes its findings to the sink.
    async fn evaluate(&mut self, job: &Job, execution: &CancellationToken) -> Result<u64> {
        match self
            .services
            .status_client
            .job_status(job.parent_job_id)
            .await
        {
            Ok(ComplianceJobStatus::Canceled) => return Err(Error::Cancelled),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "initial parent status check failed"),
        }

        let policy = self
            .services
            .content
            .get_policy(&job.policy_id)
            .await?
            .ok_or_else(|| Error::not_found("policy", &job.policy_id))?;

        let mut parameters = BTreeMap::new();
        for key in &policy.parameters {
            let value = self
                .services
                .parameters
                .get_parameter(key)
                .await?
                .ok_or_else(|| {
                    Error::execution(format!(
                        "parameter {key} required by policy {} is not set",
                        policy.id
                    ))
                })?;
            parameters.insert(key.clone(), value);
        }

        let resolved = resolve_resource_type(&self.services.registry, &policy)?;

        let request = QueryRequest {
            query: policy.query.clone(),
            integration_id: job.integration_id.clone(),
            parameters,
        };
        let output = tokio::select! {
            biased;
            () = execution.cancelled() => return Err(Error::Cancelled),
            output = self.services.engine.execute(&request) => output?,
        };

        let mut control_paths = Vec::with_capacity(job.callers.len());
        for caller in &job.callers {
            let path = self
                .reference_codes
                .control_path(self.services.content.as_ref(), caller)
                .await?;
            control_paths.push(path);
        }

        let ctx = ExtractionContext {
            job,
            registry: &self.services.registry,
            integration_types: &policy.integration_types,
            resolved: resolved.as_ref(),
            control_paths: &control_paths,
            evaluated_at: Utc::now(),
        };
        let results = extract_results(&output, &ctx);

        if execution.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let count = results.len() as u64;
        self.services.sink.write_results(job.id, results).await?;
        Ok(count)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{Benchmark, Control, InMemoryContent, InMemoryParameters, Policy};
    use crate::engine::{QueryOutput, StaticQueryEngine};
    use crate::model::{Caller, NewComplianceJob};
    use crate::queue::memory::{InMemoryJobQueue, InjectedFailure};
    use crate::registry::StaticIntegrationType;
    use crate::sink::InMemoryResultSink;
    use crate::status_client::StoreJobStatusClient;
    use crate::store::memory::InMemoryComplianceStore;
    use crate::store::{ComplianceStore, JobStatusUpdate};
    use serde_json::json;
    use vigil_core::RunnerId;

    struct Fixture {
        queue: Arc<InMemoryJobQueue>,
        sink: Arc<InMemoryResultSink>,
        store: Arc<InMemoryComplianceStore>,
        worker: RunnerWorker,
        parent: ComplianceJobId,
    }

    fn content() -> InMemoryContent {
        InMemoryContent::new()
            .with_benchmark(Benchmark {
                id: "cis".into(),
                reference_code: "CIS".into(),
                children: Vec::new(),
                controls: vec!["c1".into()],
            })
            .with_control(Control {
                id: "c1".into(),
                policy_id: Some("p1".into()),
                severity: "high".into(),
            })
            .with_policy(Policy {
                id: "p1".into(),
                query: "select buckets".into(),
                primary_resource: Some("aws_s3_bucket".into()),
                list_of_resources: vec!["aws_s3_bucket".into()],
                integration_types: vec!["aws_cloud_account".into()],
                parameters: Vec::new(),
            })
    }

    async fn fixture(engine: StaticQueryEngine) -> Result<Fixture> {
        let queue = Arc::new(InMemoryJobQueue::new());
        let sink = Arc::new(InMemoryResultSink::new());
        let store = Arc::new(InMemoryComplianceStore::new());
        let parent = store.create_job(NewComplianceJob::default()).await?.id;
        let registry = IntegrationTypeRegistry::new().with_provider(Arc::new(
            StaticIntegrationType::new("aws_cloud_account")
                .with_table("aws_s3_bucket", "AWS::S3::Bucket"),
        ));
        let services = WorkerServices {
            queue: queue.clone(),
            content: Arc::new(content()),
            parameters: Arc::new(InMemoryParameters::new()),
            registry: Arc::new(registry),
            engine: Arc::new(engine),
            sink: sink.clone(),
            status_client: Arc::new(StoreJobStatusClient::new(store.clone())),
        };
        let worker = RunnerWorker::new(FlowConfig::default(), TriggerType::Scheduled, services);
        worker.ensure_consumer().await?;
        Ok(Fixture {
            queue,
            sink,
            store,
            worker,
            parent,
        })
    }

    fn job(parent: ComplianceJobId) -> Job {
        Job {
            id: RunnerId::new(7),
            parent_job_id: parent,
            retry_count: 0,
            framework_id: "cis".into(),
            control_id: "c1".into(),
            policy_id: "p1".into(),
            integration_id: Some("acc-1".into()),
            callers: vec![Caller {
                root_benchmark: "cis".into(),
                parent_benchmark_ids: vec!["cis".into()],
                control_id: "c1".into(),
                control_severity: "high".into(),
            }],
            created_at: Utc::now(),
        }
    }

    async fn dispatch(fx: &Fixture, job: &Job) -> Result<()> {
        let topic = FlowConfig::default().topics.job_topic;
        fx.queue
            .publish(&topic, "runner-7-0", serde_json::to_vec(job)?)
            .await?;
        Ok(())
    }

    fn results(fx: &Fixture) -> Result<Vec<JobResult>> {
        let topic = FlowConfig::default().topics.result_topic;
        fx.queue
            .published(&topic)?
            .into_iter()
            .map(|message| Ok(serde_json::from_slice(&message.payload)?))
            .collect()
    }

    fn bucket_output() -> QueryOutput {
        QueryOutput::new(
            vec!["resource".into(), "name".into(), "status".into(), "reason".into()],
            vec![
                vec![json!("arn:1"), json!("logs"), json!("alarm"), json!("public")],
                vec![json!("arn:2"), json!("data"), json!("ok"), json!("private")],
                vec![json!("null"), json!("x"), json!("ok"), json!("")],
                vec![json!("arn:3"), json!("tmp"), json!("skip"), json!("")],
            ],
        )
    }

    #[tokio::test]
    async fn successful_evaluation_reports_and_acks() -> Result<()> {
        let mut fx =
            fixture(StaticQueryEngine::new().with_output("select buckets", bucket_output())).await?;
        let job = job(fx.parent);
        dispatch(&fx, &job).await?;

        let status = fx.worker.process_next().await?;
        assert_eq!(status, Some(RunnerStatus::Succeeded));

        let reported = results(&fx)?;
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].status, RunnerStatus::InProgress);
        assert_eq!(reported[1].status, RunnerStatus::Succeeded);
        assert_eq!(reported[1].total_compliance_result_count, Some(2));
        assert_eq!(
            reported[1].worker_identity.as_deref(),
            Some(fx.worker.identity().to_string().as_str())
        );

        let findings = fx.sink.results_for_job(fx.parent)?;
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.control_path == "CIS/c1"));
        assert_eq!(fx.queue.pending_count(&fx.worker.consumer().name)?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn query_failure_is_reported_verbatim() -> Result<()> {
        let mut fx = fixture(
            StaticQueryEngine::new().with_failure("select buckets", "relation does not exist"),
        )
        .await?;
        dispatch(&fx, &job(fx.parent)).await?;

        assert_eq!(fx.worker.process_next().await?, Some(RunnerStatus::Failed));
        let last = results(&fx)?.pop().expect("final result");
        assert_eq!(last.error, "relation does not exist");
        assert!(fx.sink.results_for_job(fx.parent)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn sink_failure_fails_the_runner() -> Result<()> {
        let mut fx =
            fixture(StaticQueryEngine::new().with_output("select buckets", bucket_output())).await?;
        fx.sink.fail_next_writes(1)?;
        dispatch(&fx, &job(fx.parent)).await?;

        assert_eq!(fx.worker.process_next().await?, Some(RunnerStatus::Failed));
        assert!(fx.sink.results_for_job(fx.parent)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn canceled_parent_skips_execution() -> Result<()> {
        let engine = StaticQueryEngine::new().with_output("select buckets", bucket_output());
        let mut fx = fixture(engine.clone()).await?;
        fx.store
            .update_job_status(fx.parent, JobStatusUpdate::to(ComplianceJobStatus::Canceled))
            .await?;
        dispatch(&fx, &job(fx.parent)).await?;

        assert_eq!(fx.worker.process_next().await?, Some(RunnerStatus::Canceled));
        let last = results(&fx)?.pop().expect("final result");
        assert!(last.error.is_empty());
        assert!(engine.requests()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn panicking_engine_still_reports_a_result() -> Result<()> {
        let engine = StaticQueryEngine::new()
            .with_responder("select buckets", |_| panic!("engine exploded"));
        let mut fx = fixture(engine).await?;
        dispatch(&fx, &job(fx.parent)).await?;

        assert_eq!(fx.worker.process_next().await?, Some(RunnerStatus::Failed));
        let last = results(&fx)?.pop().expect("final result");
        assert_eq!(last.error, "runner evaluation panicked: engine exploded");
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_payload_is_acked() -> Result<()> {
        let mut fx = fixture(StaticQueryEngine::new()).await?;
        let topic = FlowConfig::default().topics.job_topic;
        fx.queue.publish(&topic, "garbage", b"not json".to_vec()).await?;

        assert_eq!(fx.worker.process_next().await?, None);
        assert_eq!(fx.queue.pending_count(&fx.worker.consumer().name)?, 0);
        assert!(results(&fx)?.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn final_publish_is_retried() -> Result<()> {
        let mut fx =
            fixture(StaticQueryEngine::new().with_output("select buckets", bucket_output())).await?;
        dispatch(&fx, &job(fx.parent)).await?;
        // First failure hits the in-progress snapshot, second the final result.
        fx.queue
            .inject_publish_failure(InjectedFailure::Unavailable("blip-1".into()))?;
        fx.queue
            .inject_publish_failure(InjectedFailure::Unavailable("blip-2".into()))?;

        assert_eq!(fx.worker.process_next().await?, Some(RunnerStatus::Succeeded));

        let reported = results(&fx)?;
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].status, RunnerStatus::Succeeded);
        assert_eq!(reported[0].total_compliance_result_count, Some(2));
        assert_eq!(fx.queue.pending_count(&fx.worker.consumer().name)?, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_final_publish_is_republished_in_background() -> Result<()> {
        let mut fx =
            fixture(StaticQueryEngine::new().with_output("select buckets", bucket_output())).await?;
        dispatch(&fx, &job(fx.parent)).await?;
        for attempt in 0..=PUBLISH_ATTEMPTS {
            fx.queue
                .inject_publish_failure(InjectedFailure::Unavailable(format!("blip-{attempt}")))?;
        }

        let err = fx.worker.process_next().await.unwrap_err();
        assert!(err.to_string().contains("blip"));
        assert!(results(&fx)?.is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let reported = results(&fx)?;
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].status, RunnerStatus::Succeeded);
        assert_eq!(reported[0].total_compliance_result_count, Some(2));
        assert_eq!(fx.queue.pending_count(&fx.worker.consumer().name)?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_obligation_publishes_failure() -> Result<()> {
        let queue = Arc::new(InMemoryJobQueue::new());
        let config = FlowConfig::default();
        queue.create_stream(&config.stream_config()).await?;

        let snapshot = JobResult::in_progress(job(ComplianceJobId::new(1)), Utc::now());
        let obligation = ResultObligation::new(
            queue.clone(),
            &config.topics.result_topic,
            "compliance-result-7-0",
            &snapshot,
        );
        assert_eq!(obligation.key(), "compliance-result-7-0");
        drop(obligation);
        tokio::task::yield_now().await;

        let published = queue.published(&config.topics.result_topic)?;
        assert_eq!(published.len(), 1);
        let result: JobResult = serde_json::from_slice(&published[0].payload)?;
        assert_eq!(result.status, RunnerStatus::Failed);
        assert_eq!(result.error, ABANDONED_MESSAGE);
        Ok(())
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_drains() -> Result<()> {
        let mut fx = fixture(StaticQueryEngine::new()).await?;
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        fx.worker.run(shutdown).await?;

        dispatch(&fx, &job(fx.parent)).await?;
        assert_eq!(fx.worker.process_next().await?, None);
        Ok(())
    }
}
