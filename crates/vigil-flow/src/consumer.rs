//! Result consumer: folds worker results into the runner state store.
//!
//! Results arrive in any order and may be redelivered. Each one is applied
//! as a guarded row update, so a late `IN_PROGRESS` snapshot never
//! overwrites a terminal status and a repeated result is a no-op.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::FlowConfig;
use crate::error::Result;
use crate::model::JobResult;
use crate::queue::{ConsumerConfig, Delivery, JobQueue};
use crate::status::RunnerStatus;
use crate::store::{ComplianceStore, RunnerResultUpdate, UpdateResult};

const IDLE_BACKOFF: Duration = Duration::from_millis(500);

/// Attempts made to write one result to the store.
const APPLY_ATTEMPTS: u32 = 5;

/// Delay before the first store retry; doubles per attempt.
const APPLY_RETRY_DELAY: Duration = Duration::from_millis(200);

impl From<&JobResult> for RunnerResultUpdate {
    fn from(result: &JobResult) -> Self {
        Self {
            runner_id: result.job.id,
            retry_count: result.job.retry_count,
            status: result.status,
            started_at: Some(result.started_at),
            failure_message: result.error.clone(),
            total_finding_count: result.total_compliance_result_count,
            worker_identity: result.worker_identity.clone(),
        }
    }
}

/// Applies runner results from the result topic.
pub struct ResultConsumer {
    config: FlowConfig,
    consumer: ConsumerConfig,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ComplianceStore>,
}

impl std::fmt::Debug for ResultConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultConsumer")
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl ResultConsumer {
    /// Creates a consumer for the configured result topic.
    #[must_use]
    pub fn new(
        config: FlowConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ComplianceStore>,
    ) -> Self {
        let consumer = config.result_consumer();
        Self {
            config,
            consumer,
            queue,
            store,
        }
    }

    /// Provisions the stream and the result consumer.
    ///
    /// # Errors
    ///
    /// Returns the broker error if provisioning fails.
    pub async fn ensure_consumer(&self) -> Result<()> {
        let stream = self.config.stream_config();
        self.queue.create_stream(&stream).await?;
        self.queue.create_consumer(&stream.name, &self.consumer).await
    }

    /// Pulls and applies one result.
    ///
    /// Returns `None` when nothing was delivered or the payload could not be
    /// decoded. Store failures are retried with backoff while the delivery is
    /// held; once the attempts are exhausted the delivery is left
    /// unacknowledged and the runner is eventually swept to `TIMEOUT`.
    ///
    /// # Errors
    ///
    /// Returns an error if pulling, applying, or acking fails.
    pub async fn process_next(&self) -> Result<Option<UpdateResult>> {
        let Some(delivery) = self.queue.pull(&self.consumer.name).await? else {
            return Ok(None);
        };
        self.handle_delivery(&delivery).await
    }

    /// Applies every result currently available. Returns how many were handled.
    ///
    /// # Errors
    ///
    /// Stops at the first failing delivery.
    pub async fn drain_available(&self) -> Result<usize> {
        let mut handled = 0;
        while let Some(delivery) = self.queue.pull(&self.consumer.name).await? {
            self.handle_delivery(&delivery).await?;
            handled += 1;
        }
        Ok(handled)
    }

    async fn handle_delivery(&self, delivery: &Delivery) -> Result<Option<UpdateResult>> {
        let result: JobResult = match serde_json::from_slice(&delivery.payload) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(key = %delivery.key, error = %err, "dropping undecodable runner result");
                self.queue
                    .ack(&self.consumer.name, &delivery.delivery_id)
                    .await?;
                return Ok(None);
            }
        };

        let outcome = self.apply_with_retry(&result).await?;
        match &outcome {
            UpdateResult::Applied => {
                tracing::debug!(
                    runner_id = %result.job.id,
                    status = result.status.as_label(),
                    "runner result applied"
                );
            }
            UpdateResult::Unchanged => {}
            UpdateResult::NotFound => {
                tracing::warn!(runner_id = %result.job.id, "result for unknown runner");
            }
            UpdateResult::InvalidTransition { from, to } => {
                // Late snapshots behind a terminal result land here.
                if result.status != RunnerStatus::InProgress {
                    tracing::warn!(runner_id = %result.job.id, %from, %to, "runner result ignored");
                }
            }
            UpdateResult::Stale { current_retry } => {
                tracing::debug!(
                    runner_id = %result.job.id,
                    retry_count = result.job.retry_count,
                    current_retry,
                    "stale runner result ignored"
                );
            }
        }

        self.queue
            .ack(&self.consumer.name, &delivery.delivery_id)
            .await?;
        Ok(Some(outcome))
    }

    async fn apply_with_retry(&self, result: &JobResult) -> Result<UpdateResult> {
        let update = RunnerResultUpdate::from(result);
        let mut delay = APPLY_RETRY_DELAY;
        let mut attempt = 1;
        loop {
            match self.store.apply_runner_result(update.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if attempt < APPLY_ATTEMPTS => {
                    tracing::warn!(
                        runner_id = %result.job.id,
                        attempt,
                        error = %err,
                        "runner result write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Applies results until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if provisioning or draining the consumer fails.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.ensure_consumer().await?;
        tracing::info!(consumer = %self.consumer.name, "result consumer started");

        while !shutdown.is_cancelled() {
            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => {
                    tracing::error!(error = %err, "runner result failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(IDLE_BACKOFF) => {}
                }
            }
        }

        self.queue.drain(&self.consumer.name).await?;
        tracing::info!("result consumer stopped");
        Ok(())
    }
}
