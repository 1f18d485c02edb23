//! Runtime configuration for the scheduler, workers, and result consumers.
//!
//! Every setting has a production default and may be overridden through a
//! `VIGIL_FLOW_*` environment variable. Durations are whole seconds.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::queue::{ConsumerConfig, StorageKind, StreamConfig, Topics};
use crate::status::TriggerType;

const ENV_TICK_INTERVAL_SECS: &str = "VIGIL_FLOW_TICK_INTERVAL_SECS";
const ENV_HEARTBEAT_INTERVAL_SECS: &str = "VIGIL_FLOW_HEARTBEAT_INTERVAL_SECS";
const ENV_PROGRESS_INTERVAL_SECS: &str = "VIGIL_FLOW_PROGRESS_INTERVAL_SECS";
const ENV_CANCELLATION_POLL_SECS: &str = "VIGIL_FLOW_CANCELLATION_POLL_SECS";
const ENV_ACK_WAIT_SECS: &str = "VIGIL_FLOW_ACK_WAIT_SECS";
const ENV_INACTIVITY_THRESHOLD_SECS: &str = "VIGIL_FLOW_INACTIVITY_THRESHOLD_SECS";
const ENV_MAX_DELIVER: &str = "VIGIL_FLOW_MAX_DELIVER";
const ENV_PUBLISH_BATCH_SIZE: &str = "VIGIL_FLOW_PUBLISH_BATCH_SIZE";
const ENV_JOB_TIMEOUT_SECS: &str = "VIGIL_FLOW_JOB_TIMEOUT_SECS";
const ENV_RUNNER_TIMEOUT_INTERVAL_SECS: &str = "VIGIL_FLOW_RUNNER_TIMEOUT_INTERVAL_SECS";
const ENV_STREAM_MAX_MESSAGES: &str = "VIGIL_FLOW_STREAM_MAX_MESSAGES";
const ENV_STREAM_RETENTION_SECS: &str = "VIGIL_FLOW_STREAM_RETENTION_SECS";
const ENV_STREAM_NAME: &str = "VIGIL_FLOW_STREAM_NAME";
const ENV_JOB_TOPIC: &str = "VIGIL_FLOW_JOB_TOPIC";
const ENV_RESULT_TOPIC: &str = "VIGIL_FLOW_RESULT_TOPIC";
const ENV_CONSUMER_GROUP: &str = "VIGIL_FLOW_CONSUMER_GROUP";
const ENV_STATUS_ENDPOINT: &str = "VIGIL_FLOW_STATUS_ENDPOINT";

const DEFAULT_TICK_INTERVAL_SECS: u64 = 10;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;
const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 10 * 60;
const DEFAULT_CANCELLATION_POLL_SECS: u64 = 15;
const DEFAULT_ACK_WAIT_SECS: u64 = 60 * 60;
const DEFAULT_INACTIVITY_THRESHOLD_SECS: u64 = 60 * 60;
const DEFAULT_MAX_DELIVER: u64 = 1;
const DEFAULT_PUBLISH_BATCH_SIZE: u64 = 1_000;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const DEFAULT_RUNNER_TIMEOUT_INTERVAL_SECS: u64 = 60 * 60;
const DEFAULT_STREAM_MAX_MESSAGES: u64 = 1_000_000;
const DEFAULT_STREAM_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Kind tag used in message keys for compliance runners.
pub const RUNNER_KIND: &str = "compliance";

/// Pipeline configuration shared by all roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    /// Scheduler, aggregator, and sweeper cadence.
    pub tick_interval: Duration,
    /// How often a worker signals the broker that a message is still being worked.
    pub heartbeat_interval: Duration,
    /// How often a worker republishes an `IN_PROGRESS` snapshot so the state
    /// store sees the runner as alive. Keep it under twice
    /// `runner_timeout_interval`.
    pub progress_interval: Duration,
    /// How often a worker polls the parent job for cancellation.
    pub cancellation_poll_interval: Duration,
    /// Broker ack wait before redelivery.
    pub ack_wait: Duration,
    /// Broker consumer inactivity threshold.
    pub inactivity_threshold: Duration,
    /// Maximum deliveries per message.
    pub max_deliver: u32,
    /// Maximum jobs or runners handled per publisher tick.
    pub publish_batch_size: usize,
    /// Budget for a parent job before the sweeper times it out.
    pub job_timeout: Duration,
    /// Runner interval; runners are timed out after twice this duration.
    pub runner_timeout_interval: Duration,
    /// Stream capacity in messages.
    pub stream_max_messages: u64,
    /// Stream retention.
    pub stream_retention: Duration,
    /// Kind tag used in message keys.
    pub kind: String,
    /// Topic naming.
    pub topics: Topics,
    /// Base URL of the job status endpoint polled for cancellation.
    pub status_endpoint: Option<String>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
            cancellation_poll_interval: Duration::from_secs(DEFAULT_CANCELLATION_POLL_SECS),
            ack_wait: Duration::from_secs(DEFAULT_ACK_WAIT_SECS),
            inactivity_threshold: Duration::from_secs(DEFAULT_INACTIVITY_THRESHOLD_SECS),
            max_deliver: 1,
            publish_batch_size: 1_000,
            job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS),
            runner_timeout_interval: Duration::from_secs(DEFAULT_RUNNER_TIMEOUT_INTERVAL_SECS),
            stream_max_messages: DEFAULT_STREAM_MAX_MESSAGES,
            stream_retention: Duration::from_secs(DEFAULT_STREAM_RETENTION_SECS),
            kind: RUNNER_KIND.to_string(),
            topics: Topics::default(),
            status_endpoint: None,
        }
    }
}

impl FlowConfig {
    /// Loads configuration from process environment with strict validation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a numeric value is not a positive
    /// integer or exceeds the supported range.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a numeric value is not a positive
    /// integer or exceeds the supported range.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs = |key: &str, default: u64| -> Result<Duration> {
            parse_positive_u64_env(&get_env, key, default).map(Duration::from_secs)
        };

        let max_deliver = parse_positive_u64_env(&get_env, ENV_MAX_DELIVER, DEFAULT_MAX_DELIVER)?;
        let max_deliver = u32::try_from(max_deliver).map_err(|_| {
            Error::configuration(format!(
                "{ENV_MAX_DELIVER} value {max_deliver} exceeds supported range"
            ))
        })?;
        let batch =
            parse_positive_u64_env(&get_env, ENV_PUBLISH_BATCH_SIZE, DEFAULT_PUBLISH_BATCH_SIZE)?;
        let publish_batch_size = usize::try_from(batch).map_err(|_| {
            Error::configuration(format!(
                "{ENV_PUBLISH_BATCH_SIZE} value {batch} exceeds supported range"
            ))
        })?;

        let defaults = Topics::default();
        let topics = Topics {
            stream: non_empty_env(&get_env, ENV_STREAM_NAME).unwrap_or(defaults.stream),
            job_topic: non_empty_env(&get_env, ENV_JOB_TOPIC).unwrap_or(defaults.job_topic),
            result_topic: non_empty_env(&get_env, ENV_RESULT_TOPIC)
                .unwrap_or(defaults.result_topic),
            consumer_group: non_empty_env(&get_env, ENV_CONSUMER_GROUP)
                .unwrap_or(defaults.consumer_group),
            manual_suffix: defaults.manual_suffix,
        };

        Ok(Self {
            tick_interval: secs(ENV_TICK_INTERVAL_SECS, DEFAULT_TICK_INTERVAL_SECS)?,
            heartbeat_interval: secs(ENV_HEARTBEAT_INTERVAL_SECS, DEFAULT_HEARTBEAT_INTERVAL_SECS)?,
            progress_interval: secs(ENV_PROGRESS_INTERVAL_SECS, DEFAULT_PROGRESS_INTERVAL_SECS)?,
            cancellation_poll_interval: secs(
                ENV_CANCELLATION_POLL_SECS,
                DEFAULT_CANCELLATION_POLL_SECS,
            )?,
            ack_wait: secs(ENV_ACK_WAIT_SECS, DEFAULT_ACK_WAIT_SECS)?,
            inactivity_threshold: secs(
                ENV_INACTIVITY_THRESHOLD_SECS,
                DEFAULT_INACTIVITY_THRESHOLD_SECS,
            )?,
            max_deliver,
            publish_batch_size,
            job_timeout: secs(ENV_JOB_TIMEOUT_SECS, DEFAULT_JOB_TIMEOUT_SECS)?,
            runner_timeout_interval: secs(
                ENV_RUNNER_TIMEOUT_INTERVAL_SECS,
                DEFAULT_RUNNER_TIMEOUT_INTERVAL_SECS,
            )?,
            stream_max_messages: parse_positive_u64_env(
                &get_env,
                ENV_STREAM_MAX_MESSAGES,
                DEFAULT_STREAM_MAX_MESSAGES,
            )?,
            stream_retention: secs(ENV_STREAM_RETENTION_SECS, DEFAULT_STREAM_RETENTION_SECS)?,
            kind: RUNNER_KIND.to_string(),
            topics,
            status_endpoint: non_empty_env(&get_env, ENV_STATUS_ENDPOINT),
        })
    }

    /// Stream definition provisioned on demand by the publisher.
    #[must_use]
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            name: self.topics.stream.clone(),
            topics: self.topics.all_topics(),
            max_messages: self.stream_max_messages,
            max_age: self.stream_retention,
            replicas: 1,
            storage: StorageKind::File,
        }
    }

    /// Consumer group definition for runner workers.
    #[must_use]
    pub fn job_consumer(&self, trigger: TriggerType) -> ConsumerConfig {
        ConsumerConfig::new(
            self.topics.consumer_name(trigger),
            self.topics.job_topic_for(trigger),
        )
        .with_ack_wait(self.ack_wait)
        .with_max_deliver(self.max_deliver)
        .with_inactivity_threshold(self.inactivity_threshold)
    }

    /// Consumer group definition for the result consumer.
    #[must_use]
    pub fn result_consumer(&self) -> ConsumerConfig {
        ConsumerConfig::new(
            format!("{}-result", self.topics.consumer_group),
            self.topics.result_topic.clone(),
        )
        .with_ack_wait(self.ack_wait)
        .with_max_deliver(self.max_deliver)
        .with_inactivity_threshold(self.inactivity_threshold)
    }

    /// Age after which an in-flight runner is considered lost.
    #[must_use]
    pub fn runner_timeout(&self) -> Duration {
        self.runner_timeout_interval.saturating_mul(2)
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn non_empty_env<F>(get_env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    get_env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
