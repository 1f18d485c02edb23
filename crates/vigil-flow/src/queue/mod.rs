//! Job queue transport abstraction.
//!
//! This module provides:
//!
//! - [`JobQueue`]: durable, ordered, at-least-once broker interface
//! - [`StreamConfig`] and [`ConsumerConfig`]: stream and consumer-group policy
//! - [`Delivery`]: a message handed to a consumer, acknowledged explicitly
//! - [`Topics`] and [`message_key`]: topic naming and deterministic dedupe keys
//! - [`memory::InMemoryJobQueue`]: in-process broker for tests and development
//!
//! Publishing with a key the broker has already seen is a no-op that reports
//! the original sequence number, so re-publishing after a crash is safe.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::status::TriggerType;

/// Storage backing a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    /// Persisted to disk.
    #[default]
    File,
    /// Held in memory.
    Memory,
}

/// Stream definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Topics (subjects) captured by the stream.
    pub topics: Vec<String>,
    /// Capacity in messages.
    pub max_messages: u64,
    /// Retention.
    pub max_age: Duration,
    /// Replica count.
    pub replicas: u32,
    /// Storage kind.
    pub storage: StorageKind,
}

/// Consumer-group definition. Delivery always starts from the first retained
/// message and every delivery must be acknowledged explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Durable consumer name.
    pub name: String,
    /// Topic the consumer reads.
    pub topic: String,
    /// Time a delivery may stay unacknowledged before redelivery.
    pub ack_wait: Duration,
    /// Maximum deliveries per message.
    pub max_deliver: u32,
    /// Idle time after which the broker may reclaim the consumer.
    pub inactivity_threshold: Duration,
}

impl ConsumerConfig {
    /// Creates a consumer with one-hour ack wait and a single delivery.
    #[must_use]
    pub fn new(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            ack_wait: Duration::from_secs(60 * 60),
            max_deliver: 1,
            inactivity_threshold: Duration::from_secs(60 * 60),
        }
    }

    /// Sets the ack wait.
    #[must_use]
    pub const fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Sets the maximum number of deliveries.
    #[must_use]
    pub const fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    /// Sets the inactivity threshold.
    #[must_use]
    pub const fn with_inactivity_threshold(mut self, threshold: Duration) -> Self {
        self.inactivity_threshold = threshold;
        self
    }
}

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishResult {
    /// Appended to the stream.
    Published {
        /// Stream sequence number.
        sequence: u64,
    },
    /// A message with the same key was already in the stream.
    Deduplicated {
        /// Sequence number of the original message.
        sequence: u64,
    },
}

impl PublishResult {
    /// Returns the stream sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        match self {
            Self::Published { sequence } | Self::Deduplicated { sequence } => *sequence,
        }
    }

    /// Returns a metrics label for the outcome.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Published { .. } => "published",
            Self::Deduplicated { .. } => "deduplicated",
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Handle used to ack or extend the delivery.
    pub delivery_id: String,
    /// Stream sequence number.
    pub sequence: u64,
    /// Topic the message was published to.
    pub topic: String,
    /// Dedupe key supplied by the publisher.
    pub key: String,
    /// Raw payload.
    pub payload: Vec<u8>,
    /// How many times this message has been delivered, starting at 1.
    pub delivery_count: u32,
}

/// Durable work queue.
///
/// Implementations are `Send + Sync` and shared between the publisher,
/// workers, and result consumers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Creates the stream, or leaves an existing stream with the same name untouched.
    async fn create_stream(&self, config: &StreamConfig) -> Result<()>;

    /// Creates a durable consumer on a stream. Re-creating an existing
    /// consumer keeps its position.
    ///
    /// Fails with [`crate::error::Error::StreamNotFound`] if the stream does
    /// not exist.
    async fn create_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<()>;

    /// Publishes a payload under a dedupe key.
    ///
    /// Fails with [`crate::error::Error::StreamNotFound`] if no stream
    /// captures the topic.
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<PublishResult>;

    /// Pulls the next delivery for a consumer, if any.
    async fn pull(&self, consumer: &str) -> Result<Option<Delivery>>;

    /// Acknowledges a delivery; it will not be redelivered.
    async fn ack(&self, consumer: &str, delivery_id: &str) -> Result<()>;

    /// Signals that a delivery is still being worked, resetting its ack deadline.
    async fn in_progress(&self, consumer: &str, delivery_id: &str) -> Result<()>;

    /// Stops handing out new deliveries to a consumer. Outstanding
    /// deliveries may still be acknowledged.
    async fn drain(&self, consumer: &str) -> Result<()>;
}

/// Topic and consumer naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Stream capturing every pipeline topic.
    pub stream: String,
    /// Topic carrying scheduled runner jobs.
    pub job_topic: String,
    /// Topic carrying runner results.
    pub result_topic: String,
    /// Base consumer-group name.
    pub consumer_group: String,
    /// Suffix appended for manual-trigger routing.
    pub manual_suffix: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            stream: "compliance-runner".to_string(),
            job_topic: "compliance-runner-job-queue".to_string(),
            result_topic: "compliance-runner-job-result".to_string(),
            consumer_group: "compliance-runner-service".to_string(),
            manual_suffix: "-manual".to_string(),
        }
    }
}

impl Topics {
    /// Job topic for a trigger type.
    #[must_use]
    pub fn job_topic_for(&self, trigger: TriggerType) -> String {
        match trigger {
            TriggerType::Scheduled => self.job_topic.clone(),
            TriggerType::Manual => format!("{}{}", self.job_topic, self.manual_suffix),
        }
    }

    /// Consumer-group name for a trigger type.
    #[must_use]
    pub fn consumer_name(&self, trigger: TriggerType) -> String {
        match trigger {
            TriggerType::Scheduled => self.consumer_group.clone(),
            TriggerType::Manual => format!("{}{}", self.consumer_group, self.manual_suffix),
        }
    }

    /// Every topic the stream must capture.
    #[must_use]
    pub fn all_topics(&self) -> Vec<String> {
        vec![
            self.job_topic_for(TriggerType::Scheduled),
            self.job_topic_for(TriggerType::Manual),
            self.result_topic.clone(),
        ]
    }
}

/// Deterministic dedupe keys.
pub mod message_key {
    use vigil_core::RunnerId;

    /// Key for a runner job message.
    #[must_use]
    pub fn runner(kind: &str, id: RunnerId, retry_count: u32) -> String {
        format!("{kind}-runner-{id}-{retry_count}")
    }

    /// Key for a runner's final result message.
    #[must_use]
    pub fn result(kind: &str, id: RunnerId, retry_count: u32) -> String {
        format!("{kind}-result-{id}-{retry_count}")
    }

    /// Key for an in-progress snapshot. Beat 0 is published when a worker
    /// starts a runner; later beats are periodic liveness reports.
    #[must_use]
    pub fn progress(kind: &str, id: RunnerId, retry_count: u32, beat: u64) -> String {
        format!("{kind}-progress-{id}-{retry_count}-{beat}")
    }
}
