//! In-memory job queue implementation for testing.
//!
//! [`InMemoryJobQueue`] mimics a persistent stream broker inside one process:
//! streams capture topics, publishes are deduplicated by key, consumers track
//! their own position, and unacknowledged deliveries are handed out again
//! once their ack wait expires, up to the consumer's delivery limit.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no persistence, no distribution
//! - **No retention**: capacity and age limits are recorded but not enforced
//! - Deadlines follow `tokio::time`, so paused test clocks drive redelivery

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tokio::time::Instant;
use ulid::Ulid;

use super::{ConsumerConfig, Delivery, JobQueue, PublishResult, StreamConfig};
use crate::error::{Error, Result};

/// A failure the next publish should report instead of succeeding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Report that no stream captures the topic.
    StreamNotFound,
    /// Report a generic broker failure with this message.
    Unavailable(String),
}

/// A message stored in a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Stream sequence number.
    pub sequence: u64,
    /// Topic the message was published to.
    pub topic: String,
    /// Dedupe key.
    pub key: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct StreamState {
    config: StreamConfig,
    messages: Vec<StoredMessage>,
    seen_keys: HashMap<String, u64>,
}

#[derive(Debug)]
struct PendingDelivery {
    sequence: u64,
    deadline: Instant,
    delivery_count: u32,
}

#[derive(Debug)]
struct ConsumerState {
    stream: String,
    config: ConsumerConfig,
    /// Index into the stream's messages of the next candidate.
    cursor: usize,
    pending: HashMap<String, PendingDelivery>,
    draining: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    streams: HashMap<String, StreamState>,
    consumers: HashMap<String, ConsumerState>,
    injected: VecDeque<InjectedFailure>,
    stream_creations: usize,
}

impl BrokerState {
    fn stream_for_topic(&self, topic: &str) -> Option<&str> {
        self.streams
            .iter()
            .find(|(_, stream)| stream.config.topics.iter().any(|t| t == topic))
            .map(|(name, _)| name.as_str())
    }
}

/// In-memory stream broker.
///
/// ```rust
/// use vigil_flow::queue::memory::InMemoryJobQueue;
///
/// let queue = InMemoryJobQueue::new();
/// assert_eq!(queue.stream_creations().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: RwLock<BrokerState>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::queue("job queue lock poisoned")
}

impl InMemoryJobQueue {
    /// Creates an empty broker with no streams.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next publish fail with `failure`. Failures queue up in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn inject_publish_failure(&self, failure: InjectedFailure) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.injected.push_back(failure);
        Ok(())
    }

    /// Returns every message published to `topic`, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn published(&self, topic: &str) -> Result<Vec<StoredMessage>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut messages: Vec<_> = state
            .streams
            .values()
            .flat_map(|stream| stream.messages.iter())
            .filter(|message| message.topic == topic)
            .cloned()
            .collect();
        messages.sort_by_key(|message| message.sequence);
        Ok(messages)
    }

    /// Number of unacknowledged deliveries held by a consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or the consumer is unknown.
    pub fn pending_count(&self, consumer: &str) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        state
            .consumers
            .get(consumer)
            .map(|c| c.pending.len())
            .ok_or_else(|| Error::queue(format!("consumer not found: {consumer}")))
    }

    /// Returns true if a stream with this name exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn has_stream(&self, name: &str) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.streams.contains_key(name))
    }

    /// Number of streams actually created (idempotent calls excluded).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn stream_creations(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.stream_creations)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn create_stream(&self, config: &StreamConfig) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.streams.contains_key(&config.name) {
            return Ok(());
        }
        state.streams.insert(
            config.name.clone(),
            StreamState {
                config: config.clone(),
                messages: Vec::new(),
                seen_keys: HashMap::new(),
            },
        );
        state.stream_creations += 1;
        drop(state);
        tracing::info!(stream = %config.name, topics = ?config.topics, "stream created");
        Ok(())
    }

    async fn create_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if !state.streams.contains_key(stream) {
            return Err(Error::StreamNotFound {
                stream: stream.to_string(),
            });
        }
        if let Some(existing) = state.consumers.get_mut(&config.name) {
            existing.config = config.clone();
            return Ok(());
        }
        state.consumers.insert(
            config.name.clone(),
            ConsumerState {
                stream: stream.to_string(),
                config: config.clone(),
                cursor: 0,
                pending: HashMap::new(),
                draining: false,
            },
        );
        Ok(())
    }

    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<PublishResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(failure) = state.injected.pop_front() {
            return Err(match failure {
                InjectedFailure::StreamNotFound => Error::StreamNotFound {
                    stream: topic.to_string(),
                },
                InjectedFailure::Unavailable(message) => Error::queue(message),
            });
        }

        let Some(name) = state.stream_for_topic(topic).map(str::to_string) else {
            return Err(Error::StreamNotFound {
                stream: topic.to_string(),
            });
        };
        let stream = state
            .streams
            .get_mut(&name)
            .ok_or_else(|| Error::StreamNotFound {
                stream: topic.to_string(),
            })?;

        if let Some(&sequence) = stream.seen_keys.get(key) {
            return Ok(PublishResult::Deduplicated { sequence });
        }

        let sequence = stream.messages.len() as u64 + 1;
        stream.seen_keys.insert(key.to_string(), sequence);
        stream.messages.push(StoredMessage {
            sequence,
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        });
        drop(state);

        Ok(PublishResult::Published { sequence })
    }

    async fn pull(&self, consumer: &str) -> Result<Option<Delivery>> {
        let mut guard = self.state.write().map_err(poison_err)?;
        let state = &mut *guard;
        let consumer_state = state
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| Error::queue(format!("consumer not found: {consumer}")))?;
        if consumer_state.draining {
            return Ok(None);
        }
        let stream = state
            .streams
            .get(&consumer_state.stream)
            .ok_or_else(|| Error::StreamNotFound {
                stream: consumer_state.stream.clone(),
            })?;

        let now = Instant::now();
        let ack_wait = consumer_state.config.ack_wait;
        let max_deliver = consumer_state.config.max_deliver;

        let mut expired: Vec<(String, u64, u32)> = consumer_state
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, pending)| (id.clone(), pending.sequence, pending.delivery_count))
            .collect();
        expired.sort_by_key(|(_, sequence, _)| *sequence);

        let mut redeliver = None;
        for (delivery_id, sequence, delivery_count) in expired {
            consumer_state.pending.remove(&delivery_id);
            if delivery_count >= max_deliver {
                tracing::debug!(consumer, sequence, "delivery limit reached, message dropped");
            } else if redeliver.is_none() {
                redeliver = Some((sequence, delivery_count + 1));
            } else {
                // Put it back untouched; it is handed out on a later pull.
                consumer_state.pending.insert(
                    delivery_id,
                    PendingDelivery {
                        sequence,
                        deadline: now,
                        delivery_count,
                    },
                );
            }
        }

        let next = match redeliver {
            Some((sequence, delivery_count)) => stream
                .messages
                .iter()
                .find(|message| message.sequence == sequence)
                .map(|message| (message, delivery_count)),
            None => {
                let topic = &consumer_state.config.topic;
                let found = stream.messages[consumer_state.cursor..]
                    .iter()
                    .position(|message| &message.topic == topic);
                match found {
                    Some(offset) => {
                        let index = consumer_state.cursor + offset;
                        consumer_state.cursor = index + 1;
                        Some((&stream.messages[index], 1))
                    }
                    None => {
                        consumer_state.cursor = stream.messages.len();
                        None
                    }
                }
            }
        };

        let Some((message, delivery_count)) = next else {
            return Ok(None);
        };

        let delivery_id = Ulid::new().to_string();
        consumer_state.pending.insert(
            delivery_id.clone(),
            PendingDelivery {
                sequence: message.sequence,
                deadline: now + ack_wait,
                delivery_count,
            },
        );

        Ok(Some(Delivery {
            delivery_id,
            sequence: message.sequence,
            topic: message.topic.clone(),
            key: message.key.clone(),
            payload: message.payload.clone(),
            delivery_count,
        }))
    }

    async fn ack(&self, consumer: &str, delivery_id: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let consumer_state = state
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| Error::queue(format!("consumer not found: {consumer}")))?;
        // Acking an expired or unknown delivery is a no-op.
        consumer_state.pending.remove(delivery_id);
        Ok(())
    }

    async fn in_progress(&self, consumer: &str, delivery_id: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let consumer_state = state
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| Error::queue(format!("consumer not found: {consumer}")))?;
        let ack_wait = consumer_state.config.ack_wait;
        let pending = consumer_state
            .pending
            .get_mut(delivery_id)
            .ok_or_else(|| Error::queue(format!("delivery not pending: {delivery_id}")))?;
        pending.deadline = Instant::now() + ack_wait;
        Ok(())
    }

    async fn drain(&self, consumer: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let consumer_state = state
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| Error::queue(format!("consumer not found: {consumer}")))?;
        consumer_state.draining = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{StorageKind, Topics};
    use std::time::Duration;

    fn stream_config() -> StreamConfig {
        let topics = Topics::default();
        StreamConfig {
            name: topics.stream.clone(),
            topics: topics.all_topics(),
            max_messages: 1_000,
            max_age: Duration::from_secs(60),
            replicas: 1,
            storage: StorageKind::Memory,
        }
    }

    async fn queue_with_consumer(ack_wait: Duration, max_deliver: u32) -> Result<InMemoryJobQueue> {
        let queue = InMemoryJobQueue::new();
        let topics = Topics::default();
        queue.create_stream(&stream_config()).await?;
        let consumer = ConsumerConfig::new("workers", topics.job_topic.clone())
            .with_ack_wait(ack_wait)
            .with_max_deliver(max_deliver);
        queue.create_consumer(&topics.stream, &consumer).await?;
        Ok(queue)
    }

    #[tokio::test]
    async fn publish_without_stream_reports_stream_not_found() {
        let queue = InMemoryJobQueue::new();
        let err = queue
            .publish("compliance-runner-job-queue", "k", b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_stream_not_found());
    }

    #[tokio::test]
    async fn duplicate_keys_are_deduplicated() -> Result<()> {
        let queue = queue_with_consumer(Duration::from_secs(60), 1).await?;
        let topic = Topics::default().job_topic;

        let first = queue.publish(&topic, "runner-1-0", b"a".to_vec()).await?;
        let second = queue.publish(&topic, "runner-1-0", b"a".to_vec()).await?;
        assert_eq!(first, PublishResult::Published { sequence: 1 });
        assert_eq!(second, PublishResult::Deduplicated { sequence: 1 });
        assert_eq!(queue.published(&topic)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn consumer_only_sees_its_topic() -> Result<()> {
        let queue = queue_with_consumer(Duration::from_secs(60), 1).await?;
        let topics = Topics::default();
        queue.publish(&topics.result_topic, "r", b"r".to_vec()).await?;
        queue.publish(&topics.job_topic, "j", b"j".to_vec()).await?;

        let delivery = queue.pull("workers").await?.expect("job delivery");
        assert_eq!(delivery.key, "j");
        assert_eq!(delivery.delivery_count, 1);
        assert!(queue.pull("workers").await?.is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_delivery_is_redelivered_after_ack_wait() -> Result<()> {
        let queue = queue_with_consumer(Duration::from_secs(30), 2).await?;
        let topic = Topics::default().job_topic;
        queue.publish(&topic, "k", b"x".to_vec()).await?;

        let first = queue.pull("workers").await?.expect("first delivery");
        assert!(queue.pull("workers").await?.is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.pull("workers").await?.expect("redelivery");
        assert_eq!(second.sequence, first.sequence);
        assert_eq!(second.delivery_count, 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(queue.pull("workers").await?.is_none());
        assert_eq!(queue.pending_count("workers")?, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_extends_ack_deadline() -> Result<()> {
        let queue = queue_with_consumer(Duration::from_secs(30), 2).await?;
        let topic = Topics::default().job_topic;
        queue.publish(&topic, "k", b"x".to_vec()).await?;
        let delivery = queue.pull("workers").await?.expect("delivery");

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(20)).await;
            queue.in_progress("workers", &delivery.delivery_id).await?;
            assert!(queue.pull("workers").await?.is_none());
        }

        queue.ack("workers", &delivery.delivery_id).await?;
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(queue.pull("workers").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn drained_consumer_stops_delivering() -> Result<()> {
        let queue = queue_with_consumer(Duration::from_secs(60), 1).await?;
        let topic = Topics::default().job_topic;
        queue.publish(&topic, "k", b"x".to_vec()).await?;
        queue.drain("workers").await?;
        assert!(queue.pull("workers").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() -> Result<()> {
        let queue = queue_with_consumer(Duration::from_secs(60), 1).await?;
        let topic = Topics::default().job_topic;
        queue.inject_publish_failure(InjectedFailure::StreamNotFound)?;
        queue.inject_publish_failure(InjectedFailure::Unavailable("broker down".into()))?;

        assert!(queue.publish(&topic, "k", vec![]).await.unwrap_err().is_stream_not_found());
        let err = queue.publish(&topic, "k", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("broker down"));
        assert!(queue.publish(&topic, "k", vec![]).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn create_stream_is_idempotent() -> Result<()> {
        let queue = InMemoryJobQueue::new();
        queue.create_stream(&stream_config()).await?;
        queue.create_stream(&stream_config()).await?;
        assert_eq!(queue.stream_creations()?, 1);
        Ok(())
    }
}
