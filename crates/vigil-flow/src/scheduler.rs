//! Scheduler service: drives the publisher and aggregator on one interval.

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{AggregatorTickReport, StatusAggregator};
use crate::error::Result;
use crate::publisher::{Publisher, PublisherTickReport};

/// Reports from one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerTickReport {
    /// Publisher pass, if it completed.
    pub publisher: Option<PublisherTickReport>,
    /// Aggregator pass, if it completed.
    pub aggregator: Option<AggregatorTickReport>,
}

/// Runs publisher and aggregator ticks until shut down.
#[derive(Debug)]
pub struct SchedulerService {
    publisher: Publisher,
    aggregator: StatusAggregator,
    interval: std::time::Duration,
}

impl SchedulerService {
    /// Creates a service ticking every `interval`.
    #[must_use]
    pub fn new(
        publisher: Publisher,
        aggregator: StatusAggregator,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            publisher,
            aggregator,
            interval,
        }
    }

    /// Runs one publisher pass followed by one aggregator pass.
    ///
    /// A failing pass is logged and does not prevent the other from running.
    pub async fn tick(&mut self) -> SchedulerTickReport {
        let publisher = match self.publisher.run_publisher_tick().await {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::error!(error = %err, "publisher tick failed");
                None
            }
        };
        let aggregator = match self.aggregator.run_aggregator_tick().await {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::error!(error = %err, "aggregator tick failed");
                None
            }
        };
        SchedulerTickReport {
            publisher,
            aggregator,
        }
    }

    /// Ticks immediately, then every interval, until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Currently never fails; tick errors are logged.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        tracing::info!("scheduler stopped");
        Ok(())
    }
}
