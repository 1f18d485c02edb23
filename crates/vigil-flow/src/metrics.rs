//! Observability metrics for the compliance pipeline.
//!
//! Metrics are recorded through the `metrics` crate facade; the embedding
//! process installs whichever recorder it exports with.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `vigil_flow_publishes_total` | Counter | `kind`, `result` | Publish outcomes |
//! | `vigil_flow_stream_provisions_total` | Counter | `result` | On-demand stream provisioning |
//! | `vigil_flow_runner_results_total` | Counter | `status` | Terminal results reported by workers |
//! | `vigil_flow_runner_duration_seconds` | Histogram | `status` | Runner evaluation time |
//! | `vigil_flow_heartbeats_total` | Counter | `result` | Broker in-progress signals |
//! | `vigil_flow_cancellations_total` | Counter | - | Cancellations observed by workers |
//! | `vigil_flow_timeouts_total` | Counter | `kind` | Entities timed out by the sweeper |
//! | `vigil_flow_job_transitions_total` | Counter | `from_state`, `to_state` | Parent job transitions |
//! | `vigil_flow_tick_duration_seconds` | Histogram | `loop` | Tick processing time |
//!
//! ```rust,no_run
//! use vigil_flow::metrics::FlowMetrics;
//!
//! let metrics = FlowMetrics::new();
//! metrics.record_publish("runner", "published");
//! let _guard = metrics.time_tick("publisher");
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: publish outcomes.
    pub const PUBLISHES_TOTAL: &str = "vigil_flow_publishes_total";
    /// Counter: on-demand stream provisioning attempts.
    pub const STREAM_PROVISIONS_TOTAL: &str = "vigil_flow_stream_provisions_total";
    /// Counter: terminal runner results reported by workers.
    pub const RUNNER_RESULTS_TOTAL: &str = "vigil_flow_runner_results_total";
    /// Histogram: runner evaluation time in seconds.
    pub const RUNNER_DURATION_SECONDS: &str = "vigil_flow_runner_duration_seconds";
    /// Counter: heartbeats sent to the broker.
    pub const HEARTBEATS_TOTAL: &str = "vigil_flow_heartbeats_total";
    /// Counter: cancellations observed by workers.
    pub const CANCELLATIONS_TOTAL: &str = "vigil_flow_cancellations_total";
    /// Counter: entities timed out by the sweeper.
    pub const TIMEOUTS_TOTAL: &str = "vigil_flow_timeouts_total";
    /// Counter: parent job transitions.
    pub const JOB_TRANSITIONS_TOTAL: &str = "vigil_flow_job_transitions_total";
    /// Histogram: tick processing time in seconds.
    pub const TICK_DURATION_SECONDS: &str = "vigil_flow_tick_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Message kind (job, runner, result).
    pub const KIND: &str = "kind";
    /// Outcome (published, deduplicated, failed, ...).
    pub const RESULT: &str = "result";
    /// Runner status.
    pub const STATUS: &str = "status";
    /// Previous job state.
    pub const FROM_STATE: &str = "from_state";
    /// Target job state.
    pub const TO_STATE: &str = "to_state";
    /// Scheduler loop name.
    pub const LOOP: &str = "loop";
}

/// High-level interface for recording pipeline metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a publish outcome.
    pub fn record_publish(&self, kind: &str, result: &str) {
        counter!(
            names::PUBLISHES_TOTAL,
            labels::KIND => kind.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records an on-demand stream provisioning attempt.
    pub fn record_stream_provision(&self, result: &str) {
        counter!(
            names::STREAM_PROVISIONS_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a terminal runner result and its evaluation time.
    pub fn record_runner_result(&self, status: &str, duration: Duration) {
        counter!(
            names::RUNNER_RESULTS_TOTAL,
            labels::STATUS => status.to_string(),
        )
        .increment(1);
        histogram!(
            names::RUNNER_DURATION_SECONDS,
            labels::STATUS => status.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a heartbeat attempt.
    pub fn record_heartbeat(&self, result: &str) {
        counter!(
            names::HEARTBEATS_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a cancellation observed by a worker.
    pub fn record_cancellation(&self) {
        counter!(names::CANCELLATIONS_TOTAL).increment(1);
    }

    /// Records entities timed out by the sweeper.
    pub fn record_timeouts(&self, kind: &str, count: usize) {
        counter!(
            names::TIMEOUTS_TOTAL,
            labels::KIND => kind.to_string(),
        )
        .increment(count as u64);
    }

    /// Records a parent job transition.
    pub fn record_job_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::JOB_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Starts timing a tick of the named loop. The duration is recorded when
    /// the guard is dropped.
    #[must_use]
    pub fn time_tick(&self, loop_name: &'static str) -> TimingGuard<impl FnOnce(Duration) + use<>> {
        TimingGuard::new(move |duration| {
            histogram!(
                names::TICK_DURATION_SECONDS,
                labels::LOOP => loop_name,
            )
            .record(duration.as_secs_f64());
        })
    }
}

/// RAII guard that records elapsed time on drop.
pub struct TimingGuard<F: FnOnce(Duration)> {
    start: Instant,
    on_drop: Option<F>,
}

impl<F: FnOnce(Duration)> TimingGuard<F> {
    /// Creates a guard that calls `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F: FnOnce(Duration)> Drop for TimingGuard<F> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn recording_without_recorder_is_noop() {
        let metrics = FlowMetrics::new();
        metrics.record_publish("runner", "published");
        metrics.record_stream_provision("created");
        metrics.record_runner_result("succeeded", Duration::from_millis(5));
        metrics.record_heartbeat("ok");
        metrics.record_cancellation();
        metrics.record_timeouts("runner", 2);
        metrics.record_job_transition("created", "runners_in_progress");
        drop(metrics.time_tick("publisher"));
    }

    #[test]
    fn tick_guard_outlives_the_metrics_handle() {
        let guard = {
            let metrics = FlowMetrics::new();
            metrics.time_tick("aggregator")
        };
        assert!(guard.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn timing_guard_fires_once_on_drop() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        {
            let guard = TimingGuard::new(move |_| flag.store(true, Ordering::SeqCst));
            assert!(guard.elapsed() < Duration::from_secs(60));
        }
        assert!(fired.load(Ordering::SeqCst));
    }
}
