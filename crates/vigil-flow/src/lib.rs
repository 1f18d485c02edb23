//! # vigil-flow
//!
//! Compliance job scheduling and execution for the Vigil platform.
//!
//! This crate implements the compliance pipeline end to end:
//!
//! - **Publishing**: Expands compliance jobs into one runner per control and
//!   integration and publishes each runner to a durable job queue
//! - **Execution**: Workers evaluate runners with a heartbeat and cooperative
//!   cancellation, and always report a final result
//! - **Reconciliation**: Results are folded back into the state store and
//!   parent jobs advance through the sink and summarizer phases
//! - **Timeouts**: Work that stops reporting is swept to `TIMEOUT`
//!
//! ## Core Concepts
//!
//! - **Compliance job**: One request to evaluate frameworks against integrations
//! - **Runner**: One control evaluated against one integration
//! - **Caller**: A benchmark path through which a framework reaches a control
//! - **Summarizer**: Per-framework rollup built once findings are flushed
//!
//! ## Guarantees
//!
//! - **At-least-once dispatch**: Runners are republished until queued, and
//!   the broker deduplicates by deterministic key
//! - **Idempotent state**: Every status update is a guarded, row-scoped transition
//! - **Always reported**: A started runner publishes exactly one final result
//!
//! ## Example
//!
//! ```rust
//! use vigil_core::RunnerId;
//! use vigil_flow::config::FlowConfig;
//! use vigil_flow::queue::message_key;
//! use vigil_flow::status::TriggerType;
//!
//! let config = FlowConfig::default();
//! assert_eq!(
//!     config.topics.job_topic_for(TriggerType::Manual),
//!     "compliance-runner-job-queue-manual"
//! );
//! assert_eq!(
//!     message_key::runner(&config.kind, RunnerId::new(12), 0),
//!     "compliance-runner-12-0"
//! );
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod aggregator;
pub mod config;
pub mod consumer;
pub mod content;
pub mod engine;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod model;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod status;
pub mod status_client;
pub mod store;
pub mod sweeper;
pub mod validation;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::aggregator::StatusAggregator;
    pub use crate::config::FlowConfig;
    pub use crate::consumer::ResultConsumer;
    pub use crate::content::{ComplianceContent, ParameterSource};
    pub use crate::engine::{QueryEngine, QueryOutput, QueryRequest};
    pub use crate::error::{Error, Result};
    pub use crate::metrics::FlowMetrics;
    pub use crate::model::{ComplianceJob, ComplianceRunner, Job, JobResult};
    pub use crate::publisher::Publisher;
    pub use crate::queue::{JobQueue, PublishResult};
    pub use crate::registry::{IntegrationTypeProvider, IntegrationTypeRegistry};
    pub use crate::scheduler::SchedulerService;
    pub use crate::sink::{ResultSink, SummaryBuilder};
    pub use crate::status::{ComplianceJobStatus, RunnerStatus, RunnersStatus, TriggerType};
    pub use crate::status_client::JobStatusClient;
    pub use crate::store::{ComplianceStore, UpdateResult};
    pub use crate::sweeper::TimeoutSweeper;
    pub use crate::validation::FrameworkValidator;
    pub use crate::worker::{ResultObligation, RunnerWorker, WorkerServices};
}
