//! Vigil compliance pipeline in one process with in-memory backends.
//!
//! Runs the scheduler, a scheduled and a manual runner worker, and the
//! result consumer until interrupted.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use vigil_core::observability::{LogFormat, init_logging};
use vigil_flow::aggregator::StatusAggregator;
use vigil_flow::config::FlowConfig;
use vigil_flow::consumer::ResultConsumer;
use vigil_flow::content::{
    ComplianceContent, InMemoryContent, InMemoryParameters, ParameterSource,
};
use vigil_flow::engine::StaticQueryEngine;
use vigil_flow::error::Result;
use vigil_flow::publisher::Publisher;
use vigil_flow::queue::JobQueue;
use vigil_flow::queue::memory::InMemoryJobQueue;
use vigil_flow::registry::IntegrationTypeRegistry;
use vigil_flow::scheduler::SchedulerService;
use vigil_flow::sink::{InMemoryResultSink, InMemorySummaryBuilder};
use vigil_flow::status::TriggerType;
use vigil_flow::status_client::{HttpJobStatusClient, JobStatusClient, StoreJobStatusClient};
use vigil_flow::store::ComplianceStore;
use vigil_flow::store::memory::InMemoryComplianceStore;
use vigil_flow::validation::FrameworkValidator;
use vigil_flow::worker::{RunnerWorker, WorkerServices};

fn status_client(
    config: &FlowConfig,
    store: &Arc<dyn ComplianceStore>,
) -> Result<Arc<dyn JobStatusClient>> {
    match config.status_endpoint.as_deref() {
        Some(url) => {
            tracing::info!(%url, "polling job status over HTTP");
            Ok(Arc::new(HttpJobStatusClient::new(url)?))
        }
        None => Ok(Arc::new(StoreJobStatusClient::new(Arc::clone(store)))),
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                signal.cancel();
            }
            Err(err) => tracing::error!(error = %err, "failed to listen for ctrl-c"),
        }
    });
    shutdown
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogFormat::from_env());
    let config = FlowConfig::from_env()?;

    let store: Arc<dyn ComplianceStore> = Arc::new(InMemoryComplianceStore::new());
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
    let content: Arc<dyn ComplianceContent> = Arc::new(InMemoryContent::new());
    let parameters: Arc<dyn ParameterSource> = Arc::new(InMemoryParameters::new());
    let registry = Arc::new(IntegrationTypeRegistry::new());
    let sink = Arc::new(InMemoryResultSink::new());
    let summaries = Arc::new(InMemorySummaryBuilder::new(Arc::clone(&sink)));

    let validator = FrameworkValidator::new(
        Arc::clone(&content),
        Arc::clone(&registry),
        Arc::clone(&parameters),
    );
    let publisher = Publisher::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&content),
        validator,
    )?;
    let aggregator =
        StatusAggregator::new(config.clone(), Arc::clone(&store), sink.clone(), summaries);
    let mut scheduler = SchedulerService::new(publisher, aggregator, config.tick_interval);

    let services = WorkerServices {
        queue: Arc::clone(&queue),
        content,
        parameters,
        registry,
        engine: Arc::new(StaticQueryEngine::new()),
        sink,
        status_client: status_client(&config, &store)?,
    };
    let mut scheduled = RunnerWorker::new(config.clone(), TriggerType::Scheduled, services.clone());
    let mut manual = RunnerWorker::new(config.clone(), TriggerType::Manual, services);
    let consumer = ResultConsumer::new(config, queue, store);

    let shutdown = shutdown_on_ctrl_c();
    tracing::info!("vigil flow started");
    let (scheduler_done, scheduled_done, manual_done, consumer_done) = tokio::join!(
        scheduler.run(shutdown.clone()),
        scheduled.run(shutdown.clone()),
        manual.run(shutdown.clone()),
        consumer.run(shutdown),
    );
    scheduler_done?;
    scheduled_done?;
    manual_done?;
    consumer_done?;
    tracing::info!("vigil flow stopped");
    Ok(())
}
