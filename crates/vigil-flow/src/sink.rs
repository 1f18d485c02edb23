//! Result sink and summary capabilities.
//!
//! Workers write a runner's findings to the [`ResultSink`] in one call before
//! reporting success; a failed write leaves nothing behind for that runner.
//! The aggregator waits for [`ResultSink::is_flushed`] before creating
//! summarizers, which hand each benchmark to a [`SummaryBuilder`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use vigil_core::{ComplianceJobId, RunnerId};

use crate::error::{Error, Result};
use crate::model::{ComplianceResult, ComplianceSummarizer};

/// Write-only destination for findings.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Replaces the findings of a runner.
    async fn write_results(&self, runner_id: RunnerId, results: Vec<ComplianceResult>)
    -> Result<()>;

    /// Returns true once every finding written for a job is durable and searchable.
    async fn is_flushed(&self, job_id: ComplianceJobId) -> Result<bool>;
}

/// Computes a benchmark summary from persisted findings.
#[async_trait]
pub trait SummaryBuilder: Send + Sync {
    /// Builds and stores the summary for one summarizer.
    async fn build_summary(&self, summarizer: &ComplianceSummarizer) -> Result<()>;
}

#[derive(Debug, Default)]
struct SinkState {
    results: BTreeMap<RunnerId, Vec<ComplianceResult>>,
    held: HashSet<ComplianceJobId>,
    failing_writes: usize,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("result sink lock poisoned")
}

/// In-memory sink. Jobs are flushed immediately unless held.
#[derive(Debug, Default)]
pub struct InMemoryResultSink {
    state: RwLock<SinkState>,
}

impl InMemoryResultSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `job_id` as not flushed until [`Self::release`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn hold(&self, job_id: ComplianceJobId) -> Result<()> {
        self.state.write().map_err(poison_err)?.held.insert(job_id);
        Ok(())
    }

    /// Releases a held job.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn release(&self, job_id: ComplianceJobId) -> Result<()> {
        self.state.write().map_err(poison_err)?.held.remove(&job_id);
        Ok(())
    }

    /// Makes the next `count` writes fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_next_writes(&self, count: usize) -> Result<()> {
        self.state.write().map_err(poison_err)?.failing_writes = count;
        Ok(())
    }

    /// Findings written for a job, ordered by runner.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn results_for_job(&self, job_id: ComplianceJobId) -> Result<Vec<ComplianceResult>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .results
            .values()
            .flatten()
            .filter(|result| result.compliance_job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ResultSink for InMemoryResultSink {
    async fn write_results(
        &self,
        runner_id: RunnerId,
        results: Vec<ComplianceResult>,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(Error::storage(format!(
                "failed to write results of runner {runner_id}"
            )));
        }
        state.results.insert(runner_id, results);
        Ok(())
    }

    async fn is_flushed(&self, job_id: ComplianceJobId) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(!state.held.contains(&job_id))
    }
}

/// Per-benchmark finding counts produced by [`InMemorySummaryBuilder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BenchmarkSummary {
    /// Findings with status `ok`.
    pub ok: u64,
    /// Findings with status `alarm`.
    pub alarm: u64,
}

/// Summary builder that counts findings held by an [`InMemoryResultSink`].
#[derive(Debug)]
pub struct InMemorySummaryBuilder {
    sink: Arc<InMemoryResultSink>,
    summaries: RwLock<HashMap<(ComplianceJobId, String), BenchmarkSummary>>,
    failing: RwLock<HashSet<String>>,
}

impl InMemorySummaryBuilder {
    /// Creates a builder reading from `sink`.
    #[must_use]
    pub fn new(sink: Arc<InMemoryResultSink>) -> Self {
        Self {
            sink,
            summaries: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
        }
    }

    /// Makes summaries of `benchmark_id` fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_benchmark(&self, benchmark_id: impl Into<String>) -> Result<()> {
        self.failing
            .write()
            .map_err(poison_err)?
            .insert(benchmark_id.into());
        Ok(())
    }

    /// Summary stored for a job and benchmark.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn summary(
        &self,
        job_id: ComplianceJobId,
        benchmark_id: &str,
    ) -> Result<Option<BenchmarkSummary>> {
        let summaries = self.summaries.read().map_err(poison_err)?;
        Ok(summaries.get(&(job_id, benchmark_id.to_string())).copied())
    }
}

#[async_trait]
impl SummaryBuilder for InMemorySummaryBuilder {
    async fn build_summary(&self, summarizer: &ComplianceSummarizer) -> Result<()> {
        if self
            .failing
            .read()
            .map_err(poison_err)?
            .contains(&summarizer.benchmark_id)
        {
            return Err(Error::execution(format!(
                "summary of {} failed",
                summarizer.benchmark_id
            )));
        }

        let mut summary = BenchmarkSummary::default();
        for result in self.sink.results_for_job(summarizer.parent_job_id)? {
            if result.benchmark_id != summarizer.benchmark_id {
                continue;
            }
            match result.status.as_str() {
                "ok" => summary.ok += 1,
                "alarm" => summary.alarm += 1,
                _ => {}
            }
        }

        self.summaries.write().map_err(poison_err)?.insert(
            (summarizer.parent_job_id, summarizer.benchmark_id.clone()),
            summary,
        );
        Ok(())
    }
}
