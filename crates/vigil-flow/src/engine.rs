//! Query engine capability.
//!
//! The SQL dialect and execution live in another service; the pipeline
//! hands over a query and gets back a header row plus value rows.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

/// A query to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Query text.
    pub query: String,
    /// Restricts the query to one integration; `None` means all.
    pub integration_id: Option<String>,
    /// Resolved parameter values.
    pub parameters: BTreeMap<String, String>,
}

/// Tabular query output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    /// Column names.
    pub headers: Vec<String>,
    /// Rows aligned with `headers`.
    pub rows: Vec<Vec<Value>>,
}

impl QueryOutput {
    /// Builds an output from headers and rows.
    #[must_use]
    pub fn new(headers: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { headers, rows }
    }
}

/// Executes compliance queries.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Runs a query to completion.
    async fn execute(&self, request: &QueryRequest) -> Result<QueryOutput>;
}

type Responder = dyn Fn(&QueryRequest) -> Result<QueryOutput> + Send + Sync;

/// Engine returning canned output, for tests.
///
/// Outputs are keyed by query text; unknown queries fail with an execution
/// error. Every request is recorded.
#[derive(Clone, Default)]
pub struct StaticQueryEngine {
    responses: BTreeMap<String, Arc<Responder>>,
    requests: Arc<Mutex<Vec<QueryRequest>>>,
}

impl std::fmt::Debug for StaticQueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticQueryEngine")
            .field("queries", &self.responses.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl StaticQueryEngine {
    /// Creates an engine with no queries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `output` for `query`.
    #[must_use]
    pub fn with_output(self, query: impl Into<String>, output: QueryOutput) -> Self {
        self.with_responder(query, move |_| Ok(output.clone()))
    }

    /// Fails `query` with an execution error carrying `message`.
    #[must_use]
    pub fn with_failure(self, query: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        self.with_responder(query, move |_| Err(Error::execution(message.clone())))
    }

    /// Answers `query` with a closure.
    #[must_use]
    pub fn with_responder<F>(mut self, query: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&QueryRequest) -> Result<QueryOutput> + Send + Sync + 'static,
    {
        self.responses.insert(query.into(), Arc::new(responder));
        self
    }

    /// Requests executed so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn requests(&self) -> Result<Vec<QueryRequest>> {
        let requests = self
            .requests
            .lock()
            .map_err(|_: PoisonError<_>| Error::execution("engine lock poisoned"))?;
        Ok(requests.clone())
    }
}

#[async_trait]
impl QueryEngine for StaticQueryEngine {
    async fn execute(&self, request: &QueryRequest) -> Result<QueryOutput> {
        self.requests
            .lock()
            .map_err(|_: PoisonError<_>| Error::execution("engine lock poisoned"))?
            .push(request.clone());
        let responder = self
            .responses
            .get(&request.query)
            .ok_or_else(|| Error::execution(format!("unknown query: {}", request.query)))?;
        responder(request)
    }
}
