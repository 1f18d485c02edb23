//! Compliance content: benchmarks, controls, policies, and query parameters.
//!
//! Content is owned by another service; this module only defines the
//! read-side capabilities the pipeline needs, plus in-memory implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::Caller;

/// A benchmark node. Frameworks are root benchmarks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Benchmark {
    /// Benchmark ID.
    pub id: String,
    /// Short code used in control paths, e.g. `1.2`.
    pub reference_code: String,
    /// Child benchmark IDs.
    pub children: Vec<String>,
    /// Controls attached directly to this benchmark.
    pub controls: Vec<String>,
}

/// A control evaluated by a policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Control {
    /// Control ID.
    pub id: String,
    /// Policy evaluating the control; controls without one are manual and never dispatched.
    pub policy_id: Option<String>,
    /// Declared severity, may be empty.
    pub severity: String,
}

/// A query backing one or more controls.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Policy {
    /// Policy ID.
    pub id: String,
    /// Query text handed to the engine.
    pub query: String,
    /// Table the query primarily lists, if declared.
    pub primary_resource: Option<String>,
    /// Every table the query reads.
    pub list_of_resources: Vec<String>,
    /// Integration types the query applies to.
    pub integration_types: Vec<String>,
    /// Parameter keys the query requires.
    pub parameters: Vec<String>,
}

/// Read access to compliance content.
#[async_trait]
pub trait ComplianceContent: Send + Sync {
    /// Gets a benchmark by ID.
    async fn get_benchmark(&self, id: &str) -> Result<Option<Benchmark>>;

    /// Gets a control by ID.
    async fn get_control(&self, id: &str) -> Result<Option<Control>>;

    /// Gets a policy by ID.
    async fn get_policy(&self, id: &str) -> Result<Option<Policy>>;

    /// Revision of the content, bumped on every change.
    ///
    /// `None` means the source cannot tell when it changes.
    async fn revision(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Read access to query parameter values.
#[async_trait]
pub trait ParameterSource: Send + Sync {
    /// Returns the value of a parameter, or `None` if it is not set.
    async fn get_parameter(&self, key: &str) -> Result<Option<String>>;

    /// Revision of the parameter set, bumped on every change.
    ///
    /// `None` means the source cannot tell when it changes.
    async fn revision(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// A control reachable from a framework, with every benchmark path that reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkControl {
    /// The control.
    pub control: Control,
    /// Policy ID of the control.
    pub policy_id: String,
    /// One caller per benchmark path.
    pub callers: Vec<Caller>,
}

/// Walks a framework and returns each evaluable control with its callers,
/// ordered by control ID.
///
/// Controls without a policy are skipped. Benchmarks reached twice on the
/// same path are not descended into again.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if the framework or a referenced benchmark or
/// control does not exist, or any error from the content source.
pub async fn framework_controls(
    content: &dyn ComplianceContent,
    framework_id: &str,
) -> Result<Vec<FrameworkControl>> {
    let mut callers: BTreeMap<String, Vec<Caller>> = BTreeMap::new();
    let mut controls: HashMap<String, Control> = HashMap::new();

    // Depth-first over (benchmark, path-to-benchmark).
    let mut stack = vec![(framework_id.to_string(), Vec::<String>::new())];
    while let Some((benchmark_id, mut path)) = stack.pop() {
        if path.contains(&benchmark_id) {
            tracing::warn!(framework_id, %benchmark_id, "benchmark cycle skipped");
            continue;
        }
        let benchmark = content
            .get_benchmark(&benchmark_id)
            .await?
            .ok_or_else(|| Error::not_found("benchmark", &benchmark_id))?;
        path.push(benchmark_id);

        for control_id in &benchmark.controls {
            let control = match controls.get(control_id) {
                Some(control) => control.clone(),
                None => {
                    let control = content
                        .get_control(control_id)
                        .await?
                        .ok_or_else(|| Error::not_found("control", control_id))?;
                    controls.insert(control_id.clone(), control.clone());
                    control
                }
            };
            if control.policy_id.is_none() {
                continue;
            }
            callers.entry(control_id.clone()).or_default().push(Caller {
                root_benchmark: framework_id.to_string(),
                parent_benchmark_ids: path.clone(),
                control_id: control_id.clone(),
                control_severity: control.severity.clone(),
            });
        }

        for child in benchmark.children.iter().rev() {
            stack.push((child.clone(), path.clone()));
        }
    }

    Ok(callers
        .into_iter()
        .filter_map(|(control_id, callers)| {
            let control = controls.remove(&control_id)?;
            let policy_id = control.policy_id.clone()?;
            Some(FrameworkControl {
                control,
                policy_id,
                callers,
            })
        })
        .collect())
}

#[derive(Debug, Default)]
struct ContentState {
    benchmarks: HashMap<String, Benchmark>,
    controls: HashMap<String, Control>,
    policies: HashMap<String, Policy>,
    revision: u64,
}

/// In-memory content source.
///
/// Clones share state, so content upserted through one handle is visible to
/// every component holding another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryContent {
    state: Arc<RwLock<ContentState>>,
}

impl InMemoryContent {
    /// Creates an empty content source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, ContentState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ContentState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a benchmark.
    #[must_use]
    pub fn with_benchmark(self, benchmark: Benchmark) -> Self {
        self.upsert_benchmark(benchmark);
        self
    }

    /// Adds a control.
    #[must_use]
    pub fn with_control(self, control: Control) -> Self {
        self.upsert_control(control);
        self
    }

    /// Adds a policy.
    #[must_use]
    pub fn with_policy(self, policy: Policy) -> Self {
        self.upsert_policy(policy);
        self
    }

    /// Inserts or replaces a benchmark.
    pub fn upsert_benchmark(&self, benchmark: Benchmark) {
        let mut state = self.write();
        state.benchmarks.insert(benchmark.id.clone(), benchmark);
        state.revision += 1;
    }

    /// Inserts or replaces a control.
    pub fn upsert_control(&self, control: Control) {
        let mut state = self.write();
        state.controls.insert(control.id.clone(), control);
        state.revision += 1;
    }

    /// Inserts or replaces a policy.
    pub fn upsert_policy(&self, policy: Policy) {
        let mut state = self.write();
        state.policies.insert(policy.id.clone(), policy);
        state.revision += 1;
    }
}

#[async_trait]
impl ComplianceContent for InMemoryContent {
    async fn get_benchmark(&self, id: &str) -> Result<Option<Benchmark>> {
        Ok(self.read().benchmarks.get(id).cloned())
    }

    async fn get_control(&self, id: &str) -> Result<Option<Control>> {
        Ok(self.read().controls.get(id).cloned())
    }

    async fn get_policy(&self, id: &str) -> Result<Option<Policy>> {
        Ok(self.read().policies.get(id).cloned())
    }

    async fn revision(&self) -> Result<Option<u64>> {
        Ok(Some(self.read().revision))
    }
}

#[derive(Debug, Default)]
struct ParameterState {
    values: HashMap<String, String>,
    revision: u64,
}

/// In-memory parameter source. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryParameters {
    state: Arc<RwLock<ParameterState>>,
}

impl InMemoryParameters {
    /// Creates an empty parameter source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a parameter.
    #[must_use]
    pub fn with(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Sets or replaces a parameter.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.values.insert(key.into(), value.into());
        state.revision += 1;
    }
}

#[async_trait]
impl ParameterSource for InMemoryParameters {
    async fn get_parameter(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.values.get(key).cloned())
    }

    async fn revision(&self) -> Result<Option<u64>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(Some(state.revision))
    }
}
