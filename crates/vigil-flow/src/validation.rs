//! Framework validation before dispatch.
//!
//! A framework is valid when every table its policies read is owned by a
//! registered integration type and every parameter they require has a
//! value. Verdicts are cached per framework by [`ValidationCache`], stamped
//! with the [`ContentRevision`] they were computed against. A stamped verdict
//! is reused until the content or parameters change; a verdict from sources
//! without revisions only lives until the publisher's next tick.

use std::collections::HashMap;
use std::sync::Arc;

use crate::content::{ComplianceContent, ParameterSource, framework_controls};
use crate::error::{Error, Result};
use crate::registry::IntegrationTypeRegistry;

/// Outcome of validating a framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    /// The framework can be dispatched.
    Valid,
    /// The framework cannot be dispatched; the message is surfaced verbatim.
    Invalid(String),
}

impl ValidationVerdict {
    /// Returns true for [`ValidationVerdict::Valid`].
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Converts the verdict into a result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an invalid verdict.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Valid => Ok(()),
            Self::Invalid(message) => Err(Error::validation(message)),
        }
    }
}

/// Content and parameter revisions a verdict was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRevision {
    /// Revision of the compliance content.
    pub content: u64,
    /// Revision of the parameter set.
    pub parameters: u64,
}

/// Per-framework verdict cache.
#[derive(Debug, Default)]
pub struct ValidationCache {
    verdicts: HashMap<String, (Option<ContentRevision>, ValidationVerdict)>,
}

impl ValidationCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached verdict for a framework, whatever revision it was computed against.
    #[must_use]
    pub fn get(&self, framework_id: &str) -> Option<&ValidationVerdict> {
        self.verdicts.get(framework_id).map(|(_, verdict)| verdict)
    }

    /// Cached verdict for a framework if it was computed against `revision`.
    #[must_use]
    pub fn lookup(
        &self,
        framework_id: &str,
        revision: Option<ContentRevision>,
    ) -> Option<&ValidationVerdict> {
        self.verdicts
            .get(framework_id)
            .filter(|(cached, _)| *cached == revision)
            .map(|(_, verdict)| verdict)
    }

    /// Stores a verdict computed against `revision`.
    pub fn insert(
        &mut self,
        framework_id: impl Into<String>,
        revision: Option<ContentRevision>,
        verdict: ValidationVerdict,
    ) {
        self.verdicts.insert(framework_id.into(), (revision, verdict));
    }

    /// Drops the verdict of one framework.
    pub fn invalidate(&mut self, framework_id: &str) {
        self.verdicts.remove(framework_id);
    }

    /// Drops verdicts computed without a revision.
    pub fn evict_unversioned(&mut self) {
        self.verdicts.retain(|_, (revision, _)| revision.is_some());
    }

    /// Number of cached verdicts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }
}

/// Checks frameworks against the registry and parameter source.
#[derive(Clone)]
pub struct FrameworkValidator {
    content: Arc<dyn ComplianceContent>,
    registry: Arc<IntegrationTypeRegistry>,
    parameters: Arc<dyn ParameterSource>,
}

impl std::fmt::Debug for FrameworkValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameworkValidator")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl FrameworkValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(
        content: Arc<dyn ComplianceContent>,
        registry: Arc<IntegrationTypeRegistry>,
        parameters: Arc<dyn ParameterSource>,
    ) -> Self {
        Self {
            content,
            registry,
            parameters,
        }
    }

    /// Validates a framework.
    ///
    /// Missing content is reported as an invalid verdict.
    ///
    /// # Errors
    ///
    /// Returns an error when the content or parameter source fails; such
    /// failures are transient and must not be cached.
    pub async fn validate(&self, framework_id: &str) -> Result<ValidationVerdict> {
        let controls = match framework_controls(self.content.as_ref(), framework_id).await {
            Ok(controls) => controls,
            Err(err @ Error::NotFound { .. }) => {
                return Ok(ValidationVerdict::Invalid(err.to_string()));
            }
            Err(err) => return Err(err),
        };

        for control in &controls {
            let Some(policy) = self.content.get_policy(&control.policy_id).await? else {
                return Ok(ValidationVerdict::Invalid(format!(
                    "policy {} of control {} not found",
                    control.policy_id, control.control.id
                )));
            };

            let tables = policy
                .primary_resource
                .iter()
                .chain(policy.list_of_resources.iter())
                .filter(|table| !table.is_empty());
            for table in tables {
                if self.registry.owner_of_table(table).is_none() {
                    return Ok(ValidationVerdict::Invalid(format!(
                        "table {table} used by policy {} is not provided by any integration type",
                        policy.id
                    )));
                }
            }

            for key in &policy.parameters {
                if self.parameters.get_parameter(key).await?.is_none() {
                    return Ok(ValidationVerdict::Invalid(format!(
                        "parameter {key} required by policy {} is not set",
                        policy.id
                    )));
                }
            }
        }

        Ok(ValidationVerdict::Valid)
    }

    /// Current revision of the content and parameters, if both sources
    /// report one.
    ///
    /// # Errors
    ///
    /// Returns an error when either source fails.
    pub async fn revision(&self) -> Result<Option<ContentRevision>> {
        let content = self.content.revision().await?;
        let parameters = self.parameters.revision().await?;
        Ok(content
            .zip(parameters)
            .map(|(content, parameters)| ContentRevision {
                content,
                parameters,
            }))
    }

    /// Validates a framework through `cache`.
    ///
    /// A cached verdict is reused only if it was computed against the
    /// current revision.
    ///
    /// # Errors
    ///
    /// Propagates transient errors from [`Self::validate`] without caching.
    pub async fn validate_cached(
        &self,
        cache: &mut ValidationCache,
        framework_id: &str,
    ) -> Result<ValidationVerdict> {
        let revision = self.revision().await?;
        if let Some(verdict) = cache.lookup(framework_id, revision) {
            return Ok(verdict.clone());
        }
        let verdict = self.validate(framework_id).await?;
        cache.insert(framework_id, revision, verdict.clone());
        Ok(verdict)
    }
}
