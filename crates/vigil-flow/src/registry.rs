//! Integration-type registry.
//!
//! Each integration type (a cloud provider or SaaS kind) owns a set of query
//! tables and knows which resource type each table lists. The registry is
//! populated at startup and shared read-only by validators and workers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Table metadata for one integration type.
pub trait IntegrationTypeProvider: Send + Sync {
    /// Integration type name, e.g. `aws_cloud_account`.
    fn integration_type(&self) -> &str;

    /// Resource type listed by `table`, if the table belongs to this type.
    fn resource_type_for_table(&self, table: &str) -> Option<String>;
}

/// Lookup of providers by integration type.
#[derive(Clone, Default)]
pub struct IntegrationTypeRegistry {
    providers: HashMap<String, Arc<dyn IntegrationTypeProvider>>,
}

impl std::fmt::Debug for IntegrationTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.providers.keys().collect();
        types.sort();
        f.debug_struct("IntegrationTypeRegistry")
            .field("types", &types)
            .finish()
    }
}

impl IntegrationTypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider, replacing any previous provider of the same type.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn IntegrationTypeProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Registers a provider, replacing any previous provider of the same type.
    pub fn register(&mut self, provider: Arc<dyn IntegrationTypeProvider>) {
        self.providers
            .insert(provider.integration_type().to_string(), provider);
    }

    /// Returns the provider for an integration type.
    #[must_use]
    pub fn get(&self, integration_type: &str) -> Option<&Arc<dyn IntegrationTypeProvider>> {
        self.providers.get(integration_type)
    }

    /// Resolves the resource type listed by `table` under `integration_type`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownIntegrationType`] when no provider is
    /// registered for the type, or [`Error::ResourceTypeNotFound`] when the
    /// provider does not own the table.
    pub fn resource_type_from_table_name(
        &self,
        integration_type: &str,
        table: &str,
    ) -> Result<String> {
        let provider = self
            .get(integration_type)
            .ok_or_else(|| Error::UnknownIntegrationType(integration_type.to_string()))?;
        provider
            .resource_type_for_table(table)
            .ok_or_else(|| Error::ResourceTypeNotFound {
                integration_type: integration_type.to_string(),
                table: table.to_string(),
            })
    }

    /// Returns the integration type owning `table`, if any.
    #[must_use]
    pub fn owner_of_table(&self, table: &str) -> Option<&str> {
        self.providers
            .values()
            .find(|provider| provider.resource_type_for_table(table).is_some())
            .map(|provider| provider.integration_type())
    }
}

/// Provider backed by a fixed table map.
#[derive(Debug, Clone)]
pub struct StaticIntegrationType {
    name: String,
    tables: BTreeMap<String, String>,
}

impl StaticIntegrationType {
    /// Creates a provider with no tables.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: BTreeMap::new(),
        }
    }

    /// Adds a table and the resource type it lists.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>, resource_type: impl Into<String>) -> Self {
        self.tables.insert(table.into(), resource_type.into());
        self
    }
}

impl IntegrationTypeProvider for StaticIntegrationType {
    fn integration_type(&self) -> &str {
        &self.name
    }

    fn resource_type_for_table(&self, table: &str) -> Option<String> {
        self.tables.get(table).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> IntegrationTypeRegistry {
        IntegrationTypeRegistry::new().with_provider(Arc::new(
            StaticIntegrationType::new("aws_cloud_account")
                .with_table("aws_s3_bucket", "AWS::S3::Bucket"),
        ))
    }

    #[test]
    fn resolves_known_table() {
        let resource = registry()
            .resource_type_from_table_name("aws_cloud_account", "aws_s3_bucket")
            .unwrap();
        assert_eq!(resource, "AWS::S3::Bucket");
    }

    #[test]
    fn unknown_type_and_table_are_errors() {
        let registry = registry();
        assert!(matches!(
            registry.resource_type_from_table_name("azure_subscription", "aws_s3_bucket"),
            Err(Error::UnknownIntegrationType(_))
        ));
        assert!(matches!(
            registry.resource_type_from_table_name("aws_cloud_account", "aws_ec2_instance"),
            Err(Error::ResourceTypeNotFound { .. })
        ));
    }

    #[test]
    fn finds_table_owner() {
        let registry = registry();
        assert_eq!(registry.owner_of_table("aws_s3_bucket"), Some("aws_cloud_account"));
        assert_eq!(registry.owner_of_table("github_repository"), None);
    }
}
