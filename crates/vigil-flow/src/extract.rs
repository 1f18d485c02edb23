//! Turning query output into compliance findings.
//!
//! Each row becomes one [`ComplianceResult`] per caller of the job, so a
//! control reached through two benchmark paths yields two findings per
//! resource. Rows are read by column name:
//!
//! | Column | Use |
//! |--------|-----|
//! | `resource` | resource ID; rows where it is empty or `"null"` are skipped |
//! | `platform_resource_id` | platform-level resource ID |
//! | `platform_account_id` | integration ID, falling back to the job's |
//! | `platform_table_name` | resource-type fallback when the query declares none |
//! | `name`, `reason`, `status` | copied as-is |
//! | `cost_optimization` | cost impact, numeric or numeric string |
//!
//! Only rows whose status is `ok` or `alarm` are kept.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::content::{ComplianceContent, Policy};
use crate::engine::QueryOutput;
use crate::error::{Error, Result};
use crate::model::{Caller, ComplianceResult, Job};
use crate::registry::IntegrationTypeRegistry;

const COL_RESOURCE: &str = "resource";
const COL_PLATFORM_RESOURCE_ID: &str = "platform_resource_id";
const COL_PLATFORM_ACCOUNT_ID: &str = "platform_account_id";
const COL_PLATFORM_TABLE_NAME: &str = "platform_table_name";
const COL_NAME: &str = "name";
const COL_REASON: &str = "reason";
const COL_STATUS: &str = "status";
const COL_COST: &str = "cost_optimization";

/// Status values retained in the sink.
pub const RETAINED_STATUSES: [&str; 2] = ["ok", "alarm"];

/// Resource type and the integration type that resolved it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResourceType {
    /// Resource type.
    pub resource_type: String,
    /// Integration type owning the table.
    pub integration_type: String,
}

/// Table the policy lists: its primary resource, or its only resource.
#[must_use]
pub fn listed_table(policy: &Policy) -> Option<&str> {
    policy
        .primary_resource
        .as_deref()
        .filter(|table| !table.is_empty())
        .or_else(|| match policy.list_of_resources.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        })
}

/// Resolves `table` against each integration type in order; the first
/// success wins.
///
/// # Errors
///
/// Returns the error of the last integration type tried when none resolves.
pub fn resolve_table(
    registry: &IntegrationTypeRegistry,
    integration_types: &[String],
    table: &str,
) -> Result<Option<ResolvedResourceType>> {
    let mut last_error = None;
    for integration_type in integration_types {
        match registry.resource_type_from_table_name(integration_type, table) {
            Ok(resource_type) => {
                return Ok(Some(ResolvedResourceType {
                    resource_type,
                    integration_type: integration_type.clone(),
                }));
            }
            Err(err) => {
                tracing::debug!(%integration_type, table, error = %err, "resource type lookup failed");
                last_error = Some(err);
            }
        }
    }
    last_error.map_or(Ok(None), Err)
}

/// Resolves the resource type listed by a policy, if it declares a table.
///
/// # Errors
///
/// Returns the last resolution error when every integration type fails.
pub fn resolve_resource_type(
    registry: &IntegrationTypeRegistry,
    policy: &Policy,
) -> Result<Option<ResolvedResourceType>> {
    match listed_table(policy) {
        Some(table) => resolve_table(registry, &policy.integration_types, table),
        None => Ok(None),
    }
}

/// Parses a cost value. Unparsable values count as zero and are logged.
#[must_use]
pub fn parse_cost(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Number(number) => number.as_f64().unwrap_or(0.0),
        Value::String(raw) if raw.trim().is_empty() => 0.0,
        Value::String(raw) => raw.trim().parse::<f64>().unwrap_or_else(|_| {
            tracing::warn!(value = %raw, "unparsable cost_optimization, using 0");
            0.0
        }),
        other => {
            tracing::warn!(value = %other, "unsupported cost_optimization type, using 0");
            0.0
        }
    }
}

fn text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn is_blank(value: &str) -> bool {
    value.is_empty() || value == "null"
}

/// Returns true if a row must be dropped for lack of a resource ID.
#[must_use]
pub fn is_skipped_resource(resource: &str) -> bool {
    is_blank(resource.trim())
}

/// Builds a control path from benchmark reference codes.
///
/// Empty codes are left out; the control ID always ends the path.
#[must_use]
pub fn control_path(reference_codes: &[String], control_id: &str) -> String {
    reference_codes
        .iter()
        .map(String::as_str)
        .filter(|code| !code.is_empty())
        .chain(std::iter::once(control_id))
        .collect::<Vec<_>>()
        .join("/")
}

/// Benchmark reference codes, looked up on miss.
///
/// Owned by one worker; [`Self::clear`] drops every entry.
#[derive(Debug, Default)]
pub struct ReferenceCodeCache {
    codes: HashMap<String, String>,
}

impl ReferenceCodeCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the reference code of a benchmark.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the benchmark does not exist, or any
    /// content source error.
    pub async fn reference_code(
        &mut self,
        content: &dyn ComplianceContent,
        benchmark_id: &str,
    ) -> Result<String> {
        if let Some(code) = self.codes.get(benchmark_id) {
            return Ok(code.clone());
        }
        let benchmark = content
            .get_benchmark(benchmark_id)
            .await?
            .ok_or_else(|| Error::not_found("benchmark", benchmark_id))?;
        self.codes
            .insert(benchmark_id.to_string(), benchmark.reference_code.clone());
        Ok(benchmark.reference_code)
    }

    /// Builds the control path of a caller.
    ///
    /// # Errors
    ///
    /// Returns an error if a benchmark on the path cannot be loaded.
    pub async fn control_path(
        &mut self,
        content: &dyn ComplianceContent,
        caller: &Caller,
    ) -> Result<String> {
        let mut codes = Vec::with_capacity(caller.parent_benchmark_ids.len());
        for benchmark_id in &caller.parent_benchmark_ids {
            codes.push(self.reference_code(content, benchmark_id).await?);
        }
        Ok(control_path(&codes, &caller.control_id))
    }

    /// Number of cached benchmarks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.codes.clear();
    }
}

/// Inputs shared by every row of one runner's output.
#[derive(Debug)]
pub struct ExtractionContext<'a> {
    /// The job being evaluated.
    pub job: &'a Job,
    /// Registry used for per-row table resolution.
    pub registry: &'a IntegrationTypeRegistry,
    /// Integration types declared by the policy.
    pub integration_types: &'a [String],
    /// Resource type resolved from the policy, if any.
    pub resolved: Option<&'a ResolvedResourceType>,
    /// Control path per caller, aligned with `job.callers`.
    pub control_paths: &'a [String],
    /// Timestamp stamped on every finding.
    pub evaluated_at: DateTime<Utc>,
}

/// Extracts findings from query output.
#[must_use]
pub fn extract_results(output: &QueryOutput, ctx: &ExtractionContext<'_>) -> Vec<ComplianceResult> {
    let mut results = Vec::new();
    let mut table_cache: HashMap<String, Option<ResolvedResourceType>> = HashMap::new();

    for row in &output.rows {
        let fields: HashMap<&str, &Value> = output
            .headers
            .iter()
            .map(String::as_str)
            .zip(row.iter())
            .collect();
        let field = |name: &str| text(fields.get(name).copied());

        let resource_id = field(COL_RESOURCE);
        if is_skipped_resource(&resource_id) {
            continue;
        }

        let status = field(COL_STATUS);
        if !RETAINED_STATUSES.contains(&status.as_str()) {
            continue;
        }

        let resolved = match ctx.resolved {
            Some(resolved) => Some(resolved.clone()),
            None => {
                let table = field(COL_PLATFORM_TABLE_NAME);
                if is_blank(&table) {
                    None
                } else {
                    table_cache
                        .entry(table.clone())
                        .or_insert_with(|| {
                            resolve_table(ctx.registry, ctx.integration_types, &table)
                                .unwrap_or_else(|err| {
                                    tracing::debug!(table = %table, error = %err, "row resource type unresolved");
                                    None
                                })
                        })
                        .clone()
                }
            }
        };
        let (resource_type, integration_type) = match resolved {
            Some(resolved) => (resolved.resource_type, resolved.integration_type),
            None => (
                String::new(),
                ctx.integration_types.first().cloned().unwrap_or_default(),
            ),
        };

        let account = field(COL_PLATFORM_ACCOUNT_ID);
        let integration_id = if is_blank(&account) {
            ctx.job.integration_id.clone().unwrap_or_default()
        } else {
            account
        };

        let cost_impact = fields.get(COL_COST).map_or(0.0, |value| parse_cost(value));
        let resource_name = field(COL_NAME);
        let reason = field(COL_REASON);
        let platform_resource_id = field(COL_PLATFORM_RESOURCE_ID);

        for (index, caller) in ctx.job.callers.iter().enumerate() {
            let control_path = ctx
                .control_paths
                .get(index)
                .cloned()
                .unwrap_or_else(|| ctx.job.control_id.clone());
            results.push(ComplianceResult {
                benchmark_id: caller.root_benchmark.clone(),
                control_id: ctx.job.control_id.clone(),
                integration_id: integration_id.clone(),
                integration_type: integration_type.clone(),
                resource_id: resource_id.clone(),
                resource_name: resource_name.clone(),
                resource_type: resource_type.clone(),
                platform_resource_id: platform_resource_id.clone(),
                status: status.clone(),
                severity: caller.severity().to_string(),
                reason: reason.clone(),
                cost_impact,
                control_path,
                runner_id: ctx.job.id,
                compliance_job_id: ctx.job.parent_job_id,
                evaluated_at: ctx.evaluated_at,
                parent_benchmarks: caller.parent_benchmark_ids.clone(),
            });
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticIntegrationType;
    use serde_json::json;
    use std::sync::Arc;
    use vigil_core::{ComplianceJobId, RunnerId};

    fn registry() -> IntegrationTypeRegistry {
        IntegrationTypeRegistry::new()
            .with_provider(Arc::new(
                StaticIntegrationType::new("aws_cloud_account")
                    .with_table("aws_s3_bucket", "AWS::S3::Bucket"),
            ))
            .with_provider(Arc::new(
                StaticIntegrationType::new("azure_subscription")
                    .with_table("azure_storage_account", "Microsoft.Storage/storageAccounts"),
            ))
    }

    fn job(callers: Vec<Caller>) -> Job {
        Job {
            id: RunnerId::new(7),
            parent_job_id: ComplianceJobId::new(3),
            retry_count: 0,
            framework_id: "cis".into(),
            control_id: "s3-public".into(),
            policy_id: "pol".into(),
            integration_id: Some("acc-fallback".into()),
            callers,
            created_at: Utc::now(),
        }
    }

    fn caller(path: &[&str]) -> Caller {
        Caller {
            root_benchmark: path[0].into(),
            parent_benchmark_ids: path.iter().map(ToString::to_string).collect(),
            control_id: "s3-public".into(),
            control_severity: String::new(),
        }
    }

    fn policy(primary: Option<&str>, resources: &[&str], types: &[&str]) -> Policy {
        Policy {
            id: "pol".into(),
            query: "select".into(),
            primary_resource: primary.map(Into::into),
            list_of_resources: resources.iter().map(ToString::to_string).collect(),
            integration_types: types.iter().map(ToString::to_string).collect(),
            parameters: Vec::new(),
        }
    }

    fn headers() -> Vec<String> {
        ["resource", "platform_account_id", "name", "reason", "status", "cost_optimization"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn second_integration_type_wins_when_first_fails() {
        let policy = policy(
            Some("azure_storage_account"),
            &[],
            &["aws_cloud_account", "azure_subscription"],
        );
        let resolved = resolve_resource_type(&registry(), &policy).unwrap().unwrap();
        assert_eq!(resolved.resource_type, "Microsoft.Storage/storageAccounts");
        assert_eq!(resolved.integration_type, "azure_subscription");
    }

    #[test]
    fn all_types_failing_reports_last_error() {
        let policy = policy(
            Some("github_repository"),
            &[],
            &["aws_cloud_account", "azure_subscription"],
        );
        let err = resolve_resource_type(&registry(), &policy).unwrap_err();
        assert!(err.to_string().contains("azure_subscription"));
    }

    #[test]
    fn sole_listed_resource_is_used() {
        let single = policy(None, &["aws_s3_bucket"], &["aws_cloud_account"]);
        assert_eq!(listed_table(&single), Some("aws_s3_bucket"));
        let many = policy(None, &["aws_s3_bucket", "aws_iam_role"], &["aws_cloud_account"]);
        assert_eq!(listed_table(&many), None);
        assert!(resolve_resource_type(&registry(), &many).unwrap().is_none());
    }

    #[test]
    fn cost_parsing() {
        assert!((parse_cost(&json!("12.5")) - 12.5).abs() < f64::EPSILON);
        assert!((parse_cost(&json!(3)) - 3.0).abs() < f64::EPSILON);
        assert!(parse_cost(&json!("abc")).abs() < f64::EPSILON);
        assert!(parse_cost(&Value::Null).abs() < f64::EPSILON);
        assert!(parse_cost(&json!(true)).abs() < f64::EPSILON);
    }

    #[test]
    fn control_path_skips_empty_codes() {
        let codes = vec!["CIS".to_string(), String::new(), "1.2".to_string()];
        assert_eq!(control_path(&codes, "s3-public"), "CIS/1.2/s3-public");
        assert_eq!(control_path(&[], "c"), "c");
    }

    #[test]
    fn rows_are_filtered_and_fanned_out_per_caller() {
        let job = job(vec![caller(&["cis", "cis-1"]), caller(&["cis", "cis-2"])]);
        let resolved = ResolvedResourceType {
            resource_type: "AWS::S3::Bucket".into(),
            integration_type: "aws_cloud_account".into(),
        };
        let registry = registry();
        let types = vec!["aws_cloud_account".to_string()];
        let paths = vec!["CIS/1/s3-public".to_string(), "CIS/2/s3-public".to_string()];
        let ctx = ExtractionContext {
            job: &job,
            registry: &registry,
            integration_types: &types,
            resolved: Some(&resolved),
            control_paths: &paths,
            evaluated_at: Utc::now(),
        };
        let output = QueryOutput::new(
            headers(),
            vec![
                vec![json!("arn:1"), json!("acc-1"), json!("b1"), json!("public"), json!("alarm"), json!("12.5")],
                vec![json!("null"), json!("acc-1"), json!("b2"), json!(""), json!("ok"), json!(0)],
                vec![json!(""), json!("acc-1"), json!("b3"), json!(""), json!("ok"), json!(0)],
                vec![json!("arn:4"), json!("null"), json!("b4"), json!(""), json!("ok"), json!("abc")],
                vec![json!("arn:5"), json!("acc-1"), json!("b5"), json!(""), json!("skip"), json!(0)],
            ],
        );

        let results = extract_results(&output, &ctx);
        assert_eq!(results.len(), 4);

        assert_eq!(results[0].resource_id, "arn:1");
        assert_eq!(results[0].parent_benchmarks, vec!["cis", "cis-1"]);
        assert_eq!(results[1].parent_benchmarks, vec!["cis", "cis-2"]);
        assert_eq!(results[1].control_path, "CIS/2/s3-public");
        assert!((results[0].cost_impact - 12.5).abs() < f64::EPSILON);
        assert_eq!(results[0].severity, "none");

        assert_eq!(results[2].resource_id, "arn:4");
        assert_eq!(results[2].integration_id, "acc-fallback");
        assert!(results[2].cost_impact.abs() < f64::EPSILON);
    }

    #[test]
    fn platform_table_name_is_a_per_row_fallback() {
        let job = job(vec![caller(&["cis"])]);
        let registry = registry();
        let types = vec!["aws_cloud_account".to_string(), "azure_subscription".to_string()];
        let ctx = ExtractionContext {
            job: &job,
            registry: &registry,
            integration_types: &types,
            resolved: None,
            control_paths: &[],
            evaluated_at: Utc::now(),
        };
        let output = QueryOutput::new(
            vec!["resource".into(), "status".into(), "platform_table_name".into()],
            vec![
                vec![json!("r1"), json!("ok"), json!("azure_storage_account")],
                vec![json!("r2"), json!("alarm"), json!("unknown_table")],
            ],
        );

        let results = extract_results(&output, &ctx);
        assert_eq!(results[0].resource_type, "Microsoft.Storage/storageAccounts");
        assert_eq!(results[0].integration_type, "azure_subscription");
        assert_eq!(results[0].control_path, "s3-public");
        assert_eq!(results[1].resource_type, "");
        assert_eq!(results[1].integration_type, "aws_cloud_account");
    }

    #[tokio::test]
    async fn reference_codes_are_cached() -> Result<()> {
        use crate::content::{Benchmark, InMemoryContent};
        let content = InMemoryContent::new()
            .with_benchmark(Benchmark {
                id: "cis".into(),
                reference_code: "CIS".into(),
                ..Benchmark::default()
            })
            .with_benchmark(Benchmark {
                id: "cis-1".into(),
                reference_code: "1".into(),
                ..Benchmark::default()
            });
        let mut cache = ReferenceCodeCache::new();
        let path = cache.control_path(&content, &caller(&["cis", "cis-1"])).await?;
        assert_eq!(path, "CIS/1/s3-public");
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
        Ok(())
    }
}
