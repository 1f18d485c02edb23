//! Parent job status lookups used for cancellation.
//!
//! Workers poll the owning service for the status of a runner's parent job;
//! a `CANCELED` answer cancels the evaluation in progress.
//!
//! The HTTP endpoint is `GET {base}/api/v1/compliance/jobs/{id}/status`,
//! answering `{ "JobStatus": "<status>" }`. Calls are made with the admin
//! role header.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use vigil_core::ComplianceJobId;

use crate::error::{Error, Result};
use crate::status::ComplianceJobStatus;
use crate::store::ComplianceStore;

/// Header carrying the caller's platform role.
pub const ROLE_HEADER: &str = "x-platform-role";

/// Role used for status lookups.
pub const ADMIN_ROLE: &str = "admin";

/// Looks up the status of a parent job.
#[async_trait]
pub trait JobStatusClient: Send + Sync {
    /// Returns the current status of `job_id`.
    async fn job_status(&self, job_id: ComplianceJobId) -> Result<ComplianceJobStatus>;
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    #[serde(rename = "JobStatus")]
    job_status: ComplianceJobStatus,
}

/// HTTP client for the job status endpoint.
#[derive(Debug, Clone)]
pub struct HttpJobStatusClient {
    client: reqwest::Client,
    base_url: String,
}

const MAX_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

impl HttpJobStatusClient {
    /// Creates a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the URL is invalid or the HTTP
    /// client cannot be built.
    pub fn new(base_url: &str) -> Result<Self> {
        let parsed = reqwest::Url::parse(base_url)
            .map_err(|e| Error::configuration(format!("invalid job status URL: {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, job_id: ComplianceJobId) -> String {
        format!("{}/api/v1/compliance/jobs/{job_id}/status", self.base_url)
    }
}

#[async_trait]
impl JobStatusClient for HttpJobStatusClient {
    async fn job_status(&self, job_id: ComplianceJobId) -> Result<ComplianceJobStatus> {
        let endpoint = self.endpoint(job_id);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let response = self
                .client
                .get(&endpoint)
                .header(ROLE_HEADER, ADMIN_ROLE)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let body: JobStatusResponse = resp.json().await.map_err(|e| {
                        Error::status_check(format!("invalid status response for job {job_id}: {e}"))
                    })?;
                    return Ok(body.job_status);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if status.is_server_error() && attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Err(Error::status_check(format!(
                        "status lookup for job {job_id} failed (status={status}): {body}"
                    )));
                }
                Err(err) => {
                    // Timeouts fail fast; the next poll retries anyway.
                    if !err.is_timeout() && attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Err(Error::status_check(format!(
                        "status lookup for job {job_id} failed: {err}"
                    )));
                }
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let backoff_ms = 50_u64
        .saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)))
        .min(500);
    Duration::from_millis(backoff_ms)
}

/// Status client reading the state store directly.
#[derive(Clone)]
pub struct StoreJobStatusClient {
    store: Arc<dyn ComplianceStore>,
}

impl std::fmt::Debug for StoreJobStatusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreJobStatusClient").finish_non_exhaustive()
    }
}

impl StoreJobStatusClient {
    /// Creates a client over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ComplianceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobStatusClient for StoreJobStatusClient {
    async fn job_status(&self, job_id: ComplianceJobId) -> Result<ComplianceJobStatus> {
        self.store
            .get_job(job_id)
            .await?
            .map(|job| job.status)
            .ok_or_else(|| Error::not_found("job", job_id))
    }
}
