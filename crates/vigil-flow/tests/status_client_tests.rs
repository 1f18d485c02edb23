//! HTTP job status client tests against a local axum server.

#![allow(clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use vigil_core::ComplianceJobId;
use vigil_flow::status::ComplianceJobStatus;
use vigil_flow::status_client::{ADMIN_ROLE, HttpJobStatusClient, JobStatusClient, ROLE_HEADER};

#[derive(Clone, Copy)]
enum ServerMode {
    /// Answers `CANCELED` for job 7 and `RUNNERS_IN_PROGRESS` otherwise.
    Healthy,
    /// Fails with 503 for the first `failures` requests.
    Flaky { failures: usize },
    /// Always answers 404.
    Missing,
}

#[derive(Clone)]
struct ServerState {
    mode: ServerMode,
    requests: Arc<AtomicUsize>,
}

async fn status_handler(
    State(state): State<ServerState>,
    Path(job_id): Path<u64>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let attempt = state.requests.fetch_add(1, Ordering::SeqCst);

    let role = headers.get(ROLE_HEADER).and_then(|value| value.to_str().ok());
    if role != Some(ADMIN_ROLE) {
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "admin only" })));
    }

    match state.mode {
        ServerMode::Missing => (StatusCode::NOT_FOUND, Json(json!({ "error": "no such job" }))),
        ServerMode::Flaky { failures } if attempt < failures => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "warming up" })),
        ),
        ServerMode::Healthy | ServerMode::Flaky { .. } => {
            let status = if job_id == 7 {
                "CANCELED"
            } else {
                "RUNNERS_IN_PROGRESS"
            };
            (StatusCode::OK, Json(json!({ "JobStatus": status })))
        }
    }
}

async fn start_test_server(mode: ServerMode) -> (String, Arc<AtomicUsize>) {
    let requests = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/api/v1/compliance/jobs/{job_id}/status", get(status_handler))
        .with_state(ServerState {
            mode,
            requests: requests.clone(),
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr: SocketAddr = listener.local_addr().expect("listener addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve test server");
    });

    (format!("http://{addr}"), requests)
}

#[tokio::test]
async fn reports_parent_status_with_admin_role() {
    let (base_url, _) = start_test_server(ServerMode::Healthy).await;
    let client = HttpJobStatusClient::new(&base_url).expect("client");

    let canceled = client.job_status(ComplianceJobId::new(7)).await.expect("status");
    assert_eq!(canceled, ComplianceJobStatus::Canceled);

    let running = client.job_status(ComplianceJobId::new(8)).await.expect("status");
    assert_eq!(running, ComplianceJobStatus::RunnersInProgress);
}

#[tokio::test]
async fn retries_server_errors() {
    let (base_url, requests) = start_test_server(ServerMode::Flaky { failures: 2 }).await;
    let client = HttpJobStatusClient::new(&base_url).expect("client");

    let status = client.job_status(ComplianceJobId::new(7)).await.expect("status");
    assert_eq!(status, ComplianceJobStatus::Canceled);
    assert_eq!(requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gives_up_after_three_server_errors() {
    let (base_url, requests) = start_test_server(ServerMode::Flaky { failures: 10 }).await;
    let client = HttpJobStatusClient::new(&base_url).expect("client");

    let err = client
        .job_status(ComplianceJobId::new(7))
        .await
        .expect_err("persistent 503");
    assert!(err.to_string().contains("503"), "unexpected error: {err}");
    assert_eq!(requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (base_url, requests) = start_test_server(ServerMode::Missing).await;
    let client = HttpJobStatusClient::new(&base_url).expect("client");

    let err = client
        .job_status(ComplianceJobId::new(1))
        .await
        .expect_err("404");
    assert!(err.to_string().contains("no such job"), "unexpected error: {err}");
    assert_eq!(requests.load(Ordering::SeqCst), 1);
}
