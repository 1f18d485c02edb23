//! Observability infrastructure for Vigil.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors shared by the scheduler,
//! runner workers, and result consumers.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name, falling back to [`LogFormat::Pretty`].
    #[must_use]
    pub fn from_name(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }

    /// Reads the format from `VIGIL_LOG_FORMAT`.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("VIGIL_LOG_FORMAT").map_or(Self::Pretty, |value| Self::from_name(&value))
    }
}

/// Initializes the logging subsystem.
///
/// Call once at process startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `vigil_flow=debug`)
///
/// # Example
///
/// ```rust
/// use vigil_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for operations on a parent compliance job.
///
/// # Example
///
/// ```rust
/// use vigil_core::observability::compliance_job_span;
///
/// let span = compliance_job_span("expand", 42);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn compliance_job_span(operation: &str, job_id: u64) -> Span {
    tracing::info_span!("compliance_job", op = operation, job_id = job_id)
}

/// Creates a span for a single runner evaluation.
#[must_use]
pub fn runner_span(operation: &str, runner_id: u64, parent_job_id: u64) -> Span {
    tracing::info_span!(
        "runner",
        op = operation,
        runner_id = runner_id,
        parent_job_id = parent_job_id,
    )
}
