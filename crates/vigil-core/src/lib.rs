//! # vigil-core
//!
//! Shared primitives for the Vigil compliance job pipeline.
//!
//! This crate provides the foundational types used by every pipeline role:
//!
//! - **Identifiers**: Strongly-typed IDs for compliance jobs, runners,
//!   summarizers, and worker processes
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span constructors
//!
//! ## Example
//!
//! ```rust
//! use vigil_core::prelude::*;
//!
//! let job = ComplianceJobId::new(42);
//! let runner = RunnerId::new(7);
//! let worker = WorkerId::generate();
//!
//! assert_eq!(job.get(), 42);
//! assert_eq!(runner.to_string(), "7");
//! assert!(!worker.to_string().is_empty());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

pub use error::{Error, Result};
pub use id::{ComplianceJobId, RunnerId, SummarizerId, WorkerId};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ComplianceJobId, RunnerId, SummarizerId, WorkerId};
    pub use crate::observability::{LogFormat, init_logging};
}
