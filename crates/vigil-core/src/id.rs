//! Strongly-typed identifiers for Vigil entities.
//!
//! Row identifiers (`ComplianceJobId`, `RunnerId`, `SummarizerId`) are the
//! integer primary keys assigned by the state store. They are distinct types
//! so a runner ID can never be passed where a parent job ID is expected, and
//! they serialize as bare integers to match the wire format.
//!
//! [`WorkerId`] identifies a worker process and is generated locally.
//!
//! # Example
//!
//! ```rust
//! use vigil_core::id::{ComplianceJobId, RunnerId};
//!
//! let parent = ComplianceJobId::new(10);
//! let runner = RunnerId::new(10);
//!
//! // IDs are different types - this won't compile:
//! // let wrong: RunnerId = parent;
//! assert_eq!(parent.get(), runner.get());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw row identifier.
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw row identifier.
            #[must_use]
            pub const fn get(&self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.trim().parse::<u64>().map(Self).map_err(|e| Error::InvalidId {
                    message: format!("invalid {} '{s}': {e}", $label),
                })
            }
        }
    };
}

row_id!(
    /// Identifier of a parent compliance job (the umbrella run).
    ComplianceJobId,
    "compliance job ID"
);

row_id!(
    /// Identifier of a single dispatched compliance runner.
    RunnerId,
    "runner ID"
);

row_id!(
    /// Identifier of a post-processing summarizer unit.
    SummarizerId,
    "summarizer ID"
);

/// Identity of a worker process, recorded on the runners it executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Ulid);

impl WorkerId {
    /// Generates a new unique worker ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("worker-").unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid worker ID '{s}': {e}"),
            })
    }
}
