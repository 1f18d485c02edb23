//! Error types for the compliance pipeline.

/// The result type used throughout vigil-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The destination stream does not exist on the broker.
    #[error("stream not found: {stream}")]
    StreamNotFound {
        /// The stream (topic) that was addressed.
        stream: String,
    },

    /// A broker operation failed.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the broker failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid or missing configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A framework references tables or parameters that cannot be resolved.
    #[error("{message}")]
    Validation {
        /// Human-readable validation failure.
        message: String,
    },

    /// Evaluating a runner failed.
    #[error("{message}")]
    Execution {
        /// Description of the execution failure.
        message: String,
    },

    /// A table could not be mapped to a resource type.
    #[error("resource type not found for table {table} ({integration_type})")]
    ResourceTypeNotFound {
        /// Integration type that was consulted.
        integration_type: String,
        /// The table that could not be resolved.
        table: String,
    },

    /// No provider is registered for an integration type.
    #[error("unknown integration type: {0}")]
    UnknownIntegrationType(String),

    /// A referenced content entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind (framework, control, policy, job, runner...).
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Querying the owning service for job status failed.
    #[error("job status check failed: {message}")]
    StatusCheck {
        /// Description of the failure.
        message: String,
    },

    /// The evaluation was cancelled before completion.
    #[error("evaluation cancelled")]
    Cancelled,
}

impl Error {
    /// Creates a new queue error.
    #[must_use]
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new execution error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Creates a new status-check error.
    #[must_use]
    pub fn status_check(message: impl Into<String>) -> Self {
        Self::StatusCheck {
            message: message.into(),
        }
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Returns true if the broker reported a missing stream.
    #[must_use]
    pub const fn is_stream_not_found(&self) -> bool {
        matches!(self, Self::StreamNotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::serialization(error.to_string())
    }
}
