//! Error type for parsing shared Vigil primitives.

/// The result type used throughout vigil-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by vigil-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier could not be parsed.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },
}
