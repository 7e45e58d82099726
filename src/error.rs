//! Error types for the Keygate admission layer.

use thiserror::Error;

use crate::ratelimit::store::StoreError;

/// Main error type for Keygate operations.
#[derive(Error, Debug)]
pub enum KeygateError {
    /// The evaluated decision was a deny; the guarded operation did not run.
    #[error("Rate limit exceeded for key: {key}")]
    LimitExceeded { key: String },

    /// Bad limit, window, or algorithm identifier. Raised at registration time.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The counter store failed or timed out and the failure policy is fail-closed.
    #[error("Counter store unavailable for key {key}: {source}")]
    StoreUnavailable {
        key: String,
        #[source]
        source: StoreError,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeygateError {
    /// Whether this error is a deny decision rather than a failure.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, Self::LimitExceeded { .. })
    }

    /// Whether this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidConfiguration(_))
    }
}

/// Result type alias for Keygate operations.
pub type Result<T> = std::result::Result<T, KeygateError>;
