//! Error types for verification dispatch.
//!
//! Only failures of the dispatch layer itself live here. Outcomes of the
//! underlying certificate check are not errors at this level: they travel as
//! opaque [`VerifyCode`](crate::types::VerifyCode)s and are cached verbatim.

use thiserror::Error;

/// Errors that can occur when submitting a verification request.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The caller passed an argument that can never be verified.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Which argument was rejected.
        reason: String,
    },

    /// The background context refused the verification task.
    #[error("Insufficient resources: {reason}")]
    InsufficientResources {
        /// Reason reported by the task runner.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message.
        message: String,
    },
}

impl VerifyError {
    /// Check if this error was caused by the caller.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }

    /// Check if submitting the same request again may succeed.
    ///
    /// Nothing is retried automatically; this is a hint for the caller.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InsufficientResources { .. })
    }
}
