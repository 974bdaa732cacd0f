//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Handle failed validation
    #[error("Invalid handle '{value}': {reason}")]
    InvalidHandle { value: String, reason: String },

    /// File name failed validation
    #[error("Invalid file name '{value}': {reason}")]
    InvalidFileName { value: String, reason: String },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

impl DomainError {
    pub(crate) fn handle(value: &str, reason: &str) -> Self {
        Self::InvalidHandle {
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn file_name(value: &str, reason: &str) -> Self {
        Self::InvalidFileName {
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
