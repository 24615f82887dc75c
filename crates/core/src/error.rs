//! Errors raised while decoding or validating investigation-platform values.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A stored value is outside its closed set, such as an unknown job status.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An id string did not parse as an integer key.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
