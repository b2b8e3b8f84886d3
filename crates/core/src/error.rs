//! Errors raised by the core building blocks.

use thiserror::Error;

use crate::version::ExpectedVersion;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value was rejected at construction (quantities, names, codes).
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The persisted row moved on since it was read.
    #[error("stale version: expected {expected:?}, found {actual:?}")]
    StaleVersion {
        expected: ExpectedVersion,
        actual: Option<u64>,
    },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
