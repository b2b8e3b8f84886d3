//! Optimistic concurrency expectations for versioned rows.

use crate::error::{DomainError, DomainResult};

/// Optimistic concurrency expectation for a versioned row.
///
/// Stock rows carry a version counter that increases by one per mutation; a
/// write is accepted only if the persisted version still matches.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The row must not exist yet.
    NoRow,
    /// Require the row to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// `actual` is `None` when the row does not exist.
    pub fn matches(self, actual: Option<u64>) -> bool {
        match (self, actual) {
            (ExpectedVersion::NoRow, None) => true,
            (ExpectedVersion::Exact(v), Some(a)) => v == a,
            _ => false,
        }
    }

    pub fn check(self, actual: Option<u64>) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::StaleVersion {
                expected: self,
                actual,
            })
        }
    }
}
