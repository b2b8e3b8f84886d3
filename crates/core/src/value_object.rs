//! Value objects: equality by value, not identity.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**; two instances
/// with the same attributes are interchangeable. To "modify" one, build a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// A strictly positive unit count.
///
/// Every operation that moves a fixed number of units (receive, consume,
/// reserve, release, transfer) takes a `Quantity`, so non-positive amounts are
/// rejected at the boundary instead of deep inside a mutation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Quantity(i64);

impl Quantity {
    pub fn new(units: i64) -> Result<Self, DomainError> {
        if units <= 0 {
            return Err(DomainError::validation(format!(
                "quantity must be positive (got {units})"
            )));
        }
        Ok(Self(units))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl ValueObject for Quantity {}

impl TryFrom<i64> for Quantity {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quantity> for i64 {
    fn from(value: Quantity) -> Self {
        value.0
    }
}

impl core::fmt::Display for Quantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}
