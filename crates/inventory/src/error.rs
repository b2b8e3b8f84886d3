//! Stock domain errors.

use thiserror::Error;

use stockledger_core::{DomainError, ReservationId, StockId};

use crate::reservation::ReservationStatus;

pub type StockResult<T> = Result<T, StockError>;

/// Deterministic failures raised by stock and reservation mutations.
///
/// None of these are retryable without an external change (more stock, a
/// different quantity, a different reservation).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StockError {
    /// Available units cannot satisfy a reserve/consume/transfer request.
    #[error("insufficient stock on {stock_id}: requested {requested}, available {available}")]
    InsufficientStock {
        stock_id: StockId,
        requested: i64,
        available: i64,
    },

    /// A non-positive (or zero delta) quantity was supplied.
    #[error("invalid quantity: {0}")]
    InvalidQuantity(i64),

    /// The change would leave fewer units on hand than are held by reservations.
    #[error("stock {stock_id} would be over-reserved: quantity {quantity}, reserved {reserved}")]
    OverReserved {
        stock_id: StockId,
        quantity: i64,
        reserved: i64,
    },

    /// `0 <= reserved <= quantity` (or another structural rule) would break.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The reservation has already reached a terminal status.
    #[error("reservation {id} is not active (status: {status})")]
    ReservationNotActive {
        id: ReservationId,
        status: ReservationStatus,
    },

    /// Input failed validation (field lengths, empty names, ...).
    #[error("validation failed: {0}")]
    Validation(String),
}

impl StockError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<DomainError> for StockError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                StockError::Validation(msg)
            }
            stale @ DomainError::StaleVersion { .. } => {
                StockError::InvariantViolation(stale.to_string())
            }
        }
    }
}
