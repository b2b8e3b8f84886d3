//! Engine-level errors.

use std::time::Duration;

use thiserror::Error;

use stockledger_core::{OrderId, ProductId, ReservationId, StockId, WarehouseId};
use stockledger_inventory::StockError;

use crate::store::StoreError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Error returned by ledger, reservation and warehouse operations.
///
/// Domain rule failures arrive as [`EngineError::Stock`]; lock and write
/// contention as `LockTimeout`, `DeadlockAvoided` or `Conflict`. Those, and a
/// store wait that timed out outside any row lock, are the retryable ones.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Stock(#[from] StockError),

    #[error("stock {0} not found")]
    StockNotFound(StockId),

    /// Product has never been stocked in the warehouse.
    #[error("product {product_id} is not stocked in warehouse {warehouse_id}")]
    NotStocked {
        product_id: ProductId,
        warehouse_id: WarehouseId,
    },

    #[error("warehouse {0} not found")]
    WarehouseNotFound(WarehouseId),

    #[error("warehouse {0} is inactive")]
    WarehouseInactive(WarehouseId),

    #[error("reservation {0} not found")]
    ReservationNotFound(ReservationId),

    #[error("order {order_id} already holds an active reservation on stock {stock_id}")]
    DuplicateReservation { stock_id: StockId, order_id: OrderId },

    #[error("timed out after {waited:?} waiting for lock on stock {stock_id}")]
    LockTimeout { stock_id: StockId, waited: Duration },

    /// A lock was requested out of the global `StockId` order.
    #[error("lock on stock {requested} requested while holding {held}; out of order")]
    DeadlockAvoided { held: StockId, requested: StockId },

    /// Concurrent writers kept winning after every retry.
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LockTimeout { .. }
                | EngineError::DeadlockAvoided { .. }
                | EngineError::Conflict(_)
                | EngineError::Store(StoreError::Timeout(_))
        )
    }

    /// Whether the caller was refused because the units are not there.
    pub fn is_insufficient_stock(&self) -> bool {
        matches!(
            self,
            EngineError::Stock(StockError::InsufficientStock { .. }) | EngineError::NotStocked { .. }
        )
    }
}
