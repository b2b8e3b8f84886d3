use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use stockledger_core::{
    ExpectedVersion, OrderId, ProductId, ReservationId, StockId, WarehouseId,
};
use stockledger_inventory::{
    MovementKind, MovementReference, NewMovement, ReservationStatus, Stock, StockMovement,
    StockReservation, Warehouse,
};

/// A stock row to write, guarded by the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockWrite {
    pub stock: Stock,
    pub expected: ExpectedVersion,
}

/// A reservation row to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationWrite {
    /// A new active reservation. At most one active reservation may exist per
    /// `(stock_id, order_id)`.
    Insert(StockReservation),
    /// A status change, accepted only if the stored status is still `from`.
    Transition {
        reservation: StockReservation,
        from: ReservationStatus,
    },
}

/// Everything one logical operation writes, committed all-or-nothing.
///
/// Movements are assigned their per-stock `sequence` at commit, in the order
/// they were staged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOfWork {
    pub stocks: Vec<StockWrite>,
    pub movements: Vec<NewMovement>,
    pub reservations: Vec<ReservationWrite>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Work that only creates a fresh stock row.
    pub fn open_stock(stock: Stock) -> Self {
        Self {
            stocks: vec![StockWrite {
                stock,
                expected: ExpectedVersion::NoRow,
            }],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stocks.is_empty() && self.movements.is_empty() && self.reservations.is_empty()
    }
}

/// What a warehouse update changes, and so which precondition the store
/// enforces together with the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarehouseChange {
    /// Only `is_active`; always allowed.
    Activation,
    /// Name, code or address; refused with [`StoreError::Conflict`] once any
    /// stock row references the warehouse.
    Details,
}

/// Persistence operation error.
///
/// `Conflict` and `Duplicate` mean a concurrent writer got there first; the
/// caller may re-read and retry. `Timeout` means a lock, statement or pool
/// wait ran out. `Backend` covers everything else.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("duplicate row: {0}")]
    Duplicate(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Persistence boundary of the engine.
///
/// Implementations are injected at construction (no global pool) and must:
/// - apply a [`UnitOfWork`] atomically, rejecting it entirely if any stock
///   version, reservation status or uniqueness check fails
/// - keep movements append-only and ordered by `sequence` per stock row
/// - reject a second movement with the same `(stock_id, kind, reference)`
/// - accept a new stock row only into an existing (`NotFound` otherwise),
///   active (`Conflict` otherwise) warehouse, checked inside the commit
pub trait InventoryStore: Send + Sync {
    fn insert_warehouse(&self, warehouse: &Warehouse) -> Result<(), StoreError>;

    fn update_warehouse(
        &self,
        warehouse: &Warehouse,
        change: WarehouseChange,
    ) -> Result<(), StoreError>;

    fn get_warehouse(&self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError>;

    /// Whether any stock row points at the warehouse.
    fn warehouse_is_referenced(&self, id: WarehouseId) -> Result<bool, StoreError>;

    fn get_stock(&self, id: StockId) -> Result<Option<Stock>, StoreError>;

    fn find_stock(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Stock>, StoreError>;

    fn get_reservation(&self, id: ReservationId) -> Result<Option<StockReservation>, StoreError>;

    fn find_active_reservation(
        &self,
        stock_id: StockId,
        order_id: OrderId,
    ) -> Result<Option<StockReservation>, StoreError>;

    fn active_reservations(&self, stock_id: StockId) -> Result<Vec<StockReservation>, StoreError>;

    /// Ids of active reservations with `expires_at <= now`, oldest deadline first.
    fn due_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReservationId>, StoreError>;

    fn find_movement(
        &self,
        stock_id: StockId,
        kind: MovementKind,
        reference: &MovementReference,
    ) -> Result<Option<StockMovement>, StoreError>;

    /// Movements of a stock row with `sequence > after`, ascending.
    fn movements(&self, stock_id: StockId, after: u64) -> Result<Vec<StockMovement>, StoreError>;

    /// Apply a unit of work atomically; returns the recorded movements in staging order.
    fn commit(&self, work: UnitOfWork) -> Result<Vec<StockMovement>, StoreError>;
}

impl<S> InventoryStore for Arc<S>
where
    S: InventoryStore + ?Sized,
{
    fn insert_warehouse(&self, warehouse: &Warehouse) -> Result<(), StoreError> {
        (**self).insert_warehouse(warehouse)
    }

    fn update_warehouse(
        &self,
        warehouse: &Warehouse,
        change: WarehouseChange,
    ) -> Result<(), StoreError> {
        (**self).update_warehouse(warehouse, change)
    }

    fn get_warehouse(&self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
        (**self).get_warehouse(id)
    }

    fn warehouse_is_referenced(&self, id: WarehouseId) -> Result<bool, StoreError> {
        (**self).warehouse_is_referenced(id)
    }

    fn get_stock(&self, id: StockId) -> Result<Option<Stock>, StoreError> {
        (**self).get_stock(id)
    }

    fn find_stock(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Stock>, StoreError> {
        (**self).find_stock(product_id, warehouse_id)
    }

    fn get_reservation(&self, id: ReservationId) -> Result<Option<StockReservation>, StoreError> {
        (**self).get_reservation(id)
    }

    fn find_active_reservation(
        &self,
        stock_id: StockId,
        order_id: OrderId,
    ) -> Result<Option<StockReservation>, StoreError> {
        (**self).find_active_reservation(stock_id, order_id)
    }

    fn active_reservations(&self, stock_id: StockId) -> Result<Vec<StockReservation>, StoreError> {
        (**self).active_reservations(stock_id)
    }

    fn due_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReservationId>, StoreError> {
        (**self).due_reservations(now, limit)
    }

    fn find_movement(
        &self,
        stock_id: StockId,
        kind: MovementKind,
        reference: &MovementReference,
    ) -> Result<Option<StockMovement>, StoreError> {
        (**self).find_movement(stock_id, kind, reference)
    }

    fn movements(&self, stock_id: StockId, after: u64) -> Result<Vec<StockMovement>, StoreError> {
        (**self).movements(stock_id, after)
    }

    fn commit(&self, work: UnitOfWork) -> Result<Vec<StockMovement>, StoreError> {
        (**self).commit(work)
    }
}
