//! Inventory domain module: stock rows, reservations and the movement ledger.
//!
//! This crate contains business rules for warehouse-scoped stock, implemented
//! purely as deterministic domain logic (no IO, no locking, no storage).

pub mod error;
pub mod movement;
pub mod reservation;
pub mod stock;
pub mod warehouse;

pub use error::{StockError, StockResult};
pub use movement::{
    MovementKind, MovementReference, NewMovement, Posting, ReferenceType, ReplayedTotals,
    StockMovement,
};
pub use reservation::{ReservationStatus, StockReservation};
pub use stock::{Stock, quantity};
pub use warehouse::{Warehouse, WarehouseDetails};
