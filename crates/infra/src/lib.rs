//! Infrastructure layer: persistence, row locking and the engine services
//! (stock ledger, reservations, movement audit, expiry sweeping).

pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod movements;
pub mod reservations;
pub mod store;
pub mod sweeper;
pub mod warehouses;

#[cfg(test)]
mod integration_tests;

pub use config::{DatabaseConfig, EngineConfig};
pub use engine::InventoryEngine;
pub use error::{EngineError, EngineResult};
pub use ledger::{LedgerConfig, StockChange, StockLedger, TransferReceipt};
pub use locks::{LockError, RowLockGuard, RowLocks};
pub use movements::{MovementRecorder, Reconciliation};
pub use reservations::{CreateReservation, Finalization, ReservationManager};
pub use store::{
    InMemoryInventoryStore, InventoryStore, PostgresInventoryStore, StoreError, UnitOfWork,
    WarehouseChange,
};
pub use sweeper::{ExpirySweeper, SweepReport, SweeperConfig, SweeperHandle, SweeperStats};
pub use warehouses::WarehouseRegistry;
