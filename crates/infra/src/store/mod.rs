//! Persistence boundary for warehouses, stock rows, reservations and movements.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryInventoryStore;
pub use postgres::PostgresInventoryStore;
pub use r#trait::{
    InventoryStore, ReservationWrite, StockWrite, StoreError, UnitOfWork, WarehouseChange,
};
