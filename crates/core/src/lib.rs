//! `stockledger-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers, the domain error model, optimistic version
//! expectations and validated value objects.

pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;
pub mod version;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{MovementId, OrderId, ProductId, ReservationId, StockId, WarehouseId};
pub use value_object::{Quantity, ValueObject};
pub use version::ExpectedVersion;
