//! Persisted rows with a stable identity.

use chrono::{DateTime, Utc};

/// A row identified by a typed id that outlives its state changes.
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    /// Set once at first insert, never rewritten.
    fn created_at(&self) -> DateTime<Utc>;
}
