use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{Entity, OrderId, Quantity, ReservationId, StockId};

use crate::error::{StockError, StockResult};

/// Lifecycle of a reservation.
///
/// `Active` is the only entry state; the other three are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Fulfilled,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Fulfilled => "fulfilled",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ReservationStatus::Active),
            "fulfilled" => Some(ReservationStatus::Fulfilled),
            "expired" => Some(ReservationStatus::Expired),
            "cancelled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }
}

impl core::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timed hold on stock units for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReservation {
    id: ReservationId,
    stock_id: StockId,
    order_id: OrderId,
    quantity: Quantity,
    expires_at: DateTime<Utc>,
    status: ReservationStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StockReservation {
    /// A new active reservation expiring `ttl` after `now`.
    pub fn activate(
        id: ReservationId,
        stock_id: StockId,
        order_id: OrderId,
        quantity: Quantity,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StockResult<Self> {
        if ttl <= Duration::zero() {
            return Err(StockError::validation("reservation ttl must be positive"));
        }
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| StockError::validation("reservation ttl out of range"))?;
        Ok(Self {
            id,
            stock_id,
            order_id,
            quantity,
            expires_at,
            status: ReservationStatus::Active,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuild a reservation from persisted columns.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: ReservationId,
        stock_id: StockId,
        order_id: OrderId,
        quantity: Quantity,
        expires_at: DateTime<Utc>,
        status: ReservationStatus,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            stock_id,
            order_id,
            quantity,
            expires_at,
            status,
            created_at,
            updated_at,
        }
    }

    pub fn id_typed(&self) -> ReservationId {
        self.id
    }

    pub fn stock_id(&self) -> StockId {
        self.stock_id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn status(&self) -> ReservationStatus {
        self.status
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.expires_at <= now
    }

    pub fn ensure_active(&self) -> StockResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StockError::ReservationNotActive {
                id: self.id,
                status: self.status,
            })
        }
    }

    /// Move an active reservation to a terminal status (exactly once).
    pub fn finalize(&mut self, to: ReservationStatus, now: DateTime<Utc>) -> StockResult<()> {
        self.ensure_active()?;
        if !to.is_terminal() {
            return Err(StockError::invariant(format!(
                "reservation {} cannot transition to {}",
                self.id, to
            )));
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for StockReservation {
    type Id = ReservationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
