//! Stock movements: the append-only audit trail of every quantity change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{MovementId, OrderId, ReservationId, StockId};

use crate::error::{StockError, StockResult};

pub const MAX_REASON_LEN: usize = 255;

/// Kind of stock-affecting event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    In,
    Out,
    Adjust,
    Transfer,
    Reserve,
    Release,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::In => "in",
            MovementKind::Out => "out",
            MovementKind::Adjust => "adjust",
            MovementKind::Transfer => "transfer",
            MovementKind::Reserve => "reserve",
            MovementKind::Release => "release",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(MovementKind::In),
            "out" => Some(MovementKind::Out),
            "adjust" => Some(MovementKind::Adjust),
            "transfer" => Some(MovementKind::Transfer),
            "reserve" => Some(MovementKind::Reserve),
            "release" => Some(MovementKind::Release),
            _ => None,
        }
    }

    /// Whether the delta applies to `reserved` rather than `quantity`.
    pub fn affects_reserved(&self) -> bool {
        matches!(self, MovementKind::Reserve | MovementKind::Release)
    }

    fn accepts_delta(&self, delta: i64) -> bool {
        match self {
            MovementKind::In | MovementKind::Reserve => delta > 0,
            MovementKind::Out | MovementKind::Release => delta < 0,
            MovementKind::Adjust | MovementKind::Transfer => delta != 0,
        }
    }
}

impl core::fmt::Display for MovementKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a movement's `reference_id` points at.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Order,
    Reservation,
    Transfer,
    Adjustment,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Order => "order",
            ReferenceType::Reservation => "reservation",
            ReferenceType::Transfer => "transfer",
            ReferenceType::Adjustment => "adjustment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "order" => Some(ReferenceType::Order),
            "reservation" => Some(ReferenceType::Reservation),
            "transfer" => Some(ReferenceType::Transfer),
            "adjustment" => Some(ReferenceType::Adjustment),
            _ => None,
        }
    }
}

/// External reference carried by a movement.
///
/// `(stock_id, kind, reference)` identifies an operation: a second movement
/// with the same triple is a replay and must not be applied again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MovementReference {
    pub id: Uuid,
    pub kind: ReferenceType,
}

impl MovementReference {
    pub fn order(order_id: OrderId) -> Self {
        Self {
            id: order_id.into(),
            kind: ReferenceType::Order,
        }
    }

    pub fn reservation(reservation_id: ReservationId) -> Self {
        Self {
            id: reservation_id.into(),
            kind: ReferenceType::Reservation,
        }
    }

    /// Correlation id shared by both legs of a transfer.
    pub fn transfer(correlation_id: Uuid) -> Self {
        Self {
            id: correlation_id,
            kind: ReferenceType::Transfer,
        }
    }

    pub fn adjustment(document_id: Uuid) -> Self {
        Self {
            id: document_id,
            kind: ReferenceType::Adjustment,
        }
    }
}

/// The `(kind, delta)` a stock mutation produces for the ledger to record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Posting {
    pub kind: MovementKind,
    pub delta: i64,
}

/// A movement staged for commit (not yet assigned a sequence number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMovement {
    pub id: MovementId,
    pub stock_id: StockId,
    pub kind: MovementKind,
    pub quantity: i64,
    pub reference: Option<MovementReference>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewMovement {
    pub fn from_posting(
        stock_id: StockId,
        posting: Posting,
        reference: Option<MovementReference>,
        reason: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MovementId::new(),
            stock_id,
            kind: posting.kind,
            quantity: posting.delta,
            reference,
            reason,
            created_at,
        }
    }

    /// Check the shape of the entry before it is written.
    pub fn validate(&self) -> StockResult<()> {
        if !self.kind.accepts_delta(self.quantity) {
            return Err(StockError::invariant(format!(
                "{} movement cannot carry delta {}",
                self.kind, self.quantity
            )));
        }
        if let Some(reason) = &self.reason {
            if reason.chars().count() > MAX_REASON_LEN {
                return Err(StockError::validation(format!(
                    "movement reason exceeds {MAX_REASON_LEN} characters"
                )));
            }
        }
        Ok(())
    }

    /// Attach the commit-order position assigned by the store.
    pub fn into_recorded(self, sequence: u64) -> StockMovement {
        StockMovement {
            id: self.id,
            stock_id: self.stock_id,
            sequence,
            kind: self.kind,
            quantity: self.quantity,
            reference: self.reference,
            reason: self.reason,
            created_at: self.created_at,
        }
    }
}

/// An immutable, committed ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub stock_id: StockId,
    /// Position in the stock row's movement stream (1-based, gap-free per row).
    pub sequence: u64,
    pub kind: MovementKind,
    /// Signed delta; applies to `reserved` for reserve/release, to `quantity` otherwise.
    pub quantity: i64,
    pub reference: Option<MovementReference>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn matches(&self, kind: MovementKind, reference: &MovementReference) -> bool {
        self.kind == kind && self.reference.as_ref() == Some(reference)
    }
}

/// `(quantity, reserved)` rebuilt from a movement stream.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayedTotals {
    pub quantity: i64,
    pub reserved: i64,
    pub movements: u64,
    pub last_sequence: u64,
}

impl ReplayedTotals {
    /// Fold movements from genesis, in sequence order.
    ///
    /// `out` movements produced by fulfilling a reservation also lower
    /// `reserved`; they are recognised by their reservation reference.
    pub fn fold<'a>(movements: impl IntoIterator<Item = &'a StockMovement>) -> Self {
        movements.into_iter().fold(Self::default(), |mut acc, m| {
            if m.kind.affects_reserved() {
                acc.reserved += m.quantity;
            } else {
                acc.quantity += m.quantity;
                let from_reservation = m
                    .reference
                    .is_some_and(|r| r.kind == ReferenceType::Reservation);
                if m.kind == MovementKind::Out && from_reservation {
                    acc.reserved += m.quantity;
                }
            }
            acc.movements += 1;
            acc.last_sequence = m.sequence;
            acc
        })
    }
}
