//! ReservationManager: timed holds on stock for orders.
//!
//! A reservation moves `active -> fulfilled | expired | cancelled` exactly
//! once. Each transition runs under the stock row's lock together with the
//! ledger change it implies, and is committed with an expected-status guard,
//! so of two competing transitions only one can win.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use stockledger_core::{OrderId, ProductId, ReservationId, StockId, WarehouseId};
use stockledger_inventory::{
    ReservationStatus, StockError, StockMovement, StockReservation, quantity,
};

use crate::error::{EngineError, EngineResult};
use crate::ledger::StockLedger;
use crate::store::{InventoryStore, ReservationWrite};

/// Request to hold units of a product in a warehouse for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReservation {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub order_id: OrderId,
    pub quantity: i64,
    /// Falls back to the manager's default TTL.
    pub ttl: Option<Duration>,
}

/// Outcome of a cancel or expiry attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reservation", rename_all = "snake_case")]
pub enum Finalization {
    /// This call moved the reservation to its terminal status.
    Finalized(StockReservation),
    /// Someone else already did; nothing changed.
    AlreadyFinalized(StockReservation),
    /// Still active and not yet past `expires_at`.
    NotDue(StockReservation),
}

impl Finalization {
    pub fn reservation(&self) -> &StockReservation {
        match self {
            Finalization::Finalized(r)
            | Finalization::AlreadyFinalized(r)
            | Finalization::NotDue(r) => r,
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self, Finalization::Finalized(_))
    }
}

#[derive(Debug, Clone)]
pub struct ReservationManager<S> {
    store: S,
    ledger: StockLedger<S>,
    default_ttl: Duration,
}

impl<S: InventoryStore + Clone> ReservationManager<S> {
    pub fn new(store: S, ledger: StockLedger<S>, default_ttl: Duration) -> Self {
        Self {
            store,
            ledger,
            default_ttl,
        }
    }

    /// Reserve units and insert an `active` reservation, in one commit.
    ///
    /// # Errors
    ///
    /// Two variants mean "not enough units"; match both, or use
    /// [`EngineError::is_insufficient_stock`]:
    /// - [`StockError::InsufficientStock`] (in [`EngineError::Stock`]) when the
    ///   row exists but `available < quantity`
    /// - [`EngineError::NotStocked`] when the product has no row in the
    ///   warehouse at all, so there is no `stock_id` to report
    ///
    /// A second active reservation for the same order and row fails with
    /// [`EngineError::DuplicateReservation`].
    pub fn create_reservation(
        &self,
        request: CreateReservation,
        now: DateTime<Utc>,
    ) -> EngineResult<StockReservation> {
        let qty = quantity(request.quantity)?;
        let ttl = chrono::Duration::from_std(request.ttl.unwrap_or(self.default_ttl))
            .map_err(|_| StockError::validation("reservation ttl out of range"))?;
        let stock_id = self
            .ledger
            .find_stock(request.product_id, request.warehouse_id)?
            .ok_or(EngineError::NotStocked {
                product_id: request.product_id,
                warehouse_id: request.warehouse_id,
            })?
            .id_typed();
        let order_id = request.order_id;
        let reservation_id = ReservationId::new();

        let (reservation, _) = self.ledger.run_locked(&[stock_id], now, |tx| {
            if tx.store().find_active_reservation(stock_id, order_id)?.is_some() {
                return Err(EngineError::DuplicateReservation { stock_id, order_id });
            }
            let reservation =
                StockReservation::activate(reservation_id, stock_id, order_id, qty, ttl, tx.now())?;
            expect_fresh(tx.reserve(stock_id, qty, reservation_id)?, reservation_id)?;
            tx.stage_reservation(ReservationWrite::Insert(reservation.clone()));
            Ok(reservation)
        })?;

        info!(
            %reservation_id,
            %stock_id,
            %order_id,
            qty = qty.get(),
            expires_at = %reservation.expires_at(),
            "reservation created"
        );
        Ok(reservation)
    }

    /// Consume the held units and mark the reservation `fulfilled`.
    pub fn fulfill(&self, id: ReservationId, now: DateTime<Utc>) -> EngineResult<StockReservation> {
        let stock_id = self.reservation(id)?.stock_id();

        let (reservation, _) = self.ledger.run_locked(&[stock_id], now, |tx| {
            let mut reservation = tx.reservation(id)?;
            reservation.ensure_active()?;
            expect_fresh(
                tx.consume_reserved(stock_id, reservation.quantity(), id)?,
                id,
            )?;
            reservation.finalize(ReservationStatus::Fulfilled, tx.now())?;
            tx.stage_reservation(ReservationWrite::Transition {
                reservation: reservation.clone(),
                from: ReservationStatus::Active,
            });
            Ok(reservation)
        })?;

        info!(reservation_id = %id, %stock_id, qty = reservation.quantity().get(), "reservation fulfilled");
        Ok(reservation)
    }

    /// Release the held units and mark the reservation `cancelled`.
    ///
    /// Cancelling a reservation that is already terminal is not an error.
    pub fn cancel(&self, id: ReservationId, now: DateTime<Utc>) -> EngineResult<Finalization> {
        self.release(id, now, ReservationStatus::Cancelled)
    }

    /// Expire the reservation if it is still active and `expires_at <= now`.
    pub fn expire_if_due(&self, id: ReservationId, now: DateTime<Utc>) -> EngineResult<Finalization> {
        self.release(id, now, ReservationStatus::Expired)
    }

    pub fn reservation(&self, id: ReservationId) -> EngineResult<StockReservation> {
        self.store
            .get_reservation(id)?
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Active reservations on a row, oldest first.
    pub fn active_for_stock(&self, stock_id: StockId) -> EngineResult<Vec<StockReservation>> {
        Ok(self.store.active_reservations(stock_id)?)
    }

    /// Ids of active reservations past their deadline, earliest deadline first.
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<ReservationId>> {
        Ok(self.store.due_reservations(now, limit)?)
    }

    fn release(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
        to: ReservationStatus,
    ) -> EngineResult<Finalization> {
        let stock_id = self.reservation(id)?.stock_id();

        let (outcome, _) = self.ledger.run_locked(&[stock_id], now, |tx| {
            let mut reservation = tx.reservation(id)?;
            if !reservation.is_active() {
                return Ok(Finalization::AlreadyFinalized(reservation));
            }
            if to == ReservationStatus::Expired && !reservation.is_due(tx.now()) {
                return Ok(Finalization::NotDue(reservation));
            }
            expect_fresh(
                tx.release_reserved(stock_id, reservation.quantity(), id)?,
                id,
            )?;
            reservation.finalize(to, tx.now())?;
            tx.stage_reservation(ReservationWrite::Transition {
                reservation: reservation.clone(),
                from: ReservationStatus::Active,
            });
            Ok(Finalization::Finalized(reservation))
        })?;

        match &outcome {
            Finalization::Finalized(r) => {
                info!(reservation_id = %id, %stock_id, status = %r.status(), qty = r.quantity().get(), "reservation released")
            }
            Finalization::AlreadyFinalized(r) => {
                debug!(reservation_id = %id, status = %r.status(), "reservation already finalized")
            }
            Finalization::NotDue(r) => {
                debug!(reservation_id = %id, expires_at = %r.expires_at(), "reservation not yet due")
            }
        }
        Ok(outcome)
    }
}

/// An active reservation must not already have its movement on the ledger.
fn expect_fresh(prior: Option<StockMovement>, id: ReservationId) -> EngineResult<()> {
    match prior {
        None => Ok(()),
        Some(movement) => Err(StockError::invariant(format!(
            "reservation {id} is active but its {} movement (sequence {}) is already recorded",
            movement.kind, movement.sequence
        ))
        .into()),
    }
}
