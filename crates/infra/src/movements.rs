//! MovementRecorder: staging and audit reads over the append-only movement ledger.

use serde::Serialize;

use stockledger_core::{MovementId, StockId};
use stockledger_inventory::{
    MovementKind, MovementReference, NewMovement, ReplayedTotals, StockMovement,
};

use crate::error::{EngineError, EngineResult};
use crate::store::{InventoryStore, UnitOfWork};

/// Outcome of comparing a stock row against its own movement history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub stock_id: StockId,
    pub recorded_quantity: i64,
    pub recorded_reserved: i64,
    pub replayed: ReplayedTotals,
    /// Sum of `quantity` over the row's active reservations.
    pub active_reserved: i64,
    pub consistent: bool,
}

/// Append-only ledger of stock-affecting events.
///
/// Movements are only ever staged into a [`UnitOfWork`]; they become visible
/// when the owning operation commits and are never changed afterwards.
#[derive(Debug, Clone)]
pub struct MovementRecorder<S> {
    store: S,
}

impl<S: InventoryStore> MovementRecorder<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Validate a movement and stage it for the caller's commit.
    pub fn record(&self, work: &mut UnitOfWork, movement: NewMovement) -> EngineResult<MovementId> {
        movement.validate()?;
        let id = movement.id;
        work.movements.push(movement);
        Ok(id)
    }

    /// Movements of a row with `sequence > since`, in commit order.
    pub fn list_by_stock(&self, stock_id: StockId, since: u64) -> EngineResult<Vec<StockMovement>> {
        Ok(self.store.movements(stock_id, since)?)
    }

    pub fn find_by_reference(
        &self,
        stock_id: StockId,
        kind: MovementKind,
        reference: &MovementReference,
    ) -> EngineResult<Option<StockMovement>> {
        Ok(self.store.find_movement(stock_id, kind, reference)?)
    }

    /// Rebuild `(quantity, reserved)` by folding the row's movements from genesis.
    pub fn replay(&self, stock_id: StockId) -> EngineResult<ReplayedTotals> {
        let movements = self.store.movements(stock_id, 0)?;
        Ok(ReplayedTotals::fold(&movements))
    }

    /// Check the stored row against its replayed history and its active reservations.
    pub fn reconcile(&self, stock_id: StockId) -> EngineResult<Reconciliation> {
        let stock = self
            .store
            .get_stock(stock_id)?
            .ok_or(EngineError::StockNotFound(stock_id))?;
        let replayed = self.replay(stock_id)?;
        let active_reserved = self
            .store
            .active_reservations(stock_id)?
            .iter()
            .map(|r| r.quantity().get())
            .sum();

        let consistent = replayed.quantity == stock.quantity()
            && replayed.reserved == stock.reserved()
            && active_reserved == stock.reserved();

        Ok(Reconciliation {
            stock_id,
            recorded_quantity: stock.quantity(),
            recorded_reserved: stock.reserved(),
            replayed,
            active_reserved,
            consistent,
        })
    }
}
