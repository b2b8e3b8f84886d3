//! StockLedger: the only writer of `quantity` and `reserved`.
//!
//! Every operation runs the same cycle: lock the affected rows, load them,
//! apply the domain mutation, stage the movement it produced, and commit the
//! rows together with their movements. A version conflict at commit reloads
//! and re-runs the operation a bounded number of times.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use stockledger_core::{
    ExpectedVersion, OrderId, ProductId, Quantity, ReservationId, StockId, WarehouseId,
};
use stockledger_inventory::{
    MovementKind, MovementReference, NewMovement, Posting, ReferenceType, Stock, StockError,
    StockMovement, StockReservation, StockResult, quantity,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::locks::{RowLockGuard, RowLocks};
use crate::movements::MovementRecorder;
use crate::store::{InventoryStore, ReservationWrite, StockWrite, StoreError, UnitOfWork};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerConfig {
    pub lock_timeout: Duration,
    pub max_conflict_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        EngineConfig::default().into()
    }
}

impl From<EngineConfig> for LedgerConfig {
    fn from(config: EngineConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout,
            max_conflict_retries: config.max_conflict_retries,
        }
    }
}

/// Result of a single-row ledger operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockChange {
    /// Row state after the operation.
    pub stock: Stock,
    pub movement: StockMovement,
    /// The reference had already been applied; nothing was written.
    pub replayed: bool,
}

/// Result of a transfer between two rows of the same product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    pub source: Stock,
    pub destination: Stock,
    pub correlation_id: Uuid,
    /// Source leg first, then destination leg.
    pub movements: Vec<StockMovement>,
}

#[derive(Debug, Clone)]
pub struct StockLedger<S> {
    store: S,
    locks: Arc<RowLocks>,
    recorder: MovementRecorder<S>,
    config: LedgerConfig,
}

impl<S: InventoryStore + Clone> StockLedger<S> {
    pub fn new(store: S, locks: Arc<RowLocks>, config: LedgerConfig) -> Self {
        Self {
            recorder: MovementRecorder::new(store.clone()),
            store,
            locks,
            config,
        }
    }

    pub fn recorder(&self) -> &MovementRecorder<S> {
        &self.recorder
    }

    pub fn locks(&self) -> &Arc<RowLocks> {
        &self.locks
    }

    pub fn config(&self) -> LedgerConfig {
        self.config
    }

    pub fn stock(&self, stock_id: StockId) -> EngineResult<Stock> {
        self.store
            .get_stock(stock_id)?
            .ok_or(EngineError::StockNotFound(stock_id))
    }

    pub fn find_stock(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> EngineResult<Option<Stock>> {
        Ok(self.store.find_stock(product_id, warehouse_id)?)
    }

    /// Get or create the row for a product in a warehouse.
    ///
    /// New rows start at zero and may only be opened in an active warehouse.
    pub fn open_stock(&self, product_id: ProductId, warehouse_id: WarehouseId) -> EngineResult<Stock> {
        if let Some(stock) = self.store.find_stock(product_id, warehouse_id)? {
            return Ok(stock);
        }

        let warehouse = self
            .store
            .get_warehouse(warehouse_id)?
            .ok_or(EngineError::WarehouseNotFound(warehouse_id))?;
        if !warehouse.is_active() {
            return Err(EngineError::WarehouseInactive(warehouse_id));
        }

        let stock = Stock::open(StockId::new(), product_id, warehouse_id, Utc::now());
        match self.store.commit(UnitOfWork::open_stock(stock.clone())) {
            Ok(_) => {
                info!(stock_id = %stock.id_typed(), %product_id, %warehouse_id, "stock row opened");
                Ok(stock)
            }
            // The warehouse changed after the check above.
            Err(StoreError::NotFound(_)) => Err(EngineError::WarehouseNotFound(warehouse_id)),
            Err(StoreError::Conflict(_)) => Err(EngineError::WarehouseInactive(warehouse_id)),
            // Lost the race to another opener; theirs is the row.
            Err(StoreError::Duplicate(_)) => self
                .store
                .find_stock(product_id, warehouse_id)?
                .ok_or(EngineError::NotStocked {
                    product_id,
                    warehouse_id,
                }),
            Err(err) => Err(err.into()),
        }
    }

    /// Goods received: `quantity += qty`, recorded as an `in` movement.
    pub fn receive(
        &self,
        stock_id: StockId,
        qty: i64,
        reason: Option<String>,
    ) -> EngineResult<StockChange> {
        let qty = quantity(qty)?;
        self.single_change(stock_id, |tx| tx.receive(stock_id, qty, None, reason.clone()))
    }

    /// Unreserved units leave the warehouse, recorded as an `out` movement.
    ///
    /// With a reference, a second call for the same reference returns the
    /// recorded movement and leaves the row alone.
    pub fn consume(
        &self,
        stock_id: StockId,
        qty: i64,
        reference: Option<MovementReference>,
    ) -> EngineResult<StockChange> {
        let qty = quantity(qty)?;
        if reference.is_some_and(|r| r.kind == ReferenceType::Reservation) {
            return Err(StockError::validation(
                "reserved units are consumed by fulfilling their reservation",
            )
            .into());
        }
        self.single_change(stock_id, |tx| tx.consume(stock_id, qty, reference, None))
    }

    /// Convenience for consuming against an order reference.
    pub fn consume_for_order(
        &self,
        stock_id: StockId,
        qty: i64,
        order_id: OrderId,
    ) -> EngineResult<StockChange> {
        self.consume(stock_id, qty, Some(MovementReference::order(order_id)))
    }

    /// Signed stocktake correction, recorded as an `adjust` movement.
    pub fn adjust(
        &self,
        stock_id: StockId,
        delta: i64,
        reason: Option<String>,
    ) -> EngineResult<StockChange> {
        self.single_change(stock_id, |tx| tx.adjust(stock_id, delta, None, reason.clone()))
    }

    /// Stocktake correction tied to a count document.
    ///
    /// Re-submitting the same document for the row returns the recorded
    /// movement with `replayed` set and leaves the row alone.
    pub fn adjust_for_document(
        &self,
        stock_id: StockId,
        delta: i64,
        document_id: Uuid,
        reason: Option<String>,
    ) -> EngineResult<StockChange> {
        let reference = Some(MovementReference::adjustment(document_id));
        self.single_change(stock_id, |tx| tx.adjust(stock_id, delta, reference, reason.clone()))
    }

    /// Move unreserved units between two rows of the same product.
    ///
    /// Both rows are locked in id order; the two `transfer` movements share a
    /// correlation id and commit together or not at all.
    pub fn transfer(
        &self,
        from: StockId,
        to: StockId,
        qty: i64,
        reason: Option<String>,
    ) -> EngineResult<TransferReceipt> {
        if from == to {
            return Err(StockError::validation("transfer source and destination must differ").into());
        }
        let qty = quantity(qty)?;
        let correlation_id = Uuid::now_v7();

        let ((source, destination), movements) = self.run_locked(&[from, to], Utc::now(), |tx| {
            let source = tx.stock(from)?;
            let destination = tx.stock(to)?;
            if source.product_id() != destination.product_id() {
                return Err(StockError::validation(format!(
                    "cannot transfer product {} into a row holding product {}",
                    source.product_id(),
                    destination.product_id()
                ))
                .into());
            }
            tx.transfer(from, to, qty, correlation_id, reason.clone())?;
            Ok((tx.stock(from)?, tx.stock(to)?))
        })?;

        info!(%from, %to, qty = qty.get(), %correlation_id, "stock transferred");
        Ok(TransferReceipt {
            source,
            destination,
            correlation_id,
            movements,
        })
    }

    fn single_change<F>(&self, stock_id: StockId, mut f: F) -> EngineResult<StockChange>
    where
        F: FnMut(&mut LedgerTx<'_, S>) -> EngineResult<Option<StockMovement>>,
    {
        let ((prior, stock), recorded) = self.run_locked(&[stock_id], Utc::now(), |tx| {
            let prior = f(tx)?;
            Ok((prior, tx.stock(stock_id)?))
        })?;

        let (movement, replayed) = match prior {
            Some(prior) => (prior, true),
            None => {
                let movement = recorded
                    .into_iter()
                    .next()
                    .ok_or_else(|| StockError::invariant("ledger commit recorded no movement"))?;
                (movement, false)
            }
        };
        info!(
            %stock_id,
            kind = %movement.kind,
            delta = movement.quantity,
            replayed,
            "stock updated"
        );
        Ok(StockChange {
            stock,
            movement,
            replayed,
        })
    }

    /// Run `f` with `rows` locked and commit what it staged.
    ///
    /// `f` may run more than once: a version conflict or duplicate at commit
    /// discards the staged work and retries on freshly loaded rows, up to
    /// `max_conflict_retries` times. Rows not in `rows` may still be loaded as
    /// long as they sort after every row already held.
    pub(crate) fn run_locked<T, F>(
        &self,
        rows: &[StockId],
        now: DateTime<Utc>,
        f: F,
    ) -> EngineResult<(T, Vec<StockMovement>)>
    where
        F: FnMut(&mut LedgerTx<'_, S>) -> EngineResult<T>,
    {
        self.run_attempts(rows, now, f).map_err(|err| match err {
            // A database-side lock, statement or pool wait ran out under our row lock.
            EngineError::Store(StoreError::Timeout(msg)) => match rows.iter().min() {
                Some(&stock_id) => {
                    debug!(%stock_id, error = %msg, "store wait timed out");
                    EngineError::LockTimeout {
                        stock_id,
                        waited: self.config.lock_timeout,
                    }
                }
                None => EngineError::Store(StoreError::Timeout(msg)),
            },
            other => other,
        })
    }

    fn run_attempts<T, F>(
        &self,
        rows: &[StockId],
        now: DateTime<Utc>,
        mut f: F,
    ) -> EngineResult<(T, Vec<StockMovement>)>
    where
        F: FnMut(&mut LedgerTx<'_, S>) -> EngineResult<T>,
    {
        let mut guard = self
            .locks
            .acquire(rows.iter().copied(), self.config.lock_timeout)?;

        let mut attempt = 0u32;
        loop {
            let mut tx = LedgerTx::new(&self.store, &self.recorder, &mut guard, now);
            let value = f(&mut tx)?;
            let work = tx.into_work();
            if work.is_empty() {
                return Ok((value, Vec::new()));
            }

            match self.store.commit(work) {
                Ok(recorded) => return Ok((value, recorded)),
                Err(StoreError::Conflict(msg) | StoreError::Duplicate(msg))
                    if attempt < self.config.max_conflict_retries =>
                {
                    attempt += 1;
                    debug!(attempt, error = %msg, "ledger commit conflicted; retrying");
                }
                Err(StoreError::Conflict(msg)) => return Err(EngineError::Conflict(msg)),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[derive(Debug)]
struct LoadedRow {
    stock: Stock,
    expected: ExpectedVersion,
    dirty: bool,
}

/// One attempt of a locked ledger operation.
///
/// Mutations apply to in-memory copies of the rows and stage their movements;
/// nothing reaches the store until the surrounding `run_locked` commits.
pub(crate) struct LedgerTx<'a, S> {
    store: &'a S,
    recorder: &'a MovementRecorder<S>,
    guard: &'a mut RowLockGuard,
    now: DateTime<Utc>,
    rows: BTreeMap<StockId, LoadedRow>,
    work: UnitOfWork,
}

impl<'a, S: InventoryStore> LedgerTx<'a, S> {
    fn new(
        store: &'a S,
        recorder: &'a MovementRecorder<S>,
        guard: &'a mut RowLockGuard,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            recorder,
            guard,
            now,
            rows: BTreeMap::new(),
            work: UnitOfWork::new(),
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn store(&self) -> &S {
        self.store
    }

    fn row(&mut self, stock_id: StockId) -> EngineResult<&mut LoadedRow> {
        if !self.rows.contains_key(&stock_id) {
            if !self.guard.holds(stock_id) {
                self.guard.extend(stock_id)?;
            }
            let stock = self
                .store
                .get_stock(stock_id)?
                .ok_or(EngineError::StockNotFound(stock_id))?;
            self.rows.insert(
                stock_id,
                LoadedRow {
                    expected: ExpectedVersion::Exact(stock.version()),
                    stock,
                    dirty: false,
                },
            );
        }
        self.rows
            .get_mut(&stock_id)
            .ok_or(EngineError::StockNotFound(stock_id))
    }

    /// Current state of a row as seen by this attempt, staged changes included.
    pub(crate) fn stock(&mut self, stock_id: StockId) -> EngineResult<Stock> {
        Ok(self.row(stock_id)?.stock.clone())
    }

    pub(crate) fn receive(
        &mut self,
        stock_id: StockId,
        qty: Quantity,
        reference: Option<MovementReference>,
        reason: Option<String>,
    ) -> EngineResult<Option<StockMovement>> {
        self.post(stock_id, MovementKind::In, reference, reason, |s, now| s.receive(qty, now))
    }

    pub(crate) fn consume(
        &mut self,
        stock_id: StockId,
        qty: Quantity,
        reference: Option<MovementReference>,
        reason: Option<String>,
    ) -> EngineResult<Option<StockMovement>> {
        self.post(stock_id, MovementKind::Out, reference, reason, |s, now| s.consume(qty, now))
    }

    /// Units held by a reservation leave the warehouse.
    pub(crate) fn consume_reserved(
        &mut self,
        stock_id: StockId,
        qty: Quantity,
        reservation_id: ReservationId,
    ) -> EngineResult<Option<StockMovement>> {
        let reference = MovementReference::reservation(reservation_id);
        self.post(stock_id, MovementKind::Out, Some(reference), None, |s, now| {
            s.consume_reserved(qty, now)
        })
    }

    pub(crate) fn reserve(
        &mut self,
        stock_id: StockId,
        qty: Quantity,
        reservation_id: ReservationId,
    ) -> EngineResult<Option<StockMovement>> {
        let reference = MovementReference::reservation(reservation_id);
        self.post(stock_id, MovementKind::Reserve, Some(reference), None, |s, now| {
            s.reserve(qty, now)
        })
    }

    pub(crate) fn release_reserved(
        &mut self,
        stock_id: StockId,
        qty: Quantity,
        reservation_id: ReservationId,
    ) -> EngineResult<Option<StockMovement>> {
        let reference = MovementReference::reservation(reservation_id);
        self.post(stock_id, MovementKind::Release, Some(reference), None, |s, now| {
            s.release(qty, now)
        })
    }

    pub(crate) fn adjust(
        &mut self,
        stock_id: StockId,
        delta: i64,
        reference: Option<MovementReference>,
        reason: Option<String>,
    ) -> EngineResult<Option<StockMovement>> {
        self.post(stock_id, MovementKind::Adjust, reference, reason, |s, now| s.adjust(delta, now))
    }

    fn transfer(
        &mut self,
        from: StockId,
        to: StockId,
        qty: Quantity,
        correlation_id: Uuid,
        reason: Option<String>,
    ) -> EngineResult<()> {
        let reference = Some(MovementReference::transfer(correlation_id));
        self.post(from, MovementKind::Transfer, reference, reason.clone(), |s, now| {
            s.transfer_out(qty, now)
        })?;
        self.post(to, MovementKind::Transfer, reference, reason, |s, now| s.transfer_in(qty, now))?;
        Ok(())
    }

    pub(crate) fn reservation(&self, id: ReservationId) -> EngineResult<StockReservation> {
        self.store
            .get_reservation(id)?
            .ok_or(EngineError::ReservationNotFound(id))
    }

    pub(crate) fn stage_reservation(&mut self, write: ReservationWrite) {
        self.work.reservations.push(write);
    }

    /// Apply one mutation to a loaded row and stage its movement.
    ///
    /// Returns the previously recorded movement, untouched, when `reference`
    /// was already applied with the same kind on this row.
    fn post<M>(
        &mut self,
        stock_id: StockId,
        kind: MovementKind,
        reference: Option<MovementReference>,
        reason: Option<String>,
        mutate: M,
    ) -> EngineResult<Option<StockMovement>>
    where
        M: FnOnce(&mut Stock, DateTime<Utc>) -> StockResult<Posting>,
    {
        let mut next = self.row(stock_id)?.stock.clone();

        if let Some(reference) = &reference {
            if let Some(prior) = self.recorder.find_by_reference(stock_id, kind, reference)? {
                debug!(%stock_id, %kind, reference_id = %reference.id, "reference already applied");
                return Ok(Some(prior));
            }
        }

        let posting = mutate(&mut next, self.now)?;
        if posting.kind != kind {
            return Err(StockError::invariant(format!(
                "expected a {kind} posting, got {}",
                posting.kind
            ))
            .into());
        }
        let movement = NewMovement::from_posting(stock_id, posting, reference, reason, self.now);
        self.recorder.record(&mut self.work, movement)?;

        let row = self.row(stock_id)?;
        row.stock = next;
        row.dirty = true;
        Ok(None)
    }

    fn into_work(self) -> UnitOfWork {
        let mut work = self.work;
        work.stocks = self
            .rows
            .into_values()
            .filter(|row| row.dirty)
            .map(|row| StockWrite {
                stock: row.stock,
                expected: row.expected,
            })
            .collect();
        work
    }
}
