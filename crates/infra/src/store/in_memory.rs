use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use stockledger_core::{Entity, OrderId, ProductId, ReservationId, StockId, WarehouseId};
use stockledger_inventory::{
    MovementKind, MovementReference, ReservationStatus, Stock, StockMovement, StockReservation,
    Warehouse,
};

use super::r#trait::{InventoryStore, ReservationWrite, StoreError, UnitOfWork, WarehouseChange};

#[derive(Debug, Default)]
struct Tables {
    warehouses: HashMap<WarehouseId, Warehouse>,
    stocks: HashMap<StockId, Stock>,
    stock_index: HashMap<(ProductId, WarehouseId), StockId>,
    movements: HashMap<StockId, Vec<StockMovement>>,
    reservations: HashMap<ReservationId, StockReservation>,
}

impl Tables {
    fn stream_len(&self, stock_id: StockId) -> u64 {
        self.movements.get(&stock_id).map_or(0, |m| m.len() as u64)
    }

    fn has_movement(&self, stock_id: StockId, kind: MovementKind, reference: &MovementReference) -> bool {
        self.movements
            .get(&stock_id)
            .is_some_and(|stream| stream.iter().any(|m| m.matches(kind, reference)))
    }

    fn active_for(&self, stock_id: StockId, order_id: OrderId) -> Option<&StockReservation> {
        self.reservations
            .values()
            .find(|r| r.is_active() && r.stock_id() == stock_id && r.order_id() == order_id)
    }

    /// Reject the unit of work if any check fails; nothing is written here.
    fn validate(&self, work: &UnitOfWork) -> Result<(), StoreError> {
        let mut new_pairs = HashSet::new();
        for write in &work.stocks {
            let id = *write.stock.id();
            let current = self.stocks.get(&id).map(Stock::version);
            write
                .expected
                .check(current)
                .map_err(|err| StoreError::Conflict(format!("stock {id}: {err}")))?;
            if current.is_none() {
                let warehouse_id = write.stock.warehouse_id();
                match self.warehouses.get(&warehouse_id) {
                    None => {
                        return Err(StoreError::NotFound(format!("warehouse {warehouse_id}")));
                    }
                    Some(w) if !w.is_active() => {
                        return Err(StoreError::Conflict(format!(
                            "warehouse {warehouse_id} is inactive"
                        )));
                    }
                    Some(_) => {}
                }
                let pair = (write.stock.product_id(), warehouse_id);
                if self.stock_index.contains_key(&pair) || !new_pairs.insert(pair) {
                    return Err(StoreError::Duplicate(format!(
                        "stock for product {} in warehouse {} already exists",
                        pair.0, pair.1
                    )));
                }
            }
        }

        let written: HashSet<StockId> = work.stocks.iter().map(|w| *w.stock.id()).collect();
        let mut staged_refs = HashSet::new();
        for m in &work.movements {
            if !self.stocks.contains_key(&m.stock_id) && !written.contains(&m.stock_id) {
                return Err(StoreError::NotFound(format!("stock {}", m.stock_id)));
            }
            if let Some(reference) = m.reference {
                let key = (m.stock_id, m.kind, reference);
                if self.has_movement(m.stock_id, m.kind, &reference) || !staged_refs.insert(key) {
                    return Err(StoreError::Duplicate(format!(
                        "{} movement for {:?} {} already recorded on stock {}",
                        m.kind, reference.kind, reference.id, m.stock_id
                    )));
                }
            }
        }

        let mut new_active = HashSet::new();
        for write in &work.reservations {
            match write {
                ReservationWrite::Insert(r) => {
                    if self.reservations.contains_key(r.id())
                        || self.active_for(r.stock_id(), r.order_id()).is_some()
                        || !new_active.insert((r.stock_id(), r.order_id()))
                    {
                        return Err(StoreError::Duplicate(format!(
                            "active reservation for order {} on stock {}",
                            r.order_id(),
                            r.stock_id()
                        )));
                    }
                }
                ReservationWrite::Transition { reservation, from } => {
                    let stored = self
                        .reservations
                        .get(reservation.id())
                        .ok_or_else(|| StoreError::NotFound(format!("reservation {}", reservation.id())))?;
                    if stored.status() != *from {
                        return Err(StoreError::Conflict(format!(
                            "reservation {}: expected status {}, found {}",
                            reservation.id(),
                            from,
                            stored.status()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// In-memory inventory store.
///
/// Intended for tests/dev. A single lock over all tables makes every commit
/// trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryInventoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

impl InventoryStore for InMemoryInventoryStore {
    fn insert_warehouse(&self, warehouse: &Warehouse) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if tables.warehouses.contains_key(warehouse.id())
            || tables.warehouses.values().any(|w| w.code() == warehouse.code())
        {
            return Err(StoreError::Duplicate(format!(
                "warehouse code '{}'",
                warehouse.code()
            )));
        }
        tables.warehouses.insert(*warehouse.id(), warehouse.clone());
        Ok(())
    }

    fn update_warehouse(
        &self,
        warehouse: &Warehouse,
        change: WarehouseChange,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let id = *warehouse.id();
        if !tables.warehouses.contains_key(&id) {
            return Err(StoreError::NotFound(format!("warehouse {id}")));
        }
        if change == WarehouseChange::Details
            && tables.stocks.values().any(|s| s.warehouse_id() == id)
        {
            return Err(StoreError::Conflict(format!(
                "warehouse {id} is referenced by stock"
            )));
        }
        if tables
            .warehouses
            .values()
            .any(|w| w.id() != warehouse.id() && w.code() == warehouse.code())
        {
            return Err(StoreError::Duplicate(format!(
                "warehouse code '{}'",
                warehouse.code()
            )));
        }
        tables.warehouses.insert(*warehouse.id(), warehouse.clone());
        Ok(())
    }

    fn get_warehouse(&self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
        Ok(self.read()?.warehouses.get(&id).cloned())
    }

    fn warehouse_is_referenced(&self, id: WarehouseId) -> Result<bool, StoreError> {
        Ok(self
            .read()?
            .stocks
            .values()
            .any(|s| s.warehouse_id() == id))
    }

    fn get_stock(&self, id: StockId) -> Result<Option<Stock>, StoreError> {
        Ok(self.read()?.stocks.get(&id).cloned())
    }

    fn find_stock(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Stock>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .stock_index
            .get(&(product_id, warehouse_id))
            .and_then(|id| tables.stocks.get(id))
            .cloned())
    }

    fn get_reservation(&self, id: ReservationId) -> Result<Option<StockReservation>, StoreError> {
        Ok(self.read()?.reservations.get(&id).cloned())
    }

    fn find_active_reservation(
        &self,
        stock_id: StockId,
        order_id: OrderId,
    ) -> Result<Option<StockReservation>, StoreError> {
        Ok(self.read()?.active_for(stock_id, order_id).cloned())
    }

    fn active_reservations(&self, stock_id: StockId) -> Result<Vec<StockReservation>, StoreError> {
        let tables = self.read()?;
        let mut active: Vec<_> = tables
            .reservations
            .values()
            .filter(|r| r.is_active() && r.stock_id() == stock_id)
            .cloned()
            .collect();
        active.sort_by_key(|r| (r.created_at(), r.id_typed()));
        Ok(active)
    }

    fn due_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReservationId>, StoreError> {
        let tables = self.read()?;
        let mut due: Vec<_> = tables
            .reservations
            .values()
            .filter(|r| r.is_due(now))
            .collect();
        due.sort_by_key(|r| (r.expires_at(), r.id_typed()));
        Ok(due.into_iter().take(limit).map(|r| r.id_typed()).collect())
    }

    fn find_movement(
        &self,
        stock_id: StockId,
        kind: MovementKind,
        reference: &MovementReference,
    ) -> Result<Option<StockMovement>, StoreError> {
        Ok(self.read()?.movements.get(&stock_id).and_then(|stream| {
            stream.iter().find(|m| m.matches(kind, reference)).cloned()
        }))
    }

    fn movements(&self, stock_id: StockId, after: u64) -> Result<Vec<StockMovement>, StoreError> {
        Ok(self
            .read()?
            .movements
            .get(&stock_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|m| m.sequence > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn commit(&self, work: UnitOfWork) -> Result<Vec<StockMovement>, StoreError> {
        let mut tables = self.write()?;
        tables.validate(&work)?;

        for write in work.stocks {
            let stock = write.stock;
            tables
                .stock_index
                .insert((stock.product_id(), stock.warehouse_id()), *stock.id());
            tables.stocks.insert(*stock.id(), stock);
        }

        let mut recorded = Vec::with_capacity(work.movements.len());
        for m in work.movements {
            let sequence = tables.stream_len(m.stock_id) + 1;
            let movement = m.into_recorded(sequence);
            tables
                .movements
                .entry(movement.stock_id)
                .or_default()
                .push(movement.clone());
            recorded.push(movement);
        }

        for write in work.reservations {
            let reservation = match write {
                ReservationWrite::Insert(r) => r,
                ReservationWrite::Transition { reservation, .. } => reservation,
            };
            tables.reservations.insert(*reservation.id(), reservation);
        }

        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use stockledger_core::{ExpectedVersion, MovementId};
    use stockledger_inventory::{NewMovement, WarehouseDetails, quantity};

    use crate::store::StockWrite;

    fn opened(store: &InMemoryInventoryStore) -> Stock {
        let warehouse = Warehouse::register(
            WarehouseId::new(),
            WarehouseDetails {
                name: "Main".into(),
                code: format!("WH-{}", WarehouseId::new()),
                address: None,
            },
            Utc::now(),
        )
        .unwrap();
        store.insert_warehouse(&warehouse).unwrap();
        let stock = Stock::open(StockId::new(), ProductId::new(), warehouse.id_typed(), Utc::now());
        store.commit(UnitOfWork::open_stock(stock.clone())).unwrap();
        stock
    }

    fn movement(stock_id: StockId, kind: MovementKind, delta: i64, reference: Option<MovementReference>) -> NewMovement {
        NewMovement {
            id: MovementId::new(),
            stock_id,
            kind,
            quantity: delta,
            reference,
            reason: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn stale_version_rejects_whole_unit_of_work() {
        let store = InMemoryInventoryStore::new();
        let stock = opened(&store);

        let mut received = stock.clone();
        received.receive(quantity(5).unwrap(), Utc::now()).unwrap();
        let work = UnitOfWork {
            stocks: vec![StockWrite {
                stock: received,
                expected: ExpectedVersion::Exact(7),
            }],
            movements: vec![movement(*stock.id(), MovementKind::In, 5, None)],
            reservations: vec![],
        };

        assert!(matches!(store.commit(work), Err(StoreError::Conflict(_))));
        assert_eq!(store.get_stock(*stock.id()).unwrap().unwrap().quantity(), 0);
        assert!(store.movements(*stock.id(), 0).unwrap().is_empty());
    }

    #[test]
    fn duplicate_product_warehouse_pair_is_rejected() {
        let store = InMemoryInventoryStore::new();
        let stock = opened(&store);
        let twin = Stock::open(StockId::new(), stock.product_id(), stock.warehouse_id(), Utc::now());
        assert!(matches!(
            store.commit(UnitOfWork::open_stock(twin)),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[test]
    fn sequences_are_gap_free_per_stock() {
        let store = InMemoryInventoryStore::new();
        let a = opened(&store);
        let b = opened(&store);

        let work = UnitOfWork {
            movements: vec![
                movement(*a.id(), MovementKind::In, 1, None),
                movement(*b.id(), MovementKind::In, 1, None),
                movement(*a.id(), MovementKind::Adjust, 2, None),
            ],
            ..UnitOfWork::default()
        };
        let recorded = store.commit(work).unwrap();
        let sequences: Vec<_> = recorded.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 1, 2]);

        let after_first = store.movements(*a.id(), 1).unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].kind, MovementKind::Adjust);
    }

    #[test]
    fn repeated_reference_is_a_duplicate() {
        let store = InMemoryInventoryStore::new();
        let stock = opened(&store);
        let reference = MovementReference::order(OrderId::new());

        store
            .commit(UnitOfWork {
                movements: vec![movement(*stock.id(), MovementKind::In, 3, Some(reference))],
                ..UnitOfWork::default()
            })
            .unwrap();
        let again = store.commit(UnitOfWork {
            movements: vec![movement(*stock.id(), MovementKind::In, 3, Some(reference))],
            ..UnitOfWork::default()
        });
        assert!(matches!(again, Err(StoreError::Duplicate(_))));
        assert!(store
            .find_movement(*stock.id(), MovementKind::In, &reference)
            .unwrap()
            .is_some());
    }

    #[test]
    fn transition_requires_expected_status() {
        let store = InMemoryInventoryStore::new();
        let stock = opened(&store);
        let now = Utc::now();
        let reservation = StockReservation::activate(
            ReservationId::new(),
            *stock.id(),
            OrderId::new(),
            quantity(1).unwrap(),
            Duration::seconds(1),
            now,
        )
        .unwrap();
        store
            .commit(UnitOfWork {
                reservations: vec![ReservationWrite::Insert(reservation.clone())],
                ..UnitOfWork::default()
            })
            .unwrap();

        assert_eq!(
            store.due_reservations(now + Duration::seconds(1), 10).unwrap(),
            vec![reservation.id_typed()]
        );

        let mut cancelled = reservation.clone();
        cancelled.finalize(ReservationStatus::Cancelled, now).unwrap();
        let transition = |r: &StockReservation| UnitOfWork {
            reservations: vec![ReservationWrite::Transition {
                reservation: r.clone(),
                from: ReservationStatus::Active,
            }],
            ..UnitOfWork::default()
        };
        store.commit(transition(&cancelled)).unwrap();
        assert!(matches!(
            store.commit(transition(&cancelled)),
            Err(StoreError::Conflict(_))
        ));
        assert!(store.due_reservations(now + Duration::seconds(5), 10).unwrap().is_empty());
    }
}
