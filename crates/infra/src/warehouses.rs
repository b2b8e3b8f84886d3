//! Warehouse registry.

use chrono::{DateTime, Utc};
use tracing::info;

use stockledger_core::WarehouseId;
use stockledger_inventory::{StockError, Warehouse, WarehouseDetails};

use crate::error::{EngineError, EngineResult};
use crate::store::{InventoryStore, StoreError, WarehouseChange};

#[derive(Debug, Clone)]
pub struct WarehouseRegistry<S> {
    store: S,
}

impl<S: InventoryStore> WarehouseRegistry<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Register a new active warehouse. Codes are unique.
    pub fn register(&self, details: WarehouseDetails, now: DateTime<Utc>) -> EngineResult<Warehouse> {
        let warehouse = Warehouse::register(WarehouseId::new(), details, now)?;
        self.store
            .insert_warehouse(&warehouse)
            .map_err(|err| duplicate_code(err, warehouse.code()))?;
        info!(warehouse_id = %warehouse.id_typed(), code = warehouse.code(), "warehouse registered");
        Ok(warehouse)
    }

    pub fn get(&self, id: WarehouseId) -> EngineResult<Warehouse> {
        self.store
            .get_warehouse(id)?
            .ok_or(EngineError::WarehouseNotFound(id))
    }

    /// Open or close a warehouse for new stock rows. Always allowed.
    pub fn set_active(&self, id: WarehouseId, active: bool, now: DateTime<Utc>) -> EngineResult<Warehouse> {
        let mut warehouse = self.get(id)?;
        if warehouse.is_active() == active {
            return Ok(warehouse);
        }
        warehouse.set_active(active, now);
        self.store
            .update_warehouse(&warehouse, WarehouseChange::Activation)?;
        info!(warehouse_id = %id, active, "warehouse activation changed");
        Ok(warehouse)
    }

    /// Replace name, code and address; refused once any stock row points here.
    ///
    /// The up-front check gives the common case a clear error; the store
    /// repeats it atomically with the write, which closes the window against a
    /// concurrent `open_stock`.
    pub fn update_details(
        &self,
        id: WarehouseId,
        details: WarehouseDetails,
        now: DateTime<Utc>,
    ) -> EngineResult<Warehouse> {
        let mut warehouse = self.get(id)?;
        let referenced = self.store.warehouse_is_referenced(id)?;
        warehouse.update_details(details, referenced, now)?;
        self.store
            .update_warehouse(&warehouse, WarehouseChange::Details)
            .map_err(|err| match err {
                StoreError::Conflict(_) => StockError::invariant(format!(
                    "warehouse {id} is referenced by stock and cannot be changed"
                ))
                .into(),
                other => duplicate_code(other, warehouse.code()),
            })?;
        info!(warehouse_id = %id, code = warehouse.code(), "warehouse details updated");
        Ok(warehouse)
    }
}

fn duplicate_code(err: StoreError, code: &str) -> EngineError {
    match err {
        StoreError::Duplicate(_) => {
            StockError::validation(format!("warehouse code '{code}' is already registered")).into()
        }
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::ProductId;

    use crate::ledger::{LedgerConfig, StockLedger};
    use crate::locks::RowLocks;
    use crate::store::InMemoryInventoryStore;
    use std::sync::Arc;

    fn details(code: &str) -> WarehouseDetails {
        WarehouseDetails {
            name: format!("Warehouse {code}"),
            code: code.to_string(),
            address: Some("  1 Dock Road ".to_string()),
        }
    }

    #[test]
    fn register_validates_and_rejects_duplicate_codes() {
        let registry = WarehouseRegistry::new(InMemoryInventoryStore::new());
        let w = registry.register(details("EAST"), Utc::now()).unwrap();
        assert!(w.is_active());
        assert_eq!(w.address(), Some("1 Dock Road"));
        assert_eq!(registry.get(w.id_typed()).unwrap(), w);

        assert!(matches!(
            registry.register(details("EAST"), Utc::now()),
            Err(EngineError::Stock(StockError::Validation(_)))
        ));
        assert!(matches!(
            registry.register(details(&"X".repeat(51)), Utc::now()),
            Err(EngineError::Stock(StockError::Validation(_)))
        ));
    }

    #[test]
    fn details_freeze_once_stock_references_the_warehouse() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let registry = WarehouseRegistry::new(store.clone());
        let w = registry.register(details("WEST"), Utc::now()).unwrap();

        let renamed = registry
            .update_details(w.id_typed(), details("WEST-2"), Utc::now())
            .unwrap();
        assert_eq!(renamed.code(), "WEST-2");

        let ledger = StockLedger::new(store.clone(), RowLocks::new(), LedgerConfig::default());
        ledger.open_stock(ProductId::new(), w.id_typed()).unwrap();

        assert!(matches!(
            registry.update_details(w.id_typed(), details("WEST-3"), Utc::now()),
            Err(EngineError::Stock(StockError::InvariantViolation(_)))
        ));
        let closed = registry.set_active(w.id_typed(), false, Utc::now()).unwrap();
        assert!(!closed.is_active());
        assert!(!registry.get(w.id_typed()).unwrap().is_active());
    }

    #[test]
    fn store_rechecks_references_inside_the_write() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let registry = WarehouseRegistry::new(store.clone());
        let w = registry.register(details("NORTH"), Utc::now()).unwrap();
        let ledger = StockLedger::new(store.clone(), RowLocks::new(), LedgerConfig::default());
        ledger.open_stock(ProductId::new(), w.id_typed()).unwrap();

        // A details edit computed before the stock row appeared.
        let mut stale = w.clone();
        stale.update_details(details("NORTH-2"), false, Utc::now()).unwrap();
        assert!(matches!(
            store.update_warehouse(&stale, WarehouseChange::Details),
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(registry.get(w.id_typed()).unwrap().code(), "NORTH");

        let mut closed = w.clone();
        closed.set_active(false, Utc::now());
        store
            .update_warehouse(&closed, WarehouseChange::Activation)
            .unwrap();
    }

    #[test]
    fn stock_cannot_open_in_a_warehouse_closed_after_the_check() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let registry = WarehouseRegistry::new(store.clone());
        let w = registry.register(details("SOUTH"), Utc::now()).unwrap();
        registry.set_active(w.id_typed(), false, Utc::now()).unwrap();

        // Commit a new row directly, as an opener that read the warehouse while it was active.
        let stock = stockledger_inventory::Stock::open(
            stockledger_core::StockId::new(),
            ProductId::new(),
            w.id_typed(),
            Utc::now(),
        );
        assert!(matches!(
            store.commit(crate::store::UnitOfWork::open_stock(stock)),
            Err(StoreError::Conflict(_))
        ));
        assert!(!store.warehouse_is_referenced(w.id_typed()).unwrap());
    }

    #[test]
    fn missing_warehouse_is_not_found() {
        let registry = WarehouseRegistry::new(InMemoryInventoryStore::new());
        let id = WarehouseId::new();
        assert_eq!(registry.get(id), Err(EngineError::WarehouseNotFound(id)));
        assert_eq!(
            registry.set_active(id, false, Utc::now()),
            Err(EngineError::WarehouseNotFound(id))
        );
    }
}
