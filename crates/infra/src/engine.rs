//! Wiring of the engine components around one injected store.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::ledger::StockLedger;
use crate::locks::RowLocks;
use crate::movements::MovementRecorder;
use crate::reservations::ReservationManager;
use crate::store::InventoryStore;
use crate::sweeper::{ExpirySweeper, SweeperConfig};
use crate::warehouses::WarehouseRegistry;

/// The stock ledger and reservation engine.
///
/// All components share the same store and the same row lock table, so every
/// mutation of a stock row is serialized no matter which entry point made it.
#[derive(Debug, Clone)]
pub struct InventoryEngine<S> {
    warehouses: WarehouseRegistry<S>,
    ledger: StockLedger<S>,
    reservations: ReservationManager<S>,
    config: EngineConfig,
}

impl<S: InventoryStore + Clone> InventoryEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        let ledger = StockLedger::new(store.clone(), RowLocks::new(), config.clone().into());
        let reservations =
            ReservationManager::new(store.clone(), ledger.clone(), config.default_reservation_ttl);
        Self {
            warehouses: WarehouseRegistry::new(store),
            ledger,
            reservations,
            config,
        }
    }

    pub fn warehouses(&self) -> &WarehouseRegistry<S> {
        &self.warehouses
    }

    pub fn ledger(&self) -> &StockLedger<S> {
        &self.ledger
    }

    pub fn reservations(&self) -> &ReservationManager<S> {
        &self.reservations
    }

    pub fn movements(&self) -> &MovementRecorder<S> {
        self.ledger.recorder()
    }

    pub fn locks(&self) -> &Arc<RowLocks> {
        self.ledger.locks()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl<S: InventoryStore + Clone + 'static> InventoryEngine<S> {
    /// A sweeper over this engine's reservations, configured from `config()`.
    pub fn sweeper(&self) -> ExpirySweeper<S> {
        ExpirySweeper::new(
            self.reservations.clone(),
            SweeperConfig::from(self.config.clone()),
        )
    }
}
