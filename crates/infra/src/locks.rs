//! Per-stock-row exclusive locks.
//!
//! Every operation locks the stock rows it touches for its whole
//! read-modify-write. Rows are always taken in ascending [`StockId`] order;
//! asking for a smaller id while holding a larger one is refused rather than
//! risking a deadlock.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use stockledger_core::StockId;

use crate::error::EngineError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for stock {stock_id}")]
    Timeout { stock_id: StockId, waited: Duration },

    #[error("stock {requested} requested while holding {held}")]
    OutOfOrder { held: StockId, requested: StockId },
}

impl From<LockError> for EngineError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Timeout { stock_id, waited } => EngineError::LockTimeout { stock_id, waited },
            LockError::OutOfOrder { held, requested } => {
                EngineError::DeadlockAvoided { held, requested }
            }
        }
    }
}

/// Lock table keyed by stock row.
#[derive(Debug, Default)]
pub struct RowLocks {
    held: Mutex<HashSet<StockId>>,
    released: Condvar,
}

impl RowLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lock `ids` (sorted and deduplicated here), waiting up to `timeout` for each.
    ///
    /// On failure every row taken so far is released again.
    pub fn acquire(
        self: &Arc<Self>,
        ids: impl IntoIterator<Item = StockId>,
        timeout: Duration,
    ) -> Result<RowLockGuard, LockError> {
        let mut ids: Vec<StockId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();

        let mut guard = RowLockGuard {
            locks: Arc::clone(self),
            held: Vec::with_capacity(ids.len()),
            timeout,
        };
        for id in ids {
            guard.extend(id)?;
        }
        Ok(guard)
    }

    /// Whether any operation currently holds `id`.
    pub fn is_locked(&self, id: StockId) -> bool {
        self.table().contains(&id)
    }

    fn table(&self) -> MutexGuard<'_, HashSet<StockId>> {
        // The set is only touched by insert/remove, so a poisoned guard is still consistent.
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_one(&self, id: StockId, timeout: Duration) -> Result<(), LockError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut held = self.table();
        while held.contains(&id) {
            let now = Instant::now();
            if now >= deadline {
                debug!(stock_id = %id, waited_ms = timeout.as_millis() as u64, "stock row lock timed out");
                return Err(LockError::Timeout {
                    stock_id: id,
                    waited: now - started,
                });
            }
            held = self
                .released
                .wait_timeout(held, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        held.insert(id);
        Ok(())
    }

    fn unlock(&self, ids: &[StockId]) {
        let mut held = self.table();
        for id in ids {
            held.remove(id);
        }
        drop(held);
        self.released.notify_all();
    }
}

/// Rows held by one operation; released on drop.
#[derive(Debug)]
pub struct RowLockGuard {
    locks: Arc<RowLocks>,
    held: Vec<StockId>,
    timeout: Duration,
}

impl RowLockGuard {
    /// Take one more row. It must sort after every row already held.
    pub fn extend(&mut self, id: StockId) -> Result<(), LockError> {
        if let Some(&last) = self.held.last() {
            if id == last {
                return Ok(());
            }
            if id < last {
                return Err(LockError::OutOfOrder {
                    held: last,
                    requested: id,
                });
            }
        }
        self.locks.lock_one(id, self.timeout)?;
        self.held.push(id);
        Ok(())
    }

    pub fn holds(&self, id: StockId) -> bool {
        self.held.binary_search(&id).is_ok()
    }

    pub fn held(&self) -> &[StockId] {
        &self.held
    }
}

impl Drop for RowLockGuard {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            self.locks.unlock(&self.held);
        }
    }
}
