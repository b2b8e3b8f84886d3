//! ExpirySweeper: background release of reservations past their deadline.
//!
//! Correctness never depends on the sweeper; it only bounds how long an
//! abandoned reservation keeps units out of the available pool.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use stockledger_core::ReservationId;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::reservations::{Finalization, ReservationManager};
use crate::store::InventoryStore;

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between passes
    pub interval: Duration,
    /// Due reservations fetched per batch
    pub batch_size: usize,
    /// Upper bound on batches per pass
    pub max_batches_per_tick: usize,
    /// Thread name, also used in logs
    pub name: String,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        EngineConfig::default().into()
    }
}

impl From<EngineConfig> for SweeperConfig {
    fn from(config: EngineConfig) -> Self {
        Self {
            interval: config.sweep_interval,
            batch_size: config.sweep_batch_size.max(1),
            max_batches_per_tick: 10,
            name: "reservation-sweeper".to_string(),
        }
    }
}

impl SweeperConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_batches_per_tick(mut self, max: usize) -> Self {
        self.max_batches_per_tick = max.max(1);
        self
    }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Due ids returned by the store
    pub examined: u64,
    /// Reservations this pass moved to `expired`
    pub expired: u64,
    /// Already terminal or no longer due when locked
    pub skipped: u64,
    /// Errors, logged and left for the next pass
    pub failed: u64,
}

impl SweepReport {
    fn absorb(&mut self, other: SweepReport) {
        self.examined += other.examined;
        self.expired += other.expired;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Running totals across passes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweeperStats {
    pub passes: u64,
    pub totals: SweepReport,
    pub last_pass_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the current pass to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> SweeperStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone)]
pub struct ExpirySweeper<S> {
    reservations: ReservationManager<S>,
    config: SweeperConfig,
}

impl<S> ExpirySweeper<S>
where
    S: InventoryStore + Clone + 'static,
{
    pub fn new(reservations: ReservationManager<S>, config: SweeperConfig) -> Self {
        Self {
            reservations,
            config,
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Run one pass synchronously.
    ///
    /// Fetches due ids in batches and expires each through the reservation
    /// manager; keeps going while full batches come back, up to
    /// `max_batches_per_tick`. Ids that fail stay due, so later batches fetch
    /// past them rather than stopping at a stuck head of the queue. Only a
    /// failure to list due ids aborts the pass.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut failed: HashSet<ReservationId> = HashSet::new();

        for _ in 0..self.config.max_batches_per_tick {
            let due: Vec<ReservationId> = self
                .reservations
                .due(now, self.config.batch_size + failed.len())?
                .into_iter()
                .filter(|id| !failed.contains(id))
                .take(self.config.batch_size)
                .collect();
            let full_batch = due.len() == self.config.batch_size;
            let mut batch = SweepReport::default();

            for id in due {
                batch.examined += 1;
                match self.reservations.expire_if_due(id, now) {
                    Ok(Finalization::Finalized(_)) => batch.expired += 1,
                    Ok(Finalization::AlreadyFinalized(_) | Finalization::NotDue(_)) => {
                        batch.skipped += 1
                    }
                    Err(err) => {
                        batch.failed += 1;
                        failed.insert(id);
                        warn!(
                            sweeper = %self.config.name,
                            reservation_id = %id,
                            retryable = err.is_retryable(),
                            error = %err,
                            "failed to expire reservation"
                        );
                    }
                }
            }

            report.absorb(batch);
            if !full_batch {
                break;
            }
        }

        if report.examined > 0 {
            info!(
                sweeper = %self.config.name,
                examined = report.examined,
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                "expiry sweep finished"
            );
        } else {
            debug!(sweeper = %self.config.name, "expiry sweep found nothing due");
        }
        Ok(report)
    }

    /// Spawn the sweeper loop on its own thread.
    ///
    /// A pass runs immediately, then every `interval` until shutdown.
    pub fn spawn(self) -> std::io::Result<SweeperHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let worker_stats = Arc::clone(&stats);

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || self.run_loop(shutdown_rx, worker_stats))?;

        Ok(SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    fn run_loop(self, shutdown_rx: mpsc::Receiver<()>, stats: Arc<Mutex<SweeperStats>>) {
        let started = Instant::now();
        info!(
            sweeper = %self.config.name,
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "expiry sweeper started"
        );

        loop {
            let now = Utc::now();
            let report = match self.sweep_once(now) {
                Ok(report) => report,
                Err(err) => {
                    warn!(sweeper = %self.config.name, error = %err, "expiry sweep aborted");
                    SweepReport::default()
                }
            };

            {
                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.passes += 1;
                s.totals.absorb(report);
                s.last_pass_at = Some(now);
                s.uptime_secs = started.elapsed().as_secs();
            }

            match shutdown_rx.recv_timeout(self.config.interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
            }
        }

        info!(sweeper = %self.config.name, "expiry sweeper stopped");
    }
}
