//! Reservation expiry worker.
//!
//! Connects to Postgres, makes sure the schema exists and runs the expiry
//! sweeper until Ctrl-C. `--once` runs a single pass and exits.

use anyhow::Context;
use stockledger_infra::{DatabaseConfig, EngineConfig, InventoryEngine, PostgresInventoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockledger_observability::init();

    let run_once = std::env::args().skip(1).any(|arg| arg == "--once");
    let engine_config = EngineConfig::from_env();
    let db_config = DatabaseConfig::from_env();
    tracing::info!(?engine_config, ?db_config, "starting reservation worker");

    let pool = db_config
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}:{}", db_config.host, db_config.port))?;
    let store = PostgresInventoryStore::new(pool, tokio::runtime::Handle::current());
    store
        .ensure_schema()
        .await
        .context("failed to apply inventory schema")?;

    let engine = InventoryEngine::new(store, engine_config);
    let sweeper = engine.sweeper();

    if run_once {
        let report = tokio::task::spawn_blocking(move || sweeper.sweep_once(chrono::Utc::now()))
            .await
            .context("sweep task panicked")??;
        tracing::info!(?report, "single sweep finished");
        return Ok(());
    }

    let handle = sweeper.spawn().context("failed to spawn expiry sweeper")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = handle.stats();
    tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .context("sweeper shutdown panicked")?;
    tracing::info!(
        passes = stats.passes,
        expired = stats.totals.expired,
        failed = stats.totals.failed,
        "reservation worker stopped"
    );
    Ok(())
}
