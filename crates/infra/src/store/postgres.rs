//! Postgres-backed inventory store.
//!
//! Row-level guarantees are enforced by the schema as well as by the engine:
//! a check constraint keeps `0 <= reserved <= quantity`, a unique index keeps
//! one stock row per `(product_id, warehouse_id)`, a partial unique index
//! rejects a second movement for the same `(stock_id, type, reference)`, and
//! another keeps at most one active reservation per `(stock_id, order_id)`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` on `stock_movements_sequence_key` | `Conflict` | Concurrent append to the same movement stream |
//! | Database (unique violation) | `23505` | `Duplicate` | Replayed reference, second active reservation, duplicate warehouse code |
//! | Database (serialization / deadlock) | `40001`, `40P01` | `Conflict` | Concurrent writers, safe to retry |
//! | Database (lock not available / statement canceled) | `55P03`, `57014` | `Timeout` | `lock_timeout` or `statement_timeout` elapsed |
//! | PoolTimedOut | N/A | `Timeout` | No connection free within the acquire timeout |
//! | Database (other) | Any other | `Backend` | Check/foreign key violations, other database errors |
//! | PoolClosed, Io, ... | N/A | `Backend` | Connection failures |

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, field, instrument};

use stockledger_core::{
    ExpectedVersion, MovementId, OrderId, ProductId, Quantity, ReservationId, StockId,
    WarehouseId,
};
use stockledger_inventory::{
    MovementKind, MovementReference, NewMovement, ReferenceType, ReservationStatus, Stock,
    StockMovement, StockReservation, Warehouse,
};

use super::r#trait::{
    InventoryStore, ReservationWrite, StoreError, StockWrite, UnitOfWork, WarehouseChange,
};

/// Idempotent DDL for the inventory tables.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS warehouses (
    id          UUID PRIMARY KEY,
    name        VARCHAR(255) NOT NULL,
    code        VARCHAR(50)  NOT NULL,
    address     TEXT,
    is_active   BOOLEAN      NOT NULL DEFAULT TRUE,
    created_at  TIMESTAMPTZ  NOT NULL,
    updated_at  TIMESTAMPTZ  NOT NULL,
    CONSTRAINT warehouses_code_key UNIQUE (code)
);

CREATE TABLE IF NOT EXISTS stocks (
    id            UUID PRIMARY KEY,
    product_id    UUID        NOT NULL,
    warehouse_id  UUID        NOT NULL REFERENCES warehouses (id),
    quantity      BIGINT      NOT NULL DEFAULT 0,
    reserved      BIGINT      NOT NULL DEFAULT 0,
    version       BIGINT      NOT NULL DEFAULT 0,
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL,
    CONSTRAINT stocks_product_warehouse_key UNIQUE (product_id, warehouse_id),
    CONSTRAINT stocks_reserved_bounds CHECK (reserved >= 0 AND reserved <= quantity)
);

CREATE TABLE IF NOT EXISTS stock_movements (
    id              UUID PRIMARY KEY,
    stock_id        UUID         NOT NULL REFERENCES stocks (id),
    sequence        BIGINT       NOT NULL,
    type            VARCHAR(20)  NOT NULL,
    quantity        BIGINT       NOT NULL,
    reference_type  VARCHAR(20),
    reference_id    UUID,
    reason          VARCHAR(255),
    created_at      TIMESTAMPTZ  NOT NULL,
    CONSTRAINT stock_movements_sequence_key UNIQUE (stock_id, sequence)
);

CREATE UNIQUE INDEX IF NOT EXISTS stock_movements_reference_key
    ON stock_movements (stock_id, type, reference_type, reference_id)
    WHERE reference_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS stock_reservations (
    id          UUID PRIMARY KEY,
    stock_id    UUID        NOT NULL REFERENCES stocks (id),
    order_id    UUID        NOT NULL,
    quantity    BIGINT      NOT NULL CHECK (quantity > 0),
    expires_at  TIMESTAMPTZ NOT NULL,
    status      VARCHAR(20) NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS stock_reservations_active_order_key
    ON stock_reservations (stock_id, order_id)
    WHERE status = 'active';

CREATE INDEX IF NOT EXISTS stock_reservations_due_idx
    ON stock_reservations (expires_at)
    WHERE status = 'active';
"#;

const STOCK_COLUMNS: &str =
    "id, product_id, warehouse_id, quantity, reserved, version, created_at, updated_at";
const MOVEMENT_COLUMNS: &str =
    "id, stock_id, sequence, type, quantity, reference_type, reference_id, reason, created_at";
const RESERVATION_COLUMNS: &str =
    "id, stock_id, order_id, quantity, expires_at, status, created_at, updated_at";
const WAREHOUSE_COLUMNS: &str = "id, name, code, address, is_active, created_at, updated_at";

/// Postgres-backed inventory store.
///
/// The async methods are the primary API. The [`InventoryStore`] impl drives
/// them on the runtime captured at construction, so the engine can be called
/// from plain threads (the expiry sweeper) as well as from runtime workers.
#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: Arc<PgPool>,
    runtime: tokio::runtime::Handle,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool, runtime: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create the tables and indexes if they are missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, warehouse), fields(warehouse_id = %warehouse.id_typed()), err)]
    pub async fn insert_warehouse_async(&self, warehouse: &Warehouse) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO warehouses (id, name, code, address, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(warehouse.id_typed().as_uuid())
        .bind(warehouse.name())
        .bind(warehouse.code())
        .bind(warehouse.address())
        .bind(warehouse.is_active())
        .bind(stockledger_core::Entity::created_at(warehouse))
        .bind(warehouse.updated_at())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_warehouse", e))?;
        Ok(())
    }

    /// Update under the warehouse row lock. Stock inserts take a share lock on
    /// the same row, so the "referenced" check and the write cannot interleave
    /// with a concurrent open.
    #[instrument(skip(self, warehouse), fields(warehouse_id = %warehouse.id_typed()), err)]
    pub async fn update_warehouse_async(
        &self,
        warehouse: &Warehouse,
        change: WarehouseChange,
    ) -> Result<(), StoreError> {
        let id = warehouse.id_typed();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let locked = sqlx::query("SELECT id FROM warehouses WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_warehouse", e))?;
        if locked.is_none() {
            return Err(StoreError::NotFound(format!("warehouse {id}")));
        }

        if change == WarehouseChange::Details {
            let referenced: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM stocks WHERE warehouse_id = $1)",
            )
            .bind(id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("warehouse_is_referenced", e))?;
            if referenced {
                return Err(StoreError::Conflict(format!(
                    "warehouse {id} is referenced by stock"
                )));
            }
        }

        sqlx::query(
            r#"
            UPDATE warehouses
            SET name = $2, code = $3, address = $4, is_active = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(warehouse.id_typed().as_uuid())
        .bind(warehouse.name())
        .bind(warehouse.code())
        .bind(warehouse.address())
        .bind(warehouse.is_active())
        .bind(warehouse.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_warehouse", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(warehouse_id = %id), err)]
    pub async fn get_warehouse_async(&self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WAREHOUSE_COLUMNS} FROM warehouses WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_warehouse", e))?;

        row.map(|r| decode::<WarehouseRow>(&r).map(Warehouse::from))
            .transpose()
    }

    pub async fn warehouse_is_referenced_async(&self, id: WarehouseId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM stocks WHERE warehouse_id = $1) AS referenced")
            .bind(id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("warehouse_is_referenced", e))?;
        row.try_get("referenced")
            .map_err(|e| StoreError::Backend(format!("failed to read referenced: {e}")))
    }

    #[instrument(skip(self), fields(stock_id = %id), err)]
    pub async fn get_stock_async(&self, id: StockId) -> Result<Option<Stock>, StoreError> {
        let row = sqlx::query(&format!("SELECT {STOCK_COLUMNS} FROM stocks WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_stock", e))?;

        row.map(|r| decode::<StockRow>(&r).and_then(Stock::try_from))
            .transpose()
    }

    #[instrument(skip(self), fields(product_id = %product_id, warehouse_id = %warehouse_id), err)]
    pub async fn find_stock_async(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Stock>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STOCK_COLUMNS} FROM stocks WHERE product_id = $1 AND warehouse_id = $2"
        ))
        .bind(product_id.as_uuid())
        .bind(warehouse_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_stock", e))?;

        row.map(|r| decode::<StockRow>(&r).and_then(Stock::try_from))
            .transpose()
    }

    #[instrument(skip(self), fields(reservation_id = %id), err)]
    pub async fn get_reservation_async(
        &self,
        id: ReservationId,
    ) -> Result<Option<StockReservation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_reservation", e))?;

        row.map(|r| decode::<ReservationRow>(&r).and_then(StockReservation::try_from))
            .transpose()
    }

    pub async fn find_active_reservation_async(
        &self,
        stock_id: StockId,
        order_id: OrderId,
    ) -> Result<Option<StockReservation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations \
             WHERE stock_id = $1 AND order_id = $2 AND status = 'active'"
        ))
        .bind(stock_id.as_uuid())
        .bind(order_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_active_reservation", e))?;

        row.map(|r| decode::<ReservationRow>(&r).and_then(StockReservation::try_from))
            .transpose()
    }

    pub async fn active_reservations_async(
        &self,
        stock_id: StockId,
    ) -> Result<Vec<StockReservation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations \
             WHERE stock_id = $1 AND status = 'active' ORDER BY created_at, id"
        ))
        .bind(stock_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_reservations", e))?;

        rows.iter()
            .map(|r| decode::<ReservationRow>(r).and_then(StockReservation::try_from))
            .collect()
    }

    #[instrument(skip(self), fields(due = field::Empty), err)]
    pub async fn due_reservations_async(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReservationId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM stock_reservations
            WHERE status = 'active' AND expires_at <= $1
            ORDER BY expires_at, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("due_reservations", e))?;

        Span::current().record("due", rows.len());
        rows.iter()
            .map(|r| {
                r.try_get::<uuid::Uuid, _>("id")
                    .map(ReservationId::from_uuid)
                    .map_err(|e| StoreError::Backend(format!("failed to read reservation id: {e}")))
            })
            .collect()
    }

    pub async fn find_movement_async(
        &self,
        stock_id: StockId,
        kind: MovementKind,
        reference: &MovementReference,
    ) -> Result<Option<StockMovement>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements \
             WHERE stock_id = $1 AND type = $2 AND reference_type = $3 AND reference_id = $4"
        ))
        .bind(stock_id.as_uuid())
        .bind(kind.as_str())
        .bind(reference.kind.as_str())
        .bind(reference.id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_movement", e))?;

        row.map(|r| decode::<MovementRow>(&r).and_then(StockMovement::try_from))
            .transpose()
    }

    #[instrument(skip(self), fields(stock_id = %stock_id), err)]
    pub async fn movements_async(
        &self,
        stock_id: StockId,
        after: u64,
    ) -> Result<Vec<StockMovement>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements \
             WHERE stock_id = $1 AND sequence > $2 ORDER BY sequence ASC"
        ))
        .bind(stock_id.as_uuid())
        .bind(after as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movements", e))?;

        rows.iter()
            .map(|r| decode::<MovementRow>(r).and_then(StockMovement::try_from))
            .collect()
    }

    /// Apply a unit of work in one transaction.
    ///
    /// Stock rows are written first (version-guarded), then movements with
    /// `MAX(sequence) + 1` per stream, then reservation inserts/transitions.
    /// Any failed guard rolls the whole transaction back.
    #[instrument(
        skip(self, work),
        fields(
            stocks = work.stocks.len(),
            movements = work.movements.len(),
            reservations = work.reservations.len(),
            committed_movements = field::Empty
        ),
        err
    )]
    pub async fn commit_async(&self, work: UnitOfWork) -> Result<Vec<StockMovement>, StoreError> {
        if work.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for write in &work.stocks {
            write_stock(&mut tx, write).await?;
        }

        let mut next_sequence: HashMap<StockId, u64> = HashMap::new();
        let mut recorded = Vec::with_capacity(work.movements.len());
        for movement in work.movements {
            let sequence = match next_sequence.get(&movement.stock_id) {
                Some(seq) => *seq,
                None => current_sequence(&mut tx, movement.stock_id).await? + 1,
            };
            insert_movement(&mut tx, &movement, sequence).await?;
            next_sequence.insert(movement.stock_id, sequence + 1);
            recorded.push(movement.into_recorded(sequence));
        }

        for write in &work.reservations {
            write_reservation(&mut tx, write).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_movements", recorded.len());
        Ok(recorded)
    }

    /// Run a store future to completion from synchronous code.
    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        if tokio::runtime::Handle::try_current().is_ok() {
            // Inside a runtime worker: hand the thread over before blocking on it.
            tokio::task::block_in_place(|| self.runtime.block_on(fut))
        } else {
            self.runtime.block_on(fut)
        }
    }
}

async fn write_stock(
    tx: &mut Transaction<'_, Postgres>,
    write: &StockWrite,
) -> Result<(), StoreError> {
    let stock = &write.stock;
    match write.expected {
        ExpectedVersion::NoRow => {
            let warehouse_id = stock.warehouse_id();
            let active: Option<bool> =
                sqlx::query_scalar("SELECT is_active FROM warehouses WHERE id = $1 FOR SHARE")
                    .bind(warehouse_id.as_uuid())
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| map_sqlx_error("lock_warehouse", e))?;
            match active {
                None => return Err(StoreError::NotFound(format!("warehouse {warehouse_id}"))),
                Some(false) => {
                    return Err(StoreError::Conflict(format!(
                        "warehouse {warehouse_id} is inactive"
                    )));
                }
                Some(true) => {}
            }

            sqlx::query(
                r#"
                INSERT INTO stocks (
                    id, product_id, warehouse_id, quantity, reserved, version, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(stock.id_typed().as_uuid())
            .bind(stock.product_id().as_uuid())
            .bind(stock.warehouse_id().as_uuid())
            .bind(stock.quantity())
            .bind(stock.reserved())
            .bind(stock.version() as i64)
            .bind(stockledger_core::Entity::created_at(stock))
            .bind(stock.updated_at())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_stock", e))?;
        }
        ExpectedVersion::Exact(expected) => {
            let result = sqlx::query(
                r#"
                UPDATE stocks
                SET quantity = $2, reserved = $3, version = $4, updated_at = $5
                WHERE id = $1 AND version = $6
                "#,
            )
            .bind(stock.id_typed().as_uuid())
            .bind(stock.quantity())
            .bind(stock.reserved())
            .bind(stock.version() as i64)
            .bind(stock.updated_at())
            .bind(expected as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("update_stock", e))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "stock {}: version {} is no longer current",
                    stock.id_typed(),
                    expected
                )));
            }
        }
    }
    Ok(())
}

async fn current_sequence(
    tx: &mut Transaction<'_, Postgres>,
    stock_id: StockId,
) -> Result<u64, StoreError> {
    let row = sqlx::query(
        "SELECT COALESCE(MAX(sequence), 0) AS current FROM stock_movements WHERE stock_id = $1",
    )
    .bind(stock_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("current_sequence", e))?;

    let current: i64 = row
        .try_get("current")
        .map_err(|e| StoreError::Backend(format!("failed to read current sequence: {e}")))?;
    Ok(current as u64)
}

async fn insert_movement(
    tx: &mut Transaction<'_, Postgres>,
    movement: &NewMovement,
    sequence: u64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO stock_movements (
            id, stock_id, sequence, type, quantity, reference_type, reference_id, reason, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(movement.id.as_uuid())
    .bind(movement.stock_id.as_uuid())
    .bind(sequence as i64)
    .bind(movement.kind.as_str())
    .bind(movement.quantity)
    .bind(movement.reference.map(|r| r.kind.as_str()))
    .bind(movement.reference.map(|r| r.id))
    .bind(movement.reason.as_deref())
    .bind(movement.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_movement", e))?;
    Ok(())
}

async fn write_reservation(
    tx: &mut Transaction<'_, Postgres>,
    write: &ReservationWrite,
) -> Result<(), StoreError> {
    match write {
        ReservationWrite::Insert(r) => {
            sqlx::query(
                r#"
                INSERT INTO stock_reservations (
                    id, stock_id, order_id, quantity, expires_at, status, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(r.id_typed().as_uuid())
            .bind(r.stock_id().as_uuid())
            .bind(r.order_id().as_uuid())
            .bind(r.quantity().get())
            .bind(r.expires_at())
            .bind(r.status().as_str())
            .bind(stockledger_core::Entity::created_at(r))
            .bind(r.updated_at())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_reservation", e))?;
        }
        ReservationWrite::Transition { reservation, from } => {
            let result = sqlx::query(
                r#"
                UPDATE stock_reservations
                SET status = $2, updated_at = $3
                WHERE id = $1 AND status = $4
                "#,
            )
            .bind(reservation.id_typed().as_uuid())
            .bind(reservation.status().as_str())
            .bind(reservation.updated_at())
            .bind(from.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("transition_reservation", e))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "reservation {} is no longer {}",
                    reservation.id_typed(),
                    from
                )));
            }
        }
    }
    Ok(())
}

impl InventoryStore for PostgresInventoryStore {
    fn insert_warehouse(&self, warehouse: &Warehouse) -> Result<(), StoreError> {
        self.block_on(self.insert_warehouse_async(warehouse))
    }

    fn update_warehouse(
        &self,
        warehouse: &Warehouse,
        change: WarehouseChange,
    ) -> Result<(), StoreError> {
        self.block_on(self.update_warehouse_async(warehouse, change))
    }

    fn get_warehouse(&self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
        self.block_on(self.get_warehouse_async(id))
    }

    fn warehouse_is_referenced(&self, id: WarehouseId) -> Result<bool, StoreError> {
        self.block_on(self.warehouse_is_referenced_async(id))
    }

    fn get_stock(&self, id: StockId) -> Result<Option<Stock>, StoreError> {
        self.block_on(self.get_stock_async(id))
    }

    fn find_stock(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Stock>, StoreError> {
        self.block_on(self.find_stock_async(product_id, warehouse_id))
    }

    fn get_reservation(&self, id: ReservationId) -> Result<Option<StockReservation>, StoreError> {
        self.block_on(self.get_reservation_async(id))
    }

    fn find_active_reservation(
        &self,
        stock_id: StockId,
        order_id: OrderId,
    ) -> Result<Option<StockReservation>, StoreError> {
        self.block_on(self.find_active_reservation_async(stock_id, order_id))
    }

    fn active_reservations(&self, stock_id: StockId) -> Result<Vec<StockReservation>, StoreError> {
        self.block_on(self.active_reservations_async(stock_id))
    }

    fn due_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReservationId>, StoreError> {
        self.block_on(self.due_reservations_async(now, limit))
    }

    fn find_movement(
        &self,
        stock_id: StockId,
        kind: MovementKind,
        reference: &MovementReference,
    ) -> Result<Option<StockMovement>, StoreError> {
        self.block_on(self.find_movement_async(stock_id, kind, reference))
    }

    fn movements(&self, stock_id: StockId, after: u64) -> Result<Vec<StockMovement>, StoreError> {
        self.block_on(self.movements_async(stock_id, after))
    }

    fn commit(&self, work: UnitOfWork) -> Result<Vec<StockMovement>, StoreError> {
        self.block_on(self.commit_async(work))
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") if db_err.constraint() == Some("stock_movements_sequence_key") => {
                    StoreError::Conflict(msg)
                }
                Some("23505") => StoreError::Duplicate(msg),
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                // lock_not_available (lock_timeout), query_canceled (statement_timeout)
                Some("55P03") | Some("57014") => StoreError::Timeout(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Timeout(format!("no pooled connection available for {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Backend(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode<'r, T>(row: &'r sqlx::postgres::PgRow) -> Result<T, StoreError>
where
    T: FromRow<'r, sqlx::postgres::PgRow>,
{
    T::from_row(row).map_err(|e| StoreError::Backend(format!("failed to decode row: {e}")))
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("corrupt {what} row: {detail}"))
}

// SQLx row types

#[derive(Debug)]
struct WarehouseRow {
    id: uuid::Uuid,
    name: String,
    code: String,
    address: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for WarehouseRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(WarehouseRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            code: row.try_get("code")?,
            address: row.try_get("address")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<WarehouseRow> for Warehouse {
    fn from(row: WarehouseRow) -> Self {
        Warehouse::restore(
            WarehouseId::from_uuid(row.id),
            row.name,
            row.code,
            row.address,
            row.is_active,
            row.created_at,
            row.updated_at,
        )
    }
}

#[derive(Debug)]
struct StockRow {
    id: uuid::Uuid,
    product_id: uuid::Uuid,
    warehouse_id: uuid::Uuid,
    quantity: i64,
    reserved: i64,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StockRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StockRow {
            id: row.try_get("id")?,
            product_id: row.try_get("product_id")?,
            warehouse_id: row.try_get("warehouse_id")?,
            quantity: row.try_get("quantity")?,
            reserved: row.try_get("reserved")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<StockRow> for Stock {
    type Error = StoreError;

    fn try_from(row: StockRow) -> Result<Self, Self::Error> {
        Stock::restore(
            StockId::from_uuid(row.id),
            ProductId::from_uuid(row.product_id),
            WarehouseId::from_uuid(row.warehouse_id),
            row.quantity,
            row.reserved,
            row.version as u64,
            row.created_at,
            row.updated_at,
        )
        .map_err(|e| corrupt("stock", e))
    }
}

#[derive(Debug)]
struct MovementRow {
    id: uuid::Uuid,
    stock_id: uuid::Uuid,
    sequence: i64,
    kind: String,
    quantity: i64,
    reference_type: Option<String>,
    reference_id: Option<uuid::Uuid>,
    reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for MovementRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(MovementRow {
            id: row.try_get("id")?,
            stock_id: row.try_get("stock_id")?,
            sequence: row.try_get("sequence")?,
            kind: row.try_get("type")?,
            quantity: row.try_get("quantity")?,
            reference_type: row.try_get("reference_type")?,
            reference_id: row.try_get("reference_id")?,
            reason: row.try_get("reason")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<MovementRow> for StockMovement {
    type Error = StoreError;

    fn try_from(row: MovementRow) -> Result<Self, Self::Error> {
        let kind = MovementKind::parse(&row.kind)
            .ok_or_else(|| corrupt("movement", format!("unknown type '{}'", row.kind)))?;
        let reference = match (row.reference_type, row.reference_id) {
            (Some(kind), Some(id)) => Some(MovementReference {
                id,
                kind: ReferenceType::parse(&kind)
                    .ok_or_else(|| corrupt("movement", format!("unknown reference type '{kind}'")))?,
            }),
            (None, None) => None,
            _ => return Err(corrupt("movement", "half-populated reference")),
        };
        Ok(StockMovement {
            id: MovementId::from_uuid(row.id),
            stock_id: StockId::from_uuid(row.stock_id),
            sequence: row.sequence as u64,
            kind,
            quantity: row.quantity,
            reference,
            reason: row.reason,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct ReservationRow {
    id: uuid::Uuid,
    stock_id: uuid::Uuid,
    order_id: uuid::Uuid,
    quantity: i64,
    expires_at: DateTime<Utc>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ReservationRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ReservationRow {
            id: row.try_get("id")?,
            stock_id: row.try_get("stock_id")?,
            order_id: row.try_get("order_id")?,
            quantity: row.try_get("quantity")?,
            expires_at: row.try_get("expires_at")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ReservationRow> for StockReservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        let status = ReservationStatus::parse(&row.status)
            .ok_or_else(|| corrupt("reservation", format!("unknown status '{}'", row.status)))?;
        let quantity = Quantity::new(row.quantity).map_err(|e| corrupt("reservation", e))?;
        Ok(StockReservation::restore(
            ReservationId::from_uuid(row.id),
            StockId::from_uuid(row.stock_id),
            OrderId::from_uuid(row.order_id),
            quantity,
            row.expires_at,
            status,
            row.created_at,
            row.updated_at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_guarding_indexes() {
        for name in [
            "stocks_product_warehouse_key",
            "stocks_reserved_bounds",
            "stock_movements_sequence_key",
            "stock_movements_reference_key",
            "stock_reservations_active_order_key",
        ] {
            assert!(SCHEMA.contains(name), "missing {name}");
        }
    }

    #[derive(Debug)]
    struct ServerError {
        code: &'static str,
        constraint: Option<&'static str>,
    }

    impl std::fmt::Display for ServerError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "server error {}", self.code)
        }
    }

    impl std::error::Error for ServerError {}

    impl sqlx::error::DatabaseError for ServerError {
        fn message(&self) -> &str {
            "server error"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(std::borrow::Cow::Borrowed(self.code))
        }

        fn constraint(&self) -> Option<&str> {
            self.constraint
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn server(code: &'static str, constraint: Option<&'static str>) -> sqlx::Error {
        sqlx::Error::Database(Box::new(ServerError { code, constraint }))
    }

    #[test]
    fn lock_statement_and_pool_waits_are_timeouts() {
        for err in [
            server("55P03", None),
            server("57014", None),
            sqlx::Error::PoolTimedOut,
        ] {
            assert!(matches!(
                map_sqlx_error("update_stock", err),
                StoreError::Timeout(_)
            ));
        }
    }

    #[test]
    fn database_codes_map_to_store_errors() {
        assert!(matches!(
            map_sqlx_error("op", server("40001", None)),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            map_sqlx_error("op", server("23505", Some("stock_movements_sequence_key"))),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            map_sqlx_error("op", server("23505", Some("warehouses_code_key"))),
            StoreError::Duplicate(_)
        ));
        assert!(matches!(
            map_sqlx_error("op", server("22P02", None)),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn non_database_errors_are_backend() {
        assert!(matches!(
            map_sqlx_error("op", sqlx::Error::PoolClosed),
            StoreError::Backend(_)
        ));
        assert!(matches!(
            map_sqlx_error("op", sqlx::Error::RowNotFound),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn half_populated_reference_is_corrupt() {
        let row = MovementRow {
            id: uuid::Uuid::now_v7(),
            stock_id: uuid::Uuid::now_v7(),
            sequence: 1,
            kind: "out".to_string(),
            quantity: -1,
            reference_type: Some("order".to_string()),
            reference_id: None,
            reason: None,
            created_at: Utc::now(),
        };
        assert!(matches!(StockMovement::try_from(row), Err(StoreError::Backend(_))));
    }

    #[test]
    fn movement_row_decodes_reference() {
        let reference_id = uuid::Uuid::now_v7();
        let row = MovementRow {
            id: uuid::Uuid::now_v7(),
            stock_id: uuid::Uuid::now_v7(),
            sequence: 4,
            kind: "reserve".to_string(),
            quantity: 3,
            reference_type: Some("reservation".to_string()),
            reference_id: Some(reference_id),
            reason: None,
            created_at: Utc::now(),
        };
        let movement = StockMovement::try_from(row).unwrap();
        assert_eq!(movement.kind, MovementKind::Reserve);
        assert_eq!(movement.sequence, 4);
        assert_eq!(
            movement.reference,
            Some(MovementReference {
                id: reference_id,
                kind: ReferenceType::Reservation,
            })
        );
    }
}
