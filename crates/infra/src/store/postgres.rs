//! Postgres-backed inventory store.
//!
//! Every stock write runs inside a database transaction. The projection row is
//! locked with `SELECT ... FOR UPDATE` before it is read, so check-then-act on
//! on-hand quantity is serialized per `(warehouse, variant)` while different
//! rows proceed in parallel.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Duplicate` | Warehouse code / sku taken, order id reused |
//! | Database (lock not available) | `55P03` | `LockTimeout` | Transaction budget elapsed waiting for a row lock |
//! | Database (deadlock detected) | `40P01` | `Conflict` | Lock cycle between transactions |
//! | Database (serialization failure) | `40001` | `Conflict` | Concurrent update under stricter isolation |
//! | Database (check / foreign key violation) | `23514` / `23503` | `Conflict` | Negative quantity, unknown warehouse or variant |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | RowNotFound | N/A | `NotFound` | Unexpected missing row |
//! | Other | N/A | `Backend` | Network errors, pool closed, etc. |
//!
//! Ledger idempotency does not rely on `23505`: appends use
//! `ON CONFLICT DO NOTHING` and report `Duplicate` when no row comes back, which
//! keeps the transaction usable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use stockledger_core::{AggregateRoot, OrderId, ProductId, Quantity, VariantId, WarehouseId};
use stockledger_inventory::{
    EntryId, LedgerEntry, LedgerEntryType, NewLedgerEntry, Reference, StockKey, Variant,
    Warehouse, resolve_default,
};
use stockledger_orders::{Customer, FulfillmentType, Order, OrderLine, OrderStatus};

use super::query::{LedgerPage, Pagination, StockLevel};
use super::r#trait::{InventoryStore, StockTransaction};
use crate::error::StoreError;

/// DDL applied by [`PostgresInventoryStore::ensure_schema`]. Every statement is idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS warehouses (
        id          UUID PRIMARY KEY,
        code        TEXT NOT NULL UNIQUE,
        name        TEXT NOT NULL,
        active      BOOLEAN NOT NULL DEFAULT TRUE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS variants (
        id          UUID PRIMARY KEY,
        product_id  UUID NOT NULL,
        sku         TEXT NOT NULL UNIQUE,
        price       BIGINT NOT NULL CHECK (price >= 0),
        active      BOOLEAN NOT NULL DEFAULT TRUE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stock_levels (
        warehouse_id  UUID NOT NULL REFERENCES warehouses (id),
        variant_id    UUID NOT NULL REFERENCES variants (id),
        quantity      BIGINT NOT NULL DEFAULT 0 CHECK (quantity >= 0),
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (warehouse_id, variant_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stock_ledger (
        id              BIGSERIAL PRIMARY KEY,
        warehouse_id    UUID NOT NULL REFERENCES warehouses (id),
        variant_id      UUID NOT NULL REFERENCES variants (id),
        qty_change      BIGINT NOT NULL CHECK (qty_change <> 0),
        entry_type      TEXT NOT NULL CHECK (entry_type IN
                          ('PURCHASE_IN', 'SALE_OUT', 'ADJUST', 'RESERVE', 'RELEASE', 'RETURN')),
        reference_type  TEXT NOT NULL,
        reference_id    TEXT NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS stock_ledger_effect_uq
        ON stock_ledger (warehouse_id, variant_id, qty_change, entry_type, reference_type, reference_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS stock_ledger_stream_idx
        ON stock_ledger (warehouse_id, variant_id, id DESC)
    "#,
    r#"
    CREATE OR REPLACE FUNCTION stock_ledger_append_only() RETURNS trigger AS $$
    BEGIN
        RAISE EXCEPTION 'stock_ledger is append-only';
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"DROP TRIGGER IF EXISTS stock_ledger_append_only ON stock_ledger"#,
    r#"
    CREATE TRIGGER stock_ledger_append_only
        BEFORE UPDATE OR DELETE ON stock_ledger
        FOR EACH ROW EXECUTE FUNCTION stock_ledger_append_only()
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id                UUID PRIMARY KEY,
        warehouse_id      UUID NOT NULL REFERENCES warehouses (id),
        customer_name     TEXT NOT NULL,
        customer_phone    TEXT NOT NULL,
        customer_address  TEXT NOT NULL,
        status            TEXT NOT NULL CHECK (status IN ('PENDING', 'PAID', 'SHIPPED', 'CANCELLED')),
        total_price       BIGINT NOT NULL,
        version           BIGINT NOT NULL,
        created_at        TIMESTAMPTZ NOT NULL,
        updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS order_lines (
        order_id             UUID NOT NULL REFERENCES orders (id),
        line_no              INTEGER NOT NULL,
        variant_id           UUID NULL REFERENCES variants (id),
        quantity             BIGINT NOT NULL CHECK (quantity > 0),
        unit_price_snapshot  BIGINT NOT NULL,
        fulfillment_type     TEXT NOT NULL CHECK (fulfillment_type IN ('WAREHOUSE', 'DROPSHIP')),
        PRIMARY KEY (order_id, line_no)
    )
    "#,
];

/// Postgres-backed inventory store.
///
/// Uses the SQLx connection pool, which is `Send + Sync`; clones share the pool.
///
/// `transaction_timeout` is the engine's budget for one operation. Server-side
/// row lock waits get the same budget, so the database gives up on a lock no
/// earlier than the caller does.
#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: Arc<PgPool>,
    transaction_timeout: Duration,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool, transaction_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            transaction_timeout,
        }
    }

    pub async fn connect(
        database_url: &str,
        transaction_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, transaction_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, indexes and the append-only trigger if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // SET does not take bind parameters; the value is an integer we format ourselves.
        let statement = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.transaction_timeout.as_millis()
        );
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(PostgresTransaction { tx })
    }

    async fn get_on_hand(&self, key: StockKey) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT quantity FROM stock_levels
            WHERE warehouse_id = $1 AND variant_id = $2
            "#,
        )
        .bind(key.warehouse_id.as_uuid())
        .bind(key.variant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_on_hand", e))?;

        match row {
            Some(row) => row
                .try_get::<i64, _>("quantity")
                .map_err(|e| map_sqlx_error("get_on_hand", e)),
            None => Ok(0),
        }
    }

    #[instrument(skip(self), fields(key = %key, limit = page.limit), err)]
    async fn ledger_page(&self, key: StockKey, page: Pagination) -> Result<LedgerPage, StoreError> {
        let before = page.before.map(|id| to_i64(id.0, "entry id")).transpose()?;
        let rows = sqlx::query(
            r#"
            SELECT id, warehouse_id, variant_id, qty_change, entry_type,
                   reference_type, reference_id, created_at
            FROM stock_ledger
            WHERE warehouse_id = $1 AND variant_id = $2
              AND ($3::BIGINT IS NULL OR id < $3)
            ORDER BY id DESC
            LIMIT $4
            "#,
        )
        .bind(key.warehouse_id.as_uuid())
        .bind(key.variant_id.as_uuid())
        .bind(before)
        .bind(i64::from(page.limit) + 1)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_page", e))?;

        let entries = rows
            .iter()
            .map(ledger_entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LedgerPage::from_overfetch(entries, page.limit))
    }

    async fn ledger_sum(&self, key: StockKey) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(qty_change), 0)::BIGINT AS total
            FROM stock_ledger
            WHERE warehouse_id = $1 AND variant_id = $2
            "#,
        )
        .bind(key.warehouse_id.as_uuid())
        .bind(key.variant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_sum", e))?;

        row.try_get::<i64, _>("total")
            .map_err(|e| map_sqlx_error("ledger_sum", e))
    }

    async fn list_stock(&self, warehouse_id: WarehouseId) -> Result<Vec<StockLevel>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT warehouse_id, variant_id, quantity, updated_at
            FROM stock_levels
            WHERE warehouse_id = $1
            ORDER BY variant_id
            "#,
        )
        .bind(warehouse_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stock", e))?;

        rows.iter()
            .map(|row| {
                Ok(StockLevel {
                    key: stock_key_from_row(row)?,
                    quantity: row.try_get("quantity")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("list_stock", e))
    }

    async fn warehouses(&self) -> Result<Vec<Warehouse>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        fetch_warehouses(&mut conn).await
    }

    #[instrument(skip(self, warehouse), fields(code = %warehouse.code), err)]
    async fn create_warehouse(&self, warehouse: &Warehouse) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO warehouses (id, code, name, active, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(warehouse.id.as_uuid())
        .bind(&warehouse.code)
        .bind(&warehouse.name)
        .bind(warehouse.active)
        .bind(warehouse.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_warehouse", e))?;
        Ok(())
    }

    async fn set_warehouse_active(&self, id: WarehouseId, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE warehouses SET active = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(active)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_warehouse_active", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("warehouse {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, variant), fields(sku = %variant.sku), err)]
    async fn register_variant(&self, variant: &Variant) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO variants (id, product_id, sku, price, active)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(variant.id.as_uuid())
        .bind(variant.product_id.as_uuid())
        .bind(&variant.sku)
        .bind(to_i64(variant.price, "price")?)
        .bind(variant.active)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("register_variant", e))?;
        Ok(())
    }

    async fn variants(&self) -> Result<Vec<Variant>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, sku, price, active
            FROM variants
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("variants", e))?;

        rows.iter().map(variant_from_row).collect()
    }

    async fn set_variant_active(&self, id: VariantId, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE variants SET active = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(active)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_variant_active", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("variant {id}")));
        }
        Ok(())
    }

    async fn find_variant(&self, id: VariantId) -> Result<Option<Variant>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        fetch_variant(&mut conn, id).await
    }

    async fn load_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        fetch_order(&mut conn, id, false).await
    }
}

/// A database transaction. Dropping it without commit rolls it back.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StockTransaction for PostgresTransaction {
    #[instrument(level = "debug", skip(self), fields(key = %key), err)]
    async fn lock_stock(&mut self, key: StockKey) -> Result<i64, StoreError> {
        self.ensure_stock_row(key).await?;

        let row = sqlx::query(
            r#"
            SELECT quantity FROM stock_levels
            WHERE warehouse_id = $1 AND variant_id = $2
            FOR UPDATE
            "#,
        )
        .bind(key.warehouse_id.as_uuid())
        .bind(key.variant_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stock", e))?;

        row.try_get::<i64, _>("quantity")
            .map_err(|e| map_sqlx_error("lock_stock", e))
    }

    async fn ensure_stock_row(&mut self, key: StockKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO stock_levels (warehouse_id, variant_id, quantity)
            VALUES ($1, $2, 0)
            ON CONFLICT (warehouse_id, variant_id) DO NOTHING
            "#,
        )
        .bind(key.warehouse_id.as_uuid())
        .bind(key.variant_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("ensure_stock_row", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn ledger_contains(&mut self, entry: &NewLedgerEntry) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM stock_ledger
                WHERE warehouse_id = $1 AND variant_id = $2 AND qty_change = $3
                  AND entry_type = $4 AND reference_type = $5 AND reference_id = $6
            ) AS found
            "#,
        )
        .bind(entry.key.warehouse_id.as_uuid())
        .bind(entry.key.variant_id.as_uuid())
        .bind(entry.qty_change)
        .bind(entry.entry_type.as_str())
        .bind(&entry.reference.reference_type)
        .bind(&entry.reference.reference_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("ledger_contains", e))?;

        row.try_get::<bool, _>("found")
            .map_err(|e| map_sqlx_error("ledger_contains", e))
    }

    #[instrument(
        level = "debug",
        skip(self, entry),
        fields(key = %entry.key, entry_type = %entry.entry_type, qty_change = entry.qty_change),
        err
    )]
    async fn append(&mut self, entry: NewLedgerEntry) -> Result<EntryId, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO stock_ledger (
                warehouse_id, variant_id, qty_change, entry_type, reference_type, reference_id
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (warehouse_id, variant_id, qty_change, entry_type, reference_type, reference_id)
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(entry.key.warehouse_id.as_uuid())
        .bind(entry.key.variant_id.as_uuid())
        .bind(entry.qty_change)
        .bind(entry.entry_type.as_str())
        .bind(&entry.reference.reference_type)
        .bind(&entry.reference.reference_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append", e))?;

        let Some(row) = row else {
            return Err(StoreError::Duplicate(format!(
                "{} {} for {}/{} on {}",
                entry.entry_type,
                entry.qty_change,
                entry.reference.reference_type,
                entry.reference.reference_id,
                entry.key
            )));
        };

        let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("append", e))?;
        Ok(EntryId(to_u64(id, "entry id")?))
    }

    async fn apply_delta(&mut self, key: StockKey, delta: i64) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE stock_levels
            SET quantity = quantity + $3, updated_at = NOW()
            WHERE warehouse_id = $1 AND variant_id = $2
            RETURNING quantity
            "#,
        )
        .bind(key.warehouse_id.as_uuid())
        .bind(key.variant_id.as_uuid())
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("apply_delta", e))?;

        match row {
            Some(row) => row
                .try_get::<i64, _>("quantity")
                .map_err(|e| map_sqlx_error("apply_delta", e)),
            None => Err(StoreError::Conflict(format!(
                "stock row {key} does not exist; lock it first"
            ))),
        }
    }

    async fn find_variant(&mut self, id: VariantId) -> Result<Option<Variant>, StoreError> {
        fetch_variant(&mut self.tx, id).await
    }

    async fn warehouse(&mut self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, code, name, active, created_at
            FROM warehouses
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("warehouse", e))?;

        row.as_ref().map(warehouse_from_row).transpose()
    }

    async fn default_warehouse(&mut self, codes: &[String]) -> Result<Option<Warehouse>, StoreError> {
        let all = fetch_warehouses(&mut self.tx).await?;
        Ok(resolve_default(&all, codes).cloned())
    }

    #[instrument(level = "debug", skip(self), fields(order_id = %id), err)]
    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        fetch_order(&mut self.tx, id, true).await
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let order_id = order.id_typed();
        let warehouse_id = order
            .warehouse_id()
            .ok_or_else(|| StoreError::Conflict(format!("order {order_id} has no warehouse")))?;
        let created_at = order.created_at().unwrap_or_else(Utc::now);

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, warehouse_id, customer_name, customer_phone, customer_address,
                status, total_price, version, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(warehouse_id.as_uuid())
        .bind(&order.customer().name)
        .bind(&order.customer().phone)
        .bind(&order.customer().address)
        .bind(order.status().as_str())
        .bind(to_i64(order.total_price(), "total price")?)
        .bind(to_i64(order.version(), "order version")?)
        .bind(created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        for line in order.lines() {
            sqlx::query(
                r#"
                INSERT INTO order_lines (
                    order_id, line_no, variant_id, quantity, unit_price_snapshot, fulfillment_type
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(order_id.as_uuid())
            .bind(i32::try_from(line.line_no).map_err(|_| {
                StoreError::Conflict(format!("line number {} out of range", line.line_no))
            })?)
            .bind(line.variant_id.map(uuid::Uuid::from))
            .bind(line.quantity.get())
            .bind(to_i64(line.unit_price_snapshot, "unit price")?)
            .bind(line.fulfillment.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order_line", e))?;
        }
        Ok(())
    }

    async fn update_order_status(&mut self, order: &Order) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, version = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order.id_typed().as_uuid())
        .bind(order.status().as_str())
        .bind(to_i64(order.version(), "order version")?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_order_status", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("order {}", order.id_typed())));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

async fn fetch_warehouses(conn: &mut PgConnection) -> Result<Vec<Warehouse>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, code, name, active, created_at
        FROM warehouses
        ORDER BY created_at, id
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("warehouses", e))?;

    rows.iter().map(warehouse_from_row).collect()
}

async fn fetch_variant(conn: &mut PgConnection, id: VariantId) -> Result<Option<Variant>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, product_id, sku, price, active
        FROM variants
        WHERE id = $1
        "#,
    )
    .bind(id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_variant", e))?;

    row.as_ref().map(variant_from_row).transpose()
}

async fn fetch_order(
    conn: &mut PgConnection,
    id: OrderId,
    for_update: bool,
) -> Result<Option<Order>, StoreError> {
    let statement = if for_update {
        r#"
        SELECT id, warehouse_id, customer_name, customer_phone, customer_address,
               status, version, created_at
        FROM orders WHERE id = $1
        FOR UPDATE
        "#
    } else {
        r#"
        SELECT id, warehouse_id, customer_name, customer_phone, customer_address,
               status, version, created_at
        FROM orders WHERE id = $1
        "#
    };

    let Some(row) = sqlx::query(statement)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_order", e))?
    else {
        return Ok(None);
    };

    let line_rows = sqlx::query(
        r#"
        SELECT line_no, variant_id, quantity, unit_price_snapshot, fulfillment_type
        FROM order_lines
        WHERE order_id = $1
        ORDER BY line_no
        "#,
    )
    .bind(id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_order_lines", e))?;

    let lines = line_rows
        .iter()
        .map(order_line_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    order_from_row(&row, lines).map(Some)
}

fn stock_key_from_row(row: &PgRow) -> Result<StockKey, sqlx::Error> {
    let warehouse_id: uuid::Uuid = row.try_get("warehouse_id")?;
    let variant_id: uuid::Uuid = row.try_get("variant_id")?;
    Ok(StockKey::new(
        WarehouseId::from_uuid(warehouse_id),
        VariantId::from_uuid(variant_id),
    ))
}

fn ledger_entry_from_row(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    let decode = |e| map_sqlx_error("decode_ledger_entry", e);

    let id: i64 = row.try_get("id").map_err(decode)?;
    let entry_type: String = row.try_get("entry_type").map_err(decode)?;
    let entry_type = LedgerEntryType::parse(&entry_type)
        .ok_or_else(|| StoreError::Backend(format!("unknown ledger entry type '{entry_type}'")))?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;

    Ok(LedgerEntry {
        id: EntryId(to_u64(id, "entry id")?),
        key: stock_key_from_row(row).map_err(decode)?,
        qty_change: row.try_get("qty_change").map_err(decode)?,
        entry_type,
        reference: Reference {
            reference_type: row.try_get("reference_type").map_err(decode)?,
            reference_id: row.try_get("reference_id").map_err(decode)?,
        },
        created_at,
    })
}

fn warehouse_from_row(row: &PgRow) -> Result<Warehouse, StoreError> {
    let decode = |e| map_sqlx_error("decode_warehouse", e);
    let id: uuid::Uuid = row.try_get("id").map_err(decode)?;
    Ok(Warehouse {
        id: WarehouseId::from_uuid(id),
        code: row.try_get("code").map_err(decode)?,
        name: row.try_get("name").map_err(decode)?,
        active: row.try_get("active").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

fn variant_from_row(row: &PgRow) -> Result<Variant, StoreError> {
    let decode = |e| map_sqlx_error("decode_variant", e);
    let id: uuid::Uuid = row.try_get("id").map_err(decode)?;
    let product_id: uuid::Uuid = row.try_get("product_id").map_err(decode)?;
    let price: i64 = row.try_get("price").map_err(decode)?;
    Ok(Variant {
        id: VariantId::from_uuid(id),
        product_id: ProductId::from_uuid(product_id),
        sku: row.try_get("sku").map_err(decode)?,
        price: to_u64(price, "price")?,
        active: row.try_get("active").map_err(decode)?,
    })
}

fn order_line_from_row(row: &PgRow) -> Result<OrderLine, StoreError> {
    let decode = |e| map_sqlx_error("decode_order_line", e);
    let line_no: i32 = row.try_get("line_no").map_err(decode)?;
    let variant_id: Option<uuid::Uuid> = row.try_get("variant_id").map_err(decode)?;
    let quantity: i64 = row.try_get("quantity").map_err(decode)?;
    let unit_price: i64 = row.try_get("unit_price_snapshot").map_err(decode)?;
    let fulfillment: String = row.try_get("fulfillment_type").map_err(decode)?;

    Ok(OrderLine {
        line_no: u32::try_from(line_no)
            .map_err(|_| StoreError::Backend(format!("invalid line number {line_no}")))?,
        variant_id: variant_id.map(VariantId::from_uuid),
        quantity: Quantity::new(quantity).map_err(|e| StoreError::Backend(e.to_string()))?,
        unit_price_snapshot: to_u64(unit_price, "unit price")?,
        fulfillment: FulfillmentType::parse(&fulfillment).ok_or_else(|| {
            StoreError::Backend(format!("unknown fulfillment type '{fulfillment}'"))
        })?,
    })
}

fn order_from_row(row: &PgRow, lines: Vec<OrderLine>) -> Result<Order, StoreError> {
    let decode = |e| map_sqlx_error("decode_order", e);
    let id: uuid::Uuid = row.try_get("id").map_err(decode)?;
    let warehouse_id: uuid::Uuid = row.try_get("warehouse_id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;

    Ok(Order::restore(
        OrderId::from_uuid(id),
        WarehouseId::from_uuid(warehouse_id),
        Customer {
            name: row.try_get("customer_name").map_err(decode)?,
            phone: row.try_get("customer_phone").map_err(decode)?,
            address: row.try_get("customer_address").map_err(decode)?,
        },
        OrderStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown order status '{status}'")))?,
        lines,
        row.try_get("created_at").map_err(decode)?,
        to_u64(version, "order version")?,
    ))
}

fn to_i64(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Conflict(format!("{what} {value} out of range")))
}

fn to_u64(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Backend(format!("negative {what} {value}")))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                Some("55P03") => StoreError::LockTimeout(msg),
                Some("40P01") | Some("40001") => StoreError::Conflict(msg),
                Some("23514") | Some("23503") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
