//! Schema for orders, order failures and durable inventory.
//!
//! Statements are idempotent (`IF NOT EXISTS`) so [`migrate`] can run on
//! every startup.

use crate::db_error;
use flashsale_core::StoreError;
use sqlx::PgPool;

/// DDL statements, applied in order.
pub const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS orders (
        id BIGSERIAL PRIMARY KEY,
        order_id VARCHAR(64) NOT NULL UNIQUE,
        user_id BIGINT NOT NULL,
        product_id BIGINT NOT NULL,
        product_name VARCHAR(255) NOT NULL,
        quantity BIGINT NOT NULL,
        price DOUBLE PRECISION NOT NULL,
        total_amount DOUBLE PRECISION NOT NULL,
        status VARCHAR(20) NOT NULL,
        order_type VARCHAR(20) NOT NULL,
        trace_id VARCHAR(64) NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        expired_at TIMESTAMPTZ
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_orders_product ON orders(product_id)",
    r"
    CREATE TABLE IF NOT EXISTS order_items (
        id BIGSERIAL PRIMARY KEY,
        order_id VARCHAR(64) NOT NULL REFERENCES orders(order_id),
        product_id BIGINT NOT NULL,
        product_name VARCHAR(255) NOT NULL,
        quantity BIGINT NOT NULL,
        price DOUBLE PRECISION NOT NULL,
        total_amount DOUBLE PRECISION NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS order_idempotency (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL,
        product_id BIGINT NOT NULL,
        order_id VARCHAR(64) NOT NULL,
        trace_id VARCHAR(64) NOT NULL DEFAULT '',
        status VARCHAR(20) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (user_id, product_id)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS order_failures (
        id BIGSERIAL PRIMARY KEY,
        order_id VARCHAR(64) NOT NULL,
        user_id BIGINT NOT NULL,
        product_id BIGINT NOT NULL,
        failure_type VARCHAR(50) NOT NULL,
        message_data TEXT NOT NULL,
        error_msg TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        next_retry_at TIMESTAMPTZ,
        status VARCHAR(20) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_order_failures_due ON order_failures(status, next_retry_at)",
    "CREATE INDEX IF NOT EXISTS idx_order_failures_order ON order_failures(order_id)",
    r"
    CREATE TABLE IF NOT EXISTS inventories (
        id BIGSERIAL PRIMARY KEY,
        product_id BIGINT NOT NULL UNIQUE,
        product_name VARCHAR(255) NOT NULL,
        stock BIGINT NOT NULL DEFAULT 0,
        reserved BIGINT NOT NULL DEFAULT 0,
        available BIGINT NOT NULL DEFAULT 0,
        version BIGINT NOT NULL DEFAULT 0,
        status VARCHAR(20) NOT NULL,
        min_stock BIGINT NOT NULL DEFAULT 0,
        max_stock BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_inventories_status ON inventories(status)",
    r"
    CREATE TABLE IF NOT EXISTS inventory_logs (
        id BIGSERIAL PRIMARY KEY,
        product_id BIGINT NOT NULL,
        op_type VARCHAR(20) NOT NULL,
        delta BIGINT NOT NULL,
        before_stock BIGINT NOT NULL,
        after_stock BIGINT NOT NULL,
        order_id VARCHAR(64),
        reason VARCHAR(255) NOT NULL DEFAULT '',
        operator VARCHAR(100) NOT NULL DEFAULT '',
        trace_id VARCHAR(64) NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_inventory_logs_product_time ON inventory_logs(product_id, created_at DESC)",
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_inventory_logs_order
    ON inventory_logs(product_id, order_id)
    WHERE order_id IS NOT NULL
    ",
    r"
    CREATE TABLE IF NOT EXISTS inventory_diffs (
        id BIGSERIAL PRIMARY KEY,
        product_id BIGINT NOT NULL,
        db_stock BIGINT NOT NULL,
        redis_stock BIGINT NOT NULL,
        diff BIGINT NOT NULL,
        status VARCHAR(20) NOT NULL,
        fixed_at TIMESTAMPTZ,
        fixed_by VARCHAR(100),
        remark TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_inventory_diffs_status_time ON inventory_diffs(status, created_at)",
    r"
    CREATE TABLE IF NOT EXISTS inventory_alerts (
        id BIGSERIAL PRIMARY KEY,
        product_id BIGINT NOT NULL,
        alert_type VARCHAR(20) NOT NULL,
        level VARCHAR(10) NOT NULL,
        message TEXT NOT NULL,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
];

/// Apply every schema statement.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if a statement fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    let mut conn = pool.acquire().await.map_err(db_error)?;
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
    }
    tracing::info!(statements = STATEMENTS.len(), "Database schema up to date");
    Ok(())
}
