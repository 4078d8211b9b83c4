//! Versioned inventory rows, the operation log, drift records and alerts.

use crate::{db_error, limit_param};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flashsale_core::StoreError;
use flashsale_core::inventory::{
    DiffStatus, InventoryAlert, InventoryDiff, InventoryLogEntry, InventoryOperation,
    InventoryRecord, InventoryStatus, NewInventoryDiff, SyncStockRequest, SyncStockResponse,
};
use flashsale_core::store::InventoryStore;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

const INVENTORY_COLUMNS: &str = "product_id, product_name, stock, reserved, available, version, \
     status, min_stock, max_stock, updated_at";
const LOG_COLUMNS: &str = "id, product_id, op_type, delta, before_stock, after_stock, order_id, \
     reason, operator, trace_id, created_at";
const DIFF_COLUMNS: &str =
    "id, product_id, db_stock, redis_stock, diff, status, fixed_at, fixed_by, remark, created_at";

const SYSTEM_OPERATOR: &str = "system";

/// `PostgreSQL` [`InventoryStore`].
#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
}

impl PostgresInventoryStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &PgRow) -> Result<InventoryRecord, StoreError> {
        let status: String = row.get("status");
        Ok(InventoryRecord {
            product_id: row.get("product_id"),
            product_name: row.get("product_name"),
            stock: row.get("stock"),
            reserved: row.get("reserved"),
            available: row.get("available"),
            version: row.get("version"),
            status: InventoryStatus::parse(&status).ok_or_else(|| {
                StoreError::Database(format!("Invalid inventory status: {status}"))
            })?,
            min_stock: row.get("min_stock"),
            max_stock: row.get("max_stock"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_log(row: &PgRow) -> Result<InventoryLogEntry, StoreError> {
        let op_type: String = row.get("op_type");
        Ok(InventoryLogEntry {
            id: row.get("id"),
            product_id: row.get("product_id"),
            operation: InventoryOperation::parse(&op_type)
                .ok_or_else(|| StoreError::Database(format!("Invalid operation: {op_type}")))?,
            delta: row.get("delta"),
            before_stock: row.get("before_stock"),
            after_stock: row.get("after_stock"),
            order_id: row.get("order_id"),
            reason: row.get("reason"),
            operator: row.get("operator"),
            trace_id: row.get("trace_id"),
            created_at: row.get("created_at"),
        })
    }

    fn row_to_diff(row: &PgRow) -> Result<InventoryDiff, StoreError> {
        let status: String = row.get("status");
        Ok(InventoryDiff {
            id: row.get("id"),
            product_id: row.get("product_id"),
            durable_stock: row.get("db_stock"),
            fast_stock: row.get("redis_stock"),
            diff: row.get("diff"),
            status: DiffStatus::parse(&status)
                .ok_or_else(|| StoreError::Database(format!("Invalid diff status: {status}")))?,
            fixed_at: row.get("fixed_at"),
            fixed_by: row.get("fixed_by"),
            remark: row.get("remark"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    async fn init_inventory(
        &self,
        product_id: i64,
        product_name: &str,
        stock: i64,
        min_stock: i64,
    ) -> Result<bool, StoreError> {
        if stock < 0 {
            return Err(StoreError::InvalidInput(format!(
                "initial stock must not be negative, got {stock}"
            )));
        }

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let inserted = sqlx::query(
            r"
            INSERT INTO inventories (
                product_id, product_name, stock, reserved, available, version,
                status, min_stock, max_stock
            ) VALUES ($1, $2, $3, 0, $3, 1, $4, $5, $3)
            ON CONFLICT (product_id) DO NOTHING
            ",
        )
        .bind(product_id)
        .bind(product_name)
        .bind(stock)
        .bind(InventoryStatus::Active.as_str())
        .bind(min_stock)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?
        .rows_affected()
            == 1;

        if !inserted {
            tx.rollback().await.map_err(db_error)?;
            return Ok(false);
        }

        sqlx::query(
            r"
            INSERT INTO inventory_logs (
                product_id, op_type, delta, before_stock, after_stock, reason, operator
            ) VALUES ($1, $2, $3, 0, $3, 'activity preload', $4)
            ",
        )
        .bind(product_id)
        .bind(InventoryOperation::Init.as_str())
        .bind(stock)
        .bind(SYSTEM_OPERATOR)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        tracing::info!(product_id, stock, "Inventory initialized");
        Ok(true)
    }

    async fn get_inventory(&self, product_id: i64) -> Result<Option<InventoryRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventories WHERE product_id = $1"
        ))
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn active_inventories(&self) -> Result<Vec<InventoryRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventories WHERE status = 'active' ORDER BY product_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn sync_stock(&self, request: &SyncStockRequest) -> Result<SyncStockResponse, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        if let Some(order_id) = &request.order_id {
            let applied = sqlx::query(
                r"
                SELECT delta, before_stock, after_stock
                FROM inventory_logs
                WHERE product_id = $1 AND order_id = $2
                ",
            )
            .bind(request.product_id)
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?;

            if let Some(row) = applied {
                tx.rollback().await.map_err(db_error)?;
                tracing::debug!(
                    product_id = request.product_id,
                    order_id = %order_id,
                    "Inventory sync already applied"
                );
                return Ok(SyncStockResponse {
                    product_id: request.product_id,
                    before_stock: row.get("before_stock"),
                    after_stock: row.get("after_stock"),
                    delta: row.get("delta"),
                    success: true,
                    message: Some("already applied".into()),
                });
            }
        }

        sqlx::query(
            r"
            INSERT INTO inventories (product_id, product_name, stock, available, version, status)
            VALUES ($1, $2, 0, 0, 1, $3)
            ON CONFLICT (product_id) DO NOTHING
            ",
        )
        .bind(request.product_id)
        .bind(format!("product {}", request.product_id))
        .bind(InventoryStatus::Active.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let (before_stock, reserved, version): (i64, i64, i64) = sqlx::query_as(
            "SELECT stock, reserved, version FROM inventories WHERE product_id = $1",
        )
        .bind(request.product_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        let after_stock = before_stock + request.delta;
        if after_stock < 0 {
            tx.rollback().await.map_err(db_error)?;
            tracing::warn!(
                product_id = request.product_id,
                stock = before_stock,
                delta = request.delta,
                "Inventory sync refused, insufficient stock"
            );
            return Ok(SyncStockResponse::refused(
                request.product_id,
                before_stock,
                request.delta,
                "insufficient stock",
            ));
        }

        let updated = sqlx::query(
            r"
            UPDATE inventories
            SET stock = $1, available = $2, version = version + 1, updated_at = now()
            WHERE product_id = $3 AND version = $4
            ",
        )
        .bind(after_stock)
        .bind(after_stock - reserved)
        .bind(request.product_id)
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(db_error)?;
            return Err(StoreError::Conflict(format!(
                "inventory {} version {version} moved",
                request.product_id
            )));
        }

        sqlx::query(
            r"
            INSERT INTO inventory_logs (
                product_id, op_type, delta, before_stock, after_stock,
                order_id, reason, operator, trace_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(request.product_id)
        .bind(InventoryOperation::for_delta(request.delta).as_str())
        .bind(request.delta)
        .bind(before_stock)
        .bind(after_stock)
        .bind(request.order_id.as_deref())
        .bind(&request.reason)
        .bind(SYSTEM_OPERATOR)
        .bind(&request.trace_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        tracing::info!(
            product_id = request.product_id,
            before_stock,
            after_stock,
            delta = request.delta,
            "Inventory synced"
        );
        Ok(SyncStockResponse {
            product_id: request.product_id,
            before_stock,
            after_stock,
            delta: request.delta,
            success: true,
            message: None,
        })
    }

    async fn operation_log(
        &self,
        product_id: i64,
        limit: usize,
    ) -> Result<Vec<InventoryLogEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {LOG_COLUMNS}
            FROM inventory_logs
            WHERE product_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "
        ))
        .bind(product_id)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_log).collect()
    }

    async fn record_diff(&self, diff: NewInventoryDiff) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO inventory_diffs (product_id, db_stock, redis_stock, diff, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            ",
        )
        .bind(diff.product_id)
        .bind(diff.durable_stock)
        .bind(diff.fast_stock)
        .bind(diff.diff())
        .bind(DiffStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(id)
    }

    async fn get_diff(&self, id: i64) -> Result<Option<InventoryDiff>, StoreError> {
        let row = sqlx::query(&format!("SELECT {DIFF_COLUMNS} FROM inventory_diffs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(Self::row_to_diff).transpose()
    }

    async fn pending_diffs(&self, limit: usize) -> Result<Vec<InventoryDiff>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {DIFF_COLUMNS}
            FROM inventory_diffs
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "
        ))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_diff).collect()
    }

    async fn resolve_diff(
        &self,
        id: i64,
        status: DiffStatus,
        fixed_by: &str,
        remark: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE inventory_diffs
            SET status = $1, fixed_at = $2, fixed_by = $3, remark = $4
            WHERE id = $5 AND status = 'pending'
            ",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(fixed_by)
        .bind(remark)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn create_alert(&self, alert: &InventoryAlert) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO inventory_alerts (product_id, alert_type, level, message)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(alert.product_id)
        .bind(alert.kind.as_str())
        .bind(alert.level.as_str())
        .bind(&alert.message)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        tracing::warn!(
            product_id = alert.product_id,
            kind = alert.kind.as_str(),
            level = alert.level.as_str(),
            message = %alert.message,
            "Inventory alert raised"
        );
        Ok(())
    }
}
