//! Orders, idempotency rows and order failure records.

use crate::{db_error, limit_param};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flashsale_core::StoreError;
use flashsale_core::order::{
    CreateOrderOutcome, CreateOrderRequest, FailureStatus, NewOrderFailure, Order, OrderFailure,
    OrderStatus,
};
use flashsale_core::store::OrderStore;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

const FAILURE_COLUMNS: &str = "id, order_id, user_id, product_id, failure_type, message_data, \
     error_msg, retry_count, max_retries, next_retry_at, status, created_at, updated_at";

/// `PostgreSQL` [`OrderStore`].
#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_order(row: &PgRow) -> Result<Order, StoreError> {
        let status: String = row.get("status");
        Ok(Order {
            order_id: row.get("order_id"),
            user_id: row.get("user_id"),
            product_id: row.get("product_id"),
            product_name: row.get("product_name"),
            quantity: row.get("quantity"),
            price: row.get("price"),
            total_amount: row.get("total_amount"),
            status: OrderStatus::parse(&status)
                .ok_or_else(|| StoreError::Database(format!("Invalid order status: {status}")))?,
            order_type: row.get("order_type"),
            trace_id: row.get("trace_id"),
            created_at: row.get("created_at"),
            expired_at: row.get("expired_at"),
        })
    }

    fn row_to_failure(row: &PgRow) -> Result<OrderFailure, StoreError> {
        let status: String = row.get("status");
        let retry_count: i32 = row.get("retry_count");
        let max_retries: i32 = row.get("max_retries");
        Ok(OrderFailure {
            id: row.get("id"),
            order_id: row.get("order_id"),
            user_id: row.get("user_id"),
            product_id: row.get("product_id"),
            failure_type: row.get("failure_type"),
            message_data: row.get("message_data"),
            error_msg: row.get("error_msg"),
            retry_count: u32::try_from(retry_count).unwrap_or(0),
            max_retries: u32::try_from(max_retries).unwrap_or(0),
            next_retry_at: row.get("next_retry_at"),
            status: FailureStatus::parse(&status)
                .ok_or_else(|| StoreError::Database(format!("Invalid failure status: {status}")))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn existing_order_id(
        conn: &mut sqlx::PgConnection,
        user_id: i64,
        product_id: i64,
    ) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT order_id FROM order_idempotency WHERE user_id = $1 AND product_id = $2",
        )
        .bind(user_id)
        .bind(product_id)
        .fetch_optional(conn)
        .await
        .map_err(db_error)?;
        Ok(row.map(|(order_id,)| order_id))
    }
}

fn count_param(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn create_order(
        &self,
        request: &CreateOrderRequest,
        expires_at: DateTime<Utc>,
    ) -> Result<CreateOrderOutcome, StoreError> {
        request.validate().map_err(StoreError::InvalidInput)?;
        let total_amount = request.total_amount();

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        if let Some(existing_order_id) =
            Self::existing_order_id(&mut tx, request.user_id, request.product_id).await?
        {
            tx.rollback().await.map_err(db_error)?;
            tracing::info!(
                order_id = %request.order_id,
                existing_order_id = %existing_order_id,
                user_id = request.user_id,
                product_id = request.product_id,
                "Duplicate order, idempotency row exists"
            );
            return Ok(CreateOrderOutcome::Duplicate { existing_order_id });
        }

        let row = sqlx::query(
            r"
            INSERT INTO orders (
                order_id, user_id, product_id, product_name, quantity, price,
                total_amount, status, order_type, trace_id, expired_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING order_id, user_id, product_id, product_name, quantity, price,
                      total_amount, status, order_type, trace_id, created_at, expired_at
            ",
        )
        .bind(&request.order_id)
        .bind(request.user_id)
        .bind(request.product_id)
        .bind(&request.product_name)
        .bind(request.quantity)
        .bind(request.price)
        .bind(total_amount)
        .bind(OrderStatus::Pending.as_str())
        .bind(&request.order_type)
        .bind(&request.trace_id)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
        let order = Self::row_to_order(&row)?;

        sqlx::query(
            r"
            INSERT INTO order_items (order_id, product_id, product_name, quantity, price, total_amount)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(&request.order_id)
        .bind(request.product_id)
        .bind(&request.product_name)
        .bind(request.quantity)
        .bind(request.price)
        .bind(total_amount)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        // A concurrent writer for the same (user, product) makes this a no-op.
        let inserted: Option<(i64,)> = sqlx::query_as(
            r"
            INSERT INTO order_idempotency (user_id, product_id, order_id, trace_id, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, product_id) DO NOTHING
            RETURNING id
            ",
        )
        .bind(request.user_id)
        .bind(request.product_id)
        .bind(&request.order_id)
        .bind(&request.trace_id)
        .bind(OrderStatus::Pending.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        if inserted.is_none() {
            tx.rollback().await.map_err(db_error)?;
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            let existing_order_id =
                Self::existing_order_id(&mut conn, request.user_id, request.product_id)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Database("idempotency row vanished after conflict".into())
                    })?;
            return Ok(CreateOrderOutcome::Duplicate { existing_order_id });
        }

        tx.commit().await.map_err(db_error)?;

        tracing::info!(
            order_id = %order.order_id,
            user_id = order.user_id,
            product_id = order.product_id,
            amount = order.total_amount,
            "Order created"
        );
        Ok(CreateOrderOutcome::Created(order))
    }

    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT order_id, user_id, product_id, product_name, quantity, price,
                   total_amount, status, order_type, trace_id, created_at, expired_at
            FROM orders
            WHERE order_id = $1
            ",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn record_failure(&self, failure: NewOrderFailure) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO order_failures (
                order_id, user_id, product_id, failure_type, message_data,
                error_msg, retry_count, max_retries, next_retry_at, status
            ) VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, $9)
            RETURNING id
            ",
        )
        .bind(&failure.order_id)
        .bind(failure.user_id)
        .bind(failure.product_id)
        .bind(&failure.failure_type)
        .bind(&failure.message_data)
        .bind(&failure.error_msg)
        .bind(count_param(failure.max_retries))
        .bind(failure.next_retry_at)
        .bind(FailureStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        tracing::warn!(
            failure_id = id,
            order_id = %failure.order_id,
            failure_type = %failure.failure_type,
            error = %failure.error_msg,
            "Order failure recorded"
        );
        Ok(id)
    }

    async fn due_failures(
        &self,
        now: DateTime<Utc>,
        created_after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OrderFailure>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {FAILURE_COLUMNS}
            FROM order_failures
            WHERE status = 'pending'
              AND next_retry_at <= $1
              AND retry_count < max_retries
              AND created_at > $2
            ORDER BY next_retry_at ASC, id ASC
            LIMIT $3
            "
        ))
        .bind(now)
        .bind(created_after)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_failure).collect()
    }

    async fn get_failure(&self, id: i64) -> Result<Option<OrderFailure>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FAILURE_COLUMNS} FROM order_failures WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::row_to_failure).transpose()
    }

    async fn set_failure_status(
        &self,
        id: i64,
        status: FailureStatus,
        error_msg: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE order_failures
            SET status = $1, error_msg = COALESCE($2, error_msg), updated_at = $3
            WHERE id = $4
            ",
        )
        .bind(status.as_str())
        .bind(error_msg)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("order failure {id}")));
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: i64,
        retry_count: u32,
        error_msg: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE order_failures
            SET status = 'pending', retry_count = $1, error_msg = $2,
                next_retry_at = $3, updated_at = $4
            WHERE id = $5
            ",
        )
        .bind(count_param(retry_count))
        .bind(error_msg)
        .bind(next_retry_at)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("order failure {id}")));
        }
        Ok(())
    }

    async fn expire_failures(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<OrderFailure>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            UPDATE order_failures
            SET status = 'expired', updated_at = $1
            WHERE status IN ('pending', 'processing')
              AND created_at < $2
            RETURNING {FAILURE_COLUMNS}
            "
        ))
        .bind(now)
        .bind(created_before)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_failure).collect()
    }

    async fn list_failures(
        &self,
        status: Option<FailureStatus>,
        limit: usize,
    ) -> Result<Vec<OrderFailure>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {FAILURE_COLUMNS}
            FROM order_failures
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_failure).collect()
    }
}
