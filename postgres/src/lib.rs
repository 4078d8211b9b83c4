//! `PostgreSQL` durable stores for the flash-sale engine.
//!
//! - [`PostgresOrderStore`]: orders, line items and the (user, product)
//!   idempotency row written in one transaction, plus order failure records
//!   for the compensation scheduler
//! - [`PostgresInventoryStore`]: versioned inventory rows mutated under an
//!   optimistic version check, the append-only operation log, drift records
//!   and alerts
//!
//! Queries use runtime-checked `sqlx::query` so the crate builds without a
//! database.
//!
//! # Example
//!
//! ```ignore
//! use flashsale_postgres::{connect, migrate, PostgresOrderStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/flashsale", 10).await?;
//!     migrate(&pool).await?;
//!     let orders = PostgresOrderStore::from_pool(pool);
//!     Ok(())
//! }
//! ```

mod inventory;
mod orders;
mod schema;

pub use inventory::PostgresInventoryStore;
pub use orders::PostgresOrderStore;
pub use schema::{STATEMENTS, migrate};

use flashsale_core::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Unavailable(format!("Failed to connect to database: {e}")))
}

/// Map a sqlx error onto the store taxonomy.
pub(crate) fn db_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(error.to_string())
        }
        other => StoreError::Database(other.to_string()),
    }
}

/// Clamp a row limit for binding as `BIGINT`.
pub(crate) fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
