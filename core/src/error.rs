//! Error types shared by the fast-path and durable collaborators.

use thiserror::Error;

/// Errors raised by fast-store, order-store and inventory-store implementations.
///
/// Business rejections (sold out, already bought, outside the window) are
/// *not* errors: they travel as [`PurchaseOutcome`](crate::purchase::PurchaseOutcome)
/// values. A `StoreError` always means the store itself misbehaved or refused
/// the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the connection dropped
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A server-side script failed or replied with an unexpected shape
    #[error("Script error: {0}")]
    Script(String),

    /// A stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The addressed record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// An optimistic version check failed; the caller may retry
    #[error("Version conflict: {0}")]
    Conflict(String),

    /// The durable database rejected the statement
    #[error("Database error: {0}")]
    Database(String),

    /// The input violates a precondition (negative stock, empty window, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    /// Whether retrying the same operation later could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Conflict(_) | Self::Database(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Errors raised by the distributed lock.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another owner holds the lock
    #[error("Lock '{0}' is held by another owner")]
    NotAcquired(String),

    /// Release or renew was attempted with a token that no longer owns the lock
    #[error("Lock '{0}' is not held by this owner")]
    NotHeld(String),

    /// Bounded acquisition gave up
    #[error("Lock '{key}' still busy after {attempts} attempts")]
    Busy {
        /// The contended key
        key: String,
        /// How many acquisition attempts were made
        attempts: usize,
    },

    /// The backing store failed
    #[error("Lock backend error: {0}")]
    Backend(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_classified() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(StoreError::Conflict("version 3".into()).is_transient());
        assert!(!StoreError::InvalidInput("stock < 0".into()).is_transient());
        assert!(!StoreError::NotFound("product 1".into()).is_transient());
    }

    #[test]
    fn lock_error_wraps_store_error() {
        let err: LockError = StoreError::Unavailable("redis".into()).into();
        assert!(matches!(err, LockError::Backend(_)));
        assert_eq!(
            LockError::Busy { key: "seckill:lock:1".into(), attempts: 50 }.to_string(),
            "Lock 'seckill:lock:1' still busy after 50 attempts"
        );
    }
}
