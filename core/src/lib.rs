//! # Flashsale Core
//!
//! Domain types and collaborator traits for the flash-sale coordination engine.
//!
//! The engine sells a fixed stock of a product during a time-boxed activity,
//! at most once per user, under bursty concurrent demand. This crate holds the
//! pieces every other crate agrees on:
//!
//! - **Data model**: [`activity::Activity`], purchase outcomes and result codes
//!   ([`purchase`]), durable orders and failure records ([`order`]), durable
//!   inventory, operation log and drift records ([`inventory`])
//! - **Wire messages**: order-creation and stock-update messages ([`message`])
//!   carried by a [`message_bus::MessageBus`]
//! - **Collaborator traits** ([`store`]): the fast path ([`store::FastStore`],
//!   [`store::LockBackend`]) and the durable side ([`store::OrderStore`],
//!   [`store::InventoryStore`])
//! - **Key derivation** for the fast store ([`keys`])
//!
//! ## Example
//!
//! ```ignore
//! use flashsale_core::purchase::{PurchaseRequest, PurchaseOutcome};
//!
//! let request = PurchaseRequest::new(1001, 42, 1);
//! match store.purchase(&request, clock.now()).await? {
//!     PurchaseOutcome::Success { remaining_stock } => { /* emit messages */ }
//!     other => tracing::debug!(code = other.code(), "purchase rejected"),
//! }
//! ```

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod activity;
pub mod error;
pub mod inventory;
pub mod keys;
pub mod message;
pub mod message_bus;
pub mod order;
pub mod purchase;
pub mod store;

/// Environment traits injected into services.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use flashsale_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use error::{LockError, StoreError};
