//! # Flash-sale Seckill
//!
//! The coordination engine of the flash sale: admission, purchase and the
//! eventual-consistency machinery behind it.
//!
//! ```text
//! request ─► limiter ─► breaker ─► purchase script ─► stock + order messages
//!                                                           │
//!                     ┌─────────────────────────────────────┘
//!                     ▼
//!            OrderCompensator ──► durable order + inventory sync
//!                     │                 (failures retried with backoff)
//!                     ▼
//!           InventoryReconciler ──► audit fast path vs durable, heal drift
//! ```
//!
//! - [`SeckillCoordinator`]: synchronous and queued purchase entry points,
//!   activity preload, stats surfaces
//! - [`OrderCompensator`]: idempotent order creation, persisted retries,
//!   release of abandoned deductions
//! - [`InventoryReconciler`]: periodic drift audit and fixes
//! - [`InventorySync`]: conflict-retrying durable stock writer
//! - [`FlashsaleApp`]: wiring and lifecycle of all of the above

pub mod app;
pub mod compensator;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod inventory;
pub mod reconciler;

pub use app::{AppError, AppParts, FlashsaleApp, SECKILL_BREAKER};
pub use compensator::{
    CompensationError, CompensatorConfig, CompensatorStats, OrderCompensator, OrderHandled,
};
pub use config::{Config, ConfigError, FixPolicy};
pub use consumer::{MessageConsumer, MessageHandler};
pub use coordinator::{
    CoordinatorConfig, PendingSeckill, SeckillCoordinator, SeckillCoordinatorBuilder, ServiceStats,
};
pub use inventory::InventorySync;
pub use reconciler::{
    InventoryReconciler, ProductHealth, ReconcileError, ReconcileStats, ReconcilerConfig,
};
