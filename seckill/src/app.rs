//! Application wiring and lifecycle.
//!
//! [`FlashsaleApp`] owns the coordinator, the compensator and the reconciler
//! and runs their background tasks:
//!
//! 1. **Startup**: connect the stores and the bus, spawn the order consumer,
//!    the compensation scheduler and the reconciler
//! 2. **Runtime**: serve purchases through [`FlashsaleApp::coordinator`]
//! 3. **Shutdown**: broadcast the stop signal, wait for every task (10s
//!    timeout each), then drain the request queue

use crate::compensator::{CompensatorConfig, OrderCompensator};
use crate::config::{Config, ConfigError};
use crate::consumer::{MessageConsumer, MessageHandler};
use crate::coordinator::{CoordinatorConfig, SeckillCoordinator};
use crate::inventory::InventorySync;
use crate::reconciler::{InventoryReconciler, ReconcilerConfig};
use flashsale_core::environment::{Clock, SystemClock};
use flashsale_core::message_bus::{MessageBus, MessageBusError};
use flashsale_core::store::{FastStore, InventoryStore, LockBackend, OrderStore};
use flashsale_core::StoreError;
use flashsale_postgres::{PostgresInventoryStore, PostgresOrderStore};
use flashsale_redis::{RedisFastStore, RedisLockBackend};
use flashsale_redpanda::RedpandaMessageBus;
use flashsale_runtime::CircuitBreakerRegistry;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Registry name of the breaker around the purchase step.
pub const SECKILL_BREAKER: &str = "seckill";

/// Application errors
#[derive(Error, Debug)]
pub enum AppError {
    /// A store could not be reached or migrated
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The message bus could not be created
    #[error("Message bus error: {0}")]
    MessageBus(#[from] MessageBusError),

    /// The configuration is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Collaborators the application is assembled from.
#[derive(Clone)]
pub struct AppParts {
    /// Fast-path store
    pub fast: Arc<dyn FastStore>,
    /// Backend of the per-product distributed lock
    pub locks: Arc<dyn LockBackend>,
    /// Durable orders and failure records
    pub orders: Arc<dyn OrderStore>,
    /// Durable inventory
    pub inventory: Arc<dyn InventoryStore>,
    /// Message channel
    pub bus: Arc<dyn MessageBus>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

/// The assembled flash-sale engine.
pub struct FlashsaleApp {
    config: Arc<Config>,
    bus: Arc<dyn MessageBus>,
    coordinator: Arc<SeckillCoordinator>,
    compensator: Arc<OrderCompensator>,
    reconciler: Arc<InventoryReconciler>,
    breakers: CircuitBreakerRegistry,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl FlashsaleApp {
    /// Connect Redis, PostgreSQL and Redpanda, run migrations and assemble
    /// the engine.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if the configuration is invalid or any backend is
    /// unreachable.
    pub async fn connect(config: Config) -> Result<Self, AppError> {
        config.validate()?;

        info!("Connecting to Redis...");
        let fast = Arc::new(RedisFastStore::new(&config.redis.url).await?);
        let locks = Arc::new(RedisLockBackend::new(&config.redis.url).await?);
        info!("Redis connected");

        info!("Connecting to PostgreSQL...");
        let pool =
            flashsale_postgres::connect(&config.postgres.url, config.postgres.max_connections)
                .await?;
        flashsale_postgres::migrate(&pool).await?;
        let orders = Arc::new(PostgresOrderStore::from_pool(pool.clone()));
        let inventory = Arc::new(PostgresInventoryStore::from_pool(pool));
        info!("PostgreSQL connected, schema migrated");

        info!("Connecting to Redpanda...");
        let bus = Arc::new(
            RedpandaMessageBus::builder()
                .brokers(&config.redpanda.brokers)
                .consumer_group(&config.redpanda.consumer_group)
                .build()?,
        );
        info!("Redpanda connected");

        Ok(Self::from_parts(
            config,
            AppParts {
                fast,
                locks,
                orders,
                inventory,
                bus,
                clock: Arc::new(SystemClock),
            },
        ))
    }

    /// Assemble the engine over existing collaborators.
    ///
    /// Must run inside a Tokio runtime (the request queue spawns its workers).
    #[must_use]
    pub fn from_parts(config: Config, parts: AppParts) -> Self {
        let breakers = CircuitBreakerRegistry::new();
        let coordinator = SeckillCoordinator::builder(parts.fast.clone(), parts.bus.clone())
            .inventory(parts.inventory.clone())
            .orders(parts.orders.clone())
            .limiter(config.seckill.limiter())
            .breaker(breakers.get_or_create(SECKILL_BREAKER, config.seckill.breaker_config()))
            .clock(parts.clock.clone())
            .queue_config(config.seckill.queue_config())
            .config(CoordinatorConfig::from_config(&config))
            .build();

        let inventory_sync = InventorySync::new(parts.inventory, config.reconcile.sync_retries);
        let compensator = OrderCompensator::new(
            parts.orders,
            parts.fast.clone(),
            CompensatorConfig::from_config(&config.compensation),
        )
        .with_inventory(inventory_sync.clone())
        .with_clock(parts.clock.clone());
        let reconciler = InventoryReconciler::new(
            parts.fast,
            parts.locks,
            inventory_sync,
            ReconcilerConfig::from_config(&config.reconcile),
        )
        .with_clock(parts.clock);

        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            bus: parts.bus,
            coordinator: Arc::new(coordinator),
            compensator: Arc::new(compensator),
            reconciler: Arc::new(reconciler),
            breakers,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Spawn the order consumer and, when enabled, the compensation scheduler
    /// and the reconciler.
    pub fn start(&mut self) {
        let topics = self
            .config
            .consumed_topics()
            .into_iter()
            .map(String::from)
            .collect();
        let handler: Arc<dyn MessageHandler> = self.compensator.clone();
        let consumer = MessageConsumer::new(
            "order-compensator",
            topics,
            self.bus.clone(),
            handler,
            self.shutdown_tx.subscribe(),
        );
        self.tasks.push(("order-consumer", consumer.spawn()));

        if self.config.compensation.enabled {
            let handle = self.compensator.clone().spawn(self.shutdown_tx.subscribe());
            self.tasks.push(("compensation-scheduler", handle));
        } else {
            info!("Compensation scheduler disabled");
        }

        if self.config.reconcile.enabled {
            let handle = self.reconciler.clone().spawn(self.shutdown_tx.subscribe());
            self.tasks.push(("inventory-reconciler", handle));
        } else {
            info!("Inventory reconciler disabled");
        }

        info!(tasks = self.tasks.len(), "Flash-sale engine started");
    }

    /// The seckill coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<SeckillCoordinator> {
        &self.coordinator
    }

    /// The order compensator.
    #[must_use]
    pub fn compensator(&self) -> &Arc<OrderCompensator> {
        &self.compensator
    }

    /// The inventory reconciler.
    #[must_use]
    pub fn reconciler(&self) -> &Arc<InventoryReconciler> {
        &self.reconciler
    }

    /// Named circuit breakers; the purchase step runs under
    /// [`SECKILL_BREAKER`].
    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop every background task, then the coordinator.
    pub async fn shutdown(self) {
        info!("Shutting down flash-sale engine...");
        let _ = self.shutdown_tx.send(());

        let timeout = Duration::from_secs(10);
        for (name, handle) in self.tasks {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!(task = name, "Task stopped gracefully"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task failed"),
                Err(_) => warn!(task = name, "Task shutdown timed out"),
            }
        }

        self.coordinator.shutdown().await;
        info!("Graceful shutdown complete");
    }
}
