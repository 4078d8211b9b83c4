//! Flash-sale server
//!
//! Main process of the flash-sale engine.
//!
//! This binary:
//! - Connects Redis (fast path), `PostgreSQL` (durable side) and Redpanda
//! - Starts the Prometheus exporter
//! - Consumes order messages and creates durable orders
//! - Runs the compensation scheduler and the inventory reconciler
//!
//! # Usage
//!
//! ```bash
//! # Start infrastructure
//! docker compose up -d
//!
//! # Run server
//! cargo run --bin server
//! ```

use flashsale_runtime::metrics::MetricsServer;
use flashsale_seckill::{Config, FlashsaleApp};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flashsale_seckill=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting flash-sale server...");

    // Load configuration
    let config = Config::from_env();
    config.validate()?;
    tracing::info!(
        redis = %config.redis.url,
        redpanda = %config.redpanda.brokers,
        workers = config.seckill.workers,
        queue_size = config.seckill.queue_size,
        "Configuration loaded"
    );

    // Metrics exporter
    let mut metrics = MetricsServer::new(config.server.metrics_addr.parse()?);
    metrics.start()?;
    tracing::info!(addr = %config.server.metrics_addr, "Metrics exporter listening");

    // Initialize application
    tracing::info!("Initializing application components...");
    let mut app = FlashsaleApp::connect(config).await?;
    tracing::info!("Application initialized");

    app.start();
    tracing::info!("Flash-sale server is running, press Ctrl+C to shutdown");

    // Run forever (until Ctrl+C)
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down gracefully...");
    app.shutdown().await;
    Ok(())
}
