//! Prometheus metrics for the flash-sale engine.
//!
//! Components record through the `metrics` facade macros; [`MetricsServer`]
//! installs the Prometheus recorder and describes every series:
//!
//! - purchase outcomes and latency
//! - limiter rejections
//! - circuit breaker state and transitions
//! - request queue depth, wait time and rejections
//! - order compensation and inventory reconciliation
//!
//! # Example
//!
//! ```rust,no_run
//! use flashsale_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// The exporter's HTTP listener serves the text format on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all series, install the Prometheus recorder and spawn the
    /// HTTP exporter. Must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// Only one recorder can be installed per process. A second call logs a
    /// warning and leaves [`MetricsServer::handle`] empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .set_buckets_for_metric(
                Matcher::Full("request_queue_wait_seconds".to_string()),
                &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!("Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// The Prometheus handle, if this server installed the recorder.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Describe every series the engine records.
pub fn register_metrics() {
    // Purchases
    describe_counter!(
        "seckill_requests_total",
        "Purchase attempts by outcome label"
    );
    describe_histogram!(
        "seckill_purchase_duration_seconds",
        "Time spent in the atomic purchase step"
    );

    // Flow control
    describe_counter!(
        "rate_limiter_rejections_total",
        "Requests refused by the rate limiter"
    );
    describe_gauge!(
        "circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_transitions_total",
        "Circuit breaker state transitions by target state"
    );
    describe_gauge!("request_queue_depth", "Items waiting in the request queue");
    describe_histogram!(
        "request_queue_wait_seconds",
        "Time items spend queued before a worker picks them up"
    );
    describe_counter!(
        "request_queue_rejections_total",
        "Items refused because the request queue was full"
    );
    describe_counter!("retry_attempts_total", "Retries scheduled by backoff loops");
    describe_counter!(
        "retry_exhausted_total",
        "Backoff loops that ran out of retries"
    );

    // Compensation
    describe_counter!(
        "order_compensation_total",
        "Durable order attempts by result"
    );
    describe_counter!(
        "order_failures_recorded_total",
        "Order failure records written for later retry"
    );

    // Reconciliation
    describe_counter!(
        "inventory_diffs_found_total",
        "Fast-path and durable stock disagreements beyond tolerance"
    );
    describe_counter!(
        "inventory_auto_fixed_total",
        "Stock differences healed automatically"
    );
    describe_counter!("inventory_alerts_total", "Inventory alerts raised by kind");
    describe_counter!(
        "inventory_sync_conflicts_total",
        "Durable inventory writes rejected by the version check"
    );
}
