//! # Flash-sale Runtime
//!
//! In-process flow control for the flash-sale engine, plus the lock and
//! backoff primitives the compensation paths rely on.
//!
//! ## Core Components
//!
//! - **Limiters**: token bucket, sliding window, fixed window and a
//!   multi-level chain ([`limiter`])
//! - **Circuit Breaker**: closed / open / half-open guard around the purchase
//!   step ([`circuit_breaker`])
//! - **Request Queue**: bounded intake with a worker pool, synchronous and
//!   asynchronous submission ([`queue`])
//! - **Distributed Lock**: token-owned lease over a
//!   [`LockBackend`](flashsale_core::store::LockBackend) ([`lock`])
//! - **Retry**: exponential backoff for in-process loops and persisted
//!   schedules ([`retry`])
//! - **Metrics**: Prometheus recorder and series descriptions ([`metrics`])
//!
//! Every component is an explicitly constructed value. Nothing here is a
//! process-wide singleton except the metrics recorder.

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Admission rate limiters
pub mod limiter;

/// Advisory distributed lock
pub mod lock;

/// Prometheus metrics for observability
pub mod metrics;

/// Bounded request queue with worker pool
pub mod queue;

/// Retry logic with exponential backoff
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry, State,
};
pub use limiter::{
    FixedWindowLimiter, Limiter, LimiterError, MultiLevelLimiter, SlidingWindowLimiter,
    TokenBucketLimiter,
};
pub use lock::{DistributedLock, LockHandle};
pub use queue::{QueueConfig, QueueError, QueueStats, RequestQueue};
pub use retry::RetryPolicy;
