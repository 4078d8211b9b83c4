//! Circuit breaker guarding the fast-path purchase call.
//!
//! A circuit breaker monitors operations and "opens" (stops allowing requests) when
//! a trip predicate over its rolling counts fires, so a failing store is not hammered
//! by a flash-sale burst.
//!
//! # States
//!
//! - **Closed**: Normal operation. Counts roll over into a new generation every
//!   `interval`.
//! - **Open**: Requests fail immediately with [`CircuitBreakerError::Open`] until
//!   `timeout` elapses.
//! - **`HalfOpen`**: Up to `max_requests` trial calls are admitted. A trial success
//!   closes the breaker, a trial failure reopens it.
//!
//! Every transition starts a new generation: counts are cleared and results of calls
//! admitted under an older generation are ignored.
//!
//! # Example
//!
//! ```rust
//! use flashsale_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig::builder()
//!     .max_requests(1)
//!     .interval(Duration::from_secs(60))
//!     .timeout(Duration::from_secs(30))
//!     .build();
//!
//! let breaker = CircuitBreaker::new("seckill", config)
//!     .on_state_change(|name, from, to| tracing::info!(name, ?from, ?to, "breaker moved"));
//!
//! match breaker.call(|| async { Ok::<_, String>(42) }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{counter, gauge};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Trial calls admitted while half-open
    pub max_requests: u32,
    /// Closed-state count window; zero keeps one generation forever
    pub interval: Duration,
    /// How long the breaker stays open before admitting trials
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            max_requests: None,
            interval: None,
            timeout: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    max_requests: Option<u32>,
    interval: Option<Duration>,
    timeout: Option<Duration>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the number of trial calls admitted while half-open.
    ///
    /// Zero is treated as one.
    #[must_use]
    pub const fn max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = Some(max_requests);
        self
    }

    /// Set the closed-state count window.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Set how long the breaker stays open.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            max_requests: self.max_requests.unwrap_or(defaults.max_requests).max(1),
            interval: self.interval.unwrap_or(defaults.interval),
            timeout: self.timeout.unwrap_or(defaults.timeout),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing if the dependency recovered
    HalfOpen,
}

impl State {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge value: 0 = closed, 1 = half-open, 2 = open.
    #[must_use]
    pub const fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from circuit breaker operations.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected
    #[error("Circuit breaker is open")]
    Open,
    /// Half-open trial budget is used up
    #[error("Too many requests while circuit breaker is half-open")]
    TooManyRequests,
    /// Operation failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the breaker refused the call without running it.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Open | Self::TooManyRequests)
    }
}

/// Rolling counts of the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Calls admitted
    pub requests: u32,
    /// Successful calls
    pub total_successes: u32,
    /// Failed calls
    pub total_failures: u32,
    /// Successes since the last failure
    pub consecutive_successes: u32,
    /// Failures since the last success
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    /// Failures over requests, 0 when nothing was admitted.
    #[must_use]
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        f64::from(self.total_failures) / f64::from(self.requests)
    }
}

/// Default trip predicate: at least 3 requests and a failure ratio of 0.6 or more.
#[must_use]
pub fn default_ready_to_trip(counts: &Counts) -> bool {
    counts.requests >= 3 && counts.total_failures > 0 && counts.failure_ratio() >= 0.6
}

/// Predicate deciding whether the closed breaker should open.
pub type TripPredicate = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Observer invoked with `(name, from, to)` after every transition.
pub type StateObserver = Arc<dyn Fn(&str, State, State) + Send + Sync>;

#[derive(Debug)]
struct Inner {
    state: State,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Circuit breaker for the purchase path.
///
/// Clones share state, so one breaker can be handed to several tasks.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    ready_to_trip: TripPredicate,
    on_state_change: Option<StateObserver>,
    inner: Arc<Mutex<Inner>>,
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed circuit breaker with the default trip predicate.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        let expiry = closed_expiry(&config, now);
        Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            ready_to_trip: Arc::new(default_ready_to_trip),
            on_state_change: None,
            inner: Arc::new(Mutex::new(Inner {
                state: State::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the trip predicate.
    #[must_use]
    pub fn with_ready_to_trip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.ready_to_trip = Arc::new(predicate);
        self
    }

    /// Register a transition observer.
    #[must_use]
    pub fn on_state_change<F>(mut self, observer: F) -> Self
    where
        F: Fn(&str, State, State) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(observer));
        self
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying any due timer transition first.
    #[must_use]
    pub fn state(&self) -> State {
        self.transition(|inner, now, moves| {
            current_state(inner, &self.config, now, moves);
            inner.state
        })
    }

    /// Counts of the current generation.
    #[must_use]
    pub fn counts(&self) -> Counts {
        self.lock().counts
    }

    /// Call an operation through the circuit breaker.
    ///
    /// `Err` results count as failures. If the returned future is dropped
    /// before the operation finishes, the call is recorded as a failure so a
    /// half-open trial slot is never leaked.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitBreakerError::Open`] while open,
    /// [`CircuitBreakerError::TooManyRequests`] when the half-open trial budget is
    /// spent and [`CircuitBreakerError::Inner`] if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let generation = match self.before_request() {
            Ok(generation) => generation,
            Err(rejection) => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(breaker = %self.name, state = %rejection, "Circuit breaker rejected call");
                return Err(match rejection {
                    State::HalfOpen => CircuitBreakerError::TooManyRequests,
                    State::Open | State::Closed => CircuitBreakerError::Open,
                });
            }
        };

        let mut guard = CallGuard {
            breaker: self,
            generation,
            settled: false,
        };

        match operation().await {
            Ok(result) => {
                guard.settle(true);
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(err) => {
                guard.settle(false);
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Admit a call or return the state that refused it.
    fn before_request(&self) -> Result<u64, State> {
        self.transition(|inner, now, moves| {
            let state = current_state(inner, &self.config, now, moves);
            match state {
                State::Open => Err(State::Open),
                State::HalfOpen if inner.counts.requests >= self.config.max_requests => {
                    Err(State::HalfOpen)
                }
                State::Closed | State::HalfOpen => {
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            }
        })
    }

    fn after_request(&self, generation: u64, success: bool) {
        self.transition(|inner, now, moves| {
            let state = current_state(inner, &self.config, now, moves);
            if inner.generation != generation {
                return;
            }

            if success {
                inner.counts.on_success();
                if state == State::HalfOpen {
                    set_state(inner, &self.config, State::Closed, now, moves);
                }
            } else {
                inner.counts.on_failure();
                if state == State::HalfOpen || (self.ready_to_trip)(&inner.counts) {
                    set_state(inner, &self.config, State::Open, now, moves);
                }
            }
        });
    }

    /// Run `f` under the state lock, then report the transitions it made.
    fn transition<R>(&self, f: impl FnOnce(&mut Inner, Instant, &mut Vec<(State, State)>) -> R) -> R {
        let mut moves = Vec::new();
        let result = {
            let mut inner = self.lock();
            f(&mut inner, Instant::now(), &mut moves)
        };
        for (from, to) in moves {
            self.notify(from, to);
        }
        result
    }

    fn notify(&self, from: State, to: State) {
        match to {
            State::Open => tracing::warn!(breaker = %self.name, %from, %to, "Circuit breaker opened"),
            State::HalfOpen | State::Closed => {
                tracing::info!(breaker = %self.name, %from, %to, "Circuit breaker state changed");
            }
        }
        gauge!("circuit_breaker_state", "name" => self.name.to_string()).set(to.gauge_value());
        counter!(
            "circuit_breaker_transitions_total",
            "name" => self.name.to_string(),
            "to" => to.as_str()
        )
        .increment(1);

        if let Some(observer) = &self.on_state_change {
            observer(&self.name, from, to);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get circuit breaker metrics.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker closed with fresh counts.
    pub fn reset(&self) {
        self.transition(|inner, now, moves| {
            set_state(inner, &self.config, State::Closed, now, moves);
            start_generation(inner, &self.config, now);
        });
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
    }
}

/// Records a failure if a call is dropped before it settles.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        self.breaker.after_request(self.generation, success);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.after_request(self.generation, false);
        }
    }
}

fn closed_expiry(config: &CircuitBreakerConfig, now: Instant) -> Option<Instant> {
    (!config.interval.is_zero()).then(|| now + config.interval)
}

fn current_state(
    inner: &mut Inner,
    config: &CircuitBreakerConfig,
    now: Instant,
    moves: &mut Vec<(State, State)>,
) -> State {
    match inner.state {
        State::Closed => {
            if inner.expiry.is_some_and(|expiry| expiry <= now) {
                start_generation(inner, config, now);
            }
        }
        State::Open => {
            if inner.expiry.is_some_and(|expiry| expiry <= now) {
                set_state(inner, config, State::HalfOpen, now, moves);
            }
        }
        State::HalfOpen => {}
    }
    inner.state
}

fn set_state(
    inner: &mut Inner,
    config: &CircuitBreakerConfig,
    to: State,
    now: Instant,
    moves: &mut Vec<(State, State)>,
) {
    if inner.state == to {
        return;
    }
    let from = inner.state;
    inner.state = to;
    start_generation(inner, config, now);
    moves.push((from, to));
}

fn start_generation(inner: &mut Inner, config: &CircuitBreakerConfig, now: Instant) {
    inner.generation = inner.generation.wrapping_add(1);
    inner.counts = Counts::default();
    inner.expiry = match inner.state {
        State::Closed => closed_expiry(config, now),
        State::Open => Some(now + config.timeout),
        State::HalfOpen => None,
    };
}

/// Metrics for circuit breaker monitoring.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of failed calls
    pub total_failures: u64,
    /// Total number of rejected calls (open or half-open budget spent)
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_calls as f64
    }

    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}

/// Named circuit breakers, one per protected route or dependency.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the breaker registered under `name`, creating it with `config`
    /// if absent.
    #[must_use]
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, config))
            .clone()
    }

    /// Register a pre-built breaker under its own name, replacing any previous one.
    pub fn register(&self, breaker: CircuitBreaker) {
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(breaker.name().to_string(), breaker);
    }

    /// Look up a breaker.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// States of all breakers, sorted by name.
    #[must_use]
    pub fn states(&self) -> Vec<(String, State)> {
        let breakers: Vec<CircuitBreaker> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut states: Vec<(String, State)> = breakers
            .iter()
            .map(|b| (b.name().to_string(), b.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Reset one breaker. Returns `false` if no breaker has that name.
    pub fn reset(&self, name: &str) -> bool {
        self.get(name).is_some_and(|breaker| {
            breaker.reset();
            true
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker(timeout: Duration) -> CircuitBreaker {
        let config = CircuitBreakerConfig::builder()
            .max_requests(1)
            .interval(Duration::from_secs(60))
            .timeout(timeout)
            .build();
        CircuitBreaker::new("test", config)
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<i32, CircuitBreakerError<&'static str>> {
        breaker.call(|| async { Ok(42) }).await
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<i32, CircuitBreakerError<&'static str>> {
        breaker.call(|| async { Err("store down") }).await
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_on_success() {
        let breaker = breaker(Duration::from_secs(60));

        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.counts().total_successes, 1);
    }

    #[tokio::test]
    async fn test_two_failures_do_not_trip_below_three_requests() {
        let breaker = breaker(Duration::from_secs(60));

        fail(&breaker).await.ok();
        fail(&breaker).await.ok();

        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_timeout_and_half_open_success_closes() {
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&transitions);
        let breaker = breaker(Duration::from_secs(5)).on_state_change(move |_, from, to| {
            seen.lock().unwrap().push((from, to));
        });

        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(CircuitBreakerError::Inner(_))));
        }
        // 3 failures over 5 requests = 0.6
        assert_eq!(breaker.state(), State::Open);
        assert!(matches!(succeed(&breaker).await, Err(CircuitBreakerError::Open)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), State::HalfOpen);

        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.state(), State::Closed);

        assert_eq!(
            *transitions.lock().unwrap(),
            vec![
                (State::Closed, State::Open),
                (State::Open, State::HalfOpen),
                (State::HalfOpen, State::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(Duration::from_secs(1));
        for _ in 0..3 {
            fail(&breaker).await.ok();
        }
        assert_eq!(breaker.state(), State::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        fail(&breaker).await.ok();

        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_requests() {
        let breaker = breaker(Duration::from_secs(1));
        for _ in 0..3 {
            fail(&breaker).await.ok();
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        let slow = breaker.clone();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = tokio::spawn(async move {
            slow.call(|| async move {
                release_rx.await.ok();
                Ok::<_, &str>(1)
            })
            .await
        });
        tokio::task::yield_now().await;

        assert!(matches!(
            succeed(&breaker).await,
            Err(CircuitBreakerError::TooManyRequests)
        ));

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), 1);
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_counts_roll_over_after_interval() {
        let breaker = breaker(Duration::from_secs(60));
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        assert_eq!(breaker.counts().total_failures, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.counts(), Counts::default());

        // A single failure in the new generation is not enough to trip
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_custom_trip_predicate() {
        let breaker = breaker(Duration::from_secs(60))
            .with_ready_to_trip(|counts| counts.consecutive_failures >= 1);

        fail(&breaker).await.ok();

        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test]
    async fn test_dropped_call_counts_as_failure() {
        let breaker = breaker(Duration::from_secs(60));
        {
            let pending = breaker.call(|| std::future::pending::<Result<(), &str>>());
            let _ = tokio::time::timeout(Duration::from_millis(1), pending).await;
        }
        assert_eq!(breaker.counts().total_failures, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_metrics() {
        let breaker = breaker(Duration::from_secs(60));

        for _ in 0..3 {
            succeed(&breaker).await.ok();
        }
        for _ in 0..2 {
            fail(&breaker).await.ok();
        }

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_calls, 5);
        assert_eq!(metrics.total_successes, 3);
        assert_eq!(metrics.total_failures, 2);
        assert!((metrics.success_rate() - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_circuit_breaker_concurrent_calls() {
        let breaker = Arc::new(breaker(Duration::from_secs(60)));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..100 {
            let breaker = Arc::clone(&breaker);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let _ = breaker
                    .call(|| async {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.ok();
        }

        assert_eq!(breaker.metrics().total_successes, 100);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_registry_states_and_reset() {
        let registry = CircuitBreakerRegistry::new();
        let purchase = registry.get_or_create("purchase", CircuitBreakerConfig::default());
        let _ = registry.get_or_create("inventory", CircuitBreakerConfig::default());

        for _ in 0..3 {
            fail(&purchase).await.ok();
        }
        assert_eq!(
            registry.states(),
            vec![
                ("inventory".to_string(), State::Closed),
                ("purchase".to_string(), State::Open),
            ]
        );

        assert!(registry.reset("purchase"));
        assert_eq!(registry.get("purchase").unwrap().state(), State::Closed);
        assert!(!registry.reset("missing"));
    }
}
