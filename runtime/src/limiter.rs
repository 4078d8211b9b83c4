//! Admission rate limiters.
//!
//! Three strategies share the [`Limiter`] trait and can be chained with
//! [`MultiLevelLimiter`]:
//!
//! ```text
//! TokenBucket     capacity C, refill R/s   smooths steady rate, allows bursts up to C
//! SlidingWindow   limit L over W           exact count over the trailing window
//! FixedWindow     limit L per W            cheap, resets at window boundaries
//! ```
//!
//! `allow`/`allow_n` never block. `wait`/`wait_n` suspend until admission;
//! cancel them by dropping the future (for example with `tokio::time::timeout`).
//!
//! ## Usage
//!
//! ```
//! use flashsale_runtime::limiter::{Limiter, TokenBucketLimiter};
//!
//! let limiter = TokenBucketLimiter::new(2, 10.0);
//! assert!(limiter.allow());
//! assert!(limiter.allow());
//! assert!(!limiter.allow());
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};

/// Poll interval for limiters that cannot compute an exact wait.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Errors from blocking limiter waits.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterError {
    /// The request can never be admitted
    #[error("Requested {requested} permits exceeds capacity {capacity}")]
    ExceedsCapacity {
        /// Permits requested
        requested: u32,
        /// Limiter capacity
        capacity: u32,
    },
}

/// Common interface of all limiter strategies.
#[async_trait]
pub trait Limiter: Send + Sync + fmt::Debug {
    /// Admit one request if possible.
    fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Admit `n` requests at once if possible; nothing is consumed on refusal.
    fn allow_n(&self, n: u32) -> bool;

    /// Suspend until one request is admitted.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterError::ExceedsCapacity`] if the limiter can never admit it.
    async fn wait(&self) -> Result<(), LimiterError> {
        self.wait_n(1).await
    }

    /// Suspend until `n` requests are admitted.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterError::ExceedsCapacity`] if `n` exceeds the capacity.
    async fn wait_n(&self, n: u32) -> Result<(), LimiterError>;

    /// Permits that could be admitted right now.
    fn remaining(&self) -> u64;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiter.
///
/// Tokens refill lazily on access at `refill_rate` per second, capped at
/// `capacity`.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    capacity: u32,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    /// Create a full bucket.
    #[must_use]
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate: refill_rate.max(0.0),
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket capacity.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens per second.
    #[must_use]
    pub const fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Current token count after refilling.
    #[must_use]
    pub fn available_tokens(&self) -> f64 {
        let mut state = lock(&self.state);
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = elapsed
            .mul_add(self.refill_rate, state.tokens)
            .min(f64::from(self.capacity));
        state.last_refill = now;
    }

    /// Take `n` tokens, or return how long until enough have refilled.
    fn try_take(&self, n: u32) -> Result<(), Duration> {
        let mut state = lock(&self.state);
        self.refill(&mut state);

        let needed = f64::from(n);
        if state.tokens >= needed {
            state.tokens -= needed;
            return Ok(());
        }
        if self.refill_rate <= 0.0 {
            return Err(WAIT_POLL);
        }
        let deficit = needed - state.tokens;
        Err(Duration::from_secs_f64(deficit / self.refill_rate).max(Duration::from_millis(1)))
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    fn allow_n(&self, n: u32) -> bool {
        self.try_take(n).is_ok()
    }

    async fn wait_n(&self, n: u32) -> Result<(), LimiterError> {
        if n > self.capacity {
            return Err(LimiterError::ExceedsCapacity {
                requested: n,
                capacity: self.capacity,
            });
        }
        loop {
            match self.try_take(n) {
                Ok(()) => return Ok(()),
                Err(delay) => sleep(delay).await,
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn remaining(&self) -> u64 {
        self.available_tokens().floor() as u64
    }
}

/// Sliding window limiter.
///
/// Keeps the admission instants of the trailing `window` and admits while
/// their count stays within `limit`.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limit: u32,
    window: Duration,
    admissions: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// Create an empty window.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            admissions: Mutex::new(VecDeque::new()),
        }
    }

    /// Admissions inside the current window.
    #[must_use]
    pub fn current_requests(&self) -> usize {
        let mut admissions = lock(&self.admissions);
        self.evict(&mut admissions, Instant::now());
        admissions.len()
    }

    fn evict(&self, admissions: &mut VecDeque<Instant>, now: Instant) {
        while admissions
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            admissions.pop_front();
        }
    }

    fn try_take(&self, n: u32) -> Result<(), Duration> {
        let now = Instant::now();
        let mut admissions = lock(&self.admissions);
        self.evict(&mut admissions, now);

        if admissions.len() + n as usize <= self.limit as usize {
            admissions.extend(std::iter::repeat_n(now, n as usize));
            return Ok(());
        }
        // Earliest instant at which enough entries will have aged out.
        let overflow = admissions.len() + n as usize - self.limit as usize;
        let delay = admissions
            .get(overflow - 1)
            .map_or(WAIT_POLL, |t| (*t + self.window).saturating_duration_since(now));
        Err(delay.max(Duration::from_millis(1)))
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    fn allow_n(&self, n: u32) -> bool {
        self.try_take(n).is_ok()
    }

    async fn wait_n(&self, n: u32) -> Result<(), LimiterError> {
        if n > self.limit {
            return Err(LimiterError::ExceedsCapacity {
                requested: n,
                capacity: self.limit,
            });
        }
        loop {
            match self.try_take(n) {
                Ok(()) => return Ok(()),
                Err(delay) => sleep(delay).await,
            }
        }
    }

    fn remaining(&self) -> u64 {
        u64::from(self.limit).saturating_sub(self.current_requests() as u64)
    }
}

#[derive(Debug)]
struct WindowState {
    count: u32,
    window_start: Instant,
}

/// Fixed window limiter.
///
/// Counts admissions in windows anchored at the first window start; the count
/// resets once `window` has elapsed.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

impl FixedWindowLimiter {
    /// Create a limiter whose first window starts now.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(WindowState {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Admissions in the current window.
    #[must_use]
    pub fn current_count(&self) -> u32 {
        let mut state = lock(&self.state);
        self.roll(&mut state, Instant::now());
        state.count
    }

    fn roll(&self, state: &mut WindowState, now: Instant) {
        if now.duration_since(state.window_start) >= self.window {
            state.count = 0;
            state.window_start = now;
        }
    }

    fn try_take(&self, n: u32) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        self.roll(&mut state, now);

        if state.count.saturating_add(n) <= self.limit {
            state.count += n;
            return Ok(());
        }
        Err((state.window_start + self.window)
            .saturating_duration_since(now)
            .max(Duration::from_millis(1)))
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    fn allow_n(&self, n: u32) -> bool {
        self.try_take(n).is_ok()
    }

    async fn wait_n(&self, n: u32) -> Result<(), LimiterError> {
        if n > self.limit {
            return Err(LimiterError::ExceedsCapacity {
                requested: n,
                capacity: self.limit,
            });
        }
        loop {
            match self.try_take(n) {
                Ok(()) => return Ok(()),
                Err(delay) => sleep(delay).await,
            }
        }
    }

    fn remaining(&self) -> u64 {
        u64::from(self.limit.saturating_sub(self.current_count()))
    }
}

/// Runs several limiters in series; a request is admitted only if every
/// level admits it.
///
/// Levels are consulted in order and the chain stops at the first refusal, so
/// earlier levels may already have consumed permits for a refused request.
#[derive(Debug, Clone, Default)]
pub struct MultiLevelLimiter {
    levels: Vec<Arc<dyn Limiter>>,
}

impl MultiLevelLimiter {
    /// Create a chain from levels, outermost first.
    #[must_use]
    pub fn new(levels: Vec<Arc<dyn Limiter>>) -> Self {
        Self { levels }
    }

    /// Append a level.
    #[must_use]
    pub fn with_level(mut self, level: Arc<dyn Limiter>) -> Self {
        self.levels.push(level);
        self
    }

    /// Number of levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Whether the chain has no levels (and admits everything).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

#[async_trait]
impl Limiter for MultiLevelLimiter {
    fn allow_n(&self, n: u32) -> bool {
        self.levels.iter().all(|level| level.allow_n(n))
    }

    async fn wait_n(&self, n: u32) -> Result<(), LimiterError> {
        for level in &self.levels {
            level.wait_n(n).await?;
        }
        Ok(())
    }

    fn remaining(&self) -> u64 {
        self.levels
            .iter()
            .map(|level| level.remaining())
            .min()
            .unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_boundary_then_refill() {
        let limiter = TokenBucketLimiter::new(5, 2.0);

        for _ in 0..5 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());

        // 1/R seconds refills one token
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refill_is_capped() {
        let limiter = TokenBucketLimiter::new(3, 100.0);
        assert!(limiter.allow_n(3));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!((limiter.available_tokens() - 3.0).abs() < f64::EPSILON);
        assert_eq!(limiter.remaining(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_allow_n_is_all_or_nothing() {
        let limiter = TokenBucketLimiter::new(4, 1.0);
        assert!(limiter.allow_n(3));
        assert!(!limiter.allow_n(2));
        assert!(limiter.allow_n(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_wait_suspends_until_refill() {
        let limiter = TokenBucketLimiter::new(1, 4.0);
        assert!(limiter.allow());

        let started = Instant::now();
        limiter.wait().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_token_bucket_wait_rejects_impossible_requests() {
        let limiter = TokenBucketLimiter::new(2, 1.0);
        assert_eq!(
            limiter.wait_n(3).await,
            Err(LimiterError::ExceedsCapacity {
                requested: 3,
                capacity: 2
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancelled_by_dropping() {
        let limiter = TokenBucketLimiter::new(1, 0.0);
        assert!(limiter.allow());

        let result = tokio::time::timeout(Duration::from_secs(1), limiter.wait()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_evicts_old_admissions() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(1));
        assert!(limiter.allow());
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(limiter.allow_n(2));
        assert!(!limiter.allow());
        assert_eq!(limiter.current_requests(), 3);

        // First admission ages out, the later two do not
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(limiter.current_requests(), 2);
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_wait() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(1));
        assert!(limiter.allow());

        let started = Instant::now();
        limiter.wait().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_resets() {
        let limiter = FixedWindowLimiter::new(2, Duration::from_secs(1));
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert_eq!(limiter.remaining(), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.current_count(), 0);
        assert!(limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_wait_until_next_window() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_secs(2));
        assert!(limiter.allow());

        let started = Instant::now();
        limiter.wait().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_level_requires_every_level() {
        let burst: Arc<dyn Limiter> = Arc::new(TokenBucketLimiter::new(10, 1.0));
        let window: Arc<dyn Limiter> = Arc::new(FixedWindowLimiter::new(2, Duration::from_secs(1)));
        let limiter = MultiLevelLimiter::new(vec![burst, window]);

        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert_eq!(limiter.remaining(), 0);
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_empty_chain_admits_everything() {
        let limiter = MultiLevelLimiter::default();
        assert!(limiter.is_empty());
        assert!(limiter.allow_n(1_000));
    }

    proptest! {
        #[test]
        fn prop_token_bucket_never_admits_more_than_capacity(capacity in 1u32..200, attempts in 1usize..400) {
            let limiter = TokenBucketLimiter::new(capacity, 0.0);
            let admitted = (0..attempts).filter(|_| limiter.allow()).count();
            prop_assert_eq!(admitted, attempts.min(capacity as usize));
        }

        #[test]
        fn prop_fixed_window_never_exceeds_limit(limit in 1u32..100, attempts in 1usize..300) {
            let limiter = FixedWindowLimiter::new(limit, Duration::from_secs(3600));
            let admitted = (0..attempts).filter(|_| limiter.allow()).count();
            prop_assert!(admitted <= limit as usize);
        }
    }
}
