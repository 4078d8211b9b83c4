//! Bounded request queue with a fixed worker pool.
//!
//! Bursts are absorbed into a fixed-capacity intake channel drained by a fixed
//! number of workers. Intake never blocks: a full queue is reported as
//! [`QueueError::Full`] so callers can back off.
//!
//! ```text
//!  submit ──try_send──► [ intake (capacity) ] ──► worker 1 ─┐
//!  submit_async ──────►                      ──► worker 2 ─┼─► processor(payload)
//!                                            ──► worker N ─┘        │
//!  Completion ◄───────────────── oneshot reply ◄────────────────────┘
//! ```
//!
//! Every item carries its enqueue instant and an optional timeout. An item that
//! waited longer than its timeout fails with [`QueueError::Timeout`] without
//! being processed; processing itself is bounded by what is left of the timeout.
//!
//! # Example
//!
//! ```rust,no_run
//! use flashsale_runtime::queue::{QueueConfig, RequestQueue};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = RequestQueue::spawn(QueueConfig::new(1_000, 8), |n: u64| async move {
//!     Ok::<_, String>(n * 2)
//! });
//!
//! let doubled = queue.submit("req-1", 21, Some(Duration::from_secs(1))).await?;
//! assert_eq!(doubled, 42);
//!
//! let pending = queue.submit_async("req-2", 5, None)?;
//! assert_eq!(pending.await?, 10);
//! # Ok(())
//! # }
//! ```

use futures::future::BoxFuture;
use metrics::{counter, gauge, histogram};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Errors from queue submission and processing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Intake is at capacity
    #[error("Request queue is full")]
    Full,
    /// The queue was shut down
    #[error("Request queue is closed")]
    Closed,
    /// The item waited or ran longer than its timeout
    #[error("Request timed out")]
    Timeout,
    /// The item was dropped without an answer
    #[error("Request was canceled")]
    Canceled,
    /// The processor returned an error
    #[error("Processing failed: {0}")]
    Processing(String),
}

/// Queue sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Intake capacity
    pub capacity: usize,
    /// Worker tasks
    pub workers: usize,
}

impl QueueConfig {
    /// Create a config; zero values are raised to one.
    #[must_use]
    pub fn new(capacity: usize, workers: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            workers: workers.max(1),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(10_000, 10)
    }
}

/// Snapshot of queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items accepted or rejected at intake
    pub total: u64,
    /// Items processed successfully
    pub processed: u64,
    /// Items whose processor failed
    pub failed: u64,
    /// Items that timed out
    pub timeout: u64,
    /// Items refused because the intake was full
    pub rejected: u64,
    /// Items accepted and not yet finished
    pub queued: u64,
    /// Shortest intake-to-worker wait
    pub min_wait: Duration,
    /// Mean intake-to-worker wait
    pub avg_wait: Duration,
    /// Longest intake-to-worker wait
    pub max_wait: Duration,
}

#[derive(Debug, Default)]
struct StatsInner {
    total: u64,
    processed: u64,
    failed: u64,
    timeout: u64,
    rejected: u64,
    queued: u64,
    waits: u64,
    wait_total: Duration,
    min_wait: Option<Duration>,
    max_wait: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Finish {
    Processed,
    Failed,
    TimedOut,
}

impl StatsInner {
    fn record(&mut self, finish: Finish, wait: Duration) {
        self.queued = self.queued.saturating_sub(1);
        match finish {
            Finish::Processed => self.processed += 1,
            Finish::Failed => self.failed += 1,
            Finish::TimedOut => self.timeout += 1,
        }
        self.waits += 1;
        self.wait_total += wait;
        self.min_wait = Some(self.min_wait.map_or(wait, |min| min.min(wait)));
        self.max_wait = self.max_wait.max(wait);
    }

    #[allow(clippy::cast_precision_loss)]
    fn snapshot(&self) -> QueueStats {
        let avg_wait = if self.waits == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.wait_total.as_secs_f64() / self.waits as f64)
        };
        QueueStats {
            total: self.total,
            processed: self.processed,
            failed: self.failed,
            timeout: self.timeout,
            rejected: self.rejected,
            queued: self.queued,
            min_wait: self.min_wait.unwrap_or_default(),
            avg_wait,
            max_wait: self.max_wait,
        }
    }
}

type Processor<T, R> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<R, String>> + Send + Sync>;

struct QueueItem<T, R> {
    id: String,
    payload: T,
    enqueued_at: Instant,
    timeout: Option<Duration>,
    reply: oneshot::Sender<Result<R, QueueError>>,
}

/// Future resolving to the result of a queued item.
///
/// Dropping it abandons the result; the item is still processed.
#[derive(Debug)]
pub struct Completion<R> {
    receiver: oneshot::Receiver<Result<R, QueueError>>,
}

impl<R> Future for Completion<R> {
    type Output = Result<R, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(QueueError::Canceled)))
    }
}

/// Bounded queue with a worker pool.
pub struct RequestQueue<T, R> {
    config: QueueConfig,
    sender: mpsc::Sender<QueueItem<T, R>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueItem<T, R>>>>,
    closed: Arc<AtomicBool>,
    shutdown: broadcast::Sender<()>,
    stats: Arc<Mutex<StatsInner>>,
    depth: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T, R> fmt::Debug for RequestQueue<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T, R> RequestQueue<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Create the queue and spawn its workers on the current runtime.
    pub fn spawn<F, Fut, E>(config: QueueConfig, processor: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        let config = QueueConfig::new(config.capacity, config.workers);
        let processor: Processor<T, R> =
            Arc::new(move |payload: T| -> BoxFuture<'static, Result<R, String>> {
                let fut = processor(payload);
                Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
            });

        let (sender, receiver) = mpsc::channel(config.capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let (shutdown, _) = broadcast::channel(1);
        let stats = Arc::new(Mutex::new(StatsInner::default()));
        let depth = Arc::new(AtomicUsize::new(0));

        let workers = (0..config.workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&receiver),
                    Arc::clone(&processor),
                    Arc::clone(&stats),
                    Arc::clone(&depth),
                    shutdown.subscribe(),
                ))
            })
            .collect();

        tracing::info!(
            capacity = config.capacity,
            workers = config.workers,
            "Request queue started"
        );

        Self {
            config,
            sender,
            receiver,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown,
            stats,
            depth,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue an item and wait for its result.
    ///
    /// `timeout` bounds the whole wait, queueing included.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] if the intake is at capacity,
    /// [`QueueError::Timeout`] if the deadline passes and
    /// [`QueueError::Processing`] if the processor fails.
    pub async fn submit(
        &self,
        id: impl Into<String>,
        payload: T,
        timeout: Option<Duration>,
    ) -> Result<R, QueueError> {
        let completion = self.submit_async(id, payload, timeout)?;
        match timeout {
            Some(deadline) => tokio::time::timeout(deadline, completion)
                .await
                .unwrap_or(Err(QueueError::Timeout)),
            None => completion.await,
        }
    }

    /// Enqueue an item and return immediately with a [`Completion`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] if the intake is at capacity and
    /// [`QueueError::Closed`] after shutdown.
    pub fn submit_async(
        &self,
        id: impl Into<String>,
        payload: T,
        timeout: Option<Duration>,
    ) -> Result<Completion<R>, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        let (reply, receiver) = oneshot::channel();
        let item = QueueItem {
            id: id.into(),
            payload,
            enqueued_at: Instant::now(),
            timeout,
            reply,
        };

        // Counted before the send so a worker never dequeues an uncounted item
        let queued = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        match self.sender.try_send(item) {
            Ok(()) => {
                let mut stats = self.lock_stats();
                stats.total += 1;
                stats.queued += 1;
                drop(stats);
                record_depth(queued);
                Ok(Completion { receiver })
            }
            Err(mpsc::error::TrySendError::Full(item)) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                let mut stats = self.lock_stats();
                stats.total += 1;
                stats.rejected += 1;
                drop(stats);
                counter!("request_queue_rejections_total").increment(1);
                tracing::warn!(id = %item.id, capacity = self.config.capacity, "Request queue full");
                Err(QueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Err(QueueError::Closed)
            }
        }
    }

    /// Enqueue an item and invoke `callback` with its result on a spawned task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] or [`QueueError::Closed`] at intake; the
    /// callback is not invoked in that case.
    pub fn submit_with_callback<C>(
        &self,
        id: impl Into<String>,
        payload: T,
        timeout: Option<Duration>,
        callback: C,
    ) -> Result<(), QueueError>
    where
        C: FnOnce(Result<R, QueueError>) + Send + 'static,
    {
        let completion = self.submit_async(id, payload, timeout)?;
        tokio::spawn(async move { callback(completion.await) });
        Ok(())
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.lock_stats().snapshot()
    }

    /// Items waiting in the intake, not yet taken by a worker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Whether the intake is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Intake capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Whether [`RequestQueue::shutdown`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting items, stop the workers and fail everything still queued
    /// with [`QueueError::Closed`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());

        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            let _ = worker.await;
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut drained = 0_u64;
        while let Ok(item) = receiver.try_recv() {
            release_depth(&self.depth);
            let _ = item.reply.send(Err(QueueError::Closed));
            drained += 1;
        }
        drop(receiver);

        let mut stats = self.lock_stats();
        stats.queued = stats.queued.saturating_sub(drained);
        stats.failed += drained;
        drop(stats);

        tracing::info!(drained, "Request queue closed");
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_depth(depth: usize) {
    gauge!("request_queue_depth").set(depth as f64);
}

fn release_depth(depth: &AtomicUsize) {
    let previous = depth
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| Some(d.saturating_sub(1)))
        .unwrap_or_else(|d| d);
    record_depth(previous.saturating_sub(1));
}

async fn run_worker<T, R>(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueItem<T, R>>>>,
    processor: Processor<T, R>,
    stats: Arc<Mutex<StatsInner>>,
    depth: Arc<AtomicUsize>,
    mut shutdown: broadcast::Receiver<()>,
) where
    T: Send + 'static,
    R: Send + 'static,
{
    tracing::debug!(worker_id, "Queue worker started");
    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            item = async { receiver.lock().await.recv().await } => item,
        };
        let Some(item) = item else { break };
        process_item(worker_id, item, &processor, &stats, &depth).await;
    }
    tracing::debug!(worker_id, "Queue worker stopped");
}

async fn process_item<T, R>(
    worker_id: usize,
    item: QueueItem<T, R>,
    processor: &Processor<T, R>,
    stats: &Mutex<StatsInner>,
    depth: &AtomicUsize,
) {
    release_depth(depth);
    let wait = item.enqueued_at.elapsed();
    histogram!("request_queue_wait_seconds").record(wait.as_secs_f64());

    let (finish, result) = match item.timeout {
        Some(timeout) if wait > timeout => (Finish::TimedOut, Err(QueueError::Timeout)),
        Some(timeout) => {
            match tokio::time::timeout(timeout.saturating_sub(wait), processor(item.payload)).await {
                Ok(Ok(value)) => (Finish::Processed, Ok(value)),
                Ok(Err(reason)) => (Finish::Failed, Err(QueueError::Processing(reason))),
                Err(_) => (Finish::TimedOut, Err(QueueError::Timeout)),
            }
        }
        None => match processor(item.payload).await {
            Ok(value) => (Finish::Processed, Ok(value)),
            Err(reason) => (Finish::Failed, Err(QueueError::Processing(reason))),
        },
    };

    stats
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .record(finish, wait);

    tracing::debug!(
        worker_id,
        id = %item.id,
        ?finish,
        wait_ms = wait.as_millis(),
        "Queue item finished"
    );

    if item.reply.send(result).is_err() {
        tracing::debug!(id = %item.id, "Queue item result abandoned by caller");
    }
}
