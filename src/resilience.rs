//! Resilience utilities: retry backoff, rate limiting, bulkheads, deadline joins.
//!
//! - [`RetryConfig`]: Exponential backoff for transient remote failures
//! - [`RateLimiter`]: Token bucket capping long-term repair writes
//! - [`Bulkhead`]: Semaphore bounding the channel and query worker pools
//! - [`join_all_within`]: Wait for a group of tasks with one deadline
//! - [`pause_or_shutdown`]: Sleep that a shutdown signal cuts short
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), hub_reconciler::resilience::BulkheadFull> {
//! use hub_reconciler::resilience::{join_all_within, Bulkhead, JoinOutcome};
//! use std::time::Duration;
//!
//! let bulkhead = Bulkhead::new(10);
//! let _permit = bulkhead.acquire().await?;
//!
//! let tasks = vec![tokio::spawn(async { 1 }), tokio::spawn(async { 2 })];
//! match join_all_within(tasks, Duration::from_secs(5)).await {
//!     JoinOutcome::Complete(values) => assert_eq!(values, vec![1, 2]),
//!     JoinOutcome::TimedOut { .. } | JoinOutcome::Failed(_) => {}
//! }
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Retry behavior for remote calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1).min(i32::MAX as usize) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket settings: tokens refill at `refill_rate` per second, up to
/// `burst_size` tokens. Each operation consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 ops/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
        }
    }

    /// Acquire a permit, waiting until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when a bulkhead permit cannot be granted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Limits how many operations run at once.
///
/// The verifier uses one bulkhead for per-channel cycles and another for
/// tier queries, mirroring two fixed-size worker pools.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit (at least 1).
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }
}

// =============================================================================
// Deadline join
// =============================================================================

/// Result of [`join_all_within`].
#[derive(Debug)]
pub enum JoinOutcome<T> {
    /// Every task finished; values are in the order the tasks were given.
    Complete(Vec<T>),
    /// The deadline passed first. Unfinished tasks were aborted.
    TimedOut { completed: usize, expected: usize },
    /// A task panicked or was cancelled.
    Failed(String),
}

/// Wait for all `tasks` to finish within `deadline`.
///
/// Each task owns its own result; nothing is shared between them. On
/// timeout the stragglers are aborted rather than left running.
pub async fn join_all_within<T: Send + 'static>(
    tasks: Vec<JoinHandle<T>>,
    deadline: Duration,
) -> JoinOutcome<T> {
    let expected = tasks.len();
    let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();

    match tokio::time::timeout(deadline, futures::future::join_all(tasks)).await {
        Ok(results) => {
            let mut values = Vec::with_capacity(expected);
            for result in results {
                match result {
                    Ok(value) => values.push(value),
                    Err(e) => {
                        for handle in &aborts {
                            handle.abort();
                        }
                        return JoinOutcome::Failed(e.to_string());
                    }
                }
            }
            JoinOutcome::Complete(values)
        }
        Err(_) => {
            let completed = aborts.iter().filter(|handle| handle.is_finished()).count();
            for handle in &aborts {
                handle.abort();
            }
            JoinOutcome::TimedOut { completed, expected }
        }
    }
}

/// Sleep for `pause`, waking early on shutdown.
///
/// Returns `true` if shutdown was signalled (or its sender dropped) before
/// the pause elapsed. Changes to `false` are ignored.
pub async fn pause_or_shutdown(pause: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow() {
        return true;
    }
    let deadline = tokio::time::Instant::now() + pause;
    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    return true;
                }
            }
            _ = tokio::time::sleep_until(deadline) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_pause_elapses_without_signal() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!pause_or_shutdown(Duration::from_millis(10), &mut rx).await);
    }

    #[tokio::test]
    async fn test_pause_cut_short_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { pause_or_shutdown(Duration::from_secs(60), &mut rx).await });
        tx.send(true).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_pause_ignores_false_and_dropped_sender_stops() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(false).unwrap();
        assert!(!pause_or_shutdown(Duration::from_millis(10), &mut rx).await);
        drop(tx);
        assert!(pause_or_shutdown(Duration::from_secs(60), &mut rx).await);
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(10_000), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_presets() {
        assert_eq!(RetryConfig::none().max_attempts, 1);
        assert_eq!(RetryConfig::default().max_attempts, 3);
        assert_eq!(RetryConfig::testing().initial_delay, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_rate_limiter_burst_then_waits() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 5,
            refill_rate: 1,
        });

        for _ in 0..5 {
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire())
                .await
                .expect("should acquire within burst");
        }
        let exhausted = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(exhausted.is_err(), "should wait after burst exhausted");
    }

    #[tokio::test]
    async fn test_rate_limiter_acquire_refills() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 1,
            refill_rate: 1000,
        });
        limiter.acquire().await;

        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100), "should refill quickly");
    }

    #[tokio::test]
    async fn test_bulkhead_minimum_one() {
        let bulkhead = Bulkhead::new(0);
        let _permit = bulkhead.acquire().await.unwrap();

        let second = tokio::time::timeout(Duration::from_millis(20), bulkhead.acquire()).await;
        assert!(second.is_err(), "zero clamps to a single slot");
    }

    #[tokio::test]
    async fn test_bulkhead_acquire_waits() {
        let bulkhead = Bulkhead::new(1);
        let permit = bulkhead.acquire().await.unwrap();

        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                let start = std::time::Instant::now();
                let _p = bulkhead.acquire().await.unwrap();
                start.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(permit);

        let wait_time = waiter.await.unwrap();
        assert!(wait_time >= Duration::from_millis(40), "should have waited");
    }

    #[test]
    fn test_bulkhead_full_error() {
        let err = BulkheadFull { max_concurrent: 10 };
        assert_eq!(err.to_string(), "bulkhead full: max 10 concurrent operations");
    }

    #[tokio::test]
    async fn test_join_all_within_preserves_order() {
        let tasks = vec![
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                "slow"
            }),
            tokio::spawn(async { "fast" }),
        ];
        match join_all_within(tasks, Duration::from_secs(5)).await {
            JoinOutcome::Complete(values) => assert_eq!(values, vec!["slow", "fast"]),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_all_within_times_out_and_aborts() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let tasks = vec![
            tokio::spawn(async { 1 }),
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                flag.store(true, Ordering::SeqCst);
                2
            }),
        ];

        match join_all_within(tasks, Duration::from_millis(50)).await {
            JoinOutcome::TimedOut { completed, expected } => {
                assert_eq!(expected, 2);
                assert!(completed <= 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!finished.load(Ordering::SeqCst), "straggler should be aborted");
    }

    #[tokio::test]
    async fn test_join_all_within_reports_panic() {
        let tasks: Vec<JoinHandle<i32>> = vec![
            tokio::spawn(async { 1 }),
            tokio::spawn(async { panic!("boom") }),
        ];
        assert!(matches!(
            join_all_within(tasks, Duration::from_secs(1)).await,
            JoinOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_join_all_within_empty() {
        let tasks: Vec<JoinHandle<()>> = Vec::new();
        assert!(matches!(
            join_all_within(tasks, Duration::ZERO).await,
            JoinOutcome::Complete(v) if v.is_empty()
        ));
    }
}
