//! Repair queue: bounded buffer plus a fixed worker pool.
//!
//! The verifier discovers keys that exist in the write-cache but not in
//! long-term storage and hands them to [`ReconciliationQueue::add()`]. A
//! pool of workers drains the buffer; each worker:
//!
//! 1. Reads the item's bytes from the write-cache
//! 2. Writes them to the long-term tier through a circuit breaker
//!
//! # Back-pressure
//!
//! `add` never waits. A full (or closed) queue returns `false` and the
//! caller must treat the cycle as failed. Producers are never blocked by
//! slow long-term writes.
//!
//! # Idempotency
//!
//! The same key can be enqueued more than once (by overlapping verifier
//! cycles or after a retry). Writing the same bytes under the same key is
//! harmless, so workers do no dedup.
//!
//! # Shutdown
//!
//! [`close()`](ReconciliationQueue::close) stops accepting items, lets the
//! workers drain what is already buffered, and gives up (aborting the
//! workers) after the configured drain timeout.

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::config::QueueConfig;
use crate::error::HubError;
use crate::metrics;
use crate::model::ChannelContentKey;
use crate::resilience::{join_all_within, JoinOutcome, RateLimiter, RetryConfig};
use crate::store::ContentStore;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Counters for repair outcomes.
#[derive(Debug, Default)]
struct RepairCounters {
    written: AtomicU64,
    absent: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Snapshot of repair outcomes since the queue started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairStats {
    /// Items copied into long-term storage.
    pub written: u64,
    /// Items already gone from the write-cache when a worker got to them.
    pub absent: u64,
    /// Items whose read or write failed after retries.
    pub failed: u64,
    /// Items dropped because the long-term circuit was open.
    pub rejected: u64,
}

/// Everything a worker needs, shared across the pool.
struct WorkerContext {
    write_cache: Arc<dyn ContentStore>,
    long_term: Arc<dyn ContentStore>,
    circuit: CircuitBreaker,
    rate_limiter: Option<RateLimiter>,
    retry: RetryConfig,
    pending: AtomicUsize,
    counters: RepairCounters,
}

/// Bounded async repair queue.
pub struct ReconciliationQueue {
    sender: Mutex<Option<mpsc::Sender<ChannelContentKey>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    context: Arc<WorkerContext>,
    capacity: usize,
    drain_timeout: Duration,
}

impl ReconciliationQueue {
    /// Create the queue and spawn its workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &QueueConfig,
        write_cache: Arc<dyn ContentStore>,
        long_term: Arc<dyn ContentStore>,
    ) -> Self {
        let capacity = config.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let context = Arc::new(WorkerContext {
            write_cache,
            long_term,
            circuit: CircuitBreaker::long_term_writes(config.circuit_config()),
            rate_limiter: config.rate_limit_config().map(RateLimiter::new),
            retry: RetryConfig::default(),
            pending: AtomicUsize::new(0),
            counters: RepairCounters::default(),
        });

        let workers: Vec<JoinHandle<()>> = (0..config.workers.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                let context = Arc::clone(&context);
                tokio::spawn(
                    run_worker(rx, context).instrument(info_span!("repair_worker", worker = id)),
                )
            })
            .collect();

        info!(capacity, workers = config.workers.max(1), "Repair queue started");

        Self {
            sender: Mutex::new(Some(tx)),
            workers: tokio::sync::Mutex::new(workers),
            context,
            capacity,
            drain_timeout: config.drain_timeout_duration(),
        }
    }

    /// Enqueue a repair without waiting.
    ///
    /// Returns `false` if the queue is full or closed.
    pub fn add(&self, item: ChannelContentKey) -> bool {
        let sender = self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(tx) = sender.as_ref() else {
            metrics::record_repair_rejected("closed");
            return false;
        };

        // Count before sending so a fast worker can't decrement first.
        self.context.pending.fetch_add(1, Ordering::AcqRel);
        match tx.try_send(item) {
            Ok(()) => {
                metrics::record_repair_enqueued();
                metrics::set_queue_depth(self.capacity - tx.capacity());
                true
            }
            Err(TrySendError::Full(item)) => {
                self.context.pending.fetch_sub(1, Ordering::AcqRel);
                metrics::record_repair_rejected("full");
                debug!(item = %item, "Repair queue full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.context.pending.fetch_sub(1, Ordering::AcqRel);
                metrics::record_repair_rejected("closed");
                false
            }
        }
    }

    /// Items accepted but not yet finished (buffered or in a worker).
    pub fn pending(&self) -> usize {
        self.context.pending.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    pub fn stats(&self) -> RepairStats {
        let c = &self.context.counters;
        RepairStats {
            written: c.written.load(Ordering::Relaxed),
            absent: c.absent.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting items and drain the buffer.
    ///
    /// Returns `true` if every worker finished within the drain timeout.
    /// Calling `close` again is a no-op that returns `true`.
    pub async fn close(&self) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if sender.is_none() {
            return true;
        }
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock().await);
        let pending = self.pending();
        info!(pending, timeout = ?self.drain_timeout, "Closing repair queue");

        match join_all_within(workers, self.drain_timeout).await {
            JoinOutcome::Complete(_) => {
                info!(stats = ?self.stats(), "Repair queue drained");
                true
            }
            JoinOutcome::TimedOut { completed, expected } => {
                warn!(
                    completed,
                    expected,
                    abandoned = self.pending(),
                    "Repair queue drain timed out, workers aborted"
                );
                false
            }
            JoinOutcome::Failed(e) => {
                error!(error = %e, "Repair worker failed during drain");
                false
            }
        }
    }
}

async fn run_worker(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ChannelContentKey>>>,
    context: Arc<WorkerContext>,
) {
    debug!("Repair worker started");
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(item) = next else {
            break;
        };
        repair(&context, &item).await;
        context.pending.fetch_sub(1, Ordering::AcqRel);
    }
    debug!("Repair worker exiting");
}

/// Copy one item from the write-cache into long-term storage.
async fn repair(ctx: &WorkerContext, item: &ChannelContentKey) {
    if let Some(limiter) = &ctx.rate_limiter {
        limiter.acquire().await;
    }

    let channel = item.channel.as_str();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match copy_once(ctx, item).await {
            Ok(true) => {
                trace!(item = %item, "Repaired");
                ctx.counters.written.fetch_add(1, Ordering::Relaxed);
                metrics::record_repair_written(channel, "written");
                return;
            }
            Ok(false) => {
                // Expired out of the write-cache between discovery and repair.
                warn!(item = %item, "Item absent from write-cache, cannot repair");
                ctx.counters.absent.fetch_add(1, Ordering::Relaxed);
                metrics::record_repair_written(channel, "absent");
                return;
            }
            Err(CircuitError::Rejected) => {
                ctx.counters.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::record_repair_written(channel, "rejected");
                warn!(item = %item, "Long-term circuit open, repair dropped");
                return;
            }
            Err(CircuitError::Inner(e)) if e.is_retryable() && attempt < ctx.retry.max_attempts => {
                let delay = ctx.retry.delay_for_attempt(attempt);
                debug!(item = %item, attempt, error = %e, delay = ?delay, "Repair failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(CircuitError::Inner(e)) => {
                ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_repair_written(channel, "failed");
                error!(item = %item, attempt, error = %e, "Repair failed");
                return;
            }
        }
    }
}

/// One read-then-write attempt. `Ok(false)` when the source item is gone.
async fn copy_once(ctx: &WorkerContext, item: &ChannelContentKey) -> Result<bool, CircuitError<HubError>> {
    let bytes = ctx
        .write_cache
        .read(&item.channel, &item.key)
        .await
        .map_err(CircuitError::Inner)?;
    let Some(bytes) = bytes else {
        return Ok(false);
    };
    ctx.circuit
        .call(|| ctx.long_term.write(&item.channel, &item.key, bytes))
        .await?;
    Ok(true)
}
