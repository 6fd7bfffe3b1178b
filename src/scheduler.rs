//! Leader-only periodic verification.
//!
//! Every node runs a [`VerifierScheduler`], but only the one holding
//! [`VERIFIER_LEADER_PATH`] does any work. The leader runs a *pass* (one
//! verification cycle for every eligible channel), sleeps out the rest of
//! the interval, and repeats for as long as its lease is held.
//!
//! ```text
//!  ┌──────────┐ acquired ┌──────────┐  lease lost  ┌──────────┐
//!  │ Follower │─────────►│  Leader  │─────────────►│ Follower │ ...
//!  └──────────┘          └──────────┘              └──────────┘
//!                          │    ▲
//!                    pass  │    │ sleep(interval - elapsed)
//!                          ▼    │
//!                        fan-out over channels
//! ```
//!
//! The lease is polled once per pass. A pass that is running when
//! leadership is lost finishes; no new pass starts.
//!
//! Channels are verified in parallel, bounded by `channel_threads`. A
//! channel that errors or panics is logged and counted; the rest of the
//! pass carries on.

use crate::config::VerifierConfig;
use crate::error::{HubError, Result};
use crate::lock::{DistributedLock, LockLease, VERIFIER_LEADER_PATH};
use crate::metrics;
use crate::resilience::{pause_or_shutdown, Bulkhead};
use crate::store::BoxFuture;
use crate::verifier::CycleOutcome;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What the scheduler fans out over.
pub trait VerifyDispatch: Send + Sync + 'static {
    /// Channels to include in the next pass.
    fn channels(&self) -> BoxFuture<'_, Vec<String>>;

    /// Run one verification cycle for `channel`.
    fn verify<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, CycleOutcome>;
}

/// Tally of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub channels: usize,
    pub verified: usize,
    pub aborted: usize,
    pub skipped: usize,
    /// Channels whose cycle returned an error or panicked.
    pub failed: usize,
}

pub struct VerifierScheduler {
    dispatch: Arc<dyn VerifyDispatch>,
    lock: Arc<dyn DistributedLock>,
    channel_pool: Bulkhead,
    interval: Duration,
    leadership_wait: Duration,
}

impl VerifierScheduler {
    pub fn new(config: &VerifierConfig, dispatch: Arc<dyn VerifyDispatch>, lock: Arc<dyn DistributedLock>) -> Self {
        Self {
            dispatch,
            lock,
            channel_pool: Bulkhead::new(config.channel_threads),
            interval: config.interval_duration(),
            leadership_wait: config.leadership_wait_duration(),
        }
    }

    /// Compete for leadership and verify while leader, until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("verifier_scheduler");

        async move {
            // Mark initial shutdown value as seen so changed() only fires on actual changes
            let _ = shutdown_rx.borrow_and_update();
            info!(interval = ?self.interval, "Verifier scheduler started");

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let acquired = tokio::select! {
                    biased;

                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    acquired = self.lock.try_acquire(VERIFIER_LEADER_PATH, self.leadership_wait) => acquired,
                };

                match acquired {
                    Ok(Some(lease)) => {
                        info!("Took verifier leadership");
                        metrics::set_verifier_leader(true);
                        let stop = self.lead(&lease, &mut shutdown_rx).await;
                        metrics::set_verifier_leader(false);
                        drop(lease);
                        if stop {
                            break;
                        }
                        info!("Verifier leadership lost");
                    }
                    Ok(None) => {
                        debug!("Another node is verifier leader");
                    }
                    Err(e) => {
                        warn!(error = %e, "Leadership request failed");
                        if pause_or_shutdown(self.leadership_wait, &mut shutdown_rx).await {
                            break;
                        }
                    }
                }
            }

            info!("Verifier scheduler stopped");
        }
        .instrument(span)
        .await
    }

    /// Run passes while `lease` is held. Returns `true` on shutdown.
    async fn lead(&self, lease: &LockLease, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        while lease.is_held() {
            let started = Instant::now();
            let report = self.run_pass().await;
            debug!(?report, elapsed = ?started.elapsed(), "Verification pass complete");

            let pause = self.interval.saturating_sub(started.elapsed());
            if pause_or_shutdown(pause, shutdown_rx).await {
                return true;
            }
        }
        false
    }

    /// Verify every channel once, in parallel.
    pub async fn run_pass(&self) -> PassReport {
        let started = Instant::now();
        let channels = match self.dispatch.channels().await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "Could not list channels, skipping pass");
                return PassReport::default();
            }
        };

        let mut report = PassReport {
            channels: channels.len(),
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        for channel in channels {
            let dispatch = Arc::clone(&self.dispatch);
            let pool = self.channel_pool.clone();
            let span = info_span!("verify_channel", channel = %channel);
            tasks.spawn(
                async move {
                    let outcome = verify_one(dispatch.as_ref(), &pool, &channel).await;
                    (channel, outcome)
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(CycleOutcome::Verified { .. }))) => report.verified += 1,
                Ok((_, Ok(CycleOutcome::Aborted { .. }))) => report.aborted += 1,
                Ok((_, Ok(CycleOutcome::Skipped))) => report.skipped += 1,
                Ok((channel, Err(e))) => {
                    report.failed += 1;
                    metrics::record_verifier_failed(&channel);
                    warn!(channel = %channel, error = %e, "Channel verification failed");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "Channel verification task panicked");
                }
            }
        }

        metrics::record_verifier_pass(report.channels, started.elapsed());
        report
    }
}

async fn verify_one(dispatch: &dyn VerifyDispatch, pool: &Bulkhead, channel: &str) -> Result<CycleOutcome> {
    let _permit = pool
        .acquire()
        .await
        .map_err(|e| HubError::Internal(e.to_string()))?;
    dispatch.verify(channel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LocalLockService;
    use std::sync::Mutex;

    /// Records calls; panics on "panic", errors on "error".
    #[derive(Default)]
    struct ScriptedDispatch {
        channels: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedDispatch {
        fn with(channels: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                channels: channels.iter().map(|c| c.to_string()).collect(),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<String> {
            let mut calls = self.calls.lock().unwrap().clone();
            calls.sort();
            calls
        }
    }

    impl VerifyDispatch for ScriptedDispatch {
        fn channels(&self) -> BoxFuture<'_, Vec<String>> {
            Box::pin(async move { Ok(self.channels.clone()) })
        }

        fn verify<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, CycleOutcome> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(channel.to_string());
                match channel {
                    "panic" => panic!("verifier blew up"),
                    "error" => Err(HubError::store("query", "boom")),
                    "batch" => Ok(CycleOutcome::Skipped),
                    _ => Ok(CycleOutcome::Verified { missing: 0 }),
                }
            })
        }
    }

    fn config(interval: &str) -> VerifierConfig {
        VerifierConfig {
            interval: Some(interval.to_string()),
            leadership_wait: "20ms".to_string(),
            channel_threads: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pass_isolates_failing_channels() {
        let dispatch = ScriptedDispatch::with(&["a", "panic", "error", "batch", "b"]);
        let scheduler = VerifierScheduler::new(&config("1s"), dispatch.clone(), Arc::new(LocalLockService::new()));

        let report = scheduler.run_pass().await;
        assert_eq!(
            report,
            PassReport {
                channels: 5,
                verified: 2,
                aborted: 0,
                skipped: 1,
                failed: 2,
            }
        );
        assert_eq!(dispatch.calls(), vec!["a", "b", "batch", "error", "panic"]);
    }

    #[tokio::test]
    async fn test_only_leader_runs_passes() {
        let lock = LocalLockService::new();
        let other_node = lock
            .try_acquire(VERIFIER_LEADER_PATH, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let dispatch = ScriptedDispatch::with(&["a"]);
        let scheduler = Arc::new(VerifierScheduler::new(
            &config("10ms"),
            dispatch.clone(),
            Arc::new(lock.clone()),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.run(shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(dispatch.calls().is_empty(), "follower must not verify");

        drop(other_node);
        for _ in 0..100 {
            if !dispatch.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!dispatch.calls().is_empty(), "new leader should verify");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(!lock.is_locked(VERIFIER_LEADER_PATH), "leadership released on shutdown");
    }

    #[tokio::test]
    async fn test_leader_stops_passes_after_revocation() {
        let lock = LocalLockService::new();
        let dispatch = ScriptedDispatch::with(&["a"]);
        // Long interval: at most one pass per lease.
        let scheduler = VerifierScheduler::new(&config("200ms"), dispatch.clone(), Arc::new(lock.clone()));

        let (_tx, mut shutdown_rx) = watch::channel(false);
        let lease = lock
            .try_acquire(VERIFIER_LEADER_PATH, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let revoker = {
            let lock = lock.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                lock.revoke(VERIFIER_LEADER_PATH);
            })
        };

        let stopped = scheduler.lead(&lease, &mut shutdown_rx).await;
        revoker.await.unwrap();
        assert!(!stopped, "lease loss is not a shutdown");
        assert_eq!(dispatch.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_leadership() {
        let lock = LocalLockService::new();
        let _held = lock
            .try_acquire(VERIFIER_LEADER_PATH, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let scheduler = VerifierScheduler::new(&config("1s"), ScriptedDispatch::with(&[]), Arc::new(lock));

        let (tx, rx) = watch::channel(false);
        let run = scheduler.run(rx);
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => panic!("should still be waiting for leadership"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), run).await.unwrap();
    }
}
