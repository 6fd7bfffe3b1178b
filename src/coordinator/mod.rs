// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciler coordinator.
//!
//! Ties together:
//! - Progress markers via [`crate::progress::SqliteProgressStore`]
//! - The repair queue via [`crate::queue::ReconciliationQueue`]
//! - Leader-gated verification via [`crate::scheduler::VerifierScheduler`]
//! - Remote channel pull via [`crate::replicator::ReplicationManager`]
//!
//! # Lifecycle
//!
//! 1. `start()` opens the progress store, starts the repair workers,
//!    spawns the scheduler and the configured replicators
//! 2. `verify()` / `replicate()` / `stop_replication()` serve on-demand
//!    requests from the HTTP layer
//! 3. `shutdown()` stops the scheduler and replicators, drains the queue,
//!    then checkpoints and closes the progress store

mod types;

pub use types::{EngineState, HealthCheck};

use crate::channel::ChannelService;
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::finder::MissingContentFinder;
use crate::lock::DistributedLock;
use crate::metrics;
use crate::progress::SqliteProgressStore;
use crate::queue::ReconciliationQueue;
use crate::remote::RemoteChannelSource;
use crate::replicator::ReplicationManager;
use crate::scheduler::VerifierScheduler;
use crate::store::ContentStore;
use crate::verifier::{ChannelVerifier, CycleOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each background task.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// External services the reconciler runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub channels: Arc<dyn ChannelService>,
    pub write_cache: Arc<dyn ContentStore>,
    pub long_term: Arc<dyn ContentStore>,
    pub lock: Arc<dyn DistributedLock>,
    pub remote: Arc<dyn RemoteChannelSource>,
}

/// Components that only exist while running.
struct Runtime {
    progress: Arc<SqliteProgressStore>,
    queue: Arc<ReconciliationQueue>,
    verifier: Arc<ChannelVerifier>,
    replication: Arc<ReplicationManager>,
}

/// Verifies the write-cache against long-term storage and replicates
/// remote channels.
pub struct HubReconciler {
    config: HubConfig,
    collaborators: Collaborators,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    runtime: RwLock<Option<Runtime>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Scheduler task handle
    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl HubReconciler {
    /// Create a reconciler in the `Created` state.
    pub fn new(config: HubConfig, collaborators: Collaborators) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            collaborators,
            state_tx,
            state_rx,
            runtime: RwLock::new(None),
            shutdown_tx,
            shutdown_rx,
            handles: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(state.as_str());
    }

    /// Start verification and replication.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(HubError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(node_id = %self.config.node_id, "Starting hub reconciler");
        self.set_state(EngineState::Starting);

        let progress = match SqliteProgressStore::open(&self.config.progress).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Failed to open progress store");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        info!(path = %progress.path(), "Progress store initialized");

        let c = &self.collaborators;
        let queue = Arc::new(ReconciliationQueue::start(
            &self.config.queue,
            Arc::clone(&c.write_cache),
            Arc::clone(&c.long_term),
        ));
        let finder = MissingContentFinder::new(
            Arc::clone(&c.write_cache),
            Arc::clone(&c.long_term),
            &self.config.verifier,
        );
        let verifier = Arc::new(ChannelVerifier::new(
            &self.config.verifier,
            &self.config.write_cache,
            Arc::clone(&c.channels),
            progress.clone(),
            finder,
            Arc::clone(&queue),
        ));
        let replication = Arc::new(ReplicationManager::new(
            self.config.replicator.clone(),
            Arc::clone(&c.channels),
            Arc::clone(&c.remote),
            Arc::clone(&c.lock),
        ));

        if self.config.verifier.enabled {
            let scheduler = VerifierScheduler::new(&self.config.verifier, verifier.clone(), Arc::clone(&c.lock));
            let shutdown_rx = self.shutdown_rx.clone();
            let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
            self.handles.write().await.push(handle);
            info!(offset_minutes = self.config.verifier.offset_minutes, "Spawned verifier scheduler");
        }

        if self.config.replicator.enabled {
            for url in &self.config.replicator.channels {
                if let Err(e) = replication.replicate(url) {
                    warn!(url = %url, error = %e, "Skipping replication of invalid channel url");
                }
            }
        }

        *self.runtime.write().await = Some(Runtime {
            progress,
            queue,
            verifier,
            replication,
        });

        self.set_state(EngineState::Running);
        info!("Hub reconciler running");
        Ok(())
    }

    fn not_running(&self) -> HubError {
        HubError::InvalidState {
            expected: "Running".to_string(),
            actual: self.state().to_string(),
        }
    }

    /// Verify one channel now, regardless of leadership.
    pub async fn verify(&self, channel: &str) -> Result<CycleOutcome> {
        let verifier = {
            let runtime = self.runtime.read().await;
            let runtime = runtime.as_ref().ok_or_else(|| self.not_running())?;
            Arc::clone(&runtime.verifier)
        };
        verifier.verify(channel).await
    }

    /// Start replicating a remote channel. `Ok(false)` if already running.
    pub async fn replicate(&self, channel_url: &str) -> Result<bool> {
        let runtime = self.runtime.read().await;
        let runtime = runtime.as_ref().ok_or_else(|| self.not_running())?;
        runtime.replication.replicate(channel_url)
    }

    /// Stop replicating a remote channel. `Ok(false)` if it was not running.
    pub async fn stop_replication(&self, channel_url: &str) -> Result<bool> {
        let replication = {
            let runtime = self.runtime.read().await;
            let runtime = runtime.as_ref().ok_or_else(|| self.not_running())?;
            Arc::clone(&runtime.replication)
        };
        Ok(replication.stop(channel_url).await)
    }

    /// Health snapshot for monitoring endpoints. Performs no I/O.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let runtime = self.runtime.read().await;
        match runtime.as_ref() {
            Some(rt) => HealthCheck {
                state,
                ready: state == EngineState::Running && !rt.queue.is_closed(),
                queue_pending: rt.queue.pending(),
                queue_capacity: rt.queue.capacity(),
                repairs: rt.queue.stats(),
                replicators: rt.replication.urls(),
            },
            None => HealthCheck {
                state,
                ready: false,
                queue_pending: 0,
                queue_capacity: 0,
                repairs: Default::default(),
                replicators: Vec::new(),
            },
        }
    }

    /// Shut down gracefully.
    ///
    /// 1. Signal the scheduler and replicators to stop
    /// 2. Wait for them (bounded per task)
    /// 3. Close the repair queue, draining buffered repairs
    /// 4. Checkpoint and close the progress store
    pub async fn shutdown(&mut self) {
        info!("Shutting down hub reconciler");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(TASK_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        if let Some(runtime) = self.runtime.write().await.take() {
            runtime.replication.stop_all().await;
            if !runtime.queue.close().await {
                warn!("Repair queue did not drain, remaining repairs retried next cycle");
            }
            runtime.progress.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!("Hub reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, InMemoryChannelService};
    use crate::lock::LocalLockService;
    use crate::remote::HttpChannelSource;
    use crate::resilience::RetryConfig;
    use crate::store::InMemoryContentStore;

    fn collaborators(channels: Arc<InMemoryChannelService>) -> Collaborators {
        Collaborators {
            channels,
            write_cache: Arc::new(InMemoryContentStore::new("write_cache")),
            long_term: Arc::new(InMemoryContentStore::new("long_term")),
            lock: Arc::new(LocalLockService::new()),
            remote: Arc::new(HttpChannelSource::new(Duration::from_millis(200), RetryConfig::none()).unwrap()),
        }
    }

    fn test_config() -> HubConfig {
        let mut config = HubConfig::for_testing("test-node");
        config.verifier.enabled = false;
        config
    }

    #[test]
    fn test_initial_state() {
        let reconciler = HubReconciler::new(test_config(), collaborators(Arc::new(InMemoryChannelService::new())));
        assert_eq!(reconciler.state(), EngineState::Created);
        assert!(!reconciler.is_running());
        assert_eq!(reconciler.node_id(), "test-node");
        assert_eq!(*reconciler.state_receiver().borrow(), EngineState::Created);
    }

    #[tokio::test]
    async fn test_start_then_shutdown() {
        let mut reconciler = HubReconciler::new(test_config(), collaborators(Arc::new(InMemoryChannelService::new())));
        reconciler.start().await.unwrap();
        assert!(reconciler.is_running());

        let health = reconciler.health_check().await;
        assert!(health.ready);
        assert_eq!(health.queue_capacity, 64);

        reconciler.shutdown().await;
        assert_eq!(reconciler.state(), EngineState::Stopped);
        assert!(!reconciler.health_check().await.ready);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let mut reconciler = HubReconciler::new(test_config(), collaborators(Arc::new(InMemoryChannelService::new())));
        reconciler.start().await.unwrap();

        match reconciler.start().await {
            Err(HubError::InvalidState { expected, actual }) => {
                assert_eq!(expected, "Created");
                assert_eq!(actual, "Running");
            }
            other => panic!("expected InvalidState, got {:?}", other),
        }
        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_before_start_are_rejected() {
        let reconciler = HubReconciler::new(test_config(), collaborators(Arc::new(InMemoryChannelService::new())));
        assert!(matches!(
            reconciler.verify("events").await,
            Err(HubError::InvalidState { .. })
        ));
        assert!(reconciler.replicate("http://hub/channel/events").await.is_err());
        assert!(reconciler.stop_replication("http://hub/channel/events").await.is_err());
    }

    #[tokio::test]
    async fn test_verify_on_demand() {
        let channels = Arc::new(InMemoryChannelService::new());
        channels.put(ChannelConfig::new("events"), None).await;
        let mut reconciler = HubReconciler::new(test_config(), collaborators(channels));
        reconciler.start().await.unwrap();

        assert_eq!(reconciler.verify("events").await.unwrap(), CycleOutcome::Verified { missing: 0 });
        assert_eq!(reconciler.verify("nope").await.unwrap(), CycleOutcome::Skipped);
        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_replicate_registration() {
        let mut config = test_config();
        config.replicator.lock_wait = "10ms".to_string();
        let mut reconciler = HubReconciler::new(config, collaborators(Arc::new(InMemoryChannelService::new())));
        reconciler.start().await.unwrap();

        let url = "http://127.0.0.1:9/channel/events";
        assert!(reconciler.replicate(url).await.unwrap());
        assert!(!reconciler.replicate(url).await.unwrap());
        assert_eq!(reconciler.health_check().await.replicators.len(), 1);
        assert!(reconciler.stop_replication(url).await.unwrap());
        assert!(!reconciler.stop_replication(url).await.unwrap());

        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_fails_on_bad_progress_path() {
        let mut config = test_config();
        config.progress.sqlite_path = "/nonexistent-dir/deeper/progress.db".to_string();
        let mut reconciler = HubReconciler::new(config, collaborators(Arc::new(InMemoryChannelService::new())));

        assert!(reconciler.start().await.is_err());
        assert_eq!(reconciler.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_shutdown_from_created() {
        let mut reconciler = HubReconciler::new(test_config(), collaborators(Arc::new(InMemoryChannelService::new())));
        reconciler.shutdown().await;
        assert_eq!(reconciler.state(), EngineState::Stopped);
    }
}
