//! Pull replication of a remote sequence channel into a local channel.
//!
//! # State machine
//!
//! ```text
//!   Idle ──► Initializing ──► Replicating ──► Stopped
//!    ▲            │                 │
//!    └────────────┘                 │ lock lost / remote exhausted
//!   remote missing, unsupported,    ▼
//!   or no starting point         (next cycle starts at Idle)
//! ```
//!
//! Each cycle runs under the lock `/ChannelReplicator/<channel>`, so only
//! one node in the cluster pulls a given channel. The lease is checked
//! before every item; losing it ends the cycle.
//!
//! # Where to start
//!
//! If the local channel already holds a real item, replication resumes at
//! the next sequence. Otherwise the remote sequence space is binary
//! searched for the oldest item that exists and will not expire within
//! the safety margin. The search assumes that predicate is monotonic in
//! sequence (older items expire first); gaps or out-of-order expiry can
//! land it too early or too late.

use crate::channel::{ChannelConfig, ChannelService};
use crate::config::ReplicatorConfig;
use crate::error::{HubError, Result};
use crate::lock::{replicator_lock_path, run_with_lock, DistributedLock, LockLease};
use crate::metrics;
use crate::model::SEQUENCE_START;
use crate::remote::{ChannelUrl, RemoteChannelSource};
use crate::resilience::pause_or_shutdown;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// How long `stop` waits for a replicator task to finish.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Idle,
    Initializing,
    Replicating,
    Stopped,
}

impl ReplicatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicatorState::Idle => "Idle",
            ReplicatorState::Initializing => "Initializing",
            ReplicatorState::Replicating => "Replicating",
            ReplicatorState::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Smallest sequence in `(low, high]` satisfying `exists`.
///
/// `low` is assumed to fail and `high` to pass; if nothing in between
/// passes the answer is `high`. Takes `O(log(high - low))` probes.
pub async fn binary_search_start<F, Fut>(low: u64, high: u64, mut exists: F) -> Result<u64>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut low = low;
    let mut high = high;
    let mut best = high;
    while high > low && high - low > 1 {
        let middle = low + (high - low) / 2;
        if exists(middle).await? {
            high = middle;
            best = middle;
        } else {
            low = middle;
        }
    }
    Ok(best)
}

/// Replicates one remote channel.
pub struct ChannelReplicator {
    channel: ChannelUrl,
    channels: Arc<dyn ChannelService>,
    remote: Arc<dyn RemoteChannelSource>,
    lock: Arc<dyn DistributedLock>,
    lock_wait: Duration,
    cycle_interval: Duration,
    expiry_margin: chrono::Duration,
    state_tx: watch::Sender<ReplicatorState>,
}

impl ChannelReplicator {
    pub fn new(
        channel: ChannelUrl,
        config: &ReplicatorConfig,
        channels: Arc<dyn ChannelService>,
        remote: Arc<dyn RemoteChannelSource>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ReplicatorState::Idle);
        let expiry_margin =
            chrono::Duration::from_std(config.expiry_margin_duration()).unwrap_or_else(|_| chrono::Duration::minutes(10));
        Self {
            channel,
            channels,
            remote,
            lock,
            lock_wait: config.lock_wait_duration(),
            cycle_interval: config.cycle_interval_duration(),
            expiry_margin,
            state_tx,
        }
    }

    /// Local (and remote) channel name.
    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub fn url(&self) -> &ChannelUrl {
        &self.channel
    }

    pub fn state(&self) -> ReplicatorState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ReplicatorState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ReplicatorState) {
        self.state_tx.send_replace(state);
        metrics::set_replicator_state(self.name(), state.as_str());
    }

    /// Fetch the remote configuration and make sure the local mirror exists.
    ///
    /// Returns `None` (back to `Idle`) if the remote channel is missing or
    /// is not sequence-ordered.
    pub async fn initialize(&self) -> Result<Option<ChannelConfig>> {
        self.set_state(ReplicatorState::Initializing);

        let Some(mut config) = self.remote.get_configuration(&self.channel).await? else {
            warn!(url = %self.channel, "Remote channel not found");
            self.set_state(ReplicatorState::Idle);
            return Ok(None);
        };
        if !config.is_sequence() {
            let unsupported = HubError::UnsupportedChannel(self.channel.to_string());
            warn!(error = %unsupported, kind = ?config.kind, "Only sequence channels can be replicated");
            self.set_state(ReplicatorState::Idle);
            return Ok(None);
        }

        config.name = self.name().to_string();
        if !self.channels.exists(self.name()).await? {
            info!(channel = %self.name(), "Creating local mirror channel");
            self.channels.create(config.clone()).await?;
        }
        Ok(Some(config))
    }

    /// First sequence to pull.
    pub async fn starting_sequence(&self, config: &ChannelConfig) -> Result<u64> {
        match self.channels.last_sequence(self.name()).await? {
            Some(last) if !last.is_start() => Ok(last.sequence + 1),
            _ => self.search_for_starting_key(config).await,
        }
    }

    /// Binary search the remote for the oldest item worth pulling.
    pub async fn search_for_starting_key(&self, config: &ChannelConfig) -> Result<u64> {
        debug!(url = %self.channel, "Searching remote sequence space");
        let Some(latest) = self.remote.get_latest_sequence(&self.channel).await? else {
            return Ok(SEQUENCE_START + 1);
        };
        if latest <= SEQUENCE_START {
            return Ok(SEQUENCE_START + 1);
        }
        let start = binary_search_start(SEQUENCE_START, latest, |sequence| {
            self.exists_and_not_expired(config, sequence)
        })
        .await?;
        debug!(url = %self.channel, start, latest, "Found starting sequence");
        Ok(start)
    }

    /// Whether `sequence` exists remotely and outlives the expiry margin.
    ///
    /// Channels without a TTL never expire.
    pub async fn exists_and_not_expired(&self, config: &ChannelConfig, sequence: u64) -> Result<bool> {
        let Some(created) = self.remote.get_creation_date(&self.channel, sequence).await? else {
            return Ok(false);
        };
        let Some(ttl_millis) = config.ttl_millis else {
            return Ok(true);
        };
        let cutoff = Utc::now() - chrono::Duration::milliseconds(ttl_millis) + self.expiry_margin;
        Ok(created > cutoff)
    }

    /// Pull items from `start` until the remote runs out or we must stop.
    ///
    /// Returns the number of items inserted.
    async fn pull(&self, start: u64, lease: &LockLease, shutdown_rx: &watch::Receiver<bool>) -> Result<u64> {
        self.set_state(ReplicatorState::Replicating);
        metrics::set_replicator_start_sequence(self.name(), start);
        info!(url = %self.channel, start, "Replicating");

        let keep_working = || lease.is_held() && !*shutdown_rx.borrow();
        let mut next = start;
        let mut inserted = 0;

        'outer: while keep_working() {
            let Some(latest) = self.remote.get_latest_sequence(&self.channel).await? else {
                break;
            };
            if next > latest {
                break;
            }
            while next <= latest {
                if !keep_working() {
                    break 'outer;
                }
                match self.remote.fetch(&self.channel, next).await? {
                    Some(bytes) => {
                        self.channels.insert(self.name(), next, bytes).await?;
                        metrics::record_replicator_inserted(self.name());
                        inserted += 1;
                    }
                    None => debug!(sequence = next, "Remote item missing, skipping"),
                }
                next += 1;
            }
        }

        if !lease.is_held() {
            warn!(url = %self.channel, next, "Replication lock lost");
        }
        self.set_state(ReplicatorState::Stopped);
        Ok(inserted)
    }

    async fn cycle(&self, lease: LockLease, shutdown_rx: &watch::Receiver<bool>) -> Result<u64> {
        self.set_state(ReplicatorState::Idle);
        let Some(config) = self.initialize().await? else {
            return Ok(0);
        };
        let start = self.starting_sequence(&config).await?;
        self.pull(start, &lease, shutdown_rx).await
    }

    /// One locked cycle. `Ok(None)` if another node holds the lock.
    pub async fn run_once(&self, shutdown_rx: &watch::Receiver<bool>) -> Result<Option<u64>> {
        let path = replicator_lock_path(self.name());
        let outcome = run_with_lock(self.lock.as_ref(), &path, self.lock_wait, |lease| {
            self.cycle(lease, shutdown_rx)
        })
        .await?;
        match outcome {
            Some(Err(e)) => {
                self.set_state(ReplicatorState::Idle);
                Err(e)
            }
            Some(Ok(inserted)) => Ok(Some(inserted)),
            None => Ok(None),
        }
    }

    /// Repeat [`run_once()`](Self::run_once) every `cycle_interval` until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("replicator", channel = %self.name());

        async move {
            let _ = shutdown_rx.borrow_and_update();
            info!(url = %self.channel, "Replicator started");

            loop {
                match self.run_once(&shutdown_rx).await {
                    Ok(Some(inserted)) => debug!(inserted, "Replication cycle complete"),
                    Ok(None) => debug!("Replication lock held elsewhere"),
                    Err(e) => warn!(error = %e, "Replication cycle failed"),
                }
                if pause_or_shutdown(self.cycle_interval, &mut shutdown_rx).await {
                    break;
                }
            }

            self.set_state(ReplicatorState::Stopped);
            info!(url = %self.channel, "Replicator stopped");
        }
        .instrument(span)
        .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

struct RunningReplicator {
    replicator: Arc<ChannelReplicator>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Starts and stops replicators by remote URL.
pub struct ReplicationManager {
    config: ReplicatorConfig,
    channels: Arc<dyn ChannelService>,
    remote: Arc<dyn RemoteChannelSource>,
    lock: Arc<dyn DistributedLock>,
    running: DashMap<String, RunningReplicator>,
}

impl ReplicationManager {
    pub fn new(
        config: ReplicatorConfig,
        channels: Arc<dyn ChannelService>,
        remote: Arc<dyn RemoteChannelSource>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        Self {
            config,
            channels,
            remote,
            lock,
            running: DashMap::new(),
        }
    }

    /// Start replicating `url`. Returns `false` if it already is.
    ///
    /// Must be called from within a tokio runtime.
    pub fn replicate(&self, url: &str) -> Result<bool> {
        let channel = ChannelUrl::parse(url)?;
        match self.running.entry(channel.as_str().to_string()) {
            Entry::Occupied(_) => {
                debug!(url = %channel, "Already replicating");
                Ok(false)
            }
            Entry::Vacant(slot) => {
                let replicator = Arc::new(ChannelReplicator::new(
                    channel.clone(),
                    &self.config,
                    Arc::clone(&self.channels),
                    Arc::clone(&self.remote),
                    Arc::clone(&self.lock),
                ));
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let handle = tokio::spawn({
                    let replicator = Arc::clone(&replicator);
                    async move { replicator.run(shutdown_rx).await }
                });
                slot.insert(RunningReplicator {
                    replicator,
                    shutdown_tx,
                    handle,
                });
                info!(url = %channel, "Spawned replicator");
                Ok(true)
            }
        }
    }

    /// Stop replicating `url`. Returns `false` if it was not running.
    pub async fn stop(&self, url: &str) -> bool {
        let Ok(channel) = ChannelUrl::parse(url) else {
            return false;
        };
        let Some((_, running)) = self.running.remove(channel.as_str()) else {
            return false;
        };
        let _ = running.shutdown_tx.send(true);
        let abort = running.handle.abort_handle();
        match tokio::time::timeout(STOP_TIMEOUT, running.handle).await {
            Ok(Ok(())) => debug!(url = %channel, "Replicator stopped"),
            Ok(Err(e)) => warn!(url = %channel, error = %e, "Replicator panicked"),
            Err(_) => {
                // Stuck in a remote call; dropping the handle alone would detach it.
                abort.abort();
                warn!(url = %channel, "Replicator did not stop in time, aborted");
            }
        }
        true
    }

    /// Stop every replicator.
    pub async fn stop_all(&self) {
        let urls = self.urls();
        for url in urls {
            self.stop(&url).await;
        }
    }

    /// URLs currently replicated, sorted.
    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.running.iter().map(|entry| entry.key().clone()).collect();
        urls.sort();
        urls
    }

    pub fn state(&self, url: &str) -> Option<ReplicatorState> {
        let channel = ChannelUrl::parse(url).ok()?;
        self.running
            .get(channel.as_str())
            .map(|running| running.replicator.state())
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}
