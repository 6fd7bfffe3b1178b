//! # Hub Reconciler
//!
//! Keeps a content hub's two storage tiers consistent, and pulls remote
//! channels into local ones.
//!
//! ## Architecture
//!
//! Writes land in a fast, short-retention *write-cache* and are copied to a
//! durable *long-term* tier. The reconciler makes sure nothing is lost in
//! between:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────────┐
//! │                             hub-reconciler                                 │
//! │                                                                            │
//! │  ┌───────────────────┐   ┌────────────────┐   ┌────────────────────────┐   │
//! │  │ VerifierScheduler │──►│ ChannelVerifier│──►│ MissingContentFinder   │   │
//! │  │ (leader only)     │   │ (per channel)  │   │ (write-cache − long-   │   │
//! │  └───────────────────┘   └───────┬────────┘   │  term, one window)     │   │
//! │                                  │            └────────────────────────┘   │
//! │                     marker       │ missing keys                            │
//! │                  ┌───────────────┤                                         │
//! │                  ▼               ▼                                         │
//! │  ┌───────────────────┐   ┌──────────────────────┐                          │
//! │  │ ProgressStore     │   │ ReconciliationQueue  │──► long-term tier        │
//! │  │ (SQLite)          │   │ (bounded, workers)   │                          │
//! │  └───────────────────┘   └──────────────────────┘                          │
//! │                                                                            │
//! │  ┌──────────────────────────────────────────┐                              │
//! │  │ ReplicationManager ─► ChannelReplicator  │◄── remote hub (HTTP)         │
//! │  │ (one per remote URL, under its own lock) │                              │
//! │  └──────────────────────────────────────────┘                              │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two jobs
//!
//! 1. **Verification**: the elected leader periodically diffs each channel's
//!    recent window across the tiers and queues a repair for every key the
//!    long-term tier lacks. The window's marker only advances once every
//!    repair was accepted.
//! 2. **Replication**: per remote channel, resume from the last local item
//!    (or binary search the remote for a safe starting point) and insert
//!    items in sequence order while holding the channel's lock.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use hub_reconciler::{Collaborators, HubConfig, HubReconciler};
//! use hub_reconciler::channel::InMemoryChannelService;
//! use hub_reconciler::lock::LocalLockService;
//! use hub_reconciler::remote::HttpChannelSource;
//! use hub_reconciler::resilience::RetryConfig;
//! use hub_reconciler::store::InMemoryContentStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> hub_reconciler::Result<()> {
//!     let config = HubConfig::default();
//!     let collaborators = Collaborators {
//!         channels: Arc::new(InMemoryChannelService::new()),
//!         write_cache: Arc::new(InMemoryContentStore::new("write_cache")),
//!         long_term: Arc::new(InMemoryContentStore::new("long_term")),
//!         lock: Arc::new(LocalLockService::new()),
//!         remote: Arc::new(HttpChannelSource::new(
//!             config.replicator.remote_timeout_duration(),
//!             RetryConfig::default(),
//!         )?),
//!     };
//!
//!     let mut reconciler = HubReconciler::new(config, collaborators);
//!     reconciler.start().await?;
//!
//!     // Runs until shutdown
//!     tokio::time::sleep(Duration::from_secs(60)).await;
//!     reconciler.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod finder;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod progress;
pub mod queue;
pub mod remote;
pub mod replicator;
pub mod resilience;
pub mod scheduler;
pub mod store;
pub mod verifier;

// Re-exports for convenience
pub use channel::{ChannelConfig, ChannelService};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use config::{HubConfig, ProgressConfig, QueueConfig, ReplicatorConfig, VerifierConfig, WriteCacheConfig};
pub use coordinator::{Collaborators, EngineState, HealthCheck, HubReconciler};
pub use error::{HubError, Result};
pub use finder::MissingContentFinder;
pub use lock::{DistributedLock, LockLease};
pub use model::{ChannelContentKey, ContentKey, MinutePath, VerificationRange};
pub use progress::{ProgressStore, ProgressValue, SqliteProgressStore};
pub use queue::ReconciliationQueue;
pub use remote::{ChannelUrl, RemoteChannelSource};
pub use replicator::{ChannelReplicator, ReplicationManager, ReplicatorState};
pub use scheduler::{VerifierScheduler, VerifyDispatch};
pub use store::{BoxFuture, ContentStore};
pub use verifier::{ChannelVerifier, CycleOutcome};
