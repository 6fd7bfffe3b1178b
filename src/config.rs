//! Configuration for the reconciler.
//!
//! Configuration is passed to [`HubReconciler::new()`](crate::HubReconciler::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use hub_reconciler::config::{HubConfig, VerifierConfig};
//!
//! let config = HubConfig {
//!     node_id: "hub-2".into(),
//!     verifier: VerifierConfig::for_replica(2),
//!     ..Default::default()
//! };
//! assert_eq!(config.verifier.offset_minutes, 30);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! HubConfig
//! ├── node_id: String                # This node's identity (logs, lock owner)
//! ├── verifier: VerifierConfig       # Leader-gated write-cache vs long-term check
//! ├── queue: QueueConfig             # Repair queue and worker pool
//! ├── replicator: ReplicatorConfig   # Remote channel pull
//! ├── write_cache: WriteCacheConfig  # Retention of the fast tier
//! └── progress: ProgressConfig       # SQLite marker persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "hub-1"
//!
//! verifier:
//!   offset_minutes: 15
//!   base_timeout: "2m"
//!
//! queue:
//!   capacity: 2000
//!   workers: 20
//!
//! replicator:
//!   channels:
//!     - "http://upstream:8080/channel/flights/"
//!
//! progress:
//!   sqlite_path: "/var/lib/hub/progress.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `HubReconciler::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Identity of this node. Used in logs and as the lock owner name.
    pub node_id: String,

    #[serde(default)]
    pub verifier: VerifierConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub replicator: ReplicatorConfig,

    #[serde(default)]
    pub write_cache: WriteCacheConfig,

    #[serde(default)]
    pub progress: ProgressConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            node_id: "local.dev.hub".to_string(),
            verifier: VerifierConfig::default(),
            queue: QueueConfig::default(),
            replicator: ReplicatorConfig::default(),
            write_cache: WriteCacheConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}

impl HubConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            queue: QueueConfig {
                capacity: 64,
                workers: 2,
                drain_timeout: "2s".to_string(),
                ..Default::default()
            },
            progress: ProgressConfig::in_memory(),
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// VerifierConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Write-cache vs long-term verification settings.
///
/// Replicas are expected to run with different offsets so that a channel's
/// window is re-checked at staggered lags: replica 1 looks 15 minutes back,
/// replica 2 looks 30 minutes back, and so on. The offset is always an
/// explicit value; use [`for_replica()`](Self::for_replica) to derive it from
/// a replica ordinal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Width of the default window, and the default interval between passes.
    #[serde(default = "default_offset_minutes")]
    pub offset_minutes: i64,

    /// Base timeout for the paired tier queries (e.g., "2m").
    #[serde(default = "default_base_timeout")]
    pub base_timeout: String,

    /// Added to `base_timeout` for every started day the window spans.
    #[serde(default = "default_timeout_per_day")]
    pub timeout_per_day: String,

    /// Time between passes. Defaults to `offset_minutes` when unset.
    #[serde(default)]
    pub interval: Option<String>,

    /// Channels verified concurrently in one pass.
    #[serde(default = "default_channel_threads")]
    pub channel_threads: usize,

    /// Tier queries in flight at once (two per channel).
    #[serde(default = "default_query_threads")]
    pub query_threads: usize,

    /// How long to wait for leadership before retrying.
    #[serde(default = "default_leadership_wait")]
    pub leadership_wait: String,
}

fn default_true() -> bool {
    true
}

fn default_offset_minutes() -> i64 {
    15
}

fn default_base_timeout() -> String {
    "2m".to_string()
}

fn default_timeout_per_day() -> String {
    "1m".to_string()
}

fn default_channel_threads() -> usize {
    10
}

fn default_query_threads() -> usize {
    20
}

fn default_leadership_wait() -> String {
    "1s".to_string()
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            offset_minutes: 15,
            base_timeout: "2m".to_string(),
            timeout_per_day: "1m".to_string(),
            interval: None,
            channel_threads: 10,
            query_threads: 20,
            leadership_wait: "1s".to_string(),
        }
    }
}

impl VerifierConfig {
    /// Config for the replica with the given 1-based ordinal.
    ///
    /// Ordinals 1, 2 and 3 look back 15, 30 and 45 minutes. Anything else
    /// falls back to a 5-minute offset.
    pub fn for_replica(ordinal: u32) -> Self {
        let offset_minutes = match ordinal {
            1..=3 => 15 * ordinal as i64,
            _ => 5,
        };
        Self {
            offset_minutes,
            ..Default::default()
        }
    }

    pub fn base_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.base_timeout).unwrap_or(Duration::from_secs(120))
    }

    pub fn timeout_per_day_duration(&self) -> Duration {
        humantime::parse_duration(&self.timeout_per_day).unwrap_or(Duration::from_secs(60))
    }

    /// Time between the start of one pass and the start of the next.
    pub fn interval_duration(&self) -> Duration {
        let fallback = Duration::from_secs(self.offset_minutes.max(0) as u64 * 60);
        self.interval
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
            .unwrap_or(fallback)
    }

    pub fn leadership_wait_duration(&self) -> Duration {
        humantime::parse_duration(&self.leadership_wait).unwrap_or(Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Repair queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum buffered repairs. `add` fails fast beyond this.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Number of worker tasks draining the buffer.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Grace period for in-flight repairs on close.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,

    /// Optional cap on long-term writes per second.
    #[serde(default)]
    pub rate_limit_per_sec: Option<u32>,

    /// Failures before the long-term write circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long the circuit stays open before probing again (seconds).
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout_sec: u64,
}

fn default_capacity() -> usize {
    2000
}

fn default_workers() -> usize {
    20
}

fn default_drain_timeout() -> String {
    "30s".to_string()
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 2000,
            workers: 20,
            drain_timeout: "30s".to_string(),
            rate_limit_per_sec: None,
            circuit_failure_threshold: 5,
            circuit_reset_timeout_sec: 30,
        }
    }
}

impl QueueConfig {
    pub fn drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.drain_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Rate limit for long-term writes, if configured.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        self.rate_limit_per_sec
            .map(|rate| crate::resilience::RateLimitConfig {
                burst_size: rate.max(1),
                refill_rate: rate,
            })
    }

    /// Circuit settings for long-term writes.
    pub fn circuit_config(&self) -> crate::circuit_breaker::CircuitConfig {
        crate::circuit_breaker::CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout: Duration::from_secs(self.circuit_reset_timeout_sec),
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicatorConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Remote channel replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long to wait for the per-channel lock.
    #[serde(default = "default_lock_wait")]
    pub lock_wait: String,

    /// Pause between replication attempts for one channel.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval: String,

    /// Items expiring within this margin are skipped when searching
    /// for a starting point.
    #[serde(default = "default_expiry_margin")]
    pub expiry_margin: String,

    /// Timeout for each remote HTTP request.
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout: String,

    /// Remote channel URLs to replicate on startup.
    #[serde(default)]
    pub channels: Vec<String>,
}

fn default_lock_wait() -> String {
    "1s".to_string()
}

fn default_cycle_interval() -> String {
    "30s".to_string()
}

fn default_expiry_margin() -> String {
    "10m".to_string()
}

fn default_remote_timeout() -> String {
    "30s".to_string()
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_wait: "1s".to_string(),
            cycle_interval: "30s".to_string(),
            expiry_margin: "10m".to_string(),
            remote_timeout: "30s".to_string(),
            channels: Vec::new(),
        }
    }
}

impl ReplicatorConfig {
    pub fn lock_wait_duration(&self) -> Duration {
        humantime::parse_duration(&self.lock_wait).unwrap_or(Duration::from_secs(1))
    }

    pub fn cycle_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.cycle_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn expiry_margin_duration(&self) -> Duration {
        humantime::parse_duration(&self.expiry_margin).unwrap_or(Duration::from_secs(600))
    }

    pub fn remote_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.remote_timeout).unwrap_or(Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WriteCacheConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Retention of the write-cache tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteCacheConfig {
    /// Items older than this are gone from the write-cache.
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: i64,
}

fn default_ttl_minutes() -> i64 {
    60
}

impl Default for WriteCacheConfig {
    fn default() -> Self {
        Self { ttl_minutes: 60 }
    }
}

impl WriteCacheConfig {
    /// How far back a verification window may start and still find
    /// everything the write-cache ever held. Two minutes short of the TTL
    /// so items aren't expiring mid-query.
    pub fn floor_minutes(&self) -> i64 {
        (self.ttl_minutes - 2).max(0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProgressConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Progress marker persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Path to SQLite database for marker storage.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "hub_progress.db".to_string(),
            wal_mode: true,
        }
    }
}

impl ProgressConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
