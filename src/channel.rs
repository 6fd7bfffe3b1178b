//! Channel configuration and the local channel service.
//!
//! [`ChannelService`] is the reconciler's view of the hub's channel
//! registry: what channels exist, how they are stored, when they were last
//! written, and (for replication targets) the ability to create a channel
//! and append sequence-numbered items to it.

use crate::error::{HubError, Result};
use crate::model::{SequenceKey, SEQUENCE_START};
use crate::store::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Which long-term layout a channel is written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageMode {
    /// One long-term object per item.
    #[default]
    Single,
    /// Items grouped into per-minute batches.
    Batch,
    /// Both layouts.
    Both,
}

impl StorageMode {
    /// Whether items land in long-term storage one by one.
    pub fn is_single(&self) -> bool {
        matches!(self, StorageMode::Single | StorageMode::Both)
    }
}

/// How a channel orders its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Items carry monotonically increasing sequence numbers.
    Sequence,
    /// Items are keyed by write time.
    #[default]
    Time,
}

/// Per-channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,

    #[serde(default)]
    pub storage: StorageMode,

    #[serde(default, rename = "type")]
    pub kind: ChannelKind,

    /// Time-to-live in milliseconds. `None` means items never expire.
    #[serde(default, rename = "ttlMillis")]
    pub ttl_millis: Option<i64>,

    /// Historical channels are backfilled rather than written live, so the
    /// write-cache retention floor does not apply to them.
    #[serde(default)]
    pub historical: bool,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: StorageMode::default(),
            kind: ChannelKind::default(),
            ttl_millis: None,
            historical: false,
        }
    }

    pub fn with_storage(mut self, storage: StorageMode) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_kind(mut self, kind: ChannelKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_ttl_millis(mut self, ttl: Option<i64>) -> Self {
        self.ttl_millis = ttl;
        self
    }

    pub fn historical(mut self, historical: bool) -> Self {
        self.historical = historical;
        self
    }

    /// Whether the verifier should check this channel.
    pub fn is_verifiable(&self) -> bool {
        self.storage.is_single()
    }

    pub fn is_live(&self) -> bool {
        !self.historical
    }

    pub fn is_sequence(&self) -> bool {
        self.kind == ChannelKind::Sequence
    }
}

/// The hub's channel registry.
pub trait ChannelService: Send + Sync + 'static {
    /// Every configured channel.
    fn list_channels(&self) -> BoxFuture<'_, Vec<ChannelConfig>>;

    /// Configuration for one channel, `None` if unknown.
    fn get_channel(&self, name: &str) -> BoxFuture<'_, Option<ChannelConfig>>;

    /// Time of the most recent write to the channel, `None` if never written.
    fn last_updated(&self, name: &str) -> BoxFuture<'_, Option<DateTime<Utc>>>;

    fn exists(&self, name: &str) -> BoxFuture<'_, bool>;

    /// Create a channel. Creating an existing channel is a no-op.
    fn create(&self, config: ChannelConfig) -> BoxFuture<'_, ()>;

    /// The last item inserted into a sequence channel.
    fn last_sequence(&self, name: &str) -> BoxFuture<'_, Option<SequenceKey>>;

    /// Append one item to a sequence channel.
    fn insert(&self, name: &str, sequence: u64, bytes: Vec<u8>) -> BoxFuture<'_, SequenceKey>;
}

#[derive(Debug)]
struct ChannelEntry {
    config: ChannelConfig,
    last_updated: Option<DateTime<Utc>>,
    items: BTreeMap<u64, Vec<u8>>,
}

/// Process-local channel registry.
#[derive(Debug, Default)]
pub struct InMemoryChannelService {
    channels: RwLock<HashMap<String, ChannelEntry>>,
}

impl InMemoryChannelService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel with a known last-write time.
    pub async fn put(&self, config: ChannelConfig, last_updated: Option<DateTime<Utc>>) {
        let mut channels = self.channels.write().await;
        let entry = channels.entry(config.name.clone()).or_insert_with(|| ChannelEntry {
            config: config.clone(),
            last_updated: None,
            items: BTreeMap::new(),
        });
        entry.config = config;
        entry.last_updated = last_updated;
    }

    pub async fn set_last_updated(&self, name: &str, time: DateTime<Utc>) {
        if let Some(entry) = self.channels.write().await.get_mut(name) {
            entry.last_updated = Some(time);
        }
    }

    /// Sequences stored in a channel, ascending.
    pub async fn sequences(&self, name: &str) -> Vec<u64> {
        self.channels
            .read()
            .await
            .get(name)
            .map(|entry| entry.items.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl ChannelService for InMemoryChannelService {
    fn list_channels(&self) -> BoxFuture<'_, Vec<ChannelConfig>> {
        Box::pin(async move {
            let mut configs: Vec<ChannelConfig> = self
                .channels
                .read()
                .await
                .values()
                .map(|entry| entry.config.clone())
                .collect();
            configs.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(configs)
        })
    }

    fn get_channel(&self, name: &str) -> BoxFuture<'_, Option<ChannelConfig>> {
        let name = name.to_string();
        Box::pin(async move {
            Ok(self
                .channels
                .read()
                .await
                .get(&name)
                .map(|entry| entry.config.clone()))
        })
    }

    fn last_updated(&self, name: &str) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        let name = name.to_string();
        Box::pin(async move {
            Ok(self
                .channels
                .read()
                .await
                .get(&name)
                .and_then(|entry| entry.last_updated))
        })
    }

    fn exists(&self, name: &str) -> BoxFuture<'_, bool> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.channels.read().await.contains_key(&name)) })
    }

    fn create(&self, config: ChannelConfig) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut channels = self.channels.write().await;
            channels
                .entry(config.name.clone())
                .or_insert_with(|| ChannelEntry {
                    config,
                    last_updated: None,
                    items: BTreeMap::new(),
                });
            Ok(())
        })
    }

    fn last_sequence(&self, name: &str) -> BoxFuture<'_, Option<SequenceKey>> {
        let name = name.to_string();
        Box::pin(async move {
            Ok(self
                .channels
                .read()
                .await
                .get(&name)
                .and_then(|entry| entry.items.keys().next_back().copied())
                .map(|sequence| SequenceKey::new(name.clone(), sequence)))
        })
    }

    fn insert(&self, name: &str, sequence: u64, bytes: Vec<u8>) -> BoxFuture<'_, SequenceKey> {
        let name = name.to_string();
        Box::pin(async move {
            if sequence <= SEQUENCE_START {
                return Err(HubError::store(
                    "insert",
                    format!("sequence {} is not above the start value", sequence),
                ));
            }
            let mut channels = self.channels.write().await;
            let entry = channels
                .get_mut(&name)
                .ok_or_else(|| HubError::store("insert", format!("no channel {}", name)))?;
            entry.items.insert(sequence, bytes);
            entry.last_updated = Some(Utc::now());
            Ok(SequenceKey::new(name, sequence))
        })
    }
}
