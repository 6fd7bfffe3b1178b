//! Content store integration traits.
//!
//! The reconciler talks to two instances of [`ContentStore`]: the
//! write-cache tier and the long-term tier. Implementations live outside
//! this crate (HTTP hub nodes, object storage clients); the
//! [`InMemoryContentStore`] here backs tests and standalone runs.
//!
//! # Contract
//!
//! - `query_by_time` returns a complete, duplicate-free set for the window.
//!   An empty window is an empty set, never an error.
//! - `write` is idempotent: the same key with the same bytes may be written
//!   any number of times.

use crate::error::Result;
use crate::model::{ContentKey, TimeUnit};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A time-window query against one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeQuery {
    pub channel: String,
    pub start_time: DateTime<Utc>,
    pub unit: TimeUnit,
    /// Exclusive end. When absent the window is one `unit` long.
    pub end_time: Option<DateTime<Utc>>,
}

impl TimeQuery {
    /// Query `[start, end)` at minute granularity.
    pub fn between(channel: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            channel: channel.into(),
            start_time: start,
            unit: TimeUnit::Minutes,
            end_time: Some(end),
        }
    }

    /// Query the single `unit` bucket containing `start`.
    pub fn bucket(channel: impl Into<String>, start: DateTime<Utc>, unit: TimeUnit) -> Self {
        Self {
            channel: channel.into(),
            start_time: start,
            unit,
            end_time: None,
        }
    }

    /// Resolved `[start, end)` bounds.
    pub fn window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        match self.end_time {
            Some(end) => (self.start_time, end),
            None => {
                let start = self.unit.round(self.start_time);
                (start, start + self.unit.duration())
            }
        }
    }
}

/// One storage tier.
pub trait ContentStore: Send + Sync + 'static {
    /// Short name used in logs ("write_cache", "long_term").
    fn name(&self) -> &str;

    /// All keys in the query window, ordered.
    fn query_by_time(&self, query: TimeQuery) -> BoxFuture<'_, BTreeSet<ContentKey>>;

    /// Bytes for a key, `None` if absent.
    fn read(&self, channel: &str, key: &ContentKey) -> BoxFuture<'_, Option<Vec<u8>>>;

    /// Store bytes under a key, returning the key written.
    fn write(&self, channel: &str, key: &ContentKey, bytes: Vec<u8>) -> BoxFuture<'_, ContentKey>;
}

/// Process-local store keyed by channel then content key.
#[derive(Default)]
pub struct InMemoryContentStore {
    name: String,
    channels: RwLock<HashMap<String, BTreeMap<ContentKey, Vec<u8>>>>,
}

impl InMemoryContentStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Number of items stored for a channel.
    pub async fn len(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, |items| items.len())
    }

    pub async fn is_empty(&self, channel: &str) -> bool {
        self.len(channel).await == 0
    }

    pub async fn contains(&self, channel: &str, key: &ContentKey) -> bool {
        self.channels
            .read()
            .await
            .get(channel)
            .is_some_and(|items| items.contains_key(key))
    }
}

impl ContentStore for InMemoryContentStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_by_time(&self, query: TimeQuery) -> BoxFuture<'_, BTreeSet<ContentKey>> {
        Box::pin(async move {
            let (start, end) = query.window();
            if start >= end {
                return Ok(BTreeSet::new());
            }
            let channels = self.channels.read().await;
            let keys = channels
                .get(&query.channel)
                .map(|items| {
                    items
                        .range(ContentKey::first_key(start)..ContentKey::first_key(end))
                        .map(|(key, _)| key.clone())
                        .collect()
                })
                .unwrap_or_default();
            Ok(keys)
        })
    }

    fn read(&self, channel: &str, key: &ContentKey) -> BoxFuture<'_, Option<Vec<u8>>> {
        let channel = channel.to_string();
        let key = key.clone();
        Box::pin(async move {
            Ok(self
                .channels
                .read()
                .await
                .get(&channel)
                .and_then(|items| items.get(&key).cloned()))
        })
    }

    fn write(&self, channel: &str, key: &ContentKey, bytes: Vec<u8>) -> BoxFuture<'_, ContentKey> {
        let channel = channel.to_string();
        let key = key.clone();
        Box::pin(async move {
            tracing::trace!(store = %self.name, channel = %channel, key = %key, len = bytes.len(), "write");
            self.channels
                .write()
                .await
                .entry(channel)
                .or_default()
                .insert(key.clone(), bytes);
            Ok(key)
        })
    }
}
