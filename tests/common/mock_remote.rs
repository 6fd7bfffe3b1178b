//! Scripted remote hub.
//!
//! Holds one sequence channel whose items get younger as their sequence
//! grows, which is the ordering the starting-point search relies on.
//! Records every fetch so tests can check where replication resumed.

use chrono::{DateTime, Duration, Utc};
use hub_reconciler::channel::{ChannelConfig, ChannelKind};
use hub_reconciler::lock::LocalLockService;
use hub_reconciler::remote::{ChannelUrl, RemoteChannelSource};
use hub_reconciler::store::BoxFuture;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Revoke a lock path once this many fetches have been served.
struct RevokeAfter {
    lock: LocalLockService,
    path: String,
    fetches: usize,
}

pub struct MockRemoteSource {
    config: Mutex<Option<ChannelConfig>>,
    items: Mutex<BTreeMap<u64, DateTime<Utc>>>,
    fetched: Mutex<Vec<u64>>,
    probes: AtomicUsize,
    revoke: Mutex<Option<RevokeAfter>>,
}

impl MockRemoteSource {
    /// A sequence channel with the given TTL and no items.
    pub fn new(name: &str, ttl_millis: Option<i64>) -> Self {
        let config = ChannelConfig::new(name)
            .with_kind(ChannelKind::Sequence)
            .with_ttl_millis(ttl_millis);
        Self {
            config: Mutex::new(Some(config)),
            items: Mutex::new(BTreeMap::new()),
            fetched: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
            revoke: Mutex::new(None),
        }
    }

    /// A remote that answers 404 for the channel itself.
    pub fn missing() -> Self {
        let remote = Self::new("missing", None);
        *remote.config.lock().unwrap() = None;
        remote
    }

    /// Add `first..=last`, spaced one minute apart, the last created `newest_age` ago.
    pub fn add_items(&self, first: u64, last: u64, newest_age: Duration) {
        let newest = Utc::now() - newest_age;
        let mut items = self.items.lock().unwrap();
        for sequence in first..=last {
            let age = Duration::minutes((last - sequence) as i64);
            items.insert(sequence, newest - age);
        }
    }

    pub fn remove_item(&self, sequence: u64) {
        self.items.lock().unwrap().remove(&sequence);
    }

    /// Revoke `path` on `lock` after `fetches` successful fetches.
    pub fn revoke_after(&self, lock: LocalLockService, path: String, fetches: usize) {
        *self.revoke.lock().unwrap() = Some(RevokeAfter { lock, path, fetches });
    }

    /// Sequences fetched so far, in request order.
    pub fn fetched(&self) -> Vec<u64> {
        self.fetched.lock().unwrap().clone()
    }

    /// Number of creation-date probes.
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn payload(sequence: u64) -> Vec<u8> {
        format!("item-{}", sequence).into_bytes()
    }
}

impl RemoteChannelSource for MockRemoteSource {
    fn get_configuration<'a>(&'a self, _: &'a ChannelUrl) -> BoxFuture<'a, Option<ChannelConfig>> {
        Box::pin(async move { Ok(self.config.lock().unwrap().clone()) })
    }

    fn get_latest_sequence<'a>(&'a self, _: &'a ChannelUrl) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move { Ok(self.items.lock().unwrap().keys().next_back().copied()) })
    }

    fn get_creation_date<'a>(&'a self, _: &'a ChannelUrl, sequence: u64) -> BoxFuture<'a, Option<DateTime<Utc>>> {
        Box::pin(async move {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.items.lock().unwrap().get(&sequence).copied())
        })
    }

    fn fetch<'a>(&'a self, _: &'a ChannelUrl, sequence: u64) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            if !self.items.lock().unwrap().contains_key(&sequence) {
                return Ok(None);
            }
            let served = {
                let mut fetched = self.fetched.lock().unwrap();
                fetched.push(sequence);
                fetched.len()
            };
            if let Some(revoke) = self.revoke.lock().unwrap().as_ref() {
                if served >= revoke.fetches {
                    revoke.lock.revoke(&revoke.path);
                }
            }
            Ok(Some(Self::payload(sequence)))
        })
    }
}
