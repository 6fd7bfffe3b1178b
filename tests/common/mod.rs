//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A storage tier wrapper that can hang, fail, and count calls
//! - A scripted remote hub with monotonic expiry
//! - A verify dispatcher that records which channels it was asked for

pub mod mock_dispatch;
pub mod mock_remote;
pub mod mock_store;

pub use mock_dispatch::*;
pub use mock_remote::*;
pub use mock_store::*;

use chrono::{DateTime, Duration, Utc};
use hub_reconciler::model::ContentKey;
use hub_reconciler::ContentStore;

/// Write one item per entry of `ages` (minutes before `now`) and return the keys.
pub async fn seed_minutes_ago(
    store: &dyn ContentStore,
    channel: &str,
    now: DateTime<Utc>,
    ages: &[i64],
) -> Vec<ContentKey> {
    let mut keys = Vec::with_capacity(ages.len());
    for (i, age) in ages.iter().enumerate() {
        let time = now - Duration::minutes(*age) + Duration::seconds(i as i64 % 50);
        let payload = format!("{}-{}", channel, i).into_bytes();
        let key = ContentKey::for_content(time, &payload);
        store.write(channel, &key, payload).await.unwrap();
        keys.push(key);
    }
    keys
}

/// Poll `check` every 10ms until it returns `true` or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: std::time::Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
