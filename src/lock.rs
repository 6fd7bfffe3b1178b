//! Cluster coordination capability.
//!
//! The reconciler never speaks a coordination protocol itself. It is handed
//! a [`DistributedLock`] and asks two questions of it:
//!
//! 1. *May I act?* [`DistributedLock::try_acquire()`] waits up to a bound for
//!    exclusive ownership of a path and returns a [`LockLease`].
//! 2. *May I keep acting?* [`LockLease::is_held()`] is polled once per loop
//!    iteration by the scheduler and the replicator.
//!
//! Leadership is just a lock on a well-known path ([`VERIFIER_LEADER_PATH`]).
//! Dropping the lease releases it.
//!
//! [`LocalLockService`] implements the capability in-process, for tests and
//! single-node deployments. It also supports [`revoke()`](LocalLockService::revoke)
//! to simulate a lost session.

use crate::error::Result;
use crate::store::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

/// Path the verifier scheduler elects a leader on.
pub const VERIFIER_LEADER_PATH: &str = "/VerifierLeader";

/// Lock path guarding replication of one channel.
pub fn replicator_lock_path(channel: &str) -> String {
    format!("/ChannelReplicator/{}", channel)
}

/// Exclusive ownership of a lock path.
///
/// The lease is released when dropped.
pub struct LockLease {
    path: String,
    held: Arc<AtomicBool>,
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl LockLease {
    /// Create a lease. `held` is cleared by the lock service if ownership is
    /// lost; `on_release` runs once when the lease is dropped.
    pub fn new(
        path: impl Into<String>,
        held: Arc<AtomicBool>,
        on_release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            path: path.into(),
            held,
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Liveness check; `false` once ownership has been lost.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease")
            .field("path", &self.path)
            .field("held", &self.is_held())
            .finish()
    }
}

/// Cluster-wide mutual exclusion.
pub trait DistributedLock: Send + Sync + 'static {
    /// Wait up to `wait` for ownership of `path`.
    ///
    /// Returns `None` if another owner still holds it when the wait expires.
    fn try_acquire(&self, path: &str, wait: Duration) -> BoxFuture<'_, Option<LockLease>>;
}

/// Run `task` while holding `path`.
///
/// The task receives the lease so it can poll [`LockLease::is_held()`];
/// the lock is released when the task drops it. Returns `None` without
/// running the task if the lock could not be acquired within `wait`.
pub async fn run_with_lock<L, F, Fut, T>(lock: &L, path: &str, wait: Duration, task: F) -> Result<Option<T>>
where
    L: DistributedLock + ?Sized,
    F: FnOnce(LockLease) -> Fut,
    Fut: Future<Output = T>,
{
    match lock.try_acquire(path, wait).await? {
        Some(lease) => {
            debug!(path = %path, "Lock acquired");
            Ok(Some(task(lease).await))
        }
        None => {
            debug!(path = %path, "Lock busy");
            Ok(None)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-process implementation
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct LocalLockInner {
    held: Mutex<HashMap<String, Arc<AtomicBool>>>,
    released: Notify,
}

impl LocalLockInner {
    fn holders(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process [`DistributedLock`].
#[derive(Clone, Default)]
pub struct LocalLockService {
    inner: Arc<LocalLockInner>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anyone currently owns `path`.
    pub fn is_locked(&self, path: &str) -> bool {
        self.inner.holders().contains_key(path)
    }

    /// Forcibly take `path` away from its owner, as a coordination
    /// service would on session expiry.
    pub fn revoke(&self, path: &str) -> bool {
        let removed = self.inner.holders().remove(path);
        match removed {
            Some(flag) => {
                flag.store(false, Ordering::Release);
                self.inner.released.notify_waiters();
                info!(path = %path, "Lock revoked");
                true
            }
            None => false,
        }
    }

    fn try_take(&self, path: &str) -> Option<LockLease> {
        let mut holders = self.inner.holders();
        if holders.contains_key(path) {
            return None;
        }
        let flag = Arc::new(AtomicBool::new(true));
        holders.insert(path.to_string(), Arc::clone(&flag));
        drop(holders);

        let inner = Arc::clone(&self.inner);
        let release_flag = Arc::clone(&flag);
        let release_path = path.to_string();
        Some(LockLease::new(path, flag, move || {
            release_flag.store(false, Ordering::Release);
            let mut holders = inner.holders();
            if holders
                .get(&release_path)
                .is_some_and(|current| Arc::ptr_eq(current, &release_flag))
            {
                holders.remove(&release_path);
            }
            drop(holders);
            inner.released.notify_waiters();
        }))
    }
}

impl DistributedLock for LocalLockService {
    fn try_acquire(&self, path: &str, wait: Duration) -> BoxFuture<'_, Option<LockLease>> {
        let path = path.to_string();
        Box::pin(async move {
            let deadline = Instant::now() + wait;
            loop {
                // Register for wakeups before checking, so a release between
                // the check and the wait is not missed.
                let notified = self.inner.released.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(lease) = self.try_take(&path) {
                    return Ok(Some(lease));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                let _ = tokio::time::timeout_at(deadline, notified).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicator_lock_path() {
        assert_eq!(replicator_lock_path("weather"), "/ChannelReplicator/weather");
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = LocalLockService::new();
        let lease = locks.try_acquire("/a", Duration::ZERO).await.unwrap().unwrap();
        assert!(lease.is_held());
        assert_eq!(lease.path(), "/a");
        assert!(locks.is_locked("/a"));
        drop(lease);
        assert!(!locks.is_locked("/a"));
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let locks = LocalLockService::new();
        let _lease = locks.try_acquire("/a", Duration::ZERO).await.unwrap().unwrap();
        let second = locks.try_acquire("/a", Duration::from_millis(20)).await.unwrap();
        assert!(second.is_none());
        // Other paths are independent.
        assert!(locks.try_acquire("/b", Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_on_release() {
        let locks = LocalLockService::new();
        let lease = locks.try_acquire("/a", Duration::ZERO).await.unwrap().unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.try_acquire("/a", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_some_and(|l| l.is_held()));
    }

    #[tokio::test]
    async fn test_revoke_clears_holder() {
        let locks = LocalLockService::new();
        let lease = locks.try_acquire("/a", Duration::ZERO).await.unwrap().unwrap();
        assert!(locks.revoke("/a"));
        assert!(!lease.is_held());

        // A new owner can take it while the old lease is still alive...
        let fresh = locks.try_acquire("/a", Duration::ZERO).await.unwrap().unwrap();
        // ...and dropping the stale lease must not release the new owner.
        drop(lease);
        assert!(fresh.is_held());
        assert!(locks.is_locked("/a"));
        assert!(!locks.revoke("/missing"));
    }

    #[tokio::test]
    async fn test_run_with_lock() {
        let locks = LocalLockService::new();
        let result = run_with_lock(&locks, "/a", Duration::ZERO, |lease| async move {
            assert!(lease.is_held());
            7
        })
        .await
        .unwrap();
        assert_eq!(result, Some(7));
        assert!(!locks.is_locked("/a"));

        let _held = locks.try_acquire("/a", Duration::ZERO).await.unwrap().unwrap();
        let skipped = run_with_lock(&locks, "/a", Duration::ZERO, |_lease| async { 1 })
            .await
            .unwrap();
        assert_eq!(skipped, None);
    }
}
