//! Storage tier wrapper for fault injection.
//!
//! Delegates to an [`InMemoryContentStore`] unless told to misbehave.
//! Queries and writes can be made to hang forever or fail, and every call
//! is counted so tests can assert on traffic.

use hub_reconciler::model::ContentKey;
use hub_reconciler::store::{BoxFuture, ContentStore, InMemoryContentStore, TimeQuery};
use hub_reconciler::HubError;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A [`ContentStore`] whose failures are switched on and off at runtime.
///
/// # Example
/// ```rust,ignore
/// let long_term = Arc::new(MockContentStore::new("long_term"));
/// long_term.hang_queries(true);
///
/// // Finder now times out on every window...
/// assert_eq!(long_term.query_count(), 1);
/// ```
pub struct MockContentStore {
    inner: InMemoryContentStore,
    hang_queries: AtomicBool,
    fail_queries: AtomicBool,
    hang_writes: AtomicBool,
    fail_writes: AtomicBool,
    queries: AtomicUsize,
    writes: AtomicUsize,
}

impl MockContentStore {
    pub fn new(name: &str) -> Self {
        Self {
            inner: InMemoryContentStore::new(name),
            hang_queries: AtomicBool::new(false),
            fail_queries: AtomicBool::new(false),
            hang_writes: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn hang_queries(&self, hang: bool) {
        self.hang_queries.store(hang, Ordering::SeqCst);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Writes started while set never complete.
    pub fn hang_writes(&self, hang: bool) {
        self.hang_writes.store(hang, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Write attempts, including failed and hung ones.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn contains(&self, channel: &str, key: &ContentKey) -> bool {
        self.inner.contains(channel, key).await
    }

    pub async fn len(&self, channel: &str) -> usize {
        self.inner.len(channel).await
    }
}

impl ContentStore for MockContentStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn query_by_time(&self, query: TimeQuery) -> BoxFuture<'_, BTreeSet<ContentKey>> {
        Box::pin(async move {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.hang_queries.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            if self.fail_queries.load(Ordering::SeqCst) {
                return Err(HubError::store("query_by_time", "injected failure"));
            }
            self.inner.query_by_time(query).await
        })
    }

    fn read(&self, channel: &str, key: &ContentKey) -> BoxFuture<'_, Option<Vec<u8>>> {
        self.inner.read(channel, key)
    }

    fn write(&self, channel: &str, key: &ContentKey, bytes: Vec<u8>) -> BoxFuture<'_, ContentKey> {
        let channel = channel.to_string();
        let key = key.clone();
        Box::pin(async move {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.hang_writes.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(HubError::store("write", "injected failure"));
            }
            self.inner.write(&channel, &key, bytes).await
        })
    }
}
