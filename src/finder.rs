//! Set difference between the write-cache and long-term tiers.
//!
//! Both tiers are queried for the same half-open window at the same time.
//! Each query task returns its own key set; the difference is taken only
//! once both have finished. If either query overruns the deadline or fails,
//! the result is *indeterminate* and the finder reports nothing missing:
//! a partial long-term read would otherwise make every write-cache key look
//! missing.
//!
//! The deadline widens with the window: `base_timeout` plus
//! `timeout_per_day` for every started day the window spans.

use crate::config::VerifierConfig;
use crate::error::{HubError, Result};
use crate::metrics;
use crate::model::{ContentKey, MinutePath};
use crate::resilience::{join_all_within, Bulkhead, JoinOutcome};
use crate::store::{ContentStore, TimeQuery};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

const MINUTES_PER_DAY: i64 = 24 * 60;

pub struct MissingContentFinder {
    write_cache: Arc<dyn ContentStore>,
    long_term: Arc<dyn ContentStore>,
    query_pool: Bulkhead,
    base_timeout: Duration,
    timeout_per_day: Duration,
}

impl MissingContentFinder {
    pub fn new(
        write_cache: Arc<dyn ContentStore>,
        long_term: Arc<dyn ContentStore>,
        config: &VerifierConfig,
    ) -> Self {
        Self {
            write_cache,
            long_term,
            query_pool: Bulkhead::new(config.query_threads),
            base_timeout: config.base_timeout_duration(),
            timeout_per_day: config.timeout_per_day_duration(),
        }
    }

    /// Deadline for the paired queries over `[start, end)`.
    pub fn timeout_for(&self, start: MinutePath, end: MinutePath) -> Duration {
        let minutes = (end.ordinal() - start.ordinal()).max(0);
        let days = (minutes + MINUTES_PER_DAY - 1) / MINUTES_PER_DAY;
        self.base_timeout + self.timeout_per_day * days as u32
    }

    /// Keys in the write-cache but not in long-term storage, within `[start, end)`.
    ///
    /// Returns an empty set when the comparison is indeterminate.
    #[instrument(skip(self), fields(channel = %channel, start = %start, end = %end))]
    pub async fn find_missing(&self, start: MinutePath, end: MinutePath, channel: &str) -> BTreeSet<ContentKey> {
        if start >= end {
            debug!("Empty window, nothing to compare");
            return BTreeSet::new();
        }

        let query = TimeQuery::between(channel, start.time(), end.time());
        let tasks = vec![
            self.spawn_query(Arc::clone(&self.write_cache), query.clone()),
            self.spawn_query(Arc::clone(&self.long_term), query),
        ];

        let timeout = self.timeout_for(start, end);
        match join_all_within(tasks, timeout).await {
            JoinOutcome::Complete(results) => {
                let mut results = results.into_iter();
                match (results.next(), results.next()) {
                    (Some(Ok(cache_keys)), Some(Ok(long_term_keys))) => {
                        let missing: BTreeSet<ContentKey> =
                            cache_keys.difference(&long_term_keys).cloned().collect();
                        debug!(
                            write_cache = cache_keys.len(),
                            long_term = long_term_keys.len(),
                            missing = missing.len(),
                            "Compared tiers"
                        );
                        missing
                    }
                    (Some(Err(e)), _) | (_, Some(Err(e))) => {
                        warn!(error = %e, "Tier query failed, treating window as indeterminate");
                        BTreeSet::new()
                    }
                    _ => BTreeSet::new(),
                }
            }
            JoinOutcome::TimedOut { completed, expected } => {
                metrics::record_verifier_timeout();
                error!(completed, expected, timeout = ?timeout, "Tier queries timed out");
                BTreeSet::new()
            }
            JoinOutcome::Failed(e) => {
                error!(error = %e, "Tier query task failed");
                BTreeSet::new()
            }
        }
    }

    fn spawn_query(
        &self,
        store: Arc<dyn ContentStore>,
        query: TimeQuery,
    ) -> tokio::task::JoinHandle<Result<BTreeSet<ContentKey>>> {
        let pool = self.query_pool.clone();
        tokio::spawn(async move {
            let _permit = pool
                .acquire()
                .await
                .map_err(|e| HubError::Internal(e.to_string()))?;
            store.query_by_time(query).await
        })
    }
}
