//! Per-channel verification cycle.
//!
//! One cycle for one channel:
//!
//! 1. Compute the window `[start, end)` ([`ChannelVerifier::range_for()`])
//! 2. Diff the two tiers over that window ([`MissingContentFinder`])
//! 3. Enqueue a repair for every missing key
//! 4. Advance the `LastSingleVerified` marker to `end`
//!
//! The steps run strictly in order. If the queue refuses a key the cycle
//! stops at step 3 and the marker stays put, so the same window is checked
//! again next cycle.
//!
//! # Window
//!
//! ```text
//!   end      = minute(lastUpdated) - 1        (skip the bucket still filling)
//!   start    = marker, or end - offset        (first run)
//!   start    = max(start, now - (ttl - 2))    (live channels only)
//! ```
//!
//! The last clamp keeps the verifier from scanning minutes that have
//! already aged out of the write-cache, which would look like (and be
//! counted as) missing data.

use crate::channel::{ChannelConfig, ChannelService};
use crate::config::{VerifierConfig, WriteCacheConfig};
use crate::error::Result;
use crate::finder::MissingContentFinder;
use crate::metrics;
use crate::model::{ChannelContentKey, MinutePath, VerificationRange};
use crate::progress::{ProgressStore, ProgressValue, LAST_SINGLE_VERIFIED};
use crate::queue::ReconciliationQueue;
use crate::scheduler::VerifyDispatch;
use crate::store::BoxFuture;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, trace};

/// Result of one verification cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every missing key was queued; the marker is at the window end.
    Verified { missing: usize },
    /// The queue refused a key after `enqueued` were accepted.
    Aborted { missing: usize, enqueued: usize },
    /// Unknown channel, or one that does not use single-item storage.
    Skipped,
}

pub struct ChannelVerifier {
    channels: Arc<dyn ChannelService>,
    progress: Arc<dyn ProgressStore>,
    finder: MissingContentFinder,
    queue: Arc<ReconciliationQueue>,
    offset_minutes: i64,
    floor_minutes: i64,
}

impl ChannelVerifier {
    pub fn new(
        config: &VerifierConfig,
        write_cache: &WriteCacheConfig,
        channels: Arc<dyn ChannelService>,
        progress: Arc<dyn ProgressStore>,
        finder: MissingContentFinder,
        queue: Arc<ReconciliationQueue>,
    ) -> Self {
        Self {
            channels,
            progress,
            finder,
            queue,
            offset_minutes: config.offset_minutes,
            floor_minutes: write_cache.floor_minutes(),
        }
    }

    /// Window to check for `channel` as of `now`.
    ///
    /// A channel with no recorded write is treated as last updated at `now`.
    pub async fn range_for(&self, channel: &ChannelConfig, now: DateTime<Utc>) -> Result<VerificationRange> {
        let last_updated = self.channels.last_updated(&channel.name).await?.unwrap_or(now);
        let end = MinutePath::new(last_updated).minus_minutes(1);
        let default_start = end.minus_minutes(self.offset_minutes);

        let marker = self
            .progress
            .get(&channel.name, LAST_SINGLE_VERIFIED, ProgressValue::Minute(default_start))
            .await?;
        let mut start = marker.as_minute().unwrap_or(default_start);

        if channel.is_live() {
            let floor = MinutePath::new(now).minus_minutes(self.floor_minutes);
            start = start.max(floor);
        }

        Ok(VerificationRange {
            channel: channel.name.clone(),
            start: start.min(end),
            end,
        })
    }

    /// Diff, enqueue and advance the marker for one window.
    #[instrument(skip(self), fields(channel = %range.channel, start = %range.start, end = %range.end))]
    pub async fn verify_range(&self, range: &VerificationRange) -> Result<CycleOutcome> {
        let missing = self
            .finder
            .find_missing(range.start, range.end, &range.channel)
            .await;
        let total = missing.len();

        for (enqueued, key) in missing.into_iter().enumerate() {
            metrics::record_missing(&range.channel);
            trace!(key = %key, "Missing from long-term");
            if !self.queue.add(ChannelContentKey::new(&range.channel, key)) {
                metrics::record_verifier_failed(&range.channel);
                error!(enqueued, missing = total, "Repair queue refused item, leaving marker");
                return Ok(CycleOutcome::Aborted { missing: total, enqueued });
            }
        }

        let advanced = self
            .progress
            .update_increase(ProgressValue::Minute(range.end), &range.channel, LAST_SINGLE_VERIFIED)
            .await?;

        if total > 0 {
            info!(missing = total, "Queued repairs");
        }
        debug!(advanced, "Window verified");
        Ok(CycleOutcome::Verified { missing: total })
    }

    /// Run one cycle for the named channel.
    pub async fn verify(&self, name: &str) -> Result<CycleOutcome> {
        self.verify_at(name, Utc::now()).await
    }

    /// [`verify()`](Self::verify) with an explicit clock.
    pub async fn verify_at(&self, name: &str, now: DateTime<Utc>) -> Result<CycleOutcome> {
        let Some(channel) = self.channels.get_channel(name).await? else {
            debug!(channel = %name, "Unknown channel, nothing to verify");
            return Ok(CycleOutcome::Skipped);
        };
        if !channel.is_verifiable() {
            debug!(channel = %name, storage = ?channel.storage, "Channel not in single storage");
            return Ok(CycleOutcome::Skipped);
        }

        let started = Instant::now();
        let range = self.range_for(&channel, now).await?;
        let outcome = self.verify_range(&range).await?;
        metrics::record_verifier_cycle(name, started.elapsed());
        Ok(outcome)
    }

    /// Names of every channel the verifier should check.
    pub async fn verifiable_channels(&self) -> Result<Vec<String>> {
        Ok(self
            .channels
            .list_channels()
            .await?
            .into_iter()
            .filter(ChannelConfig::is_verifiable)
            .map(|channel| channel.name)
            .collect())
    }
}

impl VerifyDispatch for ChannelVerifier {
    fn channels(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(self.verifiable_channels())
    }

    fn verify<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, CycleOutcome> {
        Box::pin(ChannelVerifier::verify(self, channel))
    }
}
