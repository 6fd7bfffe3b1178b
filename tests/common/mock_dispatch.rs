//! Verify dispatcher that records calls instead of touching storage.

use hub_reconciler::store::BoxFuture;
use hub_reconciler::{CycleOutcome, HubError, VerifyDispatch};
use std::collections::HashMap;
use std::sync::Mutex;

/// A [`VerifyDispatch`] over a fixed channel list.
///
/// Channels named in `panicking` panic mid-cycle and those in `failing`
/// return an error; everything else verifies cleanly.
#[derive(Default)]
pub struct CountingDispatch {
    channels: Vec<String>,
    panicking: Vec<String>,
    failing: Vec<String>,
    calls: Mutex<HashMap<String, usize>>,
}

impl CountingDispatch {
    pub fn new(channels: &[&str]) -> Self {
        Self {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn panicking(mut self, channel: &str) -> Self {
        self.panicking.push(channel.to_string());
        self
    }

    pub fn failing(mut self, channel: &str) -> Self {
        self.failing.push(channel.to_string());
        self
    }

    pub fn calls(&self, channel: &str) -> usize {
        self.calls.lock().unwrap().get(channel).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

impl VerifyDispatch for CountingDispatch {
    fn channels(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.channels.clone()) })
    }

    fn verify<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, CycleOutcome> {
        Box::pin(async move {
            *self.calls.lock().unwrap().entry(channel.to_string()).or_insert(0) += 1;
            if self.panicking.iter().any(|c| c == channel) {
                panic!("verifier for {} blew up", channel);
            }
            if self.failing.iter().any(|c| c == channel) {
                return Err(HubError::store("query_by_time", "injected failure"));
            }
            Ok(CycleOutcome::Verified { missing: 0 })
        })
    }
}
