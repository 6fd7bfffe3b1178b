//! Metrics for observability.
//!
//! Emits through the `metrics` facade; installing an exporter is the
//! embedding process's job. Covered:
//! - Missing items found by the verifier, and failed or timed-out cycles
//! - Repair queue depth and outcomes
//! - Replicator state and throughput
//! - Circuit breaker calls
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `hub_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations in seconds
//!
//! # Usage
//!
//! ```rust,no_run
//! use hub_reconciler::metrics;
//!
//! // In the verifier, once per key found only in the write-cache
//! metrics::record_missing("flights");
//!
//! // In the finder when the paired queries overrun
//! metrics::record_verifier_timeout();
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Verifier Metrics
// =============================================================================

/// One key present in the write-cache but absent from long-term.
pub fn record_missing(channel: &str) {
    counter!("hub_verifier_missing_total", "channel" => channel.to_string()).increment(1);
}

/// A verification cycle aborted because a repair could not be enqueued.
pub fn record_verifier_failed(channel: &str) {
    counter!("hub_verifier_failed_total", "channel" => channel.to_string()).increment(1);
}

/// The paired tier queries did not finish in time.
pub fn record_verifier_timeout() {
    counter!("hub_verifier_timeout_total").increment(1);
}

/// Duration of one channel's verification cycle.
pub fn record_verifier_cycle(channel: &str, duration: Duration) {
    histogram!("hub_verifier_cycle_seconds", "channel" => channel.to_string())
        .record(duration.as_secs_f64());
}

/// Duration of one full fan-out pass over all channels.
pub fn record_verifier_pass(channels: usize, duration: Duration) {
    histogram!("hub_verifier_pass_seconds").record(duration.as_secs_f64());
    gauge!("hub_verifier_pass_channels").set(channels as f64);
}

/// Whether this node currently holds verifier leadership (1) or not (0).
pub fn set_verifier_leader(leader: bool) {
    gauge!("hub_verifier_leader").set(if leader { 1.0 } else { 0.0 });
}

// =============================================================================
// Repair Queue Metrics
// =============================================================================

pub fn set_queue_depth(depth: usize) {
    gauge!("hub_repair_queue_depth").set(depth as f64);
}

pub fn record_repair_enqueued() {
    counter!("hub_repair_enqueued_total").increment(1);
}

/// `add` refused an item (full or closed).
pub fn record_repair_rejected(reason: &str) {
    counter!("hub_repair_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Outcome of one repair: "written", "absent" (gone from the write-cache),
/// "failed", or "rejected" (circuit open).
pub fn record_repair_written(channel: &str, status: &str) {
    counter!(
        "hub_repair_written_total",
        "channel" => channel.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// =============================================================================
// Replicator Metrics
// =============================================================================

pub fn record_replicator_inserted(channel: &str) {
    counter!("hub_replicator_inserted_total", "channel" => channel.to_string()).increment(1);
}

/// Gauge for replicator state (0=idle, 1=initializing, 2=replicating, 3=stopped).
pub fn set_replicator_state(channel: &str, state: &str) {
    let value = match state {
        "Idle" => 0.0,
        "Initializing" => 1.0,
        "Replicating" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("hub_replicator_state", "channel" => channel.to_string()).set(value);
}

/// The sequence a replicator resumed from.
pub fn set_replicator_start_sequence(channel: &str, sequence: u64) {
    gauge!("hub_replicator_start_sequence", "channel" => channel.to_string()).set(sequence as f64);
}

// =============================================================================
// Engine / Infrastructure Metrics
// =============================================================================

/// Gauge for reconciler lifecycle state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("hub_engine_state").set(value);
}

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "hub_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Progress store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn progress_retries_total(operation: &str) {
    counter!("hub_progress_retries_total", "operation" => operation.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state and no recorder is installed in
    // unit tests; these only check the calls are well-formed.

    #[test]
    fn test_verifier_metrics() {
        record_missing("flights");
        record_missing("");
        record_verifier_failed("flights");
        record_verifier_timeout();
        record_verifier_cycle("flights", Duration::from_millis(20));
        record_verifier_pass(12, Duration::from_secs(3));
        set_verifier_leader(true);
        set_verifier_leader(false);
    }

    #[test]
    fn test_queue_metrics() {
        set_queue_depth(0);
        set_queue_depth(2000);
        record_repair_enqueued();
        record_repair_rejected("full");
        record_repair_rejected("closed");
        record_repair_written("flights", "written");
        record_repair_written("flights", "absent");
    }

    #[test]
    fn test_replicator_metrics() {
        record_replicator_inserted("weather");
        for state in ["Idle", "Initializing", "Replicating", "Stopped", "Unknown"] {
            set_replicator_state("weather", state);
        }
        set_replicator_start_sequence("weather", 1000);
    }

    #[test]
    fn test_engine_metrics() {
        for state in ["Created", "Starting", "Running", "ShuttingDown", "Stopped", "Failed", "?"] {
            set_engine_state(state);
        }
        record_circuit_call("long_term_writes", "success");
        progress_retries_total("progress_update");
    }
}
