// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciler state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (progress store open,
//!    ↓                              ↓  tasks spawned)
//! Stopped ←── ShuttingDown ←──── Running
//!
//! Starting ──(progress store failed)──→ Failed
//! ```
//!
//! - **Created**: Initial state after `HubReconciler::new()`. Nothing running.
//! - **Starting**: `start()` called, opening the progress store.
//! - **Running**: Scheduler competing for leadership, replicators pulling.
//! - **ShuttingDown**: `shutdown()` called. Draining the repair queue.
//! - **Stopped**: Graceful shutdown complete. Safe to drop.
//! - **Failed**: Start-up error. The reconciler cannot continue.

use crate::queue::RepairStats;

/// State of the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created but not started.
    ///
    /// Call [`start()`](super::HubReconciler::start) to begin.
    Created,

    /// Opening the progress store and spawning tasks.
    Starting,

    /// Verifying and replicating.
    Running,

    /// Shutting down gracefully.
    ///
    /// Background tasks are stopping and queued repairs draining.
    ShuttingDown,

    /// Shut down cleanly.
    Stopped,

    /// Failed to start.
    ///
    /// Check logs for error details.
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "Created",
            EngineState::Starting => "Starting",
            EngineState::Running => "Running",
            EngineState::ShuttingDown => "ShuttingDown",
            EngineState::Stopped => "Stopped",
            EngineState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health snapshot.
///
/// Collected from in-memory state only; no I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and accepting repairs.
    pub ready: bool,
    /// Repairs accepted but not yet finished.
    pub queue_pending: usize,
    pub queue_capacity: usize,
    pub repairs: RepairStats,
    /// Remote channel URLs being replicated.
    pub replicators: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_engine_state_matches_metric_label() {
        for state in [
            EngineState::Created,
            EngineState::Starting,
            EngineState::Running,
            EngineState::ShuttingDown,
            EngineState::Stopped,
            EngineState::Failed,
        ] {
            assert_eq!(state.as_str(), format!("{:?}", state));
        }
    }
}
