// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the reconciler.
//!
//! Errors are categorized by the collaborator that produced them (content
//! store, remote hub, progress database, lock service) and carry enough
//! context to find the failing call in the logs.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Yes | Write-cache or long-term tier I/O failure |
//! | `Remote` | Yes | Remote hub unreachable, bad status, timeout |
//! | `Lock` | Yes | Coordination service unavailable |
//! | `Progress` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `QueueClosed` | No | Repair queue no longer accepts work |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `UnsupportedChannel` | No | Remote channel is not sequence-ordered |
//! | `Shutdown` | No | Reconciler is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Isolation
//!
//! Nothing here is user-facing. Per-item and per-channel failures are logged
//! where they happen and converted into "no progress this cycle"; they never
//! escape a fan-out pass or a worker loop.

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, HubError>;

/// Errors that can occur while verifying or replicating channels.
#[derive(Error, Debug)]
pub enum HubError {
    /// Content store query, read or write failed.
    ///
    /// Transient by assumption; the next cycle retries the same window.
    #[error("Store error ({operation}): {message}")]
    Store { operation: String, message: String },

    /// Remote hub request failed.
    #[error("Remote error ({url}): {message}")]
    Remote {
        url: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// SQLite error during progress marker persistence.
    #[error("Progress store error: {0}")]
    Progress(#[from] sqlx::Error),

    /// Lock or leadership service failure.
    #[error("Lock error: {0}")]
    Lock(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The repair queue has been closed.
    #[error("Repair queue closed")]
    QueueClosed,

    /// Lifecycle state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on a running reconciler).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Remote channel cannot be replicated.
    #[error("Unsupported channel: {0}")]
    UnsupportedChannel(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Create a store error.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a remote error from a reqwest::Error
    pub fn remote(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Remote {
            url: url.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a remote error without source
    pub fn remote_msg(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            url: url.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { .. } => true,
            Self::Remote { .. } => true,
            Self::Lock(_) => true,
            Self::Progress(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::QueueClosed => false,
            Self::InvalidState { .. } => false,
            Self::UnsupportedChannel(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
