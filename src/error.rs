//! Error types for Recurrer
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in the scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Cadence fields are inconsistent with the frequency type, or the next
    /// occurrence cannot be represented
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Rule not found in storage
    #[error("Rule not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed: the rule changed since it was read
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Storage/ledger backend failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A session action was requested while nothing is being presented
    #[error("No active session")]
    NoActiveSession,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Returns true for failures worth retrying later (backend hiccups),
    /// false for failures that will recur until the data changes.
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Persistence(_) | SchedulerError::Io(_))
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(err: rusqlite::Error) -> Self {
        SchedulerError::Persistence(err.to_string())
    }
}

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;
