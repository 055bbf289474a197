//! Error types for the sync engine.

use thiserror::Error;

/// Errors that can occur while synchronizing ledger events.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No sync progress for {address} on chain {chain_id}")]
    NotFound { address: String, chain_id: u64 },

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Invalid block range [{from}, {to}]: {reason}")]
    InvalidRange { from: u64, to: u64, reason: String },

    #[error("Event {tx_hash}:{log_index} could not be applied: {reason}")]
    Application {
        tx_hash: String,
        log_index: u32,
        reason: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Work queue is closed")]
    QueueClosed,
}

impl SyncError {
    /// Returns `true` for transient failures worth retrying at the
    /// unit-of-work level. Configuration, validation, and per-event
    /// application errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Storage(_))
    }
}
