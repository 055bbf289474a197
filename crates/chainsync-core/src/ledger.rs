//! Read-only seam to the ledger.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::types::LedgerEvent;

/// A read-only ledger client. Stateless per call and shared across all
/// workers, so implementations must be `Send + Sync`.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Latest block height of the chain.
    async fn current_height(&self) -> Result<u64, SyncError>;

    /// Events of the given kinds emitted by `address` within
    /// `[from_block, to_block]` (inclusive), ordered by
    /// `(block_number, log_index)` ascending. An empty `kinds` slice means
    /// all kinds the implementation knows how to decode.
    async fn events(
        &self,
        address: &str,
        kinds: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LedgerEvent>, SyncError>;

    /// `true` if `address` resolves to a live contract on this ledger.
    async fn validate_entity(&self, address: &str) -> Result<bool, SyncError>;
}
