//! Shared types for the sync engine.

use serde::{Deserialize, Serialize};

// ─── LedgerEvent ─────────────────────────────────────────────────────────────

/// A decoded event log as returned by the ledger client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Transaction hash (`0x…`).
    pub tx_hash: String,
    /// Log index within the transaction's block.
    pub log_index: u32,
    /// Block the event was emitted in.
    pub block_number: u64,
    /// Hash of that block (`0x…`).
    pub block_hash: String,
    /// Contract address that emitted the event.
    pub entity_address: String,
    /// Event kind name (e.g. `"Transfer"`).
    pub kind: String,
    /// Decoded event arguments.
    pub args: serde_json::Value,
}

impl LedgerEvent {
    /// The identity under which this event is deduplicated.
    pub fn dedup_key(&self) -> (&str, u32) {
        (&self.tx_hash, self.log_index)
    }
}

// ─── StoredEvent ─────────────────────────────────────────────────────────────

/// An event materialized into storage.
///
/// Row identity is `(tx_hash, log_index)` — existence of a row under that
/// key is the idempotency witness for at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub tx_hash: String,
    pub log_index: u32,
    pub block_number: u64,
    pub block_hash: String,
    pub entity_address: String,
    pub chain_id: u64,
    pub kind: String,
    pub args: serde_json::Value,
    /// Unix timestamp of when the row was written.
    pub recorded_at: i64,
}

impl StoredEvent {
    /// Build a storage row from a fetched ledger event.
    pub fn from_ledger(event: &LedgerEvent, chain_id: u64) -> Self {
        Self {
            tx_hash: event.tx_hash.clone(),
            log_index: event.log_index,
            block_number: event.block_number,
            block_hash: event.block_hash.clone(),
            entity_address: event.entity_address.clone(),
            chain_id,
            kind: event.kind.clone(),
            args: event.args.clone(),
            recorded_at: chrono::Utc::now().timestamp(),
        }
    }
}

// ─── FailedEvent ─────────────────────────────────────────────────────────────

/// An event that could not be applied, kept as an operator-visible audit
/// trail. Rows are never deleted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEvent {
    pub entity_address: String,
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u32,
    /// The raw event payload, kept verbatim for later replay.
    pub payload: serde_json::Value,
    /// Human-readable cause.
    pub error: String,
    pub retry_count: u32,
    pub last_retry_at: Option<i64>,
    pub created_at: i64,
}

// ─── SyncProgress ────────────────────────────────────────────────────────────

/// Durable cursor row for one tracked entity on one chain.
///
/// Keyed by `(entity_address, chain_id)`. `is_syncing` is the single
/// authoritative flag for whether a sync run is active; runs re-read it
/// and exit when they observe `false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub entity_address: String,
    pub chain_id: u64,
    /// Highest block whose events are guaranteed fully applied. A fresh row
    /// sits at `sync_start_block - 1`, which is why this is signed (an
    /// entity may start at block 0). Monotonically non-decreasing.
    pub last_processed_block: i64,
    /// Where indexing began. Immutable after creation.
    pub sync_start_block: u64,
    pub is_syncing: bool,
    /// Incremented once per successfully applied event.
    pub total_events_processed: u64,
    /// Unix timestamp of last mutation.
    pub updated_at: i64,
}

impl SyncProgress {
    /// Fresh row positioned one block before the start.
    pub fn new(entity_address: impl Into<String>, chain_id: u64, sync_start_block: u64) -> Self {
        Self {
            entity_address: entity_address.into(),
            chain_id,
            last_processed_block: sync_start_block as i64 - 1,
            sync_start_block,
            is_syncing: true,
            total_events_processed: 0,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// The next block that still needs processing.
    pub fn next_block(&self) -> u64 {
        (self.last_processed_block + 1).max(0) as u64
    }

    /// Blocks between the chain head and this cursor (0 when caught up).
    pub fn lag(&self, height: u64) -> u64 {
        (height as i64 - self.last_processed_block).max(0) as u64
    }

    /// Caught up once the cursor reaches `height - 1`.
    pub fn is_caught_up(&self, height: u64) -> bool {
        self.last_processed_block >= height as i64 - 1
    }
}

/// Returns `true` if `address` looks like a well-formed EVM address
/// (`0x` followed by 40 hex digits).
pub fn is_valid_address(address: &str) -> bool {
    let Some(hex) = address.strip_prefix("0x") else {
        return false;
    };
    hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_progress_sits_before_start() {
        let p = SyncProgress::new("0xabc", 1, 1000);
        assert_eq!(p.last_processed_block, 999);
        assert_eq!(p.next_block(), 1000);
        assert!(p.is_syncing);
        assert_eq!(p.total_events_processed, 0);
    }

    #[test]
    fn fresh_progress_from_genesis() {
        let p = SyncProgress::new("0xabc", 1, 0);
        assert_eq!(p.last_processed_block, -1);
        assert_eq!(p.next_block(), 0);
    }

    #[test]
    fn caught_up_boundary() {
        let mut p = SyncProgress::new("0xabc", 1, 1000);
        p.last_processed_block = 1048;
        assert!(!p.is_caught_up(1050));
        p.last_processed_block = 1049;
        assert!(p.is_caught_up(1050));
        assert!(p.is_caught_up(1049));
    }

    #[test]
    fn lag_clamps_at_zero() {
        let mut p = SyncProgress::new("0xabc", 1, 100);
        p.last_processed_block = 200;
        assert_eq!(p.lag(150), 0);
        assert_eq!(p.lag(250), 50);
    }

    #[test]
    fn address_validation() {
        assert!(is_valid_address("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"));
        assert!(is_valid_address("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"));
        assert!(!is_valid_address("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"));
        assert!(!is_valid_address("0x123"));
        assert!(!is_valid_address("0xZZb86991c6218b36c1d19D4a2e9Eb0cE3606eB48"));
        assert!(!is_valid_address(""));
    }
}
