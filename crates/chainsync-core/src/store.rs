//! Storage seams — sync progress, materialized events, and failed events.
//!
//! The engine talks to storage through three narrow traits so backends can
//! be swapped (in-memory for tests, SQLite in production). A single backend
//! type usually implements all three.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::types::{FailedEvent, StoredEvent, SyncProgress};

/// Persistence for per-entity sync cursors.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Load the progress row for an entity (`None` if it was never started).
    async fn load(&self, address: &str, chain_id: u64)
        -> Result<Option<SyncProgress>, SyncError>;

    /// Save (upsert) a progress row.
    async fn save(&self, progress: SyncProgress) -> Result<(), SyncError>;

    /// Flip the `is_syncing` flag. Returns `false` if no row exists.
    async fn set_syncing(
        &self,
        address: &str,
        chain_id: u64,
        syncing: bool,
    ) -> Result<bool, SyncError>;

    /// Advance the cursor after a completed sub-range. The cursor only ever
    /// moves forward, and `total_events_processed` grows by `newly_applied`.
    async fn record_batch(
        &self,
        address: &str,
        chain_id: u64,
        last_block: i64,
        newly_applied: u64,
    ) -> Result<(), SyncError>;

    /// All progress rows.
    async fn list(&self) -> Result<Vec<SyncProgress>, SyncError>;

    /// Force `is_syncing = false` on every row where it is set — the repair
    /// for flags left stuck by an unclean shutdown. Returns how many rows
    /// were reset.
    async fn clear_stale_syncing(&self) -> Result<u64, SyncError>;
}

/// Persistence for materialized events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// `true` if an event with this `(tx_hash, log_index)` is already stored.
    async fn contains(&self, tx_hash: &str, log_index: u32) -> Result<bool, SyncError>;

    /// Insert if absent. Returns `false` when a row with the same
    /// `(tx_hash, log_index)` already existed.
    async fn insert(&self, event: StoredEvent) -> Result<bool, SyncError>;

    /// Total number of stored events.
    async fn count(&self) -> Result<u64, SyncError>;

    /// Events for one entity, ordered by `(block_number, log_index)`.
    async fn events_for_entity(
        &self,
        address: &str,
        chain_id: u64,
    ) -> Result<Vec<StoredEvent>, SyncError>;
}

/// Append-only sink for events that failed to apply.
#[async_trait]
pub trait FailureSink: Send + Sync {
    /// Record a failed event.
    async fn record(&self, failure: FailedEvent) -> Result<(), SyncError>;

    /// Total number of failure rows.
    async fn count(&self) -> Result<u64, SyncError>;

    /// Failure rows for one entity.
    async fn list_for_entity(
        &self,
        address: &str,
        chain_id: u64,
    ) -> Result<Vec<FailedEvent>, SyncError>;

    /// Bump the retry counter after a replay attempt.
    async fn mark_retry(&self, tx_hash: &str, log_index: u32, at: i64)
        -> Result<(), SyncError>;
}

// ─── In-memory store (tests and ephemeral deployments) ───────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory implementation of all three store traits.
#[derive(Default)]
pub struct MemoryStore {
    progress: Mutex<HashMap<(String, u64), SyncProgress>>,
    events: Mutex<HashMap<(String, u32), StoredEvent>>,
    failures: Mutex<Vec<FailedEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn load(
        &self,
        address: &str,
        chain_id: u64,
    ) -> Result<Option<SyncProgress>, SyncError> {
        Ok(self
            .progress
            .lock()
            .unwrap()
            .get(&(address.to_string(), chain_id))
            .cloned())
    }

    async fn save(&self, progress: SyncProgress) -> Result<(), SyncError> {
        let key = (progress.entity_address.clone(), progress.chain_id);
        self.progress.lock().unwrap().insert(key, progress);
        Ok(())
    }

    async fn set_syncing(
        &self,
        address: &str,
        chain_id: u64,
        syncing: bool,
    ) -> Result<bool, SyncError> {
        let mut rows = self.progress.lock().unwrap();
        match rows.get_mut(&(address.to_string(), chain_id)) {
            Some(row) => {
                row.is_syncing = syncing;
                row.updated_at = chrono::Utc::now().timestamp();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_batch(
        &self,
        address: &str,
        chain_id: u64,
        last_block: i64,
        newly_applied: u64,
    ) -> Result<(), SyncError> {
        let mut rows = self.progress.lock().unwrap();
        let row = rows
            .get_mut(&(address.to_string(), chain_id))
            .ok_or_else(|| SyncError::NotFound {
                address: address.to_string(),
                chain_id,
            })?;
        row.last_processed_block = row.last_processed_block.max(last_block);
        row.total_events_processed += newly_applied;
        row.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SyncProgress>, SyncError> {
        Ok(self.progress.lock().unwrap().values().cloned().collect())
    }

    async fn clear_stale_syncing(&self) -> Result<u64, SyncError> {
        let mut rows = self.progress.lock().unwrap();
        let now = chrono::Utc::now().timestamp();
        let mut reset = 0u64;
        for row in rows.values_mut() {
            if row.is_syncing {
                row.is_syncing = false;
                row.updated_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn contains(&self, tx_hash: &str, log_index: u32) -> Result<bool, SyncError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .contains_key(&(tx_hash.to_string(), log_index)))
    }

    async fn insert(&self, event: StoredEvent) -> Result<bool, SyncError> {
        let key = (event.tx_hash.clone(), event.log_index);
        let mut events = self.events.lock().unwrap();
        if events.contains_key(&key) {
            return Ok(false);
        }
        events.insert(key, event);
        Ok(true)
    }

    async fn count(&self) -> Result<u64, SyncError> {
        Ok(self.events.lock().unwrap().len() as u64)
    }

    async fn events_for_entity(
        &self,
        address: &str,
        chain_id: u64,
    ) -> Result<Vec<StoredEvent>, SyncError> {
        let mut events: Vec<StoredEvent> = self
            .events
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.entity_address == address && e.chain_id == chain_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }
}

#[async_trait]
impl FailureSink for MemoryStore {
    async fn record(&self, failure: FailedEvent) -> Result<(), SyncError> {
        self.failures.lock().unwrap().push(failure);
        Ok(())
    }

    async fn count(&self) -> Result<u64, SyncError> {
        Ok(self.failures.lock().unwrap().len() as u64)
    }

    async fn list_for_entity(
        &self,
        address: &str,
        chain_id: u64,
    ) -> Result<Vec<FailedEvent>, SyncError> {
        Ok(self
            .failures
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.entity_address == address && f.chain_id == chain_id)
            .cloned()
            .collect())
    }

    async fn mark_retry(
        &self,
        tx_hash: &str,
        log_index: u32,
        at: i64,
    ) -> Result<(), SyncError> {
        let mut failures = self.failures.lock().unwrap();
        for f in failures.iter_mut() {
            if f.tx_hash == tx_hash && f.log_index == log_index {
                f.retry_count += 1;
                f.last_retry_at = Some(at);
            }
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(tx: &str, log_index: u32, block: u64) -> StoredEvent {
        StoredEvent {
            tx_hash: tx.to_string(),
            log_index,
            block_number: block,
            block_hash: format!("0x{block:064x}"),
            entity_address: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".into(),
            chain_id: 1,
            kind: "Transfer".into(),
            args: serde_json::json!({
                "from": "0x1111111111111111111111111111111111111111",
                "to":   "0x2222222222222222222222222222222222222222",
                "value": "0x64"
            }),
            recorded_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn progress_roundtrip() {
        let store = MemoryStore::new();
        let row = SyncProgress::new("0xabc", 1, 1000);
        store.save(row).await.unwrap();

        let loaded = store.load("0xabc", 1).await.unwrap().unwrap();
        assert_eq!(loaded.last_processed_block, 999);
        assert_eq!(loaded.sync_start_block, 1000);
        assert!(loaded.is_syncing);

        assert!(store.load("0xabc", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_syncing_requires_row() {
        let store = MemoryStore::new();
        assert!(!store.set_syncing("0xabc", 1, false).await.unwrap());

        store.save(SyncProgress::new("0xabc", 1, 100)).await.unwrap();
        assert!(store.set_syncing("0xabc", 1, false).await.unwrap());
        assert!(!store.load("0xabc", 1).await.unwrap().unwrap().is_syncing);
    }

    #[tokio::test]
    async fn record_batch_is_monotonic() {
        let store = MemoryStore::new();
        store.save(SyncProgress::new("0xabc", 1, 100)).await.unwrap();

        store.record_batch("0xabc", 1, 199, 3).await.unwrap();
        store.record_batch("0xabc", 1, 150, 2).await.unwrap(); // stale, must not move back

        let row = store.load("0xabc", 1).await.unwrap().unwrap();
        assert_eq!(row.last_processed_block, 199);
        assert_eq!(row.total_events_processed, 5);
    }

    #[tokio::test]
    async fn record_batch_without_row_fails() {
        let store = MemoryStore::new();
        let err = store.record_batch("0xabc", 1, 10, 0).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[tokio::test]
    async fn clear_stale_syncing_counts_repairs() {
        let store = MemoryStore::new();
        store.save(SyncProgress::new("0xaaa", 1, 10)).await.unwrap();
        store.save(SyncProgress::new("0xbbb", 1, 10)).await.unwrap();
        let mut done = SyncProgress::new("0xccc", 1, 10);
        done.is_syncing = false;
        store.save(done).await.unwrap();

        assert_eq!(store.clear_stale_syncing().await.unwrap(), 2);
        assert_eq!(store.clear_stale_syncing().await.unwrap(), 0);
        for row in store.list().await.unwrap() {
            assert!(!row.is_syncing);
        }
    }

    #[tokio::test]
    async fn event_insert_deduplicates() {
        let store = MemoryStore::new();
        assert!(store.insert(sample_event("0xt1", 0, 100)).await.unwrap());
        assert!(!store.insert(sample_event("0xt1", 0, 100)).await.unwrap());
        assert!(store.insert(sample_event("0xt1", 1, 100)).await.unwrap());
        assert_eq!(EventStore::count(&store).await.unwrap(), 2);
        assert!(store.contains("0xt1", 0).await.unwrap());
        assert!(!store.contains("0xt2", 0).await.unwrap());
    }

    #[tokio::test]
    async fn events_for_entity_ordered() {
        let store = MemoryStore::new();
        store.insert(sample_event("0xt3", 0, 102)).await.unwrap();
        store.insert(sample_event("0xt1", 1, 100)).await.unwrap();
        store.insert(sample_event("0xt1", 0, 100)).await.unwrap();

        let events = store
            .events_for_entity("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", 1)
            .await
            .unwrap();
        let order: Vec<(u64, u32)> =
            events.iter().map(|e| (e.block_number, e.log_index)).collect();
        assert_eq!(order, vec![(100, 0), (100, 1), (102, 0)]);
    }

    #[tokio::test]
    async fn failure_record_and_mark_retry() {
        let store = MemoryStore::new();
        store
            .record(FailedEvent {
                entity_address: "0xabc".into(),
                chain_id: 1,
                block_number: 100,
                tx_hash: "0xbad".into(),
                log_index: 2,
                payload: serde_json::json!({}),
                error: "boom".into(),
                retry_count: 0,
                last_retry_at: None,
                created_at: 1_700_000_000,
            })
            .await
            .unwrap();

        assert_eq!(FailureSink::count(&store).await.unwrap(), 1);

        store.mark_retry("0xbad", 2, 1_700_000_100).await.unwrap();
        let rows = store.list_for_entity("0xabc", 1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].retry_count, 1);
        assert_eq!(rows[0].last_retry_at, Some(1_700_000_100));
    }
}
