//! Event applier — idempotent materialization of one block sub-range.
//!
//! Application is keyed on `(tx_hash, log_index)`: an event already present
//! under that key is a no-op, which is what makes at-least-once job delivery
//! safe. Per-event failures are captured in the failure sink and never block
//! the cursor.

use std::sync::Arc;

use crate::config::TrackedEntity;
use crate::error::SyncError;
use crate::ledger::LedgerClient;
use crate::store::{EventStore, FailureSink, ProgressStore};
use crate::types::{FailedEvent, LedgerEvent, StoredEvent};

pub struct EventApplier {
    ledger: Arc<dyn LedgerClient>,
    events: Arc<dyn EventStore>,
    failures: Arc<dyn FailureSink>,
    progress: Arc<dyn ProgressStore>,
}

impl EventApplier {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        events: Arc<dyn EventStore>,
        failures: Arc<dyn FailureSink>,
        progress: Arc<dyn ProgressStore>,
    ) -> Self {
        Self {
            ledger,
            events,
            failures,
            progress,
        }
    }

    /// Apply all events of `[from, to]` for `entity` and advance the cursor
    /// to `to`. Returns the number of newly applied events.
    ///
    /// The cursor advances unconditionally once every event is either applied
    /// or durably recorded as failed — individual failures must not cause
    /// unbounded re-fetching of the same range.
    pub async fn apply_range(
        &self,
        entity: &TrackedEntity,
        from: u64,
        to: u64,
    ) -> Result<u64, SyncError> {
        let mut fetched = self
            .ledger
            .events(&entity.address, &entity.event_kinds, from, to)
            .await?;

        // The client contract says ascending (block, log_index); verify
        // rather than trust it.
        if !is_sorted(&fetched) {
            tracing::warn!(
                address = %entity.address,
                from,
                to,
                "ledger returned events out of order; re-sorting"
            );
            fetched.sort_by_key(|e| (e.block_number, e.log_index));
        }

        let mut applied = 0u64;
        for event in &fetched {
            match self.apply_one(event, entity.chain_id).await {
                Ok(true) => applied += 1,
                Ok(false) => {
                    tracing::debug!(
                        tx_hash = %event.tx_hash,
                        log_index = event.log_index,
                        "event already materialized; skipping"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        tx_hash = %event.tx_hash,
                        log_index = event.log_index,
                        block = event.block_number,
                        error = %err,
                        "event failed to apply; recording"
                    );
                    self.failures
                        .record(FailedEvent {
                            entity_address: entity.address.clone(),
                            chain_id: entity.chain_id,
                            block_number: event.block_number,
                            tx_hash: event.tx_hash.clone(),
                            log_index: event.log_index,
                            payload: serde_json::to_value(event)
                                .unwrap_or(serde_json::Value::Null),
                            error: err.to_string(),
                            retry_count: 0,
                            last_retry_at: None,
                            created_at: chrono::Utc::now().timestamp(),
                        })
                        .await?;
                }
            }
        }

        self.progress
            .record_batch(&entity.address, entity.chain_id, to as i64, applied)
            .await?;
        Ok(applied)
    }

    /// Re-apply recorded failures for `entity` from their stored payloads.
    /// Every touched row gets its retry counter bumped; rows are never
    /// deleted. Returns how many events were recovered.
    pub async fn retry_failed(&self, entity: &TrackedEntity) -> Result<u64, SyncError> {
        let rows = self
            .failures
            .list_for_entity(&entity.address, entity.chain_id)
            .await?;
        let mut recovered = 0u64;
        for row in rows {
            self.failures
                .mark_retry(&row.tx_hash, row.log_index, chrono::Utc::now().timestamp())
                .await?;
            let event: LedgerEvent = match serde_json::from_value(row.payload.clone()) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(
                        tx_hash = %row.tx_hash,
                        log_index = row.log_index,
                        error = %err,
                        "failed event payload is not replayable"
                    );
                    continue;
                }
            };
            match self.apply_one(&event, row.chain_id).await {
                Ok(true) => {
                    recovered += 1;
                    // The progress row may predate the failure; only the
                    // counter moves, never the cursor.
                    self.progress
                        .record_batch(&entity.address, entity.chain_id, i64::MIN, 1)
                        .await?;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::debug!(
                        tx_hash = %row.tx_hash,
                        log_index = row.log_index,
                        error = %err,
                        "failed event still failing"
                    );
                }
            }
        }
        Ok(recovered)
    }

    /// Check-then-insert under the dedup key. Returns `false` when the event
    /// was already materialized.
    async fn apply_one(&self, event: &LedgerEvent, chain_id: u64) -> Result<bool, SyncError> {
        if self.events.contains(&event.tx_hash, event.log_index).await? {
            return Ok(false);
        }
        // The insert is itself insert-if-absent, so a concurrent duplicate
        // between check and insert is still suppressed.
        self.events
            .insert(StoredEvent::from_ledger(event, chain_id))
            .await
    }
}

fn is_sorted(events: &[LedgerEvent]) -> bool {
    events
        .windows(2)
        .all(|w| (w[0].block_number, w[0].log_index) <= (w[1].block_number, w[1].log_index))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Ledger stub returning a fixed event list for any range.
    struct FixedLedger {
        events: Mutex<Vec<LedgerEvent>>,
    }

    #[async_trait]
    impl LedgerClient for FixedLedger {
        async fn current_height(&self) -> Result<u64, SyncError> {
            Ok(1_000)
        }

        async fn events(
            &self,
            _address: &str,
            _kinds: &[String],
            from: u64,
            to: u64,
        ) -> Result<Vec<LedgerEvent>, SyncError> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.block_number >= from && e.block_number <= to)
                .cloned()
                .collect())
        }

        async fn validate_entity(&self, _address: &str) -> Result<bool, SyncError> {
            Ok(true)
        }
    }

    fn event(tx: &str, log_index: u32, block: u64) -> LedgerEvent {
        LedgerEvent {
            tx_hash: tx.into(),
            log_index,
            block_number: block,
            block_hash: format!("0x{block:064x}"),
            entity_address: "0xfeed".into(),
            kind: "Transfer".into(),
            args: serde_json::json!({ "value": "0x1" }),
        }
    }

    fn entity() -> TrackedEntity {
        TrackedEntity {
            address: "0xfeed".into(),
            chain_id: 1,
            start_block: Some(100),
            event_kinds: vec![],
            enabled: true,
        }
    }

    fn applier_with(events: Vec<LedgerEvent>) -> (EventApplier, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let applier = EventApplier::new(
            Arc::new(FixedLedger {
                events: Mutex::new(events),
            }),
            store.clone(),
            store.clone(),
            store.clone(),
        );
        (applier, store)
    }

    #[tokio::test]
    async fn applies_events_and_advances_cursor() {
        let (applier, store) =
            applier_with(vec![event("0xt1", 0, 100), event("0xt2", 0, 105)]);
        store.save(crate::types::SyncProgress::new("0xfeed", 1, 100)).await.unwrap();

        let applied = applier.apply_range(&entity(), 100, 150).await.unwrap();
        assert_eq!(applied, 2);

        let row = store.load("0xfeed", 1).await.unwrap().unwrap();
        assert_eq!(row.last_processed_block, 150);
        assert_eq!(row.total_events_processed, 2);
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let (applier, store) = applier_with(vec![event("0xt1", 0, 100)]);
        store.save(crate::types::SyncProgress::new("0xfeed", 1, 100)).await.unwrap();

        applier.apply_range(&entity(), 100, 110).await.unwrap();
        let applied_again = applier.apply_range(&entity(), 100, 110).await.unwrap();

        assert_eq!(applied_again, 0);
        assert_eq!(EventStore::count(store.as_ref()).await.unwrap(), 1);
        let row = store.load("0xfeed", 1).await.unwrap().unwrap();
        assert_eq!(row.total_events_processed, 1, "counter must not double-count");
    }

    #[tokio::test]
    async fn out_of_order_delivery_is_resorted() {
        let (applier, store) = applier_with(vec![
            event("0xt3", 0, 120),
            event("0xt1", 0, 100),
            event("0xt2", 1, 100),
        ]);
        store.save(crate::types::SyncProgress::new("0xfeed", 1, 100)).await.unwrap();

        applier.apply_range(&entity(), 100, 150).await.unwrap();

        let stored = store.events_for_entity("0xfeed", 1).await.unwrap();
        let order: Vec<u64> = stored.iter().map(|e| e.block_number).collect();
        assert_eq!(order, vec![100, 100, 120]);
    }

    #[tokio::test]
    async fn retry_failed_replays_from_payload() {
        let (applier, store) = applier_with(vec![]);
        store.save(crate::types::SyncProgress::new("0xfeed", 1, 100)).await.unwrap();
        store
            .record(FailedEvent {
                entity_address: "0xfeed".into(),
                chain_id: 1,
                block_number: 100,
                tx_hash: "0xbad".into(),
                log_index: 0,
                payload: serde_json::to_value(event("0xbad", 0, 100)).unwrap(),
                error: "transient".into(),
                retry_count: 0,
                last_retry_at: None,
                created_at: 0,
            })
            .await
            .unwrap();

        let recovered = applier.retry_failed(&entity()).await.unwrap();
        assert_eq!(recovered, 1);
        assert!(store.contains("0xbad", 0).await.unwrap());

        let failures = store.list_for_entity("0xfeed", 1).await.unwrap();
        assert_eq!(failures.len(), 1, "failure rows are never deleted");
        assert_eq!(failures[0].retry_count, 1);
        assert!(failures[0].last_retry_at.is_some());

        // A second pass finds the event materialized and recovers nothing.
        assert_eq!(applier.retry_failed(&entity()).await.unwrap(), 0);
    }
}
