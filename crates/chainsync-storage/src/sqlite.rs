//! SQLite storage backend for chainsync.
//!
//! Persists sync progress, materialized events, and failed events to a
//! single SQLite file via `sqlx` with WAL mode. The `(tx_hash, log_index)`
//! primary key on `stored_events` backstops the applier's check-then-insert
//! with a real uniqueness constraint.
//!
//! # Usage
//! ```rust,no_run
//! use chainsync_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./chainsync.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainsync_core::error::SyncError;
use chainsync_core::store::{EventStore, FailureSink, ProgressStore};
use chainsync_core::types::{FailedEvent, StoredEvent, SyncProgress};

/// SQLite-backed implementation of all three store traits.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chainsync.db"`) or a full
    /// SQLite URL (`"sqlite:./chainsync.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, SyncError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, SyncError> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_progress (
                entity_address         TEXT    NOT NULL,
                chain_id               INTEGER NOT NULL,
                last_processed_block   INTEGER NOT NULL,
                sync_start_block       INTEGER NOT NULL,
                is_syncing             INTEGER NOT NULL,
                total_events_processed INTEGER NOT NULL,
                updated_at             INTEGER NOT NULL,
                PRIMARY KEY (entity_address, chain_id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stored_events (
                tx_hash        TEXT    NOT NULL,
                log_index      INTEGER NOT NULL,
                block_number   INTEGER NOT NULL,
                block_hash     TEXT    NOT NULL,
                entity_address TEXT    NOT NULL,
                chain_id       INTEGER NOT NULL,
                kind           TEXT    NOT NULL,
                args           TEXT    NOT NULL,
                recorded_at    INTEGER NOT NULL,
                PRIMARY KEY (tx_hash, log_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS failed_events (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_address TEXT    NOT NULL,
                chain_id       INTEGER NOT NULL,
                block_number   INTEGER NOT NULL,
                tx_hash        TEXT    NOT NULL,
                log_index      INTEGER NOT NULL,
                payload        TEXT    NOT NULL,
                error          TEXT    NOT NULL,
                retry_count    INTEGER NOT NULL,
                last_retry_at  INTEGER,
                created_at     INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_entity
             ON stored_events (entity_address, chain_id, block_number, log_index);",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_failed_entity
             ON failed_events (entity_address, chain_id);",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        Ok(())
    }
}

// ─── ProgressStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl ProgressStore for SqliteStore {
    async fn load(
        &self,
        address: &str,
        chain_id: u64,
    ) -> Result<Option<SyncProgress>, SyncError> {
        let row = sqlx::query(
            "SELECT entity_address, chain_id, last_processed_block, sync_start_block,
                    is_syncing, total_events_processed, updated_at
             FROM sync_progress WHERE entity_address = ? AND chain_id = ?",
        )
        .bind(address)
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        Ok(row.map(|r| SyncProgress {
            entity_address: r.get("entity_address"),
            chain_id: r.get::<i64, _>("chain_id") as u64,
            last_processed_block: r.get("last_processed_block"),
            sync_start_block: r.get::<i64, _>("sync_start_block") as u64,
            is_syncing: r.get::<i64, _>("is_syncing") != 0,
            total_events_processed: r.get::<i64, _>("total_events_processed") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, progress: SyncProgress) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR REPLACE INTO sync_progress
             (entity_address, chain_id, last_processed_block, sync_start_block,
              is_syncing, total_events_processed, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&progress.entity_address)
        .bind(progress.chain_id as i64)
        .bind(progress.last_processed_block)
        .bind(progress.sync_start_block as i64)
        .bind(progress.is_syncing as i64)
        .bind(progress.total_events_processed as i64)
        .bind(progress.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        debug!(
            address = %progress.entity_address,
            chain_id = progress.chain_id,
            block = progress.last_processed_block,
            "progress saved"
        );
        Ok(())
    }

    async fn set_syncing(
        &self,
        address: &str,
        chain_id: u64,
        syncing: bool,
    ) -> Result<bool, SyncError> {
        let result = sqlx::query(
            "UPDATE sync_progress SET is_syncing = ?, updated_at = ?
             WHERE entity_address = ? AND chain_id = ?",
        )
        .bind(syncing as i64)
        .bind(chrono::Utc::now().timestamp())
        .bind(address)
        .bind(chain_id as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_batch(
        &self,
        address: &str,
        chain_id: u64,
        last_block: i64,
        newly_applied: u64,
    ) -> Result<(), SyncError> {
        let result = sqlx::query(
            "UPDATE sync_progress
             SET last_processed_block = MAX(last_processed_block, ?),
                 total_events_processed = total_events_processed + ?,
                 updated_at = ?
             WHERE entity_address = ? AND chain_id = ?",
        )
        .bind(last_block)
        .bind(newly_applied as i64)
        .bind(chrono::Utc::now().timestamp())
        .bind(address)
        .bind(chain_id as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound {
                address: address.to_string(),
                chain_id,
            });
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SyncProgress>, SyncError> {
        let rows = sqlx::query(
            "SELECT entity_address, chain_id, last_processed_block, sync_start_block,
                    is_syncing, total_events_processed, updated_at
             FROM sync_progress ORDER BY entity_address, chain_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| SyncProgress {
                entity_address: r.get("entity_address"),
                chain_id: r.get::<i64, _>("chain_id") as u64,
                last_processed_block: r.get("last_processed_block"),
                sync_start_block: r.get::<i64, _>("sync_start_block") as u64,
                is_syncing: r.get::<i64, _>("is_syncing") != 0,
                total_events_processed: r.get::<i64, _>("total_events_processed") as u64,
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    async fn clear_stale_syncing(&self) -> Result<u64, SyncError> {
        let result = sqlx::query(
            "UPDATE sync_progress SET is_syncing = 0, updated_at = ? WHERE is_syncing = 1",
        )
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

// ─── EventStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl EventStore for SqliteStore {
    async fn contains(&self, tx_hash: &str, log_index: u32) -> Result<bool, SyncError> {
        let row = sqlx::query(
            "SELECT 1 FROM stored_events WHERE tx_hash = ? AND log_index = ?",
        )
        .bind(tx_hash)
        .bind(log_index as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        Ok(row.is_some())
    }

    async fn insert(&self, event: StoredEvent) -> Result<bool, SyncError> {
        let args = serde_json::to_string(&event.args)
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO stored_events
             (tx_hash, log_index, block_number, block_hash, entity_address,
              chain_id, kind, args, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.tx_hash)
        .bind(event.log_index as i64)
        .bind(event.block_number as i64)
        .bind(&event.block_hash)
        .bind(&event.entity_address)
        .bind(event.chain_id as i64)
        .bind(&event.kind)
        .bind(&args)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<u64, SyncError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM stored_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        Ok(row.get::<i64, _>("cnt") as u64)
    }

    async fn events_for_entity(
        &self,
        address: &str,
        chain_id: u64,
    ) -> Result<Vec<StoredEvent>, SyncError> {
        let rows = sqlx::query(
            "SELECT tx_hash, log_index, block_number, block_hash, entity_address,
                    chain_id, kind, args, recorded_at
             FROM stored_events WHERE entity_address = ? AND chain_id = ?
             ORDER BY block_number, log_index",
        )
        .bind(address)
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let args_str: String = row.get("args");
            let args = serde_json::from_str(&args_str).unwrap_or(serde_json::Value::Null);
            events.push(StoredEvent {
                tx_hash: row.get("tx_hash"),
                log_index: row.get::<i64, _>("log_index") as u32,
                block_number: row.get::<i64, _>("block_number") as u64,
                block_hash: row.get("block_hash"),
                entity_address: row.get("entity_address"),
                chain_id: row.get::<i64, _>("chain_id") as u64,
                kind: row.get("kind"),
                args,
                recorded_at: row.get("recorded_at"),
            });
        }
        Ok(events)
    }
}

// ─── FailureSink impl ────────────────────────────────────────────────────────

#[async_trait]
impl FailureSink for SqliteStore {
    async fn record(&self, failure: FailedEvent) -> Result<(), SyncError> {
        let payload = serde_json::to_string(&failure.payload)
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        sqlx::query(
            "INSERT INTO failed_events
             (entity_address, chain_id, block_number, tx_hash, log_index,
              payload, error, retry_count, last_retry_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&failure.entity_address)
        .bind(failure.chain_id as i64)
        .bind(failure.block_number as i64)
        .bind(&failure.tx_hash)
        .bind(failure.log_index as i64)
        .bind(&payload)
        .bind(&failure.error)
        .bind(failure.retry_count as i64)
        .bind(failure.last_retry_at)
        .bind(failure.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        debug!(
            tx_hash = %failure.tx_hash,
            log_index = failure.log_index,
            "failed event recorded"
        );
        Ok(())
    }

    async fn count(&self) -> Result<u64, SyncError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM failed_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        Ok(row.get::<i64, _>("cnt") as u64)
    }

    async fn list_for_entity(
        &self,
        address: &str,
        chain_id: u64,
    ) -> Result<Vec<FailedEvent>, SyncError> {
        let rows = sqlx::query(
            "SELECT entity_address, chain_id, block_number, tx_hash, log_index,
                    payload, error, retry_count, last_retry_at, created_at
             FROM failed_events WHERE entity_address = ? AND chain_id = ?
             ORDER BY block_number, log_index",
        )
        .bind(address)
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        let mut failures = Vec::with_capacity(rows.len());
        for row in rows {
            let payload_str: String = row.get("payload");
            let payload =
                serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null);
            failures.push(FailedEvent {
                entity_address: row.get("entity_address"),
                chain_id: row.get::<i64, _>("chain_id") as u64,
                block_number: row.get::<i64, _>("block_number") as u64,
                tx_hash: row.get("tx_hash"),
                log_index: row.get::<i64, _>("log_index") as u32,
                payload,
                error: row.get("error"),
                retry_count: row.get::<i64, _>("retry_count") as u32,
                last_retry_at: row.get("last_retry_at"),
                created_at: row.get("created_at"),
            });
        }
        Ok(failures)
    }

    async fn mark_retry(
        &self,
        tx_hash: &str,
        log_index: u32,
        at: i64,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "UPDATE failed_events SET retry_count = retry_count + 1, last_retry_at = ?
             WHERE tx_hash = ? AND log_index = ?",
        )
        .bind(at)
        .bind(tx_hash)
        .bind(log_index as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

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
                "value": block.to_string()
            }),
            recorded_at: 1_700_000_000,
        }
    }

    // ── ProgressStore ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn progress_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.save(SyncProgress::new("0xabc", 1, 1_000)).await.unwrap();

        let loaded = store.load("0xabc", 1).await.unwrap().unwrap();
        assert_eq!(loaded.last_processed_block, 999);
        assert_eq!(loaded.sync_start_block, 1_000);
        assert!(loaded.is_syncing);
        assert_eq!(loaded.total_events_processed, 0);

        assert!(store.load("0xabc", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn genesis_start_block_keeps_negative_cursor() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.save(SyncProgress::new("0xabc", 1, 0)).await.unwrap();

        let loaded = store.load("0xabc", 1).await.unwrap().unwrap();
        assert_eq!(loaded.last_processed_block, -1);
    }

    #[tokio::test]
    async fn set_syncing_reports_missing_rows() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(!store.set_syncing("0xabc", 1, false).await.unwrap());

        store.save(SyncProgress::new("0xabc", 1, 100)).await.unwrap();
        assert!(store.set_syncing("0xabc", 1, false).await.unwrap());
        assert!(!store.load("0xabc", 1).await.unwrap().unwrap().is_syncing);
    }

    #[tokio::test]
    async fn record_batch_is_monotonic() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.save(SyncProgress::new("0xabc", 1, 100)).await.unwrap();

        store.record_batch("0xabc", 1, 199, 3).await.unwrap();
        store.record_batch("0xabc", 1, 150, 2).await.unwrap();

        let row = store.load("0xabc", 1).await.unwrap().unwrap();
        assert_eq!(row.last_processed_block, 199, "cursor never moves back");
        assert_eq!(row.total_events_processed, 5);
    }

    #[tokio::test]
    async fn record_batch_without_row_fails() {
        let store = SqliteStore::in_memory().await.unwrap();
        let err = store.record_batch("0xabc", 1, 10, 0).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[tokio::test]
    async fn clear_stale_syncing_repairs_all_flags() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.save(SyncProgress::new("0xaaa", 1, 10)).await.unwrap();
        store.save(SyncProgress::new("0xbbb", 8453, 10)).await.unwrap();
        let mut done = SyncProgress::new("0xccc", 1, 10);
        done.is_syncing = false;
        store.save(done).await.unwrap();

        assert_eq!(store.clear_stale_syncing().await.unwrap(), 2);
        assert_eq!(store.clear_stale_syncing().await.unwrap(), 0);
        for row in store.list().await.unwrap() {
            assert!(!row.is_syncing);
        }
    }

    // ── EventStore ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_or_ignore_deduplicates() {
        let store = SqliteStore::in_memory().await.unwrap();

        assert!(store.insert(sample_event("0xt1", 0, 100)).await.unwrap());
        assert!(!store.insert(sample_event("0xt1", 0, 100)).await.unwrap());
        assert!(store.insert(sample_event("0xt1", 1, 100)).await.unwrap());

        assert_eq!(EventStore::count(&store).await.unwrap(), 2);
        assert!(store.contains("0xt1", 0).await.unwrap());
        assert!(!store.contains("0xt2", 0).await.unwrap());
    }

    #[tokio::test]
    async fn events_for_entity_ordered_with_args_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
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
        assert_eq!(events[2].args["value"], "102");
    }

    // ── FailureSink ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn failure_roundtrip_and_mark_retry() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .record(FailedEvent {
                entity_address: "0xabc".into(),
                chain_id: 1,
                block_number: 100,
                tx_hash: "0xbad".into(),
                log_index: 2,
                payload: serde_json::json!({ "kind": "Transfer" }),
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
        assert_eq!(rows[0].payload["kind"], "Transfer");
    }
}
