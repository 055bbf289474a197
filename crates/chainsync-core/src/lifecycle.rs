//! Lifecycle manager — startup recovery and shutdown drain.
//!
//! Both are explicit methods invoked by the process entry point: recovery
//! after component init, drain before exit. A crashed process cannot tell
//! "was truly syncing" from "crashed mid-sync", so recovery force-resets
//! every stuck `is_syncing` flag before resuming anything.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::SyncError;
use crate::queue::{SyncJob, WorkQueue};
use crate::store::ProgressStore;

/// Counts from the most recent recovery pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RecoveryStatus {
    /// Enabled entities in the configuration.
    pub configured: usize,
    /// Entities with an existing progress row that were resumed.
    pub resumed: usize,
    /// Rows whose stale `is_syncing` flag had to be repaired.
    pub stuck: u64,
}

pub struct LifecycleManager {
    config: SyncConfig,
    coordinator: Arc<SyncCoordinator>,
    progress: Arc<dyn ProgressStore>,
    queue: Arc<dyn WorkQueue>,
    last_recovery: Mutex<RecoveryStatus>,
}

impl LifecycleManager {
    pub fn new(
        config: SyncConfig,
        coordinator: Arc<SyncCoordinator>,
        progress: Arc<dyn ProgressStore>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            config,
            coordinator,
            progress,
            queue,
            last_recovery: Mutex::new(RecoveryStatus::default()),
        }
    }

    /// Startup recovery: after a short grace delay, repair stale sync flags
    /// and resume every configured entity that was previously indexed.
    pub async fn run_recovery(&self) -> Result<RecoveryStatus, SyncError> {
        let grace = Duration::from_secs(self.config.recovery_grace_secs);
        if !grace.is_zero() {
            tracing::debug!(grace_secs = grace.as_secs(), "waiting before recovery");
            tokio::time::sleep(grace).await;
        }

        let stuck = self.progress.clear_stale_syncing().await?;
        if stuck > 0 {
            tracing::warn!(stuck, "repaired sync flags left by unclean shutdown");
        }
        self.last_recovery.lock().unwrap().stuck = stuck;

        let status = self.resume_configured().await?;
        tracing::info!(
            configured = status.configured,
            resumed = status.resumed,
            stuck = status.stuck,
            "startup recovery complete"
        );
        Ok(status)
    }

    /// Resume every configured+enabled entity that already has a progress
    /// row. Entities never indexed are left untouched — they are "not yet
    /// started", not "resumable". Public so operators can re-run it.
    pub async fn resume_configured(&self) -> Result<RecoveryStatus, SyncError> {
        let enabled: Vec<_> = self
            .config
            .enabled_entities()
            .into_iter()
            .map(|e| e.normalized())
            .collect();
        let configured = enabled.len();
        let mut resumed = 0;

        for entity in enabled {
            match self.progress.load(&entity.address, entity.chain_id).await? {
                None => {
                    tracing::debug!(
                        address = %entity.address,
                        chain_id = entity.chain_id,
                        "never indexed; not resuming"
                    );
                }
                Some(_) => match self.coordinator.start(&entity.address).await {
                    Ok(_) => {
                        resumed += 1;
                        tracing::info!(
                            address = %entity.address,
                            chain_id = entity.chain_id,
                            "entity resumed"
                        );
                    }
                    Err(err) => {
                        // One bad entity must not block the others.
                        tracing::warn!(
                            address = %entity.address,
                            chain_id = entity.chain_id,
                            error = %err,
                            "entity could not be resumed"
                        );
                    }
                },
            }
        }

        let mut last = self.last_recovery.lock().unwrap();
        last.configured = configured;
        last.resumed = resumed;
        Ok(*last)
    }

    /// Counts from the last recovery/resume pass.
    pub fn recovery_status(&self) -> RecoveryStatus {
        *self.last_recovery.lock().unwrap()
    }

    /// Shutdown drain: mark everything stopped, discard queued work, wait
    /// bounded time for in-flight work, then close the queue. Never waits
    /// indefinitely.
    pub async fn drain(&self, timeout: Duration) {
        tracing::info!(timeout_secs = timeout.as_secs(), "draining sync engine");

        match self.progress.list().await {
            Ok(rows) => {
                for row in rows.iter().filter(|r| r.is_syncing) {
                    if let Err(err) = self
                        .progress
                        .set_syncing(&row.entity_address, row.chain_id, false)
                        .await
                    {
                        tracing::warn!(
                            address = %row.entity_address,
                            chain_id = row.chain_id,
                            error = %err,
                            "could not mark entity stopped during drain"
                        );
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not list progress rows during drain");
            }
        }

        // Queued and delayed jobs (armed monitor polls included) are
        // discarded outright; only work already executing gets the grace
        // window. A monitor that fired mid-drain could otherwise start new
        // syncs.
        match self.queue.cancel_pending(&|_job: &SyncJob| true).await {
            Ok(cancelled) if cancelled > 0 => {
                tracing::debug!(cancelled, "pending jobs discarded for drain");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "could not cancel pending jobs during drain");
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let active = self.queue.active_count().await;
            if active == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(active, "drain timeout elapsed with work still in flight");
                break;
            }
            tracing::debug!(active, "waiting for in-flight work");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.queue.close().await;
        tracing::info!("drain complete");
    }
}
