//! Sync coordinator — per-entity start/stop/resume state machine.
//!
//! The durable `is_syncing` flag on the progress row is the authoritative
//! cross-restart signal; the in-memory state map is its intra-process
//! refinement (it also stops an in-flight monitor poll from resurrecting a
//! stopped entity). Cancellation is cooperative: runs re-read the flag at
//! round start and between sub-ranges, never mid-batch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::applier::EventApplier;
use crate::config::{SyncConfig, TrackedEntity};
use crate::error::SyncError;
use crate::ledger::LedgerClient;
use crate::queue::{JobOptions, JobRunner, SyncJob, WorkQueue};
use crate::retry::RetryPolicy;
use crate::scheduler::BatchScheduler;
use crate::store::{EventStore, FailureSink, ProgressStore};
use crate::types::{is_valid_address, SyncProgress};

/// Runtime state of one tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Never started in this process.
    Uninitialized,
    /// Start accepted, first run not yet picked up.
    Starting,
    /// Catching up toward the ledger head.
    Syncing,
    /// At the head; polling at monitor cadence.
    CaughtUp,
    /// Stopped by request.
    Stopped,
    /// Last run aborted with an error.
    Errored,
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Starting => write!(f, "starting"),
            Self::Syncing => write!(f, "syncing"),
            Self::CaughtUp => write!(f, "caught-up"),
            Self::Stopped => write!(f, "stopped"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

type EntityKey = (String, u64);

pub struct SyncCoordinator {
    config: SyncConfig,
    ledger: Arc<dyn LedgerClient>,
    progress: Arc<dyn ProgressStore>,
    queue: Arc<dyn WorkQueue>,
    scheduler: BatchScheduler,
    applier: Arc<EventApplier>,
    states: Mutex<HashMap<EntityKey, EntityState>>,
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        ledger: Arc<dyn LedgerClient>,
        progress: Arc<dyn ProgressStore>,
        events: Arc<dyn EventStore>,
        failures: Arc<dyn FailureSink>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        let applier = Arc::new(EventApplier::new(
            ledger.clone(),
            events,
            failures,
            progress.clone(),
        ));
        let scheduler = BatchScheduler::new(
            progress.clone(),
            applier.clone(),
            RetryPolicy::new(config.retry()),
            config.batch_size,
        );
        Self {
            config,
            ledger,
            progress,
            queue,
            scheduler,
            applier,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Begin (or resume) syncing a configured entity.
    ///
    /// Fails with `Configuration` for unknown or disabled entities and with
    /// `Validation` when the address is malformed or not a live contract.
    /// Calling `start` while the entity is already syncing is a no-op re-arm.
    pub async fn start(&self, address: &str) -> Result<SyncProgress, SyncError> {
        let entity = self
            .config
            .entity(address)
            .ok_or_else(|| SyncError::Configuration(format!("entity {address} is not configured")))?;
        if !entity.enabled {
            return Err(SyncError::Configuration(format!(
                "entity {address} is disabled"
            )));
        }
        let entity = entity.normalized();
        if !is_valid_address(&entity.address) {
            return Err(SyncError::Validation(format!(
                "{} is not a valid address",
                entity.address
            )));
        }
        if entity.chain_id == 0 {
            return Err(SyncError::Validation("chain id must be non-zero".into()));
        }
        if !self.ledger.validate_entity(&entity.address).await? {
            return Err(SyncError::Validation(format!(
                "{} is not a live contract",
                entity.address
            )));
        }

        let key = (entity.address.clone(), entity.chain_id);
        let existing = self.progress.load(&entity.address, entity.chain_id).await?;
        if let Some(row) = &existing {
            let state = self.state_of(&key);
            if row.is_syncing && matches!(state, EntityState::Starting | EntityState::Syncing) {
                tracing::debug!(
                    address = %entity.address,
                    chain_id = entity.chain_id,
                    "already syncing; start is a no-op"
                );
                return Ok(row.clone());
            }
        }

        let row = match existing {
            Some(mut row) => {
                self.progress
                    .set_syncing(&entity.address, entity.chain_id, true)
                    .await?;
                row.is_syncing = true;
                tracing::info!(
                    address = %entity.address,
                    chain_id = entity.chain_id,
                    last_processed = row.last_processed_block,
                    "resuming sync"
                );
                row
            }
            None => {
                let start_block = match entity.start_block {
                    Some(block) => block,
                    None => self.ledger.current_height().await?,
                };
                let row = SyncProgress::new(entity.address.clone(), entity.chain_id, start_block);
                self.progress.save(row.clone()).await?;
                tracing::info!(
                    address = %entity.address,
                    chain_id = entity.chain_id,
                    start_block,
                    "starting first sync"
                );
                row
            }
        };

        // A re-start supersedes whatever is still armed for this entity; a
        // parked monitor poll must not outlive it and keep its own chain.
        let target = entity.address.clone();
        let chain = entity.chain_id;
        match self
            .queue
            .cancel_pending(&move |job: &SyncJob| {
                job.address() == target && job.chain_id() == chain
            })
            .await
        {
            Ok(cancelled) if cancelled > 0 => {
                tracing::debug!(
                    address = %entity.address,
                    chain_id = entity.chain_id,
                    cancelled,
                    "armed jobs superseded by restart"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    address = %entity.address,
                    chain_id = entity.chain_id,
                    error = %err,
                    "could not cancel armed jobs on restart"
                );
            }
        }

        self.set_state(&key, EntityState::Starting);
        self.queue
            .enqueue(
                SyncJob::Run {
                    address: entity.address.clone(),
                    chain_id: entity.chain_id,
                },
                JobOptions::default(),
            )
            .await?;
        Ok(row)
    }

    /// Stop syncing an entity. The flag flip is the success criterion:
    /// queued-work cancellation failures are logged, never escalated.
    /// In-flight units finish on their own.
    pub async fn stop(&self, address: &str, chain_id: u64) -> Result<(), SyncError> {
        let address = address.to_ascii_lowercase();
        let found = self.progress.set_syncing(&address, chain_id, false).await?;
        if !found {
            return Err(SyncError::NotFound { address, chain_id });
        }
        self.set_state(&(address.clone(), chain_id), EntityState::Stopped);

        let target = address.clone();
        match self
            .queue
            .cancel_pending(&move |job: &SyncJob| {
                job.address() == target && job.chain_id() == chain_id
            })
            .await
        {
            Ok(cancelled) => {
                tracing::info!(address = %address, chain_id, cancelled, "sync stopped");
            }
            Err(err) => {
                tracing::warn!(
                    address = %address,
                    chain_id,
                    error = %err,
                    "sync stopped but queued work could not be cancelled"
                );
            }
        }
        Ok(())
    }

    /// Last durably committed progress for an entity, never in-memory state.
    pub async fn status(
        &self,
        address: &str,
        chain_id: u64,
    ) -> Result<Option<SyncProgress>, SyncError> {
        self.progress
            .load(&address.to_ascii_lowercase(), chain_id)
            .await
    }

    /// In-process state of an entity.
    pub fn state(&self, address: &str, chain_id: u64) -> EntityState {
        self.state_of(&(address.to_ascii_lowercase(), chain_id))
    }

    /// Replay recorded failures for a configured entity from their stored
    /// payloads. Returns how many events were recovered.
    pub async fn retry_failed(&self, address: &str, chain_id: u64) -> Result<u64, SyncError> {
        let entity = self
            .config
            .entity(address)
            .ok_or_else(|| SyncError::Configuration(format!("entity {address} is not configured")))?
            .normalized();
        if entity.chain_id != chain_id {
            return Err(SyncError::NotFound {
                address: entity.address,
                chain_id,
            });
        }
        self.applier.retry_failed(&entity).await
    }

    fn state_of(&self, key: &EntityKey) -> EntityState {
        self.states
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(EntityState::Uninitialized)
    }

    fn set_state(&self, key: &EntityKey, state: EntityState) {
        self.states.lock().unwrap().insert(key.clone(), state);
    }

    /// One catch-up round: fetch the open range `[last+1, height-1]`, drive
    /// its sub-ranges, then either re-arm another Run or transition to
    /// caught-up. Exits quietly whenever `is_syncing` reads false.
    async fn run_entity(&self, entity: &TrackedEntity) -> Result<(), SyncError> {
        let key = (entity.address.clone(), entity.chain_id);
        let Some(row) = self.progress.load(&entity.address, entity.chain_id).await? else {
            tracing::warn!(address = %entity.address, "run without progress row; skipping");
            return Ok(());
        };
        if !row.is_syncing {
            tracing::debug!(address = %entity.address, "sync flag cleared; run exits");
            self.set_state(&key, EntityState::Stopped);
            return Ok(());
        }
        self.set_state(&key, EntityState::Syncing);

        let height = match self.ledger.current_height().await {
            Ok(height) => height,
            Err(err) => return self.fail_run(&key, entity, err).await,
        };
        if row.is_caught_up(height) {
            return self.enter_caught_up(&key, entity, height).await;
        }

        let from = row.next_block();
        let to = height - 1;
        let outcome = match self.scheduler.run_range(entity, from, to).await {
            Ok(outcome) => outcome,
            Err(err) => return self.fail_run(&key, entity, err).await,
        };
        if outcome.stopped {
            self.set_state(&key, EntityState::Stopped);
            return Ok(());
        }

        // Re-read the flag before re-arming; a stop during the round must
        // not be overridden.
        let Some(row) = self.progress.load(&entity.address, entity.chain_id).await? else {
            return Ok(());
        };
        if !row.is_syncing {
            self.set_state(&key, EntityState::Stopped);
            return Ok(());
        }
        let height = match self.ledger.current_height().await {
            Ok(height) => height,
            Err(err) => return self.fail_run(&key, entity, err).await,
        };
        if row.is_caught_up(height) {
            self.enter_caught_up(&key, entity, height).await
        } else {
            self.queue
                .enqueue(
                    SyncJob::Run {
                        address: entity.address.clone(),
                        chain_id: entity.chain_id,
                    },
                    JobOptions::default(),
                )
                .await?;
            Ok(())
        }
    }

    /// Monitor poll for a caught-up entity. Exits if the entity has been
    /// stopped or errored since the poll was armed.
    async fn monitor_entity(&self, entity: &TrackedEntity) -> Result<(), SyncError> {
        let key = (entity.address.clone(), entity.chain_id);
        if self.state_of(&key) != EntityState::CaughtUp {
            tracing::debug!(
                address = %entity.address,
                state = %self.state_of(&key),
                "monitor poll superseded; exiting"
            );
            return Ok(());
        }

        let height = match self.ledger.current_height().await {
            Ok(height) => height,
            Err(err) => {
                // Keep watching; health reporting surfaces the outage.
                tracing::warn!(
                    address = %entity.address,
                    error = %err,
                    "height check failed; monitor re-armed"
                );
                return self.arm_monitor(entity).await;
            }
        };
        let Some(row) = self.progress.load(&entity.address, entity.chain_id).await? else {
            return Ok(());
        };
        if row.is_caught_up(height) {
            return self.arm_monitor(entity).await;
        }

        tracing::info!(
            address = %entity.address,
            chain_id = entity.chain_id,
            height,
            last_processed = row.last_processed_block,
            "new blocks observed; resuming sync"
        );
        self.progress
            .set_syncing(&entity.address, entity.chain_id, true)
            .await?;
        self.set_state(&key, EntityState::Syncing);
        self.queue
            .enqueue(
                SyncJob::Run {
                    address: entity.address.clone(),
                    chain_id: entity.chain_id,
                },
                JobOptions::default(),
            )
            .await?;
        Ok(())
    }

    async fn enter_caught_up(
        &self,
        key: &EntityKey,
        entity: &TrackedEntity,
        height: u64,
    ) -> Result<(), SyncError> {
        self.progress
            .set_syncing(&entity.address, entity.chain_id, false)
            .await?;
        self.set_state(key, EntityState::CaughtUp);
        tracing::info!(
            address = %entity.address,
            chain_id = entity.chain_id,
            height,
            "caught up; switching to monitor cadence"
        );
        self.arm_monitor(entity).await
    }

    async fn arm_monitor(&self, entity: &TrackedEntity) -> Result<(), SyncError> {
        self.queue
            .enqueue(
                SyncJob::Monitor {
                    address: entity.address.clone(),
                    chain_id: entity.chain_id,
                },
                JobOptions {
                    delay: Some(self.config.monitor_interval()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// A run-aborting error always clears the flag so the entity stays
    /// resumable rather than silently stuck.
    async fn fail_run(
        &self,
        key: &EntityKey,
        entity: &TrackedEntity,
        err: SyncError,
    ) -> Result<(), SyncError> {
        if let Err(clear_err) = self
            .progress
            .set_syncing(&entity.address, entity.chain_id, false)
            .await
        {
            tracing::error!(
                address = %entity.address,
                error = %clear_err,
                "could not clear sync flag after failed run"
            );
        }
        self.set_state(key, EntityState::Errored);
        tracing::error!(
            address = %entity.address,
            chain_id = entity.chain_id,
            error = %err,
            "sync run aborted"
        );
        Err(err)
    }
}

#[async_trait]
impl JobRunner for SyncCoordinator {
    async fn run(&self, job: &SyncJob) -> Result<(), SyncError> {
        let Some(entity) = self.config.entity(job.address()) else {
            tracing::warn!(
                address = %job.address(),
                kind = job.kind(),
                "job for unconfigured entity dropped"
            );
            return Ok(());
        };
        let entity = entity.normalized();
        match job {
            SyncJob::Run { .. } => self.run_entity(&entity).await,
            SyncJob::Monitor { .. } => self.monitor_entity(&entity).await,
        }
    }
}
