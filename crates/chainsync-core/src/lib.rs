//! chainsync-core — resumable ledger-event synchronization engine.
//!
//! # Architecture
//!
//! ```text
//! LifecycleManager → SyncCoordinator (start/stop/resume state machine)
//!                        ├── BatchScheduler (bounded sub-ranges, retry)
//!                        ├── EventApplier   (idempotent materialization)
//!                        ├── WorkQueue      (at-least-once job delivery)
//!                        └── Stores         (progress / events / failures)
//! HealthMonitor — read-only status aggregation over the same state
//! ```
//!
//! Progress is a durable per-entity cursor; the `is_syncing` flag on it is
//! the single authoritative signal for active syncs and the cooperative
//! cancellation mechanism. Event application is keyed on
//! `(tx_hash, log_index)`, so replays and redeliveries are no-ops.

pub mod applier;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod ledger;
pub mod lifecycle;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use applier::EventApplier;
pub use config::{SyncConfig, TrackedEntity};
pub use coordinator::{EntityState, SyncCoordinator};
pub use error::SyncError;
pub use health::{HealthMonitor, HealthReport, HealthState};
pub use ledger::LedgerClient;
pub use lifecycle::{LifecycleManager, RecoveryStatus};
pub use queue::{InProcessQueue, JobOptions, JobRunner, SyncJob, WorkQueue};
pub use retry::{RetryConfig, RetryPolicy};
pub use scheduler::{split_range, BatchScheduler};
pub use store::{EventStore, FailureSink, MemoryStore, ProgressStore};
pub use types::{FailedEvent, LedgerEvent, StoredEvent, SyncProgress};
