//! Health monitor — read-side status aggregation.
//!
//! Pure observation over the other components' durable state; holds no
//! state of its own and never fails the caller: internal errors become an
//! `Unhealthy` report with an explanatory issue.

use std::sync::Arc;

use serde::Serialize;

use crate::config::SyncConfig;
use crate::ledger::LedgerClient;
use crate::store::{FailureSink, ProgressStore};

/// Overall status classification. Closed enum, suitable for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    /// Escalate to `other` if it is more severe. Unhealthy dominates.
    fn escalate(&mut self, other: HealthState) {
        *self = (*self).max(other);
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Per-entity diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EntityHealth {
    pub address: String,
    pub chain_id: u64,
    pub last_processed_block: i64,
    /// Blocks between the ledger head and the cursor; 0 when the ledger
    /// height is unknown.
    pub lag: u64,
    pub is_syncing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    /// Whether the latest-height query succeeded.
    pub connected: bool,
    pub entities: Vec<EntityHealth>,
    pub failed_events: u64,
    /// Human-readable explanations for any non-healthy classification.
    pub issues: Vec<String>,
    pub checked_at: i64,
}

pub struct HealthMonitor {
    config: SyncConfig,
    ledger: Arc<dyn LedgerClient>,
    progress: Arc<dyn ProgressStore>,
    failures: Arc<dyn FailureSink>,
}

impl HealthMonitor {
    pub fn new(
        config: SyncConfig,
        ledger: Arc<dyn LedgerClient>,
        progress: Arc<dyn ProgressStore>,
        failures: Arc<dyn FailureSink>,
    ) -> Self {
        Self {
            config,
            ledger,
            progress,
            failures,
        }
    }

    /// Derive the current health classification. Infallible by contract.
    pub async fn check(&self) -> HealthReport {
        let checked_at = chrono::Utc::now().timestamp();
        let mut status = HealthState::Healthy;
        let mut issues = Vec::new();

        let height = match self.ledger.current_height().await {
            Ok(height) => Some(height),
            Err(err) => {
                status.escalate(HealthState::Unhealthy);
                issues.push(format!("The ledger is unreachable: {err}."));
                None
            }
        };

        let rows = match self.progress.list().await {
            Ok(rows) => rows,
            Err(err) => {
                issues.push(format!("The progress store could not be queried: {err}."));
                return HealthReport {
                    status: HealthState::Unhealthy,
                    connected: height.is_some(),
                    entities: vec![],
                    failed_events: 0,
                    issues,
                    checked_at,
                };
            }
        };

        let mut entities = Vec::with_capacity(rows.len());
        let mut syncing = 0usize;
        for row in &rows {
            if row.is_syncing {
                syncing += 1;
            }
            let lag = height.map(|h| row.lag(h)).unwrap_or(0);
            if lag > self.config.lag_alert_threshold {
                status.escalate(HealthState::Degraded);
                issues.push(format!(
                    "Sync lag for {} on chain {} is {} blocks, above the {}-block threshold.",
                    row.entity_address, row.chain_id, lag, self.config.lag_alert_threshold
                ));
            }
            entities.push(EntityHealth {
                address: row.entity_address.clone(),
                chain_id: row.chain_id,
                last_processed_block: row.last_processed_block,
                lag,
                is_syncing: row.is_syncing,
            });
        }

        if syncing == 0 && !self.config.enabled_entities().is_empty() {
            status.escalate(HealthState::Degraded);
            issues.push("No entities are actively syncing although at least one is enabled.".into());
        }

        let failed_events = match self.failures.count().await {
            Ok(count) => count,
            Err(err) => {
                status.escalate(HealthState::Unhealthy);
                issues.push(format!("The failure sink could not be queried: {err}."));
                0
            }
        };
        if failed_events > self.config.failed_alert_threshold {
            status.escalate(HealthState::Degraded);
            issues.push(format!(
                "There are {} failed events, above the threshold of {}.",
                failed_events, self.config.failed_alert_threshold
            ));
        }

        HealthReport {
            status,
            connected: height.is_some(),
            entities,
            failed_events,
            issues,
            checked_at,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
