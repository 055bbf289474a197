//! Engine configuration.
//!
//! Loaded once at startup and treated as immutable for the life of the
//! process. Entities are looked up case-insensitively by address, but the
//! engine works with lowercased addresses internally.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::retry::RetryConfig;

/// A contract whose events should be kept in sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEntity {
    /// Contract address (`0x…`).
    pub address: String,
    /// Numeric chain id (1 = Ethereum mainnet, 8453 = Base, …).
    pub chain_id: u64,
    /// First block to sync from. `None` = current height at first start.
    #[serde(default)]
    pub start_block: Option<u64>,
    /// Event kinds to pull (e.g. `"Transfer"`). Empty = all known kinds.
    #[serde(default)]
    pub event_kinds: Vec<String>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

impl TrackedEntity {
    /// Copy of this entity with the address lowercased — the canonical
    /// form used for progress keys and job payloads.
    pub fn normalized(&self) -> TrackedEntity {
        TrackedEntity {
            address: self.address.to_ascii_lowercase(),
            ..self.clone()
        }
    }
}

/// Top-level sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Ledger JSON-RPC endpoint.
    #[serde(default)]
    pub rpc_url: String,
    /// SQLite database path. `None` = in-memory storage.
    #[serde(default)]
    pub database_path: Option<String>,
    /// Entities to keep in sync.
    #[serde(default)]
    pub entities: Vec<TrackedEntity>,
    /// Maximum blocks per ledger range query.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Poll cadence once an entity is caught up (seconds).
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Delay before startup recovery begins (seconds).
    #[serde(default = "default_recovery_grace_secs")]
    pub recovery_grace_secs: u64,
    /// Upper bound on the shutdown drain wait (seconds).
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Number of queue worker tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts per unit of work before it is allowed to fail the run.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between unit retries (seconds), doubled per attempt.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Sync lag (blocks) beyond which health degrades.
    #[serde(default = "default_lag_alert_threshold")]
    pub lag_alert_threshold: u64,
    /// Failed-event count beyond which health degrades.
    #[serde(default = "default_failed_alert_threshold")]
    pub failed_alert_threshold: u64,
}

fn default_batch_size() -> u64 { 1_000 }
fn default_monitor_interval_secs() -> u64 { 30 }
fn default_recovery_grace_secs() -> u64 { 5 }
fn default_drain_timeout_secs() -> u64 { 30 }
fn default_workers() -> usize { 4 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_backoff_secs() -> u64 { 5 }
fn default_lag_alert_threshold() -> u64 { 1_000 }
fn default_failed_alert_threshold() -> u64 { 100 }
fn bool_true() -> bool { true }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            database_path: None,
            entities: vec![],
            batch_size: default_batch_size(),
            monitor_interval_secs: default_monitor_interval_secs(),
            recovery_grace_secs: default_recovery_grace_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            lag_alert_threshold: default_lag_alert_threshold(),
            failed_alert_threshold: default_failed_alert_threshold(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &str) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Configuration(format!("cannot read {path}: {e}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| SyncError::Configuration(format!("cannot parse {path}: {e}")))
    }

    /// Look up a configured entity by address, case-insensitively.
    pub fn entity(&self, address: &str) -> Option<&TrackedEntity> {
        self.entities
            .iter()
            .find(|e| e.address.eq_ignore_ascii_case(address))
    }

    /// All enabled entities.
    pub fn enabled_entities(&self) -> Vec<&TrackedEntity> {
        self.entities.iter().filter(|e| e.enabled).collect()
    }

    /// Unit-of-work retry configuration derived from this config.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_secs(self.retry_backoff_secs),
            ..RetryConfig::default()
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let cfg: SyncConfig = serde_json::from_str(
            r#"{
                "rpc_url": "http://localhost:8545",
                "entities": [
                    { "address": "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", "chain_id": 1 }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.batch_size, 1_000);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.retry_backoff_secs, 5);
        assert_eq!(cfg.lag_alert_threshold, 1_000);
        assert!(cfg.database_path.is_none());
        assert!(cfg.entities[0].enabled);
        assert!(cfg.entities[0].start_block.is_none());
        assert!(cfg.entities[0].event_kinds.is_empty());
    }

    #[test]
    fn entity_lookup_is_case_insensitive() {
        let cfg = SyncConfig {
            entities: vec![TrackedEntity {
                address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".into(),
                chain_id: 1,
                start_block: Some(100),
                event_kinds: vec!["Transfer".into()],
                enabled: true,
            }],
            ..Default::default()
        };

        assert!(cfg.entity("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48").is_some());
        assert!(cfg.entity("0x0000000000000000000000000000000000000000").is_none());
    }

    #[test]
    fn normalized_entity_lowercases_address() {
        let e = TrackedEntity {
            address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".into(),
            chain_id: 1,
            start_block: None,
            event_kinds: vec![],
            enabled: true,
        };
        assert_eq!(
            e.normalized().address,
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
        );
        assert_eq!(e.normalized().chain_id, 1);
    }

    #[test]
    fn enabled_entities_skips_disabled() {
        let cfg = SyncConfig {
            entities: vec![
                TrackedEntity {
                    address: "0x1111111111111111111111111111111111111111".into(),
                    chain_id: 1,
                    start_block: None,
                    event_kinds: vec![],
                    enabled: true,
                },
                TrackedEntity {
                    address: "0x2222222222222222222222222222222222222222".into(),
                    chain_id: 1,
                    start_block: None,
                    event_kinds: vec![],
                    enabled: false,
                },
            ],
            ..Default::default()
        };
        assert_eq!(cfg.enabled_entities().len(), 1);
    }
}
