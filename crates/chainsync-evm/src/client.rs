//! EVM JSON-RPC ledger client.
//!
//! Implements [`LedgerClient`] over `eth_blockNumber`, `eth_getLogs`, and
//! `eth_getCode`. Deliberately single-shot: retries belong to the engine's
//! unit-of-work layer, so a request here either succeeds or surfaces its
//! error unchanged.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chainsync_core::error::SyncError;
use chainsync_core::ledger::LedgerClient;
use chainsync_core::types::LedgerEvent;

use crate::kinds;

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Result<u64, SyncError> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u32(&self) -> Result<u32, SyncError> {
        Ok(parse_hex_u64(&self.log_index)? as u32)
    }

    /// `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }
}

/// Parse a hex-encoded quantity (with or without `0x`) to u64. Malformed
/// input is an error — a quantity that silently became 0 would materialize
/// events at the wrong block and dedup position.
pub fn parse_hex_u64(s: &str) -> Result<u64, SyncError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|_| SyncError::Connectivity(format!("malformed hex quantity {s:?}")))
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

/// [`LedgerClient`] over an EVM JSON-RPC endpoint.
pub struct EvmLedgerClient {
    url: String,
    http: reqwest::Client,
}

impl EvmLedgerClient {
    pub fn new(url: impl Into<String>) -> Result<Self, SyncError> {
        Self::with_timeout(url, Duration::from_secs(30))
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Configuration(format!("cannot build http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, SyncError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::Connectivity(format!("{method}: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(SyncError::Connectivity(format!(
                "{method}: HTTP {status}: {text}"
            )));
        }

        let parsed: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Connectivity(format!("{method}: malformed response: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(SyncError::Connectivity(format!(
                "{method}: rpc error {}: {}",
                err.code, err.message
            )));
        }
        parsed
            .result
            .ok_or_else(|| SyncError::Connectivity(format!("{method}: response missing result")))
    }
}

#[async_trait]
impl LedgerClient for EvmLedgerClient {
    async fn current_height(&self) -> Result<u64, SyncError> {
        let result = self.rpc("eth_blockNumber", json!([])).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| SyncError::Connectivity("eth_blockNumber: non-string result".into()))?;
        parse_hex_u64(hex)
    }

    async fn events(
        &self,
        address: &str,
        event_kinds: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LedgerEvent>, SyncError> {
        if to_block < from_block {
            return Err(SyncError::InvalidRange {
                from: from_block,
                to: to_block,
                reason: "from exceeds to".into(),
            });
        }

        let topics = kinds::topics_for(event_kinds)?;
        let filter = json!([{
            "address": address,
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
            "topics": [topics],
        }]);

        let result = self.rpc("eth_getLogs", filter).await.map_err(|err| {
            // Providers signal an exceeded range cap as an rpc error; keep
            // that distinct so the caller can shrink the batch size.
            match &err {
                SyncError::Connectivity(msg)
                    if msg.to_ascii_lowercase().contains("range") =>
                {
                    SyncError::InvalidRange {
                        from: from_block,
                        to: to_block,
                        reason: msg.clone(),
                    }
                }
                _ => err,
            }
        })?;

        let logs: Vec<RawLog> = serde_json::from_value(result)
            .map_err(|e| SyncError::Connectivity(format!("eth_getLogs: malformed logs: {e}")))?;

        let mut events: Vec<LedgerEvent> = Vec::with_capacity(logs.len());
        for log in &logs {
            if log.is_removed() {
                continue;
            }
            if let Some(event) = kinds::decode_log(log)? {
                events.push(event);
            }
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));

        tracing::debug!(
            address,
            from_block,
            to_block,
            logs = logs.len(),
            decoded = events.len(),
            "fetched events"
        );
        Ok(events)
    }

    async fn validate_entity(&self, address: &str) -> Result<bool, SyncError> {
        let result = self.rpc("eth_getCode", json!([address, "latest"])).await?;
        let code = result
            .as_str()
            .ok_or_else(|| SyncError::Connectivity("eth_getCode: non-string result".into()))?;
        Ok(!code.is_empty() && code != "0x")
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1").unwrap(), 1);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert_eq!(parse_hex_u64("1234").unwrap(), 0x1234);
    }

    #[test]
    fn parse_hex_u64_rejects_malformed_input() {
        assert!(parse_hex_u64("0x").is_err());
        assert!(parse_hex_u64("0xzz").is_err());
        assert!(parse_hex_u64("").is_err());
    }

    #[test]
    fn raw_log_field_parsing() {
        let log = RawLog {
            address: "0x0".into(),
            topics: vec![],
            data: "0x".into(),
            block_number: "0x12a05f200".into(),
            block_hash: "0x0".into(),
            tx_hash: "0x0".into(),
            log_index: "0x5".into(),
            removed: None,
        };
        assert_eq!(log.block_number_u64().unwrap(), 5_000_000_000);
        assert_eq!(log.log_index_u32().unwrap(), 5);
        assert!(!log.is_removed());
    }

    #[test]
    fn raw_log_deserializes_camel_case() {
        let log: RawLog = serde_json::from_value(serde_json::json!({
            "address": "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
            "topics": [crate::kinds::TRANSFER_TOPIC],
            "data": "0x64",
            "blockNumber": "0x3e8",
            "blockHash": "0xabc",
            "transactionHash": "0xdef",
            "logIndex": "0x0",
            "removed": false
        }))
        .unwrap();
        assert_eq!(log.tx_hash, "0xdef");
        assert_eq!(log.block_number_u64().unwrap(), 1_000);
    }

    #[tokio::test]
    async fn unknown_kind_selection_fails_before_any_request() {
        let client = EvmLedgerClient::new("http://localhost:1").unwrap();
        let err = client
            .events("0xfeed", &["Swap".into()], 0, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn inverted_range_is_rejected_locally() {
        let client = EvmLedgerClient::new("http://localhost:1").unwrap();
        let err = client.events("0xfeed", &[], 100, 50).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidRange { from: 100, to: 50, .. }));
    }
}
