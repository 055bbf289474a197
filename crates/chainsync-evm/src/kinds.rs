//! Built-in event kind registry.
//!
//! A kind is a named event type with a known topic0 signature and argument
//! layout. The registry covers the ERC-20 events the engine materializes;
//! unknown topics are skipped by the client rather than treated as errors.

use serde_json::json;

use crate::client::RawLog;
use chainsync_core::error::SyncError;
use chainsync_core::types::LedgerEvent;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// keccak256("Approval(address,address,uint256)")
pub const APPROVAL_TOPIC: &str =
    "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925";

const KINDS: &[(&str, &str)] = &[
    ("Transfer", TRANSFER_TOPIC),
    ("Approval", APPROVAL_TOPIC),
];

/// Topic0 for a kind name, if the registry knows it.
pub fn topic_for(kind: &str) -> Option<&'static str> {
    KINDS
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, topic)| *topic)
}

/// Kind name for a topic0, if the registry knows it.
pub fn kind_for(topic: &str) -> Option<&'static str> {
    KINDS
        .iter()
        .find(|(_, t)| t.eq_ignore_ascii_case(topic))
        .map(|(name, _)| *name)
}

/// Topic0 filter values for a kind selection. An empty selection means
/// every kind the registry knows. An unknown name is a validation error:
/// silently dropping it would leave an empty topic filter, which providers
/// treat as match-anything.
pub fn topics_for(kinds: &[String]) -> Result<Vec<String>, SyncError> {
    if kinds.is_empty() {
        return Ok(KINDS.iter().map(|(_, topic)| topic.to_string()).collect());
    }
    kinds
        .iter()
        .map(|kind| {
            topic_for(kind)
                .map(str::to_string)
                .ok_or_else(|| SyncError::Validation(format!("unknown event kind {kind}")))
        })
        .collect()
}

/// Decode a raw log into a [`LedgerEvent`]. Returns `Ok(None)` for topics
/// the registry does not know or logs with too few topics for their layout;
/// malformed numeric fields are an error rather than a silent block-0 event.
pub fn decode_log(log: &RawLog) -> Result<Option<LedgerEvent>, SyncError> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    let Some(kind) = kind_for(topic0) else {
        return Ok(None);
    };
    // Transfer and Approval share the layout: two indexed addresses plus a
    // uint256 amount in the data word.
    if log.topics.len() < 3 {
        return Ok(None);
    }
    let (Some(from), Some(to)) = (
        address_from_topic(&log.topics[1]),
        address_from_topic(&log.topics[2]),
    ) else {
        return Ok(None);
    };
    let args = json!({
        "from": from,
        "to": to,
        "value": log.data.clone(),
    });
    Ok(Some(LedgerEvent {
        tx_hash: log.tx_hash.clone(),
        log_index: log.log_index_u32()?,
        block_number: log.block_number_u64()?,
        block_hash: log.block_hash.clone(),
        entity_address: log.address.to_ascii_lowercase(),
        kind: kind.to_string(),
        args,
    }))
}

/// An indexed address topic is a 32-byte word with the address in the low
/// 20 bytes.
fn address_from_topic(topic: &str) -> Option<String> {
    let hex = topic.strip_prefix("0x")?;
    if hex.len() != 64 {
        return None;
    }
    Some(format!("0x{}", hex[24..].to_ascii_lowercase()))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
