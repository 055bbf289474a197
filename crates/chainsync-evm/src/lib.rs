//! chainsync-evm — EVM JSON-RPC implementation of the ledger seam.

pub mod client;
pub mod kinds;

pub use client::{EvmLedgerClient, RawLog};
