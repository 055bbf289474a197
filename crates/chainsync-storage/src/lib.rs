//! chainsync-storage — storage backends for the sync engine.
//!
//! Two backends behind the `chainsync-core` store traits:
//!
//! - [`MemoryStore`] (always available) — ephemeral, for tests and dry runs
//! - [`sqlite::SqliteStore`] (feature `sqlite`) — durable single-file storage

pub use chainsync_core::store::MemoryStore;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
