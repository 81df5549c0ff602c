//! Idempotency cache storage.
//!
//! Defines the storage boundary for cache entries (one row per idempotency
//! key) and two implementations: an in-memory map for tests/dev and a SQLite
//! (WAL) store shared by threads and processes.

pub mod in_memory;
pub mod sqlite;
pub mod r#trait;

pub use in_memory::InMemoryCacheStore;
pub use r#trait::{
    CacheEntry, CacheStats, CacheStore, ClaimOutcome, ClaimRequest, CommitOutcome, EntryStatus,
    StoreError, TerminalOutcome, TerminalRecord,
};
pub use sqlite::SqliteCacheStore;
