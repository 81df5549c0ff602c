//! Idempotency manager.
//!
//! Turns an invocation identity into an `IdempotencyKey` and runs the
//! claim → execute → commit protocol against a `CacheStore`.

pub mod manager;

pub use manager::{CacheDecision, IdempotencyManager};
