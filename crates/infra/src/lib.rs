//! Infrastructure layer: cache storage, idempotency protocol, retry execution
//! and configuration.

pub mod cache_store;
pub mod config;
pub mod idempotency;
pub mod retry;


pub use cache_store::{CacheStore, InMemoryCacheStore, SqliteCacheStore, StoreError};
pub use config::{CacheConfig, ConflictMode, IdempotencyConfig, SkillrunConfig};
pub use idempotency::{CacheDecision, IdempotencyManager};
pub use retry::{ExecutorError, Operation, RetryExecutor};
