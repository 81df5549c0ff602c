//! `skillrun-core` — data model of the idempotent retry-execution core.
//!
//! This crate contains **pure** primitives (no storage or runtime concerns):
//! identifiers, idempotency keys, failure classes and execution records.

pub mod canonical;
pub mod error;
pub mod error_class;
pub mod execution;
pub mod id;
pub mod key;

pub use canonical::canonicalize;
pub use error::{DomainError, DomainResult};
pub use error_class::ErrorClass;
pub use execution::{ExecutionResult, RetryAttempt};
pub use id::{ModuleId, OperationName, OperationScope, OwnerToken, TenantId};
pub use key::IdempotencyKey;
