//! Retry execution: per-class policies, error classification, backoff and the
//! idempotent executor that ties them to the cache.

pub mod classify;
pub mod executor;
pub mod policy;
pub mod sleep;

pub use classify::{ClassifierRegistry, DefaultClassifier, ErrorClassifier, OperationFailure};
pub use executor::{ExecutorError, Operation, RetryExecutor};
pub use policy::{RetryPolicy, RetryPolicyTable};
pub use sleep::{RecordingSleeper, Sleeper, ThreadSleeper};
