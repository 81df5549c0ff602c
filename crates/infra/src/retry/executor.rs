//! Retry executor: cache check, claim, execute with classified retries, commit.
//!
//! ```text
//! START → CACHE_CHECK → { RETURN_CACHED | CLAIM }
//! CLAIM → { EXECUTE | WAIT_OR_FAIL }
//! EXECUTE → { SUCCESS_TERMINAL | CLASSIFY_FAILURE }
//! CLASSIFY_FAILURE → { RETRY (after backoff) | FAILURE_TERMINAL }
//! SUCCESS_TERMINAL / FAILURE_TERMINAL → COMMIT → RETURN
//! ```
//!
//! Operation failures never escape as errors; they come back as
//! `ExecutionResult { success: false, .. }`. `ExecutorError` is reserved for
//! bad identities and cache store failures. A panicking operation counts as
//! an `unknown` failure so its claim is still committed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use skillrun_core::{
    DomainError, ErrorClass, ExecutionResult, IdempotencyKey, OperationScope, OwnerToken,
    RetryAttempt, execution::duration_ms,
};

use super::classify::{ClassifierRegistry, ErrorClassifier};
use super::policy::RetryPolicyTable;
use super::sleep::{Sleeper, ThreadSleeper};
use crate::cache_store::{CacheStore, CommitOutcome, StoreError};
use crate::config::{ConflictMode, SkillrunConfig};
use crate::idempotency::{CacheDecision, IdempotencyManager};

/// A unit of work run under the executor.
pub trait Operation: Send + Sync {
    fn run(&self, input: &JsonValue) -> anyhow::Result<JsonValue>;
}

impl<F> Operation for F
where
    F: Fn(&JsonValue) -> anyhow::Result<JsonValue> + Send + Sync,
{
    fn run(&self, input: &JsonValue) -> anyhow::Result<JsonValue> {
        self(input)
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid operation identity: {0}")]
    InvalidIdentity(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The operation ran to a terminal result but it could not be persisted.
    /// The result is carried so the caller does not lose it.
    #[error("failed to commit terminal result: {source}")]
    CommitFailed {
        result: Box<ExecutionResult>,
        #[source]
        source: StoreError,
    },
}

enum Acquired {
    Owner(OwnerToken),
    Done(ExecutionResult),
}

/// Idempotent retry executor.
pub struct RetryExecutor<S: CacheStore> {
    manager: IdempotencyManager<S>,
    policies: RetryPolicyTable,
    classifiers: ClassifierRegistry,
    conflict: ConflictMode,
    slow_attempt_threshold: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
}

impl<S: CacheStore> std::fmt::Debug for RetryExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policies", &self.policies)
            .field("classifiers", &self.classifiers)
            .field("conflict", &self.conflict)
            .field("slow_attempt_threshold", &self.slow_attempt_threshold)
            .finish_non_exhaustive()
    }
}

impl<S: CacheStore> RetryExecutor<S> {
    pub fn new(store: S, config: &SkillrunConfig) -> Self {
        Self {
            manager: IdempotencyManager::new(store, config.idempotency.clone()),
            policies: config.retry.clone(),
            classifiers: ClassifierRegistry::default(),
            conflict: config.conflict.clone(),
            slow_attempt_threshold: config.slow_attempt_threshold(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_policies(mut self, policies: RetryPolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_classifiers(mut self, classifiers: ClassifierRegistry) -> Self {
        self.classifiers = classifiers;
        self
    }

    pub fn with_conflict_mode(mut self, conflict: ConflictMode) -> Self {
        self.conflict = conflict;
        self
    }

    /// Override classification for operations matching `pattern`
    /// (`"module.operation"`, `"module.*"` or `"*"`).
    pub fn register_classifier<C>(&mut self, pattern: impl Into<String>, classifier: C)
    where
        C: ErrorClassifier + 'static,
    {
        self.classifiers.register(pattern, classifier);
    }

    pub fn manager(&self) -> &IdempotencyManager<S> {
        &self.manager
    }

    pub fn policies(&self) -> &RetryPolicyTable {
        &self.policies
    }

    /// Run `operation` at most once per identity, retrying classified failures.
    pub fn execute_with_retry<O>(
        &self,
        operation: &O,
        tenant_id: &str,
        module_id: &str,
        operation_name: &str,
        input: &JsonValue,
    ) -> Result<ExecutionResult, ExecutorError>
    where
        O: Operation + ?Sized,
    {
        let scope = OperationScope::parse(tenant_id, module_id, operation_name)?;
        self.execute_scoped(operation, &scope, input)
    }

    /// `execute_with_retry` for an already-validated scope.
    #[instrument(skip_all, fields(scope = %scope))]
    pub fn execute_scoped<O>(
        &self,
        operation: &O,
        scope: &OperationScope,
        input: &JsonValue,
    ) -> Result<ExecutionResult, ExecutorError>
    where
        O: Operation + ?Sized,
    {
        let started = Instant::now();
        let key = self.manager.compute_key(scope, input)?;

        let owner = match self.acquire(&key, scope, started)? {
            Acquired::Owner(owner) => owner,
            Acquired::Done(result) => return Ok(result),
        };

        let mut result = self.run_attempts(operation, scope, &key, input, started);

        match self.manager.finish(&key, owner, &result) {
            Ok(CommitOutcome::Committed) => result.committed = true,
            Ok(CommitOutcome::StaleOwner) => result.committed = false,
            Err(source) => {
                error!(
                    idempotency_key = %key,
                    success = result.success,
                    error = %source,
                    "failed to commit terminal result"
                );
                return Err(ExecutorError::CommitFailed {
                    result: Box::new(result),
                    source,
                });
            }
        }

        Ok(result)
    }

    /// CACHE_CHECK / CLAIM / WAIT_OR_FAIL.
    fn acquire(
        &self,
        key: &IdempotencyKey,
        scope: &OperationScope,
        started: Instant,
    ) -> Result<Acquired, StoreError> {
        let claim_ttl = self.manager.config().claim_ttl();
        let mut waited = Duration::ZERO;
        let mut polls: u32 = 0;

        loop {
            let (holder, claim_expires_at) = match self.manager.begin(key, scope, claim_ttl)? {
                CacheDecision::Proceed(owner) => return Ok(Acquired::Owner(owner)),
                CacheDecision::UseCached(result) => return Ok(Acquired::Done(result)),
                CacheDecision::WaitOrConflict {
                    holder,
                    claim_expires_at,
                } => (holder, claim_expires_at),
            };

            let (poll_interval, max_poll_interval, max_wait) = match self.conflict {
                ConflictMode::FailFast => {
                    return Ok(Acquired::Done(conflict_result(key, holder, started)));
                }
                ConflictMode::Wait {
                    poll_interval_ms,
                    max_poll_interval_ms,
                    max_wait_ms,
                } => (
                    Duration::from_millis(poll_interval_ms.max(1)),
                    Duration::from_millis(max_poll_interval_ms.max(poll_interval_ms).max(1)),
                    Duration::from_millis(max_wait_ms),
                ),
            };

            if waited >= max_wait {
                info!(
                    idempotency_key = %key,
                    holder = %holder,
                    waited_ms = duration_ms(waited),
                    "gave up waiting for claim holder"
                );
                return Ok(Acquired::Done(conflict_result(key, holder, started)));
            }

            // Poll no later than just past the holder's claim deadline so a
            // crashed holder is reclaimed promptly.
            let backoff = poll_interval
                .saturating_mul(2u32.saturating_pow(polls.min(16)))
                .min(max_poll_interval);
            let until_expiry = (claim_expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                + Duration::from_millis(1);
            let delay = backoff
                .min(until_expiry.max(poll_interval))
                .min(max_wait - waited);

            debug!(
                idempotency_key = %key,
                holder = %holder,
                delay_ms = duration_ms(delay),
                "waiting for claim holder"
            );
            self.sleeper.sleep(delay);
            waited += delay;
            polls = polls.saturating_add(1);
        }
    }

    /// EXECUTE / CLASSIFY_FAILURE / RETRY until a terminal result.
    fn run_attempts<O>(
        &self,
        operation: &O,
        scope: &OperationScope,
        key: &IdempotencyKey,
        input: &JsonValue,
        started: Instant,
    ) -> ExecutionResult
    where
        O: Operation + ?Sized,
    {
        let mut attempts = Vec::new();
        let mut attempt: u32 = 1;

        loop {
            let attempted_at = Utc::now();
            let attempt_started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| operation.run(input)));
            let elapsed = attempt_started.elapsed();

            let (error, class) = match outcome {
                Ok(Ok(output)) => {
                    attempts.push(RetryAttempt::succeeded(attempt, attempted_at, elapsed));
                    debug!(idempotency_key = %key, attempt, "operation succeeded");
                    return ExecutionResult::success(
                        key.clone(),
                        output,
                        attempts,
                        started.elapsed(),
                    );
                }
                Ok(Err(error)) => {
                    let class = self.classify(scope, &error, elapsed);
                    (error, class)
                }
                Err(payload) => {
                    let error = anyhow::anyhow!(
                        "operation panicked: {}",
                        panic_message(payload.as_ref())
                    );
                    error!(idempotency_key = %key, attempt, error = %error, "operation panicked");
                    (error, ErrorClass::Unknown)
                }
            };

            let message = format!("{error:#}");
            attempts.push(RetryAttempt::failed(
                attempt,
                attempted_at,
                elapsed,
                class,
                message.clone(),
            ));

            let policy = self.policies.policy_for(class);
            let next = attempt.saturating_add(1);
            if !policy.allows_attempt(next) {
                warn!(
                    idempotency_key = %key,
                    attempt,
                    error_class = %class,
                    error = %message,
                    "operation failed terminally"
                );
                return ExecutionResult::failure(
                    key.clone(),
                    class,
                    message,
                    attempts,
                    started.elapsed(),
                );
            }

            let delay = policy.delay_before_attempt(next);
            warn!(
                idempotency_key = %key,
                attempt,
                next_attempt = next,
                error_class = %class,
                delay_ms = duration_ms(delay),
                error = %message,
                "retry scheduled"
            );
            self.sleeper.sleep(delay);
            attempt = next;
        }
    }

    fn classify(
        &self,
        scope: &OperationScope,
        error: &anyhow::Error,
        elapsed: Duration,
    ) -> ErrorClass {
        let class = self.classifiers.classify(scope, error);
        match self.slow_attempt_threshold {
            Some(threshold) if class == ErrorClass::Unknown && elapsed > threshold => {
                ErrorClass::Timeout
            }
            _ => class,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

fn conflict_result(key: &IdempotencyKey, holder: OwnerToken, started: Instant) -> ExecutionResult {
    ExecutionResult::failure(
        key.clone(),
        ErrorClass::Conflict,
        format!("idempotency key {} is claimed by {holder}", key.short()),
        Vec::new(),
        started.elapsed(),
    )
}
