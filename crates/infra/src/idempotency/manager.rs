use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use skillrun_core::{
    DomainResult, ErrorClass, ExecutionResult, IdempotencyKey, OperationScope, OwnerToken,
};

use crate::cache_store::r#trait::deadline;
use crate::cache_store::{
    CacheStats, CacheStore, ClaimOutcome, ClaimRequest, CommitOutcome, StoreError, TerminalOutcome,
    TerminalRecord,
};
use crate::config::IdempotencyConfig;

/// What `begin` tells the caller to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    /// A live terminal entry exists; return it without executing.
    UseCached(ExecutionResult),
    /// The claim is ours; execute, then call `finish` with this token.
    Proceed(OwnerToken),
    /// Another owner holds a live claim.
    WaitOrConflict {
        holder: OwnerToken,
        claim_expires_at: DateTime<Utc>,
    },
}

/// Idempotency manager: key derivation plus the claim/commit protocol over a
/// `CacheStore`.
#[derive(Debug, Clone)]
pub struct IdempotencyManager<S: CacheStore> {
    store: S,
    config: IdempotencyConfig,
}

impl<S: CacheStore> IdempotencyManager<S> {
    pub fn new(store: S, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Derive the key for one invocation identity.
    pub fn compute_key(
        &self,
        scope: &OperationScope,
        input: &JsonValue,
    ) -> DomainResult<IdempotencyKey> {
        IdempotencyKey::derive(scope, input)
    }

    /// Check the cache and try to claim `key` for `claim_ttl`.
    ///
    /// A live terminal entry is answered from a plain read, so cache hits
    /// never take the store's write lock. Only absent, expired or pending
    /// entries go on to the claim.
    pub fn begin(
        &self,
        key: &IdempotencyKey,
        scope: &OperationScope,
        claim_ttl: Duration,
    ) -> Result<CacheDecision, StoreError> {
        if let Some(entry) = self.store.get(key, Utc::now())? {
            if entry.status.is_terminal() {
                debug!(
                    idempotency_key = %key,
                    status = entry.status.as_str(),
                    "cache hit"
                );
                return Ok(CacheDecision::UseCached(entry.to_cached_result()));
            }
        }

        let owner = OwnerToken::new();
        let request = ClaimRequest {
            key: key.clone(),
            scope: scope.clone(),
            owner,
            claim_ttl,
        };

        match self.store.try_claim(&request, Utc::now())? {
            ClaimOutcome::Claimed(_) => {
                debug!(idempotency_key = %key, owner = %owner, "claim acquired");
                Ok(CacheDecision::Proceed(owner))
            }
            // Committed between our read and the claim.
            ClaimOutcome::AlreadyTerminal(entry) => {
                debug!(
                    idempotency_key = %key,
                    status = entry.status.as_str(),
                    "cache hit after claim race"
                );
                Ok(CacheDecision::UseCached(entry.to_cached_result()))
            }
            ClaimOutcome::AlreadyPending(entry) => {
                info!(
                    idempotency_key = %key,
                    holder = %entry.owner_token,
                    claim_expires_at = %entry.expires_at,
                    "claim held by another executor"
                );
                Ok(CacheDecision::WaitOrConflict {
                    holder: entry.owner_token,
                    claim_expires_at: entry.expires_at,
                })
            }
        }
    }

    /// Persist the terminal result of an owned claim.
    ///
    /// `StaleOwner` is logged and returned, never raised: the caller still
    /// has its result, it just isn't the system of record.
    pub fn finish(
        &self,
        key: &IdempotencyKey,
        owner: OwnerToken,
        result: &ExecutionResult,
    ) -> Result<CommitOutcome, StoreError> {
        let now = Utc::now();
        let (outcome, ttl) = if result.success {
            (
                TerminalOutcome::Succeeded {
                    output: result.output.clone().unwrap_or(JsonValue::Null),
                },
                self.config.success_ttl(),
            )
        } else {
            (
                TerminalOutcome::Failed {
                    class: result.error_class.unwrap_or(ErrorClass::Unknown),
                    message: result.error_message.clone().unwrap_or_default(),
                },
                self.config.failure_ttl(),
            )
        };

        let record = TerminalRecord {
            outcome,
            attempt_count: result.attempt_count,
            total_duration_ms: result.total_duration_ms,
            attempts: result.attempts.clone(),
            expires_at: deadline(now, ttl),
        };

        let outcome = self.store.commit(key, owner, record, now)?;
        if outcome == CommitOutcome::StaleOwner {
            warn!(
                idempotency_key = %key,
                owner = %owner,
                success = result.success,
                "commit rejected: claim was reclaimed by another owner"
            );
        }
        Ok(outcome)
    }

    /// Live terminal result for `key`, if any.
    pub fn lookup(&self, key: &IdempotencyKey) -> Result<Option<ExecutionResult>, StoreError> {
        Ok(self
            .store
            .get(key, Utc::now())?
            .filter(|entry| entry.status.is_terminal())
            .map(|entry| entry.to_cached_result()))
    }

    pub fn purge_expired(&self) -> Result<u64, StoreError> {
        let removed = self.store.purge_expired(Utc::now())?;
        if removed > 0 {
            info!(removed, "purged expired cache entries");
        }
        Ok(removed)
    }

    pub fn invalidate(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        let removed = self.store.invalidate(key)?;
        info!(idempotency_key = %key, removed, "invalidated cache entry");
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats, StoreError> {
        self.store.stats(Utc::now())
    }
}
