use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use skillrun_core::{
    ErrorClass, ExecutionResult, IdempotencyKey, OperationScope, OwnerToken, RetryAttempt,
};

/// Lifecycle state of a cache entry.
///
/// `Pending` → (`Succeeded` | `Failed`), exactly once. Terminal entries are
/// immutable until they expire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Claimed; an executor is (or was) running the operation.
    Pending,
    Succeeded,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Succeeded => "succeeded",
            EntryStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(EntryStatus::Pending),
            "succeeded" => Some(EntryStatus::Succeeded),
            "failed" => Some(EntryStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EntryStatus::Pending)
    }
}

/// One row of the idempotency cache.
///
/// For `Pending` entries `expires_at` is the claim deadline; for terminal
/// entries it is the cache TTL deadline. Either way an entry at or past
/// `expires_at` is treated as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: IdempotencyKey,
    pub scope: OperationScope,
    pub status: EntryStatus,

    /// Present only when `Succeeded`.
    pub output: Option<JsonValue>,
    /// Present only when `Failed`.
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,

    pub attempt_count: u32,
    pub total_duration_ms: u64,
    /// Attempts of the invocation that produced the terminal state.
    pub attempts: Vec<RetryAttempt>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub owner_token: OwnerToken,
}

impl CacheEntry {
    /// A fresh claim on `request.key`.
    pub fn pending(request: &ClaimRequest, now: DateTime<Utc>) -> Self {
        Self {
            key: request.key.clone(),
            scope: request.scope.clone(),
            status: EntryStatus::Pending,
            output: None,
            error_class: None,
            error_message: None,
            attempt_count: 1,
            total_duration_ms: 0,
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
            expires_at: deadline(now, request.claim_ttl),
            owner_token: request.owner,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Apply a terminal record in place.
    pub fn apply_terminal(&mut self, record: TerminalRecord, now: DateTime<Utc>) {
        match record.outcome {
            TerminalOutcome::Succeeded { output } => {
                self.status = EntryStatus::Succeeded;
                self.output = Some(output);
                self.error_class = None;
                self.error_message = None;
            }
            TerminalOutcome::Failed { class, message } => {
                self.status = EntryStatus::Failed;
                self.output = None;
                self.error_class = Some(class);
                self.error_message = Some(message);
            }
        }
        self.attempt_count = record.attempt_count.max(1);
        self.total_duration_ms = record.total_duration_ms;
        self.attempts = record.attempts;
        self.updated_at = now;
        self.expires_at = record.expires_at;
    }

    /// Rebuild the caller-facing result of a terminal entry, flagged as cached.
    pub fn to_cached_result(&self) -> ExecutionResult {
        ExecutionResult {
            success: self.status == EntryStatus::Succeeded,
            output: self.output.clone(),
            error_class: self.error_class,
            error_message: self.error_message.clone(),
            attempt_count: self.attempt_count,
            total_duration_ms: self.total_duration_ms,
            cached: true,
            committed: false,
            idempotency_key: self.key.clone(),
            attempts: self.attempts.clone(),
        }
    }
}

/// Saturating `now + ttl`.
pub fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Request to claim a key for execution.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub key: IdempotencyKey,
    pub scope: OperationScope,
    pub owner: OwnerToken,
    pub claim_ttl: Duration,
}

/// Result of a claim attempt. Exactly one concurrent claimant observes `Claimed`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now owns the key; the entry is the freshly written claim.
    Claimed(CacheEntry),
    /// A live claim by another owner exists.
    AlreadyPending(CacheEntry),
    /// A live terminal entry exists.
    AlreadyTerminal(CacheEntry),
}

/// Terminal payload written by `commit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminalOutcome {
    Succeeded { output: JsonValue },
    Failed { class: ErrorClass, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminalRecord {
    pub outcome: TerminalOutcome,
    pub attempt_count: u32,
    pub total_duration_ms: u64,
    pub attempts: Vec<RetryAttempt>,
    pub expires_at: DateTime<Utc>,
}

impl TerminalRecord {
    pub fn status(&self) -> EntryStatus {
        match self.outcome {
            TerminalOutcome::Succeeded { .. } => EntryStatus::Succeeded,
            TerminalOutcome::Failed { .. } => EntryStatus::Failed,
        }
    }
}

/// Result of a commit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The entry is no longer a pending claim held by the committing owner
    /// (reclaimed, purged, or already terminal). Nothing was written.
    StaleOwner,
}

/// Snapshot counts for operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub pending: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Rows past `expires_at` that have not been purged yet (any status).
    pub expired: u64,
}

/// Cache store error.
///
/// These are coordination-layer failures, kept apart from operation failures
/// so callers never confuse "my work failed" with "the store is broken".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("cache store pool exhausted (waited {0:?})")]
    PoolExhausted(Duration),

    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("cache store io error: {0}")]
    Io(String),

    #[error("cache store lock poisoned")]
    LockPoisoned,
}

/// Durable, concurrency-safe storage for cache entries.
///
/// ## Implementation Requirements
///
/// - `try_claim` is a single atomic conditional write: insert if absent, or
///   overwrite if the existing entry has expired. Among concurrent claimants for
///   one key exactly one observes `Claimed`.
/// - `commit` writes only if the entry is still `Pending` and owned by `owner`;
///   otherwise it returns `StaleOwner` and leaves the entry untouched.
/// - `get` returns `None` for absent or expired entries and never blocks other
///   readers.
/// - `purge_expired` is best-effort and safe to run alongside everything else.
pub trait CacheStore: Send + Sync {
    fn get(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, StoreError>;

    fn try_claim(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError>;

    fn commit(
        &self,
        key: &IdempotencyKey,
        owner: OwnerToken,
        record: TerminalRecord,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError>;

    /// Delete entries at or past `expires_at`; returns how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Remove one entry regardless of its state; returns whether it existed.
    fn invalidate(&self, key: &IdempotencyKey) -> Result<bool, StoreError>;

    fn stats(&self, now: DateTime<Utc>) -> Result<CacheStats, StoreError>;
}

impl<S> CacheStore for Arc<S>
where
    S: CacheStore + ?Sized,
{
    fn get(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, StoreError> {
        (**self).get(key, now)
    }

    fn try_claim(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        (**self).try_claim(request, now)
    }

    fn commit(
        &self,
        key: &IdempotencyKey,
        owner: OwnerToken,
        record: TerminalRecord,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError> {
        (**self).commit(key, owner, record, now)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).purge_expired(now)
    }

    fn invalidate(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        (**self).invalidate(key)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<CacheStats, StoreError> {
        (**self).stats(now)
    }
}
