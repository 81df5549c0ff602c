//! Execution records returned to callers and kept as attempt history.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error_class::ErrorClass;
use crate::key::IdempotencyKey;

/// Record of a single execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-indexed attempt number within one invocation.
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
}

impl RetryAttempt {
    pub fn succeeded(attempt_number: u32, timestamp: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            attempt_number,
            timestamp,
            duration_ms: duration_ms(duration),
            success: true,
            error_class: None,
            error_message: None,
        }
    }

    pub fn failed(
        attempt_number: u32,
        timestamp: DateTime<Utc>,
        duration: Duration,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> Self {
        Self {
            attempt_number,
            timestamp,
            duration_ms: duration_ms(duration),
            success: false,
            error_class: Some(class),
            error_message: Some(message.into()),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Outcome of one `execute_with_retry` invocation.
///
/// Operation failures are reported here (`success == false`), never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<Value>,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub attempt_count: u32,
    /// Wall time of the invocation including backoff sleeps.
    pub total_duration_ms: u64,
    /// Served from a prior terminal entry without invoking the operation.
    pub cached: bool,
    /// This invocation's result became the system-of-record entry for the key.
    pub committed: bool,
    pub idempotency_key: IdempotencyKey,
    /// Attempts made by this invocation (the original attempts for cached results).
    #[serde(default)]
    pub attempts: Vec<RetryAttempt>,
}

impl ExecutionResult {
    pub fn success(
        key: IdempotencyKey,
        output: Value,
        attempts: Vec<RetryAttempt>,
        total: Duration,
    ) -> Self {
        Self {
            success: true,
            output: Some(output),
            error_class: None,
            error_message: None,
            attempt_count: attempts.len() as u32,
            total_duration_ms: duration_ms(total),
            cached: false,
            committed: false,
            idempotency_key: key,
            attempts,
        }
    }

    pub fn failure(
        key: IdempotencyKey,
        class: ErrorClass,
        message: impl Into<String>,
        attempts: Vec<RetryAttempt>,
        total: Duration,
    ) -> Self {
        Self {
            success: false,
            output: None,
            error_class: Some(class),
            error_message: Some(message.into()),
            attempt_count: attempts.len() as u32,
            total_duration_ms: duration_ms(total),
            cached: false,
            committed: false,
            idempotency_key: key,
            attempts,
        }
    }

    pub fn total_duration(&self) -> Duration {
        Duration::from_millis(self.total_duration_ms)
    }
}

pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
