//! Classification of operation failures.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Closed set of failure classes that drive retry behavior.
///
/// Classifiers are pluggable and may not recognise every failure a skill can
/// produce, so `Unknown` is always available as the fallback.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network failures, rate limits, 5xx responses.
    TransientApi,
    /// A downstream evaluator/judge rejected or failed to score the output.
    EvaluatorFailure,
    /// Malformed input; retrying cannot help.
    ValidationError,
    /// The operation exceeded its expected duration.
    Timeout,
    /// Unclassified failure.
    Unknown,
    /// Another executor holds the claim for this key (produced by the executor,
    /// never by classifiers).
    Conflict,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 6] = [
        ErrorClass::TransientApi,
        ErrorClass::EvaluatorFailure,
        ErrorClass::ValidationError,
        ErrorClass::Timeout,
        ErrorClass::Unknown,
        ErrorClass::Conflict,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientApi => "transient_api",
            ErrorClass::EvaluatorFailure => "evaluator_failure",
            ErrorClass::ValidationError => "validation_error",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Unknown => "unknown",
            ErrorClass::Conflict => "conflict",
        }
    }

    /// Whether the class can ever be retried, independent of policy.
    pub fn is_ever_retryable(&self) -> bool {
        !matches!(self, ErrorClass::ValidationError | ErrorClass::Conflict)
    }
}

impl core::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown error class: {s}")))
    }
}
