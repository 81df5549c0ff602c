//! Mapping operation errors onto `ErrorClass`.
//!
//! Operations fail with `anyhow::Error`. Classification tries, in order:
//!
//! 1. an explicit [`OperationFailure`] anywhere in the error chain,
//! 2. `std::io::Error` kinds (timeouts, refused/reset connections),
//! 3. message heuristics (HTTP status codes, "timed out", "rate limit", ...),
//! 4. `Unknown`.
//!
//! Callers can override this per operation via [`ClassifierRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use skillrun_core::{ErrorClass, OperationScope};

/// An operation error that already knows its class.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct OperationFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl OperationFailure {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::TransientApi, message)
    }

    pub fn evaluator(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::EvaluatorFailure, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::ValidationError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }
}

/// Maps an operation error to a failure class.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &anyhow::Error) -> ErrorClass;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&anyhow::Error) -> ErrorClass + Send + Sync,
{
    fn classify(&self, error: &anyhow::Error) -> ErrorClass {
        self(error)
    }
}

/// Built-in classifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "deadline exceeded"];
const VALIDATION_MARKERS: &[&str] = &[
    "validation",
    "invalid",
    "malformed",
    "bad request",
    "unprocessable",
    "schema",
];
const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "too many requests",
    "temporarily unavailable",
    "service unavailable",
    "overloaded",
    "connection reset",
    "connection refused",
    "connection closed",
    "bad gateway",
];
const EVALUATOR_WORDS: &[&str] = &["evaluator", "judge", "grader", "score"];

const TRANSIENT_STATUS: &[&str] = &["429", "500", "502", "503", "504", "529"];
const VALIDATION_STATUS: &[&str] = &["400", "422"];
const TIMEOUT_STATUS: &[&str] = &["408"];

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &anyhow::Error) -> ErrorClass {
        for cause in error.chain() {
            if let Some(failure) = cause.downcast_ref::<OperationFailure>() {
                return failure.class;
            }
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                use std::io::ErrorKind;
                match io.kind() {
                    ErrorKind::TimedOut => return ErrorClass::Timeout,
                    ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::Interrupted => return ErrorClass::TransientApi,
                    ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                        return ErrorClass::ValidationError;
                    }
                    _ => {}
                }
            }
        }

        classify_message(&format!("{error:#}"))
    }
}

/// Heuristic classification of a rendered error message.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    let has_marker = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));
    let has_status = |codes: &[&str]| {
        lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| codes.contains(&token))
    };
    // Identifiers such as `user_score` stay one word.
    let has_word = |words: &[&str]| {
        lower
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .any(|token| words.contains(&token))
    };

    if has_marker(TIMEOUT_MARKERS) || has_status(TIMEOUT_STATUS) {
        ErrorClass::Timeout
    } else if has_marker(TRANSIENT_MARKERS) || has_status(TRANSIENT_STATUS) {
        ErrorClass::TransientApi
    } else if has_marker(VALIDATION_MARKERS) || has_status(VALIDATION_STATUS) {
        ErrorClass::ValidationError
    } else if has_word(EVALUATOR_WORDS) {
        ErrorClass::EvaluatorFailure
    } else {
        ErrorClass::Unknown
    }
}

/// Per-operation classifier overrides.
///
/// Patterns are matched against `"{module_id}.{operation_name}"`: exact match
/// first, then `"prefix.*"`, then `"*"`, then the default classifier.
#[derive(Clone)]
pub struct ClassifierRegistry {
    overrides: HashMap<String, Arc<dyn ErrorClassifier>>,
    fallback: Arc<dyn ErrorClassifier>,
}

impl Default for ClassifierRegistry {
    fn default() -> Self {
        Self::new(DefaultClassifier)
    }
}

impl std::fmt::Debug for ClassifierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.overrides.keys().collect();
        patterns.sort();
        f.debug_struct("ClassifierRegistry")
            .field("patterns", &patterns)
            .finish_non_exhaustive()
    }
}

impl ClassifierRegistry {
    pub fn new(fallback: impl ErrorClassifier + 'static) -> Self {
        Self {
            overrides: HashMap::new(),
            fallback: Arc::new(fallback),
        }
    }

    /// Register a classifier for an operation pattern.
    pub fn register<C>(&mut self, pattern: impl Into<String>, classifier: C)
    where
        C: ErrorClassifier + 'static,
    {
        self.overrides.insert(pattern.into(), Arc::new(classifier));
    }

    pub fn with<C>(mut self, pattern: impl Into<String>, classifier: C) -> Self
    where
        C: ErrorClassifier + 'static,
    {
        self.register(pattern, classifier);
        self
    }

    /// Resolve the classifier for an operation.
    pub fn resolve(&self, scope: &OperationScope) -> &dyn ErrorClassifier {
        let name = format!("{}.{}", scope.module_id, scope.operation_name);

        if let Some(c) = self.overrides.get(&name) {
            return c.as_ref();
        }

        // Longest matching prefix wins so "a.b.*" beats "a.*".
        let prefixed = self
            .overrides
            .iter()
            .filter_map(|(pattern, c)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = name.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), c))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, c)) = prefixed {
            return c.as_ref();
        }

        match self.overrides.get("*") {
            Some(c) => c.as_ref(),
            None => self.fallback.as_ref(),
        }
    }

    pub fn classify(&self, scope: &OperationScope, error: &anyhow::Error) -> ErrorClass {
        self.resolve(scope).classify(error)
    }
}
