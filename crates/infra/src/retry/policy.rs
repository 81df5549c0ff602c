//! Retry policies and the per-error-class policy table.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use skillrun_core::ErrorClass;

use crate::config::millis;

/// Retry behavior for one error class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first (1 = never retry).
    pub max_attempts: u32,
    #[serde(with = "millis", rename = "base_delay_ms")]
    pub base_delay: Duration,
    #[serde(with = "millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Uniform ± perturbation applied to each delay (0.0-1.0).
    pub jitter_fraction: f64,
    pub retryable: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(2, Duration::from_secs(1), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_fraction: 0.0,
            retryable: false,
        }
    }

    /// Exponential backoff (x2) with 20% jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.2,
            retryable: true,
        }
    }

    pub fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction;
        self
    }

    pub fn with_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    /// Whether attempt number `next_attempt` (1-indexed) may run under this policy.
    pub fn allows_attempt(&self, next_attempt: u32) -> bool {
        next_attempt <= 1 || (self.retryable && next_attempt <= self.max_attempts)
    }

    /// Un-jittered delay before attempt `attempt` (1-indexed).
    ///
    /// `min(max_delay, base_delay * backoff_multiplier^(attempt - 2))` for
    /// `attempt > 1`; zero for the first attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = (attempt - 2).min(62) as i32;
        let delay_ms = (base_ms * self.backoff_multiplier.max(0.0).powi(exp)).min(max_ms);

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Delay before `attempt`, perturbed by ± `jitter_fraction` drawn from `rng`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.backoff_delay(attempt);
        let fraction = self.jitter_fraction.clamp(0.0, 1.0);
        let range_ms = delay.as_millis() as f64 * fraction;
        if range_ms <= 0.0 {
            return delay;
        }

        let offset = rng.random_range(-range_ms..=range_ms);
        Duration::from_millis((delay.as_millis() as f64 + offset).max(0.0) as u64)
    }

    /// Delay before `attempt` using the thread-local RNG.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        self.jittered_delay(attempt, &mut rand::rng())
    }
}

/// Static mapping from error class to retry policy.
///
/// Deserializes from a (possibly partial) map of class → policy; classes not
/// mentioned keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<ErrorClass, RetryPolicy>", into = "BTreeMap<ErrorClass, RetryPolicy>")]
pub struct RetryPolicyTable {
    policies: BTreeMap<ErrorClass, RetryPolicy>,
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(
            ErrorClass::TransientApi,
            RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(60)),
        );
        policies.insert(
            ErrorClass::EvaluatorFailure,
            RetryPolicy::exponential(2, Duration::from_secs(2), Duration::from_secs(30)),
        );
        policies.insert(ErrorClass::ValidationError, RetryPolicy::no_retry());
        policies.insert(
            ErrorClass::Timeout,
            RetryPolicy::exponential(3, Duration::from_secs(2), Duration::from_secs(60)),
        );
        policies.insert(ErrorClass::Unknown, RetryPolicy::default());
        policies.insert(ErrorClass::Conflict, RetryPolicy::no_retry());
        Self { policies }
    }
}

impl From<BTreeMap<ErrorClass, RetryPolicy>> for RetryPolicyTable {
    fn from(overrides: BTreeMap<ErrorClass, RetryPolicy>) -> Self {
        let mut table = Self::default();
        table.policies.extend(overrides);
        table
    }
}

impl From<RetryPolicyTable> for BTreeMap<ErrorClass, RetryPolicy> {
    fn from(table: RetryPolicyTable) -> Self {
        table.policies
    }
}

impl RetryPolicyTable {
    /// Replace the policy for one class.
    pub fn with_policy(mut self, class: ErrorClass, policy: RetryPolicy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    /// Policy for `class`; classes without an entry use the `Unknown` policy.
    ///
    /// `ValidationError` is reported as non-retryable whatever the table says.
    pub fn policy_for(&self, class: ErrorClass) -> RetryPolicy {
        let policy = self
            .policies
            .get(&class)
            .or_else(|| self.policies.get(&ErrorClass::Unknown))
            .cloned()
            .unwrap_or_default();

        if class.is_ever_retryable() {
            policy
        } else {
            RetryPolicy {
                retryable: false,
                ..policy
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ErrorClass, &RetryPolicy)> {
        self.policies.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn exponential_backoff_starts_at_base_for_second_attempt() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter(0.0);

        assert_eq!(policy.backoff_delay(1), Duration::ZERO);
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(400));
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let policy =
            RetryPolicy::exponential(20, Duration::from_secs(1), Duration::from_secs(5)).with_jitter(0.0);
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(200), Duration::from_secs(5));
    }

    #[test]
    fn allows_attempt_respects_max_and_retryable() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(1));
        assert!(policy.allows_attempt(1));
        assert!(policy.allows_attempt(3));
        assert!(!policy.allows_attempt(4));

        let never = RetryPolicy::no_retry();
        assert!(never.allows_attempt(1));
        assert!(!never.allows_attempt(2));
    }

    #[test]
    fn validation_is_never_retryable_even_if_configured() {
        let table = RetryPolicyTable::default().with_policy(
            ErrorClass::ValidationError,
            RetryPolicy::exponential(9, Duration::from_millis(1), Duration::from_millis(1)),
        );
        assert!(!table.policy_for(ErrorClass::ValidationError).retryable);
        assert!(!table.policy_for(ErrorClass::ValidationError).allows_attempt(2));
    }

    #[test]
    fn partial_table_keeps_defaults() {
        let table: RetryPolicyTable = serde_json::from_value(serde_json::json!({
            "transient_api": {
                "max_attempts": 3,
                "base_delay_ms": 1000,
                "max_delay_ms": 8000,
                "backoff_multiplier": 2.0,
                "jitter_fraction": 0.1,
                "retryable": true
            }
        }))
        .unwrap();

        assert_eq!(table.policy_for(ErrorClass::TransientApi).max_attempts, 3);
        assert_eq!(
            table.policy_for(ErrorClass::Timeout),
            RetryPolicyTable::default().policy_for(ErrorClass::Timeout)
        );
    }

    #[test]
    fn seeded_jitter_is_reproducible() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(10));
        let a = policy.jittered_delay(2, &mut StdRng::seed_from_u64(7));
        let b = policy.jittered_delay(2, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    proptest! {
        /// Property: jittered delays stay within ± jitter_fraction of the base schedule.
        #[test]
        fn jitter_stays_in_bounds(
            attempt in 2u32..10,
            base_ms in 1u64..5_000,
            jitter in 0.0f64..1.0,
            seed in any::<u64>()
        ) {
            let policy = RetryPolicy::exponential(10, Duration::from_millis(base_ms), Duration::from_secs(60))
                .with_jitter(jitter);
            let nominal = policy.backoff_delay(attempt).as_millis() as f64;
            let got = policy.jittered_delay(attempt, &mut StdRng::seed_from_u64(seed)).as_millis() as f64;

            prop_assert!(got >= (nominal * (1.0 - jitter)).floor() - 1.0);
            prop_assert!(got <= (nominal * (1.0 + jitter)).ceil() + 1.0);
        }
    }
}
