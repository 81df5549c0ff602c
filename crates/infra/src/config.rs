//! Configuration loading and representation.
//!
//! Everything has a default; `SkillrunConfig::from_env` layers `SKILLRUN_*`
//! environment variables on top. Values that fail to parse are logged and
//! ignored so a typo never takes the executor down.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::retry::RetryPolicyTable;

pub const ENV_CACHE_PATH: &str = "SKILLRUN_CACHE_PATH";
pub const ENV_POOL_SIZE: &str = "SKILLRUN_POOL_SIZE";
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "SKILLRUN_ACQUIRE_TIMEOUT_MS";
pub const ENV_CLAIM_TTL_MS: &str = "SKILLRUN_CLAIM_TTL_MS";
pub const ENV_SUCCESS_TTL_MS: &str = "SKILLRUN_SUCCESS_TTL_MS";
pub const ENV_FAILURE_TTL_MS: &str = "SKILLRUN_FAILURE_TTL_MS";
pub const ENV_CONFLICT_MODE: &str = "SKILLRUN_CONFLICT_MODE";
pub const ENV_SLOW_ATTEMPT_MS: &str = "SKILLRUN_SLOW_ATTEMPT_MS";

/// Serde helper: `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// SQLite cache location and pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
    /// Maximum pooled connections.
    pub pool_size: u32,
    /// Bounded wait for a pooled connection before `PoolExhausted`.
    pub acquire_timeout_ms: u64,
    /// How long SQLite retries internally on a locked database.
    pub busy_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".skillrun/idempotency.sqlite3"),
            pool_size: 32,
            acquire_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
        }
    }
}

impl CacheConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Claim and retention windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long a pending claim blocks other executors.
    pub claim_ttl_ms: u64,
    /// Retention of successful results.
    pub success_ttl_ms: u64,
    /// Retention of final failures. Zero records the failure but lets the next
    /// call re-run immediately.
    pub failure_ttl_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            claim_ttl_ms: 300_000,
            success_ttl_ms: 86_400_000,
            failure_ttl_ms: 0,
        }
    }
}

impl IdempotencyConfig {
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms)
    }

    pub fn success_ttl(&self) -> Duration {
        Duration::from_millis(self.success_ttl_ms)
    }

    pub fn failure_ttl(&self) -> Duration {
        Duration::from_millis(self.failure_ttl_ms)
    }
}

/// What a caller does when another executor holds a live claim on its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConflictMode {
    /// Return a `conflict` result immediately.
    FailFast,
    /// Poll the store with bounded backoff until the holder finishes, its
    /// claim expires (and we reclaim), or `max_wait_ms` elapses.
    Wait {
        poll_interval_ms: u64,
        max_poll_interval_ms: u64,
        max_wait_ms: u64,
    },
}

impl Default for ConflictMode {
    fn default() -> Self {
        Self::Wait {
            poll_interval_ms: 200,
            max_poll_interval_ms: 5_000,
            max_wait_ms: 600_000,
        }
    }
}

impl ConflictMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fail_fast" | "fail-fast" | "failfast" => Some(Self::FailFast),
            "wait" => Some(Self::default()),
            _ => None,
        }
    }
}

/// Top-level executor configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillrunConfig {
    pub cache: CacheConfig,
    pub idempotency: IdempotencyConfig,
    pub conflict: ConflictMode,
    pub retry: RetryPolicyTable,
    /// Failed attempts classified `unknown` that ran longer than this are
    /// reclassified as `timeout`.
    pub slow_attempt_threshold_ms: Option<u64>,
}

impl SkillrunConfig {
    /// Defaults overridden by `SKILLRUN_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_CACHE_PATH).filter(|p| !p.trim().is_empty()) {
            self.cache.path = PathBuf::from(path);
        }
        if let Some(n) = parse_var::<u32>(&lookup, ENV_POOL_SIZE) {
            self.cache.pool_size = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_ACQUIRE_TIMEOUT_MS) {
            self.cache.acquire_timeout_ms = ms;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_CLAIM_TTL_MS) {
            self.idempotency.claim_ttl_ms = ms;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_SUCCESS_TTL_MS) {
            self.idempotency.success_ttl_ms = ms;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_FAILURE_TTL_MS) {
            self.idempotency.failure_ttl_ms = ms;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_SLOW_ATTEMPT_MS) {
            self.slow_attempt_threshold_ms = Some(ms);
        }
        if let Some(raw) = lookup(ENV_CONFLICT_MODE) {
            match ConflictMode::parse(&raw) {
                Some(mode) => self.conflict = mode,
                None => warn!(
                    var = ENV_CONFLICT_MODE,
                    value = %raw,
                    "unrecognized conflict mode; keeping default"
                ),
            }
        }
        self
    }

    pub fn slow_attempt_threshold(&self) -> Option<Duration> {
        self.slow_attempt_threshold_ms.map(Duration::from_millis)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(var = name, value = %raw, error = %e, "ignoring unparsable config value");
            None
        }
    }
}
