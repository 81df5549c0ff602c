//! Tracing/logging initialization.
//!
//! One JSON line per event with timestamps; filtering comes from `RUST_LOG`.
//! Retry and claim events from `skillrun-infra` carry `idempotency_key`,
//! `attempt`, `error_class` and `delay_ms` fields.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default_filter("info");
}

/// Initialize with `default_filter` (an `EnvFilter` directive such as
/// `"skillrun_infra=debug,info"`) applied when `RUST_LOG` is unset or invalid.
pub fn init_with_default_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
