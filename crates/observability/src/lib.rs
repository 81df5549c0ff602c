//! Tracing and logging setup shared by executor processes and tests.

/// Initialize process-wide tracing (JSON logs, `RUST_LOG` filter, default `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Like [`init`], with `default_filter` used when `RUST_LOG` is unset.
pub fn init_with_default_filter(default_filter: &str) {
    tracing::init_with_default_filter(default_filter);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
