//! Process-wide tracing/logging setup.

/// Initialize tracing with JSON output and the default `info` filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize tracing with an explicit fallback filter and output format.
pub fn init_with(default_filter: &str, json: bool) {
    tracing::init_with(default_filter, json);
}

/// Tracing configuration (filters, formats).
pub mod tracing;
