//! Tracing/logging initialization.
//!
//! `RUST_LOG` always wins over the fallback filter passed in here.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with("info", true);
}

/// Like [`init`], with `default_filter` used when `RUST_LOG` is unset and a
/// choice between JSON and plain-text output.
pub fn init_with(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    // JSON logs + timestamps for machines, plain text for terminals.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_noop() {
        init_with("debug", false);
        init();
        init_with("not a [valid filter", true);
    }
}
