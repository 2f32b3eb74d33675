//! Diagnostic tracing for the engine and the `bench` CLI.
//!
//! Tracing output goes to stderr and is never persisted. Experiment artifacts
//! (checkpoint, run results, summaries) are written regardless of `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_filter` when unset or invalid.
/// Output: stderr, compact format. Safe to call more than once.
///
/// # Example
/// ```bash
/// RUST_LOG=engine=debug bench run --config experiment.toml
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
