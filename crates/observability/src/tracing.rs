//! Tracing/logging initialization.
//!
//! JSON logs with timestamps, filtered via `RUST_LOG`. Engine operations
//! emit structured fields (tenant, aggregate id, amounts) on top of this.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber.
///
/// Safe to call multiple times (subsequent calls are no-ops), so tests and
/// embedding processes can both call it freely.
pub fn init() {
    init_with_filter(default_filter());
}

/// Initialize with an explicit filter instead of the environment.
pub fn init_with_filter(filter: EnvFilter) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
