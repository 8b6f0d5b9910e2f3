//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Install a JSON subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` (usually the
/// configured `LOG_FILTER`) is used. Returns `false` when a global subscriber
/// was already installed.
pub fn init_with_filter(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok()
}
