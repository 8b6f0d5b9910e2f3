//! Process-wide tracing setup shared by every service binary.

/// Initialize tracing with the default `info` filter (overridden by `RUST_LOG`).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init_with_filter("info");
}

pub use self::tracing::init_with_filter;

/// Subscriber construction (JSON output, env filter).
pub mod tracing;
