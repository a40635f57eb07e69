//! Structured logging setup shared by both binaries.

use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber from `RUST_LOG` (defaulting
/// to `info` for this crate), writing structured logs to stderr.
///
/// Call exactly once, at binary startup.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
