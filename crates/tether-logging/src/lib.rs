//! Tracing subscriber bootstrap shared by Tether binaries and tests.
//!
//! The transport crates only emit `tracing` events; installing a subscriber
//! is left to the embedding application. This crate provides the one-line
//! setup used by the integration tests and example binaries.

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber honouring `RUST_LOG`, defaulting to
/// `info`.
pub fn init() {
    init_with_default("info");
}

/// Install a formatting subscriber honouring `RUST_LOG`, with an explicit
/// fallback filter. Safe to call more than once; later calls are no-ops.
pub fn init_with_default(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
