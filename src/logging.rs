//! Tracing setup, grounded on the teacher's `logger.rs` but trimmed down to
//! the plain `tracing-subscriber` `fmt` + `EnvFilter` idiom since the SPDK
//! log bridge has no counterpart here.

use tracing_subscriber::EnvFilter;

/// Installs a global tracing subscriber. `default_level` is used when
/// `RUST_LOG` is not set.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_owned()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
