//! Logging setup

use tracing_subscriber::{EnvFilter, FmtSubscriber};
use veil_tunnel::LogLevel;

/// Install the global subscriber. `RUST_LOG` overrides `level`.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
