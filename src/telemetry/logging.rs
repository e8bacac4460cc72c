//! Logging initialization.
//!
//! The port workers report everything through `tracing` events; this
//! installs the subscriber the daemon runs under. The RUST_LOG
//! environment variable overrides the config file, which in turn
//! overrides the info-level pretty default.

use crate::config::LoggingConfig;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber.
///
/// Safe to call more than once; later calls leave the first subscriber
/// in place.
pub fn init_logging(config: Option<&LoggingConfig>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(configured_level(config).as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    let layer = tracing_subscriber::fmt::layer();
    let _ = match config.map(|c| c.format.as_str()).unwrap_or("pretty") {
        "json" => registry
            .with(layer.json().with_span_events(FmtSpan::CLOSE))
            .try_init(),
        "compact" => registry.with(layer.compact()).try_init(),
        // "pretty" or anything unrecognized
        _ => registry.with(layer).try_init(),
    };
}

/// Level from the config file; unknown spellings fall back to info.
fn configured_level(config: Option<&LoggingConfig>) -> Level {
    config
        .and_then(|c| c.level.parse().ok())
        .unwrap_or(Level::INFO)
}
