//! Telemetry: logging configuration and initialization.

mod logging;

pub use logging::init_logging;
