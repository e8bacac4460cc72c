//! pktforge - per-port packet I/O engine for traffic generation
//!
//! Each [`Port`] binds up to five workers to one network interface:
//! direction-filtered Rx/Tx counters, a rate-accurate transmit
//! scheduler replaying buffered packet sequences, a BPF-filtered
//! capture-to-file loop and a transceiver feeding control-plane frames
//! to emulated devices.

pub mod capture;
pub mod config;
pub mod error;
pub mod port;
pub mod stats;
pub mod telemetry;
pub mod timing;

pub use error::{Error, Result};
pub use port::Port;
