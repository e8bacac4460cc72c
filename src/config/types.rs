//! Configuration types

use crate::timing::Accuracy;
use serde::Deserialize;

/// Daemon configuration (pktforge.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub transmit: TransmitConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: pretty, compact, json
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TransmitConfig {
    /// Pacing strategy applied to every port at startup.
    #[serde(default)]
    pub accuracy: Accuracy,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StatsConfig {
    /// Seconds between counter snapshots in the daemon log.
    #[serde(default = "default_stats_interval")]
    pub interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_stats_interval(),
        }
    }
}

/// One port entry: a device to bind and what to run on it.
#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    /// Interface name as understood by the capture library.
    pub device: String,
    /// Set false to open the monitors and the capturer without
    /// promiscuous mode. Device emulation still needs promiscuous mode
    /// and is unaffected.
    #[serde(default = "default_promiscuous")]
    pub promiscuous: bool,
    /// Start a capture with this BPF filter at startup.
    #[serde(default)]
    pub capture_filter: Option<String>,
    /// Start the emulation transceiver at startup.
    #[serde(default)]
    pub emulation: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_stats_interval() -> u64 {
    5
}

fn default_promiscuous() -> bool {
    true
}
