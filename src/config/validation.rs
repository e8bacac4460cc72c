//! Configuration validation

use super::Config;
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            eprintln!("[WARN] {}", warning);
        }
        for error in &self.errors {
            eprintln!("[ERROR] {}", error);
        }
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_logging(config, &mut result);
    validate_stats(config, &mut result);
    validate_ports(config, &mut result);

    result
}

fn validate_logging(config: &Config, result: &mut ValidationResult) {
    const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const FORMATS: [&str; 3] = ["pretty", "compact", "json"];

    if !LEVELS.contains(&config.logging.level.to_lowercase().as_str()) {
        result.warn(format!(
            "logging.level: unknown level {:?}, falling back to info",
            config.logging.level
        ));
    }
    if !FORMATS.contains(&config.logging.format.as_str()) {
        result.warn(format!(
            "logging.format: unknown format {:?}, falling back to pretty",
            config.logging.format
        ));
    }
}

fn validate_stats(config: &Config, result: &mut ValidationResult) {
    if config.stats.interval_secs == 0 {
        result.error("stats.interval_secs must be at least 1");
    }
}

fn validate_ports(config: &Config, result: &mut ValidationResult) {
    if config.ports.is_empty() {
        result.warn("no ports configured, the daemon will have nothing to do");
    }

    let mut seen = HashSet::new();
    for (index, port) in config.ports.iter().enumerate() {
        if port.device.is_empty() {
            result.error(format!("ports[{}]: device must not be empty", index));
            continue;
        }
        if !seen.insert(port.device.as_str()) {
            result.error(format!(
                "ports[{}]: device {:?} is already configured; each port needs its own device",
                index, port.device
            ));
        }
        if matches!(port.capture_filter.as_deref(), Some("")) {
            result.warn(format!(
                "ports[{}]: empty capture filter captures all traffic",
                index
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::PortConfig;
    use super::*;

    fn port(device: &str) -> PortConfig {
        PortConfig {
            device: device.to_string(),
            promiscuous: true,
            capture_filter: None,
            emulation: false,
        }
    }

    #[test]
    fn test_default_config_has_no_errors() {
        let result = validate(&Config::default());
        assert!(!result.has_errors());
        // warns about the empty port list
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_duplicate_devices_rejected() {
        let config = Config {
            ports: vec![port("eth0"), port("eth0")],
            ..Config::default()
        };
        let result = validate(&config);
        assert!(result.has_errors());
        assert!(result.errors[0].contains("already configured"));
    }

    #[test]
    fn test_empty_device_rejected() {
        let config = Config {
            ports: vec![port("")],
            ..Config::default()
        };
        assert!(validate(&config).has_errors());
    }

    #[test]
    fn test_unknown_log_level_warns() {
        let mut config = Config {
            ports: vec![port("eth0")],
            ..Config::default()
        };
        config.logging.level = "loud".to_string();
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.iter().any(|w| w.contains("logging.level")));
    }

    #[test]
    fn test_zero_stats_interval_rejected() {
        let mut config = Config {
            ports: vec![port("eth0")],
            ..Config::default()
        };
        config.stats.interval_secs = 0;
        assert!(validate(&config).has_errors());
    }
}
