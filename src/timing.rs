//! Monotonic clock and delay strategies for the transmit scheduler.

use serde::Deserialize;
use std::time::Duration;

/// Current value of the monotonic clock in microseconds.
///
/// The 64-bit value does not roll over within any realistic run; all
/// scheduler arithmetic is done on this timeline.
pub fn monotonic_us() -> i64 {
    let mut ts = std::mem::MaybeUninit::uninit();
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr());
        let ts = ts.assume_init();
        ts.tv_sec as i64 * 1_000_000 + ts.tv_nsec as i64 / 1_000
    }
}

/// Transmit pacing strategy.
///
/// `High` spins on the monotonic clock until the target tick; `Low`
/// yields to the scheduler and inherits its granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accuracy {
    High,
    #[default]
    Low,
}

impl Accuracy {
    /// Waits `usecs` microseconds with the selected strategy.
    pub fn delay(self, usecs: i64) {
        if usecs <= 0 {
            return;
        }
        match self {
            Accuracy::High => busy_wait_us(usecs),
            Accuracy::Low => std::thread::sleep(Duration::from_micros(usecs as u64)),
        }
    }
}

fn busy_wait_us(usecs: i64) {
    let target = monotonic_us() + usecs;
    while monotonic_us() < target {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_us_is_monotonic() {
        let a = monotonic_us();
        let b = monotonic_us();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn test_busy_wait_reaches_target() {
        let start = monotonic_us();
        Accuracy::High.delay(500);
        assert!(monotonic_us() - start >= 500);
    }

    #[test]
    fn test_sleep_reaches_target() {
        let start = monotonic_us();
        Accuracy::Low.delay(500);
        assert!(monotonic_us() - start >= 500);
    }

    #[test]
    fn test_non_positive_delay_returns_immediately() {
        let start = monotonic_us();
        Accuracy::High.delay(0);
        Accuracy::High.delay(-250);
        // no target tick was armed; only clock sampling overhead elapses
        assert!(monotonic_us() - start < 100_000);
    }

    #[test]
    fn test_accuracy_from_config_string() {
        #[derive(Deserialize)]
        struct Probe {
            accuracy: Accuracy,
        }

        let high: Probe = toml::from_str("accuracy = \"high\"").unwrap();
        assert_eq!(high.accuracy, Accuracy::High);

        let low: Probe = toml::from_str("accuracy = \"low\"").unwrap();
        assert_eq!(low.accuracy, Accuracy::Low);

        assert!(toml::from_str::<Probe>("accuracy = \"turbo\"").is_err());
    }
}
