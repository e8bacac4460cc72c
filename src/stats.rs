//! Shared per-port packet statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Directional packet/byte counters for one port.
///
/// Each counter has a single writer under the active configuration: the
/// Rx monitor writes the rx counters and either the Tx monitor (when
/// direction filtering works) or the transmitter (when it does not)
/// writes the tx counters. Relaxed atomics keep the sharing sound in
/// either mode.
#[derive(Debug, Default)]
pub struct PortStats {
    /// Number of packets received.
    pub rx_pkts: Counter,
    /// Number of bytes received (wire lengths).
    pub rx_bytes: Counter,
    /// Number of packets transmitted.
    pub tx_pkts: Counter,
    /// Number of bytes transmitted (wire lengths).
    pub tx_bytes: Counter,
}

impl PortStats {
    /// Creates new port statistics initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a received packet.
    pub fn record_rx(&self, wire_len: u64) {
        self.rx_pkts.inc();
        self.rx_bytes.add(wire_len);
    }

    /// Records a transmitted packet.
    pub fn record_tx(&self, wire_len: u64) {
        self.tx_pkts.inc();
        self.tx_bytes.add(wire_len);
    }

    /// Takes a point-in-time copy of all four counters.
    pub fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            rx_pkts: self.rx_pkts.get(),
            rx_bytes: self.rx_bytes.get(),
            tx_pkts: self.tx_pkts.get(),
            tx_bytes: self.tx_bytes.get(),
        }
    }
}

/// Plain copy of the counters for readers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatsSnapshot {
    pub rx_pkts: u64,
    pub rx_bytes: u64,
    pub tx_pkts: u64,
    pub tx_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.add(10);
        assert_eq!(counter.get(), 11);
    }

    #[test]
    fn test_port_stats_directional() {
        let stats = PortStats::new();

        stats.record_rx(100);
        stats.record_rx(200);
        stats.record_tx(64);

        let snap = stats.snapshot();
        assert_eq!(snap.rx_pkts, 2);
        assert_eq!(snap.rx_bytes, 300);
        assert_eq!(snap.tx_pkts, 1);
        assert_eq!(snap.tx_bytes, 64);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let stats = PortStats::new();
        let before = stats.snapshot();
        stats.record_rx(1);
        assert_eq!(before.rx_pkts, 0);
        assert_eq!(stats.snapshot().rx_pkts, 1);
    }
}
