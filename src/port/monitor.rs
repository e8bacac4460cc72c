//! Direction-aware byte/packet counter loops.

use crate::capture::{self, COUNTING_SNAPLEN};
use crate::stats::PortStats;
use pcap::{Active, Capture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Which side of the wire a monitor counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

/// Counts packets and bytes for one direction of a device.
///
/// The handle is opened at construction so degradations (non-promiscuous
/// mode, missing direction filtering) are known before the loop starts;
/// the loop itself runs on its own thread from `start()` until `stop()`.
pub struct PortMonitor {
    device: String,
    direction: Direction,
    is_directional: bool,
    is_promiscuous: bool,
    stats: Arc<PortStats>,
    stop: Arc<AtomicBool>,
    handle: Option<Capture<Active>>,
    join: Option<JoinHandle<()>>,
}

impl PortMonitor {
    /// Opens the counting handle up front. `promiscuous` false opts the
    /// handle out of promiscuous mode instead of trying it first.
    pub fn new(
        device: &str,
        direction: Direction,
        stats: Arc<PortStats>,
        promiscuous: bool,
    ) -> Self {
        let mut is_promiscuous = promiscuous;
        let mut is_directional = true;

        let handle = match capture::open_with_fallback(device, COUNTING_SNAPLEN, 1000, promiscuous)
        {
            Ok((cap, promisc)) => {
                is_promiscuous = promisc;
                let dir = match direction {
                    Direction::Rx => pcap::Direction::In,
                    Direction::Tx => pcap::Direction::Out,
                };
                if let Err(err) = cap.direction(dir) {
                    debug!(device, ?direction, error = %err, "direction filter unsupported");
                    is_directional = false;
                }
                Some(cap)
            }
            Err(err) => {
                error!(device, ?direction, error = %err, "failed to open monitor handle");
                None
            }
        };

        Self {
            device: device.to_string(),
            direction,
            is_directional,
            is_promiscuous,
            stats,
            stop: Arc::new(AtomicBool::new(false)),
            handle,
            join: None,
        }
    }

    /// Whether the handle opened at all.
    pub fn is_usable(&self) -> bool {
        self.handle.is_some() || self.join.is_some()
    }

    pub fn is_promiscuous(&self) -> bool {
        self.is_promiscuous
    }

    /// False when the platform cannot filter this handle to one
    /// direction; callers interpret counter semantics accordingly.
    pub fn is_directional(&self) -> bool {
        self.is_directional
    }

    pub fn start(&mut self) {
        if self.join.is_some() {
            warn!(device = %self.device, direction = ?self.direction, "monitor start requested but is already running");
            return;
        }
        let Some(handle) = self.handle.take() else {
            warn!(device = %self.device, direction = ?self.direction, "monitor has no handle, not starting");
            return;
        };

        self.stop.store(false, Ordering::Relaxed);
        let direction = self.direction;
        let is_directional = self.is_directional;
        let stats = Arc::clone(&self.stats);
        let stop = Arc::clone(&self.stop);
        self.join = Some(std::thread::spawn(move || {
            monitor_loop(handle, direction, is_directional, &stats, &stop);
        }));
    }

    pub fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            warn!(device = %self.device, direction = ?self.direction, "monitor stop requested but is not running");
            return;
        };
        self.stop.store(true, Ordering::Relaxed);
        let _ = join.join();
    }
}

impl Drop for PortMonitor {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.stop.store(true, Ordering::Relaxed);
            let _ = join.join();
        }
    }
}

fn monitor_loop(
    mut handle: Capture<Active>,
    direction: Direction,
    is_directional: bool,
    stats: &PortStats,
    stop: &AtomicBool,
) {
    // the 1 s read timeout bounds how long a stop request can linger
    while !stop.load(Ordering::Relaxed) {
        match handle.next_packet() {
            Ok(packet) => {
                let wire_len = u64::from(packet.header.len);
                match direction {
                    Direction::Rx => stats.record_rx(wire_len),
                    Direction::Tx if is_directional => stats.record_tx(wire_len),
                    // non-directional Tx: the transmitter owns the counters
                    Direction::Tx => {}
                }
            }
            Err(pcap::Error::TimeoutExpired) => {}
            Err(pcap::Error::NoMorePackets) => break,
            Err(err) => warn!(?direction, error = %err, "error reading packet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unopenable_device_degrades_to_unusable() {
        let stats = Arc::new(PortStats::new());
        let mut monitor = PortMonitor::new("pktforge-no-such-dev0", Direction::Rx, stats, true);
        assert!(!monitor.is_usable());

        // start/stop on the unusable monitor warn instead of crashing
        monitor.start();
        monitor.stop();
        assert!(!monitor.is_usable());
    }

    #[test]
    fn test_promiscuous_opt_out_is_recorded() {
        let stats = Arc::new(PortStats::new());
        let monitor = PortMonitor::new("pktforge-no-such-dev0", Direction::Tx, stats, false);
        assert!(!monitor.is_promiscuous());
    }
}
