//! Receive/transmit path for emulated devices on a port.
//!
//! The receive loop picks up the control-plane traffic emulated devices
//! care about (ARP/NDP, ICMPv4/v6, tagged or untagged) and hands every
//! frame to the device manager. Transmit is a synchronous single-packet
//! send on the same handle.

use crate::capture::{self, FULL_SNAPLEN};
use crate::port::{State, WorkerFlags, STATE_POLL};
use crate::{Error, Result};
use pcap::{Active, Capture};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// Consumer of received emulation frames.
///
/// `receive_packet` borrows the capture buffer; the bytes are only valid
/// for the duration of the call, so implementations copy anything they
/// keep.
pub trait DeviceManager: Send {
    fn receive_packet(&mut self, packet: &[u8]);
}

/// Frames the emulated devices answer: ARP, ICMPv4 and ICMPv6, plain or
/// under up to four stacked VLAN tags.
///
/// libpcap's `vlan` keyword is stateful: each occurrence shifts the
/// decode offset for the rest of the expression by 4 bytes, so the
/// repeated clause below matches one extra tag per repetition rather
/// than being redundant.
pub const EMULATION_FILTER: &str = "arp or icmp or icmp6 or \
     (vlan and (arp or icmp or icmp6)) or \
     (vlan and (arp or icmp or icmp6)) or \
     (vlan and (arp or icmp or icmp6)) or \
     (vlan and (arp or icmp or icmp6))";

/// Forwards filtered frames to the device manager and transmits on
/// demand.
pub struct EmulationTransceiver {
    device: String,
    device_manager: Arc<Mutex<dyn DeviceManager>>,
    handle: Arc<Mutex<Option<Capture<Active>>>>,
    flags: Arc<WorkerFlags>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl EmulationTransceiver {
    pub fn new(device: &str, device_manager: Arc<Mutex<dyn DeviceManager>>) -> Self {
        Self {
            device: device.to_string(),
            device_manager,
            handle: Arc::new(Mutex::new(None)),
            flags: Arc::new(WorkerFlags::new()),
            join: None,
        }
    }

    pub fn start(&mut self) {
        if self.is_running() {
            warn!(device = %self.device, "receive start requested but is already running");
            return;
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }

        self.flags.clear_stop();
        self.flags.set_state(State::NotStarted);
        let device = self.device.clone();
        let device_manager = Arc::clone(&self.device_manager);
        let handle = Arc::clone(&self.handle);
        let flags = Arc::clone(&self.flags);
        self.join = Some(std::thread::spawn(move || {
            receive_loop(&device, &device_manager, &handle, &flags);
        }));

        while self.flags.state() == State::NotStarted {
            std::thread::sleep(STATE_POLL);
        }
    }

    pub fn stop(&mut self) {
        if !self.is_running() {
            warn!(device = %self.device, "receive stop requested but is not running");
            return;
        }
        self.flags.request_stop();
        while self.flags.state() == State::Running {
            std::thread::sleep(STATE_POLL);
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.flags.state() == State::Running
    }

    /// Synchronous single-packet send on the receive handle.
    pub fn transmit_packet(&self, packet: &[u8]) -> Result<()> {
        let mut guard = self.handle.lock().unwrap();
        match guard.as_mut() {
            Some(cap) => cap.sendpacket(packet).map_err(Error::from),
            None => Err(Error::NotRunning {
                worker: "emulation transceiver",
            }),
        }
    }
}

impl Drop for EmulationTransceiver {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        } else if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn receive_loop(
    device: &str,
    device_manager: &Mutex<dyn DeviceManager>,
    handle: &Mutex<Option<Capture<Active>>>,
    flags: &WorkerFlags,
) {
    // 100 ms timeout keeps transmit latency and stop latency low
    let mut cap = match capture::open_live(device, FULL_SNAPLEN, 100, true) {
        Ok(cap) => cap,
        Err(err) => {
            if capture::error_mentions(&err, "promiscuous") {
                error!(device, "unable to set promiscuous mode, device emulation will not work");
            } else {
                error!(device, error = %err, "unable to open device, device emulation will not work");
            }
            flags.finish();
            return;
        }
    };

    // filter failures are non-fatal here; the loop runs unfiltered and
    // the device manager sees extra traffic
    if let Err(err) = cap.filter(EMULATION_FILTER, true) {
        warn!(device, error = %err, "error applying emulation filter, receiving unfiltered");
    }

    *handle.lock().unwrap() = Some(cap);
    flags.set_state(State::Running);

    loop {
        {
            let mut guard = handle.lock().unwrap();
            let Some(cap) = guard.as_mut() else {
                break;
            };
            match cap.next_packet() {
                // the capture buffer is invalidated by the next read, so
                // the device manager gets a borrow it cannot outlive
                Ok(packet) => device_manager.lock().unwrap().receive_packet(packet.data),
                Err(pcap::Error::TimeoutExpired) => {}
                Err(pcap::Error::NoMorePackets) => break,
                Err(err) => warn!(device, error = %err, "error reading packet"),
            }
        }

        if flags.stop_requested() {
            debug!("receiver stop requested");
            break;
        }
    }

    handle.lock().unwrap().take();
    flags.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDeviceManager;

    impl DeviceManager for NullDeviceManager {
        fn receive_packet(&mut self, _packet: &[u8]) {}
    }

    #[test]
    fn test_filter_covers_four_stacked_vlan_tags() {
        let clause = "(vlan and (arp or icmp or icmp6))";
        assert_eq!(EMULATION_FILTER.matches(clause).count(), 4);
        assert!(EMULATION_FILTER.starts_with("arp or icmp or icmp6"));
    }

    #[test]
    fn test_transmit_before_start_reports_not_running() {
        let dm: Arc<Mutex<dyn DeviceManager>> = Arc::new(Mutex::new(NullDeviceManager));
        let xcvr = EmulationTransceiver::new("pktforge-no-such-dev0", dm);
        assert!(matches!(
            xcvr.transmit_packet(b"frame"),
            Err(Error::NotRunning { .. })
        ));
    }

    #[test]
    fn test_start_on_unopenable_device_finishes() {
        let dm: Arc<Mutex<dyn DeviceManager>> = Arc::new(Mutex::new(NullDeviceManager));
        let mut xcvr = EmulationTransceiver::new("pktforge-no-such-dev0", dm);
        xcvr.start();
        while xcvr.is_running() {
            std::thread::sleep(STATE_POLL);
        }
        assert!(!xcvr.is_running());
        xcvr.stop();
    }
}
