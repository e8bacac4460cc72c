//! A port binds the I/O workers to one network interface.
//!
//! Up to five worker threads run per port: two direction-filtered
//! monitors, the transmitter, the capturer and the emulation
//! transceiver. They share nothing but the port-owned stats counters,
//! per-worker stop flags and the state enums polled here.

mod capturer;
mod emulation;
mod monitor;
mod sequence;
mod transmitter;

pub use capturer::PortCapturer;
pub use emulation::{DeviceManager, EmulationTransceiver, EMULATION_FILTER};
pub use monitor::{Direction, PortMonitor};
pub use sequence::{PacketSequence, Record, Records};
pub use transmitter::PortTransmitter;

use crate::stats::{PortStats, PortStatsSnapshot};
use crate::timing::Accuracy;
use crate::Result;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Worker lifecycle states, polled by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotStarted,
    Running,
    Finished,
}

/// How often start/stop wait loops re-examine a worker's state.
pub(crate) const STATE_POLL: Duration = Duration::from_millis(10);

/// The state/stop pair every worker publishes to its owner.
pub(crate) struct WorkerFlags {
    state: AtomicU8,
    stop: AtomicBool,
}

impl WorkerFlags {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(State::NotStarted as u8),
            stop: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> State {
        match self.state.load(Ordering::Relaxed) {
            0 => State::NotStarted,
            1 => State::Running,
            _ => State::Finished,
        }
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub(crate) fn clear_stop(&self) {
        self.stop.store(false, Ordering::Relaxed);
    }

    /// Worker exit path: leaves no stale stop request behind.
    pub(crate) fn finish(&self) {
        self.clear_stop();
        self.set_state(State::Finished);
    }
}

/// One network interface plus the I/O workers bound to it.
pub struct Port {
    id: u32,
    device: String,
    description: Option<String>,
    stats: Arc<PortStats>,
    transmitter: PortTransmitter,
    capturer: PortCapturer,
    emul_xcvr: EmulationTransceiver,
    monitor_rx: PortMonitor,
    monitor_tx: PortMonitor,
    notes: String,
    is_usable: bool,
}

impl Port {
    /// Allocates the workers and shared stats for `device`. Call
    /// [`init`](Self::init) afterwards to wire stats ownership and start
    /// the monitors.
    ///
    /// `promiscuous` false opts the monitors and the capturer out of
    /// promiscuous mode; emulation keeps requiring it.
    pub fn new(
        id: u32,
        device: &str,
        device_manager: Arc<Mutex<dyn DeviceManager>>,
        promiscuous: bool,
    ) -> Self {
        let stats = Arc::new(PortStats::new());
        let monitor_rx = PortMonitor::new(device, Direction::Rx, Arc::clone(&stats), promiscuous);
        let monitor_tx = PortMonitor::new(device, Direction::Tx, Arc::clone(&stats), promiscuous);
        let transmitter = PortTransmitter::new(device);
        let capturer = PortCapturer::new(device, promiscuous);
        let emul_xcvr = EmulationTransceiver::new(device, device_manager);

        let is_usable = monitor_rx.is_usable() && monitor_tx.is_usable();
        let description = crate::capture::find_device(device).ok().and_then(|d| d.desc);

        Self {
            id,
            device: device.to_string(),
            description,
            stats,
            transmitter,
            capturer,
            emul_xcvr,
            monitor_rx,
            monitor_tx,
            notes: String::new(),
            is_usable,
        }
    }

    /// Wires stats ownership, publishes the notes and starts the
    /// monitors.
    pub fn init(&mut self) {
        if !self.monitor_tx.is_directional() {
            // without direction filtering the Tx monitor cannot tell its
            // own frames apart; the transmitter counts into the port
            // stats instead
            self.transmitter.use_external_stats(Arc::clone(&self.stats));
        }

        self.notes = limitation_notes(
            self.monitor_rx.is_promiscuous() && self.monitor_tx.is_promiscuous(),
            self.monitor_rx.is_directional(),
            self.monitor_tx.is_directional(),
        );
        if !self.notes.is_empty() {
            debug!(port = self.id, device = %self.device, notes = %self.notes, "port limitations");
        }

        self.monitor_rx.start();
        self.monitor_tx.start();
        info!(port = self.id, device = %self.device, usable = self.is_usable, "port initialized");
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Device description from the capture library, when it has one.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Active degradations in display form; empty when none apply.
    pub fn notes(&self) -> &str {
        &self.notes
    }

    /// False when a monitor handle could not be opened at all.
    pub fn is_usable(&self) -> bool {
        self.is_usable
    }

    pub fn stats(&self) -> PortStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn set_rate_accuracy(&mut self, accuracy: Accuracy) {
        self.transmitter.set_rate_accuracy(accuracy);
    }

    // --- transmit list construction, legal only while not transmitting ---

    pub fn clear_packet_list(&mut self) {
        self.transmitter.clear_packet_list();
    }

    pub fn loop_next_packet_set(&mut self, size: u64, repeats: u64, delay_sec: i64, delay_nsec: i64) {
        self.transmitter
            .loop_next_packet_set(size, repeats, delay_sec, delay_nsec);
    }

    pub fn append_to_packet_list(&mut self, sec: i64, nsec: i64, packet: &[u8]) -> bool {
        self.transmitter.append_to_packet_list(sec, nsec, packet)
    }

    pub fn set_packet_list_loop_mode(&mut self, enabled: bool, return_index: usize, delay_usec: i64) {
        self.transmitter
            .set_packet_list_loop_mode(enabled, return_index, delay_usec);
    }

    // --- worker lifecycle ---

    pub fn start_transmit(&mut self) {
        self.transmitter.start();
    }

    pub fn stop_transmit(&mut self) {
        self.transmitter.stop();
    }

    pub fn is_transmit_on(&self) -> bool {
        self.transmitter.is_running()
    }

    pub fn transmitter(&self) -> &PortTransmitter {
        &self.transmitter
    }

    pub fn transmitter_mut(&mut self) -> &mut PortTransmitter {
        &mut self.transmitter
    }

    pub fn start_capture(&mut self, filter: &str) {
        self.capturer.start(filter);
    }

    pub fn stop_capture(&mut self) {
        self.capturer.stop();
    }

    pub fn is_capture_on(&self) -> bool {
        self.capturer.is_running()
    }

    pub fn capture_file(&self) -> &Path {
        self.capturer.capture_file()
    }

    pub fn start_device_emulation(&mut self) {
        self.emul_xcvr.start();
    }

    pub fn stop_device_emulation(&mut self) {
        self.emul_xcvr.stop();
    }

    pub fn is_emulation_on(&self) -> bool {
        self.emul_xcvr.is_running()
    }

    pub fn send_emulation_packet(&self, packet: &[u8]) -> Result<()> {
        self.emul_xcvr.transmit_packet(packet)
    }
}

/// Renders the degradation list the control surface displays with the
/// port.
fn limitation_notes(promiscuous: bool, rx_directional: bool, tx_directional: bool) -> String {
    let mut items = String::new();

    if !promiscuous {
        items.push_str("<li>Non Promiscuous Mode</li>");
    }
    if !rx_directional {
        items.push_str(
            "<li><i>Rx Frames/Bytes</i>: Includes frames transmitted by this port also</li>",
        );
    }
    if !tx_directional {
        items.push_str(
            "<li><i>Tx Frames/Bytes</i>: Only frames transmitted by this port \
             (Tx by others NOT included)</li>",
        );
    }

    if items.is_empty() {
        String::new()
    } else {
        format!(
            "<b>Limitation(s)</b><ul>{items}</ul>\
             Rx/Tx Rates are also subject to above limitation(s)"
        )
    }
}
