//! BPF-filtered capture to a temp file.

use crate::capture::{self, FULL_SNAPLEN};
use crate::port::{State, WorkerFlags, STATE_POLL};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Packets written per batch before the stop flag is re-examined at a
/// batch boundary.
const BATCH_SIZE: usize = 1000;

static CAPTURE_FILE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Dumps filtered traffic on one device into a pcap temp file.
///
/// The temp path is fixed at construction and stays stable for the
/// capturer's lifetime; each `start` truncates and rewrites it.
pub struct PortCapturer {
    device: String,
    promiscuous: bool,
    file_path: PathBuf,
    flags: Arc<WorkerFlags>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl PortCapturer {
    pub fn new(device: &str, promiscuous: bool) -> Self {
        let seq = CAPTURE_FILE_SEQ.fetch_add(1, Ordering::Relaxed);
        let file_path = std::env::temp_dir().join(format!(
            "pktforge-cap-{}-{}.pcap",
            std::process::id(),
            seq
        ));
        debug!(device, file = %file_path.display(), "capture file assigned");

        Self {
            device: device.to_string(),
            promiscuous,
            file_path,
            flags: Arc::new(WorkerFlags::new()),
            join: None,
        }
    }

    /// Where captured packets are dumped.
    pub fn capture_file(&self) -> &Path {
        &self.file_path
    }

    /// Opens the device, applies `filter` and dumps matching packets
    /// until stopped.
    pub fn start(&mut self, filter: &str) {
        if self.is_running() {
            warn!(device = %self.device, "capture start requested but is already running");
            return;
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }

        self.flags.clear_stop();
        self.flags.set_state(State::NotStarted);
        let device = self.device.clone();
        let promiscuous = self.promiscuous;
        let filter = filter.to_string();
        let path = self.file_path.clone();
        let flags = Arc::clone(&self.flags);
        self.join = Some(std::thread::spawn(move || {
            capture_loop(&device, promiscuous, &filter, &path, &flags);
        }));

        while self.flags.state() == State::NotStarted {
            std::thread::sleep(STATE_POLL);
        }
    }

    pub fn stop(&mut self) {
        if !self.is_running() {
            warn!(device = %self.device, "capture stop requested but is not running");
            return;
        }
        self.flags.request_stop();
        while self.flags.state() == State::Running {
            debug!("capture stopping");
            std::thread::sleep(STATE_POLL);
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.flags.state() == State::Running
    }
}

impl Drop for PortCapturer {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        } else if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        // the dump file is ours; best-effort cleanup like any temp file
        let _ = std::fs::remove_file(&self.file_path);
    }
}

fn capture_loop(device: &str, promiscuous: bool, filter: &str, path: &Path, flags: &WorkerFlags) {
    let (mut handle, _promisc) =
        match capture::open_with_fallback(device, FULL_SNAPLEN, 1000, promiscuous) {
            Ok(opened) => opened,
            Err(err) => {
                error!(device, error = %err, "failed to open capture handle");
                flags.finish();
                return;
            }
        };

    // a bad filter is fatal to this worker, unlike the emulation path
    if let Err(err) = handle.filter(filter, true) {
        warn!(device, filter, error = %err, "can't compile or apply filter");
        flags.finish();
        return;
    }

    let mut savefile = match handle.savefile(path) {
        Ok(sf) => sf,
        Err(err) => {
            warn!(device, file = %path.display(), error = %err, "can't open dump file");
            flags.finish();
            return;
        }
    };

    flags.set_state(State::Running);
    'capture: loop {
        // process up to one batch, then come back for the stop check
        let mut batch = 0;
        while batch < BATCH_SIZE {
            if flags.stop_requested() {
                debug!("capture stop requested");
                break 'capture;
            }
            match handle.next_packet() {
                Ok(packet) => {
                    savefile.write(&packet);
                    batch += 1;
                }
                Err(pcap::Error::TimeoutExpired) => break,
                Err(pcap::Error::NoMorePackets) => break 'capture,
                Err(err) => {
                    warn!(device, error = %err, "error reading packet");
                    break 'capture;
                }
            }
        }
    }

    if let Err(err) = savefile.flush() {
        warn!(device, error = %err, "error flushing dump file");
    }
    flags.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_file_path_is_stable() {
        let capturer = PortCapturer::new("eth0", true);
        let first = capturer.capture_file().to_path_buf();
        assert_eq!(capturer.capture_file(), first.as_path());
        assert_eq!(first.extension().and_then(|e| e.to_str()), Some("pcap"));
    }

    #[test]
    fn test_capture_files_are_distinct_per_capturer() {
        let a = PortCapturer::new("eth0", true);
        let b = PortCapturer::new("eth0", false);
        assert_ne!(a.capture_file(), b.capture_file());
    }

    #[test]
    fn test_start_on_unopenable_device_finishes() {
        let mut capturer = PortCapturer::new("pktforge-no-such-dev0", true);
        capturer.start("icmp");
        while capturer.is_running() {
            std::thread::sleep(STATE_POLL);
        }
        assert!(!capturer.is_running());

        // stop on the finished worker is a warning, not a crash
        capturer.stop();
    }
}
