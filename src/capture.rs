//! Capture-handle plumbing shared by the port workers.
//!
//! Wraps the libpcap open paths with the degradation sequence the
//! workers share (promiscuous first, then non-promiscuous) and defines
//! the narrow transmit seam the replay engine is written against.

use crate::{Error, Result};
use pcap::{Active, Capture};
use tracing::debug;

/// Snaplen used by handles that only count packets; wire lengths come
/// from the record header, not the captured bytes.
pub const COUNTING_SNAPLEN: i32 = 64;

/// Snaplen for handles that must see whole frames.
pub const FULL_SNAPLEN: i32 = 65535;

/// Opens a live handle. Promiscuous mode is tried first when requested
/// and degrades to non-promiscuous when the device refuses it; a
/// promiscuous opt-out skips it outright.
///
/// Returns the handle and whether promiscuous mode is active.
pub fn open_with_fallback(
    device: &str,
    snaplen: i32,
    timeout_ms: i32,
    promisc: bool,
) -> Result<(Capture<Active>, bool)> {
    if !promisc {
        let cap = open_live(device, snaplen, timeout_ms, false)?;
        return Ok((cap, false));
    }
    match open_live(device, snaplen, timeout_ms, true) {
        Ok(cap) => Ok((cap, true)),
        Err(err) if error_mentions(&err, "promiscuous") => {
            debug!(device, "can't set promiscuous mode, trying non-promisc");
            let cap = open_live(device, snaplen, timeout_ms, false)?;
            Ok((cap, false))
        }
        Err(err) => Err(err.into()),
    }
}

/// Looks a device up by name in the capture library's device list.
pub fn find_device(name: &str) -> Result<pcap::Device> {
    pcap::Device::list()?
        .into_iter()
        .find(|d| d.name == name)
        .ok_or_else(|| Error::DeviceNotFound {
            name: name.to_string(),
        })
}

/// Opens the dedicated send handle used by the transmitter.
pub fn open_transmit(device: &str) -> Result<Capture<Active>> {
    // nothing is read back on this handle, so skip promiscuous mode
    open_live(device, COUNTING_SNAPLEN, 1000, false).map_err(Error::from)
}

pub(crate) fn open_live(
    device: &str,
    snaplen: i32,
    timeout_ms: i32,
    promisc: bool,
) -> std::result::Result<Capture<Active>, pcap::Error> {
    Capture::from_device(device)?
        .promisc(promisc)
        .snaplen(snaplen)
        .timeout(timeout_ms)
        .open()
}

pub(crate) fn error_mentions(err: &pcap::Error, needle: &str) -> bool {
    match err {
        pcap::Error::PcapError(msg) => msg.to_ascii_lowercase().contains(needle),
        _ => false,
    }
}

/// One-way transmit seam.
///
/// The replay engine only ever puts frames on the wire; keeping the
/// trait this narrow lets tests drive it without a live device.
pub trait TxHandle: Send {
    /// Puts one frame on the wire.
    fn transmit(&mut self, packet: &[u8]) -> Result<()>;
}

impl TxHandle for Capture<Active> {
    fn transmit(&mut self, packet: &[u8]) -> Result<()> {
        self.sendpacket(packet).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mentions_matches_pcap_messages_only() {
        let err = pcap::Error::PcapError("eth0: Promiscuous mode not supported".to_string());
        assert!(error_mentions(&err, "promiscuous"));
        assert!(!error_mentions(&err, "loopback"));
        assert!(!error_mentions(&pcap::Error::TimeoutExpired, "promiscuous"));
    }

    #[test]
    fn test_find_device_reports_unknown_names() {
        assert!(matches!(
            find_device("pktforge-no-such-dev0"),
            Err(Error::DeviceNotFound { .. })
        ));
    }
}
