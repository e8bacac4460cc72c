//! In-memory sendqueue buffers for the transmitter.

/// Bytes of fixed header preceding each buffered packet:
/// `{sec: i64, usec: i32, caplen: u32, wirelen: u32}` in native order.
pub(crate) const RECORD_HEADER_LEN: usize = 20;

/// Upper bound on one sequence's raw buffer.
const MAX_BUFFER_LEN: usize = 1024 * 1024;

/// One contiguous batch of outbound packets with per-packet timestamps.
///
/// Sequences are append-only and size-bounded; the transmitter replays
/// them as a unit, observing `usec_delay` after the batch and
/// `repeat_count`/`repeat_size` for grouped repetition. Within the
/// buffer, timestamps are non-decreasing and `usec_duration` is always
/// `last_ts - first_ts` in microseconds.
#[derive(Debug)]
pub struct PacketSequence {
    buf: Vec<u8>,
    /// Number of buffered packets.
    pub packets: u64,
    /// Total payload bytes buffered.
    pub bytes: u64,
    /// Sum of inter-packet gaps within the buffer, microseconds.
    pub usec_duration: i64,
    /// Delay observed after this sequence before the next one.
    pub usec_delay: i64,
    /// How many times this sequence (or its group) is replayed.
    pub repeat_count: u64,
    /// Number of sequences in the repeat group starting here.
    pub repeat_size: u64,
    first_ts: i64,
    last_ts: i64,
}

impl PacketSequence {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            packets: 0,
            bytes: 0,
            usec_duration: 0,
            usec_delay: 0,
            repeat_count: 1,
            repeat_size: 1,
            first_ts: 0,
            last_ts: 0,
        }
    }

    /// Whether `len` more bytes of record fit under the buffer bound.
    pub fn has_free_space(&self, len: usize) -> bool {
        self.buf.len() + len <= MAX_BUFFER_LEN
    }

    /// Appends one record with the given monotonic timestamp.
    ///
    /// Returns false when the record does not fit; the sequence is
    /// unchanged in that case.
    pub fn append(&mut self, sec: i64, usec: i32, packet: &[u8]) -> bool {
        if !self.has_free_space(RECORD_HEADER_LEN + packet.len()) {
            return false;
        }

        let caplen = packet.len() as u32;
        self.buf.extend_from_slice(&sec.to_ne_bytes());
        self.buf.extend_from_slice(&usec.to_ne_bytes());
        self.buf.extend_from_slice(&caplen.to_ne_bytes());
        self.buf.extend_from_slice(&caplen.to_ne_bytes());
        self.buf.extend_from_slice(packet);

        let ts = sec * 1_000_000 + i64::from(usec);
        if self.packets == 0 {
            self.first_ts = ts;
        }
        self.last_ts = ts;
        self.usec_duration = self.last_ts - self.first_ts;
        self.packets += 1;
        self.bytes += u64::from(caplen);
        true
    }

    /// Timestamp of the last appended packet on the append timeline.
    pub fn last_ts(&self) -> i64 {
        self.last_ts
    }

    /// Iterates the buffered records in append order.
    pub fn records(&self) -> Records<'_> {
        Records {
            buf: &self.buf,
            pos: 0,
        }
    }
}

impl Default for PacketSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded view of one buffered record.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    /// Packet timestamp, microseconds on the append timeline.
    pub ts_usec: i64,
    pub caplen: u32,
    pub wirelen: u32,
    pub data: &'a [u8],
}

pub struct Records<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Record<'a>> {
        let rest = &self.buf[self.pos..];
        if rest.len() < RECORD_HEADER_LEN {
            return None;
        }

        let sec = i64::from_ne_bytes(rest[0..8].try_into().ok()?);
        let usec = i32::from_ne_bytes(rest[8..12].try_into().ok()?);
        let caplen = u32::from_ne_bytes(rest[12..16].try_into().ok()?);
        let wirelen = u32::from_ne_bytes(rest[16..20].try_into().ok()?);

        let start = RECORD_HEADER_LEN;
        let end = start + caplen as usize;
        if rest.len() < end {
            return None;
        }

        self.pos += end;
        Some(Record {
            ts_usec: sec * 1_000_000 + i64::from(usec),
            caplen,
            wirelen,
            data: &rest[start..end],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sequence() {
        let seq = PacketSequence::new();
        assert_eq!(seq.packets, 0);
        assert_eq!(seq.usec_duration, 0);
        assert_eq!(seq.repeat_count, 1);
        assert_eq!(seq.repeat_size, 1);
        assert!(seq.records().next().is_none());
    }

    #[test]
    fn test_duration_tracks_first_to_last_timestamp() {
        let mut seq = PacketSequence::new();
        assert!(seq.append(0, 0, b"aa"));
        assert!(seq.append(0, 100_000, b"bb"));
        assert!(seq.append(1, 300_000, b"cc"));

        assert_eq!(seq.packets, 3);
        assert_eq!(seq.bytes, 6);
        assert_eq!(seq.usec_duration, 1_300_000);
        assert_eq!(seq.last_ts(), 1_300_000);
    }

    #[test]
    fn test_records_decode_in_append_order() {
        let mut seq = PacketSequence::new();
        seq.append(0, 10, b"first");
        seq.append(0, 20, b"second!");

        let records: Vec<_> = seq.records().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ts_usec, 10);
        assert_eq!(records[0].caplen, 5);
        assert_eq!(records[0].wirelen, 5);
        assert_eq!(records[0].data, b"first");
        assert_eq!(records[1].ts_usec, 20);
        assert_eq!(records[1].data, b"second!");
    }

    #[test]
    fn test_append_respects_buffer_bound() {
        let mut seq = PacketSequence::new();
        let big = vec![0u8; MAX_BUFFER_LEN - RECORD_HEADER_LEN];
        assert!(seq.append(0, 0, &big));

        // buffer is exactly full; even an empty record cannot fit
        assert!(!seq.has_free_space(RECORD_HEADER_LEN));
        assert!(!seq.append(0, 1, b"x"));
        assert_eq!(seq.packets, 1);
        assert_eq!(seq.usec_duration, 0);
    }

    #[test]
    fn test_oversize_record_rejected_outright() {
        let mut seq = PacketSequence::new();
        let too_big = vec![0u8; MAX_BUFFER_LEN];
        assert!(!seq.append(0, 0, &too_big));
        assert_eq!(seq.packets, 0);
    }
}
