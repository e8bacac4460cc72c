//! Rate-accurate replay of buffered packet sequences.
//!
//! The transmitter is built in two phases. Construction appends packets
//! into [`PacketSequence`] buffers, recording inter-packet gaps from the
//! supplied timestamps and closing repeat groups as they fill. Replay
//! walks the sequence list on a dedicated thread, expanding repeat
//! groups, honoring the outer return-to-queue loop and pacing every
//! packet against the monotonic clock.
//!
//! Pacing works on an overhead accumulator that is never positive: time
//! spent in syscalls and bookkeeping is subtracted from the next wait,
//! so long-run throughput converges on the timestamps even though any
//! single wait may be late.

use crate::capture::TxHandle;
use crate::port::sequence::{PacketSequence, RECORD_HEADER_LEN};
use crate::port::{State, WorkerFlags, STATE_POLL};
use crate::stats::{PortStats, PortStatsSnapshot};
use crate::timing::{self, Accuracy};
use crate::{capture, Error};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// The sequence list plus everything the worker needs to pace it.
///
/// Mutated only while the worker is not running; the worker holds the
/// lock for the whole run.
struct Plan {
    sequences: Vec<PacketSequence>,
    return_to_q_index: Option<usize>,
    loop_delay_usec: i64,
    accuracy: Accuracy,
    handle: Option<Box<dyn TxHandle>>,
}

struct Shared {
    plan: Mutex<Plan>,
    flags: WorkerFlags,
}

/// Replays a list of packet sequences on one device with rate accuracy.
pub struct PortTransmitter {
    device: String,
    shared: Arc<Shared>,
    stats: Arc<PortStats>,
    using_internal_stats: bool,
    join: Option<std::thread::JoinHandle<()>>,
    // construction-time bookkeeping, untouched by the worker
    current: Option<usize>,
    repeat_group_start: Option<usize>,
    repeat_group_size: u64,
    packet_count: u64,
}

impl PortTransmitter {
    /// Creates a transmitter with its own send handle on `device`.
    ///
    /// An open failure is logged, not fatal: a handle can still be
    /// supplied later via [`set_handle`](Self::set_handle), and `start`
    /// refuses to run without one.
    pub fn new(device: &str) -> Self {
        let handle: Option<Box<dyn TxHandle>> = match capture::open_transmit(device) {
            Ok(cap) => Some(Box::new(cap)),
            Err(err) => {
                warn!(device, error = %err, "failed to open send handle");
                None
            }
        };

        Self {
            device: device.to_string(),
            shared: Arc::new(Shared {
                plan: Mutex::new(Plan {
                    sequences: Vec::new(),
                    return_to_q_index: None,
                    loop_delay_usec: 0,
                    accuracy: Accuracy::default(),
                    handle,
                }),
                flags: WorkerFlags::new(),
            }),
            stats: Arc::new(PortStats::new()),
            using_internal_stats: true,
            join: None,
            current: None,
            repeat_group_start: None,
            repeat_group_size: 0,
            packet_count: 0,
        }
    }

    /// Replaces the send handle. The previous handle, internally opened
    /// or not, is dropped here and nowhere else.
    pub fn set_handle(&mut self, handle: Box<dyn TxHandle>) {
        if !self.guard_not_running("set_handle") {
            return;
        }
        self.plan().handle = Some(handle);
    }

    /// Switches Tx accounting onto the port-owned counters. Used when
    /// the Tx monitor is non-directional and cannot count for itself.
    pub(crate) fn use_external_stats(&mut self, stats: Arc<PortStats>) {
        if !self.guard_not_running("use_external_stats") {
            return;
        }
        self.stats = stats;
        self.using_internal_stats = false;
    }

    /// Whether the transmitter counts into its own private stats.
    pub fn using_internal_stats(&self) -> bool {
        self.using_internal_stats
    }

    /// Snapshot of the counters this transmitter writes to.
    pub fn stats(&self) -> PortStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn set_rate_accuracy(&mut self, accuracy: Accuracy) {
        if !self.guard_not_running("set_rate_accuracy") {
            return;
        }
        self.plan().accuracy = accuracy;
        debug!(device = %self.device, ?accuracy, "rate accuracy set");
    }

    /// Frees all sequences and resets construction state and loop mode.
    pub fn clear_packet_list(&mut self) {
        if !self.guard_not_running("clear_packet_list") {
            return;
        }
        {
            let mut plan = self.plan();
            plan.sequences.clear();
            plan.return_to_q_index = None;
            plan.loop_delay_usec = 0;
        }
        self.current = None;
        self.repeat_group_start = None;
        self.repeat_group_size = 0;
        self.packet_count = 0;
    }

    /// Opens a repeat group: the next `size` appended packets form a
    /// group replayed `repeats` times, with the given delay between
    /// iterations.
    pub fn loop_next_packet_set(&mut self, size: u64, repeats: u64, delay_sec: i64, delay_nsec: i64) {
        if !self.guard_not_running("loop_next_packet_set") {
            return;
        }
        let mut seq = PacketSequence::new();
        seq.repeat_count = repeats;
        seq.usec_delay = delay_sec * 1_000_000 + delay_nsec / 1_000;

        let (start, idx) = {
            let mut plan = self.plan();
            let start = plan.sequences.len();
            plan.sequences.push(seq);
            (start, plan.sequences.len() - 1)
        };
        self.repeat_group_start = Some(start);
        self.repeat_group_size = size;
        self.packet_count = 0;
        self.current = Some(idx);
    }

    /// Appends one packet with the given monotonic timestamp.
    ///
    /// Rolls over to a fresh sequence when the current one cannot take
    /// another record; the gap to the new packet is recorded as the
    /// ending sequence's post-sequence delay.
    pub fn append_to_packet_list(&mut self, sec: i64, nsec: i64, packet: &[u8]) -> bool {
        if !self.guard_not_running("append_to_packet_list") {
            return false;
        }
        let usec = (nsec / 1_000) as i32;
        let ts = sec * 1_000_000 + i64::from(usec);

        let current = self.current;
        let repeat_group_start = self.repeat_group_start;
        let repeat_group_size = self.repeat_group_size;
        let mut packet_count = self.packet_count;

        let (appended, cur, close_group) = {
            let mut plan = self.plan();
            let cur = match current {
                Some(i) if plan.sequences[i].has_free_space(2 * RECORD_HEADER_LEN + packet.len()) => i,
                ended => {
                    if let Some(i) = ended {
                        // the inter-sequence gap lives on the sequence that
                        // ends here, keeping replay timing identical
                        let gap = ts - plan.sequences[i].last_ts();
                        plan.sequences[i].usec_delay = gap;
                    }
                    plan.sequences.push(PacketSequence::new());
                    plan.sequences.len() - 1
                }
            };
            let appended = plan.sequences[cur].append(sec, usec, packet);

            packet_count += 1;
            let mut close_group = false;
            if repeat_group_size > 0 && packet_count == repeat_group_size {
                if let Some(start) = repeat_group_start {
                    debug!(
                        start,
                        size = plan.sequences.len() - start,
                        "closing repeat group"
                    );
                    if cur != start {
                        // the iteration delay separates group iterations, so
                        // it moves from the group's first sequence to its last
                        plan.sequences[cur].usec_delay = plan.sequences[start].usec_delay;
                        plan.sequences[start].usec_delay = 0;
                        plan.sequences[start].repeat_size = (plan.sequences.len() - start) as u64;
                    }
                }
                close_group = true;
            }

            (appended, cur, close_group)
        };

        self.current = Some(cur);
        self.packet_count = packet_count;
        if close_group {
            self.repeat_group_size = 0;
            self.packet_count = 0;
            self.current = None;
        }

        appended
    }

    /// After the list plays once, jump back to `return_index` and replay
    /// the tail, observing `delay_usec` between outer iterations.
    pub fn set_packet_list_loop_mode(&mut self, enabled: bool, return_index: usize, delay_usec: i64) {
        if !self.guard_not_running("set_packet_list_loop_mode") {
            return;
        }
        let mut plan = self.plan();
        plan.return_to_q_index = enabled.then_some(return_index);
        plan.loop_delay_usec = delay_usec;
    }

    pub fn sequence_count(&self) -> usize {
        if self.is_running() {
            return 0;
        }
        self.plan().sequences.len()
    }

    /// Launches the replay worker and waits until it has taken off.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!(device = %self.device, "transmit start requested but is already running");
            return;
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }

        self.shared.flags.clear_stop();
        self.shared.flags.set_state(State::NotStarted);
        let shared = Arc::clone(&self.shared);
        let stats = Arc::clone(&self.stats);
        self.join = Some(std::thread::spawn(move || {
            let mut plan = shared.plan.lock().unwrap();
            replay(&mut plan, &shared.flags, &stats);
        }));

        while self.shared.flags.state() == State::NotStarted {
            std::thread::sleep(STATE_POLL);
        }
    }

    /// Requests cancellation and waits for the worker to finish.
    pub fn stop(&mut self) {
        if !self.is_running() {
            warn!(device = %self.device, "transmit stop requested but is not running");
            return;
        }
        self.shared.flags.request_stop();
        while self.shared.flags.state() == State::Running {
            std::thread::sleep(STATE_POLL);
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.flags.state() == State::Running
    }

    fn plan(&self) -> MutexGuard<'_, Plan> {
        self.shared.plan.lock().unwrap()
    }

    fn guard_not_running(&self, what: &str) -> bool {
        if self.is_running() {
            warn!(device = %self.device, "{what} requested while transmit is running");
            return false;
        }
        true
    }
}

impl Drop for PortTransmitter {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        } else if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

enum SendError {
    Cancelled,
    Send(Error),
}

fn replay(plan: &mut Plan, flags: &WorkerFlags, stats: &PortStats) {
    debug!(sequences = plan.sequences.len(), "transmit worker starting");
    if plan.sequences.is_empty() {
        flags.finish();
        return;
    }
    for (i, seq) in plan.sequences.iter().enumerate() {
        debug!(
            i,
            rpt_cnt = seq.repeat_count,
            rpt_sz = seq.repeat_size,
            usec_delay = seq.usec_delay,
            pkts = seq.packets,
            usec_duration = seq.usec_duration,
            "sendq"
        );
    }
    let accuracy = plan.accuracy;
    let Some(handle) = plan.handle.as_mut() else {
        warn!("transmitter has no send handle, aborting");
        flags.finish();
        return;
    };

    flags.set_state(State::Running);

    // accumulated scheduling deficit, always <= 0
    let mut overhead: i64 = 0;
    let mut i = 0;
    loop {
        while i < plan.sequences.len() {
            let rpt_sz = (plan.sequences[i].repeat_size as usize).clamp(1, plan.sequences.len() - i);
            let rpt_cnt = plan.sequences[i].repeat_count;
            for _ in 0..rpt_cnt {
                for k in 0..rpt_sz {
                    let seq = &plan.sequences[i + k];
                    match transmit_sequence(handle.as_mut(), seq, stats, flags, accuracy, &mut overhead) {
                        Ok(()) => {}
                        Err(SendError::Cancelled) => {
                            debug!("transmit cancelled");
                            flags.finish();
                            return;
                        }
                        Err(SendError::Send(err)) => {
                            warn!(error = %err, overhead, "send failed, aborting replay");
                            flags.finish();
                            return;
                        }
                    }
                    if flags.stop_requested() {
                        debug!("transmit cancelled");
                        flags.finish();
                        return;
                    }
                    pace(&mut overhead, seq.usec_delay, accuracy);
                }
            }
            i += rpt_sz;
        }

        match plan.return_to_q_index {
            Some(q) if q < plan.sequences.len() => {
                if flags.stop_requested() {
                    debug!("transmit cancelled");
                    flags.finish();
                    return;
                }
                pace(&mut overhead, plan.loop_delay_usec, accuracy);
                i = q;
            }
            _ => break,
        }
    }

    flags.finish();
}

/// Transmits one sequence, pacing every packet against its recorded gap
/// minus the accumulated overhead.
fn transmit_sequence(
    handle: &mut dyn TxHandle,
    seq: &PacketSequence,
    stats: &PortStats,
    flags: &WorkerFlags,
    accuracy: Accuracy,
    overhead: &mut i64,
) -> Result<(), SendError> {
    let Some(first) = seq.records().next() else {
        return Ok(());
    };
    let mut last_ts = first.ts_usec;

    let mut ovr_start = timing::monotonic_us();
    for record in seq.records() {
        let gap = record.ts_usec - last_ts;

        let ovr_end = timing::monotonic_us();
        *overhead -= ovr_end - ovr_start;
        debug_assert!(*overhead <= 0);
        pace(overhead, gap, accuracy);

        last_ts = record.ts_usec;
        ovr_start = timing::monotonic_us();

        handle.transmit(record.data).map_err(SendError::Send)?;
        stats.record_tx(u64::from(record.wirelen));

        if flags.stop_requested() {
            return Err(SendError::Cancelled);
        }
    }

    Ok(())
}

/// Observes `delay_usec` shortened by the accumulated overhead;
/// a deficit rolls into the next wait instead.
fn pace(overhead: &mut i64, delay_usec: i64, accuracy: Accuracy) {
    let wait = delay_usec + *overhead;
    if wait > 0 {
        accuracy.delay(wait);
        *overhead = 0;
    } else {
        *overhead = wait;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingHandle(Arc<AtomicU64>);

    impl TxHandle for CountingHandle {
        fn transmit(&mut self, _packet: &[u8]) -> Result<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct FailingHandle;

    impl TxHandle for FailingHandle {
        fn transmit(&mut self, _packet: &[u8]) -> Result<()> {
            Err(Error::Capture(pcap::Error::PcapError("send failed".into())))
        }
    }

    fn transmitter() -> PortTransmitter {
        PortTransmitter::new("pktforge-no-such-dev0")
    }

    #[test]
    fn test_clear_packet_list_resets_everything() {
        let mut tx = transmitter();
        tx.loop_next_packet_set(2, 3, 0, 1_000_000);
        tx.append_to_packet_list(0, 0, b"one");
        tx.set_packet_list_loop_mode(true, 0, 500);

        tx.clear_packet_list();

        assert_eq!(tx.sequence_count(), 0);
        assert_eq!(tx.current, None);
        assert_eq!(tx.repeat_group_start, None);
        assert_eq!(tx.repeat_group_size, 0);
        assert_eq!(tx.packet_count, 0);
        let plan = tx.plan();
        assert_eq!(plan.return_to_q_index, None);
        assert_eq!(plan.loop_delay_usec, 0);
    }

    #[test]
    fn test_appends_accumulate_in_one_sequence() {
        let mut tx = transmitter();
        assert!(tx.append_to_packet_list(0, 0, b"aaaa"));
        assert!(tx.append_to_packet_list(0, 100_000_000, b"bbbb"));
        assert!(tx.append_to_packet_list(0, 300_000_000, b"cccc"));

        assert_eq!(tx.sequence_count(), 1);
        let plan = tx.plan();
        let seq = &plan.sequences[0];
        assert_eq!(seq.packets, 3);
        assert_eq!(seq.usec_duration, 300);
        assert_eq!(seq.usec_delay, 0);
    }

    #[test]
    fn test_rollover_puts_gap_on_ending_sequence() {
        let mut tx = transmitter();
        // two ~600 KiB packets cannot share one 1 MiB sequence buffer
        let big = vec![0u8; 600 * 1024];
        assert!(tx.append_to_packet_list(0, 0, &big));
        assert!(tx.append_to_packet_list(0, 250_000_000, &big));

        assert_eq!(tx.sequence_count(), 2);
        let plan = tx.plan();
        assert_eq!(plan.sequences[0].usec_delay, 250_000);
        assert_eq!(plan.sequences[1].usec_delay, 0);
        assert_eq!(plan.sequences[0].packets, 1);
        assert_eq!(plan.sequences[1].packets, 1);
    }

    #[test]
    fn test_single_sequence_repeat_group_keeps_delay() {
        let mut tx = transmitter();
        tx.loop_next_packet_set(2, 3, 0, 1_000_000);
        assert!(tx.append_to_packet_list(0, 0, b"aa"));
        assert!(tx.append_to_packet_list(0, 50_000, b"bb"));

        assert_eq!(tx.sequence_count(), 1);
        assert_eq!(tx.repeat_group_size, 0);
        assert_eq!(tx.current, None);
        let plan = tx.plan();
        let seq = &plan.sequences[0];
        assert_eq!(seq.repeat_count, 3);
        assert_eq!(seq.repeat_size, 1);
        assert_eq!(seq.usec_delay, 1_000);
    }

    #[test]
    fn test_spanning_repeat_group_moves_delay_to_last_sequence() {
        let mut tx = transmitter();
        tx.loop_next_packet_set(2, 5, 1, 0);
        let big = vec![0u8; 600 * 1024];
        assert!(tx.append_to_packet_list(0, 0, &big));
        assert!(tx.append_to_packet_list(0, 40_000_000, &big));

        assert_eq!(tx.sequence_count(), 2);
        let plan = tx.plan();
        let start = &plan.sequences[0];
        let last = &plan.sequences[1];
        assert_eq!(start.repeat_size, 2);
        assert_eq!(start.repeat_count, 5);
        assert_eq!(start.usec_delay, 0);
        // the rollover replaced the start's configured delay with the
        // inter-packet gap before the group closed; that gap is what
        // separates iterations now
        assert_eq!(last.usec_delay, 40_000);
    }

    #[test]
    fn test_start_without_handle_finishes_immediately() {
        let mut tx = transmitter();
        tx.append_to_packet_list(0, 0, b"aa");
        tx.start();

        while tx.is_running() {
            std::thread::sleep(STATE_POLL);
        }
        assert_eq!(tx.shared.flags.state(), State::Finished);
        assert_eq!(tx.stats().tx_pkts, 0);
    }

    #[test]
    fn test_start_with_empty_list_finishes_immediately() {
        let mut tx = transmitter();
        let sent = Arc::new(AtomicU64::new(0));
        tx.set_handle(Box::new(CountingHandle(Arc::clone(&sent))));
        tx.start();

        while tx.is_running() {
            std::thread::sleep(STATE_POLL);
        }
        assert_eq!(sent.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_send_error_aborts_replay() {
        let mut tx = transmitter();
        tx.set_handle(Box::new(FailingHandle));
        for i in 0..4 {
            tx.append_to_packet_list(0, i * 1_000, b"payload");
        }
        tx.start();

        while tx.is_running() {
            std::thread::sleep(STATE_POLL);
        }
        assert!(!tx.is_running());
        assert_eq!(tx.stats().tx_pkts, 0);
        // a fresh start works again after the failed run
        tx.start();
        while tx.is_running() {
            std::thread::sleep(STATE_POLL);
        }
    }

    #[test]
    fn test_external_stats_receive_the_tx_accounting() {
        let mut tx = transmitter();
        let sent = Arc::new(AtomicU64::new(0));
        tx.set_handle(Box::new(CountingHandle(Arc::clone(&sent))));

        let shared = Arc::new(PortStats::new());
        tx.use_external_stats(Arc::clone(&shared));
        assert!(!tx.using_internal_stats());

        tx.append_to_packet_list(0, 0, b"abc");
        tx.append_to_packet_list(0, 1_000, b"defgh");
        tx.start();
        while tx.is_running() {
            std::thread::sleep(STATE_POLL);
        }

        assert_eq!(sent.load(Ordering::Relaxed), 2);
        let snap = shared.snapshot();
        assert_eq!(snap.tx_pkts, 2);
        assert_eq!(snap.tx_bytes, 8);
        assert_eq!(tx.stats(), snap);
    }

    #[test]
    fn test_construction_api_refused_while_running() {
        let mut tx = transmitter();
        let sent = Arc::new(AtomicU64::new(0));
        tx.set_handle(Box::new(CountingHandle(Arc::clone(&sent))));
        tx.append_to_packet_list(0, 0, b"aa");
        tx.append_to_packet_list(2, 0, b"bb");
        tx.start();

        assert!(tx.is_running());
        assert!(!tx.append_to_packet_list(0, 0, b"nope"));
        tx.stop();
        assert!(!tx.is_running());
        assert_eq!(tx.sequence_count(), 1);
    }
}
