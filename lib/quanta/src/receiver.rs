//! Receiver side of a connection: the received-packet gap map with its
//! ack/nack schedule, reassembly of unreliable segments, and the reliable
//! byte stream with in-order message extraction.

use std::collections::BTreeMap;

use photon::time::{Usec, NEVER};

use crate::codec::{read_varint, AckBlock};
use crate::shared::{
    MAX_BUFFERED_RELIABLE_BYTES, MAX_BUFFERED_UNRELIABLE_SEGMENTS, MAX_DATA_ACK_DELAY, MAX_MESSAGE_SIZE_RECV,
    MAX_MSG_NUM_AHEAD, MAX_PACKET_GAPS, MAX_RELIABLE_MSG_NUM_GAP, MAX_RELIABLE_STREAM_GAPS_EXTEND,
    MAX_RELIABLE_STREAM_GAPS_FRAGMENT, NACK_FLUSH_DELAY,
};

/// A run of packet numbers `[begin, end)` that never arrived, keyed by
/// `begin` in the gap map.
#[derive(Debug, Clone)]
pub struct PktGap {
    pub end: i64,
    /// Arrival time of the packet just before the gap opened.
    pub ts_before: Usec,
    /// When we may report this gap as lost.
    pub when_ok_to_nack: Usec,
    /// Deadline to ack the blocks prior to this gap.
    pub when_ack_prior: Usec,
}

/// Outcome of recording a packet number.
#[derive(Debug, Eq, PartialEq)]
pub enum RecordPkt {
    /// New packet; process its payload.
    Accept,
    /// Duplicate or forgotten packet number; drop without processing.
    Duplicate,
    /// The gap map is full; drop so the sender retransmits.
    GapOverflow,
}

#[derive(Debug, Eq, PartialEq)]
pub enum ReliableResult {
    /// Parsed zero or more complete messages; the packet may be acked.
    Ok(Vec<(i64, Vec<u8>)>),
    /// Resource bound hit; drop without acking so the peer retries later.
    Reject,
    /// Protocol violation in the stream itself; fail the connection.
    FailHard(&'static str),
}

#[derive(Debug)]
struct UnreliableSeg {
    data: Vec<u8>,
    is_last: bool,
}

pub struct ReceiverState {
    // Received-packet gap map. The terminal sentinel of the schedule is
    // modeled by `sentinel_ack_time` (conceptually an entry at +infinity).
    gaps: BTreeMap<i64, PktGap>,
    sentinel_ack_time: Usec,
    /// Earliest gap whose `when_ack_prior` is scheduled; everything before
    /// it is unscheduled (NEVER).
    pending_ack_begin: Option<i64>,
    /// Peer's stop-waiting point: no acks are reported below this.
    min_pkt_num_to_send_acks: i64,
    /// Packet that last raised the stop-waiting point, for the
    /// non-monotonicity rule.
    pkt_num_that_set_min: i64,

    // Reliable stream.
    stream_base: i64,
    stream_buf: Vec<u8>,
    stream_gaps: BTreeMap<i64, i64>,
    last_reliable_msg_num: i64,

    // Unreliable reassembly.
    unreliable_segs: BTreeMap<(i64, u64), UnreliableSeg>,
    max_unreliable_msg_num: i64,
}

impl ReceiverState {
    pub fn new() -> ReceiverState {
        ReceiverState {
            gaps: BTreeMap::new(),
            sentinel_ack_time: NEVER,
            pending_ack_begin: None,
            min_pkt_num_to_send_acks: 0,
            pkt_num_that_set_min: 0,
            stream_base: 1,
            stream_buf: Vec::new(),
            stream_gaps: BTreeMap::new(),
            last_reliable_msg_num: 0,
            unreliable_segs: BTreeMap::new(),
            max_unreliable_msg_num: 0,
        }
    }

    #[inline]
    pub fn max_unreliable_msg_num(&self) -> i64 {
        self.max_unreliable_msg_num
    }

    #[inline]
    pub fn last_reliable_msg_num(&self) -> i64 {
        self.last_reliable_msg_num
    }

    #[inline]
    pub fn min_pkt_num_to_send_acks(&self) -> i64 {
        self.min_pkt_num_to_send_acks
    }

    #[inline]
    pub fn gap_count(&self) -> usize {
        self.gaps.len()
    }

    #[inline]
    pub fn buffered_unreliable_segments(&self) -> usize {
        self.unreliable_segs.len()
    }

    pub fn gaps(&self) -> impl Iterator<Item = (i64, &PktGap)> {
        self.gaps.iter().map(|(&b, g)| (b, g))
    }

    #[inline]
    pub fn sentinel_ack_time(&self) -> Usec {
        self.sentinel_ack_time
    }

    #[inline]
    pub fn pending_ack_begin(&self) -> Option<i64> {
        self.pending_ack_begin
    }

    fn recompute_pending_ack(&mut self) {
        self.pending_ack_begin = self
            .gaps
            .iter()
            .find(|(_, gap)| gap.when_ack_prior != NEVER)
            .map(|(&begin, _)| begin);
    }

    // -----------------------------------------------------------------------
    // Packet number recording and the ack/nack schedule
    // -----------------------------------------------------------------------

    /// Read-only twin of [`record_received_pkt`]: what recording this
    /// number would do. Checked before a packet's frames are processed so
    /// duplicates never reach the segment handlers.
    ///
    /// [`record_received_pkt`]: ReceiverState::record_received_pkt
    pub fn pre_check_pkt(&self, pkt_num: i64, max_recv: i64) -> RecordPkt {
        if pkt_num < self.min_pkt_num_to_send_acks {
            return RecordPkt::Duplicate;
        }
        if pkt_num == max_recv + 1 {
            return RecordPkt::Accept;
        }
        if pkt_num > max_recv + 1 {
            let gap_begin = (max_recv + 1).max(self.min_pkt_num_to_send_acks);
            return if gap_begin < pkt_num && self.gaps.len() >= MAX_PACKET_GAPS {
                RecordPkt::GapOverflow
            } else {
                RecordPkt::Accept
            };
        }
        match self.gaps.range(..=pkt_num).next_back() {
            Some((_, gap)) if pkt_num < gap.end => RecordPkt::Accept,
            _ => RecordPkt::Duplicate,
        }
    }

    /// Records a received packet number. `max_recv` and `ts_prev_recv` come
    /// from the packet-number tracker before it is updated for this packet.
    /// `schedule_ack` is set for packets whose content wants acking.
    pub fn record_received_pkt(
        &mut self,
        pkt_num: i64,
        max_recv: i64,
        ts_prev_recv: Usec,
        now: Usec,
        schedule_ack: bool,
    ) -> RecordPkt {
        if pkt_num < self.min_pkt_num_to_send_acks {
            return RecordPkt::Duplicate;
        }

        if pkt_num == max_recv + 1 {
            // In-order fast path.
            if schedule_ack {
                self.queue_flush_all_acks(now + MAX_DATA_ACK_DELAY);
            }
            return RecordPkt::Accept;
        }

        if pkt_num > max_recv + 1 {
            // Anything below the stop-waiting point is not worth tracking.
            let begin = (max_recv + 1).max(self.min_pkt_num_to_send_acks);
            if begin < pkt_num {
                if self.gaps.len() >= MAX_PACKET_GAPS {
                    return RecordPkt::GapOverflow;
                }
                let nack_delay = if pkt_num < max_recv + 3 { NACK_FLUSH_DELAY } else { 0 };
                let gap = PktGap {
                    end: pkt_num,
                    ts_before: ts_prev_recv,
                    when_ok_to_nack: now + nack_delay,
                    when_ack_prior: self.sentinel_ack_time,
                };
                if gap.when_ack_prior != NEVER {
                    self.pending_ack_begin = Some(self.pending_ack_begin.map_or(begin, |b| b.min(begin)));
                }
                self.gaps.insert(begin, gap);
            }
            if schedule_ack {
                self.queue_flush_all_acks(now + MAX_DATA_ACK_DELAY);
            }
            return RecordPkt::Accept;
        }

        // At or below max_recv: either it fills a tracked gap or it is a
        // duplicate.
        let Some((&begin, gap)) = self.gaps.range(..=pkt_num).next_back() else {
            return RecordPkt::Duplicate;
        };
        if pkt_num >= gap.end {
            return RecordPkt::Duplicate;
        }
        let gap = gap.clone();

        if begin == pkt_num && gap.end == pkt_num + 1 {
            self.gaps.remove(&begin);
        } else if begin == pkt_num {
            self.gaps.remove(&begin);
            self.gaps.insert(pkt_num + 1, gap);
        } else if gap.end == pkt_num + 1 {
            self.gaps
                .get_mut(&begin)
                .expect("gap present")
                .end = pkt_num;
        } else {
            // Split: the right half inherits the schedule.
            self.gaps
                .get_mut(&begin)
                .expect("gap present")
                .end = pkt_num;
            self.gaps.insert(pkt_num + 1, gap);
        }
        self.recompute_pending_ack();
        if schedule_ack {
            self.queue_flush_all_acks(now + MAX_DATA_ACK_DELAY);
        }
        RecordPkt::Accept
    }

    /// Schedules a full ack flush no later than `by`. The sentinel takes the
    /// earlier time; scheduled entries above the new time are pulled down so
    /// the schedule stays non-decreasing. Entries before the pending-ack
    /// iterator stay unscheduled.
    pub fn queue_flush_all_acks(&mut self, by: Usec) {
        if self.sentinel_ack_time <= by {
            return;
        }
        self.sentinel_ack_time = by;
        for gap in self.gaps.values_mut().rev() {
            if gap.when_ack_prior == NEVER || gap.when_ack_prior <= by {
                break;
            }
            gap.when_ack_prior = by;
        }
    }

    /// Earliest time anything on the ack/nack schedule is due.
    pub fn next_flush_time(&self) -> Usec {
        let mut next = self.sentinel_ack_time;
        for gap in self.gaps.values() {
            next = next.min(gap.when_ack_prior).min(gap.when_ok_to_nack);
        }
        next
    }

    #[inline]
    pub fn flush_due(&self, now: Usec) -> bool {
        self.next_flush_time() <= now
    }

    /// Whether there is anything worth reporting at all.
    pub fn has_ack_data(&self, max_recv: i64) -> bool {
        max_recv >= self.min_pkt_num_to_send_acks && max_recv > 0
    }

    /// Builds the complete block list, newest to oldest, covering from
    /// `max_recv` down to the stop-waiting point.
    pub fn gather_ack_blocks(&self, max_recv: i64) -> Vec<AckBlock> {
        let mut blocks = Vec::with_capacity(self.gaps.len());
        let mut cursor = max_recv + 1;
        for (&begin, gap) in self.gaps.iter().rev() {
            debug_assert!(gap.end <= cursor);
            blocks.push(AckBlock {
                num_ack: (cursor - gap.end) as u64,
                num_nack: (gap.end - begin) as u64,
            });
            cursor = begin;
        }
        blocks
    }

    /// Resets the schedule after a full block list was serialized.
    pub fn mark_acks_sent(&mut self) {
        self.sentinel_ack_time = NEVER;
        for gap in self.gaps.values_mut() {
            gap.when_ack_prior = NEVER;
            gap.when_ok_to_nack = NEVER;
        }
        self.pending_ack_begin = None;
    }

    /// Applies a stop-waiting frame carried in packet `pkt_num`. Returns
    /// false for the protocol violation of lowering the point from a packet
    /// at or after the one that raised it; stale frames are ignored.
    pub fn handle_stop_waiting(&mut self, min_pkt_num: i64, pkt_num: i64) -> bool {
        if min_pkt_num <= self.min_pkt_num_to_send_acks {
            if min_pkt_num < self.min_pkt_num_to_send_acks && pkt_num >= self.pkt_num_that_set_min {
                return false;
            }
            return true;
        }

        // Forget everything below the new point.
        let mut trimmed: BTreeMap<i64, PktGap> = BTreeMap::new();
        for (begin, gap) in std::mem::take(&mut self.gaps) {
            if gap.end <= min_pkt_num {
                continue;
            }
            let new_begin = begin.max(min_pkt_num);
            trimmed.insert(new_begin, gap);
        }
        self.gaps = trimmed;
        self.min_pkt_num_to_send_acks = min_pkt_num;
        self.pkt_num_that_set_min = pkt_num;
        self.recompute_pending_ack();
        true
    }

    // -----------------------------------------------------------------------
    // Unreliable reassembly
    // -----------------------------------------------------------------------

    /// Handles one unreliable segment. Returns a completed message payload,
    /// plus a flag that a segment at or above the current message number was
    /// evicted to make room (worth a warning).
    pub fn recv_unreliable(
        &mut self,
        msg_num: i64,
        offset: u64,
        data: &[u8],
        is_last: bool,
    ) -> (Option<(i64, Vec<u8>)>, bool) {
        if msg_num > self.max_unreliable_msg_num {
            self.max_unreliable_msg_num = msg_num;
        }

        if offset == 0 && is_last {
            return (Some((msg_num, data.to_vec())), false);
        }

        let mut evicted_recent = false;
        while self.unreliable_segs.len() >= MAX_BUFFERED_UNRELIABLE_SEGMENTS {
            let &(oldest, _) = self
                .unreliable_segs
                .keys()
                .next()
                .expect("map is non-empty at the limit");
            if oldest >= msg_num {
                evicted_recent = true;
            }
            self.discard_unreliable_msg(oldest);
        }

        self.unreliable_segs.insert(
            (msg_num, offset),
            UnreliableSeg {
                data: data.to_vec(),
                is_last,
            },
        );

        (self.try_complete_unreliable(msg_num), evicted_recent)
    }

    fn discard_unreliable_msg(&mut self, msg_num: i64) {
        let keys: Vec<(i64, u64)> = self
            .unreliable_segs
            .range((msg_num, 0)..(msg_num + 1, 0))
            .map(|(&k, _)| k)
            .collect();
        for key in keys {
            self.unreliable_segs.remove(&key);
        }
    }

    /// Checks for a contiguous cover from offset 0 through a last segment;
    /// on success assembles, erases the segments, and returns the message.
    fn try_complete_unreliable(&mut self, msg_num: i64) -> Option<(i64, Vec<u8>)> {
        let mut covered = 0u64;
        let mut total: Option<u64> = None;
        for (&(_, offset), seg) in self.unreliable_segs.range((msg_num, 0)..(msg_num + 1, 0)) {
            if offset > covered {
                return None;
            }
            covered = covered.max(offset + seg.data.len() as u64);
            if seg.is_last {
                total = Some(offset + seg.data.len() as u64);
                break;
            }
        }
        let total = total? as usize;

        let mut payload = vec![0u8; total];
        for (&(_, offset), seg) in self.unreliable_segs.range((msg_num, 0)..(msg_num + 1, 0)) {
            let begin = offset as usize;
            let end = (begin + seg.data.len()).min(total);
            payload[begin..end].copy_from_slice(&seg.data[..end - begin]);
            if seg.is_last {
                break;
            }
        }
        self.discard_unreliable_msg(msg_num);
        Some((msg_num, payload))
    }

    // -----------------------------------------------------------------------
    // Reliable stream
    // -----------------------------------------------------------------------

    /// Handles one reliable segment and extracts any messages that became
    /// complete at the head of the stream.
    pub fn recv_reliable(&mut self, stream_begin: i64, data: &[u8]) -> ReliableResult {
        let mut begin = stream_begin;
        let mut data = data;
        let stream_end = begin + data.len() as i64;

        if stream_end <= self.stream_base {
            // Entirely before the stream head: already consumed.
            return ReliableResult::Ok(Vec::new());
        }
        if begin < self.stream_base {
            let skip = (self.stream_base - begin) as usize;
            data = &data[skip..];
            begin = self.stream_base;
        }

        let existing_end = self.stream_base + self.stream_buf.len() as i64;
        if stream_end > existing_end {
            let new_len = (stream_end - self.stream_base) as usize;
            if new_len > MAX_BUFFERED_RELIABLE_BYTES {
                return ReliableResult::Reject;
            }
            if begin > existing_end {
                // The new data starts past everything known: a fresh gap.
                if self.stream_gaps.len() >= MAX_RELIABLE_STREAM_GAPS_EXTEND {
                    return ReliableResult::Reject;
                }
                self.stream_gaps.insert(existing_end, begin);
            }
            self.stream_buf.resize(new_len, 0);
        }

        // Plan the gap updates before touching anything so a fragment-bound
        // rejection leaves the map coherent.
        let mut remove: Vec<i64> = Vec::new();
        let mut insert: Vec<(i64, i64)> = Vec::new();
        let mut splits = 0usize;
        for (&gap_begin, &gap_end) in self.stream_gaps.range(..stream_end) {
            if gap_end <= begin {
                continue;
            }
            // Overlap exists.
            remove.push(gap_begin);
            if gap_begin < begin {
                insert.push((gap_begin, begin));
            }
            if gap_end > stream_end {
                insert.push((stream_end, gap_end));
            }
            if gap_begin < begin && gap_end > stream_end {
                splits += 1;
            }
        }
        if splits > 0 && self.stream_gaps.len() - remove.len() + insert.len() > MAX_RELIABLE_STREAM_GAPS_FRAGMENT {
            return ReliableResult::Reject;
        }

        let dest = (begin - self.stream_base) as usize;
        self.stream_buf[dest..dest + data.len()].copy_from_slice(data);
        for key in remove {
            self.stream_gaps.remove(&key);
        }
        for (gap_begin, gap_end) in insert {
            self.stream_gaps.insert(gap_begin, gap_end);
        }

        self.extract_reliable_messages()
    }

    /// Length of the contiguous valid run at the head of the buffer.
    fn valid_head_len(&self) -> usize {
        match self.stream_gaps.keys().next() {
            Some(&first_gap) => (first_gap - self.stream_base) as usize,
            None => self.stream_buf.len(),
        }
    }

    fn extract_reliable_messages(&mut self) -> ReliableResult {
        let valid = self.valid_head_len();
        let mut consumed = 0usize;
        let mut out = Vec::new();

        loop {
            let remaining = &self.stream_buf[consumed..valid];
            if remaining.is_empty() {
                break;
            }
            let header = remaining[0];
            if header & 0x80 != 0 {
                return ReliableResult::FailHard("Reserved bit set in reliable message header");
            }
            let mut pos = 1usize;

            let msg_num_gap = if header & 0x40 != 0 {
                match read_varint(remaining, &mut pos) {
                    Ok(gap) => gap,
                    Err(_) => break, // header continues past the valid run
                }
            } else {
                1
            };
            if msg_num_gap == 0 || msg_num_gap > MAX_RELIABLE_MSG_NUM_GAP {
                return ReliableResult::FailHard("Reliable message number gap out of range");
            }
            let msg_num = self.last_reliable_msg_num + msg_num_gap as i64;
            let highest_seen = self.last_reliable_msg_num.max(self.max_unreliable_msg_num);
            if msg_num > highest_seen + MAX_MSG_NUM_AHEAD as i64 {
                return ReliableResult::FailHard("Reliable message number runs ahead");
            }

            let mut size = (header & 0x1f) as u64;
            if header & 0x20 != 0 {
                match read_varint(remaining, &mut pos) {
                    Ok(high) => size |= high << 5,
                    Err(_) => break,
                }
            }
            if size > MAX_MESSAGE_SIZE_RECV as u64 {
                return ReliableResult::FailHard("Reliable message size out of range");
            }
            let size = size as usize;

            if remaining.len() - pos < size {
                break;
            }
            out.push((msg_num, remaining[pos..pos + size].to_vec()));
            self.last_reliable_msg_num = msg_num;
            consumed += pos + size;
        }

        if consumed > 0 {
            self.stream_base += consumed as i64;
            self.stream_buf.drain(..consumed);
        }
        ReliableResult::Ok(out)
    }
}

impl Default for ReceiverState {
    fn default() -> ReceiverState {
        ReceiverState::new()
    }
}

/// Builds the reliable stream header for a message: size in the low 5 bits
/// (with a varint overflow), and an optional message-number gap varint.
/// Lives here next to the parser in `extract_reliable_messages` so the two
/// stay in lockstep.
pub fn encode_reliable_msg_header(msg_num_gap: u64, size: usize) -> Vec<u8> {
    use crate::codec::write_varint;
    debug_assert!(msg_num_gap >= 1);
    let mut header = Vec::with_capacity(8);
    let mut lead = (size & 0x1f) as u8;
    if msg_num_gap != 1 {
        lead |= 0x40;
    }
    if size >> 5 != 0 {
        lead |= 0x20;
    }
    header.push(lead);
    if msg_num_gap != 1 {
        write_varint(&mut header, msg_num_gap);
    }
    if size >> 5 != 0 {
        write_varint(&mut header, (size >> 5) as u64);
    }
    header
}
