//! Sender side of a connection: message queueing, the reliable stream
//! cursor, segment serialization, retransmission bookkeeping, and the token
//! bucket that paces the wire.

use std::collections::{BTreeMap, VecDeque};

use photon::time::{Usec, NEVER};

use crate::codec::{AckFrame, PacketEncoder};
use crate::message::{SendMessage, SendQueue, SEND_NO_NAGLE, SEND_RELIABLE};
use crate::receiver::encode_reliable_msg_header;
use crate::shared::{MAX_ENCRYPTED_PAYLOAD, MAX_MESSAGE_SIZE_SEND, MAX_UNRELIABLE_MSG_SIZE};
use crate::stats::PktNumTracker;

/// Don't start a chopped segment whose data portion would be smaller than
/// this at the tail of a packet.
const MIN_SLIVER_BYTES: usize = 16;

/// One sent packet awaiting acknowledgment, keyed by packet number.
#[derive(Debug)]
pub struct InFlightPkt {
    pub sent_ts: Usec,
    pub nacked: bool,
    /// Reliable stream ranges this packet carried.
    pub ranges: Vec<(i64, i64)>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum SendError {
    /// Send buffer is full, or the message exceeds the per-message cap.
    LimitExceeded,
    /// Invalid flag combination.
    InvalidParam,
}

#[derive(Debug, Eq, PartialEq)]
pub struct SendOutcome {
    pub msg_num: i64,
    /// Oversized unreliable message was promoted to reliable.
    pub coerced_reliable: bool,
}

#[derive(Debug, Eq, PartialEq)]
pub enum AckError {
    /// Peer acknowledged a packet number we never sent.
    AckOfUnsentPacket,
    /// Block arithmetic ran below zero.
    MalformedBlocks,
}

pub struct SenderState {
    queue: SendQueue,
    /// Fully serialized reliable messages with bytes still on the wire or in
    /// the retry set. Ordered by stream position.
    unacked_reliable: VecDeque<SendMessage>,
    next_msg_num: i64,
    last_queued_reliable_msg_num: i64,
    last_sent_reliable_msg_num: i64,
    /// Next stream position to assign to a queued reliable message.
    stream_cursor: i64,
    /// First reliable stream byte not yet serialized into any packet.
    next_unsent_stream_pos: i64,
    /// Ranges on the wire awaiting acknowledgment, keyed by stream begin.
    in_flight_ranges: BTreeMap<i64, i64>,
    /// Ranges due for retransmission, keyed by stream begin.
    retry_ready: BTreeMap<i64, i64>,
    in_flight_pkts: BTreeMap<i64, InFlightPkt>,
    /// Timeout scan cursor: packets below this were already swept.
    next_timeout_pkt: i64,
    tokens: i64,
    last_token_update: Usec,
}

impl SenderState {
    pub fn new() -> SenderState {
        SenderState {
            queue: SendQueue::new(),
            unacked_reliable: VecDeque::new(),
            next_msg_num: 1,
            last_queued_reliable_msg_num: 0,
            last_sent_reliable_msg_num: 0,
            stream_cursor: 1,
            next_unsent_stream_pos: 1,
            in_flight_ranges: BTreeMap::new(),
            retry_ready: BTreeMap::new(),
            in_flight_pkts: BTreeMap::new(),
            next_timeout_pkt: 0,
            tokens: MAX_ENCRYPTED_PAYLOAD as i64,
            last_token_update: 0,
        }
    }

    #[inline]
    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    #[inline]
    pub fn last_sent_reliable_msg_num(&self) -> i64 {
        self.last_sent_reliable_msg_num
    }

    #[inline]
    pub fn unacked_reliable_count(&self) -> usize {
        self.unacked_reliable.len()
    }

    #[inline]
    pub fn in_flight_pkt_count(&self) -> usize {
        self.in_flight_pkts.len()
    }

    /// True when every reliable byte handed to us has been acknowledged and
    /// nothing remains queued. Gates the Linger → FinWait transition.
    pub fn fully_drained(&self) -> bool {
        self.queue.is_empty()
            && self.unacked_reliable.is_empty()
            && self.in_flight_ranges.is_empty()
            && self.retry_ready.is_empty()
    }

    #[inline]
    pub fn has_retry_ready(&self) -> bool {
        !self.retry_ready.is_empty()
    }

    // -----------------------------------------------------------------------
    // Queueing
    // -----------------------------------------------------------------------

    /// Queues one message. Reliable messages get the stream header prepended
    /// and a stream position assigned here.
    pub fn queue_message(
        &mut self,
        payload: Vec<u8>,
        mut flags: u32,
        now: Usec,
        nagle_time: Usec,
        send_buffer_size: usize,
    ) -> Result<SendOutcome, SendError> {
        let size = payload.len();
        if size > MAX_MESSAGE_SIZE_SEND {
            return Err(SendError::LimitExceeded);
        }
        if self.queue.pending_bytes() + size > send_buffer_size {
            return Err(SendError::LimitExceeded);
        }

        let mut coerced = false;
        if flags & SEND_RELIABLE == 0 && size > MAX_UNRELIABLE_MSG_SIZE {
            flags |= SEND_RELIABLE;
            coerced = true;
        }

        let msg_num = self.next_msg_num;
        self.next_msg_num += 1;

        let mut msg = SendMessage {
            payload,
            msg_num,
            flags,
            stream_pos: 0,
            header_len: 0,
            nagle_deadline: now + nagle_time,
            sent_offset: 0,
        };

        if flags & SEND_RELIABLE != 0 {
            let gap = (msg_num - self.last_queued_reliable_msg_num) as u64;
            let header = encode_reliable_msg_header(gap, size);
            self.last_queued_reliable_msg_num = msg_num;
            msg.header_len = header.len();
            msg.stream_pos = self.stream_cursor;
            self.stream_cursor += (header.len() + size) as i64;
            let mut image = header;
            image.append(&mut msg.payload);
            msg.payload = image;
        }

        if flags & SEND_NO_NAGLE != 0 {
            msg.nagle_deadline = 0;
            self.queue.clear_nagle_deadlines();
        }
        self.queue.push_back(msg);

        Ok(SendOutcome {
            msg_num,
            coerced_reliable: coerced,
        })
    }

    // -----------------------------------------------------------------------
    // Token bucket
    // -----------------------------------------------------------------------

    /// Accrues tokens at `rate` bytes per second. When nothing is waiting to
    /// be sent the balance is clamped to one packet's burst.
    pub fn token_bucket_accumulate(&mut self, now: Usec, rate: usize) {
        if self.last_token_update != 0 {
            let elapsed = now - self.last_token_update;
            if elapsed > 0 {
                self.tokens = self
                    .tokens
                    .saturating_add((rate as i64).saturating_mul(elapsed) / 1_000_000);
            }
        }
        self.last_token_update = now;
        if self.queue.is_empty() && self.retry_ready.is_empty() {
            self.tokens = self.tokens.min(MAX_ENCRYPTED_PAYLOAD as i64);
        }
    }

    #[inline]
    pub fn tokens(&self) -> i64 {
        self.tokens
    }

    pub fn spend_tokens(&mut self, bytes: usize) {
        self.tokens -= bytes as i64;
    }

    /// Forces a pause of roughly the given duration at the current rate.
    pub fn penalize_tokens(&mut self, rate: usize, pause: Usec) {
        self.tokens = -((rate as i64) * pause / 1_000_000).max(1);
    }

    /// Earliest time the bucket allows a send.
    pub fn time_when_can_send(&self, now: Usec, rate: usize) -> Usec {
        if self.tokens >= 0 {
            now
        } else {
            now + (-self.tokens) * 1_000_000 / (rate as i64).max(1)
        }
    }

    // -----------------------------------------------------------------------
    // Packet content
    // -----------------------------------------------------------------------

    /// Oldest packet still awaiting acknowledgment; when nothing is in
    /// flight, the packet about to be sent.
    pub fn min_pkt_waiting_on_ack(&self, next_pkt_num: i64) -> i64 {
        self.in_flight_pkts.keys().next().copied().unwrap_or(next_pkt_num)
    }

    /// Serializes ready retries, oldest stream position first. Ranges keep
    /// the exact bounds they were first sent with.
    pub fn serialize_retries(&mut self, enc: &mut PacketEncoder, ranges_out: &mut Vec<(i64, i64)>) {
        while let Some((&begin, &end)) = self.retry_ready.iter().next() {
            let header = enc.reliable_header_size(begin);
            let len = (end - begin) as usize;
            if header + len > enc.remaining() {
                break;
            }
            let data = match self.copy_stream_bytes(begin, end) {
                Some(data) => data,
                None => {
                    // Range no longer backed by any message; it was acked
                    // through another packet after being queued for retry.
                    self.retry_ready.remove(&begin);
                    continue;
                }
            };
            if !enc.put_reliable(begin, &data) {
                break;
            }
            self.retry_ready.remove(&begin);
            self.in_flight_ranges.insert(begin, end);
            ranges_out.push((begin, end));
        }
    }

    /// Serializes new segments from the queue head until the packet is full,
    /// the queue runs dry, or Nagle holds the head back.
    pub fn serialize_new_data(
        &mut self,
        enc: &mut PacketEncoder,
        now: Usec,
        nagle_forced: bool,
        max_reliable_segment: usize,
        ranges_out: &mut Vec<(i64, i64)>,
    ) {
        loop {
            let Some(head) = self.queue.front() else { break };
            if !nagle_forced && head.nagle_deadline > now {
                break;
            }

            if head.is_reliable() {
                let begin = self.next_unsent_stream_pos.max(head.stream_pos);
                let stream_end = head.stream_end();
                if begin >= stream_end {
                    // Fully serialized: retire to the unacked list.
                    let msg = self.queue.pop_front().expect("head present");
                    self.last_sent_reliable_msg_num = msg.msg_num;
                    self.unacked_reliable.push_back(msg);
                    continue;
                }
                let header = enc.reliable_header_size(begin);
                if header >= enc.remaining() {
                    break;
                }
                let avail = enc.remaining() - header;
                let wanted = ((stream_end - begin) as usize).min(max_reliable_segment);
                let len = wanted.min(avail);
                if len < wanted && len < MIN_SLIVER_BYTES {
                    break;
                }
                let head = self.queue.front().expect("head present");
                let img_off = (begin - head.stream_pos) as usize;
                let data = &head.payload[img_off..img_off + len];
                if !enc.put_reliable(begin, data) {
                    break;
                }
                let end = begin + len as i64;
                self.in_flight_ranges.insert(begin, end);
                ranges_out.push((begin, end));
                self.next_unsent_stream_pos = end;
            } else {
                let header = enc.unreliable_header_size(head.msg_num, head.sent_offset as u64);
                if header >= enc.remaining() {
                    break;
                }
                let avail = enc.remaining() - header;
                let remaining_bytes = head.payload.len() - head.sent_offset;
                let len = remaining_bytes.min(avail);
                if len < remaining_bytes && len < MIN_SLIVER_BYTES {
                    break;
                }
                let is_last = len == remaining_bytes;
                let head = self.queue.front_mut().expect("head present");
                let offset = head.sent_offset;
                let msg_num = head.msg_num;
                let data: Vec<u8> = head.payload[offset..offset + len].to_vec();
                if !enc.put_unreliable(msg_num, offset as u64, &data, is_last) {
                    break;
                }
                if is_last {
                    // Unreliable messages are gone once serialized.
                    self.queue.pop_front();
                } else {
                    head.sent_offset += len;
                }
            }
        }
    }

    /// Records an emitted packet, pure-ack packets included.
    pub fn note_packet_sent(&mut self, pkt_num: i64, now: Usec, ranges: Vec<(i64, i64)>) {
        self.in_flight_pkts.insert(
            pkt_num,
            InFlightPkt {
                sent_ts: now,
                nacked: false,
                ranges,
            },
        );
        if self.next_timeout_pkt == 0 {
            self.next_timeout_pkt = pkt_num;
        }
    }

    /// Finds the message image backing a stream range. Ranges never span
    /// messages, so a single message covers the whole range.
    fn copy_stream_bytes(&self, begin: i64, end: i64) -> Option<Vec<u8>> {
        let locate = |msgs: &VecDeque<SendMessage>| -> Option<Vec<u8>> {
            let idx = msgs.partition_point(|m| m.stream_end() <= begin);
            let msg = msgs.get(idx)?;
            if !msg.is_reliable() || msg.stream_pos > begin || msg.stream_end() < end {
                return None;
            }
            let off = (begin - msg.stream_pos) as usize;
            Some(msg.payload[off..off + (end - begin) as usize].to_vec())
        };
        locate(&self.unacked_reliable).or_else(|| {
            // Partially serialized messages still sit on the queue.
            self.queue
                .iter()
                .find(|m| m.is_reliable() && m.stream_pos <= begin && m.stream_end() >= end)
                .map(|msg| {
                    let off = (begin - msg.stream_pos) as usize;
                    msg.payload[off..off + (end - begin) as usize].to_vec()
                })
        })
    }

    // -----------------------------------------------------------------------
    // Ack processing
    // -----------------------------------------------------------------------

    /// Applies one ack frame. Blocks run newest to oldest from the latest
    /// received packet; everything below the oldest explicit block is
    /// implicitly acknowledged.
    pub fn process_ack(&mut self, frame: &AckFrame, stats: &mut PktNumTracker, now: Usec) -> Result<(), AckError> {
        if frame.latest_recv >= stats.peek_send_pkt_num() {
            return Err(AckError::AckOfUnsentPacket);
        }

        let mut acked: Vec<(i64, i64)> = Vec::with_capacity(frame.blocks.len() + 1);
        let mut nacked: Vec<(i64, i64)> = Vec::with_capacity(frame.blocks.len());
        let mut cursor = frame.latest_recv + 1;
        for block in &frame.blocks {
            let ack_begin = cursor - block.num_ack as i64;
            acked.push((ack_begin, cursor));
            cursor = ack_begin;
            let nack_begin = cursor - block.num_nack as i64;
            nacked.push((nack_begin, cursor));
            cursor = nack_begin;
            if cursor < 0 {
                return Err(AckError::MalformedBlocks);
            }
        }
        // Implicit final block: everything older is acked.
        acked.push((i64::MIN + 1, cursor));

        for &(begin, end) in &acked {
            let pkts: Vec<i64> = self.in_flight_pkts.range(begin..end).map(|(&k, _)| k).collect();
            for pkt_num in pkts {
                let record = self.in_flight_pkts.remove(&pkt_num).expect("key just listed");
                for &(range_begin, range_end) in &record.ranges {
                    self.ack_stream_range(range_begin, range_end);
                }
                if pkt_num == frame.latest_recv {
                    stats.in_flight_pkt_ack(pkt_num, record.sent_ts, frame.delay_raw, now);
                }
            }
        }

        for &(begin, end) in &nacked {
            let pkts: Vec<i64> = self.in_flight_pkts.range(begin..end).map(|(&k, _)| k).collect();
            for pkt_num in pkts {
                let record = self.in_flight_pkts.get_mut(&pkt_num).expect("key just listed");
                if record.nacked {
                    continue;
                }
                record.nacked = true;
                let ranges = record.ranges.clone();
                for (range_begin, range_end) in ranges {
                    self.nack_stream_range(range_begin, range_end);
                }
            }
        }

        self.cleanup_unacked_head();
        Ok(())
    }

    fn ack_stream_range(&mut self, begin: i64, end: i64) {
        if let Some(&known_end) = self.in_flight_ranges.get(&begin) {
            if known_end == end {
                self.in_flight_ranges.remove(&begin);
            }
        }
        if let Some(&known_end) = self.retry_ready.get(&begin) {
            if known_end == end {
                self.retry_ready.remove(&begin);
            }
        }
    }

    fn nack_stream_range(&mut self, begin: i64, end: i64) {
        if let Some(&known_end) = self.in_flight_ranges.get(&begin) {
            if known_end == end {
                self.in_flight_ranges.remove(&begin);
                self.retry_ready.insert(begin, end);
            }
        }
    }

    /// Drops unacked messages from the head once no outstanding range
    /// references their bytes.
    fn cleanup_unacked_head(&mut self) {
        while let Some(head) = self.unacked_reliable.front() {
            let begin = head.stream_pos;
            let end = head.stream_end();
            let in_flight = self.in_flight_ranges.range(begin..end).next().is_some();
            let retrying = self.retry_ready.range(begin..end).next().is_some();
            if in_flight || retrying {
                break;
            }
            self.unacked_reliable.pop_front();
        }
    }

    // -----------------------------------------------------------------------
    // Timeout sweep
    // -----------------------------------------------------------------------

    /// Walks in-flight packets whose retry timer expired, moving their
    /// ranges to the retry set. Also expires long-nacked records to bound
    /// the map. Returns the next deadline.
    pub fn check_in_flight(&mut self, now: Usec, rto: Usec) -> Usec {
        let mut next_deadline = NEVER;
        let mut to_nack: Vec<i64> = Vec::new();
        for (&pkt_num, record) in self.in_flight_pkts.range(self.next_timeout_pkt..) {
            if record.nacked {
                continue;
            }
            let deadline = record.sent_ts + rto;
            if deadline <= now {
                to_nack.push(pkt_num);
            } else {
                next_deadline = deadline;
                break;
            }
        }
        for pkt_num in to_nack {
            self.next_timeout_pkt = pkt_num + 1;
            let record = self.in_flight_pkts.get_mut(&pkt_num).expect("key just listed");
            record.nacked = true;
            let ranges = record.ranges.clone();
            for (begin, end) in ranges {
                self.nack_stream_range(begin, end);
            }
        }

        // Expire stale nacked records from the front of the map.
        let mut expired: Vec<i64> = Vec::new();
        for (&pkt_num, record) in self.in_flight_pkts.iter() {
            if record.sent_ts + rto * 2 > now {
                break;
            }
            if record.nacked {
                expired.push(pkt_num);
            }
        }
        for pkt_num in expired {
            self.in_flight_pkts.remove(&pkt_num);
        }

        next_deadline
    }

    /// Earliest deadline the sender wants a wakeup for.
    pub fn next_think_time(&self, now: Usec, rate: usize) -> Usec {
        let mut next = NEVER;
        if self.has_retry_ready() || !self.queue.is_empty() {
            let pacing = self.time_when_can_send(now, rate);
            let nagle = if self.has_retry_ready() {
                now
            } else {
                self.queue.next_nagle_deadline().unwrap_or(NEVER)
            };
            next = next.min(pacing.max(nagle));
        }
        next
    }
}

impl Default for SenderState {
    fn default() -> SenderState {
        SenderState::new()
    }
}
