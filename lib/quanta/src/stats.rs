//! Packet-number bookkeeping and path quality measurement for one
//! connection: sequence assignment, wire-number expansion, ping smoothing,
//! retransmission timeout, and raw link counters.

use photon::time::{Usec, NEVER};

use crate::shared::PKT_NUM_LURCH_LIMIT;

/// Floor for the retransmission timeout.
pub const RTO_MIN: Usec = 200_000;
/// Constant padding added on top of twice the smoothed ping.
pub const RTO_PAD: Usec = 50_000;
/// Ping samples outside [0, 2 s] are discarded as clock noise.
pub const MAX_PLAUSIBLE_PING: Usec = 2_000_000;
/// Quantum of the 16-bit wire delay fields (~512 us).
pub const DELAY_SHIFT: u32 = 9;
/// Wire delay value meaning "too old / unknown".
pub const DELAY_UNKNOWN: u16 = 0xffff;

/// Expands a truncated wire packet number to the full value nearest the
/// reference. Returns a value whose low `bits` match `wire`; the caller must
/// reject results <= 0.
pub fn expand_wire_pkt_num(wire: u64, bits: u32, reference: i64) -> i64 {
    debug_assert!(bits == 16 || bits == 32);
    let span = 1i64 << bits;
    let mask = span - 1;
    let candidate = (reference & !mask) | (wire as i64 & mask);
    let mut best = candidate;
    for alternative in [candidate - span, candidate + span] {
        if (alternative - reference).abs() < (best - reference).abs() {
            best = alternative;
        }
    }
    best
}

/// Encodes an elapsed time into the shared 16-bit delay quantization,
/// saturating to the "unknown" sentinel when too old to be useful.
pub fn encode_delay(elapsed: Usec) -> u16 {
    if elapsed < 0 {
        return DELAY_UNKNOWN;
    }
    let quantized = elapsed >> DELAY_SHIFT;
    if quantized >= DELAY_UNKNOWN as i64 {
        DELAY_UNKNOWN
    } else {
        quantized as u16
    }
}

#[derive(Default)]
pub struct PingTracker {
    smoothed: Option<Usec>,
    sample_count: u32,
}

impl PingTracker {
    /// Records one ping sample into the EWMA, discarding implausible values.
    pub fn record(&mut self, sample: Usec) {
        if !(0..=MAX_PLAUSIBLE_PING).contains(&sample) {
            return;
        }
        self.smoothed = Some(match self.smoothed {
            None => sample,
            Some(prev) => (prev * 7 + sample) / 8,
        });
        self.sample_count += 1;
    }

    #[inline]
    pub fn smoothed(&self) -> Option<Usec> {
        self.smoothed
    }

    #[inline]
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }
}

/// Raw link counters for detailed stats.
#[derive(Default, Clone, Copy, Debug)]
pub struct LinkCounters {
    pub sent_pkts: u64,
    pub sent_bytes: u64,
    pub recv_pkts: u64,
    pub recv_bytes: u64,
    pub recv_undecryptable: u64,
    pub recv_duplicate: u64,
    pub recv_out_of_order: u64,
}

pub struct PktNumTracker {
    next_send: i64,
    max_recv: i64,
    ts_max_recv: Usec,
    last_recv_ts: Usec,
    last_send_ts: Usec,
    peer_protocol_version: u32,
    ping: PingTracker,
    /// Packet number whose ack the end-to-end tracker is waiting on, with
    /// its send time. Set when a packet carrying reliable data goes out.
    expect_ack: Option<(i64, Usec)>,
    /// Stats-reply liveness: pings issued without an answer.
    pub consecutive_reply_timeouts: u32,
    pub last_ping_request_ts: Usec,
    pub counters: LinkCounters,
}

impl PktNumTracker {
    pub fn new() -> PktNumTracker {
        PktNumTracker {
            next_send: 1,
            max_recv: 0,
            ts_max_recv: 0,
            last_recv_ts: 0,
            last_send_ts: 0,
            peer_protocol_version: 0,
            ping: PingTracker::default(),
            expect_ack: None,
            consecutive_reply_timeouts: 0,
            last_ping_request_ts: 0,
            counters: LinkCounters::default(),
        }
    }

    /// Seeds the counters so the connect / connect-ok exchange occupies
    /// packet number 1. Applied once the peer protocol is known to be
    /// recent enough.
    pub fn seed_handshake_pkt_nums(&mut self) {
        if self.next_send < 2 {
            self.next_send = 2;
        }
        if self.max_recv < 1 {
            self.max_recv = 1;
        }
    }

    /// The number the next outgoing packet will carry.
    #[inline]
    pub fn peek_send_pkt_num(&self) -> i64 {
        self.next_send
    }

    /// Assigns the next outgoing packet number.
    pub fn consume_send_pkt_num(&mut self, now: Usec) -> i64 {
        let num = self.next_send;
        self.next_send += 1;
        self.last_send_ts = now;
        num
    }

    #[inline]
    pub fn max_recv_pkt_num(&self) -> i64 {
        self.max_recv
    }

    #[inline]
    pub fn ts_max_recv(&self) -> Usec {
        self.ts_max_recv
    }

    #[inline]
    pub fn last_recv_ts(&self) -> Usec {
        self.last_recv_ts
    }

    #[inline]
    pub fn last_send_ts(&self) -> Usec {
        self.last_send_ts
    }

    #[inline]
    pub fn peer_protocol_version(&self) -> u32 {
        self.peer_protocol_version
    }

    pub fn set_peer_protocol_version(&mut self, version: u32) {
        self.peer_protocol_version = version;
    }

    /// Expands the wire number of a received data packet against the highest
    /// packet seen. `None` means the number is invalid or lurches too far
    /// to trust the peer.
    pub fn expand_recv_pkt_num(&self, wire: u64, bits: u32) -> Option<i64> {
        let expanded = expand_wire_pkt_num(wire, bits, self.max_recv);
        if expanded <= 0 {
            return None;
        }
        if (expanded - self.max_recv).abs() > PKT_NUM_LURCH_LIMIT {
            return None;
        }
        Some(expanded)
    }

    /// Expands a wire latest-acked number from an ack frame against our send
    /// counter.
    pub fn expand_ack_pkt_num(&self, wire: u64, bits: u32) -> Option<i64> {
        let expanded = expand_wire_pkt_num(wire, bits, self.next_send);
        if expanded <= 0 {
            None
        } else {
            Some(expanded)
        }
    }

    /// Notes a decrypted, accepted data packet.
    pub fn note_recv_pkt(&mut self, pkt_num: i64, now: Usec) {
        if pkt_num > self.max_recv {
            self.max_recv = pkt_num;
            self.ts_max_recv = now;
        }
        self.last_recv_ts = now;
        self.counters.recv_pkts += 1;
    }

    pub fn note_sent_pkt(&mut self, bytes: usize) {
        self.counters.sent_pkts += 1;
        self.counters.sent_bytes += bytes as u64;
    }

    /// Marks the packet whose ack will settle the RTT measurement.
    pub fn expect_ack_of(&mut self, pkt_num: i64, now: Usec) {
        if self.expect_ack.is_none() {
            self.expect_ack = Some((pkt_num, now));
        }
    }

    #[inline]
    pub fn is_awaiting_ack(&self) -> bool {
        self.expect_ack.is_some()
    }

    /// Called when the peer acks `pkt_num` with the given quantized delay.
    /// Returns true if this was the awaited packet.
    pub fn in_flight_pkt_ack(&mut self, pkt_num: i64, sent_ts: Usec, delay_raw: u16, now: Usec) -> bool {
        if delay_raw != DELAY_UNKNOWN {
            let sample = now - sent_ts - ((delay_raw as Usec) << DELAY_SHIFT);
            self.ping.record(sample);
        }
        match self.expect_ack {
            Some((awaited, _)) if pkt_num >= awaited => {
                self.expect_ack = None;
                self.consecutive_reply_timeouts = 0;
                true
            }
            _ => false,
        }
    }

    #[inline]
    pub fn ping(&self) -> &PingTracker {
        &self.ping
    }

    #[inline]
    pub fn ping_mut(&mut self) -> &mut PingTracker {
        &mut self.ping
    }

    /// Notes any authenticated inbound traffic as proof of liveness.
    pub fn note_liveness(&mut self, now: Usec) {
        self.last_recv_ts = now;
        self.consecutive_reply_timeouts = 0;
    }

    /// Retransmission timeout from the current ping estimate.
    pub fn retry_timeout(&self) -> Usec {
        let ping = self.ping.smoothed().unwrap_or(RTO_MIN);
        (ping * 2 + RTO_PAD).max(RTO_MIN)
    }

    /// Deadline for the reply to the awaited packet, or NEVER.
    pub fn reply_deadline(&self) -> Usec {
        match self.expect_ack {
            Some((_, sent_ts)) => sent_ts + self.retry_timeout(),
            None => NEVER,
        }
    }
}

impl Default for PktNumTracker {
    fn default() -> PktNumTracker {
        PktNumTracker::new()
    }
}
