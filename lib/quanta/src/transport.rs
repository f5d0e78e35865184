//! The transport seam between a connection and the outside world.
//!
//! A connection drives its transport through the trait below; the engine
//! ships two implementations. `UdpTransport` frames packets onto a raw
//! socket (with optional fake-network conditioning for tests and debugging).
//! `PipeTransport` is the loopback used by socket pairs: it shortcuts
//! finished packets straight into the peer connection's inbox and always
//! succeeds.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use rand::Rng;
use slog::{trace, warn, Logger};

use photon::encoding::hex;
use photon::time::{Usec, NEVER};

use crate::config::ConfigValues;
use crate::lock::{LockRank, TrackedMutex};
use crate::shared::ConnectionInfo;

pub const PKT_KIND_DATA: u8 = 0x01;
pub const PKT_KIND_CONNECT_REQUEST: u8 = 0x20;
pub const PKT_KIND_CONNECT_OK: u8 = 0x21;
pub const PKT_KIND_CONNECTION_CLOSED: u8 = 0x22;
pub const PKT_KIND_NO_CONNECTION: u8 = 0x23;
pub const PKT_KIND_PING: u8 = 0x24;
pub const PKT_KIND_PONG: u8 = 0x25;

/// Keepalive stats-ping body.
pub struct PingBody {
    pub to_conn_id: u32,
    pub from_conn_id: u32,
    pub reply_requested: bool,
}

impl PingBody {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; 9];
        LittleEndian::write_u32(&mut out[..4], self.to_conn_id);
        LittleEndian::write_u32(&mut out[4..8], self.from_conn_id);
        out[8] = self.reply_requested as u8;
        out
    }

    pub fn parse(bytes: &[u8]) -> Option<PingBody> {
        if bytes.len() < 9 {
            return None;
        }
        Some(PingBody {
            to_conn_id: LittleEndian::read_u32(&bytes[..4]),
            from_conn_id: LittleEndian::read_u32(&bytes[4..8]),
            reply_requested: bytes[8] != 0,
        })
    }
}

/// Builds the data packet header: kind, destination connection id, low 16
/// bits of the packet number.
pub fn encode_data_header(out: &mut Vec<u8>, to_conn_id: u32, pkt_num: i64) {
    out.push(PKT_KIND_DATA);
    let mut buf = [0u8; 6];
    LittleEndian::write_u32(&mut buf[..4], to_conn_id);
    LittleEndian::write_u16(&mut buf[4..], (pkt_num & 0xffff) as u16);
    out.extend_from_slice(&buf);
}

pub struct DataHeader {
    pub to_conn_id: u32,
    pub wire_pkt_num: u16,
}

pub fn parse_data_header(pkt: &[u8]) -> Option<(DataHeader, &[u8])> {
    if pkt.len() < 7 || pkt[0] != PKT_KIND_DATA {
        return None;
    }
    Some((
        DataHeader {
            to_conn_id: LittleEndian::read_u32(&pkt[1..5]),
            wire_pkt_num: LittleEndian::read_u16(&pkt[5..7]),
        },
        &pkt[7..],
    ))
}

pub fn frame_control_packet(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(kind);
    out.extend_from_slice(body);
    out
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportKind {
    Udp,
    Pipe,
}

/// What a connection needs from its transport. Implementations must not
/// call back into the engine; they either hit the socket layer or a peer
/// inbox.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn can_send_connect(&self) -> bool;

    fn can_send_data(&self) -> bool;

    /// Emits the transport's connect framing around the request body.
    fn send_connect_request(&mut self, body: &[u8], now: Usec) -> bool;

    fn send_connect_ok(&mut self, body: &[u8], now: Usec) -> bool;

    fn send_control(&mut self, kind: u8, body: &[u8], now: Usec) -> bool;

    /// Ships one finished packet (header plus protected payload). Returns
    /// the bytes handed to the wire, 0 on failure.
    fn send_encrypted_chunk(&mut self, chunk: &[u8], now: Usec) -> usize;

    fn populate_info(&self, info: &mut ConnectionInfo);

    fn detailed_stats(&self) -> String;
}

// ---------------------------------------------------------------------------
// Pipe loopback
// ---------------------------------------------------------------------------

/// Inbox of packets delivered by a pipe peer, drained by the service pass.
pub struct PipeInbox {
    queue: TrackedMutex<VecDeque<(Usec, Vec<u8>)>>,
}

impl PipeInbox {
    pub fn new() -> PipeInbox {
        PipeInbox {
            queue: TrackedMutex::new("pipe_inbox", LockRank::Leaf, VecDeque::new()),
        }
    }

    pub fn push(&self, timestamp: Usec, packet: Vec<u8>) {
        self.queue.lock("push").push_back((timestamp, packet));
    }

    pub fn drain(&self) -> Vec<(Usec, Vec<u8>)> {
        self.queue.lock("drain").drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock("is_empty").is_empty()
    }
}

impl Default for PipeInbox {
    fn default() -> PipeInbox {
        PipeInbox::new()
    }
}

/// Cross-thread nudge for the service loop.
pub trait ServiceWaker: Send + Sync {
    fn wake(&self);
}

impl ServiceWaker for mio::Waker {
    fn wake(&self) {
        let _ = mio::Waker::wake(self);
    }
}

/// Loopback transport: hands packets to the peer's inbox unmodified. The
/// pair runs the NULL cipher, so chunks are already in their final form.
pub struct PipeTransport {
    peer_inbox: Arc<PipeInbox>,
    waker: Arc<dyn ServiceWaker>,
}

impl PipeTransport {
    pub fn new(peer_inbox: Arc<PipeInbox>, waker: Arc<dyn ServiceWaker>) -> PipeTransport {
        PipeTransport { peer_inbox, waker }
    }
}

impl Transport for PipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    fn can_send_connect(&self) -> bool {
        true
    }

    fn can_send_data(&self) -> bool {
        true
    }

    fn send_connect_request(&mut self, _body: &[u8], _now: Usec) -> bool {
        // Pairs are born connected; there is no connect exchange.
        true
    }

    fn send_connect_ok(&mut self, _body: &[u8], _now: Usec) -> bool {
        true
    }

    fn send_control(&mut self, kind: u8, body: &[u8], now: Usec) -> bool {
        self.peer_inbox.push(now, frame_control_packet(kind, body));
        self.waker.wake();
        true
    }

    fn send_encrypted_chunk(&mut self, chunk: &[u8], now: Usec) -> usize {
        self.peer_inbox.push(now, chunk.to_vec());
        self.waker.wake();
        chunk.len()
    }

    fn populate_info(&self, info: &mut ConnectionInfo) {
        info.description = format!("pipe {}", info.description);
    }

    fn detailed_stats(&self) -> String {
        "transport=pipe".to_owned()
    }
}

// ---------------------------------------------------------------------------
// Raw UDP socket layer
// ---------------------------------------------------------------------------

/// Fake network conditioning applied on the send side, per the FakePacket*
/// configuration. Delayed copies sit in a timed queue the service thread
/// flushes.
struct FakeSim {
    loss_pct: i64,
    lag_ms: i64,
    reorder_pct: i64,
    reorder_time_ms: i64,
    dup_pct: i64,
    dup_time_max_ms: i64,
    rate_limit_bps: i64,
    rate_limit_burst: i64,
    rate_tokens: i64,
    rate_last_update: Usec,
    delayed: BinaryHeap<Reverse<(Usec, u64)>>,
    delayed_bodies: VecDeque<(u64, Vec<u8>, SocketAddr)>,
    next_delayed_id: u64,
}

impl FakeSim {
    fn from_config(config: &ConfigValues) -> FakeSim {
        FakeSim {
            loss_pct: config.fake_packet_loss_send,
            lag_ms: config.fake_packet_lag_send,
            reorder_pct: config.fake_packet_reorder_send,
            reorder_time_ms: config.fake_packet_reorder_time,
            dup_pct: config.fake_packet_dup_send,
            dup_time_max_ms: config.fake_packet_dup_time_max,
            rate_limit_bps: config.fake_rate_limit_send_rate,
            rate_limit_burst: config.fake_rate_limit_send_burst,
            rate_tokens: config.fake_rate_limit_send_burst,
            rate_last_update: 0,
            delayed: BinaryHeap::new(),
            delayed_bodies: VecDeque::new(),
            next_delayed_id: 0,
        }
    }

    fn is_passthrough(&self) -> bool {
        self.loss_pct == 0 && self.lag_ms == 0 && self.reorder_pct == 0 && self.dup_pct == 0 && self.rate_limit_bps == 0
    }

    fn queue_delayed(&mut self, deliver_at: Usec, packet: Vec<u8>, to: SocketAddr) {
        let id = self.next_delayed_id;
        self.next_delayed_id += 1;
        self.delayed.push(Reverse((deliver_at, id)));
        self.delayed_bodies.push_back((id, packet, to));
    }

    /// Decides the fate of one packet: dropped, sent now, and/or queued.
    /// Returns whether to send immediately.
    fn apply(&mut self, now: Usec, packet: &[u8], to: SocketAddr, rng: &mut impl Rng) -> bool {
        if self.rate_limit_bps > 0 {
            if self.rate_last_update != 0 {
                let accrued = self.rate_limit_bps * (now - self.rate_last_update) / 1_000_000;
                self.rate_tokens = (self.rate_tokens + accrued).min(self.rate_limit_burst.max(packet.len() as i64));
            }
            self.rate_last_update = now;
            if self.rate_tokens < packet.len() as i64 {
                return false;
            }
            self.rate_tokens -= packet.len() as i64;
        }
        if self.loss_pct > 0 && rng.gen_range(0..100) < self.loss_pct {
            return false;
        }
        if self.dup_pct > 0 && rng.gen_range(0..100) < self.dup_pct {
            let extra_ms = rng.gen_range(0..=self.dup_time_max_ms.max(1));
            self.queue_delayed(now + extra_ms * 1_000, packet.to_vec(), to);
        }
        if self.reorder_pct > 0 && rng.gen_range(0..100) < self.reorder_pct {
            self.queue_delayed(now + self.reorder_time_ms * 1_000, packet.to_vec(), to);
            return false;
        }
        if self.lag_ms > 0 {
            self.queue_delayed(now + self.lag_ms * 1_000, packet.to_vec(), to);
            return false;
        }
        true
    }

    fn next_delayed_time(&self) -> Usec {
        self.delayed.peek().map(|&Reverse((when, _))| when).unwrap_or(NEVER)
    }

    fn take_due(&mut self, now: Usec) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut due = Vec::new();
        while let Some(&Reverse((when, id))) = self.delayed.peek() {
            if when > now {
                break;
            }
            self.delayed.pop();
            if let Some(pos) = self.delayed_bodies.iter().position(|(body_id, _, _)| *body_id == id) {
                let (_, packet, to) = self.delayed_bodies.remove(pos).expect("position just found");
                due.push((packet, to));
            }
        }
        due
    }
}

/// One bound UDP socket, shareable between a listen socket and the client
/// connections using it. Send is lock-free on the socket itself; only the
/// fake-network state takes a short leaf lock.
pub struct RawSocket {
    socket: UdpSocket,
    pub token: Token,
    local_addr: SocketAddr,
    sim: TrackedMutex<FakeSim>,
    recv_loss_pct: i64,
    packet_trace_max: i64,
    log: Logger,
}

impl RawSocket {
    /// Binds and registers a socket for readable events.
    pub fn open(
        bind_addr: SocketAddr,
        token: Token,
        registry: &Registry,
        config: &ConfigValues,
        log: Logger,
    ) -> io::Result<Arc<RawSocket>> {
        let mut socket = UdpSocket::bind(bind_addr)?;
        registry.register(&mut socket, token, Interest::READABLE)?;
        let local_addr = socket.local_addr()?;
        Ok(Arc::new(RawSocket {
            socket,
            token,
            local_addr,
            sim: TrackedMutex::new("raw_socket_sim", LockRank::Leaf, FakeSim::from_config(config)),
            recv_loss_pct: config.fake_packet_loss_recv,
            packet_trace_max: config.packet_trace_max_bytes,
            log,
        }))
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn trace_packet(&self, direction: &str, packet: &[u8], addr: SocketAddr) {
        if self.packet_trace_max > 0 {
            let shown = packet.len().min(self.packet_trace_max as usize);
            trace!(self.log, "packet trace";
                   "dir" => direction,
                   "addr" => %addr,
                   "len" => packet.len(),
                   "hex" => hex::encode(&packet[..shown]));
        }
    }

    /// Sends one datagram, applying the fake-network conditioning.
    pub fn send_to(&self, packet: &[u8], to: SocketAddr, now: Usec) -> usize {
        self.trace_packet("send", packet, to);
        {
            let mut sim = self.sim.lock("send_conditioning");
            if !sim.is_passthrough() {
                let send_now = sim.apply(now, packet, to, &mut rand::thread_rng());
                if !send_now {
                    // Dropped or queued; the caller still counts it as sent.
                    return packet.len();
                }
            }
        }
        match self.socket.send_to(packet, to) {
            Ok(sent) => sent,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => 0,
            Err(err) => {
                warn!(self.log, "udp send failed"; "addr" => %to, "err" => %err);
                0
            }
        }
    }

    /// Gather-send: concatenates the parts into one datagram.
    pub fn send_gather(&self, parts: &[&[u8]], to: SocketAddr, now: Usec) -> usize {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let mut packet = Vec::with_capacity(total);
        for part in parts {
            packet.extend_from_slice(part);
        }
        self.send_to(&packet, to, now)
    }

    /// Deadline of the earliest conditioning-delayed packet.
    pub fn next_delayed_flush(&self) -> Usec {
        self.sim.lock("peek_delayed").next_delayed_time()
    }

    /// Flushes conditioning-delayed packets that are now due. Returns the
    /// next flush deadline.
    pub fn flush_delayed(&self, now: Usec) -> Usec {
        let due = {
            let mut sim = self.sim.lock("flush_delayed");
            sim.take_due(now)
        };
        for (packet, to) in due {
            let _ = self.socket.send_to(&packet, to);
        }
        self.sim.lock("next_delayed").next_delayed_time()
    }

    /// Drains all readable datagrams into the callback, applying the
    /// receive-side fake loss.
    pub fn recv_all(&self, now: Usec, mut callback: impl FnMut(&[u8], SocketAddr, Usec)) {
        let mut buf = [0u8; 0x10000];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if self.recv_loss_pct > 0 && rand::thread_rng().gen_range(0..100) < self.recv_loss_pct {
                        continue;
                    }
                    self.trace_packet("recv", &buf[..len], from);
                    callback(&buf[..len], from, now);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(self.log, "udp recv failed"; "err" => %err);
                    break;
                }
            }
        }
    }
}

/// UDP transport for one connection: frames packets to a fixed remote over
/// a shared or dedicated socket.
pub struct UdpTransport {
    socket: Arc<RawSocket>,
    remote: SocketAddr,
}

impl UdpTransport {
    pub fn new(socket: Arc<RawSocket>, remote: SocketAddr) -> UdpTransport {
        UdpTransport { socket, remote }
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    #[inline]
    pub fn socket(&self) -> &Arc<RawSocket> {
        &self.socket
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn can_send_connect(&self) -> bool {
        true
    }

    fn can_send_data(&self) -> bool {
        true
    }

    fn send_connect_request(&mut self, body: &[u8], now: Usec) -> bool {
        self.socket
            .send_gather(&[&[PKT_KIND_CONNECT_REQUEST], body], self.remote, now)
            > 0
    }

    fn send_connect_ok(&mut self, body: &[u8], now: Usec) -> bool {
        self.socket.send_gather(&[&[PKT_KIND_CONNECT_OK], body], self.remote, now) > 0
    }

    fn send_control(&mut self, kind: u8, body: &[u8], now: Usec) -> bool {
        self.socket.send_gather(&[&[kind], body], self.remote, now) > 0
    }

    fn send_encrypted_chunk(&mut self, chunk: &[u8], now: Usec) -> usize {
        self.socket.send_to(chunk, self.remote, now)
    }

    fn populate_info(&self, info: &mut ConnectionInfo) {
        info.remote_addr = Some(self.remote);
    }

    fn detailed_stats(&self) -> String {
        format!("transport=udp remote={} local={}", self.remote, self.socket.local_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon::logging::discard_root;

    #[test]
    fn test_data_header_roundtrip() {
        let mut packet = Vec::new();
        encode_data_header(&mut packet, 0xdead_0001, 0x1_2345);
        packet.extend_from_slice(b"ciphertext");
        let (header, payload) = parse_data_header(&packet).unwrap();
        assert_eq!(header.to_conn_id, 0xdead_0001);
        assert_eq!(header.wire_pkt_num, 0x2345);
        assert_eq!(payload, b"ciphertext");
    }

    #[test]
    fn test_data_header_rejects_other_kinds() {
        assert!(parse_data_header(&[PKT_KIND_CONNECT_REQUEST, 0, 0, 0, 0, 0, 0]).is_none());
        assert!(parse_data_header(&[PKT_KIND_DATA, 0, 0]).is_none());
    }

    #[test]
    fn test_pipe_inbox_delivery() {
        struct NullWaker;
        impl ServiceWaker for NullWaker {
            fn wake(&self) {}
        }

        let inbox = Arc::new(PipeInbox::new());
        let mut pipe = PipeTransport::new(inbox.clone(), Arc::new(NullWaker));
        assert_eq!(pipe.send_encrypted_chunk(b"chunk-a", 100), 7);
        assert!(pipe.send_control(PKT_KIND_CONNECTION_CLOSED, b"bye", 200));

        let packets = inbox.drain();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], (100, b"chunk-a".to_vec()));
        assert_eq!(packets[1].1[0], PKT_KIND_CONNECTION_CLOSED);
        assert!(inbox.is_empty());
    }

    fn sim_config(mutate: impl FnOnce(&mut ConfigValues)) -> ConfigValues {
        let mut config = ConfigValues::default();
        mutate(&mut config);
        config
    }

    #[test]
    fn test_fake_sim_full_loss() {
        let config = sim_config(|c| {
            c.fake_packet_loss_send = 100;
        });
        let mut sim = FakeSim::from_config(&config);
        let to: SocketAddr = "127.0.0.1:1".parse().unwrap();
        for _ in 0..20 {
            assert!(!sim.apply(1000, b"pkt", to, &mut rand::thread_rng()));
        }
        assert_eq!(sim.next_delayed_time(), NEVER);
    }

    #[test]
    fn test_fake_sim_lag_queues() {
        let config = sim_config(|c| {
            c.fake_packet_lag_send = 30;
        });
        let mut sim = FakeSim::from_config(&config);
        let to: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(!sim.apply(1_000, b"pkt", to, &mut rand::thread_rng()));
        assert_eq!(sim.next_delayed_time(), 1_000 + 30_000);
        assert!(sim.take_due(10_000).is_empty());
        let due = sim.take_due(31_000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, b"pkt");
        assert_eq!(sim.next_delayed_time(), NEVER);
    }

    #[test]
    fn test_fake_sim_passthrough_detection() {
        let config = ConfigValues::default();
        let sim = FakeSim::from_config(&config);
        assert!(sim.is_passthrough());
        let lossy = FakeSim::from_config(&sim_config(|c| c.fake_packet_loss_send = 1));
        assert!(!lossy.is_passthrough());
    }

    #[test]
    fn test_raw_socket_roundtrip() {
        let mut poll = mio::Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        let config = ConfigValues::default();
        let log = discard_root();

        let a = RawSocket::open("127.0.0.1:0".parse().unwrap(), Token(1), &registry, &config, log.clone()).unwrap();
        let b = RawSocket::open("127.0.0.1:0".parse().unwrap(), Token(2), &registry, &config, log).unwrap();

        assert!(a.send_to(b"ping", b.local_addr(), 1000) > 0);

        let mut events = mio::Events::with_capacity(8);
        let mut received = Vec::new();
        for _ in 0..10 {
            poll.poll(&mut events, Some(std::time::Duration::from_millis(100))).unwrap();
            b.recv_all(2000, |pkt, from, _| {
                received.push((pkt.to_vec(), from));
            });
            if !received.is_empty() {
                break;
            }
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, b"ping");
        assert_eq!(received[0].1, a.local_addr());
    }
}
