//! The background service thread.
//!
//! One loop owns the OS poll. Each pass: sleep in the poll until the next
//! engine deadline or a wakeup, then under the global lock read the sockets,
//! drain pipe inboxes, run due thinkers, and flush fake-network delays. The
//! poll is the only place the thread blocks; the lock is released before
//! sleeping and reacquired after.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use mio::{Events, Poll};
use slog::{trace, warn};

use photon::time::{now_usec, timestamp_secs, Usec, NEVER};

use crate::connection::Connection;
use crate::handshake::{ConnectOk, ConnectRequest, ConnectionClosed, NoConnection};
use crate::registry::SlotRef;
use crate::sockets::{
    finish_connection_service, handle_connect_request, reply_no_connection, EngineInner, EngineShared, SocketOwner,
    WAKER_TOKEN,
};
use crate::transport::{
    parse_data_header, PingBody, RawSocket, PKT_KIND_CONNECTION_CLOSED, PKT_KIND_CONNECT_OK,
    PKT_KIND_CONNECT_REQUEST, PKT_KIND_DATA, PKT_KIND_NO_CONNECTION, PKT_KIND_PING, PKT_KIND_PONG,
};

pub(crate) fn spawn(shared: Arc<EngineShared>, poll: Poll) -> io::Result<JoinHandle<()>> {
    Builder::new()
        .name("quanta-service".to_owned())
        .spawn(move || run(shared, poll))
}

fn run(shared: Arc<EngineShared>, mut poll: Poll) {
    let mut events = Events::with_capacity(1024);

    loop {
        let timeout = next_wake_timeout(&shared);
        if let Err(err) = poll.poll(&mut events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(shared.log, "service poll failed"; "err" => %err);
            break;
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let now = now_usec();
        let mut inner = shared.inner.lock("service_pass");

        // Sockets with readable events.
        let mut ready: Vec<(Arc<RawSocket>, SocketOwner)> = Vec::new();
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            if let Some((socket, owner)) = inner.sockets_by_token.get(&event.token()) {
                ready.push((socket.clone(), *owner));
            }
        }
        for (socket, owner) in ready {
            let mut packets: Vec<(Vec<u8>, SocketAddr, Usec)> = Vec::new();
            socket.recv_all(now, |pkt, from, ts| packets.push((pkt.to_vec(), from, ts)));
            for (pkt, from, ts) in packets {
                dispatch_packet(&mut inner, &shared, &socket, owner, &pkt, from, ts);
            }
        }

        // Loopback deliveries.
        let pipe_slots: Vec<SlotRef> = inner.pipe_conns.clone();
        for slot in pipe_slots {
            let inbox = inner.connections.get(slot).and_then(|c| c.pipe_inbox.clone());
            let Some(inbox) = inbox else { continue };
            for (_, pkt) in inbox.drain() {
                dispatch_pipe_packet(&mut inner, slot, &pkt, now);
            }
            finish_connection_service(&mut inner, slot, now);
        }

        // Due thinkers.
        while let Some(slot) = inner.scheduler.pop_due(now) {
            if let Some(conn) = inner.connections.get_mut(slot) {
                conn.think(now);
            }
            finish_connection_service(&mut inner, slot, now);
        }

        // Fake-network delayed sends, outside the global lock.
        let sockets: Vec<Arc<RawSocket>> = inner.sockets_by_token.values().map(|(s, _)| s.clone()).collect();
        drop(inner);
        for socket in sockets {
            socket.flush_delayed(now);
        }
    }
    trace!(shared.log, "service thread exiting");
}

/// Poll timeout until the next engine deadline.
fn next_wake_timeout(shared: &Arc<EngineShared>) -> Option<Duration> {
    let mut inner = shared.inner.lock("compute_timeout");
    let now = now_usec();
    let mut next = inner.scheduler.next_time();

    let pipe_slots: Vec<SlotRef> = inner.pipe_conns.clone();
    for slot in pipe_slots {
        if let Some(conn) = inner.connections.get(slot) {
            if let Some(inbox) = &conn.pipe_inbox {
                if !inbox.is_empty() {
                    next = now;
                }
            }
        }
    }
    for (socket, _) in inner.sockets_by_token.values() {
        next = next.min(socket.next_delayed_flush());
    }

    if next == NEVER {
        None
    } else {
        Some(Duration::from_micros((next - now).max(0) as u64))
    }
}

fn route_to_conn(
    inner: &mut EngineInner,
    to_conn_id: u32,
    now: Usec,
    op: impl FnOnce(&mut Connection, Usec),
) -> bool {
    let Some(&slot) = inner.conn_by_id.get(&to_conn_id) else {
        return false;
    };
    if let Some(conn) = inner.connections.get_mut(slot) {
        op(conn, now);
    }
    finish_connection_service(inner, slot, now);
    true
}

fn dispatch_packet(
    inner: &mut EngineInner,
    shared: &Arc<EngineShared>,
    socket: &Arc<RawSocket>,
    owner: SocketOwner,
    pkt: &[u8],
    from: SocketAddr,
    now: Usec,
) {
    match pkt.first() {
        Some(&PKT_KIND_DATA) => {
            let Some((header, payload)) = parse_data_header(pkt) else {
                return;
            };
            // Unknown destinations are ignored: a data packet does not name
            // its sender, so there is nobody to answer.
            route_to_conn(inner, header.to_conn_id, now, |conn, now| {
                conn.on_data_packet(header.wire_pkt_num, payload, now);
            });
        }
        Some(&PKT_KIND_CONNECT_REQUEST) => {
            let SocketOwner::Listen(listen_slot) = owner else {
                return;
            };
            match ConnectRequest::parse(&pkt[1..]) {
                Ok(request) => handle_connect_request(inner, shared, listen_slot, socket, request, from, now),
                Err(err) => {
                    trace!(shared.log, "malformed connect request"; "from" => %from, "err" => ?err);
                }
            }
        }
        Some(&PKT_KIND_CONNECT_OK) => {
            let Ok(ok) = ConnectOk::parse(&pkt[1..]) else {
                return;
            };
            let Some(&slot) = inner.conn_by_id.get(&ok.client_conn_id) else {
                return;
            };
            let EngineInner {
                connections,
                cert_store,
                ..
            } = &mut *inner;
            if let Some(conn) = connections.get_mut(slot) {
                conn.on_connect_ok(&ok, cert_store, timestamp_secs(), now);
            }
            finish_connection_service(inner, slot, now);
        }
        Some(&PKT_KIND_CONNECTION_CLOSED) => {
            let Ok(closed) = ConnectionClosed::parse(&pkt[1..]) else {
                return;
            };
            let routed = route_to_conn(inner, closed.to_conn_id, now, |conn, now| {
                conn.on_connection_closed(closed.reason, &closed.debug, now);
            });
            if !routed && closed.from_conn_id != 0 {
                reply_no_connection(socket, closed.from_conn_id, from, now);
            }
        }
        Some(&PKT_KIND_NO_CONNECTION) => {
            if let Ok(body) = NoConnection::parse(&pkt[1..]) {
                route_to_conn(inner, body.to_conn_id, now, |conn, now| conn.on_no_connection(now));
            }
        }
        Some(&PKT_KIND_PING) => {
            if let Some(body) = PingBody::parse(&pkt[1..]) {
                route_to_conn(inner, body.to_conn_id, now, |conn, now| {
                    conn.on_ping(body.reply_requested, now);
                });
            }
        }
        Some(&PKT_KIND_PONG) => {
            if let Some(body) = PingBody::parse(&pkt[1..]) {
                route_to_conn(inner, body.to_conn_id, now, |conn, now| conn.on_ping(false, now));
            }
        }
        _ => {}
    }
}

/// Pipe packets are already addressed: the inbox belongs to one connection.
fn dispatch_pipe_packet(inner: &mut EngineInner, slot: SlotRef, pkt: &[u8], now: Usec) {
    let Some(conn) = inner.connections.get_mut(slot) else {
        return;
    };
    match pkt.first() {
        Some(&PKT_KIND_DATA) => {
            if let Some((header, payload)) = parse_data_header(pkt) {
                conn.on_data_packet(header.wire_pkt_num, payload, now);
            }
        }
        Some(&PKT_KIND_CONNECTION_CLOSED) => {
            if let Ok(closed) = ConnectionClosed::parse(&pkt[1..]) {
                conn.on_connection_closed(closed.reason, &closed.debug, now);
            }
        }
        Some(&PKT_KIND_NO_CONNECTION) => conn.on_no_connection(now),
        Some(&PKT_KIND_PING) => {
            if let Some(body) = PingBody::parse(&pkt[1..]) {
                conn.on_ping(body.reply_requested, now);
            }
        }
        Some(&PKT_KIND_PONG) => conn.on_ping(false, now),
        _ => {}
    }
}
