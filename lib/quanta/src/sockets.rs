//! The application-facing sockets interface and the engine state behind it.
//!
//! All engine state lives in [`EngineInner`] behind the single global lock.
//! API calls from any thread acquire it briefly, mutate, nudge the service
//! thread when deadlines moved, and return; only the service thread blocks,
//! and only inside the OS poll.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use hashbrown::HashMap;
use mio::{Registry, Token, Waker};
use slog::{debug, info, warn, Logger};

use photon::cert::{AuthScope, CertError, CertStore};
use photon::crypto::Role;
use photon::identity::Identity;
use photon::time::{now_usec, timestamp_secs, Usec, NEVER};

use crate::config::{ConfigKey, ConfigValues};
use crate::connection::{CallbackQueue, Connection, ConnectionParams};
use crate::handshake::{ConnectRequest, ConnectionClosed, LocalCredentials, NoConnection};
use crate::lock::{LockRank, TrackedMutex, DEFAULT_HOLD_WARN_THRESHOLD};
use crate::message::{ReceivedMessage, SEND_USE_CURRENT_THREAD};
use crate::poll_group::PollGroup;
use crate::registry::{ConnIdRing, Slab, SlotRef};
use crate::scheduler::ThinkerHeap;
use crate::sender::SendError;
use crate::service;
use crate::shared::{ConnectionHandle, ConnectionInfo, EndReason, ListenSocketHandle, PollGroupHandle};
use crate::transport::{PipeInbox, PipeTransport, RawSocket, ServiceWaker, UdpTransport, PKT_KIND_CONNECTION_CLOSED};
use crate::listener::ListenSocket;

pub(crate) const WAKER_TOKEN: Token = Token(0);

#[derive(Copy, Clone)]
pub(crate) enum SocketOwner {
    Listen(SlotRef),
    Connection(SlotRef),
}

pub(crate) struct EngineInner {
    pub connections: Slab<Connection>,
    pub listen_sockets: Slab<ListenSocket>,
    pub poll_groups: Slab<PollGroup>,

    pub conn_id_ring: ConnIdRing,
    pub conn_by_id: HashMap<u32, SlotRef>,
    pub conn_by_handle: HashMap<ConnectionHandle, SlotRef>,
    pub listen_by_handle: HashMap<ListenSocketHandle, SlotRef>,
    pub group_by_handle: HashMap<PollGroupHandle, SlotRef>,

    pub sockets_by_token: HashMap<Token, (Arc<RawSocket>, SocketOwner)>,
    pub pipe_conns: Vec<SlotRef>,

    pub scheduler: ThinkerHeap<SlotRef>,
    pub default_config: ConfigValues,
    pub credentials: Arc<LocalCredentials>,
    pub cert_store: CertStore,

    next_token: usize,
    next_listen_handle: u32,
    next_group_handle: u32,
}

pub(crate) struct EngineShared {
    pub inner: TrackedMutex<EngineInner>,
    pub callbacks: Arc<CallbackQueue>,
    pub waker: Arc<Waker>,
    pub registry: Registry,
    pub log: Logger,
    pub shutdown: AtomicBool,
}

/// The engine handle. Creating one spins up the service thread; dropping it
/// shuts the thread down.
pub struct Sockets {
    shared: Arc<EngineShared>,
    service_thread: Option<JoinHandle<()>>,
}

impl Sockets {
    /// Creates an engine with self-signed credentials for `identity`.
    pub fn new(log: Logger, identity: Identity, app_id: u32) -> io::Result<Sockets> {
        let poll = mio::Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let credentials = Arc::new(LocalCredentials::self_signed(identity, app_id));

        let shared = Arc::new(EngineShared {
            inner: TrackedMutex::new("engine", LockRank::Global, EngineInner {
                connections: Slab::new(),
                listen_sockets: Slab::new(),
                poll_groups: Slab::new(),
                conn_id_ring: ConnIdRing::new(),
                conn_by_id: HashMap::new(),
                conn_by_handle: HashMap::new(),
                listen_by_handle: HashMap::new(),
                group_by_handle: HashMap::new(),
                sockets_by_token: HashMap::new(),
                pipe_conns: Vec::new(),
                scheduler: ThinkerHeap::new(),
                default_config: ConfigValues::default(),
                credentials,
                cert_store: CertStore::new(),
                next_token: 1,
                next_listen_handle: 1,
                next_group_handle: 1,
            })
            .with_watchdog(log.clone(), DEFAULT_HOLD_WARN_THRESHOLD),
            callbacks: Arc::new(CallbackQueue::new()),
            waker,
            registry,
            log,
            shutdown: AtomicBool::new(false),
        });

        let service_thread = service::spawn(shared.clone(), poll)?;
        Ok(Sockets {
            shared,
            service_thread: Some(service_thread),
        })
    }

    fn wake(&self) {
        let _ = self.shared.waker.wake();
    }

    // -----------------------------------------------------------------------
    // Configuration and trust
    // -----------------------------------------------------------------------

    /// Sets a global default; affects objects created afterwards.
    pub fn set_global_config_int(&self, key: ConfigKey, value: i64) -> bool {
        self.shared.inner.lock("set_global_config").default_config.set_int(key, value)
    }

    /// Per-connection override.
    pub fn set_connection_config_int(&self, conn: ConnectionHandle, key: ConfigKey, value: i64) -> bool {
        let mut inner = self.shared.inner.lock("set_conn_config");
        let Some(&slot) = inner.conn_by_handle.get(&conn) else {
            return false;
        };
        match inner.connections.get_mut(slot) {
            Some(connection) => connection.config.set_int(key, value),
            None => false,
        }
    }

    pub fn set_status_changed_callback(&self, callback: crate::config::StatusChangedCallback) {
        self.shared.inner.lock("set_callback").default_config.status_changed_callback = Some(callback);
    }

    pub fn add_ca_root_key(&self, key: photon::crypto::SigningPublicKey, scope: AuthScope) -> u64 {
        self.shared.inner.lock("add_ca_root").cert_store.add_root_key(key, scope)
    }

    pub fn add_cert_base64(&self, cert: &str) -> Result<u64, CertError> {
        self.shared
            .inner
            .lock("add_cert")
            .cert_store
            .add_cert_base64(cert, timestamp_secs())
    }

    pub fn add_cert_revocation(&self, key_id: u64) {
        self.shared.inner.lock("add_revocation").cert_store.add_revocation(key_id);
    }

    pub fn reset_cert_store(&self) {
        self.shared.inner.lock("reset_certs").cert_store.reset();
    }

    // -----------------------------------------------------------------------
    // Listen sockets and connections
    // -----------------------------------------------------------------------

    /// Binds a UDP listen socket and starts accepting connect requests.
    pub fn create_listen_socket_udp(&self, bind_addr: SocketAddr) -> io::Result<ListenSocketHandle> {
        let mut inner = self.shared.inner.lock("create_listen");
        let token = Token(inner.next_token);
        inner.next_token += 1;
        let config = inner.default_config.clone();
        let socket = RawSocket::open(bind_addr, token, &self.shared.registry, &config, self.shared.log.clone())?;

        let handle = ListenSocketHandle(inner.next_listen_handle);
        inner.next_listen_handle += 1;
        let log = self.shared.log.new(slog::o!("listen" => handle.0));
        let mut listener = ListenSocket::new(handle, log, config);
        listener.socket = Some(socket.clone());
        let slot = inner.listen_sockets.insert(listener);
        inner.listen_by_handle.insert(handle, slot);
        inner.sockets_by_token.insert(token, (socket, SocketOwner::Listen(slot)));
        info!(self.shared.log, "listen socket open"; "addr" => %bind_addr, "listen" => handle.0);
        Ok(handle)
    }

    /// Local address of a listen socket, for connecting to an OS-chosen port.
    pub fn listen_socket_addr(&self, handle: ListenSocketHandle) -> Option<SocketAddr> {
        let inner = self.shared.inner.lock("listen_addr");
        let &slot = inner.listen_by_handle.get(&handle)?;
        inner
            .listen_sockets
            .get(slot)
            .and_then(|l| l.socket.as_ref())
            .map(|s| s.local_addr())
    }

    pub fn close_listen_socket(&self, handle: ListenSocketHandle) -> bool {
        let mut inner = self.shared.inner.lock("close_listen");
        let Some(slot) = inner.listen_by_handle.remove(&handle) else {
            return false;
        };
        let Some(listener) = inner.listen_sockets.remove(slot) else {
            return false;
        };
        // Close every accepted child; sockets are detached logically here
        // and torn down physically once the service thread stops polling
        // them.
        let now = now_usec();
        for child in listener.children() {
            let handle = match inner.connections.get_mut(child) {
                Some(conn) => {
                    conn.listen_socket = None;
                    conn.api_close(EndReason::App(0), "Listen socket closed", false, now);
                    Some(conn.handle)
                }
                None => None,
            };
            if let Some(handle) = handle {
                inner.conn_by_handle.remove(&handle);
            }
            inner.scheduler.set_next_think(child, now);
        }
        if let Some(socket) = &listener.socket {
            inner.sockets_by_token.remove(&socket.token);
        }
        self.wake();
        true
    }

    /// Begins connecting to a UDP peer. A dedicated socket is bound for the
    /// connection.
    pub fn connect_udp(&self, remote_addr: SocketAddr, remote_identity: Option<Identity>) -> io::Result<ConnectionHandle> {
        let bind: SocketAddr = if remote_addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("constant addr")
        } else {
            "[::]:0".parse().expect("constant addr")
        };
        let now = now_usec();
        let mut inner = self.shared.inner.lock("connect_udp");
        let token = Token(inner.next_token);
        inner.next_token += 1;
        let config = inner.default_config.clone();
        let socket = RawSocket::open(bind, token, &self.shared.registry, &config, self.shared.log.clone())?;

        let slot = new_connection(
            &mut inner,
            &self.shared,
            config,
            remote_identity.or(Some(Identity::Ip(remote_addr))),
            Role::Client,
            now,
        );
        inner.sockets_by_token.insert(token, (socket.clone(), SocketOwner::Connection(slot)));
        let conn = inner.connections.get_mut(slot).expect("just inserted");
        conn.transport = Some(Box::new(UdpTransport::new(socket, remote_addr)));
        let handle = conn.handle;
        let next = conn.next_think_time(now);
        inner.scheduler.set_next_think(slot, next.min(now));
        drop(inner);
        self.wake();
        Ok(handle)
    }

    /// Creates two already-connected loopback connections. No encryption is
    /// performed on a pair.
    pub fn create_socket_pair(
        &self,
        identity_a: Identity,
        identity_b: Identity,
    ) -> (ConnectionHandle, ConnectionHandle) {
        let now = now_usec();
        let mut inner = self.shared.inner.lock("create_pair");
        let config = inner.default_config.clone();

        let slot_a = new_connection(&mut inner, &self.shared, config.clone(), Some(identity_b.clone()), Role::Client, now);
        let slot_b = new_connection(&mut inner, &self.shared, config, Some(identity_a.clone()), Role::Server, now);

        let inbox_a = Arc::new(PipeInbox::new());
        let inbox_b = Arc::new(PipeInbox::new());
        let waker: Arc<dyn ServiceWaker> = self.shared.waker.clone();

        let (id_a, id_b) = {
            let a = inner.connections.get(slot_a).expect("just inserted");
            let b = inner.connections.get(slot_b).expect("just inserted");
            (a.local_conn_id, b.local_conn_id)
        };

        let handle_a = {
            let conn = inner.connections.get_mut(slot_a).expect("just inserted");
            conn.local_identity = identity_a;
            conn.transport = Some(Box::new(PipeTransport::new(inbox_b.clone(), waker.clone())));
            conn.make_pipe_endpoint(id_b, inbox_a.clone(), now);
            conn.handle
        };
        let handle_b = {
            let conn = inner.connections.get_mut(slot_b).expect("just inserted");
            conn.local_identity = identity_b;
            conn.transport = Some(Box::new(PipeTransport::new(inbox_a, waker)));
            conn.make_pipe_endpoint(id_a, inbox_b, now);
            conn.handle
        };

        inner.pipe_conns.push(slot_a);
        inner.pipe_conns.push(slot_b);
        inner.scheduler.set_next_think(slot_a, now);
        inner.scheduler.set_next_think(slot_b, now);
        drop(inner);
        self.wake();
        (handle_a, handle_b)
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    pub fn send_message(&self, conn: ConnectionHandle, payload: Vec<u8>, flags: u32) -> Result<i64, SendError> {
        let now = now_usec();
        let mut inner = self.shared.inner.lock("send_message");
        let Some(&slot) = inner.conn_by_handle.get(&conn) else {
            return Err(SendError::InvalidParam);
        };
        let connection = inner.connections.get_mut(slot).ok_or(SendError::InvalidParam)?;
        let msg_num = connection.api_send_message(payload, flags, now)?;

        if flags & SEND_USE_CURRENT_THREAD != 0 {
            // Drive the pump on the caller when unthrottled.
            connection.think(now);
            finish_connection_service(&mut inner, slot, now);
        } else {
            let next = inner
                .connections
                .get(slot)
                .map(|c| c.next_think_time(now))
                .unwrap_or(NEVER);
            inner.scheduler.set_next_think(slot, next);
            drop(inner);
            self.wake();
        }
        Ok(msg_num)
    }

    /// Drains up to `max` messages from one connection's receive queue.
    pub fn receive_messages(&self, conn: ConnectionHandle, max: usize) -> Vec<ReceivedMessage> {
        let mut inner = self.shared.inner.lock("receive_messages");
        let Some(&slot) = inner.conn_by_handle.get(&conn) else {
            return Vec::new();
        };
        let Some(connection) = inner.connections.get_mut(slot) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while out.len() < max {
            match connection.poll_message() {
                Some(msg) => out.push(msg),
                None => break,
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Poll groups
    // -----------------------------------------------------------------------

    pub fn create_poll_group(&self) -> PollGroupHandle {
        let mut inner = self.shared.inner.lock("create_poll_group");
        let handle = PollGroupHandle(inner.next_group_handle);
        inner.next_group_handle += 1;
        let slot = inner.poll_groups.insert(PollGroup::new(handle));
        inner.group_by_handle.insert(handle, slot);
        handle
    }

    pub fn destroy_poll_group(&self, group: PollGroupHandle) -> bool {
        let mut inner = self.shared.inner.lock("destroy_poll_group");
        let Some(slot) = inner.group_by_handle.remove(&group) else {
            return false;
        };
        if let Some(removed) = inner.poll_groups.remove(slot) {
            for member in removed.members() {
                if let Some(conn) = inner.connections.get_mut(member) {
                    conn.poll_group = None;
                }
            }
        }
        true
    }

    /// Moves a connection into (or out of) a poll group.
    pub fn set_connection_poll_group(&self, conn: ConnectionHandle, group: Option<PollGroupHandle>) -> bool {
        let mut inner = self.shared.inner.lock("set_poll_group");
        let Some(&conn_slot) = inner.conn_by_handle.get(&conn) else {
            return false;
        };
        let old_group = match inner.connections.get(conn_slot) {
            Some(connection) => connection.poll_group,
            None => return false,
        };
        if let Some((_, old_slot)) = old_group {
            if let Some(old) = inner.poll_groups.get_mut(old_slot) {
                old.remove_member(conn_slot);
            }
        }
        let new_membership = match group {
            Some(handle) => {
                let Some(&group_slot) = inner.group_by_handle.get(&handle) else {
                    return false;
                };
                let Some(poll_group) = inner.poll_groups.get_mut(group_slot) else {
                    return false;
                };
                poll_group.add_member(conn_slot);
                // Messages already queued become visible to the group.
                let queued = inner
                    .connections
                    .get(conn_slot)
                    .map(|c| c.receive_queue_len())
                    .unwrap_or(0);
                if queued > 0 {
                    let poll_group = inner.poll_groups.get_mut(group_slot).expect("checked above");
                    poll_group.note_delivered(conn_slot, now_usec(), queued);
                }
                Some((handle, group_slot))
            }
            None => None,
        };
        if let Some(connection) = inner.connections.get_mut(conn_slot) {
            connection.poll_group = new_membership;
        }
        true
    }

    /// Drains up to `max` messages across a poll group, in best-effort
    /// arrival order.
    pub fn receive_messages_on_poll_group(&self, group: PollGroupHandle, max: usize) -> Vec<ReceivedMessage> {
        let mut inner = self.shared.inner.lock("receive_group");
        let Some(&group_slot) = inner.group_by_handle.get(&group) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while out.len() < max {
            let Some(poll_group) = inner.poll_groups.get_mut(group_slot) else {
                break;
            };
            let Some(conn_slot) = poll_group.pop_next() else {
                break;
            };
            // Weak reference: the connection may be gone.
            if let Some(connection) = inner.connections.get_mut(conn_slot) {
                if let Some(msg) = connection.poll_message() {
                    out.push(msg);
                }
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Closes a connection and releases its handle. With `linger`, queued
    /// reliable data drains first.
    pub fn close_connection(&self, conn: ConnectionHandle, reason: u32, debug_msg: &str, linger: bool) -> bool {
        let now = now_usec();
        let mut inner = self.shared.inner.lock("close_connection");
        let Some(&slot) = inner.conn_by_handle.get(&conn) else {
            return false;
        };
        let Some(connection) = inner.connections.get_mut(slot) else {
            return false;
        };
        connection.api_close(EndReason::App(reason), debug_msg, linger, now);

        // Handle released: unlink the app-facing maps and the poll group.
        inner.conn_by_handle.remove(&conn);
        if let Some(connection) = inner.connections.get(slot) {
            if let Some((_, group_slot)) = connection.poll_group {
                if let Some(poll_group) = inner.poll_groups.get_mut(group_slot) {
                    poll_group.remove_member(slot);
                }
            }
        }
        if let Some(connection) = inner.connections.get_mut(slot) {
            connection.poll_group = None;
        }
        let next = inner
            .connections
            .get(slot)
            .map(|c| c.next_think_time(now))
            .unwrap_or(now);
        inner.scheduler.set_next_think(slot, next.min(now));
        drop(inner);
        self.wake();
        true
    }

    pub fn connection_info(&self, conn: ConnectionHandle) -> Option<ConnectionInfo> {
        let inner = self.shared.inner.lock("connection_info");
        let &slot = inner.conn_by_handle.get(&conn)?;
        inner.connections.get(slot).map(Connection::info)
    }

    pub fn detailed_connection_stats(&self, conn: ConnectionHandle) -> Option<String> {
        let inner = self.shared.inner.lock("detailed_stats");
        let &slot = inner.conn_by_handle.get(&conn)?;
        let connection = inner.connections.get(slot)?;
        let transport = connection
            .transport
            .as_ref()
            .map(|t| t.detailed_stats())
            .unwrap_or_else(|| "transport=none".to_owned());
        let counters = connection.stats.counters;
        Some(format!(
            "{} state={:?} ping_usec={:?} sent_pkts={} recv_pkts={} undecryptable={} dup={}",
            transport,
            connection.api_state(),
            connection.stats.ping().smoothed(),
            counters.sent_pkts,
            counters.recv_pkts,
            counters.recv_undecryptable,
            counters.recv_duplicate,
        ))
    }

    pub fn set_connection_user_data(&self, conn: ConnectionHandle, user_data: i64) -> bool {
        let mut inner = self.shared.inner.lock("set_user_data");
        let Some(&slot) = inner.conn_by_handle.get(&conn) else {
            return false;
        };
        match inner.connections.get_mut(slot) {
            Some(connection) => {
                connection.user_data = user_data;
                true
            }
            None => false,
        }
    }

    /// Dispatches queued status-changed notifications on the calling
    /// thread. Nothing engine-internal is held while callbacks run.
    pub fn run_callbacks(&self) -> usize {
        let events = self.shared.callbacks.drain();
        let count = events.len();
        for event in events {
            if let Some(callback) = &event.callback {
                callback(&event.status);
            }
        }
        count
    }
}

impl Drop for Sockets {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shared.waker.wake();
        if let Some(handle) = self.service_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Allocates a connection: id, handle, slab slot, maps and logger.
pub(crate) fn new_connection(
    inner: &mut EngineInner,
    shared: &EngineShared,
    config: ConfigValues,
    remote_identity: Option<Identity>,
    role: Role,
    now: Usec,
) -> SlotRef {
    let conn_by_id = &inner.conn_by_id;
    let conn_by_handle = &inner.conn_by_handle;
    let local_conn_id = inner.conn_id_ring.pick_local_conn_id(|candidate| {
        conn_by_id.contains_key(&candidate)
            || conn_by_handle.contains_key(&ConnectionHandle::from_conn_id(candidate))
    });
    let handle = ConnectionHandle::from_conn_id(local_conn_id);

    let connection = Connection::new(ConnectionParams {
        log: shared.log.clone(),
        handle,
        self_slot: SlotRef { index: 0, generation: 0 },
        local_conn_id,
        local_identity: inner.credentials.identity.clone(),
        remote_identity,
        config,
        credentials: inner.credentials.clone(),
        callbacks: shared.callbacks.clone(),
        role,
        now,
    });
    let slot = inner.connections.insert(connection);
    inner
        .connections
        .get_mut(slot)
        .expect("just inserted")
        .self_slot = slot;
    inner.conn_by_id.insert(local_conn_id, slot);
    inner.conn_by_handle.insert(handle, slot);
    slot
}

/// Post-service bookkeeping for one connection: poll-group entries for new
/// deliveries, destruction, and rescheduling.
pub(crate) fn finish_connection_service(inner: &mut EngineInner, slot: SlotRef, now: Usec) {
    let (delivered, group, timestamp, destroyed, next_think) = match inner.connections.get_mut(slot) {
        Some(conn) => (
            conn.take_delivered_count(),
            conn.poll_group,
            now,
            conn.destroyed,
            conn.next_think_time(now),
        ),
        None => return,
    };

    if delivered > 0 {
        if let Some((_, group_slot)) = group {
            if let Some(poll_group) = inner.poll_groups.get_mut(group_slot) {
                poll_group.note_delivered(slot, timestamp, delivered);
            }
        }
    }

    if destroyed {
        destroy_connection(inner, slot);
        return;
    }
    inner.scheduler.set_next_think(slot, next_think);
}

pub(crate) fn destroy_connection(inner: &mut EngineInner, slot: SlotRef) {
    let Some(conn) = inner.connections.remove(slot) else {
        return;
    };
    debug!(conn.log, "connection destroyed");
    inner.conn_by_id.remove(&conn.local_conn_id);
    inner.conn_by_handle.remove(&conn.handle);
    inner.scheduler.remove(slot);
    inner.pipe_conns.retain(|&s| s != slot);
    if let Some((_, group_slot)) = conn.poll_group {
        if let Some(poll_group) = inner.poll_groups.get_mut(group_slot) {
            poll_group.remove_member(slot);
        }
    }
    if let (Some(listen_handle), Some(identity)) = (conn.listen_socket, conn.remote_identity.as_ref()) {
        if let Some(&listen_slot) = inner.listen_by_handle.get(&listen_handle) {
            if let Some(listener) = inner.listen_sockets.get_mut(listen_slot) {
                listener.remove_child(identity, conn.remote_conn_id);
            }
        }
    }
    // A dedicated client socket dies with its connection.
    let dead_tokens: Vec<Token> = inner
        .sockets_by_token
        .iter()
        .filter_map(|(&token, (_, owner))| match owner {
            SocketOwner::Connection(owner_slot) if *owner_slot == slot => Some(token),
            _ => None,
        })
        .collect();
    for token in dead_tokens {
        inner.sockets_by_token.remove(&token);
    }
}

/// Accepts or re-answers a connect request arriving on a listen socket.
pub(crate) fn handle_connect_request(
    inner: &mut EngineInner,
    shared: &EngineShared,
    listen_slot: SlotRef,
    socket: &Arc<RawSocket>,
    request: ConnectRequest,
    from: SocketAddr,
    now: Usec,
) {
    let Some(listener) = inner.listen_sockets.get(listen_slot) else {
        return;
    };
    let listen_handle = listener.handle;
    let config = listener.config.clone();

    // Retransmitted request for an existing child: answer again.
    if let Some(child) = listener.find_child(&request.identity, request.client_conn_id) {
        if let Some(conn) = inner.connections.get_mut(child) {
            conn.resend_connect_ok(now);
        }
        return;
    }

    let slot = new_connection(
        inner,
        shared,
        config,
        Some(request.identity.clone()),
        Role::Server,
        now,
    );
    let accept_result = {
        let conn = inner.connections.get_mut(slot).expect("just inserted");
        conn.listen_socket = Some(listen_handle);
        conn.transport = Some(Box::new(UdpTransport::new(socket.clone(), from)));
        conn.complete_accept(&request, &inner.cert_store, timestamp_secs(), now)
    };

    match accept_result {
        Ok(()) => {
            if let Some(listener) = inner.listen_sockets.get_mut(listen_slot) {
                listener.add_child(request.identity.clone(), request.client_conn_id, slot);
            }
            finish_connection_service(inner, slot, now);
        }
        Err(err) => {
            warn!(shared.log, "connect request refused";
                  "identity" => %request.identity,
                  "err" => ?err);
            let refusal = ConnectionClosed {
                to_conn_id: request.client_conn_id,
                from_conn_id: 0,
                reason: err.end_reason().to_wire(),
                debug: format!("{:?}", err),
            }
            .serialize();
            let mut packet = vec![PKT_KIND_CONNECTION_CLOSED];
            packet.extend_from_slice(&refusal);
            socket.send_to(&packet, from, now);
            destroy_connection(inner, slot);
        }
    }
}

/// Sends a no-connection answer for packets addressed to nobody.
pub(crate) fn reply_no_connection(socket: &Arc<RawSocket>, to_conn_id: u32, from: SocketAddr, now: Usec) {
    let body = NoConnection {
        to_conn_id,
        from_conn_id: 0,
    }
    .serialize();
    let mut packet = vec![crate::transport::PKT_KIND_NO_CONNECTION];
    packet.extend_from_slice(&body);
    socket.send_to(&packet, from, now);
}
