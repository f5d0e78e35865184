//! End-to-end scenarios over real UDP on the loopback interface: the signed
//! handshake, fragmentation at a reduced MTU, reordering tolerance, and the
//! connect timeout.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

use photon::identity::Identity;
use photon::logging::discard_root;
use quanta::config::ConfigKey;
use quanta::{Cipher, ConnectionHandle, ConnectionState, EndReason, Sockets, StatusChanged, SEND_RELIABLE};

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {}", what);
}

struct Harness {
    sockets: Sockets,
    events: Arc<Mutex<Vec<StatusChanged>>>,
}

impl Harness {
    fn new(name: &str) -> Harness {
        let sockets = Sockets::new(discard_root(), Identity::Named(name.to_owned()), 440).unwrap();
        let events: Arc<Mutex<Vec<StatusChanged>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        sockets.set_status_changed_callback(Arc::new(move |status: &StatusChanged| {
            sink.lock().unwrap().push(status.clone());
        }));
        Harness { sockets, events }
    }

    /// Waits for an accepted child to reach the connected state and returns
    /// its handle.
    fn wait_accepted(&self, exclude: ConnectionHandle) -> ConnectionHandle {
        let mut found = None;
        wait_until("accepted connection", || {
            self.sockets.run_callbacks();
            let events = self.events.lock().unwrap();
            for event in events.iter() {
                if event.info.state == ConnectionState::Connected && event.connection != exclude {
                    found = Some(event.connection);
                    return true;
                }
            }
            false
        });
        found.expect("wait_until returned")
    }

    fn wait_state(&self, conn: ConnectionHandle, state: ConnectionState) {
        wait_until("connection state", || {
            self.sockets.run_callbacks();
            self.sockets
                .connection_info(conn)
                .map(|info| info.state == state)
                .unwrap_or(false)
        });
    }
}

fn sent_pkts(stats: &str) -> u64 {
    stats
        .split_whitespace()
        .find_map(|field| field.strip_prefix("sent_pkts="))
        .and_then(|v| v.parse().ok())
        .expect("sent_pkts field present")
}

#[test]
fn test_udp_handshake_and_echo() {
    let harness = Harness::new("udp-host");
    let listen = harness
        .sockets
        .create_listen_socket_udp("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let addr = harness.sockets.listen_socket_addr(listen).unwrap();

    let client = harness
        .sockets
        .connect_udp(addr, Some(Identity::Named("udp-host".into())))
        .unwrap();
    harness.wait_state(client, ConnectionState::Connected);
    let server = harness.wait_accepted(client);

    // The negotiated session is encrypted and identity-bound.
    let client_info = harness.sockets.connection_info(client).unwrap();
    assert_eq!(client_info.cipher, Cipher::Aes256Gcm);
    assert_eq!(client_info.remote_identity, Some(Identity::Named("udp-host".into())));
    let server_info = harness.sockets.connection_info(server).unwrap();
    assert_eq!(server_info.cipher, Cipher::Aes256Gcm);
    assert!(server_info.listen_socket.is_some());

    harness
        .sockets
        .send_message(client, b"request".to_vec(), SEND_RELIABLE)
        .unwrap();
    let mut got = Vec::new();
    wait_until("server receives", || {
        got.extend(harness.sockets.receive_messages(server, 8));
        !got.is_empty()
    });
    assert_eq!(got[0].payload, b"request");

    harness
        .sockets
        .send_message(server, b"response".to_vec(), SEND_RELIABLE)
        .unwrap();
    let mut answer = Vec::new();
    wait_until("client receives", || {
        answer.extend(harness.sockets.receive_messages(client, 8));
        !answer.is_empty()
    });
    assert_eq!(answer[0].payload, b"response");
}

#[test]
fn test_udp_fragmentation_small_mtu() {
    let harness = Harness::new("frag-host");
    harness.sockets.set_global_config_int(ConfigKey::MtuPacketSize, 600);

    let listen = harness
        .sockets
        .create_listen_socket_udp("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let addr = harness.sockets.listen_socket_addr(listen).unwrap();
    let client = harness
        .sockets
        .connect_udp(addr, Some(Identity::Named("frag-host".into())))
        .unwrap();
    harness.wait_state(client, ConnectionState::Connected);
    let server = harness.wait_accepted(client);

    let body: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();
    harness
        .sockets
        .send_message(client, body.clone(), SEND_RELIABLE)
        .unwrap();

    let mut got = Vec::new();
    wait_until("fragmented message", || {
        got.extend(harness.sockets.receive_messages(server, 8));
        !got.is_empty()
    });
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, body);

    // At 600 bytes of MTU the payload cannot have crossed in fewer packets
    // than the segment size allows.
    let stats = harness.sockets.detailed_connection_stats(client).unwrap();
    let max_reliable_segment = 600 - 7 - 16 - 17;
    let floor = (5000 / max_reliable_segment) as u64;
    assert!(
        sent_pkts(&stats) >= floor,
        "sent_pkts {} below fragmentation floor {}",
        sent_pkts(&stats),
        floor
    );
}

#[test]
fn test_udp_many_messages_ordered_exactly_once() {
    let harness = Harness::new("order-host");
    let listen = harness
        .sockets
        .create_listen_socket_udp("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let addr = harness.sockets.listen_socket_addr(listen).unwrap();
    let client = harness
        .sockets
        .connect_udp(addr, Some(Identity::Named("order-host".into())))
        .unwrap();
    harness.wait_state(client, ConnectionState::Connected);
    let server = harness.wait_accepted(client);

    let bodies: Vec<Vec<u8>> = (0..50usize)
        .map(|i| (0..(i * 13 % 900) + 1).map(|j| ((i + j) % 256) as u8).collect())
        .collect();
    for body in &bodies {
        harness
            .sockets
            .send_message(client, body.clone(), SEND_RELIABLE)
            .unwrap();
    }

    let mut got = Vec::new();
    wait_until("all ordered messages", || {
        got.extend(harness.sockets.receive_messages(server, 64));
        got.len() >= bodies.len()
    });
    assert_eq!(got.len(), bodies.len());
    for (i, msg) in got.iter().enumerate() {
        assert_eq!(msg.payload, bodies[i], "message {} differs", i);
    }
}

#[test]
fn test_udp_unreliable_reassembly_with_reorder() {
    let harness = Harness::new("reorder-host");
    // Half the packets are held back ~30 ms on the send side.
    harness.sockets.set_global_config_int(ConfigKey::FakePacketReorderSend, 50);
    harness.sockets.set_global_config_int(ConfigKey::FakePacketReorderTime, 30);

    let listen = harness
        .sockets
        .create_listen_socket_udp("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let addr = harness.sockets.listen_socket_addr(listen).unwrap();
    let client = harness
        .sockets
        .connect_udp(addr, Some(Identity::Named("reorder-host".into())))
        .unwrap();
    harness.wait_state(client, ConnectionState::Connected);
    let server = harness.wait_accepted(client);

    let body: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
    harness.sockets.send_message(client, body.clone(), 0).unwrap();

    let mut got = Vec::new();
    wait_until("reassembled unreliable message", || {
        got.extend(harness.sockets.receive_messages(server, 8));
        !got.is_empty()
    });
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, body);
    assert_eq!(got[0].flags & SEND_RELIABLE, 0);
}

#[test]
fn test_udp_reliable_delivery_under_loss() {
    let harness = Harness::new("lossy-host");
    harness.sockets.set_global_config_int(ConfigKey::FakePacketLossSend, 30);

    let listen = harness
        .sockets
        .create_listen_socket_udp("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let addr = harness.sockets.listen_socket_addr(listen).unwrap();
    let client = harness
        .sockets
        .connect_udp(addr, Some(Identity::Named("lossy-host".into())))
        .unwrap();
    harness.wait_state(client, ConnectionState::Connected);
    let server = harness.wait_accepted(client);

    let bodies: Vec<Vec<u8>> = (0..20usize)
        .map(|i| (0..200 + i).map(|j| ((i * 31 + j) % 256) as u8).collect())
        .collect();
    for body in &bodies {
        harness
            .sockets
            .send_message(client, body.clone(), SEND_RELIABLE)
            .unwrap();
    }

    // Retransmission recovers every message, in order, exactly once.
    let mut got = Vec::new();
    wait_until("lossy delivery", || {
        got.extend(harness.sockets.receive_messages(server, 64));
        got.len() >= bodies.len()
    });
    assert_eq!(got.len(), bodies.len());
    for (i, msg) in got.iter().enumerate() {
        assert_eq!(msg.payload, bodies[i], "message {} corrupted or reordered", i);
    }
    assert!(harness.sockets.receive_messages(server, 8).is_empty());
}

#[test]
fn test_udp_connect_timeout() {
    let harness = Harness::new("timeout-host");
    harness.sockets.set_global_config_int(ConfigKey::TimeoutInitial, 500);

    // A bound socket nobody ever reads: traffic goes nowhere.
    let blackhole = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = blackhole.local_addr().unwrap();

    let started = Instant::now();
    let client = harness.sockets.connect_udp(addr, None).unwrap();
    harness.wait_state(client, ConnectionState::ProblemDetectedLocally);
    let elapsed = started.elapsed();

    let info = harness.sockets.connection_info(client).unwrap();
    assert_eq!(info.end_reason, EndReason::MiscTimeout);
    assert!(elapsed >= Duration::from_millis(400), "timed out too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "timed out too late: {:?}", elapsed);

    // The status callback fired exactly once for the failure.
    harness.sockets.run_callbacks();
    let events = harness.events.lock().unwrap();
    let failures = events
        .iter()
        .filter(|e| e.connection == client && e.info.state == ConnectionState::ProblemDetectedLocally)
        .count();
    assert_eq!(failures, 1);

    // Terminal states hold the handle until the app releases it.
    drop(events);
    assert!(harness.sockets.connection_info(client).is_some());
    assert!(harness.sockets.close_connection(client, 0, "", false));
    assert!(harness.sockets.connection_info(client).is_none());
}
