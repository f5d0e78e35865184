//! Shared protocol constants, handles, and the connection-facing info types.

use std::fmt;
use std::net::SocketAddr;

use photon::identity::Identity;
use photon::time::Usec;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 10;
/// Oldest peer protocol version we will talk to.
pub const MIN_PROTOCOL_VERSION: u32 = 8;

/// Data packet header: kind byte, destination connection id, 16-bit wire
/// packet number.
pub const DATA_PKT_HEADER_SIZE: usize = 7;

pub const DEFAULT_MTU_PACKET_SIZE: usize = 1300;
pub const MIN_MTU_PACKET_SIZE: usize = 200;

/// Largest encrypted payload we will ever put in one datagram, at the
/// default MTU. Also the token-bucket burst allowance.
pub const MAX_ENCRYPTED_PAYLOAD: usize = DEFAULT_MTU_PACKET_SIZE - DATA_PKT_HEADER_SIZE;

pub const MAX_MESSAGE_SIZE_SEND: usize = 512 * 1024;
pub const MAX_MESSAGE_SIZE_RECV: usize = 512 * 1024;
/// Unreliable messages above this are coerced to reliable.
pub const MAX_UNRELIABLE_MSG_SIZE: usize = 4096;

/// Bound on tracked gaps in the received-packet map. A packet whose arrival
/// would create a gap past this limit is dropped so the sender retransmits.
pub const MAX_PACKET_GAPS: usize = 62;
pub const MAX_BUFFERED_UNRELIABLE_SEGMENTS: usize = 20;
pub const MAX_BUFFERED_RELIABLE_BYTES: usize = 64 * 1024;
pub const MAX_RELIABLE_STREAM_GAPS_EXTEND: usize = 30;
pub const MAX_RELIABLE_STREAM_GAPS_FRAGMENT: usize = 20;

/// A reliable message number may not jump by more than this within the
/// stream header, and may not run further than this ahead of the highest
/// message number seen.
pub const MAX_RELIABLE_MSG_NUM_GAP: u64 = 1_000_000;
pub const MAX_MSG_NUM_AHEAD: u64 = 10_000;

/// Decoder cap on ack/nack counts in a single ack block.
pub const ACK_COUNT_SANITY_LIMIT: u64 = 100_000;

/// A received wire packet number expanding further than this from the
/// current maximum is a protocol failure.
pub const PKT_NUM_LURCH_LIMIT: i64 = 0x4000;

pub const CONNECT_RETRY_INTERVAL: Usec = 1_000_000;
pub const FIN_WAIT_TIMEOUT: Usec = 5_000_000;
pub const LINGER_TIMEOUT: Usec = 10_000_000;
pub const KEEPALIVE_INTERVAL: Usec = 10_000_000;
pub const STATS_REPLY_TIMEOUT: Usec = 1_000_000;
pub const NACK_FLUSH_DELAY: Usec = 3_000;
pub const MAX_DATA_ACK_DELAY: Usec = 50_000;
pub const MAX_PACKETS_PER_THINK: usize = 16;

pub const SEND_RATE_FLOOR: usize = 1024;
pub const SEND_RATE_CEILING: usize = 100 * 1024 * 1024;

/// Externally visible connection handle: the low 16 bits of the local
/// connection id. Zero is invalid.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub u32);

impl ConnectionHandle {
    pub const INVALID: ConnectionHandle = ConnectionHandle(0);

    #[inline]
    pub fn from_conn_id(local_conn_id: u32) -> ConnectionHandle {
        ConnectionHandle(local_conn_id & 0xffff)
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ListenSocketHandle(pub u32);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PollGroupHandle(pub u32);

/// API-visible lifecycle states.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    None,
    Connecting,
    FindingRoute,
    Connected,
    ClosedByPeer,
    ProblemDetectedLocally,
}

/// Negotiated packet protection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Cipher {
    Null = 0,
    Aes256Gcm = 1,
}

impl Cipher {
    pub fn from_wire(value: u8) -> Option<Cipher> {
        match value {
            0 => Some(Cipher::Null),
            1 => Some(Cipher::Aes256Gcm),
            _ => None,
        }
    }
}

/// Why a connection ended, carried in the info block and on the wire in the
/// connection-closed exchange.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EndReason {
    Invalid,
    /// Application-initiated close with a user code.
    App(u32),
    /// Application-reported abnormal close.
    AppException(u32),
    RemoteBadCrypt,
    RemoteBadCert,
    RemoteBadProtocolVersion,
    MiscGeneric,
    MiscInternalError,
    MiscTimeout,
    MiscAuthConnectivity,
    MiscP2pRendezvous,
}

pub const END_REASON_APP_MIN: u32 = 1000;
pub const END_REASON_APP_MAX: u32 = 1999;
pub const END_REASON_APP_EXCEPTION_MIN: u32 = 2000;
pub const END_REASON_APP_EXCEPTION_MAX: u32 = 2999;

impl EndReason {
    pub fn to_wire(self) -> u32 {
        match self {
            EndReason::Invalid => 0,
            EndReason::App(code) => (END_REASON_APP_MIN + code).min(END_REASON_APP_MAX),
            EndReason::AppException(code) => (END_REASON_APP_EXCEPTION_MIN + code).min(END_REASON_APP_EXCEPTION_MAX),
            EndReason::RemoteBadCrypt => 4002,
            EndReason::RemoteBadCert => 4003,
            EndReason::RemoteBadProtocolVersion => 4006,
            EndReason::MiscGeneric => 5001,
            EndReason::MiscInternalError => 5002,
            EndReason::MiscTimeout => 5003,
            EndReason::MiscAuthConnectivity => 5006,
            EndReason::MiscP2pRendezvous => 5008,
        }
    }

    pub fn from_wire(value: u32) -> EndReason {
        match value {
            END_REASON_APP_MIN..=END_REASON_APP_MAX => EndReason::App(value - END_REASON_APP_MIN),
            END_REASON_APP_EXCEPTION_MIN..=END_REASON_APP_EXCEPTION_MAX => {
                EndReason::AppException(value - END_REASON_APP_EXCEPTION_MIN)
            }
            4002 => EndReason::RemoteBadCrypt,
            4003 => EndReason::RemoteBadCert,
            4006 => EndReason::RemoteBadProtocolVersion,
            5001 => EndReason::MiscGeneric,
            5002 => EndReason::MiscInternalError,
            5003 => EndReason::MiscTimeout,
            5006 => EndReason::MiscAuthConnectivity,
            5008 => EndReason::MiscP2pRendezvous,
            _ => EndReason::Invalid,
        }
    }
}

/// Snapshot of a connection for the application.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub remote_identity: Option<Identity>,
    pub remote_addr: Option<SocketAddr>,
    pub listen_socket: Option<ListenSocketHandle>,
    pub user_data: i64,
    pub state: ConnectionState,
    pub end_reason: EndReason,
    pub end_debug: String,
    pub description: String,
    pub cipher: Cipher,
}

/// Fired through the status-changed callback queue on every API-visible
/// state transition.
#[derive(Clone, Debug)]
pub struct StatusChanged {
    pub connection: ConnectionHandle,
    pub info: ConnectionInfo,
    pub old_state: ConnectionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason_wire_roundtrip() {
        let reasons = [
            EndReason::App(17),
            EndReason::AppException(3),
            EndReason::RemoteBadCrypt,
            EndReason::RemoteBadCert,
            EndReason::RemoteBadProtocolVersion,
            EndReason::MiscGeneric,
            EndReason::MiscInternalError,
            EndReason::MiscTimeout,
            EndReason::MiscAuthConnectivity,
            EndReason::MiscP2pRendezvous,
        ];
        for reason in reasons {
            assert_eq!(EndReason::from_wire(reason.to_wire()), reason);
        }
        assert_eq!(EndReason::from_wire(31337), EndReason::Invalid);
    }

    #[test]
    fn test_handle_from_conn_id() {
        assert_eq!(ConnectionHandle::from_conn_id(0xabcd_1234), ConnectionHandle(0x1234));
    }
}
