//! Message-oriented reliable transport over unreliable datagrams.
//!
//! Connections preserve message boundaries, mix reliable and unreliable
//! messages on one session, fragment and reassemble past the MTU, pace
//! sends with a token bucket, and protect every payload end to end with
//! AES-256-GCM keys agreed through a signed-certificate handshake.

pub mod codec;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod listener;
pub mod lock;
pub mod message;
pub mod poll_group;
pub mod receiver;
pub mod registry;
pub mod scheduler;
pub mod sender;
pub mod service;
pub mod shared;
pub mod sockets;
pub mod stats;
pub mod transport;

pub use message::{ReceivedMessage, SEND_NO_DELAY, SEND_NO_NAGLE, SEND_RELIABLE, SEND_USE_CURRENT_THREAD};
pub use shared::{
    Cipher, ConnectionHandle, ConnectionInfo, ConnectionState, EndReason, ListenSocketHandle, PollGroupHandle,
    StatusChanged,
};
pub use sockets::Sockets;
