//! Message records for both directions of a connection.
//!
//! Inbound messages transfer ownership to the application when polled.
//! Outbound records live on the connection's send queue until serialized;
//! reliable records then move to the unacked list until every byte of their
//! stream range has been acknowledged.

use std::collections::VecDeque;

use photon::time::Usec;

use crate::shared::ConnectionHandle;

/// Hold the message for Nagle coalescing is the default; this flag skips it.
pub const SEND_NO_NAGLE: u32 = 1;
/// Bypass rate limiting for this message if the bucket would delay it.
pub const SEND_NO_DELAY: u32 = 4;
pub const SEND_RELIABLE: u32 = 8;
/// Drive the send pump on the calling thread instead of waking the service
/// thread, when the connection is not throttled.
pub const SEND_USE_CURRENT_THREAD: u32 = 16;

/// A message delivered to the application.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub payload: Vec<u8>,
    pub msg_num: i64,
    pub flags: u32,
    pub channel: i32,
    pub connection: ConnectionHandle,
    pub conn_user_data: i64,
    /// Arrival time; also the poll-group ordering key.
    pub timestamp: Usec,
}

/// An outbound message queued on a connection.
///
/// For reliable messages `payload` is the stream image: the variable-length
/// reliable header followed by the application bytes. `stream_pos` names the
/// position of the first image byte in the reliable byte stream.
#[derive(Debug)]
pub struct SendMessage {
    pub payload: Vec<u8>,
    pub msg_num: i64,
    pub flags: u32,
    pub stream_pos: i64,
    pub header_len: usize,
    pub nagle_deadline: Usec,
    /// Serialization progress for unreliable fragmentation.
    pub sent_offset: usize,
}

impl SendMessage {
    #[inline]
    pub fn is_reliable(&self) -> bool {
        self.flags & SEND_RELIABLE != 0
    }

    /// One past the last stream position of a reliable message's image.
    #[inline]
    pub fn stream_end(&self) -> i64 {
        debug_assert!(self.is_reliable());
        self.stream_pos + self.payload.len() as i64
    }

    /// Size charged against the send buffer: the application bytes.
    #[inline]
    pub fn app_size(&self) -> usize {
        self.payload.len() - self.header_len
    }
}

/// FIFO of queued outbound messages with a running byte total.
#[derive(Default)]
pub struct SendQueue {
    messages: VecDeque<SendMessage>,
    pending_bytes: usize,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Queued application bytes not yet handed to the wire.
    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn push_back(&mut self, msg: SendMessage) {
        self.pending_bytes += msg.app_size();
        self.messages.push_back(msg);
    }

    pub fn pop_front(&mut self) -> Option<SendMessage> {
        let msg = self.messages.pop_front()?;
        self.pending_bytes -= msg.app_size();
        Some(msg)
    }

    #[inline]
    pub fn front(&self) -> Option<&SendMessage> {
        self.messages.front()
    }

    #[inline]
    pub fn front_mut(&mut self) -> Option<&mut SendMessage> {
        self.messages.front_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SendMessage> {
        self.messages.iter()
    }

    /// Clears every queued Nagle deadline; used when a no-Nagle send must
    /// flush everything ahead of it.
    pub fn clear_nagle_deadlines(&mut self) {
        for msg in self.messages.iter_mut() {
            msg.nagle_deadline = 0;
        }
    }

    /// Earliest Nagle deadline, which is always the head's: deadlines are
    /// assigned from a monotonic clock at queue time.
    #[inline]
    pub fn next_nagle_deadline(&self) -> Option<Usec> {
        self.messages.front().map(|m| m.nagle_deadline)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.pending_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reliable_msg(msg_num: i64, header_len: usize, body: &[u8], stream_pos: i64) -> SendMessage {
        let mut payload = vec![0xaa; header_len];
        payload.extend_from_slice(body);
        SendMessage {
            payload,
            msg_num,
            flags: SEND_RELIABLE,
            stream_pos,
            header_len,
            nagle_deadline: 100,
            sent_offset: 0,
        }
    }

    #[test]
    fn test_send_queue_accounting() {
        let mut queue = SendQueue::new();
        queue.push_back(reliable_msg(1, 2, b"hello", 1));
        queue.push_back(reliable_msg(2, 2, b"worlds", 8));
        assert_eq!(queue.pending_bytes(), 11);
        assert_eq!(queue.len(), 2);

        let head = queue.pop_front().unwrap();
        assert_eq!(head.msg_num, 1);
        assert_eq!(head.stream_end(), 1 + 7);
        assert_eq!(queue.pending_bytes(), 6);

        queue.clear();
        assert_eq!(queue.pending_bytes(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear_nagle_deadlines() {
        let mut queue = SendQueue::new();
        queue.push_back(reliable_msg(1, 2, b"a", 1));
        queue.push_back(reliable_msg(2, 2, b"b", 4));
        queue.clear_nagle_deadlines();
        assert_eq!(queue.next_nagle_deadline(), Some(0));
        assert!(queue.iter().all(|m| m.nagle_deadline == 0));
    }
}
