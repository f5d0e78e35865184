//! Listen sockets: own their UDP socket and the accepted child connections,
//! keyed by the pair of remote identity and remote connection id so
//! retransmitted connect requests find the existing child.

use std::sync::Arc;

use hashbrown::HashMap;
use slog::Logger;

use photon::identity::Identity;

use crate::config::ConfigValues;
use crate::registry::SlotRef;
use crate::shared::ListenSocketHandle;
use crate::transport::RawSocket;

pub struct ListenSocket {
    pub handle: ListenSocketHandle,
    pub log: Logger,
    /// Configuration snapshot applied to accepted children.
    pub config: ConfigValues,
    pub socket: Option<Arc<RawSocket>>,
    /// Symmetric-connect mode, locked at creation.
    pub symmetric: bool,
    children: HashMap<(Identity, u32), SlotRef>,
}

impl ListenSocket {
    pub fn new(handle: ListenSocketHandle, log: Logger, config: ConfigValues) -> ListenSocket {
        let symmetric = config.symmetric_connect;
        ListenSocket {
            handle,
            log,
            config,
            socket: None,
            symmetric,
            children: HashMap::new(),
        }
    }

    pub fn find_child(&self, identity: &Identity, remote_conn_id: u32) -> Option<SlotRef> {
        self.children.get(&(identity.clone(), remote_conn_id)).copied()
    }

    pub fn add_child(&mut self, identity: Identity, remote_conn_id: u32, conn: SlotRef) {
        self.children.insert((identity, remote_conn_id), conn);
    }

    pub fn remove_child(&mut self, identity: &Identity, remote_conn_id: u32) {
        self.children.remove(&(identity.clone(), remote_conn_id));
    }

    #[inline]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn children(&self) -> impl Iterator<Item = SlotRef> + '_ {
        self.children.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon::logging::discard_root;

    fn slot(index: u32) -> SlotRef {
        SlotRef { index, generation: 1 }
    }

    #[test]
    fn test_child_map_keyed_by_identity_and_conn_id() {
        let mut listener = ListenSocket::new(ListenSocketHandle(1), discard_root(), ConfigValues::default());
        let alice = Identity::Named("alice".into());
        let bob = Identity::Named("bob".into());

        listener.add_child(alice.clone(), 100, slot(1));
        listener.add_child(bob.clone(), 100, slot(2));
        listener.add_child(alice.clone(), 200, slot(3));

        assert_eq!(listener.child_count(), 3);
        assert_eq!(listener.find_child(&alice, 100), Some(slot(1)));
        assert_eq!(listener.find_child(&bob, 100), Some(slot(2)));
        assert_eq!(listener.find_child(&alice, 200), Some(slot(3)));
        assert_eq!(listener.find_child(&bob, 200), None);

        listener.remove_child(&alice, 100);
        assert_eq!(listener.find_child(&alice, 100), None);
        assert_eq!(listener.child_count(), 2);
    }

    #[test]
    fn test_symmetric_flag_locked_at_creation() {
        let mut config = ConfigValues::default();
        config.symmetric_connect = true;
        let mut listener = ListenSocket::new(ListenSocketHandle(1), discard_root(), config);
        assert!(listener.symmetric);
        // Later config edits do not change the mode.
        listener.config.symmetric_connect = false;
        assert!(listener.symmetric);
    }
}
