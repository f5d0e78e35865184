//! Poll groups: a secondary receive ordering aggregated across member
//! connections, so the application can drain many connections with one
//! call. Membership is weak; entries are validated against the connection
//! table when popped.

use std::collections::VecDeque;

use indexmap::IndexSet;
use photon::time::Usec;

use crate::registry::SlotRef;
use crate::shared::PollGroupHandle;

pub struct PollGroup {
    pub handle: PollGroupHandle,
    pub user_data: i64,
    members: IndexSet<SlotRef>,
    /// One entry per undelivered message on a member connection, in arrival
    /// order. Best-effort: entries go stale when a member leaves or a
    /// connection dies, and are skipped on pop.
    order: VecDeque<(Usec, SlotRef)>,
}

impl PollGroup {
    pub fn new(handle: PollGroupHandle) -> PollGroup {
        PollGroup {
            handle,
            user_data: 0,
            members: IndexSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn add_member(&mut self, conn: SlotRef) -> bool {
        self.members.insert(conn)
    }

    /// Detaches a connection, unlinking its queued entries.
    pub fn remove_member(&mut self, conn: SlotRef) {
        if self.members.shift_remove(&conn) {
            self.order.retain(|&(_, slot)| slot != conn);
        }
    }

    #[inline]
    pub fn is_member(&self, conn: SlotRef) -> bool {
        self.members.contains(&conn)
    }

    #[inline]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> impl Iterator<Item = SlotRef> + '_ {
        self.members.iter().copied()
    }

    /// Notes `count` newly delivered messages on a member connection.
    pub fn note_delivered(&mut self, conn: SlotRef, timestamp: Usec, count: usize) {
        if !self.members.contains(&conn) {
            return;
        }
        for _ in 0..count {
            self.order.push_back((timestamp, conn));
        }
    }

    /// Pops the next connection to read one message from.
    pub fn pop_next(&mut self) -> Option<SlotRef> {
        while let Some((_, conn)) = self.order.pop_front() {
            if self.members.contains(&conn) {
                return Some(conn);
            }
        }
        None
    }

    #[inline]
    pub fn queued_len(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(index: u32) -> SlotRef {
        SlotRef { index, generation: 1 }
    }

    #[test]
    fn test_delivery_order_across_members() {
        let mut group = PollGroup::new(PollGroupHandle(1));
        group.add_member(slot(1));
        group.add_member(slot(2));

        group.note_delivered(slot(1), 100, 1);
        group.note_delivered(slot(2), 150, 2);
        group.note_delivered(slot(1), 200, 1);

        assert_eq!(group.pop_next(), Some(slot(1)));
        assert_eq!(group.pop_next(), Some(slot(2)));
        assert_eq!(group.pop_next(), Some(slot(2)));
        assert_eq!(group.pop_next(), Some(slot(1)));
        assert_eq!(group.pop_next(), None);
    }

    #[test]
    fn test_non_member_deliveries_ignored() {
        let mut group = PollGroup::new(PollGroupHandle(1));
        group.add_member(slot(1));
        group.note_delivered(slot(9), 100, 3);
        assert_eq!(group.queued_len(), 0);
    }

    #[test]
    fn test_remove_member_unlinks_entries() {
        let mut group = PollGroup::new(PollGroupHandle(1));
        group.add_member(slot(1));
        group.add_member(slot(2));
        group.note_delivered(slot(1), 100, 2);
        group.note_delivered(slot(2), 120, 1);

        group.remove_member(slot(1));
        assert_eq!(group.queued_len(), 1);
        assert_eq!(group.pop_next(), Some(slot(2)));
        assert_eq!(group.pop_next(), None);
        assert!(!group.is_member(slot(1)));
    }
}
