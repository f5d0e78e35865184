//! Wakeup scheduling: a min-heap of objects wanting a callback at a future
//! time. Entries are invalidated lazily; each object's authoritative next
//! time lives in the side table and stale heap entries are skipped on pop.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::hash::Hash;

use hashbrown::HashMap;
use photon::time::{Usec, NEVER};

pub struct ThinkerHeap<T: Copy + Eq + Hash + Ord> {
    heap: BinaryHeap<Reverse<(Usec, T)>>,
    current: HashMap<T, Usec>,
}

impl<T: Copy + Eq + Hash + Ord> ThinkerHeap<T> {
    pub fn new() -> ThinkerHeap<T> {
        ThinkerHeap {
            heap: BinaryHeap::new(),
            current: HashMap::new(),
        }
    }

    /// Registers or reschedules a thinker. `NEVER` parks it.
    pub fn set_next_think(&mut self, id: T, when: Usec) {
        if when == NEVER {
            self.current.remove(&id);
            return;
        }
        match self.current.get(&id) {
            Some(&existing) if existing == when => return,
            _ => {}
        }
        self.current.insert(id, when);
        self.heap.push(Reverse((when, id)));
    }

    pub fn remove(&mut self, id: T) {
        self.current.remove(&id);
    }

    #[inline]
    pub fn scheduled_time(&self, id: T) -> Usec {
        self.current.get(&id).copied().unwrap_or(NEVER)
    }

    /// Earliest scheduled wakeup across all thinkers.
    pub fn next_time(&mut self) -> Usec {
        loop {
            let Some(&Reverse((when, id))) = self.heap.peek() else {
                return NEVER;
            };
            if self.current.get(&id) == Some(&when) {
                return when;
            }
            self.heap.pop();
        }
    }

    /// Pops one thinker that is due at `now`, deregistering it. The caller
    /// is expected to reschedule it after its think pass.
    pub fn pop_due(&mut self, now: Usec) -> Option<T> {
        loop {
            let &Reverse((when, id)) = self.heap.peek()?;
            if self.current.get(&id) != Some(&when) {
                self.heap.pop();
                continue;
            }
            if when > now {
                return None;
            }
            self.heap.pop();
            self.current.remove(&id);
            return Some(id);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}

impl<T: Copy + Eq + Hash + Ord> Default for ThinkerHeap<T> {
    fn default() -> ThinkerHeap<T> {
        ThinkerHeap::new()
    }
}
