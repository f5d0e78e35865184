//! Handle plumbing: generation-checked slab tables (weak references check
//! the generation on deref) and the ring of recently used connection ids.

use photon::crypto::random_u32;

/// Weak reference into a [`Slab`]: an index plus the generation it was
/// created under. Dereferencing after the slot was recycled yields `None`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SlotRef {
    pub index: u32,
    pub generation: u32,
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
}

impl<T> Slab<T> {
    pub fn new() -> Slab<T> {
        Slab {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> SlotRef {
        match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                debug_assert!(entry.value.is_none());
                entry.value = Some(value);
                SlotRef {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 1,
                    value: Some(value),
                });
                SlotRef { index, generation: 1 }
            }
        }
    }

    pub fn get(&self, slot: SlotRef) -> Option<&T> {
        let entry = self.entries.get(slot.index as usize)?;
        if entry.generation != slot.generation {
            return None;
        }
        entry.value.as_ref()
    }

    pub fn get_mut(&mut self, slot: SlotRef) -> Option<&mut T> {
        let entry = self.entries.get_mut(slot.index as usize)?;
        if entry.generation != slot.generation {
            return None;
        }
        entry.value.as_mut()
    }

    /// Frees the slot, bumping its generation so stale refs go dead.
    pub fn remove(&mut self, slot: SlotRef) -> Option<T> {
        let entry = self.entries.get_mut(slot.index as usize)?;
        if entry.generation != slot.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot.index);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotRef, &T)> {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            entry.value.as_ref().map(|value| {
                (
                    SlotRef {
                        index: index as u32,
                        generation: entry.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn refs(&self) -> Vec<SlotRef> {
        self.iter().map(|(slot, _)| slot).collect()
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Slab<T> {
        Slab::new()
    }
}

/// Ring of the most recently used local connection ids, so a freshly
/// created connection never reuses one a peer might still be talking to.
pub struct ConnIdRing {
    recent: [u32; Self::CAPACITY],
    cursor: usize,
    len: usize,
}

impl ConnIdRing {
    const CAPACITY: usize = 256;

    pub fn new() -> ConnIdRing {
        ConnIdRing {
            recent: [0; Self::CAPACITY],
            cursor: 0,
            len: 0,
        }
    }

    pub fn remember(&mut self, conn_id: u32) {
        self.recent[self.cursor] = conn_id;
        self.cursor = (self.cursor + 1) % Self::CAPACITY;
        self.len = (self.len + 1).min(Self::CAPACITY);
    }

    pub fn contains(&self, conn_id: u32) -> bool {
        self.recent[..self.len].contains(&conn_id)
    }

    /// Picks a fresh local connection id: nonzero in both halves (the low
    /// 16 bits become the visible handle), not recently used, and not
    /// colliding with anything live according to `in_use`.
    pub fn pick_local_conn_id(&mut self, mut in_use: impl FnMut(u32) -> bool) -> u32 {
        loop {
            let conn_id = random_u32();
            if conn_id & 0xffff == 0 || conn_id == 0 {
                continue;
            }
            if self.contains(conn_id) || in_use(conn_id) {
                continue;
            }
            self.remember(conn_id);
            return conn_id;
        }
    }
}

impl Default for ConnIdRing {
    fn default() -> ConnIdRing {
        ConnIdRing::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_insert_get_remove() {
        let mut slab: Slab<String> = Slab::new();
        let a = slab.insert("alpha".into());
        let b = slab.insert("beta".into());
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.get(a).unwrap(), "alpha");
        assert_eq!(slab.get_mut(b).unwrap(), "beta");

        assert_eq!(slab.remove(a).unwrap(), "alpha");
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.len(), 1);
    }

    #[test]
    fn test_slab_stale_ref_goes_dead() {
        let mut slab: Slab<u32> = Slab::new();
        let stale = slab.insert(7);
        slab.remove(stale);
        // The slot is recycled under a new generation.
        let fresh = slab.insert(8);
        assert_eq!(fresh.index, stale.index);
        assert_ne!(fresh.generation, stale.generation);
        assert_eq!(slab.get(stale), None);
        assert_eq!(slab.remove(stale), None);
        assert_eq!(slab.get(fresh), Some(&8));
    }

    #[test]
    fn test_slab_iter() {
        let mut slab: Slab<u32> = Slab::new();
        slab.insert(1);
        let b = slab.insert(2);
        slab.insert(3);
        slab.remove(b);
        let values: Vec<u32> = slab.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![1, 3]);
    }

    #[test]
    fn test_conn_id_ring_avoids_recent() {
        let mut ring = ConnIdRing::new();
        ring.remember(0x1234_5678);
        assert!(ring.contains(0x1234_5678));
        for _ in 0..100 {
            let id = ring.pick_local_conn_id(|_| false);
            assert_ne!(id, 0x1234_5678);
            assert_ne!(id & 0xffff, 0);
        }
    }

    #[test]
    fn test_conn_id_ring_wraps() {
        let mut ring = ConnIdRing::new();
        for i in 1..=300u32 {
            ring.remember(i);
        }
        // Only the most recent 256 are retained.
        assert!(!ring.contains(1));
        assert!(ring.contains(300));
        assert!(ring.contains(45));
    }

    #[test]
    fn test_pick_respects_in_use() {
        let mut ring = ConnIdRing::new();
        let first = ring.pick_local_conn_id(|_| false);
        // Force a rejection path: claim everything with the same low bits
        // is taken.
        let second = ring.pick_local_conn_id(|id| id & 0xffff == first & 0xffff);
        assert_ne!(second & 0xffff, first & 0xffff);
    }
}
