//! Bounded LRU map with an intrusive recency list.
//!
//! Backs the decision cache and the eTLD+1 cache. Capacity is fixed at
//! construction; once full, every insert evicts the least recently used
//! entry. Entry slots live in a flat arena and the recency order is a doubly
//! linked list of slot indices, so `get`/`insert` never shift memory and the
//! map never grows past its initial allocation.
//!
//! # Invariants
//! - `map.len() == live entry count <= capacity`.
//! - `head` is the most recently used slot, `tail` the least; both are `NIL`
//!   exactly when the cache is empty.
//! - Every live slot is reachable from `head` by `next` links and from `tail`
//!   by `prev` links.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: u32 = u32::MAX;

struct Slot<K, V> {
    key: K,
    value: V,
    prev: u32,
    next: u32,
}

/// Fixed-capacity least-recently-used map.
pub struct Lru<K, V> {
    map: HashMap<K, u32, ahash::RandomState>,
    slots: Vec<Slot<K, V>>,
    free: Vec<u32>,
    head: u32,
    tail: u32,
    capacity: usize,
}

impl<K: Clone + Eq + Hash, V> Lru<K, V> {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            map: HashMap::with_capacity_and_hasher(capacity, ahash::RandomState::default()),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Looks up `key`, promoting it to most recently used on a hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.touch(idx);
        Some(&self.slots[idx as usize].value)
    }

    /// Inserts or replaces `key`, evicting the least recently used entry when
    /// at capacity.
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(&idx) = self.map.get(&key) {
            self.slots[idx as usize].value = value;
            self.touch(idx);
            return;
        }

        if self.map.len() == self.capacity {
            self.evict_tail();
        }

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Slot {
                    key: key.clone(),
                    value,
                    prev: NIL,
                    next: NIL,
                };
                idx
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot {
                    key: key.clone(),
                    value,
                    prev: NIL,
                    next: NIL,
                });
                idx
            }
        };

        self.map.insert(key, idx);
        self.push_front(idx);
    }

    /// Drops every entry, keeping allocations for reuse.
    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn evict_tail(&mut self) {
        let tail = self.tail;
        debug_assert_ne!(tail, NIL);
        self.unlink(tail);
        let key = self.slots[tail as usize].key.clone();
        self.map.remove(&key);
        self.free.push(tail);
    }

    fn touch(&mut self, idx: u32) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn push_front(&mut self, idx: u32) {
        let slot = &mut self.slots[idx as usize];
        slot.prev = NIL;
        slot.next = self.head;
        if self.head != NIL {
            self.slots[self.head as usize].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let slot = &self.slots[idx as usize];
            (slot.prev, slot.next)
        };
        if prev != NIL {
            self.slots[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
    }
}
