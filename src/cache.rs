//! Fixed-capacity LRU cache backing the image chunk cache.
//!
//! The cache is a dense slab of slots threaded onto an intrusive MRU list,
//! with a key-to-slot map alongside. Eviction reuses the LRU slot in place,
//! so a full cache stops allocating slot storage. Thread safety is the
//! caller's concern; `Image` serializes access behind a mutex.

use std::collections::HashMap;
use std::hash::Hash;
use std::mem;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Slot<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Generic least-recently-used cache with a capacity fixed at construction.
///
/// Invariant: the key map and the slot list agree on membership and never
/// hold more than `capacity` entries.
#[derive(Debug)]
pub struct LruCache<K, V> {
    slots: Vec<Slot<K, V>>,
    index: HashMap<K, usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Creates a cache holding at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be nonzero");
        Self {
            slots: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Looks up `key` and promotes it to most-recently-used.
    ///
    /// The reference is valid until the next mutating call.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let i = *self.index.get(key)?;
        if self.head != i {
            self.detach(i);
            self.attach_front(i);
        }
        Some(&self.slots[i].value)
    }

    /// Looks up `key` without touching the recency order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let i = *self.index.get(key)?;
        Some(&self.slots[i].value)
    }

    /// Inserts or replaces `key`, promoting it to most-recently-used.
    ///
    /// Returns the value displaced by the insert: the previous value for
    /// the same key, or the evicted LRU value when the cache is full. The
    /// evicted entry's slot is reused in place for the new entry.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&i) = self.index.get(&key) {
            let old = mem::replace(&mut self.slots[i].value, value);
            if self.head != i {
                self.detach(i);
                self.attach_front(i);
            }
            return Some(old);
        }

        if self.index.len() < self.capacity {
            let i = self.slots.len();
            self.slots.push(Slot {
                key: key.clone(),
                value,
                prev: NIL,
                next: NIL,
            });
            self.index.insert(key, i);
            self.attach_front(i);
            return None;
        }

        // Full: recycle the LRU slot in place.
        let i = self.tail;
        self.detach(i);
        self.index.remove(&self.slots[i].key);
        let old = mem::replace(&mut self.slots[i].value, value);
        self.slots[i].key = key.clone();
        self.index.insert(key, i);
        self.attach_front(i);
        Some(old)
    }

    /// Removes and returns the least-recently-used entry, letting the
    /// caller recycle its value as the next fill buffer.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        if self.index.is_empty() {
            return None;
        }
        let i = self.tail;
        self.detach(i);
        self.index.remove(&self.slots[i].key);

        // Keep the slab dense: relocate the last slot into the vacancy.
        let last = self.slots.len() - 1;
        if i != last {
            let (prev, next) = (self.slots[last].prev, self.slots[last].next);
            if prev != NIL {
                self.slots[prev].next = i;
            } else {
                self.head = i;
            }
            if next != NIL {
                self.slots[next].prev = i;
            } else {
                self.tail = i;
            }
            if let Some(idx) = self.index.get_mut(&self.slots[last].key) {
                *idx = i;
            }
        }
        let slot = self.slots.swap_remove(i);
        Some((slot.key, slot.value))
    }

    /// Drops every entry, keeping the configured capacity.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Iterates entries from most- to least-recently-used.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            slots: &self.slots,
            cursor: self.head,
        }
    }

    fn detach(&mut self, i: usize) {
        let (prev, next) = (self.slots[i].prev, self.slots[i].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn attach_front(&mut self, i: usize) {
        self.slots[i].prev = NIL;
        self.slots[i].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = i;
        }
        self.head = i;
        if self.tail == NIL {
            self.tail = i;
        }
    }
}

pub struct Iter<'a, K, V> {
    slots: &'a [Slot<K, V>],
    cursor: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let slot = &self.slots[self.cursor];
        self.cursor = slot.next;
        Some((&slot.key, &slot.value))
    }
}
