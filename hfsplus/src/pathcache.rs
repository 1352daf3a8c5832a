//! Bounded thread-safe LRU cache mapping absolute UTF-8 paths to resolved
//! catalog records.
//!
//! Grounded on `examples/original_source/lib/libhfsuser/cache.c` almost
//! one-to-one: a fixed ring of slots with a single "head" pointer. `head` is
//! the most-recently-used slot; `head`'s predecessor in the ring
//! (`head.prev`) is the least-recently-used slot and therefore the next
//! write target. Insertion never reorders the ring beyond moving `head`
//! back by one; lookups never touch the ring's order at all (reads take
//! only a read lock and never "promote" an entry), matching the original's
//! read-mostly design.

use parking_lot::RwLock;

use crate::catalog::CatalogRecord;

#[derive(Clone)]
struct Slot {
    path: String,
    record: Option<CatalogRecord>,
}

struct Ring {
    slots: Vec<Slot>,
    /// Index of the most-recently-written slot. `None` while the cache is
    /// empty or disabled.
    head: usize,
}

/// A bounded LRU cache of `path -> CatalogRecord`. A capacity of 0 disables
/// the cache entirely (every operation becomes a no-op), per spec §4.10.
pub struct PathCache {
    capacity: usize,
    ring: RwLock<Ring>,
}

impl PathCache {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                path: String::new(),
                record: None,
            })
            .collect();
        PathCache {
            capacity,
            ring: RwLock::new(Ring { slots, head: 0 }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Exact-path lookup. Readers do not block each other and do not
    /// reorder the ring.
    pub fn lookup(&self, path: &str) -> Option<CatalogRecord> {
        if self.capacity == 0 {
            return None;
        }
        let ring = self.ring.read();
        ring.slots
            .iter()
            .find(|s| s.record.is_some() && s.path == path)
            .and_then(|s| s.record.clone())
    }

    /// Right-trim `path` at `/` boundaries, searching the cache at each
    /// shorter length, returning the longest matched prefix's length (0 if
    /// none matched) along with its record.
    pub fn lookup_parents(&self, path: &str) -> Option<(usize, CatalogRecord)> {
        if self.capacity == 0 || path.is_empty() {
            return None;
        }
        let ring = self.ring.read();
        let mut candidate = path;
        loop {
            if let Some(slot) = ring
                .slots
                .iter()
                .find(|s| s.record.is_some() && s.path == candidate)
            {
                return Some((candidate.len(), slot.record.clone().unwrap()));
            }
            match candidate.rfind('/') {
                Some(0) if candidate.len() == 1 => return None,
                Some(idx) if idx > 0 => candidate = &candidate[..idx],
                _ => return None,
            }
        }
    }

    /// Insert `(path, record)`, overwriting the slot immediately before
    /// `head` and moving `head` back to that slot — the ring's single
    /// write-time mutation, per the original's `cache_enter`.
    ///
    /// An allocation failure while growing the stored path string
    /// invalidates the *entire* cache rather than just failing this one
    /// insertion — a conservative policy the original takes because a
    /// half-updated slot next to a corrupted neighbor is worse than an
    /// empty cache (spec §4.10/§7).
    pub fn add(&self, path: &str, record: CatalogRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut ring = self.ring.write();
        let target = if ring.head == 0 {
            ring.slots.len() - 1
        } else {
            ring.head - 1
        };

        let mut owned = String::new();
        if owned.try_reserve(path.len()).is_err() {
            for slot in ring.slots.iter_mut() {
                slot.path.clear();
                slot.record = None;
            }
            return;
        }
        owned.push_str(path);

        ring.slots[target].path = owned;
        ring.slots[target].record = Some(record);
        ring.head = target;
    }

    /// Drop every entry, matching `cache_destroy`'s effect without tearing
    /// down the lock itself (Rust frees the `RwLock` on `Drop`).
    pub fn clear(&self) {
        if self.capacity == 0 {
            return;
        }
        let mut ring = self.ring.write();
        for slot in ring.slots.iter_mut() {
            slot.path.clear();
            slot.record = None;
        }
    }

    /// Current number of occupied slots — never exceeds `capacity` (spec §8
    /// invariant 4).
    pub fn len(&self) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        self.ring.read().slots.iter().filter(|s| s.record.is_some()).count()
    }
}
