//! Binary min-heap of arena slots that tracks each slot's heap position, so
//! removal and re-keying of an arbitrary slot are O(log n).

use std::time::Instant;

const ABSENT: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    pub expiry: Instant,
    /// Insertion order, breaks ties between equal expiries
    pub seq: u64,
    pub slot: usize,
}

impl Entry {
    #[inline]
    fn before(&self, other: &Entry) -> bool {
        (self.expiry, self.seq) < (other.expiry, other.seq)
    }
}

#[derive(Debug, Default)]
pub(crate) struct IndexedHeap {
    entries: Vec<Entry>,
    /// slot -> position in `entries`
    index: Vec<usize>,
}

impl IndexedHeap {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn peek(&self) -> Option<&Entry> {
        self.entries.first()
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.index.get(slot).is_some_and(|&pos| pos != ABSENT)
    }

    pub fn push(&mut self, entry: Entry) {
        if self.index.len() <= entry.slot {
            self.index.resize(entry.slot + 1, ABSENT);
        }
        debug_assert!(!self.contains(entry.slot));
        let pos = self.entries.len();
        self.entries.push(entry);
        self.index[entry.slot] = pos;
        self.sift_up(pos);
    }

    pub fn pop(&mut self) -> Option<Entry> {
        let slot = self.peek()?.slot;
        self.remove(slot)
    }

    pub fn remove(&mut self, slot: usize) -> Option<Entry> {
        let pos = *self.index.get(slot)?;
        if pos == ABSENT {
            return None;
        }
        let last = self.entries.len() - 1;
        self.swap(pos, last);
        let entry = self.entries.pop()?;
        self.index[slot] = ABSENT;
        if pos < self.entries.len() {
            self.fix(pos);
        }
        Some(entry)
    }

    /// Re-key `slot` in place. Returns false if the slot is not queued.
    pub fn update(&mut self, slot: usize, expiry: Instant, seq: u64) -> bool {
        let Some(&pos) = self.index.get(slot) else {
            return false;
        };
        if pos == ABSENT {
            return false;
        }
        self.entries[pos].expiry = expiry;
        self.entries[pos].seq = seq;
        self.fix(pos);
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    fn fix(&mut self, pos: usize) {
        if !self.sift_up(pos) {
            self.sift_down(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) -> bool {
        let start = pos;
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.entries[pos].before(&self.entries[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos != start
    }

    fn sift_down(&mut self, mut pos: usize) {
        let n = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < n && self.entries[right].before(&self.entries[left]) {
                child = right;
            }
            if !self.entries[child].before(&self.entries[pos]) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.index[self.entries[a].slot] = a;
        self.index[self.entries[b].slot] = b;
    }
}
