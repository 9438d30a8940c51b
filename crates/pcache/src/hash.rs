//! Per-instance hash table mapping page numbers to arena slots
//!
//! Buckets are heads of chains threaded through `Entry::hash_next`. The
//! bucket for a key is `key % bucket_count`. The table starts empty and
//! grows by doubling, with a floor of 256 buckets.

use std::mem;

use tracing::error;

use crate::entry::{EntryArena, Link};
use crate::Pgno;

/// Smallest bucket array ever installed
pub(crate) const MIN_BUCKETS: usize = 256;

#[derive(Default)]
pub(crate) struct PageHash {
    buckets: Vec<Link>,
    pages: u32,
}

impl PageHash {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Entries linked into the table
    pub(crate) fn len(&self) -> u32 {
        self.pages
    }

    /// Heap bytes held by a bucket array of `buckets` slots
    pub(crate) fn bytes_for(buckets: usize) -> usize {
        buckets * mem::size_of::<Link>()
    }

    /// True when the table has never been sized or is at load factor 1
    pub(crate) fn needs_grow(&self) -> bool {
        self.pages as usize >= self.buckets.len()
    }

    /// Bucket count the next resize should install
    pub(crate) fn next_bucket_count(&self) -> usize {
        (self.buckets.len() * 2).max(MIN_BUCKETS)
    }

    fn bucket(&self, key: Pgno) -> usize {
        key as usize % self.buckets.len()
    }

    pub(crate) fn lookup(&self, arena: &EntryArena, key: Pgno) -> Option<u32> {
        if self.buckets.is_empty() {
            return None;
        }
        let mut cursor = self.buckets[self.bucket(key)];
        while let Some(idx) = cursor {
            let entry = &arena[idx];
            if entry.key == key {
                return Some(idx);
            }
            cursor = entry.hash_next;
        }
        None
    }

    /// Prepend `idx` to the chain for its key. The table must be sized.
    pub(crate) fn insert(&mut self, arena: &mut EntryArena, idx: u32) {
        debug_assert!(!self.buckets.is_empty());
        self.link(arena, idx);
        self.pages += 1;
    }

    /// Unlink `idx` from its chain. Returns false if it was not found.
    pub(crate) fn remove(&mut self, arena: &mut EntryArena, idx: u32) -> bool {
        if self.unlink(arena, idx) {
            self.pages -= 1;
            true
        } else {
            false
        }
    }

    /// Move `idx` to the chain for `new_key`
    pub(crate) fn rekey(&mut self, arena: &mut EntryArena, idx: u32, new_key: Pgno) {
        let found = self.unlink(arena, idx);
        debug_assert!(found, "rekey of an entry missing from its table");
        arena[idx].key = new_key;
        self.link(arena, idx);
        if !found {
            self.pages += 1;
        }
    }

    /// Swap in a larger bucket array and rehash every entry into it.
    /// Returns the array that was replaced.
    pub(crate) fn install(&mut self, arena: &mut EntryArena, mut buckets: Vec<Link>) -> Vec<Link> {
        let count = buckets.len();
        for head in &self.buckets {
            let mut cursor = *head;
            while let Some(idx) = cursor {
                let entry = &mut arena[idx];
                cursor = entry.hash_next;
                let h = entry.key as usize % count;
                entry.hash_next = buckets[h];
                buckets[h] = Some(idx);
            }
        }
        mem::swap(&mut self.buckets, &mut buckets);
        buckets
    }

    /// Unlink every entry whose key is `>= limit`, returning their slots.
    ///
    /// Recounts the survivors while walking; the count must match the
    /// running page total.
    pub(crate) fn remove_from(&mut self, arena: &mut EntryArena, limit: Pgno) -> Vec<u32> {
        let mut removed = Vec::new();
        let mut survivors = 0u32;
        for h in 0..self.buckets.len() {
            let mut prev: Link = None;
            let mut cursor = self.buckets[h];
            while let Some(idx) = cursor {
                let entry = &arena[idx];
                cursor = entry.hash_next;
                if entry.key >= limit {
                    match prev {
                        Some(p) => arena[p].hash_next = cursor,
                        None => self.buckets[h] = cursor,
                    }
                    arena[idx].hash_next = None;
                    self.pages -= 1;
                    removed.push(idx);
                } else {
                    survivors += 1;
                    prev = Some(idx);
                }
            }
        }

        debug_assert_eq!(survivors, self.pages, "page count out of sync with hash table");
        if survivors != self.pages {
            error!(
                counted = survivors,
                recorded = self.pages,
                "page count out of sync with hash table, repairing"
            );
            self.pages = survivors;
        }
        removed
    }

    /// Release the bucket array; the table must already be empty
    pub(crate) fn take_buckets(&mut self) -> Vec<Link> {
        debug_assert_eq!(self.pages, 0);
        mem::take(&mut self.buckets)
    }

    /// Every slot linked into the table
    pub(crate) fn slots(&self, arena: &EntryArena) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.pages as usize);
        for head in &self.buckets {
            let mut cursor = *head;
            while let Some(idx) = cursor {
                out.push(idx);
                cursor = arena[idx].hash_next;
            }
        }
        out
    }

    fn link(&mut self, arena: &mut EntryArena, idx: u32) {
        let h = self.bucket(arena[idx].key);
        arena[idx].hash_next = self.buckets[h];
        self.buckets[h] = Some(idx);
    }

    fn unlink(&mut self, arena: &mut EntryArena, idx: u32) -> bool {
        if self.buckets.is_empty() {
            return false;
        }
        let h = self.bucket(arena[idx].key);
        let next = arena[idx].hash_next;
        if self.buckets[h] == Some(idx) {
            self.buckets[h] = next;
            arena[idx].hash_next = None;
            return true;
        }
        let mut cursor = self.buckets[h];
        while let Some(cur) = cursor {
            if arena[cur].hash_next == Some(idx) {
                arena[cur].hash_next = next;
                arena[idx].hash_next = None;
                return true;
            }
            cursor = arena[cur].hash_next;
        }
        false
    }
}
