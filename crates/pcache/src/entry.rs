//! Cache entries and the index-stable arena that owns them
//!
//! Entries are addressed by slot index. Hash chains, the group LRU list and
//! the dirty list are all intrusive links holding slot indices, so evicting
//! or rehashing never moves an entry. Handles given to callers carry a
//! generation so a handle to a freed slot is detected instead of aliasing
//! whatever reused the slot.

use std::ops::{Index, IndexMut};

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::slab::PageBuffer;
use crate::Pgno;

/// Intrusive link: slot index of the neighbour
pub(crate) type Link = Option<u32>;

/// Identifies one cache instance inside its group
pub(crate) type CacheId = u32;

bitflags! {
    /// Page state bits maintained by the cache facade
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u16 {
        /// Page has changed
        const DIRTY = 0x002;
        /// Journal must be synced before this page is written
        const NEED_SYNC = 0x004;
        /// Content has not been read yet
        const NEED_READ = 0x008;
        /// Page is unlikely to be reused; evict it first
        const REUSE_UNLIKELY = 0x010;
        /// Do not write the content to disk
        const DONT_WRITE = 0x020;
    }
}

/// Generation-checked reference to a cached page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle {
    index: u32,
    generation: u32,
}

impl PageHandle {
    pub(crate) fn index(self) -> u32 {
        self.index
    }
}

/// Page header plus its buffer
pub(crate) struct Entry {
    pub(crate) key: Pgno,
    pub(crate) owner: CacheId,
    /// Page bytes followed by the extra bytes
    pub(crate) buffer: PageBuffer,
    pub(crate) page_size: usize,
    pub(crate) hash_next: Link,
    pub(crate) lru_prev: Link,
    pub(crate) lru_next: Link,
    pub(crate) on_lru: bool,
    pub(crate) refs: u32,
    pub(crate) flags: PageFlags,
    pub(crate) dirty_prev: Link,
    pub(crate) dirty_next: Link,
}

impl Entry {
    pub(crate) fn new(key: Pgno, owner: CacheId, buffer: PageBuffer, page_size: usize) -> Self {
        Self {
            key,
            owner,
            buffer,
            page_size,
            hash_next: None,
            lru_prev: None,
            lru_next: None,
            on_lru: false,
            refs: 0,
            flags: PageFlags::empty(),
            dirty_prev: None,
            dirty_next: None,
        }
    }

    /// Reset header state for reuse under a new key and owner
    pub(crate) fn reset(&mut self, key: Pgno, owner: CacheId) {
        self.key = key;
        self.owner = owner;
        self.hash_next = None;
        self.lru_prev = None;
        self.lru_next = None;
        self.on_lru = false;
        self.refs = 0;
        self.flags = PageFlags::empty();
        self.dirty_prev = None;
        self.dirty_next = None;
        self.buffer.as_mut_slice().fill(0);
    }

    /// Page bytes and extra bytes
    pub(crate) fn split(&self) -> (&[u8], &[u8]) {
        self.buffer.as_slice().split_at(self.page_size)
    }

    /// Page bytes and extra bytes, mutably
    pub(crate) fn split_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let page_size = self.page_size;
        self.buffer.as_mut_slice().split_at_mut(page_size)
    }
}

/// Slot storage for entries with a free list of vacant slots
#[derive(Default)]
pub(crate) struct EntryArena {
    slots: Vec<Option<Entry>>,
    generations: Vec<u32>,
    free_list: Vec<u32>,
    live: usize,
}

impl EntryArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn insert(&mut self, entry: Entry) -> u32 {
        self.live += 1;
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Some(entry);
            idx
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Some(entry));
            self.generations.push(0);
            idx
        }
    }

    /// Vacate a slot; outstanding handles to it become stale
    pub(crate) fn remove(&mut self, idx: u32) -> Option<Entry> {
        let entry = self.slots.get_mut(idx as usize)?.take()?;
        self.generations[idx as usize] = self.generations[idx as usize].wrapping_add(1);
        self.free_list.push(idx);
        self.live -= 1;
        Some(entry)
    }

    pub(crate) fn handle(&self, idx: u32) -> PageHandle {
        PageHandle {
            index: idx,
            generation: self.generations[idx as usize],
        }
    }

    /// Slot index for a handle, if it still refers to a live entry
    pub(crate) fn resolve(&self, handle: PageHandle) -> Result<u32> {
        let idx = handle.index as usize;
        match (self.slots.get(idx), self.generations.get(idx)) {
            (Some(Some(_)), Some(&generation)) if generation == handle.generation => {
                Ok(handle.index)
            }
            _ => Err(Error::StaleHandle {
                index: handle.index,
            }),
        }
    }

    pub(crate) fn get(&self, idx: u32) -> Option<&Entry> {
        self.slots.get(idx as usize).and_then(Option::as_ref)
    }

    /// Indices of every live entry
    pub(crate) fn live_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(idx, _)| idx as u32)
    }
}

impl Index<u32> for EntryArena {
    type Output = Entry;

    fn index(&self, idx: u32) -> &Entry {
        match self.slots.get(idx as usize) {
            Some(Some(entry)) => entry,
            _ => panic!("vacant entry slot {idx}"),
        }
    }
}

impl IndexMut<u32> for EntryArena {
    fn index_mut(&mut self, idx: u32) -> &mut Entry {
        match self.slots.get_mut(idx as usize) {
            Some(Some(entry)) => entry,
            _ => panic!("vacant entry slot {idx}"),
        }
    }
}
