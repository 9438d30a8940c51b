//! Cache groups: the shared budget and LRU list
//!
//! Every cache instance in a group keeps its hash table and entries inside
//! the group state, behind one mutex. Unpinned entries of all instances sit
//! on a single LRU list; eviction always takes the tail (the entry unpinned
//! longest ago), whichever instance owns it.

use std::sync::{Arc, Weak};

use ahash::AHashSet;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::dirty::DirtyList;
use crate::entry::{CacheId, EntryArena, Link, PageFlags};
use crate::hash::PageHash;
use crate::slab::{PagePool, Reclaim};
use crate::stats::CacheStats;
use crate::Pgno;

/// Pinned-page slack added to `max_pinned`, and the floor of each purgeable cache
pub(crate) const PIN_SLACK: u32 = 10;

/// Per-cache-instance state kept inside the group
pub(crate) struct CacheState {
    pub(crate) hash: PageHash,
    pub(crate) page_size: usize,
    /// Page plus extra bytes; recycled buffers must match it
    pub(crate) buffer_size: usize,
    pub(crate) purgeable: bool,
    pub(crate) min: u32,
    pub(crate) max: u32,
    pub(crate) n90pct: u32,
    pub(crate) max_key: Pgno,
    /// Entries of this cache on the LRU list
    pub(crate) recyclable: u32,
    pub(crate) dirty: DirtyList,
    /// Pages with at least one reference
    pub(crate) refs: u32,
    pub(crate) page1: Link,
    /// Pin state follows page references (set when opened through `PageCache`)
    pub(crate) facade: bool,
}

impl CacheState {
    pub(crate) fn new(page_size: usize, extra_size: usize, purgeable: bool) -> Self {
        Self {
            hash: PageHash::new(),
            page_size,
            buffer_size: page_size + extra_size,
            purgeable,
            min: 0,
            max: 0,
            n90pct: 0,
            max_key: 0,
            recyclable: 0,
            dirty: DirtyList::default(),
            refs: 0,
            page1: None,
            facade: false,
        }
    }

    /// Entries not on the LRU list
    pub(crate) fn pinned(&self) -> u32 {
        self.hash.len() - self.recyclable
    }
}

/// Everything guarded by the group mutex
pub(crate) struct GroupState {
    pub(crate) entries: EntryArena,
    caches: Vec<Option<CacheState>>,
    cache_free: Vec<CacheId>,
    lru_head: Link,
    lru_tail: Link,
    pub(crate) max_pages: u32,
    pub(crate) min_pages: u32,
    pub(crate) max_pinned: u32,
    pub(crate) current_pages: u32,
    pub(crate) pool: Arc<PagePool>,
    pub(crate) stats: Arc<CacheStats>,
}

impl GroupState {
    fn new(pool: Arc<PagePool>, stats: Arc<CacheStats>) -> Self {
        Self {
            entries: EntryArena::new(),
            caches: Vec::new(),
            cache_free: Vec::new(),
            lru_head: None,
            lru_tail: None,
            max_pages: 0,
            min_pages: 0,
            max_pinned: PIN_SLACK,
            current_pages: 0,
            pool,
            stats,
        }
    }

    // --- Cache instances ---

    pub(crate) fn add_cache(&mut self, cache: CacheState) -> CacheId {
        if let Some(id) = self.cache_free.pop() {
            self.caches[id as usize] = Some(cache);
            id
        } else {
            self.caches.push(Some(cache));
            (self.caches.len() - 1) as CacheId
        }
    }

    pub(crate) fn remove_cache(&mut self, id: CacheId) -> Option<CacheState> {
        let cache = self.caches.get_mut(id as usize)?.take()?;
        self.cache_free.push(id);
        Some(cache)
    }

    pub(crate) fn cache(&self, id: CacheId) -> &CacheState {
        match self.caches.get(id as usize) {
            Some(Some(cache)) => cache,
            _ => panic!("no cache instance {id} in group"),
        }
    }

    pub(crate) fn cache_mut(&mut self, id: CacheId) -> &mut CacheState {
        match self.caches.get_mut(id as usize) {
            Some(Some(cache)) => cache,
            _ => panic!("no cache instance {id} in group"),
        }
    }

    /// Split borrow of the arena and one cache's state
    pub(crate) fn parts(&mut self, id: CacheId) -> (&mut EntryArena, &mut CacheState) {
        let cache = match self.caches.get_mut(id as usize) {
            Some(Some(cache)) => cache,
            _ => panic!("no cache instance {id} in group"),
        };
        (&mut self.entries, cache)
    }

    fn live_caches(&self) -> impl Iterator<Item = (CacheId, &CacheState)> + '_ {
        self.caches
            .iter()
            .enumerate()
            .filter_map(|(id, c)| c.as_ref().map(|c| (id as CacheId, c)))
    }

    pub(crate) fn recompute_max_pinned(&mut self) {
        // A negative budget wraps to "no limit".
        self.max_pinned = self
            .max_pages
            .saturating_add(PIN_SLACK)
            .checked_sub(self.min_pages)
            .unwrap_or(u32::MAX);
    }

    // --- Hash table ---

    pub(crate) fn lookup(&self, id: CacheId, key: Pgno) -> Option<u32> {
        self.cache(id).hash.lookup(&self.entries, key)
    }

    pub(crate) fn insert_hash(&mut self, id: CacheId, idx: u32) {
        let (entries, cache) = self.parts(id);
        cache.hash.insert(entries, idx);
    }

    /// Unlink an entry from its owner's hash table
    pub(crate) fn remove_from_hash(&mut self, idx: u32) {
        let owner = self.entries[idx].owner;
        let (entries, cache) = self.parts(owner);
        let found = cache.hash.remove(entries, idx);
        debug_assert!(found, "entry missing from its hash table");
    }

    /// Install a grown bucket array; returns the old one
    pub(crate) fn install_buckets(&mut self, id: CacheId, buckets: Vec<Link>) -> Vec<Link> {
        let (entries, cache) = self.parts(id);
        cache.hash.install(entries, buckets)
    }

    // --- LRU ---

    /// Take an entry off the LRU list. No-op when it is not on it.
    pub(crate) fn pin(&mut self, idx: u32) {
        let entry = &self.entries[idx];
        if !entry.on_lru {
            return;
        }
        let (prev, next, owner) = (entry.lru_prev, entry.lru_next, entry.owner);
        match prev {
            Some(p) => self.entries[p].lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.entries[n].lru_prev = prev,
            None => self.lru_tail = prev,
        }
        let entry = &mut self.entries[idx];
        entry.lru_prev = None;
        entry.lru_next = None;
        entry.on_lru = false;
        self.cache_mut(owner).recyclable -= 1;
    }

    /// Put an entry on the LRU list, most recent (head) or next-to-go (tail)
    pub(crate) fn push_lru(&mut self, idx: u32, at_tail: bool) {
        debug_assert!(!self.entries[idx].on_lru);
        if at_tail {
            self.entries[idx].lru_prev = self.lru_tail;
            self.entries[idx].lru_next = None;
            match self.lru_tail {
                Some(t) => self.entries[t].lru_next = Some(idx),
                None => self.lru_head = Some(idx),
            }
            self.lru_tail = Some(idx);
        } else {
            self.entries[idx].lru_prev = None;
            self.entries[idx].lru_next = self.lru_head;
            match self.lru_head {
                Some(h) => self.entries[h].lru_prev = Some(idx),
                None => self.lru_tail = Some(idx),
            }
            self.lru_head = Some(idx);
        }
        self.entries[idx].on_lru = true;
        let owner = self.entries[idx].owner;
        self.cache_mut(owner).recyclable += 1;
    }

    pub(crate) fn lru_tail(&self) -> Link {
        self.lru_tail
    }

    /// Return a pinned page to the LRU, or free it when the group is over budget
    pub(crate) fn unpin(&mut self, idx: u32, reuse_unlikely: bool) {
        if self.entries[idx].on_lru {
            return;
        }
        if self.current_pages > self.max_pages {
            self.remove_from_hash(idx);
            self.free_entry(idx);
            self.stats.record_eviction();
        } else {
            self.push_lru(idx, reuse_unlikely);
        }
    }

    /// Remove and free an entry regardless of its state
    pub(crate) fn discard(&mut self, idx: u32) {
        self.pin(idx);
        self.remove_from_hash(idx);
        self.free_entry(idx);
    }

    // --- Freeing ---

    /// Drop the owner's bookkeeping that points at this entry
    fn detach_from_owner(&mut self, idx: u32) {
        let owner = self.entries[idx].owner;
        let (entries, cache) = self.parts(owner);
        if entries[idx].flags.contains(PageFlags::DIRTY) {
            cache.dirty.remove(entries, idx);
        }
        if entries[idx].refs > 0 {
            cache.refs -= 1;
        }
        if cache.page1 == Some(idx) {
            cache.page1 = None;
        }
    }

    /// Free an entry already off the LRU and out of its hash table.
    /// Returns the heap bytes released.
    pub(crate) fn free_entry(&mut self, idx: u32) -> usize {
        debug_assert!(!self.entries[idx].on_lru);
        self.detach_from_owner(idx);
        let Some(entry) = self.entries.remove(idx) else {
            return 0;
        };
        if self.cache(entry.owner).purgeable {
            self.current_pages -= 1;
        }
        self.pool.release(entry.buffer)
    }

    /// Evict the LRU tail. Returns the heap bytes released, or `None`
    /// when nothing is evictable.
    fn evict_tail(&mut self) -> Option<usize> {
        let idx = self.lru_tail?;
        trace!(key = self.entries[idx].key, "evicting page");
        self.pin(idx);
        self.remove_from_hash(idx);
        self.stats.record_eviction();
        Some(self.free_entry(idx))
    }

    /// Evict unpinned pages, oldest first, until at most `target` purgeable
    /// pages remain or nothing evictable is left.
    pub(crate) fn evict_until(&mut self, target: u32) -> u32 {
        let mut evicted = 0;
        while self.current_pages > target && self.evict_tail().is_some() {
            evicted += 1;
        }
        evicted
    }

    pub(crate) fn enforce_max_pages(&mut self) {
        let evicted = self.evict_until(self.max_pages);
        if evicted > 0 {
            debug!(
                evicted,
                current = self.current_pages,
                max = self.max_pages,
                "enforced group page budget"
            );
        }
    }

    /// Take the LRU tail and hand it to cache `id` under `key`.
    ///
    /// A tail entry whose buffer size differs from what `id` needs is freed
    /// instead and `None` is returned.
    pub(crate) fn recycle_tail(&mut self, id: CacheId, key: Pgno) -> Option<u32> {
        let idx = self.lru_tail?;
        self.pin(idx);
        self.remove_from_hash(idx);

        let from = self.entries[idx].owner;
        let (from_size, from_purgeable) = {
            let c = self.cache(from);
            (c.buffer_size, c.purgeable)
        };
        let (to_size, to_purgeable, page_size) = {
            let c = self.cache(id);
            (c.buffer_size, c.purgeable, c.page_size)
        };
        if from_size != to_size {
            self.free_entry(idx);
            self.stats.record_eviction();
            return None;
        }

        self.detach_from_owner(idx);
        self.current_pages = self.current_pages - u32::from(from_purgeable) + u32::from(to_purgeable);
        let entry = &mut self.entries[idx];
        trace!(old = entry.key, new = key, "recycling page");
        entry.reset(key, id);
        entry.page_size = page_size;
        self.stats.record_recycle();
        Some(idx)
    }

    /// Discard every page of cache `id` whose key is `>= limit`, pinned or not
    pub(crate) fn truncate(&mut self, id: CacheId, limit: Pgno) {
        let removed = {
            let (entries, cache) = self.parts(id);
            cache.hash.remove_from(entries, limit)
        };
        for idx in removed {
            self.pin(idx);
            self.free_entry(idx);
        }
    }

    /// Evict from the tail, skipping slab-backed pages, until `bytes` of heap is freed
    fn release_heap(&mut self, bytes: usize) -> usize {
        let mut freed = 0;
        let mut cursor = self.lru_tail;
        while let Some(idx) = cursor {
            if freed >= bytes {
                break;
            }
            cursor = self.entries[idx].lru_prev;
            if self.pool.owns(&self.entries[idx].buffer) {
                continue;
            }
            self.pin(idx);
            self.remove_from_hash(idx);
            self.stats.record_eviction();
            freed += self.free_entry(idx);
        }
        freed
    }

    /// Keys on the LRU list, next-to-evict first
    pub(crate) fn lru_keys(&self) -> Vec<Pgno> {
        let mut keys = Vec::new();
        let mut cursor = self.lru_tail;
        while let Some(idx) = cursor {
            keys.push(self.entries[idx].key);
            cursor = self.entries[idx].lru_prev;
        }
        keys
    }

    /// Walk every structure and report the first inconsistency found
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        let mut on_list = AHashSet::new();
        let mut cursor = self.lru_head;
        let mut prev: Link = None;
        while let Some(idx) = cursor {
            let entry = self
                .entries
                .get(idx)
                .ok_or_else(|| format!("LRU links vacant slot {idx}"))?;
            if !on_list.insert(idx) {
                return Err(format!("LRU visits slot {idx} twice"));
            }
            if entry.lru_prev != prev {
                return Err(format!("LRU back-link broken at slot {idx}"));
            }
            if !entry.on_lru {
                return Err(format!("slot {idx} on LRU but not flagged"));
            }
            if entry.refs != 0 || entry.flags.contains(PageFlags::DIRTY) {
                return Err(format!("pinned page {} on LRU", entry.key));
            }
            prev = cursor;
            cursor = entry.lru_next;
        }
        if prev != self.lru_tail {
            return Err("LRU tail does not end the forward walk".to_string());
        }
        let mut backward = 0;
        let mut cursor = self.lru_tail;
        while let Some(idx) = cursor {
            backward += 1;
            if backward > on_list.len() {
                return Err("LRU backward walk longer than forward walk".to_string());
            }
            cursor = self.entries[idx].lru_prev;
        }
        if backward != on_list.len() {
            return Err(format!(
                "LRU forward walk {} != backward walk {}",
                on_list.len(),
                backward
            ));
        }

        let mut purgeable = 0u32;
        for idx in self.entries.live_indices() {
            let entry = &self.entries[idx];
            if entry.on_lru != on_list.contains(&idx) {
                return Err(format!("page {} LRU flag disagrees with list", entry.key));
            }
            let owner = self
                .caches
                .get(entry.owner as usize)
                .and_then(Option::as_ref)
                .ok_or_else(|| format!("page {} owned by missing cache", entry.key))?;
            if owner.purgeable {
                purgeable += 1;
            }
        }
        if purgeable != self.current_pages {
            return Err(format!(
                "current_pages {} != purgeable entries {}",
                self.current_pages, purgeable
            ));
        }

        let mut linked = 0usize;
        for (id, cache) in self.live_caches() {
            let slots = cache.hash.slots(&self.entries);
            if slots.len() != cache.hash.len() as usize {
                return Err(format!(
                    "cache {id}: page count {} != hash population {}",
                    cache.hash.len(),
                    slots.len()
                ));
            }
            let mut recyclable = 0;
            let mut refs = 0;
            for &idx in &slots {
                let entry = &self.entries[idx];
                if entry.owner != id {
                    return Err(format!("cache {id} hashes page {} it does not own", entry.key));
                }
                if entry.on_lru {
                    recyclable += 1;
                }
                if entry.refs > 0 {
                    refs += 1;
                }
                if cache.facade
                    && cache.purgeable
                    && !entry.on_lru
                    && entry.refs == 0
                    && !entry.flags.contains(PageFlags::DIRTY)
                {
                    return Err(format!("unreferenced clean page {} is not on the LRU", entry.key));
                }
            }
            if recyclable != cache.recyclable {
                return Err(format!(
                    "cache {id}: recyclable {} != LRU members {}",
                    cache.recyclable, recyclable
                ));
            }
            if refs != cache.refs {
                return Err(format!("cache {id}: ref count {} != referenced pages {}", cache.refs, refs));
            }
            for idx in cache.dirty.slots(&self.entries) {
                if !self.entries[idx].flags.contains(PageFlags::DIRTY) {
                    return Err(format!("clean page {} on dirty list", self.entries[idx].key));
                }
            }
            linked += slots.len();
        }
        if linked != self.entries.len() {
            return Err(format!(
                "{} live entries but {} reachable from hash tables",
                self.entries.len(),
                linked
            ));
        }
        Ok(())
    }
}

/// Shared part of a group
pub(crate) struct GroupInner {
    pub(crate) state: Mutex<GroupState>,
    pub(crate) pool: Arc<PagePool>,
    pub(crate) stats: Arc<CacheStats>,
}

impl Reclaim for GroupInner {
    fn release_memory(&self, bytes: usize) -> usize {
        self.state.lock().release_heap(bytes)
    }
}

/// Budgeting and eviction domain shared by cache instances
#[derive(Clone)]
pub struct CacheGroup {
    pub(crate) inner: Arc<GroupInner>,
}

impl CacheGroup {
    /// Create a group drawing page buffers from `pool`
    pub fn new(pool: Arc<PagePool>) -> Self {
        let stats = Arc::new(CacheStats::new());
        let inner = Arc::new(GroupInner {
            state: Mutex::new(GroupState::new(Arc::clone(&pool), Arc::clone(&stats))),
            pool: Arc::clone(&pool),
            stats,
        });
        let reclaimer: Weak<dyn Reclaim> = Arc::downgrade(&inner) as Weak<dyn Reclaim>;
        pool.register(reclaimer);
        Self { inner }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.inner.state.lock()
    }

    /// The allocator behind this group
    pub fn pool(&self) -> &Arc<PagePool> {
        &self.inner.pool
    }

    /// Group-wide counters
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Sum of the page ceilings of purgeable members
    pub fn max_pages(&self) -> u32 {
        self.lock().max_pages
    }

    /// Sum of the page floors of purgeable members
    pub fn min_pages(&self) -> u32 {
        self.lock().min_pages
    }

    /// Ceiling on pinned pages before easy fetches are refused
    pub fn max_pinned(&self) -> u32 {
        self.lock().max_pinned
    }

    /// Purgeable pages currently allocated across the group
    pub fn current_pages(&self) -> u32 {
        self.lock().current_pages
    }

    /// Page numbers on the LRU list, next-to-evict first
    pub fn lru_pages(&self) -> Vec<Pgno> {
        self.lock().lru_keys()
    }

    /// Evict unpinned heap-backed pages until `bytes` of heap is released
    pub fn release_memory(&self, bytes: usize) -> usize {
        self.inner.release_memory(bytes)
    }

    /// Verify the LRU, page-count and hash invariants
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        self.lock().check()
    }

    /// Check whether two handles refer to the same group
    pub fn same_group(&self, other: &CacheGroup) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for CacheGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CacheGroup")
            .field("max_pages", &state.max_pages)
            .field("min_pages", &state.min_pages)
            .field("current_pages", &state.current_pages)
            .finish()
    }
}

impl PagePool {
    /// The group shared by every cache created against this pool.
    ///
    /// Created on first use; a new one is made once every previous handle
    /// and instance has gone away.
    pub fn group(self: &Arc<Self>) -> CacheGroup {
        let mut slot = self.shared_group.lock();
        if let Some(inner) = slot.upgrade() {
            return CacheGroup { inner };
        }
        let group = CacheGroup::new(Arc::clone(self));
        *slot = Arc::downgrade(&group.inner);
        group
    }
}
