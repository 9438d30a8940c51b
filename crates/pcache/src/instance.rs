//! Per-cache instances
//!
//! A `CacheInstance` is one raw page store bound to a group: hash lookup,
//! pinning, recycling and budget enforcement. Reference counts and dirty
//! tracking live one level up in [`crate::PageCache`].

use parking_lot::MutexGuard;
use tracing::{debug, trace};

use crate::entry::{CacheId, Entry, PageHandle};
use crate::error::{Error, Result};
use crate::group::{CacheGroup, CacheState, GroupState, PIN_SLACK};
use crate::hash::PageHash;
use crate::slab::PagePool;
use crate::Pgno;

/// How hard `fetch` should try when the page is not cached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Only look the page up
    Never,
    /// Create it unless the cache is close to its limits or memory is tight
    Easy,
    /// Create it whatever it takes
    Force,
}

/// One cache handle bound to a group
pub struct CacheInstance {
    group: CacheGroup,
    id: CacheId,
    page_size: usize,
    extra_size: usize,
    purgeable: bool,
}

impl CacheInstance {
    /// Register a new cache in `group`.
    ///
    /// Purgeable caches add their floor of 10 pages to the group minimum.
    pub fn create(group: &CacheGroup, page_size: usize, extra_size: usize, purgeable: bool) -> Self {
        let mut state = group.lock();
        let mut cache = CacheState::new(page_size, extra_size, purgeable);
        if purgeable {
            cache.min = PIN_SLACK;
            state.min_pages = state.min_pages.saturating_add(PIN_SLACK);
            state.recompute_max_pinned();
        }
        let id = state.add_cache(cache);
        drop(state);

        debug!(id, page_size, extra_size, purgeable, "cache instance created");
        Self {
            group: group.clone(),
            id,
            page_size,
            extra_size,
            purgeable,
        }
    }

    /// The group this cache belongs to
    pub fn group(&self) -> &CacheGroup {
        &self.group
    }

    /// Page size in bytes
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Extra bytes per page
    pub fn extra_size(&self) -> usize {
        self.extra_size
    }

    /// Whether pages may be evicted
    pub fn is_purgeable(&self) -> bool {
        self.purgeable
    }

    pub(crate) fn id(&self) -> CacheId {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.group.lock()
    }

    /// Resolve a handle and check that it belongs to this cache
    pub(crate) fn resolve(&self, state: &GroupState, page: PageHandle) -> Result<u32> {
        let idx = state.entries.resolve(page)?;
        if state.entries[idx].owner != self.id {
            return Err(Error::Misuse("page belongs to another cache"));
        }
        Ok(idx)
    }

    /// Set the page ceiling and enforce the group budget
    pub fn set_cache_size(&self, max: u32) {
        if !self.purgeable {
            return;
        }
        let mut state = self.lock();
        let old = state.cache(self.id).max;
        state.max_pages = state.max_pages.saturating_sub(old).saturating_add(max);
        state.recompute_max_pinned();
        let cache = state.cache_mut(self.id);
        cache.max = max;
        cache.n90pct = (u64::from(max) * 9 / 10) as u32;
        state.enforce_max_pages();
    }

    /// Configured page ceiling
    pub fn cache_size(&self) -> u32 {
        self.lock().cache(self.id).max
    }

    /// Evict unpinned pages until the group is down to its floor
    pub fn shrink(&self) {
        if !self.purgeable {
            return;
        }
        let mut state = self.lock();
        let floor = state.min_pages;
        let evicted = state.evict_until(floor);
        debug!(evicted, floor, "shrunk cache group");
    }

    /// Pages currently held by this cache
    pub fn page_count(&self) -> u32 {
        self.lock().cache(self.id).hash.len()
    }

    /// Pages on the LRU list
    pub fn recyclable_count(&self) -> u32 {
        self.lock().cache(self.id).recyclable
    }

    /// Current hash bucket count
    pub fn bucket_count(&self) -> usize {
        self.lock().cache(self.id).hash.bucket_count()
    }

    /// Highest page number fetched since the last truncate
    pub fn max_key(&self) -> Pgno {
        self.lock().cache(self.id).max_key
    }

    /// Look up `key`, creating it as `mode` allows. A returned page is pinned.
    pub fn fetch(&self, key: Pgno, mode: CreateMode) -> Result<Option<PageHandle>> {
        self.fetch_with(key, mode, |state, idx| state.entries.handle(idx))
    }

    /// `fetch`, running `f` on the pinned entry before the group mutex is released
    pub(crate) fn fetch_with<R>(
        &self,
        key: Pgno,
        mode: CreateMode,
        f: impl FnOnce(&mut GroupState, u32) -> R,
    ) -> Result<Option<R>> {
        let mut state = self.lock();
        let stats = self.group.stats();

        if let Some(idx) = state.lookup(self.id, key) {
            stats.record_hit();
            state.pin(idx);
            self.note_key(&mut state, key);
            return Ok(Some(f(&mut state, idx)));
        }
        stats.record_miss();
        if mode == CreateMode::Never {
            return Ok(None);
        }

        let buffer_size = self.page_size + self.extra_size;
        let pool = self.group.pool();
        if mode == CreateMode::Easy {
            let cache = state.cache(self.id);
            let pinned = cache.pinned();
            if pinned >= state.max_pinned
                || pinned >= cache.n90pct
                || pool.is_under_pressure(buffer_size)
            {
                trace!(key, pinned, "easy fetch refused");
                return Ok(None);
            }
        }

        if state.cache(self.id).hash.needs_grow() {
            if let Err(err) = self.resize_hash(&mut state) {
                return match mode {
                    CreateMode::Force => Err(err),
                    _ => Ok(None),
                };
            }
            // The mutex was released while the table grew.
            if let Some(existing) = state.lookup(self.id, key) {
                state.pin(existing);
                self.note_key(&mut state, key);
                return Ok(Some(f(&mut state, existing)));
            }
        }

        let mut slot = None;
        if self.purgeable && state.lru_tail().is_some() {
            let cache = state.cache(self.id);
            if cache.hash.len() + 1 >= cache.max
                || state.current_pages >= state.max_pages
                || pool.is_under_pressure(buffer_size)
            {
                slot = state.recycle_tail(self.id, key);
            }
        }

        let idx = match slot {
            Some(idx) => idx,
            None => {
                let allocated = {
                    let _benign = (mode == CreateMode::Easy).then(PagePool::begin_benign);
                    MutexGuard::unlocked(&mut state, || pool.allocate(buffer_size))
                };
                let buffer = match allocated {
                    Ok(buffer) => buffer,
                    Err(err) => {
                        return match mode {
                            CreateMode::Force => Err(err),
                            _ => Ok(None),
                        };
                    }
                };
                // Someone may have created the page while the mutex was released.
                if let Some(existing) = state.lookup(self.id, key) {
                    pool.release(buffer);
                    state.pin(existing);
                    self.note_key(&mut state, key);
                    return Ok(Some(f(&mut state, existing)));
                }
                if self.purgeable {
                    state.current_pages += 1;
                }
                state
                    .entries
                    .insert(Entry::new(key, self.id, buffer, self.page_size))
            }
        };

        state.insert_hash(self.id, idx);
        self.note_key(&mut state, key);
        stats.record_insert();
        if self.purgeable && state.current_pages > state.max_pages {
            state.enforce_max_pages();
        }
        Ok(Some(f(&mut state, idx)))
    }

    /// Double the bucket array (256 minimum).
    ///
    /// The group mutex is released while the array is allocated, since the
    /// allocator may need to evict pages from this group to make room. On
    /// failure the old table stays in place.
    fn resize_hash(&self, state: &mut MutexGuard<'_, GroupState>) -> Result<()> {
        let old = state.cache(self.id).hash.bucket_count();
        let new = state.cache(self.id).hash.next_bucket_count();
        let bytes = PageHash::bytes_for(new);
        let pool = self.group.pool();

        let buckets = MutexGuard::unlocked(state, || {
            let _benign = (old != 0).then(PagePool::begin_benign);
            pool.charge_heap(bytes).map(|()| vec![None; new])
        })?;

        if state.cache(self.id).hash.bucket_count() >= new {
            pool.uncharge_heap(bytes);
            return Ok(());
        }
        let replaced = state.install_buckets(self.id, buckets);
        pool.uncharge_heap(PageHash::bytes_for(replaced.len()));
        self.group.stats().record_resize();
        debug!(id = self.id, old, new, "hash table resized");
        Ok(())
    }

    fn note_key(&self, state: &mut GroupState, key: Pgno) {
        let cache = state.cache_mut(self.id);
        if key > cache.max_key {
            cache.max_key = key;
        }
    }

    /// Make a pinned page evictable.
    ///
    /// The page goes to the head of the LRU list, or to the tail when
    /// `reuse_unlikely`. If the group is over budget it is freed instead.
    /// Unpinning a page already on the list does nothing, and pages of
    /// in-memory caches are never put on the list.
    pub fn unpin(&self, page: PageHandle, reuse_unlikely: bool) -> Result<()> {
        let mut state = self.lock();
        let idx = self.resolve(&state, page)?;
        if self.purgeable {
            state.unpin(idx, reuse_unlikely);
        }
        Ok(())
    }

    /// Remove a page from the cache and free it
    pub fn discard(&self, page: PageHandle) -> Result<()> {
        let mut state = self.lock();
        let idx = self.resolve(&state, page)?;
        state.discard(idx);
        Ok(())
    }

    /// Move a page from `old_key` to `new_key`
    pub fn rekey(&self, page: PageHandle, old_key: Pgno, new_key: Pgno) -> Result<()> {
        let mut state = self.lock();
        let idx = self.resolve(&state, page)?;
        self.rekey_locked(&mut state, idx, old_key, new_key)
    }

    pub(crate) fn rekey_locked(
        &self,
        state: &mut GroupState,
        idx: u32,
        old_key: Pgno,
        new_key: Pgno,
    ) -> Result<()> {
        if state.entries[idx].key != old_key {
            return Err(Error::Misuse("rekey with wrong old key"));
        }
        if old_key == new_key {
            return Ok(());
        }
        if state.lookup(self.id, new_key).is_some() {
            return Err(Error::Misuse("rekey target already cached"));
        }
        let (entries, cache) = state.parts(self.id);
        cache.hash.rekey(entries, idx, new_key);
        self.note_key(state, new_key);
        Ok(())
    }

    /// Discard every page with key `>= limit`, pinned or not
    pub fn truncate(&self, limit: Pgno) {
        let mut state = self.lock();
        self.truncate_locked(&mut state, limit);
    }

    pub(crate) fn truncate_locked(&self, state: &mut GroupState, limit: Pgno) {
        if limit > state.cache(self.id).max_key {
            return;
        }
        state.truncate(self.id, limit);
        state.cache_mut(self.id).max_key = limit.saturating_sub(1);
    }
}

impl Drop for CacheInstance {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.truncate(self.id, 0);
        let Some(mut cache) = state.remove_cache(self.id) else {
            return;
        };
        state.max_pages = state.max_pages.saturating_sub(cache.max);
        state.min_pages = state.min_pages.saturating_sub(cache.min);
        state.recompute_max_pinned();
        state.enforce_max_pages();
        let buckets = cache.hash.take_buckets();
        state.pool.uncharge_heap(PageHash::bytes_for(buckets.len()));
        drop(state);
        debug!(id = self.id, "cache instance destroyed");
    }
}
