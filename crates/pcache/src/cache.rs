//! PageCache: the reference-counted page cache used by the pager
//!
//! Wraps one [`CacheInstance`] and layers on top of it:
//! - per-page reference counts (a referenced page is always pinned),
//! - the dirty list, kept in modification order,
//! - spilling: when a new page cannot be had cheaply, an unreferenced
//!   dirty page is handed to the stress callback to be written out and
//!   made clean so its slot can be reused.
//!
//! Unreferenced dirty pages stay pinned until they are made clean, and
//! pages of in-memory (non-purgeable) caches are never unpinned at all.

use tracing::{debug, warn};

use crate::config::{pages_for, CacheConfig};
use crate::entry::{PageFlags, PageHandle};
use crate::error::{Error, Result};
use crate::group::{CacheGroup, GroupState};
use crate::instance::{CacheInstance, CreateMode};
use crate::Pgno;

/// Callback asked to make a dirty page clean (usually by writing it out)
pub type StressFn = Box<dyn Fn(&PageCache, PageHandle) -> Result<()> + Send + Sync>;

/// Page cache handle for one pager
pub struct PageCache {
    instance: CacheInstance,
    config: CacheConfig,
    stress: Option<StressFn>,
}

impl PageCache {
    /// Open a cache in `group`
    ///
    /// # Arguments
    /// * `group` - Group whose budget and LRU list the cache joins
    /// * `config` - Page size, extra size, purgeability and cache size
    pub fn open(group: &CacheGroup, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let instance = Self::new_instance(group, &config);
        Ok(Self {
            instance,
            config,
            stress: None,
        })
    }

    /// Install the callback used to spill dirty pages
    pub fn with_stress<F>(mut self, stress: F) -> Self
    where
        F: Fn(&PageCache, PageHandle) -> Result<()> + Send + Sync + 'static,
    {
        self.stress = Some(Box::new(stress));
        self
    }

    fn new_instance(group: &CacheGroup, config: &CacheConfig) -> CacheInstance {
        let instance =
            CacheInstance::create(group, config.page_size, config.extra_size, config.purgeable);
        instance.lock().cache_mut(instance.id()).facade = true;
        instance.set_cache_size(config.cache_pages());
        instance
    }

    /// The group this cache belongs to
    pub fn group(&self) -> &CacheGroup {
        self.instance.group()
    }

    /// Current configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Change the page size. Only allowed with no references and no dirty
    /// pages; every cached page is discarded.
    pub fn set_page_size(&mut self, page_size: usize) -> Result<()> {
        if self.ref_count() != 0 || self.has_dirty() {
            return Err(Error::Misuse("page size change with pages in use"));
        }
        let config = CacheConfig {
            page_size,
            ..self.config.clone()
        };
        config.validate()?;
        let group = self.group().clone();
        self.instance = Self::new_instance(&group, &config);
        self.config = config;
        Ok(())
    }

    /// Set the cache size: pages when positive, `-KiB` when negative
    pub fn set_cache_size(&mut self, cache_size: i32) {
        self.config.cache_size = cache_size;
        let pages = pages_for(cache_size, self.config.page_size + self.config.extra_size);
        self.instance.set_cache_size(pages);
    }

    /// Configured cache size in pages
    pub fn cache_size(&self) -> u32 {
        self.config.cache_pages()
    }

    /// Evict unpinned pages down to the group floor
    pub fn shrink(&self) {
        self.instance.shrink();
    }

    /// Get a page, creating it when `create` is set.
    ///
    /// The returned page carries one more reference; balance it with
    /// [`release`](Self::release). `Ok(None)` means the page is not cached
    /// and `create` was false.
    pub fn fetch(&self, pgno: Pgno, create: bool) -> Result<Option<PageHandle>> {
        if pgno == 0 {
            return Err(Error::Misuse("page number 0"));
        }
        let mode = if !create {
            CreateMode::Never
        } else if !self.config.purgeable || !self.has_dirty() {
            CreateMode::Force
        } else {
            CreateMode::Easy
        };

        let mut page = self
            .instance
            .fetch_with(pgno, mode, |state, idx| self.take_ref(state, idx, pgno))?;

        if page.is_none() && mode == CreateMode::Easy {
            self.spill(pgno)?;
            page = self
                .instance
                .fetch_with(pgno, CreateMode::Force, |state, idx| {
                    self.take_ref(state, idx, pgno)
                })?;
        }

        match page {
            None if create => Err(Error::NoMem {
                requested: self.config.page_size + self.config.extra_size,
            }),
            page => Ok(page),
        }
    }

    fn take_ref(&self, state: &mut GroupState, idx: u32, pgno: Pgno) -> PageHandle {
        let (entries, cache) = state.parts(self.instance.id());
        let entry = &mut entries[idx];
        if entry.refs == 0 {
            cache.refs += 1;
        }
        entry.refs += 1;
        if pgno == 1 {
            cache.page1 = Some(idx);
        }
        entries.handle(idx)
    }

    /// Ask the stress callback to make one unreferenced dirty page clean
    fn spill(&self, pgno: Pgno) -> Result<()> {
        let candidate = {
            let mut state = self.instance.lock();
            let (entries, cache) = state.parts(self.instance.id());
            let found = cache
                .dirty
                .spill_candidate(entries)
                .map(|idx| (entries.handle(idx), entries[idx].key));
            found
        };
        let (Some((page, key)), Some(stress)) = (candidate, self.stress.as_ref()) else {
            return Ok(());
        };

        self.group().stats().record_spill();
        debug!(page = key, making_room_for = pgno, "spilling dirty page");
        match stress(self, page) {
            Ok(()) | Err(Error::Busy) => Ok(()),
            Err(err) => Err(Error::Spill {
                page: key,
                source: Box::new(err),
            }),
        }
    }

    /// Drop one reference. At zero a clean page becomes evictable and a
    /// dirty page moves to the most-recent end of the dirty list.
    ///
    /// Releasing a page with no references is a no-op.
    pub fn release(&self, page: PageHandle) -> Result<()> {
        self.unpin(page, false)
    }

    /// [`release`](Self::release), placing the page next in line for
    /// eviction when `reuse_unlikely` (or its `REUSE_UNLIKELY` flag) is set
    pub fn unpin(&self, page: PageHandle, reuse_unlikely: bool) -> Result<()> {
        let mut state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        let (entries, cache) = state.parts(self.instance.id());
        if entries[idx].refs == 0 {
            warn!(page = entries[idx].key, "release of an unreferenced page");
            return Ok(());
        }
        entries[idx].refs -= 1;
        if entries[idx].refs > 0 {
            return Ok(());
        }
        cache.refs -= 1;
        if entries[idx].flags.contains(PageFlags::DIRTY) {
            cache.dirty.touch(entries, idx);
        } else {
            if reuse_unlikely {
                entries[idx].flags.insert(PageFlags::REUSE_UNLIKELY);
            }
            self.unpin_clean(&mut state, idx);
        }
        Ok(())
    }

    /// Hand an unreferenced clean page back to the instance
    fn unpin_clean(&self, state: &mut GroupState, idx: u32) {
        if !self.config.purgeable {
            return;
        }
        let (entries, cache) = state.parts(self.instance.id());
        if cache.page1 == Some(idx) {
            cache.page1 = None;
        }
        let reuse_unlikely = entries[idx].flags.contains(PageFlags::REUSE_UNLIKELY);
        state.unpin(idx, reuse_unlikely);
    }

    /// Take another reference to an already referenced page
    pub fn add_ref(&self, page: PageHandle) -> Result<PageHandle> {
        let mut state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        let entry = &mut state.entries[idx];
        if entry.refs == 0 {
            return Err(Error::Misuse("add_ref on an unreferenced page"));
        }
        entry.refs += 1;
        Ok(page)
    }

    /// Discard a page held by exactly one reference, dirty or not
    pub fn drop_page(&self, page: PageHandle) -> Result<()> {
        let mut state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        if state.entries[idx].refs != 1 {
            return Err(Error::Misuse("drop_page needs exactly one reference"));
        }
        state.discard(idx);
        Ok(())
    }

    /// Add a referenced page to the dirty list
    pub fn make_dirty(&self, page: PageHandle) -> Result<()> {
        let mut state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        let (entries, cache) = state.parts(self.instance.id());
        let entry = &mut entries[idx];
        if entry.refs == 0 {
            return Err(Error::Misuse("make_dirty on an unreferenced page"));
        }
        entry.flags.remove(PageFlags::DONT_WRITE);
        if !entry.flags.contains(PageFlags::DIRTY) {
            entry.flags.insert(PageFlags::DIRTY);
            cache.dirty.push(entries, idx);
        }
        Ok(())
    }

    /// Take a page off the dirty list; an unreferenced page becomes evictable
    pub fn make_clean(&self, page: PageHandle) -> Result<()> {
        let mut state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        self.make_clean_locked(&mut state, idx);
        Ok(())
    }

    fn make_clean_locked(&self, state: &mut GroupState, idx: u32) {
        let (entries, cache) = state.parts(self.instance.id());
        if !entries[idx].flags.contains(PageFlags::DIRTY) {
            return;
        }
        cache.dirty.remove(entries, idx);
        entries[idx]
            .flags
            .remove(PageFlags::DIRTY | PageFlags::NEED_SYNC);
        if entries[idx].refs == 0 {
            self.unpin_clean(state, idx);
        }
    }

    /// Make every dirty page clean
    pub fn clean_all(&self) {
        let mut state = self.instance.lock();
        while let Some(idx) = state.cache(self.instance.id()).dirty.first() {
            self.make_clean_locked(&mut state, idx);
        }
    }

    /// Clear `NEED_SYNC` on every dirty page, after the journal was synced
    pub fn clear_sync_flags(&self) {
        let mut state = self.instance.lock();
        let (entries, cache) = state.parts(self.instance.id());
        cache.dirty.clear_sync_flags(entries);
    }

    /// Set flags on a page. `DIRTY` is ignored; use [`make_dirty`](Self::make_dirty).
    pub fn set_flags(&self, page: PageHandle, flags: PageFlags) -> Result<()> {
        let mut state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        state.entries[idx].flags.insert(flags - PageFlags::DIRTY);
        Ok(())
    }

    /// Clear flags on a page. `DIRTY` is ignored; use [`make_clean`](Self::make_clean).
    pub fn clear_flags(&self, page: PageHandle, flags: PageFlags) -> Result<()> {
        let mut state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        state.entries[idx].flags.remove(flags - PageFlags::DIRTY);
        Ok(())
    }

    /// Current flags of a page
    pub fn flags(&self, page: PageHandle) -> Result<PageFlags> {
        let state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        Ok(state.entries[idx].flags)
    }

    /// Page number of a page
    pub fn page_number(&self, page: PageHandle) -> Result<Pgno> {
        let state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        Ok(state.entries[idx].key)
    }

    /// Give a referenced page a new page number
    pub fn move_page(&self, page: PageHandle, new_pgno: Pgno) -> Result<()> {
        if new_pgno == 0 {
            return Err(Error::Misuse("page number 0"));
        }
        let mut state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        if state.entries[idx].refs == 0 {
            return Err(Error::Misuse("move_page on an unreferenced page"));
        }
        let old = state.entries[idx].key;
        self.instance.rekey_locked(&mut state, idx, old, new_pgno)?;

        let (entries, cache) = state.parts(self.instance.id());
        let flags = entries[idx].flags;
        if flags.contains(PageFlags::DIRTY | PageFlags::NEED_SYNC) {
            cache.dirty.touch(entries, idx);
        }
        if cache.page1 == Some(idx) {
            cache.page1 = None;
        }
        if new_pgno == 1 {
            cache.page1 = Some(idx);
        }
        Ok(())
    }

    /// Discard every page numbered above `pgno`.
    ///
    /// Dirty pages above the limit are made clean first. Truncating to 0
    /// keeps page 1 if it is referenced, with its content zeroed.
    pub fn truncate(&self, pgno: Pgno) {
        let mut state = self.instance.lock();
        let id = self.instance.id();
        let doomed: Vec<u32> = {
            let (entries, cache) = state.parts(id);
            cache
                .dirty
                .slots(entries)
                .into_iter()
                .filter(|&idx| entries[idx].key > pgno)
                .collect()
        };
        for idx in doomed {
            self.make_clean_locked(&mut state, idx);
        }

        let mut limit = pgno;
        if pgno == 0 {
            let (entries, cache) = state.parts(id);
            if let Some(page1) = cache.page1 {
                entries[page1].split_mut().0.fill(0);
                limit = 1;
            }
        }
        // Nothing lies above the last page number.
        if let Some(end) = limit.checked_add(1) {
            self.instance.truncate_locked(&mut state, end);
        }
    }

    /// Discard every page (page 1 survives, zeroed, while referenced)
    pub fn clear(&self) {
        self.truncate(0);
    }

    /// Close the cache, discarding every page
    pub fn close(self) {
        drop(self);
    }

    /// Run `f` on a page's content and extra bytes.
    ///
    /// `f` runs with the group mutex held and must not call back into the cache.
    pub fn read_page<R>(&self, page: PageHandle, f: impl FnOnce(&[u8], &[u8]) -> R) -> Result<R> {
        let state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        let (data, extra) = state.entries[idx].split();
        Ok(f(data, extra))
    }

    /// Run `f` on a page's content and extra bytes, mutably.
    ///
    /// `f` runs with the group mutex held and must not call back into the cache.
    pub fn write_page<R>(
        &self,
        page: PageHandle,
        f: impl FnOnce(&mut [u8], &mut [u8]) -> R,
    ) -> Result<R> {
        let mut state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        let (data, extra) = state.entries[idx].split_mut();
        Ok(f(data, extra))
    }

    /// Whether any page is dirty
    pub fn has_dirty(&self) -> bool {
        !self.instance.lock().cache(self.instance.id()).dirty.is_empty()
    }

    /// Dirty pages sorted by page number
    pub fn dirty_list(&self) -> Vec<PageHandle> {
        let state = self.instance.lock();
        let cache = state.cache(self.instance.id());
        let mut pages: Vec<(Pgno, PageHandle)> = cache
            .dirty
            .slots(&state.entries)
            .into_iter()
            .map(|idx| (state.entries[idx].key, state.entries.handle(idx)))
            .collect();
        pages.sort_unstable_by_key(|&(pgno, _)| pgno);
        pages.into_iter().map(|(_, page)| page).collect()
    }

    /// Visit dirty pages oldest first. `f` runs after the mutex is released.
    pub fn iterate_dirty(&self, mut f: impl FnMut(PageHandle, Pgno)) {
        let pages: Vec<(PageHandle, Pgno)> = {
            let state = self.instance.lock();
            let cache = state.cache(self.instance.id());
            let pages = cache
                .dirty
                .slots(&state.entries)
                .into_iter()
                .map(|idx| (state.entries.handle(idx), state.entries[idx].key))
                .collect();
            pages
        };
        for (page, pgno) in pages {
            f(page, pgno);
        }
    }

    /// Pages with at least one reference
    pub fn ref_count(&self) -> u32 {
        self.instance.lock().cache(self.instance.id()).refs
    }

    /// References held on one page
    pub fn page_ref_count(&self, page: PageHandle) -> Result<u32> {
        let state = self.instance.lock();
        let idx = self.instance.resolve(&state, page)?;
        Ok(state.entries[idx].refs)
    }

    /// Pages currently cached
    pub fn page_count(&self) -> u32 {
        self.instance.page_count()
    }

    /// Handle of page 1 while it is referenced
    pub fn page1(&self) -> Option<PageHandle> {
        let state = self.instance.lock();
        let page1 = state.cache(self.instance.id()).page1;
        page1.map(|idx| state.entries.handle(idx))
    }

    /// Verify the group's invariants
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        self.group().check_invariants()
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("config", &self.config)
            .field("has_stress", &self.stress.is_some())
            .finish()
    }
}
