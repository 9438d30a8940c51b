//! Per-cache list of dirty pages in modification order
//!
//! `first` is the page made dirty longest ago, `last` the most recent.
//! The synced cursor points at the oldest page that may not need a journal
//! sync before it is written; spill candidates are searched from there.

use crate::entry::{EntryArena, Link, PageFlags};

#[derive(Debug, Default)]
pub(crate) struct DirtyList {
    first: Link,
    last: Link,
    synced: Link,
}

impl DirtyList {
    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub(crate) fn first(&self) -> Link {
        self.first
    }

    /// Append `idx` as the most recently dirtied page
    pub(crate) fn push(&mut self, arena: &mut EntryArena, idx: u32) {
        debug_assert!(arena[idx].dirty_prev.is_none() && arena[idx].dirty_next.is_none());
        debug_assert_ne!(self.first, Some(idx));

        arena[idx].dirty_prev = self.last;
        arena[idx].dirty_next = None;
        match self.last {
            Some(last) => arena[last].dirty_next = Some(idx),
            None => self.first = Some(idx),
        }
        self.last = Some(idx);

        if self.synced.is_none() && !arena[idx].flags.contains(PageFlags::NEED_SYNC) {
            self.synced = Some(idx);
        }
    }

    pub(crate) fn remove(&mut self, arena: &mut EntryArena, idx: u32) {
        if self.synced == Some(idx) {
            let mut cursor = arena[idx].dirty_next;
            while let Some(next) = cursor {
                if !arena[next].flags.contains(PageFlags::NEED_SYNC) {
                    break;
                }
                cursor = arena[next].dirty_next;
            }
            self.synced = cursor;
        }

        let (prev, next) = (arena[idx].dirty_prev, arena[idx].dirty_next);
        match prev {
            Some(p) => arena[p].dirty_next = next,
            None => {
                debug_assert_eq!(self.first, Some(idx));
                self.first = next;
            }
        }
        match next {
            Some(n) => arena[n].dirty_prev = prev,
            None => {
                debug_assert_eq!(self.last, Some(idx));
                self.last = prev;
            }
        }
        arena[idx].dirty_prev = None;
        arena[idx].dirty_next = None;
    }

    /// Move `idx` to the most-recent end
    pub(crate) fn touch(&mut self, arena: &mut EntryArena, idx: u32) {
        self.remove(arena, idx);
        self.push(arena, idx);
    }

    /// Pick an unreferenced dirty page to hand to the stress callback.
    ///
    /// Prefers a page that needs no journal sync, searching forward from
    /// the synced cursor, and settles for any unreferenced page otherwise.
    pub(crate) fn spill_candidate(&mut self, arena: &EntryArena) -> Option<u32> {
        let mut cursor = self.synced;
        while let Some(idx) = cursor {
            let entry = &arena[idx];
            if entry.refs == 0 && !entry.flags.contains(PageFlags::NEED_SYNC) {
                break;
            }
            cursor = entry.dirty_next;
        }
        self.synced = cursor;
        if cursor.is_some() {
            return cursor;
        }

        let mut cursor = self.first;
        while let Some(idx) = cursor {
            if arena[idx].refs == 0 {
                return Some(idx);
            }
            cursor = arena[idx].dirty_next;
        }
        None
    }

    /// Clear `NEED_SYNC` on every page and reset the cursor to the oldest
    pub(crate) fn clear_sync_flags(&mut self, arena: &mut EntryArena) {
        let mut cursor = self.first;
        while let Some(idx) = cursor {
            arena[idx].flags.remove(PageFlags::NEED_SYNC);
            cursor = arena[idx].dirty_next;
        }
        self.synced = self.first;
    }

    /// Slots oldest first
    pub(crate) fn slots(&self, arena: &EntryArena) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cursor = self.first;
        while let Some(idx) = cursor {
            out.push(idx);
            cursor = arena[idx].dirty_next;
        }
        out
    }
}
