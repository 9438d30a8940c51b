//! Slab allocator for page buffers
//!
//! A pool of fixed-size slots carved out of one contiguous arena. Requests
//! that fit a slot are served from the free list; everything else (and
//! anything arriving after the slots run out) falls back to the heap.
//!
//! Whether a returned buffer belongs to the slab is decided by checking
//! that its address lies inside the arena, never by a tag on the buffer.
//!
//! Heap-fallback buffers and hash bucket arrays are charged against an
//! optional heap ceiling. When a charge would cross the ceiling the pool
//! asks every registered cache group to evict unpinned pages first.
//!
//! Lock order: a group mutex may be held while calling into the pool, but
//! the pool never calls back into a group while holding its own mutex.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::group::GroupInner;

/// Slab layout, fixed once configured
#[derive(Debug)]
struct SlabLayout {
    slot_size: usize,
    slots: usize,
    reserve: usize,
    start: usize,
    end: usize,
}

impl SlabLayout {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Something that can give memory back when the heap runs short
pub(crate) trait Reclaim: Send + Sync {
    /// Free unpinned pages until roughly `bytes` of heap memory is released.
    /// Returns the number of heap bytes actually released.
    fn release_memory(&self, bytes: usize) -> usize;
}

/// Owned page-sized byte block, either a slab slot or a heap allocation.
///
/// Hand buffers back with [`PagePool::release`]. A heap buffer that is
/// dropped instead still gives its heap charge back; a dropped slab slot
/// is lost to the free list for the life of the pool.
pub struct PageBuffer {
    bytes: BytesMut,
    len: usize,
    charge: Option<HeapCharge>,
}

/// Heap bytes charged by a pool, shared with the buffers holding them
#[derive(Debug, Default)]
struct HeapAccount {
    /// Everything charged: fallback buffers and bucket arrays
    used: AtomicUsize,
    /// Fallback page buffers only
    overflow: AtomicUsize,
}

/// Charge carried by a heap-fallback buffer, returned when it drops
struct HeapCharge {
    account: Arc<HeapAccount>,
    bytes: usize,
}

impl Drop for HeapCharge {
    fn drop(&mut self) {
        self.account.used.fetch_sub(self.bytes, Ordering::Relaxed);
        self.account.overflow.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

impl PageBuffer {
    /// Usable length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check whether the buffer has zero length
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Usable bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Usable bytes, mutably
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    fn addr(&self) -> usize {
        self.bytes.as_ptr() as usize
    }
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer")
            .field("len", &self.len)
            .field("addr", &format_args!("{:#x}", self.addr()))
            .finish()
    }
}

/// Snapshot of allocator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots currently handed out
    pub slots_used: usize,
    /// Slots still on the free list
    pub free_slots: usize,
    /// Bytes currently held by heap-fallback page buffers
    pub overflow_bytes: usize,
    /// Largest allocation request seen
    pub largest_request: usize,
    /// All heap bytes charged (fallback buffers and bucket arrays)
    pub heap_used: usize,
    /// Failures outside a benign scope
    pub escalated_failures: u64,
    /// Failures inside a benign scope
    pub benign_failures: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    slots_used: AtomicUsize,
    largest_request: AtomicUsize,
    escalated_failures: AtomicU64,
    benign_failures: AtomicU64,
}

thread_local! {
    static BENIGN_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks allocation failures on this thread as benign until dropped
pub struct BenignMallocGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for BenignMallocGuard {
    fn drop(&mut self) {
        BENIGN_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn in_benign_scope() -> bool {
    BENIGN_DEPTH.with(|depth| depth.get() > 0)
}

const NO_LIMIT: usize = usize::MAX;

/// Process-wide page allocator
pub struct PagePool {
    layout: OnceLock<SlabLayout>,
    /// Free list; this mutex is the allocator mutex
    free: Mutex<Vec<BytesMut>>,
    /// Read without the mutex; a stale value only skews a heuristic
    under_pressure: AtomicBool,
    heap: Arc<HeapAccount>,
    heap_limit: AtomicUsize,
    counters: PoolCounters,
    reclaimers: Mutex<Vec<Weak<dyn Reclaim>>>,
    pub(crate) shared_group: Mutex<Weak<GroupInner>>,
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}

impl PagePool {
    /// Create a pool with no slab; every allocation goes to the heap
    pub fn new() -> Self {
        Self {
            layout: OnceLock::new(),
            free: Mutex::new(Vec::new()),
            under_pressure: AtomicBool::new(false),
            heap: Arc::default(),
            heap_limit: AtomicUsize::new(NO_LIMIT),
            counters: PoolCounters::default(),
            reclaimers: Mutex::new(Vec::new()),
            shared_group: Mutex::new(Weak::new()),
        }
    }

    /// Create and configure a pool
    pub fn with_config(config: &PoolConfig) -> Self {
        let pool = Self::new();
        pool.configure(config);
        pool
    }

    /// The process-wide pool
    pub fn global() -> &'static Arc<PagePool> {
        static GLOBAL: OnceLock<Arc<PagePool>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(PagePool::new()))
    }

    /// Install the slab described by `config`.
    ///
    /// The slot size is rounded down to a multiple of 8. A slab can be
    /// installed only once per pool; later calls leave the slab alone and
    /// return `false`. The heap limit, if given, is applied either way.
    pub fn configure(&self, config: &PoolConfig) -> bool {
        if config.heap_limit.is_some() {
            self.set_heap_limit(config.heap_limit);
        }

        let slot_size = config.slot_size & !7;
        let slots = config.slot_count;
        if slot_size == 0 || slots == 0 {
            return false;
        }
        if self.layout.get().is_some() {
            warn!("page pool already configured, ignoring new slab settings");
            return false;
        }

        let mut arena = BytesMut::zeroed(slot_size * slots);
        let start = arena.as_ptr() as usize;
        let end = start + slot_size * slots;
        let reserve = if slots > 90 { 10 } else { slots / 10 + 1 };

        // Every view shares the arena allocation, so addresses stay in range.
        let mut free = Vec::with_capacity(slots);
        for _ in 0..slots {
            free.push(arena.split_to(slot_size));
        }
        // Pop order follows the arena from low to high addresses.
        free.reverse();

        let layout = SlabLayout {
            slot_size,
            slots,
            reserve,
            start,
            end,
        };
        if self.layout.set(layout).is_err() {
            warn!("page pool configured concurrently, discarding slab");
            return false;
        }
        *self.free.lock() = free;
        self.under_pressure.store(false, Ordering::Relaxed);

        info!(slot_size, slots, reserve, "page pool slab configured");
        true
    }

    /// Configured slot size, or 0 without a slab
    pub fn slot_size(&self) -> usize {
        self.layout.get().map_or(0, |l| l.slot_size)
    }

    /// Total slab slots
    pub fn slot_count(&self) -> usize {
        self.layout.get().map_or(0, |l| l.slots)
    }

    /// Free-slot level at or below which the slab reports pressure
    pub fn reserve(&self) -> usize {
        self.layout.get().map_or(0, |l| l.reserve)
    }

    /// Change the heap ceiling; `None` removes it
    pub fn set_heap_limit(&self, limit: Option<usize>) {
        self.heap_limit.store(limit.unwrap_or(NO_LIMIT), Ordering::Relaxed);
    }

    /// Current heap ceiling
    pub fn heap_limit(&self) -> Option<usize> {
        match self.heap_limit.load(Ordering::Relaxed) {
            NO_LIMIT => None,
            limit => Some(limit),
        }
    }

    /// Heap bytes currently charged
    pub fn heap_used(&self) -> usize {
        self.heap.used.load(Ordering::Relaxed)
    }

    /// True once heap usage reaches 90% of the ceiling
    pub fn heap_nearly_full(&self) -> bool {
        match self.heap_limit() {
            Some(limit) => self.heap_used() >= limit - limit / 10,
            None => false,
        }
    }

    /// Whether an allocation of `size` bytes is being made under memory pressure
    pub fn is_under_pressure(&self, size: usize) -> bool {
        match self.layout.get() {
            Some(layout) if size <= layout.slot_size => {
                self.under_pressure.load(Ordering::Relaxed)
            }
            _ => self.heap_nearly_full(),
        }
    }

    /// Treat allocation failures on this thread as benign until the guard drops
    pub fn begin_benign() -> BenignMallocGuard {
        BENIGN_DEPTH.with(|depth| depth.set(depth.get() + 1));
        BenignMallocGuard {
            _not_send: PhantomData,
        }
    }

    /// Allocate a zero-filled buffer of `size` bytes
    pub fn allocate(&self, size: usize) -> Result<PageBuffer> {
        self.counters
            .largest_request
            .fetch_max(size, Ordering::Relaxed);

        if let Some(layout) = self.layout.get() {
            if size <= layout.slot_size {
                let mut free = self.free.lock();
                if let Some(mut slot) = free.pop() {
                    self.under_pressure
                        .store(free.len() <= layout.reserve, Ordering::Relaxed);
                    drop(free);
                    self.counters.slots_used.fetch_add(1, Ordering::Relaxed);
                    slot.fill(0);
                    return Ok(PageBuffer {
                        bytes: slot,
                        len: size,
                        charge: None,
                    });
                }
            }
        }

        self.charge_heap(size)?;
        self.heap.overflow.fetch_add(size, Ordering::Relaxed);
        trace!(size, "page buffer from heap");
        Ok(PageBuffer {
            bytes: BytesMut::zeroed(size),
            len: size,
            charge: Some(HeapCharge {
                account: Arc::clone(&self.heap),
                bytes: size,
            }),
        })
    }

    /// Return a buffer. Yields the number of heap bytes freed (0 for slots).
    pub fn release(&self, buffer: PageBuffer) -> usize {
        let addr = buffer.addr();
        if let Some(layout) = self.layout.get() {
            if layout.contains(addr) {
                let mut free = self.free.lock();
                free.push(buffer.bytes);
                debug_assert!(free.len() <= layout.slots);
                self.under_pressure
                    .store(free.len() <= layout.reserve, Ordering::Relaxed);
                drop(free);
                self.counters.slots_used.fetch_sub(1, Ordering::Relaxed);
                return 0;
            }
        }

        // Dropping the charge gives the bytes back to whichever pool made it.
        buffer.charge.map_or(0, |charge| charge.bytes)
    }

    /// Check whether `buffer` lives inside the slab arena
    pub fn owns(&self, buffer: &PageBuffer) -> bool {
        self.layout
            .get()
            .is_some_and(|layout| layout.contains(buffer.addr()))
    }

    /// Ask registered groups to free `bytes` of heap memory.
    /// Returns how much was actually freed.
    pub fn release_memory(&self, bytes: usize) -> usize {
        let reclaimers: Vec<Arc<dyn Reclaim>> = {
            let mut list = self.reclaimers.lock();
            list.retain(|weak| weak.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };

        let mut freed = 0;
        for reclaimer in reclaimers {
            if freed >= bytes {
                break;
            }
            freed += reclaimer.release_memory(bytes - freed);
        }
        debug!(requested = bytes, freed, "released cache memory");
        freed
    }

    /// Allocator counters
    pub fn stats(&self) -> PoolStats {
        let free_slots = self.free.lock().len();
        PoolStats {
            slots_used: self.counters.slots_used.load(Ordering::Relaxed),
            free_slots,
            overflow_bytes: self.heap.overflow.load(Ordering::Relaxed),
            largest_request: self.counters.largest_request.load(Ordering::Relaxed),
            heap_used: self.heap_used(),
            escalated_failures: self.counters.escalated_failures.load(Ordering::Relaxed),
            benign_failures: self.counters.benign_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn register(&self, reclaimer: Weak<dyn Reclaim>) {
        self.reclaimers.lock().push(reclaimer);
    }

    /// Charge `bytes` of heap usage, reclaiming cache memory once if the
    /// ceiling would be crossed. Must not be called with a group mutex held.
    pub(crate) fn charge_heap(&self, bytes: usize) -> Result<()> {
        if self.try_charge(bytes) {
            return Ok(());
        }
        self.release_memory(bytes);
        if self.try_charge(bytes) {
            return Ok(());
        }
        self.report_failure(bytes);
        Err(Error::NoMem { requested: bytes })
    }

    pub(crate) fn uncharge_heap(&self, bytes: usize) {
        let prev = self.heap.used.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "heap accounting underflow");
    }

    fn try_charge(&self, bytes: usize) -> bool {
        let limit = self.heap_limit.load(Ordering::Relaxed);
        self.heap
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                used.checked_add(bytes).filter(|&next| next <= limit)
            })
            .is_ok()
    }

    fn report_failure(&self, bytes: usize) {
        if in_benign_scope() {
            self.counters.benign_failures.fetch_add(1, Ordering::Relaxed);
            debug!(bytes, "benign allocation failure");
        } else {
            self.counters
                .escalated_failures
                .fetch_add(1, Ordering::Relaxed);
            error!(bytes, heap_used = self.heap_used(), "allocation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_uses_heap() {
        let pool = PagePool::new();
        let buf = pool.allocate(512).unwrap();
        assert_eq!(buf.len(), 512);
        assert!(!pool.owns(&buf));
        assert_eq!(pool.heap_used(), 512);
        assert_eq!(pool.release(buf), 512);
        assert_eq!(pool.heap_used(), 0);
    }

    #[test]
    fn test_dropped_heap_buffer_gives_back_charge() {
        let pool = PagePool::new();
        let buf = pool.allocate(512).unwrap();
        assert_eq!(pool.stats().overflow_bytes, 512);
        drop(buf);
        assert_eq!(pool.heap_used(), 0);
        assert_eq!(pool.stats().overflow_bytes, 0);
    }

    #[test]
    fn test_global_pool_is_shared() {
        let pool = PagePool::global();
        assert!(Arc::ptr_eq(pool, PagePool::global()));
        let group = pool.group();
        assert!(group.same_group(&PagePool::global().group()));
        assert!(Arc::ptr_eq(group.pool(), pool));
    }

    #[test]
    fn test_slot_size_rounded_down() {
        let pool = PagePool::with_config(&PoolConfig::new(1031, 4));
        assert_eq!(pool.slot_size(), 1024);
        assert_eq!(pool.slot_count(), 4);
    }

    #[test]
    fn test_reserve_threshold() {
        assert_eq!(PagePool::with_config(&PoolConfig::new(64, 4)).reserve(), 1);
        assert_eq!(PagePool::with_config(&PoolConfig::new(64, 50)).reserve(), 6);
        assert_eq!(PagePool::with_config(&PoolConfig::new(64, 200)).reserve(), 10);
    }

    #[test]
    fn test_configure_once() {
        let pool = PagePool::new();
        assert!(pool.configure(&PoolConfig::new(256, 8)));
        assert!(!pool.configure(&PoolConfig::new(512, 16)));
        assert_eq!(pool.slot_size(), 256);
        assert_eq!(pool.slot_count(), 8);
    }

    #[test]
    fn test_slab_then_heap_fallback() {
        let pool = PagePool::with_config(&PoolConfig::new(1024, 4));
        let mut bufs = Vec::new();
        for _ in 0..4 {
            let buf = pool.allocate(1000).unwrap();
            assert!(pool.owns(&buf));
            bufs.push(buf);
        }
        assert!(pool.is_under_pressure(1000));

        let extra = pool.allocate(1000).unwrap();
        assert!(!pool.owns(&extra));
        assert_eq!(pool.stats().overflow_bytes, 1000);

        assert_eq!(pool.release(extra), 1000);
        for buf in bufs {
            assert_eq!(pool.release(buf), 0);
        }
        let stats = pool.stats();
        assert_eq!(stats.slots_used, 0);
        assert_eq!(stats.free_slots, 4);
        assert!(!pool.is_under_pressure(1000));
    }

    #[test]
    fn test_oversized_goes_to_heap() {
        let pool = PagePool::with_config(&PoolConfig::new(512, 4));
        let buf = pool.allocate(4096).unwrap();
        assert!(!pool.owns(&buf));
        assert_eq!(pool.stats().slots_used, 0);
        pool.release(buf);
    }

    #[test]
    fn test_reused_slot_is_zeroed() {
        let pool = PagePool::with_config(&PoolConfig::new(64, 1));
        let mut buf = pool.allocate(64).unwrap();
        buf.as_mut_slice().fill(0xAB);
        pool.release(buf);
        let buf = pool.allocate(64).unwrap();
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        pool.release(buf);
    }

    #[test]
    fn test_heap_limit_failure() {
        let pool = PagePool::with_config(&PoolConfig::default().with_heap_limit(1000));
        let held = pool.allocate(800).unwrap();
        assert!(!pool.heap_nearly_full());
        let err = pool.allocate(400).unwrap_err();
        assert!(matches!(err, Error::NoMem { requested: 400 }));
        assert_eq!(pool.stats().escalated_failures, 1);

        {
            let _benign = PagePool::begin_benign();
            assert!(pool.allocate(400).is_err());
        }
        let stats = pool.stats();
        assert_eq!(stats.benign_failures, 1);
        assert_eq!(stats.escalated_failures, 1);

        let more = pool.allocate(100).unwrap();
        assert!(pool.heap_nearly_full());
        assert!(pool.is_under_pressure(4096));
        pool.release(more);
        pool.release(held);
    }
}
