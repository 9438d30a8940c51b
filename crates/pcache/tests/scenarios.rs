use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use pcache::{
    CacheConfig, CacheGroup, CacheInstance, CreateMode, Error, PageCache, PageHandle, PagePool,
    Pgno, PoolConfig,
};
use proptest::prelude::*;

fn group() -> CacheGroup {
    CacheGroup::new(Arc::new(PagePool::new()))
}

#[test]
fn test_oldest_unpinned_page_is_evicted() {
    let group = group();
    let cache = CacheInstance::create(&group, 1024, 0, true);
    cache.set_cache_size(3);

    let pages: Vec<PageHandle> = (1..=3)
        .map(|key| cache.fetch(key, CreateMode::Force).unwrap().unwrap())
        .collect();
    for page in pages {
        cache.unpin(page, false).unwrap();
    }

    cache.fetch(4, CreateMode::Force).unwrap().unwrap();
    assert_eq!(cache.fetch(1, CreateMode::Never).unwrap(), None);
    for key in 2..=4 {
        assert!(cache.fetch(key, CreateMode::Never).unwrap().is_some());
    }
    assert_eq!(cache.page_count(), 3);
    group.check_invariants().unwrap();
}

#[test]
fn test_slab_exhaustion_falls_back_to_heap() {
    let pool = PagePool::with_config(&PoolConfig::new(1024, 4));
    assert_eq!(pool.reserve(), 1);
    assert!(!pool.is_under_pressure(1024));

    let mut buffers = Vec::new();
    for _ in 0..4 {
        let buffer = pool.allocate(1024).unwrap();
        assert!(pool.owns(&buffer));
        buffers.push(buffer);
    }
    assert!(pool.is_under_pressure(1024));

    let fifth = pool.allocate(1024).unwrap();
    assert!(!pool.owns(&fifth));
    let stats = pool.stats();
    assert_eq!(stats.slots_used, 4);
    assert_eq!(stats.overflow_bytes, 1024);
    assert_eq!(stats.heap_used, 1024);

    assert_eq!(pool.release(fifth), 1024);
    for buffer in buffers {
        assert_eq!(pool.release(buffer), 0);
    }
    assert!(!pool.is_under_pressure(1024));
    assert_eq!(pool.stats().heap_used, 0);
}

#[test]
fn test_truncate_ignores_pin_state() {
    let group = group();
    let cache = CacheInstance::create(&group, 1024, 0, true);
    cache.set_cache_size(10);

    let five = cache.fetch(5, CreateMode::Force).unwrap().unwrap();
    let ten = cache.fetch(10, CreateMode::Force).unwrap().unwrap();
    let fifteen = cache.fetch(15, CreateMode::Force).unwrap().unwrap();
    cache.unpin(five, false).unwrap();
    cache.unpin(fifteen, false).unwrap();

    cache.truncate(10);
    assert_eq!(cache.page_count(), 1);
    assert_eq!(cache.fetch(5, CreateMode::Never).unwrap(), Some(five));
    assert_eq!(cache.fetch(10, CreateMode::Never).unwrap(), None);
    assert_eq!(cache.fetch(15, CreateMode::Never).unwrap(), None);
    assert!(matches!(cache.unpin(ten, false), Err(Error::StaleHandle { .. })));
    assert_eq!(cache.max_key(), 9);
    group.check_invariants().unwrap();
}

#[test]
fn test_pinned_pages_survive_over_budget() {
    let group = group();
    let x = CacheInstance::create(&group, 1024, 0, true);
    let y = CacheInstance::create(&group, 1024, 0, true);
    x.set_cache_size(2);
    assert_eq!(group.max_pages(), 2);

    let a = x.fetch(1, CreateMode::Force).unwrap().unwrap();
    let b = x.fetch(2, CreateMode::Force).unwrap().unwrap();
    y.fetch(1, CreateMode::Force).unwrap().unwrap();

    assert_eq!(group.current_pages(), 3);
    assert_eq!(x.page_count(), 2);
    group.check_invariants().unwrap();

    // Over budget, so the unpinned page is freed rather than queued
    x.unpin(a, false).unwrap();
    assert_eq!(group.current_pages(), 2);
    assert_eq!(x.fetch(1, CreateMode::Never).unwrap(), None);
    assert!(group.lru_pages().is_empty());

    x.unpin(b, false).unwrap();
    assert_eq!(group.lru_pages(), vec![2]);
    group.check_invariants().unwrap();
}

#[test]
fn test_eviction_follows_unpin_order() {
    let group = group();
    let cache = CacheInstance::create(&group, 512, 0, true);
    cache.set_cache_size(5);

    let pages: Vec<PageHandle> = (1..=5)
        .map(|key| cache.fetch(key, CreateMode::Force).unwrap().unwrap())
        .collect();
    for key in [3, 1, 2, 5, 4] {
        cache.unpin(pages[key as usize - 1], false).unwrap();
    }
    assert_eq!(group.lru_pages(), vec![3, 1, 2, 5, 4]);

    cache.set_cache_size(2);
    assert_eq!(group.lru_pages(), vec![5, 4]);
    assert_eq!(group.stats().evictions(), 3);
    group.check_invariants().unwrap();
}

#[test]
fn test_group_lru_spans_caches() {
    let group = group();
    let a = CacheInstance::create(&group, 512, 0, true);
    let b = CacheInstance::create(&group, 512, 0, true);
    a.set_cache_size(3);
    b.set_cache_size(3);

    let a1 = a.fetch(1, CreateMode::Force).unwrap().unwrap();
    let b1 = b.fetch(1, CreateMode::Force).unwrap().unwrap();
    let a2 = a.fetch(2, CreateMode::Force).unwrap().unwrap();
    let b2 = b.fetch(2, CreateMode::Force).unwrap().unwrap();
    a.unpin(a1, false).unwrap();
    b.unpin(b1, false).unwrap();
    a.unpin(a2, false).unwrap();
    b.unpin(b2, false).unwrap();

    // The group budget drops to 3; only the oldest page, a's page 1, goes
    b.set_cache_size(0);
    assert_eq!(a.fetch(1, CreateMode::Never).unwrap(), None);
    assert_eq!(a.page_count(), 1);
    assert_eq!(b.page_count(), 2);
    group.check_invariants().unwrap();
}

#[test]
fn test_shrink_to_group_floor() {
    let group = group();
    let a = CacheInstance::create(&group, 512, 0, true);
    let b = CacheInstance::create(&group, 512, 0, true);
    a.set_cache_size(20);
    b.set_cache_size(20);
    assert_eq!(group.min_pages(), 20);

    let a_pages: Vec<PageHandle> = (1..=15)
        .map(|key| a.fetch(key, CreateMode::Force).unwrap().unwrap())
        .collect();
    let b_pages: Vec<PageHandle> = (1..=15)
        .map(|key| b.fetch(key, CreateMode::Force).unwrap().unwrap())
        .collect();
    // a's page 1 stays pinned
    for &page in &a_pages[1..] {
        a.unpin(page, false).unwrap();
    }
    for page in b_pages {
        b.unpin(page, false).unwrap();
    }
    assert_eq!(group.current_pages(), 30);

    b.shrink();
    assert!(group.current_pages() <= group.min_pages());
    assert_eq!(group.stats().evictions(), 10);
    // The ten oldest unpinned pages were a's 2..=11
    assert_eq!(a.page_count(), 5);
    assert_eq!(b.page_count(), 15);
    let mut lru = vec![12, 13, 14, 15];
    lru.extend(1..=15);
    assert_eq!(group.lru_pages(), lru);
    assert_eq!(a.fetch(1, CreateMode::Never).unwrap(), Some(a_pages[0]));
    group.check_invariants().unwrap();
}

#[test]
fn test_heap_pressure_reclaims_other_groups() {
    let bucket_bytes = 256 * std::mem::size_of::<Option<u32>>();
    let pool = Arc::new(PagePool::new());
    pool.set_heap_limit(Some(2 * bucket_bytes + 3 * 512));

    let first = CacheGroup::new(Arc::clone(&pool));
    let second = CacheGroup::new(Arc::clone(&pool));
    let a = CacheInstance::create(&first, 512, 0, true);
    let b = CacheInstance::create(&second, 512, 0, true);
    a.set_cache_size(100);
    b.set_cache_size(100);

    for key in 1..=3 {
        let page = a.fetch(key, CreateMode::Force).unwrap().unwrap();
        a.unpin(page, false).unwrap();
    }

    // The new page only fits once the first group gives a page back
    b.fetch(1, CreateMode::Force).unwrap().unwrap();
    assert_eq!(a.page_count(), 2);
    assert_eq!(a.fetch(1, CreateMode::Never).unwrap(), None);
    assert_eq!(pool.heap_used(), pool.heap_limit().unwrap());
    first.check_invariants().unwrap();
    second.check_invariants().unwrap();
}

#[test]
fn test_shared_group_per_pool() {
    let pool = Arc::new(PagePool::new());
    let g1 = pool.group();
    let g2 = pool.group();
    assert!(g1.same_group(&g2));

    let cache = PageCache::open(&g1, CacheConfig::new(1024)).unwrap();
    drop(g1);
    drop(g2);
    assert!(cache.group().same_group(&pool.group()));
}

#[test]
fn test_spill_writes_through_pager() {
    let disk: Arc<Mutex<HashMap<Pgno, Vec<u8>>>> = Arc::default();
    let store = Arc::clone(&disk);
    let group = group();
    let cache = PageCache::open(&group, CacheConfig::new(256).with_cache_size(10))
        .unwrap()
        .with_stress(move |cache, page| {
            let pgno = cache.page_number(page)?;
            let data = cache.read_page(page, |data, _| data.to_vec())?;
            store.lock().insert(pgno, data);
            cache.make_clean(page)
        });

    for pgno in 1..=12 {
        let page = cache.fetch(pgno, true).unwrap().unwrap();
        cache
            .write_page(page, |data, _| data.fill(pgno as u8))
            .unwrap();
        cache.make_dirty(page).unwrap();
        cache.release(page).unwrap();
    }

    let written = disk.lock();
    assert!(!written.is_empty());
    for (pgno, data) in written.iter() {
        assert!(data.iter().all(|&b| b == *pgno as u8));
    }
    assert_eq!(group.stats().spills() as usize, written.len());
    drop(written);
    cache.check_invariants().unwrap();
}

#[test]
fn test_concurrent_caches_share_group() {
    let pool = Arc::new(PagePool::with_config(&PoolConfig::new(512, 32)));
    let group = CacheGroup::new(Arc::clone(&pool));
    let caches: Vec<PageCache> = (0..2)
        .map(|_| {
            PageCache::open(&group, CacheConfig::new(512).with_cache_size(16)).unwrap()
        })
        .collect();

    thread::scope(|scope| {
        for t in 0..4u32 {
            let cache = &caches[t as usize % 2];
            scope.spawn(move || {
                let mut seed = 0x9E37_79B9u32.wrapping_mul(t + 1);
                for _ in 0..2_000 {
                    seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                    let pgno = seed % 64 + 1;
                    let page = cache.fetch(pgno, true).unwrap().unwrap();
                    cache
                        .write_page(page, |data, _| data[..4].copy_from_slice(&pgno.to_le_bytes()))
                        .unwrap();
                    let stored = cache
                        .read_page(page, |data, _| {
                            u32::from_le_bytes([data[0], data[1], data[2], data[3]])
                        })
                        .unwrap();
                    assert_eq!(stored, pgno);
                    if seed & 1 == 0 {
                        cache.make_dirty(page).unwrap();
                        cache.make_clean(page).unwrap();
                    }
                    cache.release(page).unwrap();
                }
            });
        }
    });

    let mut cached = 0;
    for cache in &caches {
        assert_eq!(cache.ref_count(), 0);
        cached += cache.page_count();
    }
    assert_eq!(cached, group.current_pages());
    assert!(group.current_pages() <= group.max_pages());
    group.check_invariants().unwrap();
    drop(caches);
    assert_eq!(pool.stats().slots_used, 0);
    assert_eq!(pool.heap_used(), 0);
}

#[derive(Debug, Clone)]
enum Op {
    Insert(Pgno),
    Lookup(Pgno),
    Remove(Pgno),
    Rekey(Pgno, Pgno),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u32..1500).prop_map(Op::Insert),
        2 => (1u32..1500).prop_map(Op::Lookup),
        1 => (1u32..1500).prop_map(Op::Remove),
        1 => (1u32..1500, 1u32..1500).prop_map(|(from, to)| Op::Rekey(from, to)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_lookup_matches_model(ops in prop::collection::vec(op(), 1..900)) {
        let group = group();
        let cache = CacheInstance::create(&group, 32, 0, false);
        let mut model: HashMap<Pgno, PageHandle> = HashMap::new();

        for op in ops {
            match op {
                Op::Insert(key) => {
                    let page = cache.fetch(key, CreateMode::Force).unwrap().unwrap();
                    if let Some(&existing) = model.get(&key) {
                        prop_assert_eq!(page, existing);
                    }
                    model.insert(key, page);
                }
                Op::Lookup(key) => {
                    prop_assert_eq!(cache.fetch(key, CreateMode::Never).unwrap(), model.get(&key).copied());
                }
                Op::Remove(key) => {
                    if let Some(page) = model.remove(&key) {
                        cache.discard(page).unwrap();
                    }
                }
                Op::Rekey(from, to) => {
                    let Some(&page) = model.get(&from) else { continue };
                    let moved = cache.rekey(page, from, to);
                    if from != to && model.contains_key(&to) {
                        prop_assert!(moved.is_err());
                    } else {
                        prop_assert!(moved.is_ok());
                        model.remove(&from);
                        model.insert(to, page);
                    }
                }
            }
        }

        prop_assert_eq!(cache.page_count() as usize, model.len());
        for (key, page) in &model {
            prop_assert_eq!(cache.fetch(*key, CreateMode::Never).unwrap(), Some(*page));
        }
        prop_assert!(group.check_invariants().is_ok());
    }
}
