use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pcache::{CacheConfig, CacheGroup, PageCache, PagePool, PoolConfig};

fn bench_cached_fetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("cached_fetch");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("fetch_release_4kb_hit", |b| {
        let pages = CacheGroup::new(Arc::new(PagePool::new()));
        let cache = PageCache::open(&pages, CacheConfig::new(4096).with_cache_size(1000)).unwrap();

        // Warm the cache
        for pgno in 1..=100 {
            let page = cache.fetch(pgno, true).unwrap().unwrap();
            cache.release(page).unwrap();
        }

        let mut counter = 0u32;
        b.iter(|| {
            let page = cache.fetch(counter % 100 + 1, false).unwrap().unwrap();
            cache.release(black_box(page)).unwrap();
            counter += 1;
        });
    });

    group.finish();
}

fn bench_eviction_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("fetch_4kb_miss_slab", |b| {
        let pool = Arc::new(PagePool::with_config(&PoolConfig::new(4096, 64)));
        let pages = CacheGroup::new(pool);
        // Small cache
        let cache = PageCache::open(&pages, CacheConfig::new(4096).with_cache_size(32)).unwrap();

        let mut counter = 0u32;
        b.iter(|| {
            // Every fetch misses and recycles the LRU tail
            let page = cache.fetch(counter % 10_000 + 1, true).unwrap().unwrap();
            cache.release(black_box(page)).unwrap();
            counter += 1;
        });
    });

    group.bench_function("dirty_50_50", |b| {
        let pages = CacheGroup::new(Arc::new(PagePool::new()));
        let cache = PageCache::open(&pages, CacheConfig::new(4096).with_cache_size(100))
            .unwrap()
            .with_stress(|cache, page| cache.make_clean(page));

        let mut counter = 0u32;
        b.iter(|| {
            let page = cache.fetch(counter % 500 + 1, true).unwrap().unwrap();
            if counter % 2 == 0 {
                cache.make_dirty(page).unwrap();
            }
            cache.release(black_box(page)).unwrap();
            counter += 1;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_cached_fetch, bench_eviction_churn);
criterion_main!(benches);
