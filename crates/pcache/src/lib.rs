//! # pcache
//!
//! Page cache for an embedded database storage engine.
//!
//! ## Architecture
//! - **PagePool**: slab of fixed-size slots with heap fallback and pressure tracking
//! - **CacheGroup**: shared page budget and one LRU list across member caches
//! - **CacheInstance**: per-cache hash table, pinning and recycling
//! - **PageCache**: reference counts, dirty list and spilling for the pager
//!
//! ## Example
//! ```
//! use std::sync::Arc;
//! use pcache::{CacheConfig, CacheGroup, PageCache, PagePool};
//!
//! let group = CacheGroup::new(Arc::new(PagePool::new()));
//! let cache = PageCache::open(&group, CacheConfig::new(4096)).unwrap();
//!
//! let page = cache.fetch(1, true).unwrap().unwrap();
//! cache.write_page(page, |data, _| data[0] = 0x53).unwrap();
//! cache.make_dirty(page).unwrap();
//! cache.release(page).unwrap();
//! assert_eq!(cache.dirty_list().len(), 1);
//! ```

#![warn(missing_docs)]

mod cache;
mod config;
mod dirty;
mod entry;
mod error;
mod group;
mod hash;
mod instance;
mod slab;
mod stats;

/// Page number; 0 is never a valid page
pub type Pgno = u32;

pub use cache::{PageCache, StressFn};
pub use config::{CacheConfig, PoolConfig, DEFAULT_CACHE_SIZE};
pub use entry::{PageFlags, PageHandle};
pub use error::{Error, ErrorCode, Result};
pub use group::CacheGroup;
pub use instance::{CacheInstance, CreateMode};
pub use slab::{BenignMallocGuard, PageBuffer, PagePool, PoolStats};
pub use stats::CacheStats;
