//! Pool and cache configuration

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of pages per cache
pub const DEFAULT_CACHE_SIZE: i32 = 100;

/// Slab pool settings, applied once per pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PoolConfig {
    /// Bytes per slot (rounded down to a multiple of 8)
    pub slot_size: usize,
    /// Number of slots; 0 disables the slab
    pub slot_count: usize,
    /// Ceiling for heap-fallback memory in bytes
    pub heap_limit: Option<usize>,
}

impl PoolConfig {
    /// Pool with `slot_count` slots of `slot_size` bytes
    pub fn new(slot_size: usize, slot_count: usize) -> Self {
        Self {
            slot_size,
            slot_count,
            heap_limit: None,
        }
    }

    /// Set the heap ceiling
    pub fn with_heap_limit(mut self, limit: usize) -> Self {
        self.heap_limit = Some(limit);
        self
    }
}

/// Per-cache settings supplied by the pager
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct CacheConfig {
    /// Page size in bytes
    pub page_size: usize,
    /// Bytes of auxiliary space stored with every page
    pub extra_size: usize,
    /// Whether pages may be evicted under the group budget
    pub purgeable: bool,
    /// Pages when positive, `-KiB` when negative
    pub cache_size: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            extra_size: 0,
            purgeable: true,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

impl CacheConfig {
    /// Purgeable cache for `page_size` pages
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    /// Set the per-page auxiliary size
    pub fn with_extra_size(mut self, extra_size: usize) -> Self {
        self.extra_size = extra_size;
        self
    }

    /// Mark the cache purgeable or in-memory only
    pub fn with_purgeable(mut self, purgeable: bool) -> Self {
        self.purgeable = purgeable;
        self
    }

    /// Set the cache size (pages, or `-KiB`)
    pub fn with_cache_size(mut self, cache_size: i32) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Resolve `cache_size` into a page count
    pub fn cache_pages(&self) -> u32 {
        pages_for(self.cache_size, self.page_size + self.extra_size)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::InvalidConfig("page_size must be non-zero".to_string()));
        }
        if self.page_size > u32::MAX as usize || self.extra_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "page_size {} / extra_size {} too large",
                self.page_size, self.extra_size
            )));
        }
        Ok(())
    }
}

/// Convert a cache-size setting to pages; negative values are `-KiB`.
pub(crate) fn pages_for(cache_size: i32, bytes_per_page: usize) -> u32 {
    if cache_size >= 0 {
        return cache_size as u32;
    }
    let kib = -(cache_size as i64);
    let pages = kib * 1024 / bytes_per_page.max(1) as i64;
    pages.min(u32::MAX as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_pages_positive() {
        let cfg = CacheConfig::new(1024).with_cache_size(250);
        assert_eq!(cfg.cache_pages(), 250);
    }

    #[test]
    fn test_cache_pages_kib() {
        // 2000 KiB of 1024 + 24 byte pages
        let cfg = CacheConfig::new(1024).with_extra_size(24).with_cache_size(-2000);
        assert_eq!(cfg.cache_pages(), 2000 * 1024 / 1048);
    }

    #[test]
    fn test_validate() {
        assert!(CacheConfig::new(0).validate().is_err());
        assert!(CacheConfig::default().validate().is_ok());
    }
}
