//! Tunables for standing up a `PageCache`/`LockManager` pair.
//!
//! Page size and cache capacity are deployment choices; this gives them a
//! named home instead of scattering bare numbers through call sites.

use crate::page::PAGE_SIZE;

/// Default number of pages a `PageCache` holds resident at once.
pub const DEFAULT_CACHE_PAGES: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct StorageConfig {
    pub page_size: usize,
    pub cache_pages: usize,
}

impl StorageConfig {
    pub fn new(cache_pages: usize) -> Self {
        Self {
            page_size: PAGE_SIZE,
            cache_pages,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_PAGES)
    }
}
