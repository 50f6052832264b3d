//! Fixed-capacity page cache with NO-STEAL eviction.
//!
//! Pages are kept behind a single opaque `Page` type; the tuple/slot
//! format inside each one is not this cache's concern. Dirty pages are
//! never evicted, so a cache full of dirty pages fails the request rather
//! than stealing one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::error::{DbError, DbResult};
use crate::ids::{PageId, TableId, TransactionId};
use crate::lock_manager::{LockManager, LockMode, Permission};
use crate::page::Page;
use crate::page_source::Catalog;

struct Resident {
    page: Arc<RwLock<Page>>,
    /// Shares the page's own dirty-state cell, so the eviction scan can
    /// read it without taking the page's read/write lock.
    dirty: Arc<AtomicU32>,
    last_used: u64,
}

struct CacheState {
    resident: HashMap<PageId, Resident>,
    tick: u64,
}

pub struct PageCache {
    capacity: usize,
    lock_manager: Arc<LockManager>,
    catalog: Arc<dyn Catalog>,
    state: Mutex<CacheState>,
}

impl PageCache {
    pub fn new(num_pages: usize, lock_manager: Arc<LockManager>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            capacity: num_pages,
            lock_manager,
            catalog,
            state: Mutex::new(CacheState {
                resident: HashMap::new(),
                tick: 0,
            }),
        }
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    /// Acquires the lock matching `intent`, then returns the resident page,
    /// reading it through the page source on a miss and evicting a clean
    /// victim first if the cache is full.
    pub fn get_page(
        &self,
        tid: TransactionId,
        pid: PageId,
        intent: Permission,
    ) -> DbResult<Arc<RwLock<Page>>> {
        // Lock first, cache monitor second: avoids a cache-monitor x
        // lock-manager-monitor inversion.
        match intent.to_lock() {
            LockMode::Shared => self.lock_manager.acquire_shared(tid, pid)?,
            LockMode::Exclusive => self.lock_manager.acquire_exclusive(tid, pid)?,
        }

        let mut state = self.state.lock().unwrap();
        state.tick += 1;
        let tick = state.tick;

        if let Some(resident) = state.resident.get_mut(&pid) {
            resident.last_used = tick;
            return Ok(Arc::clone(&resident.page));
        }

        // Miss: evict-then-insert is one critical section, so the cache
        // monitor stays held across the eviction decision, the disk read,
        // and the insert.
        if state.resident.len() >= self.capacity {
            Self::evict_one(&mut state)?;
        }

        let source = self.catalog.page_source(pid.table_id)?;
        let page = source.read_page(pid)?;
        debug!("page cache miss, loaded {} from disk", pid);

        let dirty = page.dirty_cell();
        state.resident.insert(
            pid,
            Resident {
                page: Arc::new(RwLock::new(page)),
                dirty,
                last_used: tick,
            },
        );

        Ok(Arc::clone(&state.resident.get(&pid).unwrap().page))
    }

    /// Evicts the least recently used clean resident page. Fails with
    /// `NoEvictablePage` if every resident page is dirty (NO-STEAL). Reads
    /// dirtiness through each page's shared atomic cell rather than its
    /// read/write lock, so this scan can't block behind a caller holding a
    /// write guard on some other resident page.
    fn evict_one(state: &mut CacheState) -> DbResult<()> {
        let victim = state
            .resident
            .iter()
            .filter(|(_, r)| r.dirty.load(Ordering::Acquire) == 0)
            .min_by_key(|(_, r)| r.last_used)
            .map(|(pid, _)| *pid);

        match victim {
            Some(pid) => {
                debug!("evicting clean page {}", pid);
                state.resident.remove(&pid);
                Ok(())
            }
            None => Err(DbError::no_evictable_page(
                "every resident page is dirty; cannot evict under NO-STEAL",
            )),
        }
    }

    /// Removes `pid` from the cache without flushing. Used by abort.
    pub fn discard(&self, pid: PageId) {
        self.state.lock().unwrap().resident.remove(&pid);
    }

    /// Writes every dirty resident page through the page-I/O collaborator,
    /// clearing its dirty flag. Keeps flushing remaining pages even if one
    /// fails, returning the first error encountered.
    pub fn flush_all(&self) -> DbResult<()> {
        let state = self.state.lock().unwrap();
        let mut first_err = None;
        for (pid, resident) in state.resident.iter() {
            let mut page = resident.page.write().unwrap();
            if !page.is_dirty() {
                continue;
            }
            match self.flush_one(*pid, &mut page) {
                Ok(()) => {}
                Err(e) => {
                    log::error!("failed to flush {}: {}", pid, e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flushes every dirty page held by `tid`, leaving the (now clean)
    /// pages resident. Used by commit.
    pub(crate) fn flush_pages_of(&self, tid: TransactionId, pids: &[PageId]) -> DbResult<()> {
        let state = self.state.lock().unwrap();
        let mut first_err = None;
        for pid in pids {
            if let Some(resident) = state.resident.get(pid) {
                let mut page = resident.page.write().unwrap();
                if page.is_dirty() && page.dirtied_by() == Some(tid) {
                    if let Err(e) = self.flush_one(*pid, &mut page) {
                        log::error!("failed to flush {} for {}: {}", pid, tid, e);
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn flush_one(&self, pid: PageId, page: &mut Page) -> DbResult<()> {
        let source = self.catalog.page_source(pid.table_id)?;
        source.write_page(page)?;
        page.mark_clean();
        Ok(())
    }

    /// Releases the lock without touching the cache. Escape hatch, not used
    /// by correct transactions.
    pub fn unsafe_release(&self, tid: TransactionId, pid: PageId) {
        self.lock_manager.release(tid, pid);
    }

    #[cfg(test)]
    fn resident_count(&self) -> usize {
        self.state.lock().unwrap().resident.len()
    }

    #[cfg(test)]
    fn is_resident(&self, pid: PageId) -> bool {
        self.state.lock().unwrap().resident.contains_key(&pid)
    }
}

/// Convenience for tests/examples: a catalog over a fixed set of in-memory
/// or file-backed page sources, keyed by table id.
pub struct StaticCatalog {
    sources: HashMap<TableId, Arc<dyn crate::page_source::PageSource>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    pub fn register(&mut self, table_id: TableId, source: Arc<dyn crate::page_source::PageSource>) {
        self.sources.insert(table_id, source);
    }
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog for StaticCatalog {
    fn page_source(&self, table_id: TableId) -> DbResult<Arc<dyn crate::page_source::PageSource>> {
        self.sources
            .get(&table_id)
            .cloned()
            .ok_or_else(|| DbError::io_error(format!("no page source registered for table {}", table_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap_file::HeapFile;
    use crate::page::PAGE_SIZE;
    use std::sync::Arc;

    fn temp_path(name: &str) -> std::path::PathBuf {
        static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        std::env::temp_dir().join(format!("storage_core_test_{}_{}.heap", name, n))
    }

    fn make_cache(num_pages: usize, table_id: TableId, path: &std::path::Path, n_pages_on_disk: u32) -> (PageCache, Arc<LockManager>) {
        let file = HeapFile::create(path, n_pages_on_disk).unwrap();
        let mut catalog = StaticCatalog::new();
        catalog.register(table_id, Arc::new(file));
        let lm = Arc::new(LockManager::new());
        let cache = PageCache::new(num_pages, Arc::clone(&lm), Arc::new(catalog));
        (cache, lm)
    }

    #[test]
    fn simple_read_share() {
        let path = temp_path("simple_read_share");
        let (cache, _lm) = make_cache(2, 1, &path, 2);
        let a = TransactionId::new(1);
        let b = TransactionId::new(2);
        let p1 = PageId::new(1, 0);

        cache.get_page(a, p1, Permission::ReadOnly).unwrap();
        cache.get_page(b, p1, Permission::ReadOnly).unwrap();

        assert!(cache.lock_manager().holds(a, p1));
        assert!(cache.lock_manager().holds(b, p1));
        assert_eq!(cache.resident_count(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn cache_full_of_clean_pages_evicts_lru() {
        let path = temp_path("evict_lru");
        let (cache, _lm) = make_cache(1, 1, &path, 2);
        let a = TransactionId::new(1);
        let p0 = PageId::new(1, 0);
        let p1 = PageId::new(1, 1);

        cache.get_page(a, p0, Permission::ReadOnly).unwrap();
        assert!(cache.is_resident(p0));

        cache.get_page(a, p1, Permission::ReadOnly).unwrap();
        assert!(!cache.is_resident(p0));
        assert!(cache.is_resident(p1));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn cache_full_of_dirty_pages_fails_to_evict() {
        let path = temp_path("no_evictable");
        let (cache, _lm) = make_cache(1, 1, &path, 2);
        let a = TransactionId::new(1);
        let p0 = PageId::new(1, 0);
        let p1 = PageId::new(1, 1);

        let page = cache.get_page(a, p0, Permission::ReadWrite).unwrap();
        page.write().unwrap().mark_dirty(a);

        let err = cache.get_page(a, p1, Permission::ReadOnly).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoEvictablePage);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn dirty_page_is_never_evicted_even_when_not_lru() {
        let path = temp_path("dirty_protected");
        let (cache, _lm) = make_cache(2, 1, &path, 3);
        let a = TransactionId::new(1);
        let p0 = PageId::new(1, 0);
        let p1 = PageId::new(1, 1);
        let p2 = PageId::new(1, 2);

        // p0 is the least-recently-used but dirty; p1 is clean. A miss
        // needing to evict must pick p1, not p0.
        let page0 = cache.get_page(a, p0, Permission::ReadWrite).unwrap();
        page0.write().unwrap().mark_dirty(a);
        cache.get_page(a, p1, Permission::ReadOnly).unwrap();

        cache.get_page(a, p2, Permission::ReadOnly).unwrap();

        assert!(cache.is_resident(p0));
        assert!(!cache.is_resident(p1));
        assert!(cache.is_resident(p2));
        assert_eq!(cache.resident_count(), 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn flush_all_clears_dirty_flags() {
        let path = temp_path("flush_all");
        let (cache, _lm) = make_cache(2, 1, &path, 1);
        let a = TransactionId::new(1);
        let p0 = PageId::new(1, 0);

        let page = cache.get_page(a, p0, Permission::ReadWrite).unwrap();
        page.write().unwrap().data_mut()[0] = 0xAB;
        page.write().unwrap().mark_dirty(a);

        cache.flush_all().unwrap();
        assert!(!page.read().unwrap().is_dirty());

        // Re-read the file directly to confirm durability.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(PAGE_SIZE);
        assert_eq!(bytes[0], 0xAB);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn discard_drops_resident_without_flushing() {
        let path = temp_path("discard");
        let (cache, _lm) = make_cache(2, 1, &path, 1);
        let a = TransactionId::new(1);
        let p0 = PageId::new(1, 0);

        let page = cache.get_page(a, p0, Permission::ReadWrite).unwrap();
        page.write().unwrap().data_mut()[0] = 0xFF;
        page.write().unwrap().mark_dirty(a);

        cache.discard(p0);
        assert!(!cache.is_resident(p0));

        let bytes = std::fs::read(&path).unwrap();
        assert_ne!(bytes[0], 0xFF);
        std::fs::remove_file(&path).ok();
    }
}
