//! Fixed-size cached page.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::ids::{PageId, TransactionId};

/// Default page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Sentinel stored in `dirty` for a clean page. Safe because transaction
/// ids are allocated starting at 1 (see `ids::next_transaction_id`).
const CLEAN: u32 = 0;

/// A resident page: its identity, raw bytes, and dirty state.
///
/// The cache owns `Page` values exclusively; callers are handed a
/// reference for the duration of an operator step (see
/// `PageCache::get_page`).
pub struct Page {
    id: PageId,
    data: Vec<u8>,
    /// Dirtying transaction id + 1, or `CLEAN`. Kept in a shared atomic
    /// cell rather than plain state so the cache can check dirtiness
    /// (`dirty_cell`) without taking this page's own read/write lock.
    dirty: Arc<AtomicU32>,
}

impl Page {
    /// Builds a page from bytes read off disk. Always starts clean.
    pub fn new(id: PageId, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE, "page {} has wrong size", id);
        Self {
            id,
            data,
            dirty: Arc::new(AtomicU32::new(CLEAN)),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Operators mutate the tuple/slot bytes directly, then call
    /// `mark_dirty`; the cache never inspects or rewrites the contents
    /// itself.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire) != CLEAN
    }

    pub fn dirtied_by(&self) -> Option<TransactionId> {
        match self.dirty.load(Ordering::Acquire) {
            CLEAN => None,
            raw => Some(TransactionId::new(raw - 1)),
        }
    }

    pub fn mark_dirty(&mut self, tid: TransactionId) {
        self.dirty.store(tid.raw() + 1, Ordering::Release);
    }

    pub fn mark_clean(&mut self) {
        self.dirty.store(CLEAN, Ordering::Release);
    }

    /// Clones the shared dirty-state cell. The page cache keeps one of
    /// these alongside each resident page so its eviction scan can read
    /// dirtiness directly, without contending for this page's lock.
    pub(crate) fn dirty_cell(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.dirty)
    }
}
