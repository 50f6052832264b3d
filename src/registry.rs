//! Optional process-wide convenience handle.
//!
//! Bundles a `LockManager`/`PageCache`/`TransactionManager` trio so tests
//! and small examples don't have to thread them through by hand, built as
//! an ordinary `Arc`-held value rather than reached through global state.

use std::sync::Arc;

use crate::config::StorageConfig;
use crate::lock_manager::LockManager;
use crate::page_cache::PageCache;
use crate::page_source::Catalog;
use crate::transaction::{Transaction, TransactionManager};

/// Bundles a `LockManager`, `PageCache`, and `TransactionManager` built
/// consistently from one `StorageConfig`.
pub struct Registry {
    transactions: TransactionManager,
}

impl Registry {
    pub fn new(config: StorageConfig, catalog: Arc<dyn Catalog>) -> Self {
        let lock_manager = Arc::new(LockManager::new());
        let cache = Arc::new(PageCache::new(config.cache_pages, lock_manager, catalog));
        Self {
            transactions: TransactionManager::new(cache),
        }
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn begin(&self) -> Transaction {
        self.transactions.begin()
    }
}
