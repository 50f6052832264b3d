//! Transaction coordinator: commit/abort entry points tying the lock
//! manager and page cache together.
//!
//! On commit, dirty pages are flushed and every lock released. On abort,
//! every page touched is discarded, dirty or not, and every lock released.
//! No write-ahead log is kept: there is nothing to roll a partially
//! flushed commit back to, so a flush failure is reported to the caller
//! rather than turned into an abort.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::error::DbResult;
use crate::ids::{next_transaction_id, PageId, TransactionId};
use crate::page_cache::PageCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

/// A lightweight handle to an active transaction. Operator code threads
/// this through its calls to `PageCache::get_page`; the core itself never
/// inspects more than the id.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    id: TransactionId,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Begins transactions and drives their commit/abort protocol.
pub struct TransactionManager {
    cache: Arc<PageCache>,
    status: Mutex<HashMap<TransactionId, TransactionStatus>>,
}

impl TransactionManager {
    pub fn new(cache: Arc<PageCache>) -> Self {
        Self {
            cache,
            status: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn begin(&self) -> Transaction {
        let id = next_transaction_id();
        self.status.lock().unwrap().insert(id, TransactionStatus::Active);
        debug!("begin {}", id);
        Transaction { id }
    }

    pub fn status(&self, tid: TransactionId) -> Option<TransactionStatus> {
        self.status.lock().unwrap().get(&tid).copied()
    }

    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.cache.lock_manager().holds(tid, pid)
    }

    /// Commits or aborts `tid`.
    ///
    /// On commit: flushes dirty pages `tid` holds via the page-writer
    /// collaborator, leaving them resident and clean. On abort: discards
    /// every page `tid` touched, dirty or not, since their contents may be
    /// invalid. Either way, every lock `tid` held is released, even for
    /// pages that were evicted or never dirtied in between.
    ///
    /// A flush failure during commit is logged and returned to the caller,
    /// but does not convert the outcome into an abort: without a WAL there
    /// is nothing to roll the partially-flushed writes back to, so the
    /// caller decides whether to retry.
    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> DbResult<()> {
        if let Some(status) = self.status(tid) {
            if status != TransactionStatus::Active {
                warn!(
                    "transaction_complete called again for {} (already {:?}); ignoring",
                    tid, status
                );
                return Ok(());
            }
        }

        let pages: Vec<PageId> = self.cache.lock_manager().pages_of(tid).into_iter().collect();

        let result = if pages.is_empty() {
            Ok(())
        } else if commit {
            self.cache.flush_pages_of(tid, &pages)
        } else {
            for pid in &pages {
                self.cache.discard(*pid);
            }
            Ok(())
        };

        for pid in &pages {
            self.cache.unsafe_release(tid, *pid);
        }

        self.status.lock().unwrap().insert(
            tid,
            if commit {
                TransactionStatus::Committed
            } else {
                TransactionStatus::Aborted
            },
        );
        debug!(
            "transaction_complete {} commit={} ({} pages)",
            tid,
            commit,
            pages.len()
        );

        result
    }
}
