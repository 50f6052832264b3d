//! Two-phase page lock manager with upgrade semantics and deadlock
//! detection via a waits-for graph.
//!
//! A lock table plus a transaction-pages map guarded by one monitor. A
//! blocked thread parks on a `Condvar` per `PageId` and is woken by
//! `release`, re-checking both the grant predicate and the deadlock
//! condition on every wakeup.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};

use log::{debug, warn};

use crate::error::{DbError, DbResult};
use crate::ids::{PageId, TransactionId};
use crate::wait_for_graph::WaitForGraph;

/// The mode a lock is held or requested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// The intent an operator requests a page with; translates 1:1 to a
/// `LockMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

impl Permission {
    pub fn to_lock(self) -> LockMode {
        match self {
            Permission::ReadOnly => LockMode::Shared,
            Permission::ReadWrite => LockMode::Exclusive,
        }
    }
}

/// Who currently holds a `PageId`'s lock. Absence from the map means
/// nobody does.
enum Holders {
    Shared(HashSet<TransactionId>),
    Exclusive(TransactionId),
}

struct LockTable {
    holders: HashMap<PageId, Holders>,
    /// Transactions currently blocked on each page; bookkeeping only, the
    /// condvar is what actually parks/wakes threads.
    waiters: HashMap<PageId, HashSet<TransactionId>>,
    pages_of: HashMap<TransactionId, HashSet<PageId>>,
    wait_for: WaitForGraph,
}

impl LockTable {
    fn new() -> Self {
        Self {
            holders: HashMap::new(),
            waiters: HashMap::new(),
            pages_of: HashMap::new(),
            wait_for: WaitForGraph::new(),
        }
    }

    fn grantable(&self, tid: TransactionId, pid: PageId, mode: LockMode) -> bool {
        match (self.holders.get(&pid), mode) {
            (None, _) => true,
            (Some(Holders::Shared(_)), LockMode::Shared) => true,
            (Some(Holders::Shared(set)), LockMode::Exclusive) => {
                set.len() == 1 && set.contains(&tid)
            }
            (Some(Holders::Exclusive(holder)), _) => *holder == tid,
        }
    }

    /// `holders(pid) \ {tid}`, the set tid would wait on if it blocked.
    fn blockers(&self, tid: TransactionId, pid: PageId) -> HashSet<TransactionId> {
        match self.holders.get(&pid) {
            None => HashSet::new(),
            Some(Holders::Shared(set)) => set.iter().copied().filter(|&t| t != tid).collect(),
            Some(Holders::Exclusive(holder)) => {
                let mut s = HashSet::new();
                if *holder != tid {
                    s.insert(*holder);
                }
                s
            }
        }
    }

    fn grant(&mut self, tid: TransactionId, pid: PageId, mode: LockMode) {
        match mode {
            LockMode::Shared => match self.holders.get_mut(&pid) {
                Some(Holders::Exclusive(holder)) => {
                    debug_assert_eq!(*holder, tid, "grant() called without grantable() holding");
                }
                Some(Holders::Shared(set)) => {
                    set.insert(tid);
                }
                None => {
                    let mut set = HashSet::new();
                    set.insert(tid);
                    self.holders.insert(pid, Holders::Shared(set));
                }
            },
            LockMode::Exclusive => {
                // Covers both the fresh-acquire and the sole-holder-upgrade
                // cases; `grantable` already confirmed either tid was the
                // sole shared holder or the page was free.
                self.holders.insert(pid, Holders::Exclusive(tid));
            }
        }

        self.pages_of.entry(tid).or_insert_with(HashSet::new).insert(pid);
        if let Some(w) = self.waiters.get_mut(&pid) {
            w.remove(&tid);
        }
    }

    fn release_one(&mut self, tid: TransactionId, pid: PageId) {
        let mut now_empty = false;
        if let Some(holders) = self.holders.get_mut(&pid) {
            match holders {
                Holders::Shared(set) => {
                    set.remove(&tid);
                    if set.is_empty() {
                        now_empty = true;
                    }
                }
                Holders::Exclusive(holder) => {
                    if *holder == tid {
                        now_empty = true;
                    }
                }
            }
        }
        if now_empty {
            self.holders.remove(&pid);
        }

        if let Some(pages) = self.pages_of.get_mut(&tid) {
            pages.remove(&pid);
            if pages.is_empty() {
                self.pages_of.remove(&tid);
            }
        }
    }
}

/// Page-granularity shared/exclusive lock manager.
pub struct LockManager {
    table: Mutex<LockTable>,
    /// One condvar per page, created lazily and retained for the manager's
    /// lifetime. Always waited on together with `table`'s guard, so a
    /// single `Mutex<LockTable>` backs every condvar here.
    condvars: Mutex<HashMap<PageId, std::sync::Arc<Condvar>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::new()),
            condvars: Mutex::new(HashMap::new()),
        }
    }

    fn condvar_for(&self, pid: PageId) -> std::sync::Arc<Condvar> {
        self.condvars
            .lock()
            .unwrap()
            .entry(pid)
            .or_insert_with(|| std::sync::Arc::new(Condvar::new()))
            .clone()
    }

    fn acquire(&self, tid: TransactionId, pid: PageId, mode: LockMode) -> DbResult<()> {
        let mut guard = self.table.lock().unwrap();

        loop {
            if guard.grantable(tid, pid, mode) {
                guard.grant(tid, pid, mode);
                guard.wait_for.clear_waiter(tid);
                debug!("granted {:?} on {} to {}", mode, pid, tid);
                return Ok(());
            }

            // About to block: drop any edges from a previous iteration of
            // this same wait (holders may have changed since), recompute,
            // and re-check for a cycle. Applied symmetrically to the first
            // attempt too, not just on wakeup.
            guard.wait_for.clear_waiter(tid);
            let blockers = guard.blockers(tid, pid);

            if guard.wait_for.would_cycle(tid, &blockers) {
                if let Some(w) = guard.waiters.get_mut(&pid) {
                    w.remove(&tid);
                }
                let msg = format!(
                    "transaction {} aborted: deadlock acquiring {:?} on {}",
                    tid, mode, pid
                );
                warn!("{}", msg);
                let err = DbError::aborted(msg);
                err.show_backtrace();
                return Err(err);
            }

            guard.wait_for.install_edges(tid, &blockers);
            guard
                .waiters
                .entry(pid)
                .or_insert_with(HashSet::new)
                .insert(tid);

            let cv = self.condvar_for(pid);
            guard = cv.wait(guard).unwrap();
        }
    }

    /// Blocks until `tid` holds a shared lock on `pid`. Fails with
    /// `Aborted` if granting would introduce a deadlock involving `tid`.
    pub fn acquire_shared(&self, tid: TransactionId, pid: PageId) -> DbResult<()> {
        self.acquire(tid, pid, LockMode::Shared)
    }

    /// Blocks until `tid` holds an exclusive lock on `pid`. Fails with
    /// `Aborted` under deadlock. Atomically upgrades in place if `tid` is
    /// already the sole shared holder.
    pub fn acquire_exclusive(&self, tid: TransactionId, pid: PageId) -> DbResult<()> {
        self.acquire(tid, pid, LockMode::Exclusive)
    }

    /// Releases whatever lock `tid` holds on `pid`. No-op if none is held;
    /// tolerant to double-release during abort cleanup. Wakes anyone
    /// blocked on `pid`.
    pub fn release(&self, tid: TransactionId, pid: PageId) {
        {
            let mut guard = self.table.lock().unwrap();
            guard.release_one(tid, pid);
        }
        // Notify unconditionally: a lazily-created condvar with no waiters
        // is a cheap no-op, and we've already dropped the table lock so
        // there's no monitor ordering hazard.
        if let Some(cv) = self.condvars.lock().unwrap().get(&pid) {
            cv.notify_all();
        }
    }

    pub fn holds(&self, tid: TransactionId, pid: PageId) -> bool {
        let guard = self.table.lock().unwrap();
        match guard.holders.get(&pid) {
            Some(Holders::Shared(set)) => set.contains(&tid),
            Some(Holders::Exclusive(holder)) => *holder == tid,
            None => false,
        }
    }

    pub fn pages_of(&self, tid: TransactionId) -> HashSet<PageId> {
        self.table
            .lock()
            .unwrap()
            .pages_of
            .get(&tid)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn pid(n: u32) -> PageId {
        PageId::new(0, n)
    }

    #[test]
    fn shared_locks_are_reentrant_and_concurrent() {
        let lm = LockManager::new();
        let a = TransactionId::new(1);
        let b = TransactionId::new(2);

        lm.acquire_shared(a, pid(1)).unwrap();
        lm.acquire_shared(b, pid(1)).unwrap();
        // Re-entrant: acquiring shared again is a no-op.
        lm.acquire_shared(a, pid(1)).unwrap();

        assert!(lm.holds(a, pid(1)));
        assert!(lm.holds(b, pid(1)));
    }

    #[test]
    fn exclusive_acquire_excludes_other_shared_holders() {
        let lm = Arc::new(LockManager::new());
        let a = TransactionId::new(1);
        let b = TransactionId::new(2);

        lm.acquire_shared(a, pid(1)).unwrap();

        let lm2 = Arc::clone(&lm);
        let handle = thread::spawn(move || lm2.acquire_exclusive(b, pid(1)));

        thread::sleep(Duration::from_millis(50));
        assert!(lm.holds(a, pid(1)));
        assert!(!lm.holds(b, pid(1)));

        lm.release(a, pid(1));
        handle.join().unwrap().unwrap();
        assert!(lm.holds(b, pid(1)));
    }

    #[test]
    fn sole_shared_holder_upgrades_atomically() {
        let lm = LockManager::new();
        let a = TransactionId::new(1);

        lm.acquire_shared(a, pid(1)).unwrap();
        lm.acquire_exclusive(a, pid(1)).unwrap();

        assert!(lm.holds(a, pid(1)));
    }

    #[test]
    fn upgrade_leaves_other_shared_acquirers_queued_behind_it() {
        // A is the sole shared holder, so its upgrade to exclusive must
        // succeed immediately. Any other transaction that then tries to
        // acquire a shared lock must queue behind A's new exclusive hold
        // until A releases.
        let lm = Arc::new(LockManager::new());
        let a = TransactionId::new(1);
        let c = TransactionId::new(3);

        lm.acquire_shared(a, pid(1)).unwrap();
        lm.acquire_exclusive(a, pid(1)).unwrap();
        assert!(lm.holds(a, pid(1)));

        let lm2 = Arc::clone(&lm);
        let handle = thread::spawn(move || lm2.acquire_shared(c, pid(1)));
        thread::sleep(Duration::from_millis(50));
        assert!(!lm.holds(c, pid(1)), "c should still be queued");

        lm.release(a, pid(1));
        handle.join().unwrap().unwrap();
        assert!(lm.holds(c, pid(1)));
    }

    #[test]
    fn double_release_is_a_noop() {
        let lm = LockManager::new();
        let a = TransactionId::new(1);
        lm.acquire_shared(a, pid(1)).unwrap();
        lm.release(a, pid(1));
        lm.release(a, pid(1));
        assert!(!lm.holds(a, pid(1)));
    }

    #[test]
    fn release_of_unheld_lock_is_a_noop() {
        let lm = LockManager::new();
        let a = TransactionId::new(1);
        lm.release(a, pid(1));
        assert!(!lm.holds(a, pid(1)));
        assert!(lm.pages_of(a).is_empty());
    }

    #[test]
    fn two_way_deadlock_aborts_exactly_one_side() {
        let lm = Arc::new(LockManager::new());
        let a = TransactionId::new(1);
        let b = TransactionId::new(2);

        lm.acquire_exclusive(a, pid(1)).unwrap();
        lm.acquire_exclusive(b, pid(2)).unwrap();

        let lm2 = Arc::clone(&lm);
        let a_handle = thread::spawn(move || lm2.acquire_exclusive(a, pid(2)));
        thread::sleep(Duration::from_millis(50));

        // B closes the cycle B -> A -> B and must be aborted.
        let b_result = lm.acquire_exclusive(b, pid(1));
        assert!(b_result.is_err());
        assert!(b_result.unwrap_err().is_aborted());

        lm.release(b, pid(2));
        a_handle.join().unwrap().unwrap();
        assert!(lm.holds(a, pid(1)));
        assert!(lm.holds(a, pid(2)));
    }

    #[test]
    fn pages_of_tracks_all_held_pages() {
        let lm = LockManager::new();
        let a = TransactionId::new(1);
        lm.acquire_shared(a, pid(1)).unwrap();
        lm.acquire_exclusive(a, pid(2)).unwrap();

        let pages = lm.pages_of(a);
        assert_eq!(pages.len(), 2);
        assert!(pages.contains(&pid(1)));
        assert!(pages.contains(&pid(2)));
    }
}
