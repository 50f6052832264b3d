//! Opaque identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Identifies a table within the catalog. Opaque beyond equality.
pub type TableId = u32;

/// Identifies a page within a table: (table, page number).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub table_id: TableId,
    pub page_no: u32,
}

impl PageId {
    pub fn new(table_id: TableId, page_no: u32) -> Self {
        Self { table_id, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "page({}, {})", self.table_id, self.page_no)
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Identifies a transaction. Equality/hashing only, ordering is not part of
/// the contract. Allocated monotonically by `TransactionManager::begin`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u32);

impl TransactionId {
    pub(crate) fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.0)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

static NEXT_TRANSACTION_ID: AtomicU32 = AtomicU32::new(1);

/// Allocates the next transaction id. Kept free of `TransactionManager` so
/// tests can mint ids without standing up the full manager.
pub(crate) fn next_transaction_id() -> TransactionId {
    TransactionId::new(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
}
