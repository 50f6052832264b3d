//! Error taxonomy for the storage core.
//!
//! A tagged enum rather than exceptions: callers must handle a failed
//! acquire or flush at the call site instead of unwinding through an
//! operator stack.

use std::fmt;
use std::io;

use backtrace::Backtrace;

/// The four failure kinds the core ever raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A transaction was aborted, currently only by deadlock detection.
    Aborted,
    /// All resident pages are dirty and the cache needs to evict one.
    NoEvictablePage,
    /// A page was requested with a permission other than read-only/read-write.
    InvalidPermission,
    /// The page-I/O collaborator failed to read or write a page.
    IoError,
}

pub struct DbError {
    kind: ErrorKind,
    message: String,
    backtrace: Backtrace,
}

impl DbError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            backtrace: Backtrace::new_unresolved(),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    pub fn no_evictable_page(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoEvictablePage, message)
    }

    pub fn invalid_permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPermission, message)
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoError, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Aborted
    }

    /// Logs the captured backtrace at error level, surfacing a deadlock's
    /// call stack.
    pub fn show_backtrace(&self) {
        let mut bt = self.backtrace.clone();
        bt.resolve();
        log::error!("{}\n{:?}", self.message, bt);
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl fmt::Debug for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DbError {{ kind: {:?}, message: {:?} }}", self.kind, self.message)
    }
}

impl std::error::Error for DbError {}

impl From<io::Error> for DbError {
    fn from(e: io::Error) -> Self {
        DbError::io_error(e.to_string())
    }
}

/// A plain result alias so call sites don't repeat `DbError` everywhere.
pub type DbResult<T> = Result<T, DbError>;
