//! Reference `PageSource`: a heap file of contiguous fixed-size pages on
//! disk.
//!
//! The tuple/slot format inside each page is opaque to the core, so this
//! type only moves whole pages in and out of a single backing file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use log::debug;

use crate::error::{DbError, DbResult};
use crate::ids::PageId;
use crate::page::{Page, PAGE_SIZE};
use crate::page_source::PageSource;

/// A single table's backing heap file. One `HeapFile` is handed out per
/// table id by the catalog.
pub struct HeapFile {
    file: Mutex<File>,
}

impl HeapFile {
    /// Opens an existing heap file for read/write.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DbError::io_error(format!("open heap file failed: {}", e)))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Creates a new heap file, zero-filled for `num_pages` pages. Mainly a
    /// test/example convenience; a real catalog would size the file as
    /// pages are allocated.
    pub fn create(path: impl AsRef<Path>, num_pages: u32) -> DbResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| DbError::io_error(format!("create heap file failed: {}", e)))?;

        let zeros = vec![0u8; PAGE_SIZE];
        for _ in 0..num_pages {
            file.write_all(&zeros)
                .map_err(|e| DbError::io_error(format!("zero-fill heap file failed: {}", e)))?;
        }
        file.flush()?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn offset_of(pid: PageId) -> u64 {
        pid.page_no as u64 * PAGE_SIZE as u64
    }
}

impl PageSource for HeapFile {
    fn read_page(&self, pid: PageId) -> DbResult<Page> {
        let mut file = self.file.lock().unwrap();
        let offset = Self::offset_of(pid);

        file.seek(SeekFrom::Start(offset))
            .map_err(|e| DbError::io_error(format!("seek failed reading {}: {}", pid, e)))?;

        let mut buf = vec![0u8; PAGE_SIZE];
        file.read_exact(&mut buf)
            .map_err(|e| DbError::io_error(format!("read failed for {}: {}", pid, e)))?;

        debug!("read {} ({} bytes at offset {})", pid, PAGE_SIZE, offset);
        Ok(Page::new(pid, buf))
    }

    fn write_page(&self, page: &Page) -> DbResult<()> {
        let mut file = self.file.lock().unwrap();
        let offset = Self::offset_of(page.id());

        file.seek(SeekFrom::Start(offset))
            .map_err(|e| DbError::io_error(format!("seek failed writing {}: {}", page.id(), e)))?;
        file.write_all(page.data())
            .map_err(|e| DbError::io_error(format!("write failed for {}: {}", page.id(), e)))?;
        file.sync_data()
            .map_err(|e| DbError::io_error(format!("sync failed for {}: {}", page.id(), e)))?;

        debug!("flushed {} ({} bytes at offset {})", page.id(), PAGE_SIZE, offset);
        Ok(())
    }
}
