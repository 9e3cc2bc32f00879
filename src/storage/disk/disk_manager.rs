use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::common::{validate_page_size, ArborError, PageId, Result};

/// DiskManager is responsible for reading and writing pages to/from disk.
/// It manages a single database file of a fixed page size and tracks the
/// number of pages in the file.
pub struct DiskManager {
    /// The database file
    db_file: Mutex<File>,
    /// Path to the database file
    db_path: PathBuf,
    /// Size of every page in this file
    page_size: usize,
    /// Whether writes are rejected
    read_only: bool,
    /// Number of pages currently in the file
    num_pages: AtomicU32,
    /// Number of disk reads performed
    num_reads: AtomicU32,
    /// Number of disk writes performed
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Wraps an already opened file. The file length must be a whole number
    /// of pages.
    pub fn new(file: File, db_path: PathBuf, page_size: usize, read_only: bool) -> Result<Self> {
        validate_page_size(page_size)?;

        let file_size = file.metadata()?.len();
        if file_size % page_size as u64 != 0 {
            return Err(ArborError::corruption(format!(
                "file length {} is not a multiple of the page size {}",
                file_size, page_size
            )));
        }
        let num_pages = u32::try_from(file_size / page_size as u64)
            .map_err(|_| ArborError::corruption("file has too many pages"))?;

        Ok(Self {
            db_file: Mutex::new(file),
            db_path,
            page_size,
            read_only,
            num_pages: AtomicU32::new(num_pages),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        })
    }

    /// Opens (creating if needed) a read-write file at the given path.
    pub fn open<P: AsRef<Path>>(db_path: P, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&db_path)?;

        Self::new(file, db_path.as_ref().to_path_buf(), page_size, false)
    }

    /// Reads a page from disk into the provided buffer.
    /// The buffer must be exactly one page long.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        self.check_buffer(data.len())?;
        self.check_extent(page_id)?;

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(page_id.offset(self.page_size)))?;
        file.read_exact(data)?;

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a page to disk from the provided buffer.
    /// The page must already be part of the file (see [`Self::allocate_page`]).
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.check_buffer(data.len())?;
        self.check_writable()?;
        self.check_extent(page_id)?;

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(page_id.offset(self.page_size)))?;
        file.write_all(data)?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Extends the file by one zeroed page and returns its page ID.
    pub fn allocate_page(&self) -> Result<PageId> {
        self.check_writable()?;

        let mut file = self.db_file.lock();
        let page_id = PageId::new(self.num_pages.load(Ordering::SeqCst));
        let zeros = vec![0u8; self.page_size];
        file.seek(SeekFrom::Start(page_id.offset(self.page_size)))?;
        file.write_all(&zeros)?;
        self.num_pages.fetch_add(1, Ordering::SeqCst);
        self.num_writes.fetch_add(1, Ordering::Relaxed);

        Ok(page_id)
    }

    /// Returns the number of pages currently in the file.
    pub fn get_num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::Relaxed)
    }

    /// Returns the number of disk reads performed.
    pub fn get_num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of disk writes performed.
    pub fn get_num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    /// Returns the path to the database file.
    pub fn get_db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Flushes any buffered writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let file = self.db_file.lock();
        file.sync_all()?;
        Ok(())
    }

    fn check_buffer(&self, len: usize) -> Result<()> {
        if len != self.page_size {
            return Err(ArborError::invalid(format!(
                "buffer of {} bytes does not match page size {}",
                len, self.page_size
            )));
        }
        Ok(())
    }

    fn check_extent(&self, page_id: PageId) -> Result<()> {
        let num_pages = self.get_num_pages();
        if page_id.as_u32() >= num_pages {
            return Err(ArborError::corruption(format!(
                "{} is beyond the end of the file ({} pages)",
                page_id, num_pages
            )));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(ArborError::invalid(format!(
                "{} is opened read-only",
                self.db_path.display()
            )));
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        if self.read_only {
            return;
        }
        let file = self.db_file.get_mut();
        if let Err(err) = file.sync_all() {
            warn!(path = %self.db_path.display(), error = %err, "disk_manager.drop.sync_failed");
        }
    }
}
