use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::{BufferPoolManager, ReadPageGuard, WritePageGuard};
use crate::common::{ArborError, DbType, FileId, PageId, Result, META_PAGE_ID};

use super::disk::DiskManager;
use super::page::{FreePage, MetaPage, META_HEADER_SIZE};

/// Fixed-size page allocation over one database file.
///
/// Pages are cached in a (possibly shared) [`BufferPoolManager`] and written
/// back lazily. Page 0 holds the meta page; its in-memory copy is written
/// out on [`PageStore::sync`]. Released pages form a singly linked free list
/// that [`PageStore::allocate`] drains before growing the file.
pub struct PageStore {
    pool: Arc<BufferPoolManager>,
    file_id: FileId,
    disk: Arc<DiskManager>,
    meta: Mutex<MetaPage>,
    closed: AtomicBool,
}

impl PageStore {
    /// Formats an empty file with a fresh meta page.
    pub fn create(
        pool: Arc<BufferPoolManager>,
        file: File,
        path: PathBuf,
        page_size: usize,
        db_type: DbType,
    ) -> Result<Self> {
        let disk = Arc::new(DiskManager::new(file, path, page_size, false)?);
        if disk.get_num_pages() != 0 {
            return Err(ArborError::invalid(format!(
                "{} is not empty",
                disk.get_db_path().display()
            )));
        }

        let file_id = pool.register_file(Arc::clone(&disk));
        let store = Self {
            pool,
            file_id,
            disk,
            meta: Mutex::new(MetaPage::new(page_size, db_type)),
            closed: AtomicBool::new(false),
        };

        let meta_page = store.pool.new_page(file_id)?;
        if meta_page != META_PAGE_ID {
            return Err(ArborError::corruption(format!(
                "meta page allocated as {}",
                meta_page
            )));
        }
        store.sync()?;
        debug!(path = %store.path().display(), page_size, "page_store.create");
        Ok(store)
    }

    /// Opens a formatted file. An explicit `page_size` must match the one
    /// recorded in the file.
    pub fn open(
        pool: Arc<BufferPoolManager>,
        mut file: File,
        path: PathBuf,
        page_size: Option<usize>,
        read_only: bool,
    ) -> Result<Self> {
        let stored_size = Self::probe_page_size(&mut file)?;
        if let Some(requested) = page_size {
            if requested != stored_size {
                return Err(ArborError::corruption(format!(
                    "page size {} requested but {} stores {}",
                    requested,
                    path.display(),
                    stored_size
                )));
            }
        }

        let disk = Arc::new(DiskManager::new(file, path, stored_size, read_only)?);
        let file_id = pool.register_file(Arc::clone(&disk));

        let meta = match pool.checked_read_page(file_id, META_PAGE_ID) {
            Ok(guard) => MetaPage::read_from(guard.data()),
            Err(err) => Err(err),
        };
        let mut meta = match meta {
            Ok(meta) => meta,
            Err(err) => {
                if let Err(unregister_err) = pool.unregister_file(file_id) {
                    warn!(error = %unregister_err, "page_store.open.unregister_failed");
                }
                return Err(err);
            }
        };

        let on_disk = disk.get_num_pages();
        if meta.page_count != on_disk {
            warn!(
                path = %disk.get_db_path().display(),
                recorded = meta.page_count,
                on_disk,
                "page_store.open.page_count_mismatch"
            );
            meta.page_count = on_disk;
        }

        debug!(path = %disk.get_db_path().display(), page_size = stored_size, "page_store.open");
        Ok(Self {
            pool,
            file_id,
            disk,
            meta: Mutex::new(meta),
            closed: AtomicBool::new(false),
        })
    }

    fn probe_page_size(file: &mut File) -> Result<usize> {
        let mut header = [0u8; META_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(ArborError::corruption("file is too short for a meta page"));
            }
            Err(err) => return Err(err.into()),
        }
        MetaPage::probe_page_size(&header)
    }

    /// Hands out a page for the caller to format, reusing the free-list head
    /// before extending the file.
    pub fn allocate(&self) -> Result<PageId> {
        self.check_writable()?;
        let mut meta = self.meta.lock();

        if let Some(head) = meta.free_head {
            let next = {
                Self::check_bounds(meta.page_count, head)?;
                let guard = self.pool.checked_read_page(self.file_id, head)?;
                FreePage::next(guard.data(), head)?
            };
            if meta.free_count == 0 {
                return Err(ArborError::corruption("free list longer than recorded"));
            }
            meta.free_head = next;
            meta.free_count -= 1;
            debug!(page_id = %head, "page_store.allocate.reuse");
            return Ok(head);
        }

        let page_id = self.pool.new_page(self.file_id)?;
        meta.page_count = self.disk.get_num_pages();
        debug!(page_id = %page_id, "page_store.allocate.extend");
        Ok(page_id)
    }

    /// Pins a page for reading.
    pub fn read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        let page_count = self.meta.lock().page_count;
        Self::check_bounds(page_count, page_id)?;
        self.pool.checked_read_page(self.file_id, page_id)
    }

    /// Pins a page for writing. Changes reach the file on flush or eviction.
    pub fn write(&self, page_id: PageId) -> Result<WritePageGuard> {
        self.check_writable()?;
        let page_count = self.meta.lock().page_count;
        Self::check_bounds(page_count, page_id)?;
        self.pool.checked_write_page(self.file_id, page_id)
    }

    /// Returns a page to the free list.
    pub fn free(&self, page_id: PageId) -> Result<()> {
        self.check_writable()?;
        if page_id == META_PAGE_ID {
            return Err(ArborError::invalid("the meta page cannot be freed"));
        }
        let mut meta = self.meta.lock();
        Self::check_bounds(meta.page_count, page_id)?;

        {
            let mut guard = self.pool.checked_write_page(self.file_id, page_id)?;
            FreePage::format(guard.data_mut(), page_id, meta.free_head);
        }
        meta.free_head = Some(page_id);
        meta.free_count += 1;
        debug!(page_id = %page_id, free_pages = meta.free_count, "page_store.free");
        Ok(())
    }

    /// Writes the meta page and every dirty page of this file, then fsyncs.
    pub fn sync(&self) -> Result<()> {
        if self.disk.is_read_only() {
            return Ok(());
        }
        {
            let meta = self.meta.lock();
            let mut guard = self.pool.checked_write_page(self.file_id, META_PAGE_ID)?;
            meta.write_to(guard.data_mut());
        }
        self.pool.flush_file(self.file_id)?;
        self.disk.sync()
    }

    /// Syncs and drops this file's pages from the pool. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let synced = self.sync();
        let unregistered = self.pool.unregister_file(self.file_id);
        synced.and(unregistered)
    }

    /// Snapshot of the meta page.
    pub fn meta(&self) -> MetaPage {
        self.meta.lock().clone()
    }

    /// Applies `f` to the in-memory meta page.
    pub fn update_meta<R>(&self, f: impl FnOnce(&mut MetaPage) -> R) -> R {
        f(&mut self.meta.lock())
    }

    pub fn page_size(&self) -> usize {
        self.disk.page_size()
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        self.disk.get_db_path()
    }

    pub fn is_read_only(&self) -> bool {
        self.disk.is_read_only()
    }

    pub fn pool(&self) -> &Arc<BufferPoolManager> {
        &self.pool
    }

    fn check_bounds(page_count: u32, page_id: PageId) -> Result<()> {
        if page_id.as_u32() >= page_count {
            return Err(ArborError::corruption(format!(
                "{} is beyond the end of the file ({} pages)",
                page_id, page_count
            )));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.disk.is_read_only() {
            return Err(ArborError::invalid(format!(
                "{} is opened read-only",
                self.path().display()
            )));
        }
        Ok(())
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(path = %self.path().display(), error = %err, "page_store.drop.close_failed");
        }
    }
}
