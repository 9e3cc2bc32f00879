use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{ArborError, FileId, FrameId, PageId, PageKey, Result, INVALID_PAGE_ID};
use crate::storage::disk::DiskManager;

use super::{FrameHeader, LruKReplacer, ReadPageGuard, WritePageGuard};

/// Bookkeeping guarded by the pool mutex
struct PoolInner {
    /// Maps cached pages to the frames holding them
    page_table: HashMap<PageKey, FrameId>,
    /// Frames that hold no page
    free_list: VecDeque<FrameId>,
    /// Files whose pages may be cached
    files: HashMap<FileId, Arc<DiskManager>>,
    next_file_id: u32,
}

/// Internal state that can be shared across threads
struct BufferPoolState {
    frames: Vec<Arc<FrameHeader>>,
    inner: Mutex<PoolInner>,
    replacer: LruKReplacer,
}

impl BufferPoolState {
    /// Unpins a frame once a guard has dropped its data lock.
    fn release(&self, frame_id: FrameId, is_dirty: bool) {
        let _inner = self.inner.lock();
        let frame = &self.frames[frame_id.as_usize()];
        if is_dirty {
            frame.set_dirty(true);
        }
        if let Some(0) = frame.unpin() {
            self.replacer.set_evictable(frame_id, true);
        }
    }

    fn release_callback(self: &Arc<Self>, frame_id: FrameId) -> super::page_guard::ReleaseCallback {
        let state = Arc::clone(self);
        Box::new(move |is_dirty| state.release(frame_id, is_dirty))
    }
}

/// BufferPoolManager caches pages of one or more database files in a fixed
/// number of frames and uses the LRU-K replacement policy to decide which
/// pages to evict.
///
/// Files are registered with [`Self::register_file`] and their pages are
/// addressed by `(FileId, PageId)`. Each file may use its own page size.
/// All I/O happens synchronously on the calling thread.
pub struct BufferPoolManager {
    pool_size: usize,
    state: Arc<BufferPoolState>,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with the given pool size and k value
    /// for LRU-K.
    pub fn new(pool_size: usize, k: usize) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let state = Arc::new(BufferPoolState {
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                free_list,
                files: HashMap::new(),
                next_file_id: 0,
            }),
            replacer: LruKReplacer::new(k, pool_size),
        });

        Self { pool_size, state }
    }

    /// Makes a file's pages cacheable and returns the id to address them by.
    pub fn register_file(&self, disk_manager: Arc<DiskManager>) -> FileId {
        let mut inner = self.state.inner.lock();
        let file_id = FileId::new(inner.next_file_id);
        inner.next_file_id += 1;
        debug!(
            file = %file_id,
            path = %disk_manager.get_db_path().display(),
            "buffer_pool.register_file"
        );
        inner.files.insert(file_id, disk_manager);
        file_id
    }

    /// Writes back the file's dirty pages and drops all of its frames.
    /// Fails with `ResourceBusy` while any of its pages is pinned.
    pub fn unregister_file(&self, file_id: FileId) -> Result<()> {
        self.flush_file(file_id)?;

        let mut inner = self.state.inner.lock();
        let cached: Vec<(PageKey, FrameId)> = inner
            .page_table
            .iter()
            .filter(|(key, _)| key.file_id == file_id)
            .map(|(&key, &frame_id)| (key, frame_id))
            .collect();

        if cached
            .iter()
            .any(|(_, frame_id)| self.state.frames[frame_id.as_usize()].pin_count() > 0)
        {
            return Err(ArborError::busy(format!("{} still has pinned pages", file_id)));
        }

        for (key, frame_id) in cached {
            inner.page_table.remove(&key);
            self.state.replacer.remove(frame_id);
            self.state.frames[frame_id.as_usize()].reset();
            inner.free_list.push_back(frame_id);
        }
        inner.files.remove(&file_id);
        debug!(file = %file_id, "buffer_pool.unregister_file");
        Ok(())
    }

    /// Returns the disk manager registered under `file_id`.
    pub fn disk(&self, file_id: FileId) -> Option<Arc<DiskManager>> {
        self.state.inner.lock().files.get(&file_id).cloned()
    }

    /// Number of files currently registered.
    pub fn file_count(&self) -> usize {
        self.state.inner.lock().files.len()
    }

    /// Extends the file by one page and caches it zero-filled.
    /// The page is initially evictable. Use checked_write_page or
    /// checked_read_page to get a guard that pins the page.
    pub fn new_page(&self, file_id: FileId) -> Result<PageId> {
        let mut inner = self.state.inner.lock();
        let disk = Self::registered(&inner, file_id)?;
        let frame_id = self.acquire_frame(&mut inner)?;

        let page_id = match disk.allocate_page() {
            Ok(page_id) => page_id,
            Err(err) => {
                inner.free_list.push_back(frame_id);
                return Err(err);
            }
        };

        let key = PageKey::new(file_id, page_id);
        let frame = &self.state.frames[frame_id.as_usize()];
        frame.zero(disk.page_size());
        frame.set_page_key(Some(key));

        inner.page_table.insert(key, frame_id);
        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, true);

        trace!(page = %key, frame = %frame_id, "buffer_pool.new_page");
        Ok(page_id)
    }

    /// Drops a cached page without writing it back.
    /// Returns false if the page is not cached.
    pub fn delete_page(&self, file_id: FileId, page_id: PageId) -> Result<bool> {
        let key = PageKey::new(file_id, page_id);
        let mut inner = self.state.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&key) else {
            return Ok(false);
        };

        let frame = &self.state.frames[frame_id.as_usize()];
        if frame.pin_count() > 0 {
            return Err(ArborError::busy(format!("page {} is still pinned", key)));
        }

        inner.page_table.remove(&key);
        self.state.replacer.remove(frame_id);
        frame.reset();
        inner.free_list.push_back(frame_id);
        Ok(true)
    }

    /// Fetches a page for read access, pinning it until the guard drops.
    pub fn checked_read_page(&self, file_id: FileId, page_id: PageId) -> Result<ReadPageGuard> {
        let key = PageKey::new(file_id, page_id);
        let frame = self.fetch_page(key)?;
        let callback = self.state.release_callback(frame.frame_id());
        Ok(ReadPageGuard::new(key, &frame, callback))
    }

    /// Fetches a page for write access, pinning it until the guard drops.
    pub fn checked_write_page(&self, file_id: FileId, page_id: PageId) -> Result<WritePageGuard> {
        let key = PageKey::new(file_id, page_id);
        let frame = self.fetch_page(key)?;
        let callback = self.state.release_callback(frame.frame_id());
        Ok(WritePageGuard::new(key, &frame, callback))
    }

    /// Writes a cached page to disk if it is dirty.
    /// Returns false if the page is not cached.
    pub fn flush_page(&self, file_id: FileId, page_id: PageId) -> Result<bool> {
        let key = PageKey::new(file_id, page_id);
        let pinned = {
            let inner = self.state.inner.lock();
            let Some(&frame_id) = inner.page_table.get(&key) else {
                return Ok(false);
            };
            let disk = Self::registered(&inner, file_id)?;
            self.pin_for_flush(frame_id);
            vec![(key, frame_id, disk)]
        };
        self.write_back(pinned)?;
        Ok(true)
    }

    /// Writes every dirty cached page of one file to disk.
    pub fn flush_file(&self, file_id: FileId) -> Result<()> {
        self.flush_matching(|key| key.file_id == file_id)
    }

    /// Writes every dirty cached page to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        self.flush_matching(|_| true)
    }

    /// Returns the pin count for a cached page.
    pub fn get_pin_count(&self, file_id: FileId, page_id: PageId) -> Option<u32> {
        let inner = self.state.inner.lock();
        inner
            .page_table
            .get(&PageKey::new(file_id, page_id))
            .map(|&frame_id| self.state.frames[frame_id.as_usize()].pin_count())
    }

    /// Returns the pool size.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_frame_count(&self) -> usize {
        self.state.inner.lock().free_list.len()
    }

    fn registered(inner: &PoolInner, file_id: FileId) -> Result<Arc<DiskManager>> {
        inner
            .files
            .get(&file_id)
            .cloned()
            .ok_or_else(|| ArborError::invalid(format!("{} is not registered", file_id)))
    }

    /// Pins a frame so it stays resident while it is written out without
    /// the pool mutex held.
    fn pin_for_flush(&self, frame_id: FrameId) {
        self.state.frames[frame_id.as_usize()].pin();
        self.state.replacer.set_evictable(frame_id, false);
    }

    fn flush_matching(&self, matches: impl Fn(&PageKey) -> bool) -> Result<()> {
        let pinned = {
            let inner = self.state.inner.lock();
            let mut pinned = Vec::new();
            for (key, &frame_id) in inner.page_table.iter() {
                if !matches(key) || !self.state.frames[frame_id.as_usize()].is_dirty() {
                    continue;
                }
                let Some(disk) = inner.files.get(&key.file_id).cloned() else {
                    continue;
                };
                self.pin_for_flush(frame_id);
                pinned.push((*key, frame_id, disk));
            }
            pinned
        };
        self.write_back(pinned)
    }

    /// Writes out and unpins frames pinned by [`Self::pin_for_flush`]. Every
    /// frame is unpinned even when a write fails; the first error wins.
    fn write_back(&self, pinned: Vec<(PageKey, FrameId, Arc<DiskManager>)>) -> Result<()> {
        let mut first_err = None;
        for (key, frame_id, disk) in pinned {
            let frame = &self.state.frames[frame_id.as_usize()];
            if first_err.is_none() && frame.is_dirty() {
                let written = frame.with_data(|data| {
                    disk.write_page(key.page_id, data)?;
                    frame.set_dirty(false);
                    Ok::<(), ArborError>(())
                });
                match written {
                    Ok(()) => trace!(page = %key, "buffer_pool.flush_page"),
                    Err(err) => first_err = Some(err),
                }
            }
            self.state.release(frame_id, false);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Returns the frame holding `key`, pinned, reading it from disk on a miss.
    fn fetch_page(&self, key: PageKey) -> Result<Arc<FrameHeader>> {
        if key.page_id == INVALID_PAGE_ID {
            return Err(ArborError::corruption(format!("link to invalid page in {}", key.file_id)));
        }

        let mut inner = self.state.inner.lock();
        if let Some(&frame_id) = inner.page_table.get(&key) {
            let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
            frame.pin();
            self.state.replacer.record_access(frame_id);
            self.state.replacer.set_evictable(frame_id, false);
            return Ok(frame);
        }

        let disk = Self::registered(&inner, key.file_id)?;
        let frame_id = self.acquire_frame(&mut inner)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);

        let mut data = vec![0u8; disk.page_size()];
        if let Err(err) = disk.read_page(key.page_id, &mut data) {
            inner.free_list.push_back(frame_id);
            return Err(err);
        }

        frame.copy_from(&data);
        frame.set_page_key(Some(key));
        frame.set_dirty(false);
        frame.pin();

        inner.page_table.insert(key, frame_id);
        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);

        Ok(frame)
    }

    /// Gets a free frame, either from the free list or by evicting a page.
    fn acquire_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = self.state.replacer.evict() else {
            return Err(ArborError::BufferPoolFull);
        };
        let frame = &self.state.frames[frame_id.as_usize()];

        if let Some(old_key) = frame.page_key() {
            if frame.is_dirty() {
                let written = match inner.files.get(&old_key.file_id) {
                    Some(disk) => frame.with_data(|data| disk.write_page(old_key.page_id, data)),
                    None => Err(ArborError::invalid(format!(
                        "{} is not registered",
                        old_key.file_id
                    ))),
                };
                if let Err(err) = written {
                    // Keep the page cached so the dirty contents are not lost.
                    self.state.replacer.record_access(frame_id);
                    self.state.replacer.set_evictable(frame_id, true);
                    return Err(err);
                }
            }
            inner.page_table.remove(&old_key);
            trace!(page = %old_key, frame = %frame_id, "buffer_pool.evict");
        }

        frame.reset();
        Ok(frame_id)
    }
}
