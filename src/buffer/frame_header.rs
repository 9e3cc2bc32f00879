use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock,
};

use crate::common::{FrameId, PageKey};

/// FrameHeader manages a single buffer frame in the buffer pool.
///
/// The data buffer is sized to the page size of whichever file currently
/// occupies the frame, so one pool can serve files of different page sizes.
pub struct FrameHeader {
    frame_id: FrameId,
    /// The page held by this frame, `None` while the frame is free
    page_key: Mutex<Option<PageKey>>,
    /// Number of live guards on this frame
    pin_count: AtomicU32,
    /// Whether the page has been modified since it was last written out
    is_dirty: AtomicBool,
    data: Arc<RwLock<Box<[u8]>>>,
}

impl FrameHeader {
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_key: Mutex::new(None),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: Arc::new(RwLock::new(Vec::new().into_boxed_slice())),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn page_key(&self) -> Option<PageKey> {
        *self.page_key.lock()
    }

    pub fn set_page_key(&self, key: Option<PageKey>) {
        *self.page_key.lock() = key;
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the new value.
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count and returns the new value.
    /// Returns None if the frame was not pinned.
    pub fn unpin(&self) -> Option<u32> {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .ok()
            .map(|previous| previous - 1)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Length of the page currently held, 0 for a free frame.
    pub fn page_len(&self) -> usize {
        self.data.read().len()
    }

    /// Replaces the frame contents with `data`, resizing the buffer when the
    /// incoming page size differs.
    pub fn copy_from(&self, data: &[u8]) {
        let mut guard = self.data.write();
        if guard.len() == data.len() {
            guard.copy_from_slice(data);
        } else {
            *guard = data.to_vec().into_boxed_slice();
        }
    }

    /// Zero-fills the frame as a fresh page of `page_size` bytes.
    pub fn zero(&self, page_size: usize) {
        let mut guard = self.data.write();
        if guard.len() == page_size {
            guard.fill(0);
        } else {
            *guard = vec![0u8; page_size].into_boxed_slice();
        }
    }

    /// Runs `f` with shared access to the frame contents.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.data.read();
        f(&guard)
    }

    pub(crate) fn read_arc(&self) -> ArcRwLockReadGuard<RawRwLock, Box<[u8]>> {
        self.data.read_arc()
    }

    pub(crate) fn write_arc(&self) -> ArcRwLockWriteGuard<RawRwLock, Box<[u8]>> {
        self.data.write_arc()
    }

    /// Returns the frame to the free state. The buffer keeps its allocation.
    pub fn reset(&self) {
        *self.page_key.lock() = None;
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.data.write().fill(0);
    }
}
