use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock,
};

use crate::common::{PageId, PageKey};

use super::FrameHeader;

/// Callback run once the guard has released the frame's data lock.
/// The flag tells whether the page was modified.
pub(crate) type ReleaseCallback = Box<dyn FnOnce(bool) + Send + Sync>;

/// Pin bookkeeping shared by both guard kinds. Declared after the data lock
/// in each guard so the lock is released before the frame is unpinned.
struct PageGuardBase {
    key: PageKey,
    release_callback: Option<ReleaseCallback>,
    is_dirty: bool,
}

impl PageGuardBase {
    fn new(key: PageKey, release_callback: ReleaseCallback) -> Self {
        Self {
            key,
            release_callback: Some(release_callback),
            is_dirty: false,
        }
    }
}

impl Drop for PageGuardBase {
    fn drop(&mut self) {
        if let Some(callback) = self.release_callback.take() {
            callback(self.is_dirty);
        }
    }
}

/// RAII guard for read-only access to a page.
/// Automatically unpins the page when dropped.
pub struct ReadPageGuard {
    data: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
    base: PageGuardBase,
}

impl ReadPageGuard {
    pub(crate) fn new(key: PageKey, frame: &FrameHeader, release_callback: ReleaseCallback) -> Self {
        Self {
            data: frame.read_arc(),
            base: PageGuardBase::new(key, release_callback),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.base.key.page_id
    }

    pub fn page_key(&self) -> PageKey {
        self.base.key
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn drop_guard(self) {
        drop(self);
    }
}

impl fmt::Debug for ReadPageGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadPageGuard")
            .field("key", &self.base.key)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

/// RAII guard for read-write access to a page.
/// Marks the page dirty on mutable access and unpins it when dropped.
pub struct WritePageGuard {
    data: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    base: PageGuardBase,
}

impl WritePageGuard {
    pub(crate) fn new(key: PageKey, frame: &FrameHeader, release_callback: ReleaseCallback) -> Self {
        Self {
            data: frame.write_arc(),
            base: PageGuardBase::new(key, release_callback),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.base.key.page_id
    }

    pub fn page_key(&self) -> PageKey {
        self.base.key
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.base.is_dirty = true;
        &mut self.data
    }

    pub fn drop_guard(self) {
        drop(self);
    }
}

impl fmt::Debug for WritePageGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritePageGuard")
            .field("key", &self.base.key)
            .field("dirty", &self.base.is_dirty)
            .finish()
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FileId, FrameId};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn key() -> PageKey {
        PageKey::new(FileId::new(0), PageId::new(1))
    }

    #[test]
    fn test_read_page_guard() {
        let frame = FrameHeader::new(FrameId::new(0));
        let mut data = vec![0u8; 512];
        data[0] = 42;
        frame.copy_from(&data);

        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();

        let guard = ReadPageGuard::new(
            key(),
            &frame,
            Box::new(move |_| released_clone.store(true, Ordering::SeqCst)),
        );

        assert_eq!(guard.page_id(), PageId::new(1));
        assert_eq!(guard[0], 42);
        assert!(format!("{:?}", guard).starts_with("ReadPageGuard"));
        assert!(!released.load(Ordering::SeqCst));

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_page_guard_marks_dirty_and_releases_lock_first() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.zero(512);

        let dirty = Arc::new(AtomicBool::new(false));
        let dirty_clone = dirty.clone();
        let frame_clone = frame.clone();

        let mut guard = WritePageGuard::new(
            key(),
            &frame,
            Box::new(move |is_dirty| {
                // The data lock must already be free when the callback runs.
                assert_eq!(frame_clone.with_data(|d| d[0]), 42);
                dirty_clone.store(is_dirty, Ordering::SeqCst);
            }),
        );

        guard.data_mut()[0] = 42;
        drop(guard);

        assert!(dirty.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_page_guard_clean_without_mutation() {
        let frame = FrameHeader::new(FrameId::new(0));
        frame.zero(512);

        let dirty = Arc::new(AtomicBool::new(true));
        let dirty_clone = dirty.clone();
        let guard = WritePageGuard::new(
            key(),
            &frame,
            Box::new(move |is_dirty| dirty_clone.store(is_dirty, Ordering::SeqCst)),
        );
        assert_eq!(guard.data().len(), 512);
        drop(guard);

        assert!(!dirty.load(Ordering::SeqCst));
    }
}
