//! Integration tests for the disk manager

use std::fs::OpenOptions;
use std::sync::Arc;
use std::thread;

use arbor::common::{ArborError, PageId, DEFAULT_PAGE_SIZE};
use arbor::storage::disk::DiskManager;
use tempfile::NamedTempFile;

#[test]
fn test_disk_manager_create_file() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::open(temp_file.path(), DEFAULT_PAGE_SIZE).unwrap();

    assert_eq!(dm.get_num_pages(), 0);
    assert_eq!(dm.page_size(), DEFAULT_PAGE_SIZE);
    assert!(!dm.is_read_only());
    assert_eq!(dm.get_db_path(), temp_file.path());
}

#[test]
fn test_disk_manager_allocate_pages() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::open(temp_file.path(), 1024).unwrap();

    for expected in 0..5 {
        assert_eq!(dm.allocate_page().unwrap(), PageId::new(expected));
    }
    assert_eq!(dm.get_num_pages(), 5);
    assert_eq!(std::fs::metadata(temp_file.path()).unwrap().len(), 5 * 1024);
}

#[test]
fn test_disk_manager_read_write_page() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::open(temp_file.path(), 512).unwrap();
    let page_id = dm.allocate_page().unwrap();

    let mut write_buf = vec![0u8; 512];
    write_buf[..11].copy_from_slice(b"hello arbor");
    write_buf[511] = 0xFF;
    dm.write_page(page_id, &write_buf).unwrap();

    let mut read_buf = vec![0u8; 512];
    dm.read_page(page_id, &mut read_buf).unwrap();
    assert_eq!(read_buf, write_buf);
    assert_eq!(dm.get_num_reads(), 1);
}

#[test]
fn test_disk_manager_random_access() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::open(temp_file.path(), 512).unwrap();
    for _ in 0..8 {
        dm.allocate_page().unwrap();
    }

    for i in [5u32, 1, 7, 3, 0] {
        dm.write_page(PageId::new(i), &vec![i as u8; 512]).unwrap();
    }
    for i in [0u32, 3, 7, 1, 5] {
        let mut buf = vec![0u8; 512];
        dm.read_page(PageId::new(i), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == i as u8), "page {} mismatch", i);
    }
}

#[test]
fn test_disk_manager_persistence() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    {
        let dm = DiskManager::open(&path, 2048).unwrap();
        let page_id = dm.allocate_page().unwrap();
        dm.write_page(page_id, &vec![0xAB; 2048]).unwrap();
        dm.sync().unwrap();
    }

    let dm = DiskManager::open(&path, 2048).unwrap();
    assert_eq!(dm.get_num_pages(), 1);
    let mut buf = vec![0u8; 2048];
    dm.read_page(PageId::new(0), &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xAB));
}

#[test]
fn test_disk_manager_read_beyond_extent_is_corruption() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::open(temp_file.path(), 512).unwrap();
    dm.allocate_page().unwrap();

    let mut buf = vec![0u8; 512];
    let err = dm.read_page(PageId::new(1), &mut buf).unwrap_err();
    assert!(err.is_corruption());
    let err = dm.write_page(PageId::new(3), &buf).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_disk_manager_rejects_wrong_buffer_size() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::open(temp_file.path(), 1024).unwrap();
    let page_id = dm.allocate_page().unwrap();

    let mut small = vec![0u8; 512];
    assert!(matches!(
        dm.read_page(page_id, &mut small),
        Err(ArborError::InvalidArgument(_))
    ));
}

#[test]
fn test_disk_manager_rejects_bad_page_size() {
    let temp_file = NamedTempFile::new().unwrap();
    assert!(matches!(
        DiskManager::open(temp_file.path(), 3000),
        Err(ArborError::InvalidArgument(_))
    ));
}

#[test]
fn test_disk_manager_partial_page_is_corruption() {
    let temp_file = NamedTempFile::new().unwrap();
    std::fs::write(temp_file.path(), vec![0u8; 700]).unwrap();

    let err = DiskManager::open(temp_file.path(), 512).err().unwrap();
    assert!(err.is_corruption());
}

#[test]
fn test_disk_manager_read_only() {
    let temp_file = NamedTempFile::new().unwrap();
    {
        let dm = DiskManager::open(temp_file.path(), 512).unwrap();
        dm.allocate_page().unwrap();
    }

    let file = OpenOptions::new().read(true).open(temp_file.path()).unwrap();
    let dm = DiskManager::new(file, temp_file.path().to_path_buf(), 512, true).unwrap();
    assert!(dm.is_read_only());
    assert!(dm.allocate_page().is_err());
    assert!(dm.write_page(PageId::new(0), &vec![1u8; 512]).is_err());

    let mut buf = vec![1u8; 512];
    dm.read_page(PageId::new(0), &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn test_multi_file_isolation() {
    let file_a = NamedTempFile::new().unwrap();
    let file_b = NamedTempFile::new().unwrap();
    let dm_a = DiskManager::open(file_a.path(), 512).unwrap();
    let dm_b = DiskManager::open(file_b.path(), 4096).unwrap();

    let page_a = dm_a.allocate_page().unwrap();
    let page_b = dm_b.allocate_page().unwrap();
    assert_eq!(page_a, page_b);

    dm_a.write_page(page_a, &vec![0xAA; 512]).unwrap();
    dm_b.write_page(page_b, &vec![0xBB; 4096]).unwrap();

    let mut buf_a = vec![0u8; 512];
    let mut buf_b = vec![0u8; 4096];
    dm_a.read_page(page_a, &mut buf_a).unwrap();
    dm_b.read_page(page_b, &mut buf_b).unwrap();
    assert!(buf_a.iter().all(|&b| b == 0xAA));
    assert!(buf_b.iter().all(|&b| b == 0xBB));
}

#[test]
fn test_concurrent_page_access() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::open(temp_file.path(), 512).unwrap());
    for _ in 0..16 {
        dm.allocate_page().unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let dm = Arc::clone(&dm);
            thread::spawn(move || {
                for i in 0..4u32 {
                    let page_id = PageId::new(t * 4 + i);
                    let fill = (t * 4 + i) as u8;
                    dm.write_page(page_id, &vec![fill; 512]).unwrap();
                    let mut buf = vec![0u8; 512];
                    dm.read_page(page_id, &mut buf).unwrap();
                    assert!(buf.iter().all(|&b| b == fill));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(dm.get_num_writes(), 16 + 16);
}
