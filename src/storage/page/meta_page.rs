use crate::common::{
    validate_page_size, ArborError, DbType, PageId, Result, FORMAT_VERSION, MAGIC_NUMBER,
};

use super::{read_link, read_u32, read_u64, write_link, write_u32, write_u64, PageType};

const MAGIC_OFFSET: usize = 4;
const VERSION_OFFSET: usize = 8;
const PAGE_SIZE_OFFSET: usize = 12;
const PAGE_COUNT_OFFSET: usize = 16;
const ROOT_OFFSET: usize = 20;
const HEIGHT_OFFSET: usize = 24;
const FREE_HEAD_OFFSET: usize = 28;
const FREE_COUNT_OFFSET: usize = 32;
const DB_TYPE_OFFSET: usize = 36;
const ENTRY_COUNT_OFFSET: usize = 40;

/// Bytes at the start of page 0 that describe the file
pub const META_HEADER_SIZE: usize = 48;

/// In-memory copy of page 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPage {
    pub page_size: usize,
    /// Pages in the file, the meta page included
    pub page_count: u32,
    /// `None` until the tree's first leaf is formatted
    pub root: Option<PageId>,
    /// Levels in the tree, 1 for a lone root leaf
    pub height: u32,
    pub free_head: Option<PageId>,
    pub free_count: u32,
    pub db_type: DbType,
    /// Live key/value pairs
    pub entry_count: u64,
}

impl MetaPage {
    pub fn new(page_size: usize, db_type: DbType) -> Self {
        Self {
            page_size,
            page_count: 1,
            root: None,
            height: 0,
            free_head: None,
            free_count: 0,
            db_type,
            entry_count: 0,
        }
    }

    /// Reads the page size recorded in a file header without trusting the
    /// rest of the page. `header` holds the first bytes of the file.
    pub fn probe_page_size(header: &[u8]) -> Result<usize> {
        if header.len() < META_HEADER_SIZE {
            return Err(ArborError::corruption("file is too short for a meta page"));
        }
        Self::check_identity(header)?;
        let page_size = read_u32(header, PAGE_SIZE_OFFSET) as usize;
        validate_page_size(page_size)
            .map_err(|_| ArborError::corruption(format!("bad page size {} in meta page", page_size)))?;
        Ok(page_size)
    }

    pub fn read_from(data: &[u8]) -> Result<Self> {
        let page_size = Self::probe_page_size(data)?;
        if data.len() != page_size {
            return Err(ArborError::corruption(format!(
                "meta page records page size {} but the page is {} bytes",
                page_size,
                data.len()
            )));
        }

        let tag = read_u32(data, DB_TYPE_OFFSET);
        let db_type = DbType::from_tag(tag)
            .ok_or_else(|| ArborError::corruption(format!("unknown access method tag {}", tag)))?;

        let meta = Self {
            page_size,
            page_count: read_u32(data, PAGE_COUNT_OFFSET),
            root: read_link(data, ROOT_OFFSET),
            height: read_u32(data, HEIGHT_OFFSET),
            free_head: read_link(data, FREE_HEAD_OFFSET),
            free_count: read_u32(data, FREE_COUNT_OFFSET),
            db_type,
            entry_count: read_u64(data, ENTRY_COUNT_OFFSET),
        };

        if meta.page_count == 0 {
            return Err(ArborError::corruption("meta page records zero pages"));
        }
        if meta.height >= meta.page_count {
            return Err(ArborError::corruption(format!(
                "meta page records height {} in a file of {} pages",
                meta.height, meta.page_count
            )));
        }
        if meta.root.is_some() != (meta.height > 0) {
            return Err(ArborError::corruption(format!(
                "meta page root {:?} disagrees with height {}",
                meta.root, meta.height
            )));
        }
        Ok(meta)
    }

    pub fn write_to(&self, data: &mut [u8]) {
        data[..META_HEADER_SIZE].fill(0);
        data[0] = PageType::Meta as u8;
        write_u32(data, MAGIC_OFFSET, MAGIC_NUMBER);
        write_u32(data, VERSION_OFFSET, FORMAT_VERSION);
        write_u32(data, PAGE_SIZE_OFFSET, self.page_size as u32);
        write_u32(data, PAGE_COUNT_OFFSET, self.page_count);
        write_link(data, ROOT_OFFSET, self.root);
        write_u32(data, HEIGHT_OFFSET, self.height);
        write_link(data, FREE_HEAD_OFFSET, self.free_head);
        write_u32(data, FREE_COUNT_OFFSET, self.free_count);
        write_u32(data, DB_TYPE_OFFSET, self.db_type.tag());
        write_u64(data, ENTRY_COUNT_OFFSET, self.entry_count);
    }

    fn check_identity(data: &[u8]) -> Result<()> {
        let magic = read_u32(data, MAGIC_OFFSET);
        if magic != MAGIC_NUMBER {
            return Err(ArborError::corruption(format!("bad magic number {:#010x}", magic)));
        }
        let version = read_u32(data, VERSION_OFFSET);
        if version != FORMAT_VERSION {
            return Err(ArborError::corruption(format!(
                "unsupported format version {}",
                version
            )));
        }
        if PageType::of(data) != Some(PageType::Meta) {
            return Err(ArborError::corruption("page 0 is not a meta page"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_page_write_read() {
        let mut meta = MetaPage::new(1024, DbType::BTree);
        meta.page_count = 7;
        meta.root = Some(PageId::new(3));
        meta.height = 2;
        meta.free_head = Some(PageId::new(5));
        meta.free_count = 1;
        meta.entry_count = 42;

        let mut data = vec![0u8; 1024];
        meta.write_to(&mut data);

        assert_eq!(MetaPage::probe_page_size(&data[..META_HEADER_SIZE]).unwrap(), 1024);
        assert_eq!(MetaPage::read_from(&data).unwrap(), meta);
    }

    #[test]
    fn test_meta_page_bad_magic() {
        let mut data = vec![0u8; 512];
        MetaPage::new(512, DbType::BTree).write_to(&mut data);
        data[MAGIC_OFFSET] ^= 0xff;
        assert!(MetaPage::read_from(&data).unwrap_err().is_corruption());
    }

    #[test]
    fn test_meta_page_bad_version() {
        let mut data = vec![0u8; 512];
        MetaPage::new(512, DbType::BTree).write_to(&mut data);
        write_u32(&mut data, VERSION_OFFSET, FORMAT_VERSION + 1);
        assert!(MetaPage::read_from(&data).unwrap_err().is_corruption());
    }

    #[test]
    fn test_meta_page_size_mismatch() {
        let mut data = vec![0u8; 1024];
        MetaPage::new(512, DbType::BTree).write_to(&mut data);
        assert!(MetaPage::read_from(&data).unwrap_err().is_corruption());
    }

    #[test]
    fn test_meta_page_height_beyond_page_count() {
        let mut meta = MetaPage::new(512, DbType::BTree);
        meta.page_count = 3;
        meta.root = Some(PageId::new(1));
        meta.height = 2;

        let mut data = vec![0u8; 512];
        meta.write_to(&mut data);
        assert_eq!(MetaPage::read_from(&data).unwrap(), meta);

        write_u32(&mut data, HEIGHT_OFFSET, 3);
        assert!(MetaPage::read_from(&data).unwrap_err().is_corruption());
        write_u32(&mut data, HEIGHT_OFFSET, u32::MAX);
        assert!(MetaPage::read_from(&data).unwrap_err().is_corruption());
    }

    #[test]
    fn test_meta_page_short_header() {
        assert!(MetaPage::probe_page_size(&[0u8; 10]).unwrap_err().is_corruption());
    }
}
