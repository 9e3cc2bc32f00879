use std::fmt;
use std::sync::Arc;

use crate::index::{BytewiseComparator, KeyComparator};

use super::error::{ArborError, Result};
use super::types::PageId;

/// Default size of a page in bytes (4 KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size
pub const MAX_PAGE_SIZE: usize = 65536;

/// Page 0 of every database file holds the meta page
pub const META_PAGE_ID: PageId = PageId(0);

/// Invalid page ID constant, used as the null link on disk
pub const INVALID_PAGE_ID: PageId = PageId(u32::MAX);

/// "ARBR" in hex
pub const MAGIC_NUMBER: u32 = 0x4152_4252;

/// On-disk format version written to the meta page
pub const FORMAT_VERSION: u32 = 1;

/// Default K value for LRU-K replacement policy
pub const DEFAULT_LRUK_K: usize = 2;

/// Default buffer pool size (number of frames)
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 64;

/// Pages below this share of their usable bytes are rebalanced on delete
pub const DEFAULT_MIN_FILL_PERCENT: usize = 40;

/// Permission bits for files created without an explicit mode
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Checks that a page size is a power of two within the supported range.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(ArborError::invalid(format!(
            "page size {} must be a power of two in {}..={}",
            page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
        )));
    }
    Ok(())
}

/// Configuration applied when a standalone [`crate::Database`] is opened.
///
/// Handles opened inside an [`crate::Environment`] take their cache settings
/// from the environment instead; `page_size`, `min_fill_percent` and the
/// comparator still apply.
#[derive(Clone)]
pub struct DbConfig {
    /// Page size for newly created files. `None` adopts the size persisted in
    /// an existing file, or [`DEFAULT_PAGE_SIZE`] for new ones.
    pub page_size: Option<usize>,
    /// Number of frames in a private buffer pool.
    pub cache_pages: usize,
    /// K value for the LRU-K replacer of a private pool.
    pub lru_k: usize,
    /// Minimum page fill, in percent of usable bytes, before rebalancing.
    pub min_fill_percent: usize,
    /// Key ordering.
    pub comparator: Arc<dyn KeyComparator>,
}

impl DbConfig {
    pub fn new() -> Self {
        Self {
            page_size: None,
            cache_pages: DEFAULT_BUFFER_POOL_SIZE,
            lru_k: DEFAULT_LRUK_K,
            min_fill_percent: DEFAULT_MIN_FILL_PERCENT,
            comparator: Arc::new(BytewiseComparator),
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    pub fn lru_k(mut self, k: usize) -> Self {
        self.lru_k = k;
        self
    }

    pub fn min_fill_percent(mut self, percent: usize) -> Self {
        self.min_fill_percent = percent;
        self
    }

    pub fn comparator(mut self, comparator: Arc<dyn KeyComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(page_size) = self.page_size {
            validate_page_size(page_size)?;
        }
        if self.cache_pages == 0 {
            return Err(ArborError::invalid("cache must hold at least one page"));
        }
        if self.lru_k == 0 {
            return Err(ArborError::invalid("LRU-K k must be at least 1"));
        }
        if !(1..=50).contains(&self.min_fill_percent) {
            return Err(ArborError::invalid(format!(
                "minimum fill {}% must be in 1..=50",
                self.min_fill_percent
            )));
        }
        Ok(())
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("page_size", &self.page_size)
            .field("cache_pages", &self.cache_pages)
            .field("lru_k", &self.lru_k)
            .field("min_fill_percent", &self.min_fill_percent)
            .field("comparator", &self.comparator.name())
            .finish()
    }
}

/// Configuration of an [`crate::Environment`]'s shared buffer pool.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub cache_pages: usize,
    pub lru_k: usize,
}

impl EnvConfig {
    pub fn new() -> Self {
        Self {
            cache_pages: DEFAULT_BUFFER_POOL_SIZE * 4,
            lru_k: DEFAULT_LRUK_K,
        }
    }

    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    pub fn lru_k(mut self, k: usize) -> Self {
        self.lru_k = k;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_pages == 0 {
            return Err(ArborError::invalid("cache must hold at least one page"));
        }
        if self.lru_k == 0 {
            return Err(ArborError::invalid("LRU-K k must be at least 1"));
        }
        Ok(())
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new()
    }
}
