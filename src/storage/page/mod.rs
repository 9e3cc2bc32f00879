mod free_page;
mod meta_page;

pub use free_page::*;
pub use meta_page::*;

use crate::common::{PageId, INVALID_PAGE_ID};

/// Offset of the one-byte type tag shared by every page format
pub const PAGE_TYPE_OFFSET: usize = 0;

/// Offset of the page's own page number, written when the page is formatted
pub const PAGE_SELF_ID_OFFSET: usize = 4;

/// Type tag stored in the first byte of every page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Meta = 1,
    Internal = 2,
    Leaf = 3,
    Free = 4,
}

impl PageType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PageType::Meta),
            2 => Some(PageType::Internal),
            3 => Some(PageType::Leaf),
            4 => Some(PageType::Free),
            _ => None,
        }
    }

    /// Reads the tag of a raw page.
    pub fn of(data: &[u8]) -> Option<Self> {
        data.get(PAGE_TYPE_OFFSET).copied().and_then(Self::from_u8)
    }
}

pub(crate) fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

pub(crate) fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub(crate) fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn write_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Reads an on-disk page link, mapping the null link to `None`.
pub(crate) fn read_link(data: &[u8], offset: usize) -> Option<PageId> {
    let value = read_u32(data, offset);
    if value == INVALID_PAGE_ID.as_u32() {
        None
    } else {
        Some(PageId::new(value))
    }
}

pub(crate) fn write_link(data: &mut [u8], offset: usize, page_id: Option<PageId>) {
    write_u32(data, offset, page_id.unwrap_or(INVALID_PAGE_ID).as_u32());
}
