use crate::common::{ArborError, PageId, Result};

use super::{read_link, read_u32, write_link, write_u32, PageType, PAGE_SELF_ID_OFFSET};

const NEXT_FREE_OFFSET: usize = 8;

/// A released page, linked into the file's free list.
pub struct FreePage;

impl FreePage {
    /// Formats `data` as a free page pointing at `next`.
    pub fn format(data: &mut [u8], page_id: PageId, next: Option<PageId>) {
        data.fill(0);
        data[0] = PageType::Free as u8;
        write_u32(data, PAGE_SELF_ID_OFFSET, page_id.as_u32());
        write_link(data, NEXT_FREE_OFFSET, next);
    }

    /// Returns the next link of a free-list entry. Anything but a free page
    /// formatted for `page_id` means the chain is broken.
    pub fn next(data: &[u8], page_id: PageId) -> Result<Option<PageId>> {
        if PageType::of(data) != Some(PageType::Free)
            || read_u32(data, PAGE_SELF_ID_OFFSET) != page_id.as_u32()
        {
            return Err(ArborError::corruption(format!(
                "broken free list at {}",
                page_id
            )));
        }
        Ok(read_link(data, NEXT_FREE_OFFSET))
    }
}
