use std::cmp::Ordering;

use bytes::Bytes;

use crate::common::{ArborError, PageId, Result, INVALID_PAGE_ID};
use crate::storage::page::{
    read_link, read_u16, read_u32, write_link, write_u16, write_u32, PageType,
    PAGE_SELF_ID_OFFSET,
};

use super::KeyComparator;

/// Size of the header shared by leaf and internal pages
pub const HEADER_SIZE: usize = 24;

const NUM_CELLS_OFFSET: usize = 2;
const CELLS_START_OFFSET: usize = 8;
const PREV_PAGE_OFFSET: usize = 12;
const NEXT_PAGE_OFFSET: usize = 16;
const LEFTMOST_CHILD_OFFSET: usize = 20;

/// Slot directory entry: cell offset (u16) + cell length (u16)
const SLOT_SIZE: usize = 4;
/// key_len (u16) + value_len (u16)
const LEAF_CELL_HEADER: usize = 4;
/// key_len (u16) + child (u32)
const INTERNAL_CELL_HEADER: usize = 6;

/// Bytes a leaf entry costs beyond its key and value
pub const LEAF_ENTRY_OVERHEAD: usize = SLOT_SIZE + LEAF_CELL_HEADER;
/// Bytes a separator costs beyond its key
pub const INTERNAL_ENTRY_OVERHEAD: usize = SLOT_SIZE + INTERNAL_CELL_HEADER;

/// Bytes available for slots and cells in a page.
pub fn usable_bytes(page_size: usize) -> usize {
    page_size - HEADER_SIZE
}

/// Largest `key.len() + value.len()` accepted for a page size. Any cell is at
/// most a quarter of the usable bytes, so an overflowing page always splits
/// into two halves that fit.
pub fn max_entry_payload(page_size: usize) -> usize {
    usable_bytes(page_size) / 4 - INTERNAL_ENTRY_OVERHEAD
}

/// A key/value pair stored in a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValuePair {
    pub key: Bytes,
    pub value: Bytes,
}

impl KeyValuePair {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn encoded_size(&self) -> usize {
        LEAF_ENTRY_OVERHEAD + self.key.len() + self.value.len()
    }
}

/// A separator key and the child holding keys `>=` it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Separator {
    pub key: Bytes,
    pub child: PageId,
}

impl Separator {
    pub fn new(key: impl Into<Bytes>, child: PageId) -> Self {
        Self {
            key: key.into(),
            child,
        }
    }

    pub fn encoded_size(&self) -> usize {
        INTERNAL_ENTRY_OVERHEAD + self.key.len()
    }
}

/// Owned, decoded leaf page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode {
    pub page_id: PageId,
    pub prev: Option<PageId>,
    pub next: Option<PageId>,
    pub entries: Vec<KeyValuePair>,
}

impl LeafNode {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            prev: None,
            next: None,
            entries: Vec::new(),
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.entries.iter().map(KeyValuePair::encoded_size).sum()
    }

    pub fn search(&self, key: &[u8], cmp: &dyn KeyComparator) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| cmp.compare(&entry.key, key))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        check_fits(data.len(), self.used_bytes(), self.page_id)?;
        write_header(data, PageType::Leaf, self.page_id, self.entries.len());
        write_link(data, PREV_PAGE_OFFSET, self.prev);
        write_link(data, NEXT_PAGE_OFFSET, self.next);
        write_link(data, LEFTMOST_CHILD_OFFSET, None);

        let mut cursor = data.len();
        for (i, entry) in self.entries.iter().enumerate() {
            let cell_len = LEAF_CELL_HEADER + entry.key.len() + entry.value.len();
            cursor -= cell_len;
            write_u16(data, cursor, entry.key.len() as u16);
            write_u16(data, cursor + 2, entry.value.len() as u16);
            let key_start = cursor + LEAF_CELL_HEADER;
            data[key_start..key_start + entry.key.len()].copy_from_slice(&entry.key);
            let value_start = key_start + entry.key.len();
            data[value_start..value_start + entry.value.len()].copy_from_slice(&entry.value);
            write_slot(data, i, cursor, cell_len);
        }
        write_u32(data, CELLS_START_OFFSET, cursor as u32);
        Ok(())
    }
}

/// Owned, decoded internal page. Child `0` is the leftmost child and child
/// `i > 0` is `entries[i - 1].child`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub page_id: PageId,
    pub leftmost: PageId,
    pub entries: Vec<Separator>,
}

impl InternalNode {
    pub fn new(page_id: PageId, leftmost: PageId) -> Self {
        Self {
            page_id,
            leftmost,
            entries: Vec::new(),
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.entries.iter().map(Separator::encoded_size).sum()
    }

    pub fn num_children(&self) -> usize {
        self.entries.len() + 1
    }

    pub fn child(&self, index: usize) -> PageId {
        if index == 0 {
            self.leftmost
        } else {
            self.entries[index - 1].child
        }
    }

    /// Index of the child whose subtree may hold `key`.
    pub fn child_index(&self, key: &[u8], cmp: &dyn KeyComparator) -> usize {
        match self
            .entries
            .binary_search_by(|entry| cmp.compare(&entry.key, key))
        {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        check_fits(data.len(), self.used_bytes(), self.page_id)?;
        write_header(data, PageType::Internal, self.page_id, self.entries.len());
        write_link(data, PREV_PAGE_OFFSET, None);
        write_link(data, NEXT_PAGE_OFFSET, None);
        write_link(data, LEFTMOST_CHILD_OFFSET, Some(self.leftmost));

        let mut cursor = data.len();
        for (i, entry) in self.entries.iter().enumerate() {
            let cell_len = INTERNAL_CELL_HEADER + entry.key.len();
            cursor -= cell_len;
            write_u16(data, cursor, entry.key.len() as u16);
            write_u32(data, cursor + 2, entry.child.as_u32());
            let key_start = cursor + INTERNAL_CELL_HEADER;
            data[key_start..key_start + entry.key.len()].copy_from_slice(&entry.key);
            write_slot(data, i, cursor, cell_len);
        }
        write_u32(data, CELLS_START_OFFSET, cursor as u32);
        Ok(())
    }
}

/// A decoded tree page of either kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    pub fn page_id(&self) -> PageId {
        match self {
            Node::Leaf(leaf) => leaf.page_id,
            Node::Internal(internal) => internal.page_id,
        }
    }

    pub fn used_bytes(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.used_bytes(),
            Node::Internal(internal) => internal.used_bytes(),
        }
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        match self {
            Node::Leaf(leaf) => leaf.write_to(data),
            Node::Internal(internal) => internal.write_to(data),
        }
    }
}

fn check_fits(page_size: usize, used: usize, page_id: PageId) -> Result<()> {
    if used > usable_bytes(page_size) {
        return Err(ArborError::invalid(format!(
            "{} bytes of cells do not fit in {}",
            used, page_id
        )));
    }
    Ok(())
}

fn write_header(data: &mut [u8], page_type: PageType, page_id: PageId, num_cells: usize) {
    data[..HEADER_SIZE].fill(0);
    data[0] = page_type as u8;
    write_u16(data, NUM_CELLS_OFFSET, num_cells as u16);
    write_u32(data, PAGE_SELF_ID_OFFSET, page_id.as_u32());
}

fn write_slot(data: &mut [u8], index: usize, offset: usize, len: usize) {
    let slot = HEADER_SIZE + index * SLOT_SIZE;
    // Offsets of a 64 KiB page fit in u16 because every cell is non-empty.
    write_u16(data, slot, offset as u16);
    write_u16(data, slot + 2, len as u16);
}

/// Mutable view used to patch sibling links without decoding the page.
pub struct BTreeNode<'a> {
    data: &'a mut [u8],
}

impl<'a> BTreeNode<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn set_prev_page_id(&mut self, page_id: Option<PageId>) {
        write_link(self.data, PREV_PAGE_OFFSET, page_id);
    }

    pub fn set_next_page_id(&mut self, page_id: Option<PageId>) {
        write_link(self.data, NEXT_PAGE_OFFSET, page_id);
    }
}

/// Read-only view over a tree page. Construction validates the header and
/// slot directory, so accessors index without further checks.
pub struct BTreeNodeRef<'a> {
    data: &'a [u8],
    is_leaf: bool,
    num_cells: usize,
}

impl std::fmt::Debug for BTreeNodeRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeNodeRef")
            .field("is_leaf", &self.is_leaf)
            .field("num_cells", &self.num_cells)
            .finish()
    }
}

impl<'a> BTreeNodeRef<'a> {
    /// Validates `data` as the tree page `page_id`.
    pub fn parse(data: &'a [u8], page_id: PageId) -> Result<Self> {
        Self::try_parse(data, page_id).map_err(|reason| {
            ArborError::corruption(format!("{} is not a valid tree page: {}", page_id, reason))
        })
    }

    /// Like [`Self::parse`] but reports what is wrong as a plain string.
    pub fn try_parse(data: &'a [u8], page_id: PageId) -> std::result::Result<Self, String> {
        if data.len() < HEADER_SIZE {
            return Err(format!("page is only {} bytes", data.len()));
        }
        let is_leaf = match PageType::of(data) {
            Some(PageType::Leaf) => true,
            Some(PageType::Internal) => false,
            other => return Err(format!("page type {:?}", other)),
        };
        let stored_id = read_u32(data, PAGE_SELF_ID_OFFSET);
        if stored_id != page_id.as_u32() {
            return Err(format!("page claims to be page {}", stored_id));
        }

        let num_cells = read_u16(data, NUM_CELLS_OFFSET) as usize;
        let slots_end = HEADER_SIZE + num_cells * SLOT_SIZE;
        if slots_end > data.len() {
            return Err(format!("{} slots overflow the page", num_cells));
        }
        if !is_leaf && read_u32(data, LEFTMOST_CHILD_OFFSET) == INVALID_PAGE_ID.as_u32() {
            return Err("internal page without a leftmost child".to_string());
        }

        let page = Self {
            data,
            is_leaf,
            num_cells,
        };
        for index in 0..num_cells {
            let (offset, len) = page.slot(index);
            if offset < slots_end || offset + len > data.len() {
                return Err(format!("cell {} lies outside the cell area", index));
            }
            let expected = if is_leaf {
                if len < LEAF_CELL_HEADER {
                    return Err(format!("cell {} is truncated", index));
                }
                LEAF_CELL_HEADER
                    + read_u16(data, offset) as usize
                    + read_u16(data, offset + 2) as usize
            } else {
                if len < INTERNAL_CELL_HEADER {
                    return Err(format!("cell {} is truncated", index));
                }
                INTERNAL_CELL_HEADER + read_u16(data, offset) as usize
            };
            if expected != len {
                return Err(format!("cell {} length {} disagrees with its header", index, len));
            }
            if read_u16(data, offset) == 0 {
                return Err(format!("cell {} has an empty key", index));
            }
        }
        Ok(page)
    }

    fn slot(&self, index: usize) -> (usize, usize) {
        let slot = HEADER_SIZE + index * SLOT_SIZE;
        (
            read_u16(self.data, slot) as usize,
            read_u16(self.data, slot + 2) as usize,
        )
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn num_cells(&self) -> usize {
        self.num_cells
    }

    pub fn prev_page_id(&self) -> Option<PageId> {
        read_link(self.data, PREV_PAGE_OFFSET)
    }

    pub fn next_page_id(&self) -> Option<PageId> {
        read_link(self.data, NEXT_PAGE_OFFSET)
    }

    pub fn leftmost_child(&self) -> PageId {
        PageId::new(read_u32(self.data, LEFTMOST_CHILD_OFFSET))
    }

    pub fn key_at(&self, index: usize) -> &'a [u8] {
        let (offset, _) = self.slot(index);
        let key_len = read_u16(self.data, offset) as usize;
        let header = if self.is_leaf {
            LEAF_CELL_HEADER
        } else {
            INTERNAL_CELL_HEADER
        };
        &self.data[offset + header..offset + header + key_len]
    }

    /// Value of leaf cell `index`.
    pub fn value_at(&self, index: usize) -> &'a [u8] {
        let (offset, len) = self.slot(index);
        let key_len = read_u16(self.data, offset) as usize;
        &self.data[offset + LEAF_CELL_HEADER + key_len..offset + len]
    }

    /// Child `index` of an internal page, `0` being the leftmost child.
    pub fn child(&self, index: usize) -> PageId {
        if index == 0 {
            return self.leftmost_child();
        }
        let (offset, _) = self.slot(index - 1);
        PageId::new(read_u32(self.data, offset + 2))
    }

    pub fn search(&self, key: &[u8], cmp: &dyn KeyComparator) -> std::result::Result<usize, usize> {
        let mut left = 0;
        let mut right = self.num_cells;

        while left < right {
            let mid = left + (right - left) / 2;
            match cmp.compare(self.key_at(mid), key) {
                Ordering::Less => left = mid + 1,
                Ordering::Greater => right = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(left)
    }

    /// Index of the child whose subtree may hold `key`.
    pub fn child_index(&self, key: &[u8], cmp: &dyn KeyComparator) -> usize {
        match self.search(key, cmp) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Copies the leaf entry at `index` out of the page.
    pub fn entry(&self, index: usize) -> KeyValuePair {
        KeyValuePair::new(
            Bytes::copy_from_slice(self.key_at(index)),
            Bytes::copy_from_slice(self.value_at(index)),
        )
    }

    pub fn to_node(&self, page_id: PageId) -> Node {
        if self.is_leaf {
            Node::Leaf(LeafNode {
                page_id,
                prev: self.prev_page_id(),
                next: self.next_page_id(),
                entries: (0..self.num_cells).map(|i| self.entry(i)).collect(),
            })
        } else {
            Node::Internal(InternalNode {
                page_id,
                leftmost: self.leftmost_child(),
                entries: (0..self.num_cells)
                    .map(|i| Separator::new(Bytes::copy_from_slice(self.key_at(i)), self.child(i + 1)))
                    .collect(),
            })
        }
    }
}

/// Picks where to cut a run of cells so both halves carry about the same
/// number of bytes. Always leaves at least one cell on each side.
pub fn split_point(sizes: &[usize]) -> usize {
    let total: usize = sizes.iter().sum();
    let mut acc = 0;
    let mut point = sizes.len();
    for (i, size) in sizes.iter().enumerate() {
        if acc + size > total / 2 {
            point = i;
            break;
        }
        acc += size;
    }
    point.clamp(1, sizes.len().saturating_sub(1).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BytewiseComparator;

    const PAGE: usize = 512;

    fn leaf_with(keys: &[&str]) -> LeafNode {
        let mut leaf = LeafNode::new(PageId::new(3));
        leaf.prev = Some(PageId::new(2));
        leaf.entries = keys
            .iter()
            .map(|k| KeyValuePair::new(k.as_bytes().to_vec(), format!("v{}", k).into_bytes()))
            .collect();
        leaf
    }

    #[test]
    fn test_leaf_write_parse() {
        let leaf = leaf_with(&["apple", "banana", "cherry"]);
        let mut data = vec![0u8; PAGE];
        leaf.write_to(&mut data).unwrap();

        let view = BTreeNodeRef::parse(&data, PageId::new(3)).unwrap();
        assert!(view.is_leaf());
        assert_eq!(view.num_cells(), 3);
        assert_eq!(view.key_at(1), b"banana");
        assert_eq!(view.value_at(1), b"vbanana");
        assert_eq!(view.prev_page_id(), Some(PageId::new(2)));
        assert_eq!(view.next_page_id(), None);
        assert_eq!(view.to_node(PageId::new(3)), Node::Leaf(leaf));
    }

    #[test]
    fn test_leaf_empty_value() {
        let mut leaf = LeafNode::new(PageId::new(1));
        leaf.entries.push(KeyValuePair::new(&b"k"[..], Bytes::new()));
        let mut data = vec![0u8; PAGE];
        leaf.write_to(&mut data).unwrap();

        let view = BTreeNodeRef::parse(&data, PageId::new(1)).unwrap();
        assert_eq!(view.value_at(0), b"");
    }

    #[test]
    fn test_leaf_search() {
        let leaf = leaf_with(&["b", "d", "f"]);
        let mut data = vec![0u8; PAGE];
        leaf.write_to(&mut data).unwrap();
        let view = BTreeNodeRef::parse(&data, PageId::new(3)).unwrap();
        let cmp = BytewiseComparator;

        assert_eq!(view.search(b"d", &cmp), Ok(1));
        assert_eq!(view.search(b"a", &cmp), Err(0));
        assert_eq!(view.search(b"e", &cmp), Err(2));
        assert_eq!(view.search(b"z", &cmp), Err(3));
        assert_eq!(leaf.search(b"e", &cmp), Err(2));
    }

    #[test]
    fn test_internal_child_index() {
        let mut node = InternalNode::new(PageId::new(9), PageId::new(1));
        node.entries.push(Separator::new(&b"m"[..], PageId::new(2)));
        node.entries.push(Separator::new(&b"t"[..], PageId::new(3)));

        let mut data = vec![0u8; PAGE];
        node.write_to(&mut data).unwrap();
        let view = BTreeNodeRef::parse(&data, PageId::new(9)).unwrap();
        let cmp = BytewiseComparator;

        assert!(!view.is_leaf());
        assert_eq!(view.child(view.child_index(b"a", &cmp)), PageId::new(1));
        assert_eq!(view.child(view.child_index(b"m", &cmp)), PageId::new(2));
        assert_eq!(view.child(view.child_index(b"s", &cmp)), PageId::new(2));
        assert_eq!(view.child(view.child_index(b"t", &cmp)), PageId::new(3));
        assert_eq!(node.child(node.child_index(b"zz", &cmp)), PageId::new(3));
        assert_eq!(view.to_node(PageId::new(9)), Node::Internal(node));
    }

    #[test]
    fn test_parse_rejects_wrong_page() {
        let leaf = leaf_with(&["a"]);
        let mut data = vec![0u8; PAGE];
        leaf.write_to(&mut data).unwrap();

        assert!(BTreeNodeRef::parse(&data, PageId::new(4)).unwrap_err().is_corruption());
        let view = BTreeNodeRef::parse(&data, PageId::new(3)).unwrap();
        assert_eq!(
            format!("{:?}", view),
            "BTreeNodeRef { is_leaf: true, num_cells: 1 }"
        );

        data[0] = PageType::Free as u8;
        assert!(BTreeNodeRef::parse(&data, PageId::new(3)).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_slot() {
        let leaf = leaf_with(&["a", "b"]);
        let mut data = vec![0u8; PAGE];
        leaf.write_to(&mut data).unwrap();

        // Point the second slot past the end of the page.
        write_u16(&mut data, HEADER_SIZE + SLOT_SIZE, (PAGE - 2) as u16);
        assert!(BTreeNodeRef::parse(&data, PageId::new(3)).is_err());
    }

    #[test]
    fn test_write_rejects_overflow() {
        let mut leaf = LeafNode::new(PageId::new(1));
        for i in 0..10u8 {
            leaf.entries.push(KeyValuePair::new(vec![i + 1; 40], vec![0u8; 40]));
        }
        let mut data = vec![0u8; PAGE];
        assert!(leaf.write_to(&mut data).is_err());
    }

    #[test]
    fn test_max_entry_payload_leaves_room_for_four() {
        for page_size in [512, 4096, 65536] {
            let max = max_entry_payload(page_size);
            assert!(4 * (max + INTERNAL_ENTRY_OVERHEAD) <= usable_bytes(page_size));
            assert!(max + LEAF_CELL_HEADER < u16::MAX as usize);
        }
    }

    #[test]
    fn test_split_point_balances_bytes() {
        assert_eq!(split_point(&[10, 10, 10, 10]), 2);
        assert_eq!(split_point(&[100, 1, 1, 1]), 1);
        assert_eq!(split_point(&[1, 1, 1, 100]), 3);
        assert_eq!(split_point(&[5, 5]), 1);
    }

    #[test]
    fn test_relink_siblings() {
        let leaf = leaf_with(&["a"]);
        let mut data = vec![0u8; PAGE];
        leaf.write_to(&mut data).unwrap();

        let mut node = BTreeNode::new(&mut data);
        node.set_next_page_id(Some(PageId::new(8)));
        node.set_prev_page_id(None);

        let view = BTreeNodeRef::parse(&data, PageId::new(3)).unwrap();
        assert_eq!(view.next_page_id(), Some(PageId::new(8)));
        assert_eq!(view.prev_page_id(), None);
    }
}
