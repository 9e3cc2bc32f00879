use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::common::{ArborError, PageId, Result};
use crate::storage::PageStore;

use super::btree_page::{
    max_entry_payload, split_point, usable_bytes, BTreeNode, BTreeNodeRef, InternalNode,
    KeyValuePair, LeafNode, Node, Separator, INTERNAL_ENTRY_OVERHEAD,
};
use super::KeyComparator;

/// One internal page on the way from the root to a leaf and the child taken.
#[derive(Debug, Clone, Copy)]
struct PathStep {
    page_id: PageId,
    child_index: usize,
}

/// A leaf slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub page_id: PageId,
    pub slot: usize,
}

/// Outcome of [`BTreeIndex::search`]. When the key is absent, `slot` is
/// where it would be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    pub found: bool,
    pub page_id: PageId,
    pub slot: usize,
}

/// Where [`BTreeIndex::seek`] lands relative to the search key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekBound {
    /// Smallest key `>=` the search key
    AtOrAfter,
    /// Smallest key `>` the search key
    After,
    /// Largest key `<` the search key
    Before,
}

enum Rebalance {
    /// The pair became one page and the parent lost a separator
    Merged,
    /// The parent is final; nothing above needs fixing
    Done,
}

/// B+tree over variable-length byte keys stored in a [`PageStore`].
///
/// Leaves hold the key/value pairs and are chained both ways; internal pages
/// hold separators. Capacity is measured in bytes. The index performs no
/// locking of its own: callers serialize writers against readers.
pub struct BTreeIndex {
    store: Arc<PageStore>,
    comparator: Arc<dyn KeyComparator>,
    min_fill_percent: usize,
}

impl BTreeIndex {
    /// Opens the tree recorded in the store's meta page, formatting an empty
    /// root leaf if the file has none yet.
    pub fn open(
        store: Arc<PageStore>,
        comparator: Arc<dyn KeyComparator>,
        min_fill_percent: usize,
    ) -> Result<Self> {
        let index = Self {
            store,
            comparator,
            min_fill_percent,
        };

        if index.store.meta().root.is_none() {
            if index.store.is_read_only() {
                return Err(ArborError::corruption("file has no tree root"));
            }
            let root = index.store.allocate()?;
            index.write_node(&Node::Leaf(LeafNode::new(root)))?;
            index.store.update_meta(|meta| {
                meta.root = Some(root);
                meta.height = 1;
                meta.entry_count = 0;
            });
            debug!(root = %root, "btree.create");
        }
        Ok(index)
    }

    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    pub fn comparator(&self) -> &Arc<dyn KeyComparator> {
        &self.comparator
    }

    pub fn min_fill_percent(&self) -> usize {
        self.min_fill_percent
    }

    /// Number of live entries.
    pub fn len(&self) -> u64 {
        self.store.meta().entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn height(&self) -> u32 {
        self.store.meta().height
    }

    fn cmp(&self) -> &dyn KeyComparator {
        self.comparator.as_ref()
    }

    fn usable(&self) -> usize {
        usable_bytes(self.store.page_size())
    }

    fn min_fill_bytes(&self) -> usize {
        self.usable() * self.min_fill_percent / 100
    }

    fn root(&self) -> Result<(PageId, u32)> {
        let meta = self.store.meta();
        match meta.root {
            Some(root) if meta.height > 0 => Ok((root, meta.height)),
            _ => Err(ArborError::corruption("tree has no root")),
        }
    }

    /// Rejects keys and values the page format cannot hold.
    pub fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(ArborError::invalid("keys must not be empty"));
        }
        let max = max_entry_payload(self.store.page_size());
        if key.len() + value.len() > max {
            return Err(ArborError::invalid(format!(
                "entry of {} bytes exceeds the {} byte limit for {} byte pages",
                key.len() + value.len(),
                max,
                self.store.page_size()
            )));
        }
        Ok(())
    }

    fn read_node(&self, page_id: PageId) -> Result<Node> {
        let guard = self.store.read(page_id)?;
        let node = BTreeNodeRef::parse(guard.data(), page_id)?;
        Ok(node.to_node(page_id))
    }

    fn read_leaf(&self, page_id: PageId) -> Result<LeafNode> {
        match self.read_node(page_id)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(ArborError::corruption(format!(
                "expected a leaf at {}",
                page_id
            ))),
        }
    }

    fn read_internal(&self, page_id: PageId) -> Result<InternalNode> {
        match self.read_node(page_id)? {
            Node::Internal(internal) => Ok(internal),
            Node::Leaf(_) => Err(ArborError::corruption(format!(
                "expected an internal page at {}",
                page_id
            ))),
        }
    }

    fn write_node(&self, node: &Node) -> Result<()> {
        let mut guard = self.store.write(node.page_id())?;
        node.write_to(guard.data_mut())
    }

    fn set_prev_link(&self, page_id: PageId, prev: Option<PageId>) -> Result<()> {
        let mut guard = self.store.write(page_id)?;
        if !BTreeNodeRef::parse(guard.data(), page_id)?.is_leaf() {
            return Err(ArborError::corruption(format!(
                "sibling link points at internal page {}",
                page_id
            )));
        }
        BTreeNode::new(guard.data_mut()).set_prev_page_id(prev);
        Ok(())
    }

    /// Walks from the root to the leaf that may hold `key`, recording the
    /// internal pages passed.
    fn descend(&self, key: &[u8]) -> Result<(Vec<PathStep>, PageId)> {
        self.descend_by(|node| node.child_index(key, self.cmp()))
    }

    fn descend_by(
        &self,
        mut choose: impl FnMut(&BTreeNodeRef<'_>) -> usize,
    ) -> Result<(Vec<PathStep>, PageId)> {
        let (root, height) = self.root()?;
        let mut path = Vec::new();
        let mut page_id = root;

        for level in (1..=height).rev() {
            let guard = self.store.read(page_id)?;
            let node = BTreeNodeRef::parse(guard.data(), page_id)?;
            if node.is_leaf() != (level == 1) {
                return Err(ArborError::corruption(format!(
                    "{} has the wrong kind for level {} of {}",
                    page_id, level, height
                )));
            }
            if level == 1 {
                return Ok((path, page_id));
            }
            let child_index = choose(&node);
            path.push(PathStep {
                page_id,
                child_index,
            });
            page_id = node.child(child_index);
        }
        Err(ArborError::corruption("tree has zero height"))
    }

    /// Locates `key`.
    pub fn search(&self, key: &[u8]) -> Result<SearchResult> {
        let (_, leaf_id) = self.descend(key)?;
        let guard = self.store.read(leaf_id)?;
        let leaf = BTreeNodeRef::parse(guard.data(), leaf_id)?;
        let (found, slot) = match leaf.search(key, self.cmp()) {
            Ok(slot) => (true, slot),
            Err(slot) => (false, slot),
        };
        Ok(SearchResult {
            found,
            page_id: leaf_id,
            slot,
        })
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let (_, leaf_id) = self.descend(key)?;
        let guard = self.store.read(leaf_id)?;
        let leaf = BTreeNodeRef::parse(guard.data(), leaf_id)?;
        Ok(leaf
            .search(key, self.cmp())
            .ok()
            .map(|slot| Bytes::copy_from_slice(leaf.value_at(slot))))
    }

    /// Inserts or replaces `key`.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_entry(key, value)?;
        let (path, leaf_id) = self.descend(key)?;
        let mut leaf = self.read_leaf(leaf_id)?;

        let added = match leaf.search(key, self.cmp()) {
            Ok(slot) => {
                if leaf.entries[slot].value.as_ref() == value {
                    return Ok(());
                }
                leaf.entries[slot].value = Bytes::copy_from_slice(value);
                false
            }
            Err(slot) => {
                leaf.entries.insert(
                    slot,
                    KeyValuePair::new(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)),
                );
                true
            }
        };

        if leaf.used_bytes() <= self.usable() {
            self.write_node(&Node::Leaf(leaf))?;
        } else {
            let (separator, right_id) = self.split_leaf(leaf)?;
            self.insert_separator(path, separator, right_id)?;
        }

        if added {
            self.store.update_meta(|meta| meta.entry_count += 1);
        }
        Ok(())
    }

    /// Moves the upper half of an overflowing leaf into a new right sibling.
    fn split_leaf(&self, mut leaf: LeafNode) -> Result<(Bytes, PageId)> {
        let right_id = self.store.allocate()?;
        let sizes: Vec<usize> = leaf.entries.iter().map(KeyValuePair::encoded_size).collect();
        let right_entries = leaf.entries.split_off(split_point(&sizes));

        let right = LeafNode {
            page_id: right_id,
            prev: Some(leaf.page_id),
            next: leaf.next,
            entries: right_entries,
        };
        if let Some(next) = leaf.next {
            self.set_prev_link(next, Some(right_id))?;
        }
        leaf.next = Some(right_id);

        let separator = right.entries[0].key.clone();
        debug!(
            left = %leaf.page_id,
            right = %right_id,
            left_entries = leaf.entries.len(),
            right_entries = right.entries.len(),
            "btree.split.leaf"
        );
        self.write_node(&Node::Leaf(leaf))?;
        self.write_node(&Node::Leaf(right))?;
        Ok((separator, right_id))
    }

    /// Adds `separator -> right_id` to the parents on `path`, splitting
    /// upward and growing a new root when the old one overflows.
    fn insert_separator(
        &self,
        mut path: Vec<PathStep>,
        mut separator: Bytes,
        mut right_id: PageId,
    ) -> Result<()> {
        while let Some(step) = path.pop() {
            let mut parent = self.read_internal(step.page_id)?;
            parent
                .entries
                .insert(step.child_index, Separator::new(separator, right_id));
            if parent.used_bytes() <= self.usable() {
                return self.write_node(&Node::Internal(parent));
            }

            let sizes: Vec<usize> = parent.entries.iter().map(Separator::encoded_size).collect();
            let at = split_point(&sizes);
            let mut upper = parent.entries.split_off(at);
            let promoted = upper.remove(0);

            let new_id = self.store.allocate()?;
            let right = InternalNode {
                page_id: new_id,
                leftmost: promoted.child,
                entries: upper,
            };
            debug!(
                left = %parent.page_id,
                right = %new_id,
                "btree.split.internal"
            );
            self.write_node(&Node::Internal(parent))?;
            self.write_node(&Node::Internal(right))?;

            separator = promoted.key;
            right_id = new_id;
        }

        let (old_root, height) = self.root()?;
        let new_root = self.store.allocate()?;
        let mut root = InternalNode::new(new_root, old_root);
        root.entries.push(Separator::new(separator, right_id));
        self.write_node(&Node::Internal(root))?;
        self.store.update_meta(|meta| {
            meta.root = Some(new_root);
            meta.height = height + 1;
        });
        debug!(root = %new_root, height = height + 1, "btree.root.grow");
        Ok(())
    }

    /// Removes `key`. Returns whether it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Err(ArborError::invalid("keys must not be empty"));
        }
        let (path, leaf_id) = self.descend(key)?;
        let mut leaf = self.read_leaf(leaf_id)?;
        let Ok(slot) = leaf.search(key, self.cmp()) else {
            return Ok(false);
        };
        leaf.entries.remove(slot);

        self.rebalance(path, Node::Leaf(leaf))?;
        self.store
            .update_meta(|meta| meta.entry_count = meta.entry_count.saturating_sub(1));
        Ok(true)
    }

    /// Writes `node` back, merging or redistributing it with a sibling while
    /// it is under the minimum fill.
    fn rebalance(&self, mut path: Vec<PathStep>, mut node: Node) -> Result<()> {
        loop {
            let Some(step) = path.pop() else {
                return self.finish_root(node);
            };
            if node.used_bytes() >= self.min_fill_bytes() {
                return self.write_node(&node);
            }

            let mut parent = self.read_internal(step.page_id)?;
            if parent.entries.is_empty() {
                return self.write_node(&node);
            }

            let (left, right, separator_index) = if step.child_index > 0 {
                let sibling = self.read_node(parent.child(step.child_index - 1))?;
                (sibling, node, step.child_index - 1)
            } else {
                let sibling = self.read_node(parent.child(1))?;
                (node, sibling, 0)
            };

            match self.rebalance_pair(left, right, &mut parent, separator_index)? {
                Rebalance::Merged => node = Node::Internal(parent),
                Rebalance::Done => return Ok(()),
            }
        }
    }

    fn rebalance_pair(
        &self,
        left: Node,
        right: Node,
        parent: &mut InternalNode,
        separator_index: usize,
    ) -> Result<Rebalance> {
        match (left, right) {
            (Node::Leaf(left), Node::Leaf(right)) => {
                self.rebalance_leaves(left, right, parent, separator_index)
            }
            (Node::Internal(left), Node::Internal(right)) => {
                self.rebalance_internals(left, right, parent, separator_index)
            }
            (left, right) => Err(ArborError::corruption(format!(
                "siblings {} and {} differ in kind",
                left.page_id(),
                right.page_id()
            ))),
        }
    }

    fn rebalance_leaves(
        &self,
        mut left: LeafNode,
        right: LeafNode,
        parent: &mut InternalNode,
        separator_index: usize,
    ) -> Result<Rebalance> {
        let usable = self.usable();

        if left.used_bytes() + right.used_bytes() <= usable {
            if let Some(next) = right.next {
                self.set_prev_link(next, Some(left.page_id))?;
            }
            left.next = right.next;
            left.entries.extend(right.entries);
            debug!(left = %left.page_id, right = %right.page_id, "btree.merge.leaf");
            self.write_node(&Node::Leaf(left))?;
            self.store.free(right.page_id)?;
            parent.entries.remove(separator_index);
            return Ok(Rebalance::Merged);
        }

        let left_len = left.entries.len();
        let mut entries = left.entries;
        entries.extend(right.entries);
        let sizes: Vec<usize> = entries.iter().map(KeyValuePair::encoded_size).collect();
        let at = split_point(&sizes);
        let left_bytes: usize = sizes[..at].iter().sum();
        let right_bytes: usize = sizes[at..].iter().sum();
        let new_separator = entries[at].key.clone();

        let fits = left_bytes <= usable
            && right_bytes <= usable
            && Self::separator_fits(parent, separator_index, &new_separator, usable);
        let right_entries = if fits {
            entries.split_off(at)
        } else {
            entries.split_off(left_len)
        };

        left.entries = entries;
        let right = LeafNode {
            page_id: right.page_id,
            prev: right.prev,
            next: right.next,
            entries: right_entries,
        };
        if fits {
            debug!(
                left = %left.page_id,
                right = %right.page_id,
                left_entries = left.entries.len(),
                right_entries = right.entries.len(),
                "btree.redistribute.leaf"
            );
            parent.entries[separator_index].key = new_separator;
            self.write_node(&Node::Internal(parent.clone()))?;
        }
        self.write_node(&Node::Leaf(left))?;
        self.write_node(&Node::Leaf(right))?;
        Ok(Rebalance::Done)
    }

    fn rebalance_internals(
        &self,
        mut left: InternalNode,
        right: InternalNode,
        parent: &mut InternalNode,
        separator_index: usize,
    ) -> Result<Rebalance> {
        let usable = self.usable();
        let separator = parent.entries[separator_index].key.clone();
        let pulled_down = INTERNAL_ENTRY_OVERHEAD + separator.len();

        if left.used_bytes() + right.used_bytes() + pulled_down <= usable {
            left.entries.push(Separator::new(separator, right.leftmost));
            left.entries.extend(right.entries);
            debug!(left = %left.page_id, right = %right.page_id, "btree.merge.internal");
            self.write_node(&Node::Internal(left))?;
            self.store.free(right.page_id)?;
            parent.entries.remove(separator_index);
            return Ok(Rebalance::Merged);
        }

        let mut entries = left.entries.clone();
        entries.push(Separator::new(separator, right.leftmost));
        entries.extend(right.entries.iter().cloned());
        let sizes: Vec<usize> = entries.iter().map(Separator::encoded_size).collect();
        let at = split_point(&sizes);
        let left_bytes: usize = sizes[..at].iter().sum();
        let right_bytes: usize = sizes[at + 1..].iter().sum();
        let promoted_key = entries[at].key.clone();

        if left_bytes > usable
            || right_bytes > usable
            || !Self::separator_fits(parent, separator_index, &promoted_key, usable)
        {
            // Fill is a soft target; the pair stays as it is.
            self.write_node(&Node::Internal(left))?;
            self.write_node(&Node::Internal(right))?;
            return Ok(Rebalance::Done);
        }

        let mut upper = entries.split_off(at);
        let promoted = upper.remove(0);
        left.entries = entries;
        let right = InternalNode {
            page_id: right.page_id,
            leftmost: promoted.child,
            entries: upper,
        };
        debug!(
            left = %left.page_id,
            right = %right.page_id,
            "btree.redistribute.internal"
        );
        parent.entries[separator_index].key = promoted.key;
        self.write_node(&Node::Internal(parent.clone()))?;
        self.write_node(&Node::Internal(left))?;
        self.write_node(&Node::Internal(right))?;
        Ok(Rebalance::Done)
    }

    fn separator_fits(
        parent: &InternalNode,
        separator_index: usize,
        new_key: &[u8],
        usable: usize,
    ) -> bool {
        let old_len = parent.entries[separator_index].key.len();
        parent.used_bytes() - old_len + new_key.len() <= usable
    }

    /// Writes the root, collapsing internal roots that are left with a
    /// single child.
    fn finish_root(&self, node: Node) -> Result<()> {
        let mut node = node;
        loop {
            match node {
                Node::Internal(root) if root.entries.is_empty() => {
                    let child = root.leftmost;
                    self.store.free(root.page_id)?;
                    let height = self.store.update_meta(|meta| {
                        meta.root = Some(child);
                        meta.height = meta.height.saturating_sub(1);
                        meta.height
                    });
                    debug!(root = %child, height, "btree.root.shrink");
                    node = self.read_node(child)?;
                    if let Node::Internal(ref next) = node {
                        if !next.entries.is_empty() {
                            return Ok(());
                        }
                    } else {
                        return Ok(());
                    }
                }
                node => return self.write_node(&node),
            }
        }
    }

    /// First non-empty leaf slot.
    pub fn get_first(&self) -> Result<Option<Position>> {
        let (_, leaf_id) = self.descend_by(|_| 0)?;
        self.scan_forward(Some(leaf_id))
    }

    /// Last non-empty leaf slot.
    pub fn get_last(&self) -> Result<Option<Position>> {
        let (_, leaf_id) = self.descend_by(|node| node.num_cells())?;
        self.scan_backward(Some(leaf_id))
    }

    /// Reads the entry at `pos` if `pos` still names a leaf slot. Pages that
    /// were freed or turned into internal pages yield `None`.
    pub fn entry_at(&self, pos: Position) -> Result<Option<KeyValuePair>> {
        let guard = self.store.read(pos.page_id)?;
        match BTreeNodeRef::try_parse(guard.data(), pos.page_id) {
            Ok(node) if node.is_leaf() && pos.slot < node.num_cells() => {
                Ok(Some(node.entry(pos.slot)))
            }
            _ => Ok(None),
        }
    }

    /// Slot after `pos` in key order, crossing to later leaves as needed.
    pub fn next_position(&self, pos: Position) -> Result<Option<Position>> {
        let next = {
            let guard = self.store.read(pos.page_id)?;
            let leaf = self.parse_leaf(guard.data(), pos.page_id)?;
            if pos.slot + 1 < leaf.num_cells() {
                return Ok(Some(Position {
                    page_id: pos.page_id,
                    slot: pos.slot + 1,
                }));
            }
            leaf.next_page_id()
        };
        self.scan_forward(next)
    }

    /// Slot before `pos` in key order, crossing to earlier leaves as needed.
    pub fn prev_position(&self, pos: Position) -> Result<Option<Position>> {
        let prev = {
            let guard = self.store.read(pos.page_id)?;
            let leaf = self.parse_leaf(guard.data(), pos.page_id)?;
            if pos.slot > 0 {
                return Ok(Some(Position {
                    page_id: pos.page_id,
                    slot: (pos.slot - 1).min(leaf.num_cells().saturating_sub(1)),
                }));
            }
            leaf.prev_page_id()
        };
        self.scan_backward(prev)
    }

    /// Positions relative to `key` without requiring it to exist.
    pub fn seek(&self, key: &[u8], bound: SeekBound) -> Result<Option<Position>> {
        let found = self.search(key)?;
        let at = Position {
            page_id: found.page_id,
            slot: found.slot,
        };
        match bound {
            SeekBound::AtOrAfter | SeekBound::After => {
                if found.found && bound == SeekBound::After {
                    return self.next_position(at);
                }
                let (len, next) = {
                    let guard = self.store.read(found.page_id)?;
                    let leaf = self.parse_leaf(guard.data(), found.page_id)?;
                    (leaf.num_cells(), leaf.next_page_id())
                };
                if found.slot < len {
                    Ok(Some(at))
                } else {
                    self.scan_forward(next)
                }
            }
            SeekBound::Before => {
                if found.slot > 0 {
                    return Ok(Some(Position {
                        page_id: found.page_id,
                        slot: found.slot - 1,
                    }));
                }
                let prev = {
                    let guard = self.store.read(found.page_id)?;
                    self.parse_leaf(guard.data(), found.page_id)?.prev_page_id()
                };
                self.scan_backward(prev)
            }
        }
    }

    fn parse_leaf<'a>(&self, data: &'a [u8], page_id: PageId) -> Result<BTreeNodeRef<'a>> {
        let node = BTreeNodeRef::parse(data, page_id)?;
        if !node.is_leaf() {
            return Err(ArborError::corruption(format!(
                "expected a leaf at {}",
                page_id
            )));
        }
        Ok(node)
    }

    /// First slot of the first non-empty leaf starting at `start`.
    fn scan_forward(&self, start: Option<PageId>) -> Result<Option<Position>> {
        self.scan_chain(start, true)
    }

    /// Last slot of the first non-empty leaf walking back from `start`.
    fn scan_backward(&self, start: Option<PageId>) -> Result<Option<Position>> {
        self.scan_chain(start, false)
    }

    fn scan_chain(&self, start: Option<PageId>, forward: bool) -> Result<Option<Position>> {
        let limit = self.store.meta().page_count;
        let mut current = start;
        let mut steps = 0u32;

        while let Some(page_id) = current {
            steps += 1;
            if steps > limit {
                return Err(ArborError::corruption("cycle in the leaf chain"));
            }
            let guard = self.store.read(page_id)?;
            let leaf = self.parse_leaf(guard.data(), page_id)?;
            if leaf.num_cells() > 0 {
                let slot = if forward { 0 } else { leaf.num_cells() - 1 };
                return Ok(Some(Position { page_id, slot }));
            }
            current = if forward {
                leaf.next_page_id()
            } else {
                leaf.prev_page_id()
            };
        }
        Ok(None)
    }

    /// Verifies ordering, separator bounds, equal leaf depth, the leaf
    /// chain and the recorded entry count.
    pub fn check(&self) -> Result<()> {
        let (root, height) = self.root()?;
        let mut walk = CheckWalk {
            visited: HashSet::new(),
            leaves: Vec::new(),
            entries: 0,
        };
        self.check_subtree(root, height, None, None, &mut walk)?;

        for (i, &(page_id, prev, next)) in walk.leaves.iter().enumerate() {
            let expected_prev = i.checked_sub(1).map(|j| walk.leaves[j].0);
            let expected_next = walk.leaves.get(i + 1).map(|leaf| leaf.0);
            if prev != expected_prev || next != expected_next {
                return Err(ArborError::corruption(format!(
                    "leaf {} links ({:?}, {:?}) but neighbours are ({:?}, {:?})",
                    page_id, prev, next, expected_prev, expected_next
                )));
            }
        }

        let recorded = self.store.meta().entry_count;
        if walk.entries != recorded {
            return Err(ArborError::corruption(format!(
                "tree holds {} entries but {} are recorded",
                walk.entries, recorded
            )));
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        level: u32,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        walk: &mut CheckWalk,
    ) -> Result<()> {
        if !walk.visited.insert(page_id) {
            return Err(ArborError::corruption(format!(
                "{} is reachable twice",
                page_id
            )));
        }
        let node = self.read_node(page_id)?;
        let is_leaf = matches!(node, Node::Leaf(_));
        if is_leaf != (level == 1) {
            return Err(ArborError::corruption(format!(
                "{} has the wrong kind for level {}",
                page_id, level
            )));
        }

        let keys: Vec<&Bytes> = match &node {
            Node::Leaf(leaf) => leaf.entries.iter().map(|e| &e.key).collect(),
            Node::Internal(internal) => internal.entries.iter().map(|e| &e.key).collect(),
        };
        for pair in keys.windows(2) {
            if self.cmp().compare(pair[0], pair[1]).is_ge() {
                return Err(ArborError::corruption(format!("{} is not sorted", page_id)));
            }
        }
        for key in &keys {
            let below = lower.is_some_and(|l| self.cmp().compare(key, l).is_lt());
            let above = upper.is_some_and(|u| self.cmp().compare(key, u).is_ge());
            if below || above {
                return Err(ArborError::corruption(format!(
                    "{} holds a key outside its separator bounds",
                    page_id
                )));
            }
        }

        match node {
            Node::Leaf(leaf) => {
                walk.entries += leaf.entries.len() as u64;
                walk.leaves.push((page_id, leaf.prev, leaf.next));
                Ok(())
            }
            Node::Internal(internal) => {
                for index in 0..internal.num_children() {
                    let child_lower = match index {
                        0 => lower,
                        i => Some(internal.entries[i - 1].key.as_ref()),
                    };
                    let child_upper = match internal.entries.get(index) {
                        Some(separator) => Some(separator.key.as_ref()),
                        None => upper,
                    };
                    self.check_subtree(
                        internal.child(index),
                        level - 1,
                        child_lower,
                        child_upper,
                        walk,
                    )?;
                }
                Ok(())
            }
        }
    }
}

struct CheckWalk {
    visited: HashSet<PageId>,
    /// In key order: (page, prev link, next link)
    leaves: Vec<(PageId, Option<PageId>, Option<PageId>)>,
    entries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolManager;
    use crate::common::DbType;
    use crate::index::BytewiseComparator;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn create_index(dir: &TempDir, page_size: usize) -> BTreeIndex {
        let path = dir.path().join("tree.db");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        let pool = Arc::new(BufferPoolManager::new(32, 2));
        let store = PageStore::create(pool, file, path, page_size, DbType::BTree).unwrap();
        BTreeIndex::open(Arc::new(store), Arc::new(BytewiseComparator), 40).unwrap()
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key{:05}", i).into_bytes()
    }

    #[test]
    fn test_empty_tree() {
        let dir = TempDir::new().unwrap();
        let index = create_index(&dir, 512);

        assert_eq!(index.height(), 1);
        assert!(index.is_empty());
        assert_eq!(index.get(b"missing").unwrap(), None);
        assert!(!index.delete(b"missing").unwrap());
        assert_eq!(index.get_first().unwrap(), None);
        assert_eq!(index.get_last().unwrap(), None);
        index.check().unwrap();
    }

    #[test]
    fn test_simple_insert_search() {
        let dir = TempDir::new().unwrap();
        let index = create_index(&dir, 512);

        index.insert(b"b", b"2").unwrap();
        index.insert(b"a", b"1").unwrap();
        index.insert(b"c", b"3").unwrap();

        let found = index.search(b"b").unwrap();
        assert!(found.found);
        assert_eq!(found.slot, 1);
        assert!(!index.search(b"bb").unwrap().found);
        assert_eq!(index.get(b"a").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_replace_keeps_count() {
        let dir = TempDir::new().unwrap();
        let index = create_index(&dir, 512);

        index.insert(b"k", b"old").unwrap();
        index.insert(b"k", b"new").unwrap();
        index.insert(b"k", b"new").unwrap();
        assert_eq!(index.get(b"k").unwrap().as_deref(), Some(&b"new"[..]));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_rejects_bad_entries() {
        let dir = TempDir::new().unwrap();
        let index = create_index(&dir, 512);

        assert!(matches!(index.insert(b"", b"v"), Err(ArborError::InvalidArgument(_))));
        let big = vec![7u8; max_entry_payload(512)];
        assert!(matches!(index.insert(b"k", &big), Err(ArborError::InvalidArgument(_))));
        index.insert(b"k", &big[1..]).unwrap();
    }

    #[test]
    fn test_splits_grow_tree() {
        let dir = TempDir::new().unwrap();
        let index = create_index(&dir, 512);

        for i in 0..500 {
            index.insert(&key(i), format!("value{}", i).as_bytes()).unwrap();
        }
        assert!(index.height() >= 3);
        index.check().unwrap();

        for i in 0..500 {
            let value = index.get(&key(i)).unwrap().unwrap();
            assert_eq!(value.as_ref(), format!("value{}", i).as_bytes());
        }
    }

    #[test]
    fn test_deletes_merge_and_shrink() {
        let dir = TempDir::new().unwrap();
        let index = create_index(&dir, 512);

        for i in 0..400 {
            index.insert(&key(i), b"some value bytes").unwrap();
        }
        let grown = index.height();

        for i in 0..400 {
            if i % 4 != 0 {
                assert!(index.delete(&key(i)).unwrap());
            }
        }
        index.check().unwrap();
        assert_eq!(index.len(), 100);
        assert!(index.height() <= grown);
        assert!(index.store().meta().free_count > 0);

        for i in 0..400 {
            assert_eq!(index.get(&key(i)).unwrap().is_some(), i % 4 == 0);
        }

        for i in (0..400).step_by(4) {
            assert!(index.delete(&key(i)).unwrap());
        }
        index.check().unwrap();
        assert_eq!(index.height(), 1);
        assert!(index.is_empty());
    }

    #[test]
    fn test_positions_walk_in_order() {
        let dir = TempDir::new().unwrap();
        let index = create_index(&dir, 512);
        for i in (0..200).rev() {
            index.insert(&key(i), b"v").unwrap();
        }

        let mut seen = Vec::new();
        let mut pos = index.get_first().unwrap();
        while let Some(p) = pos {
            seen.push(index.entry_at(p).unwrap().unwrap().key);
            pos = index.next_position(p).unwrap();
        }
        assert_eq!(seen.len(), 200);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));

        let mut count = 0;
        let mut pos = index.get_last().unwrap();
        while let Some(p) = pos {
            count += 1;
            pos = index.prev_position(p).unwrap();
        }
        assert_eq!(count, 200);
    }

    #[test]
    fn test_seek_bounds() {
        let dir = TempDir::new().unwrap();
        let index = create_index(&dir, 512);
        for i in (0..100).map(|i| i * 2) {
            index.insert(&key(i), b"v").unwrap();
        }

        let at = |bound, target: u32| {
            index
                .seek(&key(target), bound)
                .unwrap()
                .map(|p| index.entry_at(p).unwrap().unwrap().key)
        };

        assert_eq!(at(SeekBound::AtOrAfter, 10).as_deref(), Some(&key(10)[..]));
        assert_eq!(at(SeekBound::AtOrAfter, 11).as_deref(), Some(&key(12)[..]));
        assert_eq!(at(SeekBound::After, 10).as_deref(), Some(&key(12)[..]));
        assert_eq!(at(SeekBound::Before, 10).as_deref(), Some(&key(8)[..]));
        assert_eq!(at(SeekBound::Before, 0), None);
        assert_eq!(at(SeekBound::AtOrAfter, 199), None);
        assert_eq!(at(SeekBound::After, 198), None);
    }

    #[test]
    fn test_check_detects_bad_count() {
        let dir = TempDir::new().unwrap();
        let index = create_index(&dir, 512);
        index.insert(b"a", b"1").unwrap();
        index.store().update_meta(|meta| meta.entry_count = 5);
        assert!(index.check().unwrap_err().is_corruption());
    }
}
