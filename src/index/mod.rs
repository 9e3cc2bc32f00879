pub mod btree_index;
pub mod btree_page;
pub mod key_comparator;

pub use btree_index::{BTreeIndex, Position, SearchResult, SeekBound};
pub use btree_page::{
    max_entry_payload, BTreeNode, BTreeNodeRef, InternalNode, KeyValuePair, LeafNode, Node,
    Separator,
};
pub use key_comparator::{BytewiseComparator, KeyComparator};
