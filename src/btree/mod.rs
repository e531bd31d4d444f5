//! # B-Tree Engine
//!
//! Copy-on-write B+trees over fixed-size pages. Every database, the
//! free list, the database catalog and each per-key duplicate set is one
//! of these trees; a tree is fully described by its [`TreeInfo`].
//!
//! ## Architecture Overview
//!
//! ```text
//!                    [Branch 9]
//!                   /    |     \
//!           [Leaf 4] [Leaf 7] [Leaf 12]
//! ```
//!
//! There are no sibling links between leaves. A link would force every
//! neighbour of a modified leaf to be copied as well, so cursors walk the
//! tree with an explicit root-to-leaf stack instead.
//!
//! ## Copy-on-Write
//!
//! Pages reachable from a published snapshot are never modified. A write
//! first descends read-only, then *touches* every page on the path from
//! the root down: pages not created by the current transaction are copied
//! to fresh page numbers and the parents are rewired to the copies. The
//! superseded pages are handed to the pager, which records them in the
//! free list under the committing transaction.
//!
//! ## Module Organization
//!
//! - `compare`: the comparator trait and built-in orders
//! - `leaf`: leaf page codec (cells with inline, overflow or nested data)
//! - `interior`: branch page codec (separators and child pointers)
//! - `overflow`: contiguous page runs for large values
//! - `tree`: lookup, insert, split, delete and rebalance
//! - `cursor`: positioned navigation over one tree
//! - `dupsort`: database-level operations, including duplicate sets

pub mod compare;
pub mod cursor;
pub mod dupsort;
pub mod interior;
pub mod leaf;
pub mod overflow;
pub mod tree;

pub use compare::{
    lexicographic, Comparator, FnComparator, Lexicographic, NativeInteger, ReverseBytes,
    SharedComparator,
};
pub use cursor::TreeCursor;
pub use dupsort::{DbTree, TreeOrder};
pub use interior::{InteriorNode, InteriorNodeMut, INTERIOR_SLOT_SIZE};
pub use leaf::{CellFlags, LeafCell, LeafNode, LeafNodeMut, SearchResult};
pub use tree::{BTree, Position};

use crate::PageNo;

/// Shape and statistics of one tree. `root == 0` means the tree is empty
/// (page 0 is a meta page and never a tree page).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeInfo {
    pub root: PageNo,
    pub depth: u16,
    pub leaf_pages: u32,
    pub branch_pages: u32,
    pub overflow_pages: u32,
    pub entries: u64,
}

impl TreeInfo {
    pub fn is_empty(&self) -> bool {
        self.root == 0
    }
}
