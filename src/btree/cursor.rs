//! # Tree Cursor
//!
//! Positioned navigation over one tree. The cursor owns only a stack of
//! `(page, index)` pairs from the root to the current leaf slot; the pages
//! come from whatever [`PageSource`] the caller passes to each operation.
//! This keeps the cursor free of borrows, so it can outlive the
//! transaction that positioned it and be re-bound to a later one.
//!
//! ## Stepping
//!
//! ```text
//! next():  leaf slot + 1
//!          at leaf end: pop until a branch has a child to the right,
//!          take it, then descend along the leftmost edge
//! prev():  mirror image
//! ```
//!
//! A step that runs off either end of the tree reports `false` and leaves
//! the cursor where it was. Empty leaves, which deletes can leave behind
//! under a branch with no room to rebalance, are stepped over.

use smallvec::SmallVec;

use super::compare::Comparator;
use super::interior::InteriorNode;
use super::leaf::{LeafCell, LeafNode};
use super::tree::{cell_at, descend};
use super::TreeInfo;
use crate::config::{MAX_TREE_DEPTH, PATH_INLINE_DEPTH};
use crate::storage::{PageHeader, PageSource, PageType};
use crate::{Error, PageNo, Result};

type CursorStack = SmallVec<[(PageNo, usize); PATH_INLINE_DEPTH]>;

#[derive(Debug, Clone, Default)]
pub struct TreeCursor {
    stack: CursorStack,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Edge {
    First,
    Last,
}

/// Pushes the path from `page_no` down to its first or last leaf slot.
/// Returns false when that leaf is empty.
fn descend_edge<P: PageSource + ?Sized>(
    pager: &P,
    stack: &mut CursorStack,
    mut page_no: PageNo,
    edge: Edge,
) -> Result<bool> {
    loop {
        if stack.len() > MAX_TREE_DEPTH {
            return Err(Error::bad_page(page_no, "tree deeper than supported"));
        }

        let data = pager.page(page_no)?;
        match PageHeader::from_bytes(data)?.page_type() {
            PageType::Branch => {
                let node = InteriorNode::from_page(data)?;
                let idx = match edge {
                    Edge::First => 0,
                    Edge::Last => node.cell_count(),
                };
                stack.push((page_no, idx));
                page_no = node.child_at(idx)?;
            }
            PageType::Leaf => {
                let count = LeafNode::from_page(data)?.cell_count();
                let idx = match edge {
                    Edge::First => 0,
                    Edge::Last => count.saturating_sub(1),
                };
                stack.push((page_no, idx));
                return Ok(count > 0);
            }
            other => {
                return Err(Error::bad_page(
                    page_no,
                    format!("unexpected {other:?} page inside a tree"),
                ))
            }
        }
    }
}

fn leaf_count<P: PageSource + ?Sized>(pager: &P, page_no: PageNo) -> Result<usize> {
    Ok(LeafNode::from_page(pager.page(page_no)?)?.cell_count())
}

/// Moves past the end of the current leaf to the first slot of the next
/// non-empty leaf.
fn step_right<P: PageSource + ?Sized>(pager: &P, stack: &mut CursorStack) -> Result<bool> {
    loop {
        stack.pop();
        let Some(&(page_no, idx)) = stack.last() else {
            return Ok(false);
        };

        let node = InteriorNode::from_page(pager.page(page_no)?)?;
        if idx < node.cell_count() {
            let child = node.child_at(idx + 1)?;
            if let Some(top) = stack.last_mut() {
                top.1 = idx + 1;
            }
            if descend_edge(pager, stack, child, Edge::First)? {
                return Ok(true);
            }
        }
    }
}

fn step_left<P: PageSource + ?Sized>(pager: &P, stack: &mut CursorStack) -> Result<bool> {
    loop {
        stack.pop();
        let Some(&(page_no, idx)) = stack.last() else {
            return Ok(false);
        };

        if idx > 0 {
            let child = InteriorNode::from_page(pager.page(page_no)?)?.child_at(idx - 1)?;
            if let Some(top) = stack.last_mut() {
                top.1 = idx - 1;
            }
            if descend_edge(pager, stack, child, Edge::Last)? {
                return Ok(true);
            }
        }
    }
}

impl TreeCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_positioned(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn reset(&mut self) {
        self.stack.clear();
    }

    /// Current leaf page and slot.
    pub fn leaf_slot(&self) -> Option<(PageNo, usize)> {
        self.stack.last().copied()
    }

    pub fn first<P: PageSource + ?Sized>(&mut self, pager: &P, info: &TreeInfo) -> Result<bool> {
        self.edge(pager, info, Edge::First)
    }

    pub fn last<P: PageSource + ?Sized>(&mut self, pager: &P, info: &TreeInfo) -> Result<bool> {
        self.edge(pager, info, Edge::Last)
    }

    fn edge<P: PageSource + ?Sized>(
        &mut self,
        pager: &P,
        info: &TreeInfo,
        edge: Edge,
    ) -> Result<bool> {
        self.stack.clear();
        if info.is_empty() {
            return Ok(false);
        }

        let mut stack = CursorStack::new();
        let found = descend_edge(pager, &mut stack, info.root, edge)?
            || match edge {
                Edge::First => step_right(pager, &mut stack)?,
                Edge::Last => step_left(pager, &mut stack)?,
            };

        if found {
            self.stack = stack;
        }
        Ok(found)
    }

    /// Positions at the first entry whose key is `>= key`.
    pub fn seek<P: PageSource + ?Sized>(
        &mut self,
        pager: &P,
        info: &TreeInfo,
        cmp: &dyn Comparator,
        key: &[u8],
    ) -> Result<bool> {
        self.stack.clear();
        let Some(pos) = descend(pager, info, cmp, key)? else {
            return Ok(false);
        };

        let mut stack: CursorStack = pos.path.iter().copied().collect();
        let index = pos.index();
        stack.push((pos.leaf, index));

        let found = index < leaf_count(pager, pos.leaf)? || step_right(pager, &mut stack)?;
        if found {
            self.stack = stack;
        }
        Ok(found)
    }

    /// Steps to the next entry. Returns false at the end of the tree,
    /// leaving the position unchanged.
    pub fn next<P: PageSource + ?Sized>(&mut self, pager: &P) -> Result<bool> {
        let Some(&(leaf, idx)) = self.stack.last() else {
            return Ok(false);
        };

        if idx + 1 < leaf_count(pager, leaf)? {
            if let Some(top) = self.stack.last_mut() {
                top.1 = idx + 1;
            }
            return Ok(true);
        }

        let mut stack = self.stack.clone();
        let moved = step_right(pager, &mut stack)?;
        if moved {
            self.stack = stack;
        }
        Ok(moved)
    }

    pub fn prev<P: PageSource + ?Sized>(&mut self, pager: &P) -> Result<bool> {
        let Some(&(_, idx)) = self.stack.last() else {
            return Ok(false);
        };

        if idx > 0 {
            if let Some(top) = self.stack.last_mut() {
                top.1 = idx - 1;
            }
            return Ok(true);
        }

        let mut stack = self.stack.clone();
        let moved = step_left(pager, &mut stack)?;
        if moved {
            self.stack = stack;
        }
        Ok(moved)
    }

    pub fn cell<'p, P: PageSource + ?Sized>(&self, pager: &'p P) -> Result<LeafCell<'p>> {
        let (leaf, idx) = self.leaf_slot().ok_or(Error::NotFound)?;
        cell_at(pager, leaf, idx)
    }
}
