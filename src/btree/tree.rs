//! # B+Tree Implementation
//!
//! Lookup, insert, update and delete over one copy-on-write tree.
//!
//! ## Read Path
//!
//! [`descend`] walks from the root to the leaf responsible for a key with a
//! comparator-driven binary search per page and returns a [`Position`]: the
//! branch pages visited, the child index taken at each, and the leaf search
//! result. It works on any [`PageSource`], so readers and the writer share it.
//!
//! ## Write Path
//!
//! [`BTree`] mutates a tree through a [`PageSink`]. Every mutation takes a
//! `Position` produced by a read-only descent, touches the path (copying
//! pages that belong to an older snapshot) and then edits the leaf.
//!
//! ```text
//! descend (read-only) -> touch_path (COW root..leaf) -> edit leaf
//!                                                      |
//!                           split / rebalance upwards <-+
//! ```
//!
//! ## Node Splitting
//!
//! When a cell does not fit, the leaf's cells plus the new one are copied
//! into a per-split `bumpalo` arena and divided by bytes so both halves fit.
//! An insert past the last key of the rightmost leaf instead moves only the
//! new cell to the new page, which keeps sequential loads densely packed.
//! The first key of the right page becomes the separator in the parent;
//! parents split the same way and a root split adds a level.
//!
//! ## Delete and Rebalance
//!
//! A node whose content falls below `FILL_THRESHOLD_PERCENT` of its body is
//! repaired against one sibling (left if it has one, else right):
//!
//! 1. Borrow entries one at a time while the sibling stays above the
//!    threshold and the parent can hold the new separator.
//! 2. Otherwise merge the two when their content fits in one page, and
//!    continue with the parent, which lost a separator.
//! 3. Otherwise leave the node under-filled.
//!
//! An empty leaf root empties the tree; a branch root without separators is
//! replaced by its only child, lowering the tree by one level.

use bumpalo::collections::{CollectIn, Vec as BumpVec};
use bumpalo::Bump;
use log::trace;
use smallvec::SmallVec;

use super::compare::Comparator;
use super::interior::{InteriorNode, InteriorNodeMut, INTERIOR_SLOT_SIZE};
use super::leaf::{cell_size, encode_cell, CellFlags, LeafCell, LeafNode, LeafNodeMut, SearchResult};
use super::overflow;
use super::TreeInfo;
use crate::config::{
    max_inline_cell, max_key_size, page_body_size, FILL_THRESHOLD_PERCENT, LEAF_SLOT_SIZE,
    MAX_TREE_DEPTH, PATH_INLINE_DEPTH,
};
use crate::storage::{decode_db_state, PageHeader, PageSink, PageSource, PageType, DB_RECORD_SIZE};
use crate::{Error, PageNo, Result};

/// Branch pages from the root down, with the child index taken at each.
pub type PathStack = SmallVec<[(PageNo, usize); PATH_INLINE_DEPTH]>;

/// Where a key lives, or where it would be inserted.
#[derive(Debug, Clone)]
pub struct Position {
    pub path: PathStack,
    pub leaf: PageNo,
    pub result: SearchResult,
    /// The key sorts after every key in the tree.
    pub past_end: bool,
}

impl Position {
    pub fn index(&self) -> usize {
        self.result.index()
    }

    pub fn found(&self) -> bool {
        matches!(self.result, SearchResult::Found(_))
    }
}

/// Value stored under a key.
#[derive(Debug, Clone, Copy)]
pub enum CellData<'v> {
    /// User bytes, moved to an overflow run when too large for the leaf.
    Value(&'v [u8]),
    /// Record of the nested tree holding a key's duplicates.
    Nested(&'v [u8; DB_RECORD_SIZE]),
}

pub(crate) fn page_type<P: PageSource + ?Sized>(pager: &P, page_no: PageNo) -> Result<PageType> {
    Ok(PageHeader::from_bytes(pager.page(page_no)?)?.page_type())
}

/// Descends to the leaf responsible for `key`. `None` for an empty tree.
pub fn descend<P: PageSource + ?Sized>(
    pager: &P,
    info: &TreeInfo,
    cmp: &dyn Comparator,
    key: &[u8],
) -> Result<Option<Position>> {
    if info.is_empty() {
        return Ok(None);
    }

    let mut path = PathStack::new();
    let mut page_no = info.root;
    let mut rightmost = true;

    loop {
        let data = pager.page(page_no)?;
        match PageHeader::from_bytes(data)?.page_type() {
            PageType::Branch => {
                if path.len() >= MAX_TREE_DEPTH {
                    return Err(Error::bad_page(page_no, "tree deeper than supported"));
                }
                let node = InteriorNode::from_page(data)?;
                let idx = node.find_child(key, cmp)?;
                rightmost &= idx == node.cell_count();
                path.push((page_no, idx));
                page_no = node.child_at(idx)?;
            }
            PageType::Leaf => {
                let node = LeafNode::from_page(data)?;
                let result = node.search(key, cmp)?;
                let past_end = rightmost
                    && matches!(result, SearchResult::NotFound(i) if i == node.cell_count());
                return Ok(Some(Position {
                    path,
                    leaf: page_no,
                    result,
                    past_end,
                }));
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

/// Exact-match lookup returning the raw cell.
pub fn get<'p, P: PageSource + ?Sized>(
    pager: &'p P,
    info: &TreeInfo,
    cmp: &dyn Comparator,
    key: &[u8],
) -> Result<Option<LeafCell<'p>>> {
    let Some(pos) = descend(pager, info, cmp, key)? else {
        return Ok(None);
    };
    if !pos.found() {
        return Ok(None);
    }
    Ok(Some(LeafNode::from_page(pager.page(pos.leaf)?)?.cell_at(pos.index())?))
}

pub fn cell_at<'p, P: PageSource + ?Sized>(
    pager: &'p P,
    leaf: PageNo,
    index: usize,
) -> Result<LeafCell<'p>> {
    Ok(LeafNode::from_page(pager.page(leaf)?)?.cell_at(index)?)
}

/// The user value of a cell, following overflow runs.
pub fn cell_value<'p, P: PageSource + ?Sized>(
    pager: &'p P,
    cell: &LeafCell<'p>,
) -> Result<&'p [u8]> {
    match cell.overflow_page() {
        Some(page_no) => overflow::read_run(pager, page_no, cell.data_len as usize),
        None => Ok(cell.data),
    }
}

fn inline_fits(key_len: usize, value_len: usize, page_size: usize) -> bool {
    cell_size(key_len, value_len) + LEAF_SLOT_SIZE <= max_inline_cell(page_size)
}

/// Bytes of slots and live cells, and the body size.
fn usage(data: &[u8]) -> Result<(usize, usize)> {
    let (header, body) = PageHeader::split(data)?;
    let content = body.len().saturating_sub(header.free_end() as usize);
    let used = (header.free_start() as usize + content).saturating_sub(header.frag_bytes() as usize);
    Ok((used, body.len()))
}

fn below_threshold(used: usize, body: usize) -> bool {
    used * 100 < body * FILL_THRESHOLD_PERCENT
}

/// Index that divides entries of the given sizes into two runs that each
/// fit `capacity`, as evenly as possible.
fn split_point(sizes: &[usize], capacity: usize) -> usize {
    let n = sizes.len();
    let total: usize = sizes.iter().sum();

    let mut mid = 0;
    let mut left = 0;
    while mid < n && left < total / 2 {
        left += sizes[mid];
        mid += 1;
    }

    mid = mid.clamp(1, n - 1);
    left = sizes[..mid].iter().sum();
    while mid > 1 && left > capacity {
        mid -= 1;
        left -= sizes[mid];
    }
    while mid < n - 1 && total - left > capacity {
        left += sizes[mid];
        mid += 1;
    }
    mid
}

/// Write access to one tree.
pub struct BTree<'a, P: PageSink + ?Sized> {
    pager: &'a mut P,
    info: &'a mut TreeInfo,
    cmp: &'a dyn Comparator,
}

impl<'a, P: PageSink + ?Sized> BTree<'a, P> {
    pub fn new(pager: &'a mut P, info: &'a mut TreeInfo, cmp: &'a dyn Comparator) -> Self {
        Self { pager, info, cmp }
    }

    pub fn info(&self) -> &TreeInfo {
        &*self.info
    }

    pub fn pager(&mut self) -> &mut P {
        self.pager
    }

    pub fn seek(&self, key: &[u8]) -> Result<Option<Position>> {
        descend(&*self.pager, &*self.info, self.cmp, key)
    }

    pub fn cell(&self, pos: &Position) -> Result<LeafCell<'_>> {
        cell_at(&*self.pager, pos.leaf, pos.index())
    }

    /// Inserts or replaces `key`. Returns true if the key was new.
    pub fn put(&mut self, key: &[u8], data: CellData<'_>) -> Result<bool> {
        match self.seek(key)? {
            Some(pos) if pos.found() => {
                self.replace(pos, key, data)?;
                Ok(false)
            }
            pos => {
                self.insert(pos, key, data)?;
                Ok(true)
            }
        }
    }

    /// Removes `key` if present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        match self.seek(key)? {
            Some(pos) if pos.found() => {
                self.remove(pos)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Inserts a key that `pos` reported as absent.
    pub fn insert(&mut self, pos: Option<Position>, key: &[u8], data: CellData<'_>) -> Result<()> {
        self.check_key(key)?;
        if pos.as_ref().is_some_and(Position::found) {
            return Err(Error::KeyExists);
        }
        let cell = self.build_cell(key, data)?;

        let Some(mut pos) = pos else {
            let root = self.pager.allocate(1)?;
            LeafNodeMut::init(self.pager.page_mut(root)?)?.insert_raw(0, &cell)?;
            *self.info = TreeInfo {
                root,
                depth: 1,
                leaf_pages: 1,
                entries: 1,
                overflow_pages: self.info.overflow_pages,
                branch_pages: 0,
            };
            return Ok(());
        };

        self.touch_path(&mut pos)?;
        self.insert_cell(pos, &cell)?;
        self.info.entries += 1;
        Ok(())
    }

    /// Replaces the data of the key found at `pos`.
    pub fn replace(&mut self, mut pos: Position, key: &[u8], data: CellData<'_>) -> Result<()> {
        if !pos.found() {
            return Err(Error::NotFound);
        }
        self.check_key(key)?;
        self.touch_path(&mut pos)?;

        let index = pos.index();
        let (old_flags, old_stored, old_run) = {
            let cell = cell_at(&*self.pager, pos.leaf, index)?;
            (cell.flags, cell.data.len(), cell.overflow_page())
        };

        let page_size = self.pager.page_size();
        match (data, old_run) {
            (CellData::Value(value), Some(run)) if !inline_fits(key.len(), value.len(), page_size) => {
                let (fresh, delta) = overflow::replace_run(&mut *self.pager, run, value)?;
                self.adjust_overflow(delta);
                LeafNodeMut::from_page(self.pager.page_mut(pos.leaf)?)?.overwrite_data(
                    index,
                    value.len() as u32,
                    &fresh.to_le_bytes(),
                )?;
                return Ok(());
            }
            (CellData::Value(value), None)
                if old_flags.is_empty()
                    && old_stored == value.len()
                    && inline_fits(key.len(), value.len(), page_size) =>
            {
                LeafNodeMut::from_page(self.pager.page_mut(pos.leaf)?)?.overwrite_data(
                    index,
                    value.len() as u32,
                    value,
                )?;
                return Ok(());
            }
            (CellData::Nested(record), None) if old_flags == CellFlags::DUPDATA => {
                LeafNodeMut::from_page(self.pager.page_mut(pos.leaf)?)?.overwrite_data(
                    index,
                    DB_RECORD_SIZE as u32,
                    record,
                )?;
                return Ok(());
            }
            _ => {}
        }

        if let Some(run) = old_run {
            let freed = overflow::free_run(&mut *self.pager, run)?;
            self.adjust_overflow(-(freed as i64));
        }
        LeafNodeMut::from_page(self.pager.page_mut(pos.leaf)?)?.delete_cell(index)?;

        let cell = self.build_cell(key, data)?;
        pos.result = SearchResult::NotFound(index);
        self.insert_cell(pos, &cell)
    }

    /// Removes the entry found at `pos`. Nested duplicate trees are the
    /// caller's to free; overflow runs are freed here.
    pub fn remove(&mut self, mut pos: Position) -> Result<()> {
        if !pos.found() {
            return Err(Error::NotFound);
        }
        self.touch_path(&mut pos)?;

        let index = pos.index();
        if let Some(run) = cell_at(&*self.pager, pos.leaf, index)?.overflow_page() {
            let freed = overflow::free_run(&mut *self.pager, run)?;
            self.adjust_overflow(-(freed as i64));
        }

        LeafNodeMut::from_page(self.pager.page_mut(pos.leaf)?)?.delete_cell(index)?;
        self.info.entries = self.info.entries.saturating_sub(1);
        self.rebalance(pos.path, pos.leaf)
    }

    /// Frees every page of the tree and leaves it empty.
    pub fn drop_tree(&mut self) -> Result<()> {
        if !self.info.is_empty() {
            self.free_subtree(self.info.root, 0)?;
        }
        *self.info = TreeInfo::default();
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        let max = max_key_size(self.pager.page_size());
        if key.len() > max {
            return Err(Error::KeyTooLarge {
                size: key.len(),
                max,
            });
        }
        Ok(())
    }

    fn adjust_overflow(&mut self, delta: i64) {
        self.info.overflow_pages = (self.info.overflow_pages as i64 + delta).max(0) as u32;
    }

    fn build_cell(&mut self, key: &[u8], data: CellData<'_>) -> Result<Vec<u8>> {
        let mut cell = Vec::new();
        match data {
            CellData::Value(value) => {
                let len = u32::try_from(value.len())
                    .map_err(|_| Error::Incompatible(format!("value of {} bytes", value.len())))?;
                if inline_fits(key.len(), value.len(), self.pager.page_size()) {
                    encode_cell(&mut cell, CellFlags::empty(), key, len, value);
                } else {
                    let run = overflow::write_run(&mut *self.pager, value)?;
                    self.info.overflow_pages +=
                        overflow::pages_needed(value.len(), self.pager.page_size());
                    encode_cell(&mut cell, CellFlags::BIGDATA, key, len, &run.to_le_bytes());
                }
            }
            CellData::Nested(record) => {
                encode_cell(&mut cell, CellFlags::DUPDATA, key, DB_RECORD_SIZE as u32, record);
            }
        }
        Ok(cell)
    }

    /// Makes every page on the path writable, rewiring parents to copies.
    fn touch_path(&mut self, pos: &mut Position) -> Result<()> {
        let depth = pos.path.len();
        let mut parent: Option<(PageNo, usize)> = None;

        for level in 0..=depth {
            let page_no = if level < depth {
                pos.path[level].0
            } else {
                pos.leaf
            };

            let fresh = self.pager.touch(page_no)?;
            if fresh != page_no {
                match parent {
                    None => self.info.root = fresh,
                    Some((parent_no, idx)) => self.set_child(parent_no, idx, fresh)?,
                }
                if level < depth {
                    pos.path[level].0 = fresh;
                } else {
                    pos.leaf = fresh;
                }
            }

            if level < depth {
                parent = Some((fresh, pos.path[level].1));
            }
        }

        Ok(())
    }

    fn set_child(&mut self, parent: PageNo, index: usize, child: PageNo) -> Result<()> {
        InteriorNodeMut::from_page(self.pager.page_mut(parent)?)?.set_child(index, child)?;
        Ok(())
    }

    fn insert_cell(&mut self, pos: Position, cell: &[u8]) -> Result<()> {
        let index = pos.index();
        {
            let mut node = LeafNodeMut::from_page(self.pager.page_mut(pos.leaf)?)?;
            if node.fits(cell.len()) {
                node.insert_raw(index, cell)?;
                return Ok(());
            }
        }

        let (separator, right) = self.split_leaf(pos.leaf, index, cell, pos.past_end)?;
        self.propagate_split(pos.path, separator, pos.leaf, right)
    }

    fn split_leaf(
        &mut self,
        page_no: PageNo,
        index: usize,
        cell: &[u8],
        append: bool,
    ) -> Result<(Vec<u8>, PageNo)> {
        let arena = Bump::new();
        let mut cells: BumpVec<&[u8]> = BumpVec::new_in(&arena);

        {
            let node = LeafNode::from_page(self.pager.page(page_no)?)?;
            for i in 0..node.cell_count() {
                cells.push(arena.alloc_slice_copy(node.raw_cell(i)?));
            }
        }
        cells.insert(index, arena.alloc_slice_copy(cell));

        let body = page_body_size(self.pager.page_size());
        let mid = if append && index == cells.len() - 1 {
            index
        } else {
            let sizes: BumpVec<usize> = cells
                .iter()
                .map(|c| c.len() + LEAF_SLOT_SIZE)
                .collect_in(&arena);
            split_point(&sizes, body)
        };

        let right = self.pager.allocate(1)?;

        {
            let mut node = LeafNodeMut::init(self.pager.page_mut(page_no)?)?;
            for (i, c) in cells[..mid].iter().enumerate() {
                node.insert_raw(i, c)?;
            }
        }

        let separator = {
            let mut node = LeafNodeMut::init(self.pager.page_mut(right)?)?;
            for (i, c) in cells[mid..].iter().enumerate() {
                node.insert_raw(i, c)?;
            }
            node.as_ref().key_at(0)?.to_vec()
        };

        self.info.leaf_pages += 1;
        trace!(
            "split leaf {} into {} at {} of {} cells",
            page_no,
            right,
            mid,
            cells.len()
        );
        Ok((separator, right))
    }

    fn propagate_split(
        &mut self,
        mut path: PathStack,
        separator: Vec<u8>,
        left: PageNo,
        right: PageNo,
    ) -> Result<()> {
        let mut separator = separator;
        let mut left = left;
        let mut right = right;

        while let Some((parent, index)) = path.pop() {
            {
                let mut node = InteriorNodeMut::from_page(self.pager.page_mut(parent)?)?;
                if node.fits(separator.len()) {
                    node.insert_split(index, &separator, left, right)?;
                    return Ok(());
                }
            }

            let (promoted, new_right) = self.split_branch(parent, index, &separator, left, right)?;
            separator = promoted;
            left = parent;
            right = new_right;
        }

        let root = self.pager.allocate(1)?;
        InteriorNodeMut::init(self.pager.page_mut(root)?, right)?.insert_separator(
            0,
            &separator,
            left,
        )?;
        self.info.root = root;
        self.info.depth += 1;
        self.info.branch_pages += 1;
        trace!("new root {} at depth {}", root, self.info.depth);
        Ok(())
    }

    fn split_branch(
        &mut self,
        page_no: PageNo,
        index: usize,
        separator: &[u8],
        left: PageNo,
        right: PageNo,
    ) -> Result<(Vec<u8>, PageNo)> {
        let arena = Bump::new();
        let mut keys: BumpVec<&[u8]> = BumpVec::new_in(&arena);
        let mut children: BumpVec<PageNo> = BumpVec::new_in(&arena);

        {
            let node = InteriorNode::from_page(self.pager.page(page_no)?)?;
            for i in 0..node.cell_count() {
                keys.push(arena.alloc_slice_copy(node.key_at(i)?));
                children.push(node.child_at(i)?);
            }
            children.push(node.right_child());
        }

        keys.insert(index, arena.alloc_slice_copy(separator));
        children[index] = left;
        children.insert(index + 1, right);

        let sizes: BumpVec<usize> = keys
            .iter()
            .map(|k| k.len() + INTERIOR_SLOT_SIZE)
            .collect_in(&arena);
        let body = page_body_size(self.pager.page_size());
        let count = keys.len();
        let promote = split_point(&sizes, body).min(count.saturating_sub(2)).max(1);

        {
            let mut node = InteriorNodeMut::init(self.pager.page_mut(page_no)?, children[promote])?;
            for i in 0..promote {
                node.insert_separator(i, keys[i], children[i])?;
            }
        }

        let new_right = self.pager.allocate(1)?;
        {
            let mut node = InteriorNodeMut::init(self.pager.page_mut(new_right)?, children[count])?;
            for (slot, i) in (promote + 1..count).enumerate() {
                node.insert_separator(slot, keys[i], children[i])?;
            }
        }

        self.info.branch_pages += 1;
        trace!("split branch {} into {} promoting key {}", page_no, new_right, promote);
        Ok((keys[promote].to_vec(), new_right))
    }

    fn rebalance(&mut self, mut path: PathStack, mut page_no: PageNo) -> Result<()> {
        loop {
            let Some(&(parent, index)) = path.last() else {
                return self.collapse_root();
            };

            let (used, body) = usage(self.pager.page(page_no)?)?;
            if !below_threshold(used, body) {
                return Ok(());
            }

            let separators = InteriorNode::from_page(self.pager.page(parent)?)?.cell_count();
            if separators > 0 && !self.fix_underflow(parent, index, page_no)? {
                return Ok(());
            }

            path.pop();
            page_no = parent;
        }
    }

    /// Repairs child `index` of `parent`. Returns true when it was merged,
    /// leaving the parent one separator shorter.
    fn fix_underflow(&mut self, parent: PageNo, index: usize, page_no: PageNo) -> Result<bool> {
        let from_left = index > 0;
        let (sibling_index, sep_index) = if from_left {
            (index - 1, index - 1)
        } else {
            (index + 1, index)
        };

        let sibling = InteriorNode::from_page(self.pager.page(parent)?)?.child_at(sibling_index)?;
        let sibling_fresh = self.pager.touch(sibling)?;
        if sibling_fresh != sibling {
            self.set_child(parent, sibling_index, sibling_fresh)?;
        }
        let sibling = sibling_fresh;

        let is_leaf = page_type(&*self.pager, page_no)? == PageType::Leaf;
        let borrowed = if is_leaf {
            self.borrow_leaf(parent, sep_index, page_no, sibling, from_left)?
        } else {
            self.borrow_branch(parent, sep_index, page_no, sibling, from_left)?
        };
        if borrowed {
            return Ok(false);
        }

        let (left, right) = if from_left {
            (sibling, page_no)
        } else {
            (page_no, sibling)
        };
        if is_leaf {
            self.merge_leaves(parent, sep_index, left, right)
        } else {
            self.merge_branches(parent, sep_index, left, right)
        }
    }

    fn borrow_leaf(
        &mut self,
        parent: PageNo,
        sep_index: usize,
        page_no: PageNo,
        sibling: PageNo,
        from_left: bool,
    ) -> Result<bool> {
        let mut moved = 0;

        loop {
            let (used, body) = usage(self.pager.page(page_no)?)?;
            if !below_threshold(used, body) {
                break;
            }

            let (cell, separator) = {
                let donor = LeafNode::from_page(self.pager.page(sibling)?)?;
                let count = donor.cell_count();
                if count < 2 {
                    break;
                }
                let take = if from_left { count - 1 } else { 0 };
                let cell = donor.raw_cell(take)?.to_vec();
                let after = donor.used_bytes() - cell.len() - LEAF_SLOT_SIZE;
                if below_threshold(after, donor.body_size()) {
                    break;
                }
                let separator = if from_left {
                    donor.key_at(take)?.to_vec()
                } else {
                    donor.key_at(1)?.to_vec()
                };
                (cell, separator)
            };

            let fits = LeafNodeMut::from_page(self.pager.page_mut(page_no)?)?.fits(cell.len());
            if !fits
                || !InteriorNodeMut::from_page(self.pager.page_mut(parent)?)?
                    .can_replace(sep_index, separator.len())?
            {
                break;
            }

            {
                let mut donor = LeafNodeMut::from_page(self.pager.page_mut(sibling)?)?;
                let take = if from_left { donor.cell_count() - 1 } else { 0 };
                donor.delete_cell(take)?;
            }
            {
                let mut node = LeafNodeMut::from_page(self.pager.page_mut(page_no)?)?;
                let at = if from_left { 0 } else { node.cell_count() };
                node.insert_raw(at, &cell)?;
            }
            InteriorNodeMut::from_page(self.pager.page_mut(parent)?)?
                .replace_separator(sep_index, &separator)?;
            moved += 1;
        }

        if moved > 0 {
            trace!("leaf {} borrowed {} cells from {}", page_no, moved, sibling);
        }
        Ok(moved > 0)
    }

    fn borrow_branch(
        &mut self,
        parent: PageNo,
        sep_index: usize,
        page_no: PageNo,
        sibling: PageNo,
        from_left: bool,
    ) -> Result<bool> {
        let mut moved = 0;

        loop {
            let (used, body) = usage(self.pager.page(page_no)?)?;
            if !below_threshold(used, body) {
                break;
            }

            let down = InteriorNode::from_page(self.pager.page(parent)?)?
                .key_at(sep_index)?
                .to_vec();

            let (up, child, donor_index) = {
                let donor = InteriorNode::from_page(self.pager.page(sibling)?)?;
                let count = donor.cell_count();
                if count < 2 {
                    break;
                }
                let donor_index = if from_left { count - 1 } else { 0 };
                let up = donor.key_at(donor_index)?.to_vec();
                let after = donor.used_bytes() - up.len() - INTERIOR_SLOT_SIZE;
                if below_threshold(after, donor.body_size()) {
                    break;
                }
                let child = if from_left {
                    donor.right_child()
                } else {
                    donor.child_at(0)?
                };
                (up, child, donor_index)
            };

            let fits = InteriorNodeMut::from_page(self.pager.page_mut(page_no)?)?.fits(down.len());
            if !fits
                || !InteriorNodeMut::from_page(self.pager.page_mut(parent)?)?
                    .can_replace(sep_index, up.len())?
            {
                break;
            }

            {
                let mut donor = InteriorNodeMut::from_page(self.pager.page_mut(sibling)?)?;
                if from_left {
                    let new_right = donor.as_ref().child_at(donor_index)?;
                    donor.delete_separator(donor_index)?;
                    donor.set_right_child(new_right);
                } else {
                    donor.delete_separator(0)?;
                }
            }
            {
                let mut node = InteriorNodeMut::from_page(self.pager.page_mut(page_no)?)?;
                if from_left {
                    node.insert_separator(0, &down, child)?;
                } else {
                    let count = node.cell_count();
                    let old_right = node.as_ref().right_child();
                    node.insert_separator(count, &down, old_right)?;
                    node.set_right_child(child);
                }
            }
            InteriorNodeMut::from_page(self.pager.page_mut(parent)?)?
                .replace_separator(sep_index, &up)?;
            moved += 1;
        }

        if moved > 0 {
            trace!("branch {} borrowed {} keys from {}", page_no, moved, sibling);
        }
        Ok(moved > 0)
    }

    fn merge_leaves(
        &mut self,
        parent: PageNo,
        sep_index: usize,
        left: PageNo,
        right: PageNo,
    ) -> Result<bool> {
        let arena = Bump::new();
        let mut cells: BumpVec<&[u8]> = BumpVec::new_in(&arena);

        {
            let (left_used, body) = usage(self.pager.page(left)?)?;
            let node = LeafNode::from_page(self.pager.page(right)?)?;
            if left_used + node.used_bytes() > body {
                return Ok(false);
            }
            for i in 0..node.cell_count() {
                cells.push(arena.alloc_slice_copy(node.raw_cell(i)?));
            }
        }

        {
            let mut node = LeafNodeMut::from_page(self.pager.page_mut(left)?)?;
            let base = node.cell_count();
            for (i, c) in cells.iter().enumerate() {
                node.insert_raw(base + i, c)?;
            }
        }

        self.pager.release(right, 1)?;
        InteriorNodeMut::from_page(self.pager.page_mut(parent)?)?.remove_merged(sep_index)?;
        self.info.leaf_pages = self.info.leaf_pages.saturating_sub(1);
        trace!("merged leaf {} into {}", right, left);
        Ok(true)
    }

    fn merge_branches(
        &mut self,
        parent: PageNo,
        sep_index: usize,
        left: PageNo,
        right: PageNo,
    ) -> Result<bool> {
        let arena = Bump::new();
        let mut keys: BumpVec<&[u8]> = BumpVec::new_in(&arena);
        let mut children: BumpVec<PageNo> = BumpVec::new_in(&arena);

        let down = InteriorNode::from_page(self.pager.page(parent)?)?
            .key_at(sep_index)?
            .to_vec();

        let right_child = {
            let (left_used, body) = usage(self.pager.page(left)?)?;
            let node = InteriorNode::from_page(self.pager.page(right)?)?;
            if left_used + node.used_bytes() + down.len() + INTERIOR_SLOT_SIZE > body {
                return Ok(false);
            }
            for i in 0..node.cell_count() {
                keys.push(arena.alloc_slice_copy(node.key_at(i)?));
                children.push(node.child_at(i)?);
            }
            node.right_child()
        };

        {
            let mut node = InteriorNodeMut::from_page(self.pager.page_mut(left)?)?;
            let base = node.cell_count();
            let old_right = node.as_ref().right_child();
            node.insert_separator(base, &down, old_right)?;
            for (i, (key, child)) in keys.iter().zip(children.iter()).enumerate() {
                node.insert_separator(base + 1 + i, key, *child)?;
            }
            node.set_right_child(right_child);
        }

        self.pager.release(right, 1)?;
        InteriorNodeMut::from_page(self.pager.page_mut(parent)?)?.remove_merged(sep_index)?;
        self.info.branch_pages = self.info.branch_pages.saturating_sub(1);
        trace!("merged branch {} into {}", right, left);
        Ok(true)
    }

    fn collapse_root(&mut self) -> Result<()> {
        loop {
            let root = self.info.root;
            if root == 0 {
                return Ok(());
            }

            let data = self.pager.page(root)?;
            match PageHeader::from_bytes(data)?.page_type() {
                PageType::Leaf => {
                    if LeafNode::from_page(data)?.cell_count() == 0 {
                        self.pager.release(root, 1)?;
                        self.info.root = 0;
                        self.info.depth = 0;
                        self.info.leaf_pages = 0;
                    }
                    return Ok(());
                }
                PageType::Branch => {
                    let node = InteriorNode::from_page(data)?;
                    if node.cell_count() > 0 {
                        return Ok(());
                    }
                    let child = node.right_child();
                    self.pager.release(root, 1)?;
                    self.info.root = child;
                    self.info.depth = self.info.depth.saturating_sub(1);
                    self.info.branch_pages = self.info.branch_pages.saturating_sub(1);
                    trace!("root collapsed into {}", child);
                }
                other => {
                    return Err(Error::bad_page(root, format!("unexpected {other:?} root")));
                }
            }
        }
    }

    fn free_subtree(&mut self, page_no: PageNo, depth: usize) -> Result<()> {
        if depth > MAX_TREE_DEPTH {
            return Err(Error::bad_page(page_no, "tree deeper than supported"));
        }

        let data = self.pager.page(page_no)?;
        match PageHeader::from_bytes(data)?.page_type() {
            PageType::Branch => {
                let node = InteriorNode::from_page(data)?;
                let children = (0..=node.cell_count())
                    .map(|i| node.child_at(i))
                    .collect::<eyre::Result<Vec<_>>>()?;
                for child in children {
                    self.free_subtree(child, depth + 1)?;
                }
            }
            PageType::Leaf => {
                let node = LeafNode::from_page(data)?;
                let mut runs = Vec::new();
                let mut nested = Vec::new();
                for i in 0..node.cell_count() {
                    let cell = node.cell_at(i)?;
                    if let Some(run) = cell.overflow_page() {
                        runs.push(run);
                    } else if cell.flags.contains(CellFlags::DUPDATA) {
                        nested.push(decode_db_state(cell.data)?.tree);
                    }
                }
                for run in runs {
                    overflow::free_run(&mut *self.pager, run)?;
                }
                for mut info in nested {
                    BTree::new(&mut *self.pager, &mut info, self.cmp).drop_tree()?;
                }
            }
            other => {
                return Err(Error::bad_page(
                    page_no,
                    format!("unexpected {other:?} page inside a tree"),
                ))
            }
        }

        self.pager.release(page_no, 1)
    }
}
