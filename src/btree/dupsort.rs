//! # Database Trees and Duplicate Sets
//!
//! [`DbTree`] applies database semantics on top of the raw [`BTree`]:
//! write flags, and for dup-sort databases, several values per key.
//!
//! ## Duplicate Layout
//!
//! A key with a single value is stored as an ordinary cell. The second
//! distinct value converts the cell into a `DUPDATA` cell whose data is a
//! 40-byte database record describing a nested tree:
//!
//! ```text
//! main tree leaf                     nested tree (value comparator)
//! +-----+-----------------------+    +-------+-------+-------+
//! | key | DUPDATA, DbRecord ----+--> | val A | val B | val C |  (empty data)
//! +-----+-----------------------+    +-------+-------+-------+
//! ```
//!
//! Nested trees live in the same pages as everything else and follow the
//! same copy-on-write rules. Their page counts are folded into the owning
//! database's statistics, and the database's `entries` counts every value,
//! not every key. A nested tree is kept once created, even when deletes
//! leave it with one value.
//!
//! Values of a dup-sort database are keys of the nested tree, so they are
//! bounded by the maximum key size.

use std::cmp::Ordering;

use super::compare::Comparator;
use super::cursor::TreeCursor;
use super::leaf::{CellFlags, LeafCell};
use super::tree::{cell_at, cell_value, descend, get, BTree, CellData, Position};
use super::TreeInfo;
use crate::config::max_key_size;
use crate::env::WriteFlags;
use crate::storage::{decode_db_state, encode_db_state, DbState, PageSink, PageSource, DB_RECORD_SIZE};
use crate::{Error, Result};

/// Orders used by one database.
#[derive(Debug, Clone, Copy)]
pub struct TreeOrder<'c> {
    pub key: &'c dyn Comparator,
    /// Set for dup-sort databases.
    pub dup: Option<&'c dyn Comparator>,
    /// All values of a key must have the same length.
    pub fixed_dups: bool,
}

impl<'c> TreeOrder<'c> {
    pub fn plain(key: &'c dyn Comparator) -> Self {
        Self {
            key,
            dup: None,
            fixed_dups: false,
        }
    }

    pub fn is_dup_sort(&self) -> bool {
        self.dup.is_some()
    }
}

/// The nested duplicate tree behind a cell, if it has one.
pub fn nested_tree(cell: &LeafCell<'_>) -> Result<Option<TreeInfo>> {
    if !cell.flags.contains(CellFlags::DUPDATA) {
        return Ok(None);
    }
    Ok(Some(decode_db_state(cell.data)?.tree))
}

fn encode_nested(tree: &TreeInfo) -> [u8; DB_RECORD_SIZE] {
    encode_db_state(&DbState {
        flags: 0,
        tree: *tree,
        sequence: 0,
    })
}

/// Value of a cell; the smallest duplicate for a nested cell.
pub fn first_value<'p, P: PageSource + ?Sized>(pager: &'p P, cell: &LeafCell<'p>) -> Result<&'p [u8]> {
    match nested_tree(cell)? {
        Some(nested) => {
            let mut cursor = TreeCursor::new();
            if !cursor.first(pager, &nested)? {
                return Err(Error::corrupted("empty duplicate set"));
            }
            Ok(cursor.cell(pager)?.key)
        }
        None => cell_value(pager, cell),
    }
}

/// Number of values stored under a cell.
pub fn value_count(cell: &LeafCell<'_>) -> Result<u64> {
    Ok(nested_tree(cell)?.map_or(1, |nested| nested.entries))
}

pub fn lookup<'p, P: PageSource + ?Sized>(
    pager: &'p P,
    tree: &TreeInfo,
    order: &TreeOrder<'_>,
    key: &[u8],
) -> Result<Option<&'p [u8]>> {
    match get(pager, tree, order.key, key)? {
        Some(cell) => first_value(pager, &cell).map(Some),
        None => Ok(None),
    }
}

pub fn count_dups<P: PageSource + ?Sized>(
    pager: &P,
    tree: &TreeInfo,
    order: &TreeOrder<'_>,
    key: &[u8],
) -> Result<u64> {
    match get(pager, tree, order.key, key)? {
        Some(cell) => value_count(&cell),
        None => Ok(0),
    }
}

fn appends(pos: &Option<Position>) -> bool {
    pos.as_ref().map_or(true, |pos| pos.past_end)
}

/// Write access to one database tree.
pub struct DbTree<'a, P: PageSink + ?Sized> {
    pager: &'a mut P,
    tree: &'a mut TreeInfo,
    order: TreeOrder<'a>,
}

impl<'a, P: PageSink + ?Sized> DbTree<'a, P> {
    pub fn new(pager: &'a mut P, tree: &'a mut TreeInfo, order: TreeOrder<'a>) -> Self {
        Self { pager, tree, order }
    }

    fn main(&mut self) -> BTree<'_, P> {
        BTree::new(&mut *self.pager, &mut *self.tree, self.order.key)
    }

    /// Stores `value` under `key`. Returns false when nothing changed
    /// because the key/value pair already exists in a dup-sort database.
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<bool> {
        let Some(dup) = self.order.dup else {
            let pos = self.main().seek(key)?;
            return self.put_single(pos, key, value, flags);
        };

        self.check_dup_size(value)?;
        let pos = self.main().seek(key)?;
        match pos {
            Some(pos) if pos.found() => {
                if flags.contains(WriteFlags::NO_OVERWRITE) {
                    return Err(Error::KeyExists);
                }
                if flags.contains(WriteFlags::APPEND) && !self.is_last_key(key)? {
                    return Err(Error::KeyExists);
                }
                self.add_dup(pos, key, value, dup, flags)
            }
            pos => {
                if flags.contains(WriteFlags::APPEND) && !appends(&pos) {
                    return Err(Error::KeyExists);
                }
                self.main().insert(pos, key, CellData::Value(value))?;
                Ok(true)
            }
        }
    }

    fn put_single(
        &mut self,
        pos: Option<Position>,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> Result<bool> {
        match pos {
            Some(pos) if pos.found() => {
                if flags.intersects(WriteFlags::NO_OVERWRITE | WriteFlags::APPEND) {
                    return Err(Error::KeyExists);
                }
                self.main().replace(pos, key, CellData::Value(value))?;
            }
            pos => {
                if flags.contains(WriteFlags::APPEND) && !appends(&pos) {
                    return Err(Error::KeyExists);
                }
                self.main().insert(pos, key, CellData::Value(value))?;
            }
        }
        Ok(true)
    }

    fn add_dup(
        &mut self,
        pos: Position,
        key: &[u8],
        value: &[u8],
        dup: &dyn Comparator,
        flags: WriteFlags,
    ) -> Result<bool> {
        let (single, mut nested) = {
            let cell = cell_at(&*self.pager, pos.leaf, pos.index())?;
            match nested_tree(&cell)? {
                Some(nested) => (None, nested),
                None => (Some(cell_value(&*self.pager, &cell)?.to_vec()), TreeInfo::default()),
            }
        };
        let before = nested;

        match single {
            Some(existing) => {
                match dup.compare(value, &existing) {
                    Ordering::Equal => return Ok(false),
                    Ordering::Less if flags.contains(WriteFlags::APPEND_DUP) => {
                        return Err(Error::KeyExists)
                    }
                    _ => {}
                }
                self.check_fixed(existing.len(), value.len())?;

                let mut dups = BTree::new(&mut *self.pager, &mut nested, dup);
                dups.put(&existing, CellData::Value(&[]))?;
                dups.put(value, CellData::Value(&[]))?;
            }
            None => {
                let npos = descend(&*self.pager, &nested, dup, value)?;
                if npos.as_ref().is_some_and(Position::found) {
                    return Ok(false);
                }
                if flags.contains(WriteFlags::APPEND_DUP) && !appends(&npos) {
                    return Err(Error::KeyExists);
                }
                if self.order.fixed_dups {
                    if let Some(len) = self.first_dup_len(&nested)? {
                        self.check_fixed(len, value.len())?;
                    }
                }
                BTree::new(&mut *self.pager, &mut nested, dup).insert(
                    npos,
                    value,
                    CellData::Value(&[]),
                )?;
            }
        }

        self.absorb(&before, &nested);
        let record = encode_nested(&nested);
        self.main().replace(pos, key, CellData::Nested(&record))?;
        self.tree.entries += 1;
        Ok(true)
    }

    /// Removes `key` with all its values, or only `value` in a dup-sort
    /// database. Non-dup databases ignore `value`.
    pub fn delete(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        let Some(pos) = self.main().seek(key)?.filter(Position::found) else {
            return Ok(false);
        };

        let (Some(dup), Some(value)) = (self.order.dup, value) else {
            self.drop_dups(&pos)?;
            self.main().remove(pos)?;
            return Ok(true);
        };

        let nested = {
            let cell = cell_at(&*self.pager, pos.leaf, pos.index())?;
            match nested_tree(&cell)? {
                Some(nested) => Some(nested),
                None if dup.compare(cell_value(&*self.pager, &cell)?, value) == Ordering::Equal => {
                    None
                }
                None => return Ok(false),
            }
        };

        let Some(mut nested) = nested else {
            self.main().remove(pos)?;
            return Ok(true);
        };

        let before = nested;
        if !BTree::new(&mut *self.pager, &mut nested, dup).delete(value)? {
            return Ok(false);
        }
        self.absorb(&before, &nested);

        if nested.is_empty() {
            self.main().remove(pos)?;
        } else {
            let record = encode_nested(&nested);
            self.main().replace(pos, key, CellData::Nested(&record))?;
            self.tree.entries = self.tree.entries.saturating_sub(1);
        }
        Ok(true)
    }

    /// Frees every page of the database, nested trees included.
    pub fn clear(&mut self) -> Result<()> {
        self.main().drop_tree()
    }

    fn drop_dups(&mut self, pos: &Position) -> Result<()> {
        let nested = nested_tree(&cell_at(&*self.pager, pos.leaf, pos.index())?)?;
        let Some(mut nested) = nested else {
            return Ok(());
        };

        let extra = nested.entries.saturating_sub(1);
        let before = nested;
        let cmp = self.order.dup.unwrap_or(self.order.key);
        BTree::new(&mut *self.pager, &mut nested, cmp).drop_tree()?;
        self.absorb(&before, &nested);
        self.tree.entries = self.tree.entries.saturating_sub(extra);
        Ok(())
    }

    /// Folds the page count change of a nested tree into the database.
    fn absorb(&mut self, before: &TreeInfo, after: &TreeInfo) {
        let tree = &mut *self.tree;
        tree.leaf_pages = (tree.leaf_pages + after.leaf_pages).saturating_sub(before.leaf_pages);
        tree.branch_pages =
            (tree.branch_pages + after.branch_pages).saturating_sub(before.branch_pages);
        tree.overflow_pages =
            (tree.overflow_pages + after.overflow_pages).saturating_sub(before.overflow_pages);
    }

    fn is_last_key(&self, key: &[u8]) -> Result<bool> {
        let mut cursor = TreeCursor::new();
        if !cursor.last(&*self.pager, &*self.tree)? {
            return Ok(false);
        }
        let last = cursor.cell(&*self.pager)?.key;
        Ok(self.order.key.compare(last, key) == Ordering::Equal)
    }

    fn first_dup_len(&self, nested: &TreeInfo) -> Result<Option<usize>> {
        let mut cursor = TreeCursor::new();
        if !cursor.first(&*self.pager, nested)? {
            return Ok(None);
        }
        Ok(Some(cursor.cell(&*self.pager)?.key.len()))
    }

    fn check_dup_size(&self, value: &[u8]) -> Result<()> {
        let max = max_key_size(self.pager.page_size());
        if value.len() > max {
            return Err(Error::KeyTooLarge {
                size: value.len(),
                max,
            });
        }
        Ok(())
    }

    fn check_fixed(&self, expected: usize, actual: usize) -> Result<()> {
        if self.order.fixed_dups && expected != actual {
            return Err(Error::BadValueSize { expected, actual });
        }
        Ok(())
    }
}
