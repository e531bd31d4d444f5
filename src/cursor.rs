//! # Cursors
//!
//! A [`Cursor`] walks one database inside one transaction. It owns no
//! borrow of the transaction: every operation takes the transaction again,
//! and entries it returns borrow from that transaction.
//!
//! ```text
//! let mut cursor = txn.cursor(&db)?;
//! while let Some((key, value)) = cursor.next(&txn)? { ... }
//! ```
//!
//! ## Position
//!
//! The position is a [`TreeCursor`] into the database tree plus, when the
//! current key holds several values, a second [`TreeCursor`] into that key's
//! duplicate tree:
//!
//! ```text
//! main:  root ─> branch ─> leaf[3] = ("K", DUPDATA)
//! dups:                    nested root ─> leaf[1] = "B"
//! ```
//!
//! ## Binding
//!
//! A cursor remembers the token of the transaction it was created in.
//! Using it with any other transaction, including a renewed read
//! transaction, fails with `StaleCursor` until [`Cursor::renew`] binds it
//! again.
//!
//! ## Writes Under a Cursor
//!
//! Pages of a write transaction move when the tree changes. Inside write
//! transactions the cursor therefore keeps a copy of its current key and
//! value and finds its place again whenever the transaction changed since
//! the last step. After [`Cursor::delete`] the cursor sits between entries:
//! `next` yields the successor of the deleted entry and `prev` its
//! predecessor.

use std::cmp::Ordering;

use crate::btree::dupsort::nested_tree;
use crate::btree::tree::cell_value;
use crate::btree::{TreeCursor, TreeInfo};
use crate::env::{Database, WriteFlags};
use crate::mvcc::{sealed::Sealed, Transaction, TxnToken, WriteTransaction};
use crate::storage::PageSource;
use crate::{Error, Result};

/// A key and its value, borrowed from the transaction.
pub type Entry<'t> = (&'t [u8], &'t [u8]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unpositioned,
    Positioned,
    /// The entry under the cursor was deleted. The tree position is its
    /// successor, or the last entry when `past_end`.
    Deleted { past_end: bool },
}

#[derive(Debug, Clone)]
struct DupCursor {
    tree: TreeInfo,
    cursor: TreeCursor,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

pub struct Cursor {
    db: Database,
    token: TxnToken,
    main: TreeCursor,
    dups: Option<DupCursor>,
    state: State,
    epoch: u64,
    saved: Option<(Vec<u8>, Vec<u8>)>,
}

impl Cursor {
    pub(crate) fn new<T: Transaction>(txn: &T, db: &Database) -> Result<Self> {
        txn.db_state(db)?;
        Ok(Self {
            db: db.clone(),
            token: txn.token(),
            main: TreeCursor::new(),
            dups: None,
            state: State::Unpositioned,
            epoch: txn.epoch(),
            saved: None,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Binds the cursor to another transaction. The cursor starts out
    /// unpositioned.
    pub fn renew<T: Transaction>(&mut self, txn: &T) -> Result<()> {
        txn.db_state(&self.db)?;
        self.token = txn.token();
        self.epoch = txn.epoch();
        self.unposition();
        Ok(())
    }

    fn unposition(&mut self) {
        self.main.reset();
        self.dups = None;
        self.state = State::Unpositioned;
        self.saved = None;
    }

    /// Checks the binding and brings the position up to date.
    fn begin<'t, T: Transaction>(&mut self, txn: &'t T) -> Result<(&'t dyn PageSource, TreeInfo)> {
        if txn.token() != self.token {
            return Err(Error::StaleCursor);
        }
        let tree = txn.db_state(&self.db)?.tree;
        let view = txn.view();

        if txn.epoch() != self.epoch {
            self.epoch = txn.epoch();
            if let Some((key, value)) = self.saved.take() {
                self.land(view, &tree, &key, &value)?;
                self.saved = Some((key, value));
            } else {
                self.unposition();
            }
        }
        Ok((view, tree))
    }

    fn require_dup_sort(&self) -> Result<()> {
        if self.db.is_dup_sort() {
            Ok(())
        } else {
            Err(Error::Incompatible(
                "duplicate navigation on a database without DUP_SORT".into(),
            ))
        }
    }

    /// Sets up the duplicate cursor for the main cursor's current cell.
    fn enter(&mut self, view: &dyn PageSource, direction: Direction) -> Result<()> {
        let cell = self.main.cell(view)?;
        self.dups = match nested_tree(&cell)? {
            Some(tree) => {
                let mut cursor = TreeCursor::new();
                let found = match direction {
                    Direction::Forward => cursor.first(view, &tree)?,
                    Direction::Backward => cursor.last(view, &tree)?,
                };
                if !found {
                    return Err(Error::corrupted("empty duplicate set"));
                }
                Some(DupCursor { tree, cursor })
            }
            None => None,
        };
        Ok(())
    }

    fn entry<'t>(&self, view: &'t dyn PageSource) -> Result<Entry<'t>> {
        let cell = self.main.cell(view)?;
        let value = match &self.dups {
            Some(dups) => dups.cursor.cell(view)?.key,
            None => cell_value(view, &cell)?,
        };
        Ok((cell.key, value))
    }

    fn step_key(&mut self, view: &dyn PageSource, direction: Direction) -> Result<bool> {
        let moved = match direction {
            Direction::Forward => self.main.next(view)?,
            Direction::Backward => self.main.prev(view)?,
        };
        if moved {
            self.enter(view, direction)?;
        }
        Ok(moved)
    }

    fn step_dup(&mut self, view: &dyn PageSource, direction: Direction) -> Result<bool> {
        match &mut self.dups {
            Some(dups) => match direction {
                Direction::Forward => dups.cursor.next(view),
                Direction::Backward => dups.cursor.prev(view),
            },
            None => Ok(false),
        }
    }

    fn step(&mut self, view: &dyn PageSource, direction: Direction) -> Result<bool> {
        Ok(self.step_dup(view, direction)? || self.step_key(view, direction)?)
    }

    /// Positions at the first entry at or after `key`, and at or after
    /// `value` among the duplicates of `key`.
    fn seek_pair(
        &mut self,
        view: &dyn PageSource,
        tree: &TreeInfo,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.dups = None;
        if !self.main.seek(view, tree, self.db.key_cmp(), key)? {
            return Ok(false);
        }
        let on_key = self.db.key_cmp().compare(self.main.cell(view)?.key, key) == Ordering::Equal;
        self.enter(view, Direction::Forward)?;

        let (true, Some(value), Some(dup_cmp)) = (on_key, value, self.db.dup_cmp()) else {
            return Ok(true);
        };
        let below = match &mut self.dups {
            Some(dups) => !dups.cursor.seek(view, &dups.tree, dup_cmp, value)?,
            None => {
                let cell = self.main.cell(view)?;
                dup_cmp.compare(cell_value(view, &cell)?, value) == Ordering::Less
            }
        };
        if below {
            return self.step_key(view, Direction::Forward);
        }
        Ok(true)
    }

    fn is_entry(&self, found: Entry<'_>, key: &[u8], value: &[u8]) -> bool {
        if self.db.key_cmp().compare(found.0, key) != Ordering::Equal {
            return false;
        }
        match self.db.dup_cmp() {
            Some(dup_cmp) => dup_cmp.compare(found.1, value) == Ordering::Equal,
            None => true,
        }
    }

    /// Finds the place of `key`/`value` after the tree changed.
    fn land(&mut self, view: &dyn PageSource, tree: &TreeInfo, key: &[u8], value: &[u8]) -> Result<()> {
        if self.seek_pair(view, tree, key, Some(value))? {
            let exact = self.is_entry(self.entry(view)?, key, value);
            self.state = if exact {
                State::Positioned
            } else {
                State::Deleted { past_end: false }
            };
        } else if self.main.last(view, tree)? {
            self.enter(view, Direction::Backward)?;
            self.state = State::Deleted { past_end: true };
        } else {
            self.main.reset();
            self.dups = None;
            self.state = State::Unpositioned;
        }
        Ok(())
    }

    fn finish<'t, T: Transaction>(&mut self, txn: &'t T, found: bool) -> Result<Option<Entry<'t>>> {
        if !found {
            return Ok(None);
        }
        self.state = State::Positioned;
        let entry = self.entry(txn.view())?;
        if txn.is_write() {
            self.saved = Some((entry.0.to_vec(), entry.1.to_vec()));
        }
        Ok(Some(entry))
    }

    fn miss<'t>(&mut self) -> Result<Option<Entry<'t>>> {
        self.unposition();
        Ok(None)
    }

    fn deleted_key(&self) -> Option<&[u8]> {
        self.saved.as_ref().map(|(key, _)| key.as_slice())
    }

    fn same_key(&self, a: &[u8], b: &[u8]) -> bool {
        self.db.key_cmp().compare(a, b) == Ordering::Equal
    }

    pub fn first<'t, T: Transaction>(&mut self, txn: &'t T) -> Result<Option<Entry<'t>>> {
        let (view, tree) = self.begin(txn)?;
        if !self.main.first(view, &tree)? {
            return self.miss();
        }
        self.enter(view, Direction::Forward)?;
        self.finish(txn, true)
    }

    pub fn last<'t, T: Transaction>(&mut self, txn: &'t T) -> Result<Option<Entry<'t>>> {
        let (view, tree) = self.begin(txn)?;
        if !self.main.last(view, &tree)? {
            return self.miss();
        }
        self.enter(view, Direction::Backward)?;
        self.finish(txn, true)
    }

    /// Entry under the cursor. `None` when unpositioned or after a delete.
    pub fn current<'t, T: Transaction>(&mut self, txn: &'t T) -> Result<Option<Entry<'t>>> {
        let (view, _) = self.begin(txn)?;
        match self.state {
            State::Positioned => self.entry(view).map(Some),
            _ => Ok(None),
        }
    }

    /// Next entry, duplicates included. An unpositioned cursor starts at
    /// the first entry.
    pub fn next<'t, T: Transaction>(&mut self, txn: &'t T) -> Result<Option<Entry<'t>>> {
        let (view, _) = self.begin(txn)?;
        match self.state {
            State::Unpositioned => self.first(txn),
            State::Deleted { past_end: false } => self.finish(txn, true),
            State::Deleted { past_end: true } => Ok(None),
            State::Positioned => {
                let moved = self.step(view, Direction::Forward)?;
                self.finish(txn, moved)
            }
        }
    }

    /// Previous entry, duplicates included. An unpositioned cursor starts
    /// at the last entry.
    pub fn prev<'t, T: Transaction>(&mut self, txn: &'t T) -> Result<Option<Entry<'t>>> {
        let (view, _) = self.begin(txn)?;
        match self.state {
            State::Unpositioned => self.last(txn),
            State::Deleted { past_end: true } => self.finish(txn, true),
            State::Deleted { past_end: false } | State::Positioned => {
                let moved = self.step(view, Direction::Backward)?;
                self.finish(txn, moved)
            }
        }
    }

    /// First entry whose key is at or after `key`.
    pub fn seek<'t, T: Transaction>(&mut self, txn: &'t T, key: &[u8]) -> Result<Option<Entry<'t>>> {
        let (view, tree) = self.begin(txn)?;
        if !self.seek_pair(view, &tree, key, None)? {
            return self.miss();
        }
        self.finish(txn, true)
    }

    pub fn seek_range<'t, T: Transaction>(&mut self, txn: &'t T, key: &[u8]) -> Result<Option<Entry<'t>>> {
        self.seek(txn, key)
    }

    /// Entry with exactly `key`, at its first duplicate.
    pub fn seek_exact<'t, T: Transaction>(&mut self, txn: &'t T, key: &[u8]) -> Result<Option<Entry<'t>>> {
        let (view, tree) = self.begin(txn)?;
        if !self.seek_pair(view, &tree, key, None)? {
            return self.miss();
        }
        let (found, _) = self.entry(view)?;
        if !self.same_key(found, key) {
            return self.miss();
        }
        self.finish(txn, true)
    }

    /// Entry with exactly `key` and `value`.
    pub fn get_both<'t, T: Transaction>(
        &mut self,
        txn: &'t T,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Entry<'t>>> {
        let (view, tree) = self.begin(txn)?;
        if !self.seek_pair(view, &tree, key, Some(value))? {
            return self.miss();
        }
        let found = self.entry(view)?;
        let exact = match self.db.dup_cmp() {
            Some(_) => self.is_entry(found, key, value),
            None => self.same_key(found.0, key) && found.1 == value,
        };
        if !exact {
            return self.miss();
        }
        self.finish(txn, true)
    }

    /// First duplicate of `key` at or after `value`.
    pub fn seek_dup<'t, T: Transaction>(
        &mut self,
        txn: &'t T,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Entry<'t>>> {
        self.require_dup_sort()?;
        let (view, tree) = self.begin(txn)?;
        if !self.seek_pair(view, &tree, key, Some(value))? {
            return self.miss();
        }
        let (found, _) = self.entry(view)?;
        if !self.same_key(found, key) {
            return self.miss();
        }
        self.finish(txn, true)
    }

    pub fn get_both_range<'t, T: Transaction>(
        &mut self,
        txn: &'t T,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Entry<'t>>> {
        self.seek_dup(txn, key, value)
    }

    pub fn first_dup<'t, T: Transaction>(&mut self, txn: &'t T) -> Result<Option<Entry<'t>>> {
        self.require_dup_sort()?;
        let (view, _) = self.begin(txn)?;
        if self.state != State::Positioned {
            return Ok(None);
        }
        if let Some(dups) = &mut self.dups {
            dups.cursor.first(view, &dups.tree)?;
        }
        self.finish(txn, true)
    }

    pub fn last_dup<'t, T: Transaction>(&mut self, txn: &'t T) -> Result<Option<Entry<'t>>> {
        self.require_dup_sort()?;
        let (view, _) = self.begin(txn)?;
        if self.state != State::Positioned {
            return Ok(None);
        }
        if let Some(dups) = &mut self.dups {
            dups.cursor.last(view, &dups.tree)?;
        }
        self.finish(txn, true)
    }

    /// Next value of the current key. `None` after the last one.
    pub fn next_dup<'t, T: Transaction>(&mut self, txn: &'t T) -> Result<Option<Entry<'t>>> {
        self.require_dup_sort()?;
        let (view, _) = self.begin(txn)?;
        match self.state {
            State::Unpositioned | State::Deleted { past_end: true } => Ok(None),
            State::Deleted { past_end: false } => {
                let (found, _) = self.entry(view)?;
                let same = self.deleted_key().is_some_and(|key| self.same_key(found, key));
                self.finish(txn, same)
            }
            State::Positioned => {
                let moved = self.step_dup(view, Direction::Forward)?;
                self.finish(txn, moved)
            }
        }
    }

    /// Previous value of the current key. `None` before the first one.
    pub fn prev_dup<'t, T: Transaction>(&mut self, txn: &'t T) -> Result<Option<Entry<'t>>> {
        self.require_dup_sort()?;
        let (view, _) = self.begin(txn)?;
        match self.state {
            State::Unpositioned => Ok(None),
            State::Positioned => {
                let moved = self.step_dup(view, Direction::Backward)?;
                self.finish(txn, moved)
            }
            State::Deleted { past_end } => {
                let moved = past_end || self.step(view, Direction::Backward)?;
                if !moved {
                    return Ok(None);
                }
                let (found, _) = self.entry(view)?;
                let same = self.deleted_key().is_some_and(|key| self.same_key(found, key));
                self.finish(txn, same)
            }
        }
    }

    /// First value of the next key.
    pub fn next_nodup<'t, T: Transaction>(&mut self, txn: &'t T) -> Result<Option<Entry<'t>>> {
        let (view, _) = self.begin(txn)?;
        match self.state {
            State::Unpositioned => self.first(txn),
            State::Deleted { past_end: true } => Ok(None),
            State::Deleted { past_end: false } => {
                let (found, _) = self.entry(view)?;
                let same = self.deleted_key().is_some_and(|key| self.same_key(found, key));
                let moved = !same || self.step_key(view, Direction::Forward)?;
                self.finish(txn, moved)
            }
            State::Positioned => {
                let moved = self.step_key(view, Direction::Forward)?;
                self.finish(txn, moved)
            }
        }
    }

    /// Last value of the previous key.
    pub fn prev_nodup<'t, T: Transaction>(&mut self, txn: &'t T) -> Result<Option<Entry<'t>>> {
        let (view, _) = self.begin(txn)?;
        match self.state {
            State::Unpositioned => self.last(txn),
            State::Deleted { past_end: true } => {
                let (found, _) = self.entry(view)?;
                let same = self.deleted_key().is_some_and(|key| self.same_key(found, key));
                let moved = !same || self.step_key(view, Direction::Backward)?;
                self.finish(txn, moved)
            }
            State::Deleted { past_end: false } | State::Positioned => {
                let moved = self.step_key(view, Direction::Backward)?;
                self.finish(txn, moved)
            }
        }
    }

    /// Number of values under the current key.
    pub fn count<T: Transaction>(&mut self, txn: &T) -> Result<u64> {
        self.begin(txn)?;
        if self.state != State::Positioned {
            return Err(Error::Incompatible("cursor is not positioned".into()));
        }
        Ok(self.dups.as_ref().map_or(1, |dups| dups.tree.entries))
    }

    /// Stores an entry and moves the cursor onto it. With
    /// [`WriteFlags::CURRENT`] the value under the cursor is replaced; the
    /// key must be the current one.
    pub fn put(
        &mut self,
        txn: &mut WriteTransaction<'_>,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> Result<bool> {
        let written = if flags.contains(WriteFlags::CURRENT) {
            self.put_current(txn, key, value, flags.difference(WriteFlags::CURRENT))?
        } else {
            if txn.token() != self.token {
                return Err(Error::StaleCursor);
            }
            txn.put(&self.db, key, value, flags)?
        };

        let view = txn.view();
        let tree = txn.db_state(&self.db)?.tree;
        self.epoch = txn.epoch();
        if self.seek_pair(view, &tree, key, Some(value))? {
            self.finish(&*txn, true)?;
        } else {
            self.unposition();
        }
        Ok(written)
    }

    fn put_current(
        &mut self,
        txn: &mut WriteTransaction<'_>,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> Result<bool> {
        let (view, _) = self.begin(&*txn)?;
        if self.state != State::Positioned {
            return Err(Error::Incompatible("cursor is not positioned".into()));
        }
        let (current_key, current_value) = self.entry(view)?;
        if !self.same_key(current_key, key) {
            return Err(Error::Incompatible(
                "CURRENT put with a key other than the current one".into(),
            ));
        }
        let old = current_value.to_vec();

        if !self.db.is_dup_sort() {
            return txn.put(&self.db, key, value, flags);
        }
        let added = txn.put(&self.db, key, value, flags)?;
        if added {
            txn.delete(&self.db, key, Some(&old))?;
        }
        Ok(added)
    }

    /// Deletes the entry under the cursor, or every value of its key with
    /// `all_dups`.
    pub fn delete(&mut self, txn: &mut WriteTransaction<'_>, all_dups: bool) -> Result<()> {
        let (view, _) = self.begin(&*txn)?;
        if self.state != State::Positioned {
            return Err(Error::Incompatible("cursor is not positioned".into()));
        }
        let (key, value) = self.entry(view)?;
        let (key, value) = (key.to_vec(), value.to_vec());

        let single = self.db.is_dup_sort() && !all_dups;
        txn.delete(&self.db, &key, single.then_some(value.as_slice()))?;

        let tree = txn.db_state(&self.db)?.tree;
        self.epoch = txn.epoch();
        self.land(txn.view(), &tree, &key, &value)?;
        self.saved = Some((key, value));
        Ok(())
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("db", &self.db)
            .field("state", &self.state)
            .field("leaf", &self.main.leaf_slot())
            .finish()
    }
}
