//! # Transactions
//!
//! [`ReadTransaction`] pins one committed snapshot. [`WriteTransaction`]
//! holds the environment's writer lock and stages a new snapshot through a
//! [`WritePager`]; nothing it does is visible to anybody else until
//! [`WriteTransaction::commit`] writes the new meta page.
//!
//! Both implement [`Transaction`], which carries every read operation, so
//! lookups and cursors work the same way on either kind.
//!
//! ## Database Handles Inside a Write Transaction
//!
//! Opening, creating, renaming and deleting databases changes the shared
//! handle table right away, recorded under the writer's transaction id.
//! Readers resolve names at their own snapshot id, so they never see those
//! changes before commit. The slots a transaction touched are remembered in
//! order; abort pops the transaction's entries back off them:
//!
//! ```text
//! slot names                       after abort of txn 7
//! (0, "foo") (7, "foobar")   ──>   (0, "foo")
//! (7, "new")                 ──>   slot emptied
//! ```
//!
//! ## Nested Transactions
//!
//! [`WriteTransaction::begin_nested`] opens a child that borrows its parent.
//! The child stacks a savepoint on the parent's pager and keeps a copy of
//! the parent's database states. Committing the child drops the savepoint,
//! so its changes become the parent's; aborting or dropping it rolls the
//! parent back to where the child began.
//!
//! ## Commit
//!
//! ```text
//! 1. write catalog records of changed named databases
//! 2. settle the free list (pages freed by this txn under key txn_id)
//! 3. write dirty pages, grow the file as needed
//! 4. sync (unless NoSync)
//! 5. write the meta page into slot txn_id % 2
//! 6. sync again (FullSync only)
//! 7. publish the meta state to new readers
//! ```
//!
//! A failure before step 5 leaves the previous meta page current, so the
//! commit has no visible effect.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

use hashbrown::HashMap;
use log::debug;
use parking_lot::MutexGuard;

use super::{TxnId, TxnState, WritePager};
use crate::btree::dupsort::{count_dups, lookup};
use crate::btree::tree::{BTree, CellData};
use crate::btree::{dupsort, DbTree, Lexicographic, TreeCursor, TreeInfo};
use crate::cursor::Cursor;
use crate::env::dbi::{catalog_lookup, catalog_names};
use crate::env::{Database, DatabaseOptions, Durability, Environment, Stat, WriteFlags};
use crate::storage::{encode_db_state, DbState, MetaRecord, MetaState, PageSource};
use crate::{Error, Result};

/// Identity of one transaction, compared by cursors to detect reuse
/// after the transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnToken(u64);

impl TxnToken {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }
}

pub mod sealed {
    use super::*;

    /// Internals shared by both transaction kinds.
    pub trait Sealed {
        fn view(&self) -> &dyn PageSource;

        /// Current state of a database as seen by this transaction.
        fn db_state(&self, db: &Database) -> Result<DbState>;

        fn catalog(&self) -> TreeInfo;

        fn token(&self) -> TxnToken;

        /// Bumped by every change; cursors re-seek when it moves.
        fn epoch(&self) -> u64;

        fn is_write(&self) -> bool;
    }
}

use sealed::Sealed;

/// Read operations available on every transaction.
pub trait Transaction: Sealed {
    /// Snapshot id for read transactions, the id being written for write
    /// transactions.
    fn id(&self) -> TxnId;

    /// Value of `key`; the first duplicate in a dup-sort database.
    fn get<'t>(&'t self, db: &Database, key: &[u8]) -> Result<Option<&'t [u8]>> {
        let state = self.db_state(db)?;
        lookup(self.view(), &state.tree, &db.order(), key)
    }

    /// First entry whose key is at or after `key`.
    fn get_or_next<'t>(&'t self, db: &Database, key: &[u8]) -> Result<Option<(&'t [u8], &'t [u8])>> {
        let state = self.db_state(db)?;
        let view = self.view();
        let mut cursor = TreeCursor::new();
        if !cursor.seek(view, &state.tree, db.key_cmp(), key)? {
            return Ok(None);
        }
        let cell = cursor.cell(view)?;
        Ok(Some((cell.key, dupsort::first_value(view, &cell)?)))
    }

    /// Number of values stored under `key`, 0 when absent.
    fn count_dups(&self, db: &Database, key: &[u8]) -> Result<u64> {
        let state = self.db_state(db)?;
        count_dups(self.view(), &state.tree, &db.order(), key)
    }

    fn cursor(&self, db: &Database) -> Result<Cursor>
    where
        Self: Sized,
    {
        Cursor::new(self, db)
    }

    fn stat(&self, db: &Database) -> Result<Stat> {
        let state = self.db_state(db)?;
        Ok(Stat::new(self.view().page_size(), &state.tree))
    }

    /// Names of all named databases, in byte order.
    fn list_databases(&self) -> Result<Vec<String>> {
        catalog_names(self.view(), &self.catalog())
    }
}

/// A consistent read-only view of the environment.
///
/// Holds a reader slot until dropped or [`reset`](Self::reset); pages of its
/// snapshot are not reused while it lives, so long-lived readers make the
/// file grow.
pub struct ReadTransaction<'env> {
    env: &'env Environment,
    meta: MetaState,
    slot: usize,
    token: TxnToken,
    /// Named database records of this snapshot, by name.
    dbs: RefCell<HashMap<Vec<u8>, DbState>>,
}

impl<'env> ReadTransaction<'env> {
    pub(crate) fn new(env: &'env Environment) -> Result<Self> {
        let (meta, slot) = env.readers.begin()?;
        Ok(Self {
            env,
            meta,
            slot,
            token: env.next_token(),
            dbs: RefCell::new(HashMap::new()),
        })
    }

    /// Opens a database that exists in this snapshot.
    pub fn open_database(
        &self,
        name: Option<&str>,
        options: impl Into<DatabaseOptions>,
    ) -> Result<Database> {
        let options = options.into();
        let key = name.map(str::as_bytes);
        let stored = match key {
            None => Some(self.meta.main),
            Some(key) => catalog_lookup(&self.env.storage, &self.meta.catalog.tree, key)?,
        };
        let Some(state) = stored else {
            return Err(Error::NotFound);
        };

        let (db, _) = self.env.dbs.write().open(
            key,
            &options,
            Some(&state),
            self.meta.txn_id,
            self.env.config.max_named_databases,
        )?;
        if let Some(key) = key {
            self.dbs.borrow_mut().insert(key.to_vec(), state);
        }
        Ok(db)
    }

    /// Reads the per-database counter.
    pub fn get_sequence(&self, db: &Database, increment: u64) -> Result<u64> {
        if increment > 0 {
            return Err(Error::Incompatible(
                "sequence increment needs a write transaction".into(),
            ));
        }
        Ok(self.db_state(db)?.sequence)
    }

    pub(crate) fn meta(&self) -> &MetaState {
        &self.meta
    }

    /// Releases the snapshot while keeping the handle for reuse.
    pub fn reset(self) -> InactiveTransaction<'env> {
        let env = self.env;
        drop(self);
        InactiveTransaction { env }
    }
}

impl Sealed for ReadTransaction<'_> {
    fn view(&self) -> &dyn PageSource {
        &self.env.storage
    }

    fn db_state(&self, db: &Database) -> Result<DbState> {
        let name = self.env.dbs.read().name_of(db, self.meta.txn_id)?;
        let Some(name) = name else {
            return Ok(self.meta.main);
        };

        if let Some(state) = self.dbs.borrow().get(&name) {
            return Ok(*state);
        }
        let state = catalog_lookup(&self.env.storage, &self.meta.catalog.tree, &name)?
            .ok_or(Error::NotFound)?;
        self.dbs.borrow_mut().insert(name, state);
        Ok(state)
    }

    fn catalog(&self) -> TreeInfo {
        self.meta.catalog.tree
    }

    fn token(&self) -> TxnToken {
        self.token
    }

    fn epoch(&self) -> u64 {
        0
    }

    fn is_write(&self) -> bool {
        false
    }
}

impl Transaction for ReadTransaction<'_> {
    fn id(&self) -> TxnId {
        self.meta.txn_id
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        self.env.readers.release(self.slot);
    }
}

/// A reset read transaction. Holds no snapshot.
pub struct InactiveTransaction<'env> {
    env: &'env Environment,
}

impl<'env> InactiveTransaction<'env> {
    /// Registers a fresh snapshot. Cursors of the old one must be renewed.
    pub fn renew(self) -> Result<ReadTransaction<'env>> {
        ReadTransaction::new(self.env)
    }
}

#[derive(Clone)]
struct TxnDb {
    name: Option<Vec<u8>>,
    state: DbState,
    dirty: bool,
}

/// Failures that are detected before any page is touched.
fn leaves_txn_intact(err: &Error) -> bool {
    matches!(
        err,
        Error::KeyExists | Error::KeyTooLarge { .. } | Error::BadValueSize { .. }
    )
}

/// The single writer of an environment.
///
/// Dropping it without [`commit`](Self::commit) aborts.
pub struct WriteTransaction<'env> {
    env: &'env Environment,
    guard: Option<MutexGuard<'env, ()>>,
    base: MetaState,
    txn_id: TxnId,
    token: TxnToken,
    pager: WritePager<'env>,
    catalog: DbState,
    dbs: HashMap<u32, TxnDb>,
    /// Handle slots whose names this transaction changed, in order.
    touched: Vec<u32>,
    epoch: u64,
    state: TxnState,
}

impl<'env> WriteTransaction<'env> {
    pub(crate) fn new(env: &'env Environment, guard: MutexGuard<'env, ()>) -> Self {
        let base = env.readers.current();
        let txn_id = base.txn_id + 1;
        let oldest = env.readers.oldest();
        let threshold = oldest.map_or(txn_id, |oldest| oldest.min(txn_id));
        env.dbs
            .write()
            .prune(oldest.map_or(base.txn_id, |oldest| oldest.min(base.txn_id)));
        let pager = WritePager::new(&env.storage, txn_id, threshold, base.free.tree, base.last_page);

        let mut dbs = HashMap::new();
        dbs.insert(
            0,
            TxnDb {
                name: None,
                state: base.main,
                dirty: false,
            },
        );

        Self {
            env,
            guard: Some(guard),
            base,
            txn_id,
            token: env.next_token(),
            pager,
            catalog: base.catalog,
            dbs,
            touched: Vec::new(),
            epoch: 0,
            state: TxnState::Active,
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxnState::Active => Ok(()),
            state => Err(Error::Incompatible(format!(
                "write transaction is {state:?}"
            ))),
        }
    }

    /// Opens a database, creating it when `CREATE` is given.
    pub fn open_database(
        &mut self,
        name: Option<&str>,
        options: impl Into<DatabaseOptions>,
    ) -> Result<Database> {
        self.ensure_active()?;
        let options = options.into();
        let key = name.map(str::as_bytes);
        let stored = match key {
            None => self.dbs.get(&0).map(|entry| entry.state),
            Some(key) => self.named_state(key)?,
        };
        if stored.is_none() && !options.wants_create() {
            return Err(Error::NotFound);
        }

        let (db, created) = self.env.dbs.write().open(
            key,
            &options,
            stored.as_ref(),
            self.txn_id,
            self.env.config.max_named_databases,
        )?;
        if created {
            self.touched.push(db.dbi());
        }
        if stored.is_none() {
            debug!("txn {} created database {:?}", self.txn_id, name);
        }

        let flags = db.flags().bits();
        let entry = self.dbs.entry(db.dbi()).or_insert_with(|| TxnDb {
            name: key.map(<[u8]>::to_vec),
            state: stored.unwrap_or_else(|| DbState::empty(flags)),
            dirty: stored.is_none(),
        });
        if entry.state.tree.is_empty() && entry.state.flags != flags {
            entry.state.flags = flags;
            entry.dirty = true;
        }
        Ok(db)
    }

    pub fn create_database(
        &mut self,
        name: Option<&str>,
        options: impl Into<DatabaseOptions>,
    ) -> Result<Database> {
        self.open_database(name, options.into().create())
    }

    fn named_state(&self, name: &[u8]) -> Result<Option<DbState>> {
        let staged = self
            .dbs
            .values()
            .find(|entry| entry.name.as_deref() == Some(name));
        match staged {
            Some(entry) => Ok(Some(entry.state)),
            None => catalog_lookup(&self.pager, &self.catalog.tree, name),
        }
    }

    /// Loads a database into the transaction's working set.
    fn load(&mut self, db: &Database) -> Result<&mut TxnDb> {
        let name = self.env.dbs.read().name_of(db, self.txn_id)?;
        let dbi = db.dbi();
        if !self.dbs.contains_key(&dbi) {
            let name = name.ok_or_else(|| Error::corrupted("main database missing from txn"))?;
            let state = catalog_lookup(&self.pager, &self.catalog.tree, &name)?
                .ok_or(Error::NotFound)?;
            self.dbs.insert(
                dbi,
                TxnDb {
                    name: Some(name),
                    state,
                    dirty: false,
                },
            );
        }
        self.dbs
            .get_mut(&dbi)
            .ok_or_else(|| Error::corrupted("database vanished from txn"))
    }

    /// Runs a tree operation on `db`, keeping the new tree shape on success.
    pub(crate) fn modify<R>(
        &mut self,
        db: &Database,
        op: impl FnOnce(&mut DbTree<'_, WritePager<'env>>) -> Result<R>,
    ) -> Result<R> {
        self.ensure_active()?;
        let flags = db.flags().bits();
        let mut state = self.load(db)?.state;
        if state.tree.is_empty() {
            state.flags = flags;
        }

        let mut tree = state.tree;
        let result = op(&mut DbTree::new(&mut self.pager, &mut tree, db.order()));
        match result {
            Ok(value) => {
                state.tree = tree;
                if let Some(entry) = self.dbs.get_mut(&db.dbi()) {
                    entry.state = state;
                    entry.dirty = true;
                }
                self.epoch += 1;
                Ok(value)
            }
            Err(err) => {
                if !leaves_txn_intact(&err) {
                    self.state = TxnState::Failed;
                }
                Err(err)
            }
        }
    }

    /// Stores `value` under `key`. Returns false when the exact pair was
    /// already present in a dup-sort database.
    pub fn put(&mut self, db: &Database, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<bool> {
        self.modify(db, |tree| tree.put(key, value, flags))
    }

    /// Deletes `key`, or only the pair `key`/`value` in a dup-sort
    /// database. Returns false when nothing matched.
    pub fn delete(&mut self, db: &Database, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        self.modify(db, |tree| tree.delete(key, value))
    }

    /// Overwrites `key` and returns the value it replaced.
    pub fn replace(&mut self, db: &Database, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        if db.is_dup_sort() {
            return Err(Error::Incompatible(
                "replace on a dup-sort database".into(),
            ));
        }
        let old = self.get(db, key)?.map(<[u8]>::to_vec);
        self.put(db, key, value, WriteFlags::empty())?;
        Ok(old)
    }

    /// Returns the database's counter and advances it by `increment`.
    pub fn get_sequence(&mut self, db: &Database, increment: u64) -> Result<u64> {
        self.ensure_active()?;
        let entry = self.load(db)?;
        let previous = entry.state.sequence;
        if increment > 0 {
            entry.state.sequence = previous.wrapping_add(increment);
            entry.dirty = true;
        }
        Ok(previous)
    }

    /// Gives a named database a new name. Visible to others after commit.
    pub fn rename_database(&mut self, db: &Database, new_name: &str) -> Result<()> {
        self.ensure_active()?;
        if db.is_main() {
            return Err(Error::Incompatible("the main database has no name".into()));
        }
        let new_key = new_name.as_bytes();
        let open_elsewhere = self.env.dbs.read().contains(new_key, self.txn_id);
        if open_elsewhere || self.named_state(new_key)?.is_some() {
            return Err(Error::KeyExists);
        }

        let entry = self.load(db)?;
        let old = entry.name.replace(new_key.to_vec());
        entry.dirty = true;
        if let Some(old) = &old {
            BTree::new(&mut self.pager, &mut self.catalog.tree, &Lexicographic).delete(old)?;
        }

        self.env.dbs.write().rename(db.dbi(), new_key.to_vec(), self.txn_id);
        self.touched.push(db.dbi());
        self.epoch += 1;
        debug!(
            "txn {} renamed database {:?} to {:?}",
            self.txn_id,
            old.as_deref().map(String::from_utf8_lossy),
            new_name
        );
        Ok(())
    }

    /// Empties a database. With `delete`, also removes it from the catalog
    /// and closes the handle.
    pub fn drop_database(&mut self, db: &Database, delete: bool) -> Result<()> {
        self.ensure_active()?;
        if delete && db.is_main() {
            return Err(Error::Incompatible("the main database cannot be deleted".into()));
        }

        self.modify(db, |tree| tree.clear())?;
        if !delete {
            return Ok(());
        }

        let dbi = db.dbi();
        let name = self.dbs.remove(&dbi).and_then(|entry| entry.name);
        if let Some(name) = &name {
            let mut catalog = self.catalog.tree;
            let removed = BTree::new(&mut self.pager, &mut catalog, &Lexicographic).delete(name);
            match removed {
                Ok(_) => self.catalog.tree = catalog,
                Err(err) => {
                    self.state = TxnState::Failed;
                    return Err(err);
                }
            }
        }
        self.env.dbs.write().delete(dbi, self.txn_id);
        self.touched.push(dbi);
        debug!(
            "txn {} deleted database {:?}",
            self.txn_id,
            name.as_deref().map(String::from_utf8_lossy)
        );
        Ok(())
    }

    /// Makes every change durable and visible. Returns the new snapshot id.
    pub fn commit(mut self) -> Result<TxnId> {
        self.ensure_active()?;
        match self.write_out() {
            Ok(txn_id) => {
                self.state = TxnState::Committed;
                self.touched.clear();
                Ok(txn_id)
            }
            Err(err) => {
                self.state = TxnState::Failed;
                Err(err)
            }
        }
    }

    /// Discards every change.
    pub fn abort(mut self) {
        self.state = TxnState::Aborted;
    }

    fn write_out(&mut self) -> Result<TxnId> {
        let changed = self.dbs.values().any(|entry| entry.dirty);
        if !changed && self.pager.dirty_count() == 0 && self.touched.is_empty() {
            debug!("txn {} committed without changes", self.txn_id);
            return Ok(self.base.txn_id);
        }

        let mut records: Vec<(&[u8], DbState)> = self
            .dbs
            .values()
            .filter(|entry| entry.dirty)
            .filter_map(|entry| entry.name.as_deref().map(|name| (name, entry.state)))
            .collect();
        records.sort_unstable_by(|a, b| a.0.cmp(b.0));
        for (name, state) in records {
            let record = encode_db_state(&state);
            BTree::new(&mut self.pager, &mut self.catalog.tree, &Lexicographic)
                .put(name, CellData::Value(&record))?;
        }

        let free = self.pager.settle_freelist()?;
        let storage = &self.env.storage;
        let page_size = storage.page_size();
        let growth = (self.env.config.map_growth_increment / page_size as u64).max(1) as u32;
        let dirty = self.pager.dirty_count();
        let last_page = self.pager.flush(growth)?;

        let durability = self.env.config.durability;
        if durability != Durability::NoSync {
            storage.sync()?;
        }

        let main = self
            .dbs
            .get(&0)
            .map_or(self.base.main, |entry| entry.state);
        let meta = MetaState {
            txn_id: self.txn_id,
            page_size: page_size as u32,
            last_page,
            map_size: storage.map_size(),
            free: DbState {
                tree: free,
                ..self.base.free
            },
            main,
            catalog: self.catalog,
        };
        storage.write_pages(meta.slot(), &MetaRecord::new(&meta).to_page(page_size))?;
        if durability == Durability::FullSync {
            storage.sync()?;
        }

        self.env.readers.publish(meta);
        debug!(
            "txn {} committed: {} pages written, high-water mark {}, meta slot {}",
            self.txn_id,
            dirty,
            last_page,
            meta.slot()
        );
        Ok(self.txn_id)
    }

    /// Reverts handle table changes made after the first `keep` ones.
    fn rollback_table(&mut self, keep: usize) {
        if self.touched.len() <= keep {
            return;
        }
        let undone = self.touched.split_off(keep);
        self.env.dbs.write().rollback(self.txn_id, &undone);
    }

    /// Starts a child transaction. Its changes become part of this one when
    /// it commits and vanish when it aborts.
    pub fn begin_nested(&mut self) -> Result<NestedTransaction<'_, 'env>> {
        self.ensure_active()?;
        self.pager.savepoint();
        let saved = Saved {
            catalog: self.catalog,
            dbs: self.dbs.clone(),
            touched: self.touched.len(),
        };
        debug!("txn {} began a nested transaction", self.txn_id);
        Ok(NestedTransaction {
            parent: self,
            saved,
            done: false,
        })
    }
}

impl Sealed for WriteTransaction<'_> {
    fn view(&self) -> &dyn PageSource {
        &self.pager
    }

    fn db_state(&self, db: &Database) -> Result<DbState> {
        let name = self.env.dbs.read().name_of(db, self.txn_id)?;
        if let Some(entry) = self.dbs.get(&db.dbi()) {
            return Ok(entry.state);
        }
        let name = name.ok_or_else(|| Error::corrupted("main database missing from txn"))?;
        catalog_lookup(&self.pager, &self.catalog.tree, &name)?.ok_or(Error::NotFound)
    }

    fn catalog(&self) -> TreeInfo {
        self.catalog.tree
    }

    fn token(&self) -> TxnToken {
        self.token
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn is_write(&self) -> bool {
        true
    }
}

impl Transaction for WriteTransaction<'_> {
    fn id(&self) -> TxnId {
        self.txn_id
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if self.state != TxnState::Committed {
            self.rollback_table(0);
            debug!("txn {} aborted ({:?})", self.txn_id, self.state);
        }
        if let Some(guard) = self.guard.take() {
            MutexGuard::unlock_fair(guard);
        }
    }
}

impl fmt::Debug for ReadTransaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("txn_id", &self.meta.txn_id)
            .field("slot", &self.slot)
            .finish()
    }
}

impl fmt::Debug for InactiveTransaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InactiveTransaction").finish()
    }
}

impl fmt::Debug for WriteTransaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("txn_id", &self.txn_id)
            .field("state", &self.state)
            .field("dirty_pages", &self.pager.dirty_count())
            .finish()
    }
}

/// Parent state a nested transaction returns to on abort.
struct Saved {
    catalog: DbState,
    dbs: HashMap<u32, TxnDb>,
    touched: usize,
}

/// A child of a [`WriteTransaction`].
///
/// Dereferences to the parent, so every read and write operation is
/// available. Dropping it without [`commit`](Self::commit) aborts.
pub struct NestedTransaction<'txn, 'env> {
    parent: &'txn mut WriteTransaction<'env>,
    saved: Saved,
    done: bool,
}

impl NestedTransaction<'_, '_> {
    /// Hands every change to the parent.
    pub fn commit(mut self) -> Result<()> {
        if let Err(err) = self.parent.ensure_active() {
            self.rollback();
            return Err(err);
        }
        self.parent.pager.release_savepoint();
        self.done = true;
        debug!("txn {} merged a nested transaction", self.parent.txn_id);
        Ok(())
    }

    /// Discards every change made since [`WriteTransaction::begin_nested`].
    pub fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let parent = &mut *self.parent;
        parent.pager.rollback_savepoint();
        parent.catalog = self.saved.catalog;
        parent.dbs = std::mem::take(&mut self.saved.dbs);
        parent.rollback_table(self.saved.touched);
        parent.state = TxnState::Active;
        parent.epoch += 1;
        debug!("txn {} aborted a nested transaction", parent.txn_id);
    }
}

impl<'env> Deref for NestedTransaction<'_, 'env> {
    type Target = WriteTransaction<'env>;

    fn deref(&self) -> &Self::Target {
        &*self.parent
    }
}

impl DerefMut for NestedTransaction<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.parent
    }
}

impl fmt::Debug for NestedTransaction<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedTransaction")
            .field("parent", &self.parent)
            .finish()
    }
}

impl Drop for NestedTransaction<'_, '_> {
    fn drop(&mut self) {
        self.rollback();
    }
}
