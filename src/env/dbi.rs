//! # Database Handles
//!
//! A [`Database`] is a cheap, clonable handle naming one tree of the
//! environment: the main (unnamed) database or a named database from the
//! catalog. Handles are resolved against the environment's slot table:
//!
//! ```text
//! DbTable.slots
//! +------+-------------------------------+--------------------------------------+
//! | dbi  | names (since txn)             | config (flags, comparators)          |
//! +------+-------------------------------+--------------------------------------+
//! | 0    | (main)                        | set by the first open                |
//! | 1    | (0, "users")                  | DUP_SORT, lexicographic/lexicographic|
//! | 2    | (0, "tmp") (12, deleted)      | default                              |
//! | 3    | (free)                        |                                      |
//! +------+-------------------------------+--------------------------------------+
//! ```
//!
//! A handle is resolved to the name its database has in the caller's
//! snapshot. Once no snapshot can see a deleted database its slot is
//! freed; a handle whose slot was emptied or reused fails with
//! `ConfigMismatch`.
//!
//! ## Configuration Checks
//!
//! Persistent flags are stored with the database. Reopening a non-empty
//! database with different flags, or an open database with different
//! comparators, is rejected. Opening with default options adopts whatever
//! the database already uses.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::btree::tree::get;
use crate::btree::{
    Comparator, Lexicographic, NativeInteger, ReverseBytes, SharedComparator, TreeCursor,
    TreeInfo, TreeOrder,
};
use crate::storage::{decode_db_state, DbState, PageSource};
use crate::{Error, Result, TxnId};

bitflags! {
    /// Options of a database. All but `CREATE` are stored with it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DatabaseFlags: u32 {
        /// Keys compare from their last byte backwards.
        const REVERSE_KEY = 0x02;
        /// Several sorted values per key.
        const DUP_SORT = 0x04;
        /// Keys are 4- or 8-byte native-endian unsigned integers.
        const INTEGER_KEY = 0x08;
        /// All values of a key have the same size.
        const DUP_FIXED = 0x10;
        /// Duplicate values are native-endian unsigned integers.
        const INTEGER_DUP = 0x20;
        /// Duplicate values compare from their last byte backwards.
        const REVERSE_DUP = 0x40;
        /// Create the named database if it does not exist.
        const CREATE = 0x4_0000;
    }
}

impl DatabaseFlags {
    pub fn persistent(self) -> Self {
        self.difference(Self::CREATE)
    }

    fn dup_options() -> Self {
        Self::DUP_FIXED | Self::INTEGER_DUP | Self::REVERSE_DUP
    }
}

bitflags! {
    /// Modifiers of a put.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        /// Fail with `KeyExists` if the key is present.
        const NO_OVERWRITE = 0x10;
        /// Dup-sort only: an existing key/value pair is left alone.
        const NO_DUP_DATA = 0x20;
        /// Cursor put: replace the value at the cursor position.
        const CURRENT = 0x40;
        /// The key sorts after every key in the database.
        const APPEND = 0x2_0000;
        /// The value sorts after every value of the key.
        const APPEND_DUP = 0x4_0000;
    }
}

/// How to open a database.
#[derive(Clone, Default)]
pub struct DatabaseOptions {
    flags: DatabaseFlags,
    key_cmp: Option<SharedComparator>,
    dup_cmp: Option<SharedComparator>,
}

impl DatabaseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: DatabaseFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn create(self) -> Self {
        self.flags(DatabaseFlags::CREATE)
    }

    pub fn dup_sort(self) -> Self {
        self.flags(DatabaseFlags::DUP_SORT)
    }

    /// Orders keys with a custom comparator.
    pub fn key_comparator(mut self, cmp: SharedComparator) -> Self {
        self.key_cmp = Some(cmp);
        self
    }

    /// Orders duplicate values with a custom comparator. Implies `DUP_SORT`.
    pub fn dup_comparator(mut self, cmp: SharedComparator) -> Self {
        self.dup_cmp = Some(cmp);
        self.dup_sort()
    }

    pub fn get_flags(&self) -> DatabaseFlags {
        self.flags
    }

    pub(crate) fn wants_create(&self) -> bool {
        self.flags.contains(DatabaseFlags::CREATE)
    }

    /// No persistent flags and no custom comparators.
    fn is_default(&self) -> bool {
        self.flags.persistent().is_empty() && self.key_cmp.is_none() && self.dup_cmp.is_none()
    }

    fn validate(&self) -> Result<()> {
        let flags = self.flags;
        if flags.intersects(DatabaseFlags::dup_options()) && !flags.contains(DatabaseFlags::DUP_SORT) {
            return Err(Error::Incompatible(format!(
                "{:?} requires DUP_SORT",
                flags & DatabaseFlags::dup_options()
            )));
        }
        Ok(())
    }
}

impl From<DatabaseFlags> for DatabaseOptions {
    fn from(flags: DatabaseFlags) -> Self {
        Self::new().flags(flags)
    }
}

impl fmt::Debug for DatabaseOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseOptions")
            .field("flags", &self.flags)
            .field("key_cmp", &self.key_cmp.as_ref().map(|c| c.name().to_owned()))
            .field("dup_cmp", &self.dup_cmp.as_ref().map(|c| c.name().to_owned()))
            .finish()
    }
}

pub(crate) struct DbConfig {
    dbi: u32,
    flags: DatabaseFlags,
    key_cmp: SharedComparator,
    dup_cmp: Option<SharedComparator>,
}

impl DbConfig {
    fn new(dbi: u32, flags: DatabaseFlags, options: &DatabaseOptions) -> Self {
        let key_cmp = options.key_cmp.clone().unwrap_or_else(|| {
            if flags.contains(DatabaseFlags::INTEGER_KEY) {
                Arc::new(NativeInteger)
            } else if flags.contains(DatabaseFlags::REVERSE_KEY) {
                Arc::new(ReverseBytes)
            } else {
                Arc::new(Lexicographic)
            }
        });

        let dup_cmp = flags.contains(DatabaseFlags::DUP_SORT).then(|| {
            options.dup_cmp.clone().unwrap_or_else(|| {
                if flags.contains(DatabaseFlags::INTEGER_DUP) {
                    Arc::new(NativeInteger)
                } else if flags.contains(DatabaseFlags::REVERSE_DUP) {
                    Arc::new(ReverseBytes)
                } else {
                    Arc::new(Lexicographic)
                }
            })
        });

        Self {
            dbi,
            flags,
            key_cmp,
            dup_cmp,
        }
    }

    pub fn order(&self) -> TreeOrder<'_> {
        TreeOrder {
            key: &*self.key_cmp,
            dup: self.dup_cmp.as_deref(),
            fixed_dups: self.flags.contains(DatabaseFlags::DUP_FIXED),
        }
    }

    fn same_as(&self, other: &DbConfig) -> bool {
        self.flags == other.flags
            && self.key_cmp.name() == other.key_cmp.name()
            && self.dup_cmp.as_ref().map(|c| c.name()) == other.dup_cmp.as_ref().map(|c| c.name())
    }
}

/// Handle of an open database.
#[derive(Clone)]
pub struct Database {
    config: Arc<DbConfig>,
}

impl Database {
    pub fn flags(&self) -> DatabaseFlags {
        self.config.flags
    }

    pub fn is_dup_sort(&self) -> bool {
        self.config.flags.contains(DatabaseFlags::DUP_SORT)
    }

    pub fn is_main(&self) -> bool {
        self.config.dbi == 0
    }

    pub(crate) fn dbi(&self) -> u32 {
        self.config.dbi
    }

    pub(crate) fn order(&self) -> TreeOrder<'_> {
        self.config.order()
    }

    pub(crate) fn key_cmp(&self) -> &dyn Comparator {
        &*self.config.key_cmp
    }

    pub(crate) fn dup_cmp(&self) -> Option<&dyn Comparator> {
        self.config.dup_cmp.as_deref()
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("dbi", &self.config.dbi)
            .field("flags", &self.config.flags)
            .finish()
    }
}

/// One open database.
///
/// `names` says what the database is called from which transaction on,
/// oldest first; `None` marks its deletion. The main database has a
/// single unnamed entry.
pub(crate) struct DbSlot {
    names: Vec<(TxnId, Option<Vec<u8>>)>,
    config: Arc<DbConfig>,
}

impl DbSlot {
    /// Name as seen by snapshot `at`; `None` if the database did not
    /// exist yet.
    fn name_at(&self, at: TxnId) -> Option<Option<&[u8]>> {
        self.names
            .iter()
            .rev()
            .find(|(since, _)| *since <= at)
            .map(|(_, name)| name.as_deref())
    }

    fn is_deleted(&self) -> bool {
        matches!(self.names.last(), Some((_, None)))
    }
}

/// Open databases of one environment.
///
/// Renames and deletions are recorded under the id of the writing
/// transaction, so every snapshot resolves a handle to the name it had at
/// that snapshot:
///
/// ```text
/// slot 1: (0, "foo") (7, "foobar") (9, deleted)
///   snapshot 5 -> "foo", snapshot 8 -> "foobar", snapshot 9 -> gone
/// ```
pub(crate) struct DbTable {
    slots: Vec<Option<DbSlot>>,
}

impl DbTable {
    pub fn new() -> Self {
        Self {
            slots: vec![None],
        }
    }

    fn find(&self, name: Option<&[u8]>, at: TxnId) -> Option<&DbSlot> {
        match name {
            None => self.slots.first().and_then(Option::as_ref),
            Some(name) => self
                .slots
                .iter()
                .skip(1)
                .flatten()
                .find(|slot| slot.name_at(at) == Some(Some(name))),
        }
    }

    pub fn named_count(&self) -> u32 {
        self.slots
            .iter()
            .skip(1)
            .flatten()
            .filter(|slot| !slot.is_deleted())
            .count() as u32
    }

    fn slot_of(&self, db: &Database) -> Result<&DbSlot> {
        match self.slots.get(db.dbi() as usize) {
            Some(Some(slot)) if Arc::ptr_eq(&slot.config, &db.config) => Ok(slot),
            _ => Err(Error::ConfigMismatch(format!(
                "database handle {} is no longer open",
                db.dbi()
            ))),
        }
    }

    /// Name of a handle's database in snapshot `at`, `None` for the main
    /// database.
    pub fn name_of(&self, db: &Database, at: TxnId) -> Result<Option<Vec<u8>>> {
        let slot = self.slot_of(db)?;
        if db.is_main() {
            return Ok(None);
        }
        match slot.name_at(at) {
            Some(Some(name)) => Ok(Some(name.to_vec())),
            Some(None) => Err(Error::ConfigMismatch(format!(
                "database handle {} refers to a deleted database",
                db.dbi()
            ))),
            None => Err(Error::NotFound),
        }
    }

    /// Resolves a handle for `name` as seen by snapshot `at`.
    ///
    /// `stored` is the record found in that snapshot, if any. A database
    /// missing from it is being created by transaction `at`. Returns the
    /// handle and whether a new slot was created.
    pub fn open(
        &mut self,
        name: Option<&[u8]>,
        options: &DatabaseOptions,
        stored: Option<&DbState>,
        at: TxnId,
        max_named: u32,
    ) -> Result<(Database, bool)> {
        options.validate()?;

        let requested = options.flags.persistent();
        let flags = match stored {
            Some(state) => {
                let stored_flags = DatabaseFlags::from_bits_truncate(state.flags);
                if options.is_default() {
                    stored_flags
                } else if stored_flags == requested || state.tree.is_empty() {
                    requested
                } else {
                    return Err(Error::ConfigMismatch(format!(
                        "database stored with {stored_flags:?}, opened with {requested:?}"
                    )));
                }
            }
            None => requested,
        };

        if let Some(slot) = self.find(name, at) {
            let candidate = DbConfig::new(slot.config.dbi, flags, options);
            if options.is_default() || slot.config.same_as(&candidate) {
                return Ok((
                    Database {
                        config: slot.config.clone(),
                    },
                    false,
                ));
            }
            return Err(Error::ConfigMismatch(format!(
                "database already open with {:?} and comparator '{}'",
                slot.config.flags,
                slot.config.key_cmp.name()
            )));
        }

        let dbi = match name {
            None => 0,
            Some(_) => {
                if self.named_count() >= max_named {
                    return Err(Error::DatabasesFull { max: max_named });
                }
                self.free_slot()
            }
        };

        // Databases already stored are known to every live snapshot.
        let since = if stored.is_some() { 0 } else { at };
        let config = Arc::new(DbConfig::new(dbi as u32, flags, options));
        self.slots[dbi] = Some(DbSlot {
            names: vec![(since, name.map(<[u8]>::to_vec))],
            config: config.clone(),
        });
        Ok((Database { config }, true))
    }

    fn free_slot(&mut self) -> usize {
        match self.slots.iter().skip(1).position(Option::is_none) {
            Some(idx) => idx + 1,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        }
    }

    /// Whether snapshot `at` has an open database called `name`.
    pub fn contains(&self, name: &[u8], at: TxnId) -> bool {
        self.find(Some(name), at).is_some()
    }

    /// Renames a database as of transaction `at`.
    pub fn rename(&mut self, dbi: u32, name: Vec<u8>, at: TxnId) {
        if let Some(Some(slot)) = self.slots.get_mut(dbi as usize) {
            slot.names.push((at, Some(name)));
        }
    }

    /// Deletes a named database as of transaction `at`. Its handles stay
    /// usable by older snapshots.
    pub fn delete(&mut self, dbi: u32, at: TxnId) {
        if dbi == 0 {
            return;
        }
        if let Some(Some(slot)) = self.slots.get_mut(dbi as usize) {
            slot.names.push((at, None));
        }
    }

    /// Undoes changes transaction `at` made to the slots `dbis`, one name
    /// entry per listed slot, newest first. Slots left without a name are
    /// emptied.
    pub fn rollback(&mut self, at: TxnId, dbis: &[u32]) {
        for &dbi in dbis.iter().rev() {
            let Some(entry) = self.slots.get_mut(dbi as usize) else {
                continue;
            };
            if let Some(slot) = entry {
                if slot.names.last().is_some_and(|(since, _)| *since == at) {
                    slot.names.pop();
                }
                if slot.names.is_empty() {
                    *entry = None;
                }
            }
        }
    }

    /// Drops name history no snapshot at or after `oldest` can reach, and
    /// frees slots of databases deleted before it.
    pub fn prune(&mut self, oldest: TxnId) {
        for entry in self.slots.iter_mut().skip(1) {
            let Some(slot) = entry else {
                continue;
            };
            while slot.names.len() > 1 && slot.names[1].0 <= oldest {
                slot.names.remove(0);
            }
            if let [(since, None)] = slot.names.as_slice() {
                if *since <= oldest {
                    *entry = None;
                }
            }
        }
    }
}

/// Record of a named database in the catalog tree.
pub(crate) fn catalog_lookup<P: PageSource + ?Sized>(
    pager: &P,
    catalog: &TreeInfo,
    name: &[u8],
) -> Result<Option<DbState>> {
    match get(pager, catalog, &Lexicographic, name)? {
        Some(cell) => Ok(Some(decode_db_state(cell.data)?)),
        None => Ok(None),
    }
}

pub(crate) fn catalog_names<P: PageSource + ?Sized>(
    pager: &P,
    catalog: &TreeInfo,
) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut cursor = TreeCursor::new();
    let mut more = cursor.first(pager, catalog)?;
    while more {
        names.push(String::from_utf8_lossy(cursor.cell(pager)?.key).into_owned());
        more = cursor.next(pager)?;
    }
    Ok(names)
}
