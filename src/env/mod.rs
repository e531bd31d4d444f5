//! # Environment
//!
//! An [`Environment`] owns one data file, maps it, and hands out
//! transactions. Everything else hangs off it:
//!
//! ```text
//! Environment
//! ├── storage: MmapStorage      data file and its mapping
//! ├── readers: ReaderTable      live snapshots + last committed meta state
//! ├── write_lock                one write transaction at a time
//! └── dbs: DbTable              open database handles
//! ```
//!
//! ## Directory Layout
//!
//! ```text
//! path/
//! └── data.tkv     meta page 0, meta page 1, tree pages ...
//! ```
//!
//! ## Opening
//!
//! 1. Create the directory if needed
//! 2. Existing file: read the head, pick the valid meta page with the
//!    highest transaction id, adopt its page size
//! 3. New file: write two identical meta pages for transaction 0
//! 4. Map the file with the configured map size
//!
//! ## Thread Safety
//!
//! `Environment` is `Send + Sync`; share it by reference or `Arc`. Read
//! transactions may live on any thread. A write transaction holds the
//! writer lock and stays on the thread that began it.

mod builder;
mod copy;
pub(crate) mod dbi;
mod stat;

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::{Mutex, RwLock};

pub use builder::{Durability, EnvConfig, EnvironmentBuilder, WritePolicy};
pub use copy::CopyMode;
pub use dbi::{Database, DatabaseFlags, DatabaseOptions, WriteFlags};
pub use stat::{EnvInfo, Stat};

use crate::config::{max_key_size, DATA_FILE_NAME, FIRST_DATA_PAGE, MAX_PAGE_SIZE};
use crate::mvcc::{ReadTransaction, ReaderTable, TxnToken, WriteTransaction};
use crate::storage::{select_meta, MetaRecord, MetaState, MmapStorage};
use crate::{Error, Result};
use dbi::DbTable;

pub struct Environment {
    path: PathBuf,
    pub(crate) config: EnvConfig,
    pub(crate) storage: MmapStorage,
    pub(crate) readers: ReaderTable,
    write_lock: Mutex<()>,
    pub(crate) dbs: RwLock<DbTable>,
    tokens: AtomicU64,
}

impl Environment {
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    /// Opens or creates an environment with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path.as_ref(), EnvConfig::default())
    }

    pub(crate) fn open_with_config(path: &Path, config: EnvConfig) -> Result<Self> {
        fs::create_dir_all(path)?;
        let file = path.join(DATA_FILE_NAME);
        let existing = matches!(fs::metadata(&file), Ok(meta) if meta.len() > 0);

        let (storage, meta) = if existing {
            Self::open_existing(&file, &config)?
        } else {
            Self::create_new(&file, &config)?
        };

        debug!(
            "opened environment '{}': page size {}, map size {}, txn {} from meta slot {}",
            path.display(),
            storage.page_size(),
            storage.map_size(),
            meta.txn_id,
            meta.slot()
        );

        Ok(Self {
            path: path.to_path_buf(),
            readers: ReaderTable::new(config.max_readers, meta),
            config,
            storage,
            write_lock: Mutex::new(()),
            dbs: RwLock::new(DbTable::new()),
            tokens: AtomicU64::new(1),
        })
    }

    fn open_existing(file: &Path, config: &EnvConfig) -> Result<(MmapStorage, MetaState)> {
        let mut head = Vec::new();
        File::open(file)?
            .take(2 * MAX_PAGE_SIZE as u64)
            .read_to_end(&mut head)?;
        let meta = select_meta(&head)?;

        let page_size = meta.page_size as usize;
        if let Some(requested) = config.page_size {
            if requested != page_size {
                return Err(Error::ConfigMismatch(format!(
                    "environment uses {page_size}-byte pages, {requested} requested"
                )));
            }
        }
        config.validate(page_size)?;

        let storage = MmapStorage::open(file, page_size, config.map_size_max)?;
        if meta.last_page > storage.page_count() {
            return Err(Error::corrupted(format!(
                "meta page of txn {} references page {} beyond the {}-page file",
                meta.txn_id,
                meta.last_page,
                storage.page_count()
            )));
        }
        Ok((storage, meta))
    }

    fn create_new(file: &Path, config: &EnvConfig) -> Result<(MmapStorage, MetaState)> {
        let page_size = config.page_size.unwrap_or_else(builder::os_page_size);
        config.validate(page_size)?;

        let storage = MmapStorage::create(file, page_size, config.map_size_max, FIRST_DATA_PAGE)?;
        let meta = MetaState::initial(page_size as u32, storage.map_size(), FIRST_DATA_PAGE);
        let page = MetaRecord::new(&meta).to_page(page_size);
        storage.write_pages(0, &page)?;
        storage.write_pages(1, &page)?;
        storage.sync()?;
        Ok((storage, meta))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub(crate) fn next_token(&self) -> TxnToken {
        TxnToken::new(self.tokens.fetch_add(1, Ordering::Relaxed))
    }

    /// Starts a read transaction on the latest committed snapshot.
    pub fn begin_read(&self) -> Result<ReadTransaction<'_>> {
        ReadTransaction::new(self)
    }

    /// Starts the write transaction, waiting for the current writer or
    /// failing with `WouldBlock` according to the configured policy.
    pub fn begin_write(&self) -> Result<WriteTransaction<'_>> {
        match self.config.write_policy {
            WritePolicy::Block => Ok(WriteTransaction::new(self, self.write_lock.lock())),
            WritePolicy::Try => self.try_begin_write(),
        }
    }

    /// Starts the write transaction or fails with `WouldBlock`.
    pub fn try_begin_write(&self) -> Result<WriteTransaction<'_>> {
        let guard = self.write_lock.try_lock().ok_or(Error::WouldBlock)?;
        Ok(WriteTransaction::new(self, guard))
    }

    /// Statistics of the main database in the latest snapshot.
    pub fn stat(&self) -> Result<Stat> {
        let meta = self.readers.current();
        Ok(Stat::new(self.storage.page_size(), &meta.main.tree))
    }

    pub fn info(&self) -> EnvInfo {
        let meta = self.readers.current();
        EnvInfo {
            map_size: self.storage.map_size(),
            last_page: meta.last_page,
            last_txn_id: meta.txn_id,
            max_readers: self.readers.capacity(),
            num_readers: self.readers.live(),
            page_size: self.storage.page_size() as u32,
        }
    }

    pub fn page_size(&self) -> usize {
        self.storage.page_size()
    }

    /// Longest key, and longest duplicate value, accepted by `put`.
    pub fn max_key_size(&self) -> usize {
        max_key_size(self.storage.page_size())
    }

    /// Share of the map taken by pages in use or on the free list.
    pub fn percentage_full(&self) -> f64 {
        let used = self.readers.current().last_page as f64;
        used * 100.0 / self.storage.map_pages().max(1) as f64
    }

    /// Flushes the data file. Without `force`, does nothing under
    /// [`Durability::NoSync`].
    pub fn sync(&self, force: bool) -> Result<()> {
        if force || self.config.durability != Durability::NoSync {
            self.storage.sync()?;
        }
        Ok(())
    }

    /// Changes the map size. Taking `&mut self` guarantees that no
    /// transaction is alive.
    pub fn set_map_size(&mut self, bytes: u64) -> Result<()> {
        let config = EnvConfig {
            map_size_max: bytes,
            ..self.config.clone()
        };
        config.validate(self.storage.page_size())?;
        let file_bytes = self.storage.page_count() as u64 * self.storage.page_size() as u64;
        if bytes < file_bytes {
            return Err(Error::Incompatible(format!(
                "map size {bytes} is smaller than the data file ({file_bytes} bytes)"
            )));
        }
        self.storage.remap(bytes)?;
        self.config = config;
        debug!("environment '{}' remapped to {} bytes", self.path.display(), bytes);
        Ok(())
    }

    /// Writes a consistent copy of the latest snapshot into directory
    /// `dest`, which must not contain a data file yet.
    pub fn copy<P: AsRef<Path>>(&self, dest: P, mode: CopyMode) -> Result<()> {
        let txn = self.begin_read()?;
        copy::copy_snapshot(&self.storage, txn.meta(), dest.as_ref(), mode)
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.path)
            .field("page_size", &self.storage.page_size())
            .field("map_size", &self.storage.map_size())
            .finish()
    }
}
