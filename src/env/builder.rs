//! # Environment Builder
//!
//! `EnvironmentBuilder` configures and opens an [`Environment`]. Settings
//! are chained before calling `open()`:
//!
//! ```ignore
//! let env = Environment::builder()
//!     .map_size(256 * 1024 * 1024)
//!     .max_named_databases(8)
//!     .durability(Durability::NoMetaSync)
//!     .open("./store")?;
//! ```
//!
//! ## Configuration Options
//!
//! | Option               | Default            | Description                                |
//! |----------------------|--------------------|--------------------------------------------|
//! | map_size             | 64 MiB             | Upper bound of the data file               |
//! | growth_increment     | 1 MiB              | Step in which the data file is extended    |
//! | max_named_databases  | 32                 | Named databases open at the same time      |
//! | max_readers          | 126                | Concurrent read transactions               |
//! | durability           | FullSync           | Which commit steps call `fsync`            |
//! | page_size            | OS page size       | Page size of a new environment             |
//! | write_policy         | Block              | `begin_write` waits or fails fast          |
//!
//! ## Page Size
//!
//! The page size is fixed when the data file is created. Opening an
//! existing file takes its page size; asking for a different one explicitly
//! is a configuration mismatch.

use std::path::Path;

use super::Environment;
use crate::config::{
    DEFAULT_GROWTH_INCREMENT, DEFAULT_MAP_SIZE, DEFAULT_MAX_NAMED_DATABASES, DEFAULT_MAX_READERS,
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_MAP_PAGES, MIN_PAGE_SIZE,
};
use crate::{Error, Result};

/// Which steps of a commit are flushed to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Data pages and the meta page are synced.
    #[default]
    FullSync,
    /// Data pages are synced before the meta page is written; the meta
    /// page itself is not. A crash may lose the last commit but never
    /// corrupts the environment.
    NoMetaSync,
    /// Nothing is synced. A crash may lose any number of recent commits.
    NoSync,
}

/// What `begin_write` does while another write transaction is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Wait for the lock; waiters are served in arrival order.
    #[default]
    Block,
    /// Fail with `WouldBlock`.
    Try,
}

/// Runtime options of an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub map_size_max: u64,
    pub map_growth_increment: u64,
    pub max_named_databases: u32,
    pub max_readers: u32,
    pub durability: Durability,
    /// `None` picks the OS page size for new files and the stored page
    /// size for existing ones.
    pub page_size: Option<usize>,
    pub write_policy: WritePolicy,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            map_size_max: DEFAULT_MAP_SIZE,
            map_growth_increment: DEFAULT_GROWTH_INCREMENT,
            max_named_databases: DEFAULT_MAX_NAMED_DATABASES,
            max_readers: DEFAULT_MAX_READERS,
            durability: Durability::default(),
            page_size: None,
            write_policy: WritePolicy::default(),
        }
    }
}

impl EnvConfig {
    /// Checks the options against the page size they will be used with.
    pub(crate) fn validate(&self, page_size: usize) -> Result<()> {
        check_page_size(page_size)?;
        let min_map = MIN_MAP_PAGES * page_size as u64;
        if self.map_size_max < min_map {
            return Err(Error::Incompatible(format!(
                "map size {} is below the minimum of {} bytes",
                self.map_size_max, min_map
            )));
        }
        if self.map_growth_increment < page_size as u64 {
            return Err(Error::Incompatible(format!(
                "growth increment {} is smaller than one page",
                self.map_growth_increment
            )));
        }
        if self.max_readers == 0 {
            return Err(Error::Incompatible("max_readers must be at least 1".into()));
        }
        Ok(())
    }
}

pub(crate) fn check_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(Error::Incompatible(format!(
            "page size {page_size} is not a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}"
        )));
    }
    Ok(())
}

/// Page size of the operating system, clamped to the supported range.
pub(crate) fn os_page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions and only reads a constant.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 && (size as usize).is_power_of_two() {
            return (size as usize).clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);
        }
    }
    DEFAULT_PAGE_SIZE
}

/// Builder for configuring and opening an environment.
///
/// Use `Environment::builder()` to create one.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentBuilder {
    config: EnvConfig,
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum size of the data file.
    ///
    /// The whole range is reserved in the address space when the
    /// environment opens; the file itself grows on demand. Commits that
    /// would need more pages fail with `OutOfSpace`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let env = Environment::builder()
    ///     .map_size(1 << 30)
    ///     .open("./store")?;
    /// ```
    pub fn map_size(mut self, bytes: u64) -> Self {
        self.config.map_size_max = bytes;
        self
    }

    /// Sets the step in which the data file is extended.
    pub fn growth_increment(mut self, bytes: u64) -> Self {
        self.config.map_growth_increment = bytes;
        self
    }

    /// Sets how many named databases may be open at once.
    pub fn max_named_databases(mut self, count: u32) -> Self {
        self.config.max_named_databases = count;
        self
    }

    /// Sets how many read transactions may be live at once.
    pub fn max_readers(mut self, count: u32) -> Self {
        self.config.max_readers = count;
        self
    }

    /// Sets which commit steps are synced to disk.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let env = Environment::builder()
    ///     .durability(Durability::NoSync)  // bulk load, sync manually
    ///     .open("./store")?;
    /// env.sync(true)?;
    /// ```
    pub fn durability(mut self, durability: Durability) -> Self {
        self.config.durability = durability;
        self
    }

    /// Sets the page size of a new environment. Must be a power of two
    /// between 512 and 65536.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.config.page_size = Some(bytes);
        self
    }

    /// Sets what `begin_write` does while another writer is active.
    pub fn write_policy(mut self, policy: WritePolicy) -> Self {
        self.config.write_policy = policy;
        self
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Opens or creates the environment in directory `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - An option is out of range (`Incompatible`)
    /// - The stored page size differs from an explicit `page_size` (`ConfigMismatch`)
    /// - Neither meta page is valid (`Corrupted`)
    /// - The directory or data file cannot be created or mapped (`Io`)
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Environment> {
        Environment::open_with_config(path.as_ref(), self.config)
    }
}
