//! # TurKV - Embedded Copy-on-Write Key-Value Store
//!
//! TurKV keeps ordered key/value databases in a single memory-mapped file.
//! Every write transaction builds a new version of the B+trees it touches
//! by copying pages, then switches to it by writing one meta page. Readers
//! keep using the version they started on, so they never wait for the
//! writer and never see a partial commit.
//!
//! - **Zero-copy reads**: values are slices of the map, valid for the
//!   transaction's lifetime
//! - **No write-ahead log**: the two alternating meta pages are the only
//!   recovery state
//! - **Crash safe**: a torn commit leaves the previous meta page current
//!
//! ## Quick Start
//!
//! ```ignore
//! use turkv::{DatabaseOptions, Environment, Transaction, WriteFlags};
//!
//! let env = Environment::builder()
//!     .map_size(256 * 1024 * 1024)
//!     .open("./store")?;
//!
//! let mut txn = env.begin_write()?;
//! let users = txn.create_database(Some("users"), DatabaseOptions::new())?;
//! txn.put(&users, b"alice", b"admin", WriteFlags::empty())?;
//! txn.commit()?;
//!
//! let txn = env.begin_read()?;
//! assert_eq!(txn.get(&users, b"alice")?, Some(&b"admin"[..]));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Environment / Database / Cursor (env)    │
//! ├──────────────────────────────────────────┤
//! │  Read & write transactions (mvcc)         │
//! ├──────────────────────────────────────────┤
//! │  Copy-on-write B+tree, dup sub-trees      │
//! │  (btree)                                  │
//! ├──────────────────────────────────────────┤
//! │  Pages, meta pages, free list, mmap       │
//! │  (storage)                                │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! store/
//! └── data.tkv    [meta 0][meta 1][tree, overflow and free-list pages ...]
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: page formats, meta pages, the mapped data file
//! - [`btree`]: node layouts, copy-on-write tree operations, comparators
//! - [`mvcc`]: reader table, write pager, transactions
//! - [`env`]: environment, database handles, statistics, backups
//! - [`cursor`]: positioned iteration over a database

#[macro_use]
mod macros;

pub mod btree;
pub mod config;
pub mod cursor;
pub mod env;
mod error;
pub mod mvcc;
pub mod storage;

pub use btree::{
    Comparator, FnComparator, Lexicographic, NativeInteger, ReverseBytes, SharedComparator,
};
pub use cursor::{Cursor, Entry};
pub use env::{
    CopyMode, Database, DatabaseFlags, DatabaseOptions, Durability, EnvConfig, EnvInfo,
    Environment, EnvironmentBuilder, Stat, WriteFlags, WritePolicy,
};
pub use error::{Error, ErrorKind, Result};
pub use mvcc::{
    InactiveTransaction, NestedTransaction, ReadTransaction, Transaction, TxnId, TxnState,
    TxnToken, WriteTransaction,
};
pub use storage::PageNo;
