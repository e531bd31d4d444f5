//! # Multi-Version Concurrency Control (MVCC)
//!
//! Snapshot isolation through copy-on-write pages: one writer, any number
//! of readers, and nobody blocks anybody except writers blocking writers.
//!
//! ## Snapshots
//!
//! A snapshot is one committed meta state: the roots of the free list, the
//! main database and the database catalog, plus the transaction id that
//! produced it. A read transaction copies the current meta state when it
//! begins and reads only pages reachable from it. The writer never modifies
//! such pages; it copies them (see `btree`), so a reader's view stays fixed
//! for its whole lifetime.
//!
//! ```text
//! txn 7 commits ──> meta(7) ──> root A ──> ...      reader R1 (snapshot 7)
//! txn 8 commits ──> meta(8) ──> root A' ──> ...     reader R2 (snapshot 8)
//!                   pages superseded by txn 8 are recorded under key 8
//!                   in the free list and stay intact while R1 lives
//! ```
//!
//! ## Reclamation
//!
//! Pages freed by transaction `F` are reachable only from snapshots older
//! than `F`. The writer computes a threshold when it begins:
//!
//! ```text
//! threshold = oldest registered reader snapshot,  or base + 1 without readers
//! record F is reusable  <=>  F < threshold
//! ```
//!
//! Readers register in the [`ReaderTable`] under the same lock that commits
//! use to publish a new meta state, so a reader can never pick up a
//! snapshot that the writer did not account for.
//!
//! ## Transaction Lifecycle
//!
//! ```text
//! begin_read() ──> Active ──> drop / reset()
//!
//! begin_write() ──> Active ──> commit() ──> Committed
//!                     │
//!                     ├──> abort() / drop ──> Aborted
//!                     └──> fatal error ──> Failed ──> commit() refuses
//! ```
//!
//! ## Module Organization
//!
//! - `readers`: reader slot table and the published meta state
//! - `pager`: the writer's dirty page set, allocator and free-list upkeep
//! - `transaction`: read and write transactions

mod pager;
mod readers;
mod transaction;

pub use pager::WritePager;
pub use readers::ReaderTable;
pub use transaction::{
    InactiveTransaction, NestedTransaction, ReadTransaction, Transaction, TxnToken,
    WriteTransaction,
};

pub(crate) use transaction::sealed;

/// Identifier of a committed snapshot or of the transaction producing one.
pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnState {
    #[default]
    Active,
    Committed,
    Aborted,
    /// A write failed part-way; only abort is possible. Aborting the
    /// nested transaction the failure happened in returns its parent to
    /// `Active`.
    Failed,
}
