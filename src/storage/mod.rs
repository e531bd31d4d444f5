//! # Storage Module
//!
//! The page store: fixed-size pages over one memory-mapped data file.
//!
//! ## Architecture Overview
//!
//! ```text
//!        readers                         writer
//!           │                               │
//!           ▼                               ▼
//!   ┌───────────────┐              ┌─────────────────┐
//!   │  PageSource   │◄─────────────│    PageSink     │  (mvcc::WritePager)
//!   │ (zero-copy)   │              │ dirty pages,    │
//!   └───────┬───────┘              │ allocate/touch/ │
//!           │                      │ release         │
//!           ▼                      └────────┬────────┘
//!   ┌───────────────┐   write_pages at commit│
//!   │  MmapStorage  │◄───────────────────────┘
//!   └───────────────┘
//! ```
//!
//! Readers see pages straight out of the mapping. The writer stages every
//! page it creates in private buffers; nothing reaches the file before
//! commit, and even then only pages no published snapshot can reach.
//!
//! ## Module Organization
//!
//! - `mmap`: reserved read-only mapping plus positioned writes
//! - `page`: page types and the common 16-byte header
//! - `meta`: the two alternating meta pages and database records
//! - `freelist`: free-list record codec and the in-transaction page pool

mod freelist;
mod meta;
mod mmap;
mod page;

#[cfg(test)]
pub(crate) mod mem;

pub use freelist::{decode_freelist_key, decode_page_list, encode_page_list, freelist_key, PagePool};
pub use meta::{
    decode_db_state, encode_db_state, select_meta, DbRecord, DbState, MetaRecord, MetaState,
    DB_RECORD_SIZE, META_RECORD_SIZE,
};
pub use mmap::MmapStorage;
pub use page::{validate_page, PageHeader, PageType};

pub use crate::config::PAGE_HEADER_SIZE;

/// Page number within the data file.
pub type PageNo = u32;

/// Read access to pages of one snapshot.
pub trait PageSource {
    fn page_size(&self) -> usize;

    /// A run of `count` contiguous pages starting at `page_no`.
    fn pages(&self, page_no: PageNo, count: u32) -> crate::Result<&[u8]>;

    fn page(&self, page_no: PageNo) -> crate::Result<&[u8]> {
        self.pages(page_no, 1)
    }
}

/// Copy-on-write page management for the single writer.
///
/// Only pages created by the current transaction are writable. Touching a
/// page from an older snapshot copies it to a fresh page number and retires
/// the original, which stays readable for older snapshots until reclaimed.
pub trait PageSink: PageSource {
    /// Mutable view of a page (or a whole run) created in this transaction.
    fn page_mut(&mut self, page_no: PageNo) -> crate::Result<&mut [u8]>;

    /// Allocates `count` contiguous zeroed pages.
    fn allocate(&mut self, count: u32) -> crate::Result<PageNo>;

    /// Returns a writable page number holding the content of `page_no`.
    fn touch(&mut self, page_no: PageNo) -> crate::Result<PageNo>;

    /// Frees a run of pages that is no longer referenced by the new snapshot.
    fn release(&mut self, page_no: PageNo, count: u32) -> crate::Result<()>;

    fn is_dirty(&self, page_no: PageNo) -> bool;
}

impl PageSource for MmapStorage {
    fn page_size(&self) -> usize {
        MmapStorage::page_size(self)
    }

    fn pages(&self, page_no: PageNo, count: u32) -> crate::Result<&[u8]> {
        Ok(MmapStorage::pages(self, page_no, count)?)
    }
}
