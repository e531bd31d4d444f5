//! # Meta Pages
//!
//! Pages 0 and 1 are the durability anchor of the environment. Each holds a
//! complete description of one committed snapshot:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       16    page header (page_type = Meta)
//! 16      16    magic "TurKV meta page\0"
//! 32      4     format version
//! 36      4     page size
//! 40      8     transaction id
//! 48      4     last_page (high-water mark: first never-allocated page)
//! 52      4     flags (reserved)
//! 56      8     map size at commit time
//! 64      40    free-list database record
//! 104     40    main (unnamed) database record
//! 144     40    catalog database record (named databases)
//! 184     8     CRC-64/ECMA-182 over bytes 16..184
//! ```
//!
//! Commit `t` writes slot `t % 2`, so the previous snapshot stays intact
//! until the new one is fully on disk. At open the valid slot with the
//! highest transaction id wins; a torn or zeroed slot simply loses.
//!
//! ## Database Records
//!
//! The same 40-byte [`DbRecord`] describes the free list, the main database,
//! every named database (as catalog values) and every duplicate sub-tree
//! (as leaf cell data).

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};
use log::warn;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::TreeInfo;
use crate::config::{FORMAT_VERSION, MAX_PAGE_SIZE, META_MAGIC, MIN_PAGE_SIZE, PAGE_HEADER_SIZE};
use crate::error::Error;
use crate::{PageNo, TxnId};

use super::page::{PageHeader, PageType};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub const DB_RECORD_SIZE: usize = 40;
pub const META_RECORD_SIZE: usize = 176;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DbRecord {
    flags: U32,
    depth: U16,
    reserved: U16,
    root: U32,
    leaf_pages: U32,
    branch_pages: U32,
    overflow_pages: U32,
    entries: U64,
    sequence: U64,
}

const _: () = assert!(size_of::<DbRecord>() == DB_RECORD_SIZE);

/// Native form of a [`DbRecord`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbState {
    pub flags: u32,
    pub tree: TreeInfo,
    pub sequence: u64,
}

impl DbState {
    pub fn empty(flags: u32) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }
}

impl DbRecord {
    zerocopy_getters! {
        flags: u32,
        entries: u64,
        sequence: u64,
    }

    pub fn from_state(state: &DbState) -> Self {
        let tree = &state.tree;
        Self {
            flags: U32::new(state.flags),
            depth: U16::new(tree.depth),
            reserved: U16::new(0),
            root: U32::new(tree.root),
            leaf_pages: U32::new(tree.leaf_pages),
            branch_pages: U32::new(tree.branch_pages),
            overflow_pages: U32::new(tree.overflow_pages),
            entries: U64::new(tree.entries),
            sequence: U64::new(state.sequence),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() == DB_RECORD_SIZE,
            "database record has {} bytes, expected {}",
            bytes.len(),
            DB_RECORD_SIZE
        );

        Self::ref_from_bytes(bytes).map_err(|e| eyre::eyre!("failed to parse DbRecord: {:?}", e))
    }

    pub fn state(&self) -> DbState {
        DbState {
            flags: self.flags.get(),
            tree: TreeInfo {
                root: self.root.get(),
                depth: self.depth.get(),
                leaf_pages: self.leaf_pages.get(),
                branch_pages: self.branch_pages.get(),
                overflow_pages: self.overflow_pages.get(),
                entries: self.entries.get(),
            },
            sequence: self.sequence.get(),
        }
    }
}

/// Decodes a record stored as a cell value.
pub fn decode_db_state(bytes: &[u8]) -> Result<DbState> {
    Ok(DbRecord::from_bytes(bytes)?.state())
}

pub fn encode_db_state(state: &DbState) -> [u8; DB_RECORD_SIZE] {
    let mut out = [0u8; DB_RECORD_SIZE];
    out.copy_from_slice(DbRecord::from_state(state).as_bytes());
    out
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaRecord {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    txn_id: U64,
    last_page: U32,
    flags: U32,
    map_size: U64,
    free_db: DbRecord,
    main_db: DbRecord,
    catalog_db: DbRecord,
    checksum: U64,
}

const _: () = assert!(size_of::<MetaRecord>() == META_RECORD_SIZE);
const _: () = assert!(PAGE_HEADER_SIZE + META_RECORD_SIZE <= MIN_PAGE_SIZE);

/// Everything a snapshot needs, decoded from a meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaState {
    pub txn_id: TxnId,
    pub page_size: u32,
    pub last_page: PageNo,
    pub map_size: u64,
    pub free: DbState,
    pub main: DbState,
    pub catalog: DbState,
}

impl MetaState {
    pub fn initial(page_size: u32, map_size: u64, first_free_page: PageNo) -> Self {
        Self {
            txn_id: 0,
            page_size,
            last_page: first_free_page,
            map_size,
            free: DbState::default(),
            main: DbState::default(),
            catalog: DbState::default(),
        }
    }

    /// Meta slot this snapshot is written to.
    pub fn slot(&self) -> PageNo {
        (self.txn_id % 2) as PageNo
    }
}

impl MetaRecord {
    zerocopy_getters! {
        version: u32,
        page_size: u32,
        txn_id: u64,
        checksum: u64,
    }

    pub fn new(state: &MetaState) -> Self {
        let mut record = Self {
            magic: META_MAGIC,
            version: U32::new(FORMAT_VERSION),
            page_size: U32::new(state.page_size),
            txn_id: U64::new(state.txn_id),
            last_page: U32::new(state.last_page),
            flags: U32::new(0),
            map_size: U64::new(state.map_size),
            free_db: DbRecord::from_state(&state.free),
            main_db: DbRecord::from_state(&state.main),
            catalog_db: DbRecord::from_state(&state.catalog),
            checksum: U64::new(0),
        };
        record.checksum = U64::new(record.compute_checksum());
        record
    }

    fn compute_checksum(&self) -> u64 {
        let bytes = self.as_bytes();
        CRC64.checksum(&bytes[..META_RECORD_SIZE - 8])
    }

    /// Parses and validates the meta record of a meta page.
    pub fn from_page(page: &[u8]) -> Result<&Self> {
        let (header, body) = PageHeader::split(page)?;

        ensure!(
            header.page_type() == PageType::Meta,
            "expected Meta page, got {:?}",
            header.page_type()
        );

        ensure!(
            body.len() >= META_RECORD_SIZE,
            "buffer too small for MetaRecord: {} < {}",
            body.len(),
            META_RECORD_SIZE
        );

        let record = Self::ref_from_bytes(&body[..META_RECORD_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse MetaRecord: {:?}", e))?;

        ensure!(record.magic == META_MAGIC, "invalid magic bytes in meta page");

        ensure!(
            record.version() == FORMAT_VERSION,
            "unsupported version: {} (expected {})",
            record.version(),
            FORMAT_VERSION
        );

        let expected = record.compute_checksum();
        ensure!(
            record.checksum() == expected,
            "meta checksum mismatch: stored {:016x}, computed {:016x}",
            record.checksum(),
            expected
        );

        Ok(record)
    }

    pub fn state(&self) -> MetaState {
        MetaState {
            txn_id: self.txn_id(),
            page_size: self.page_size(),
            last_page: self.last_page.get(),
            map_size: self.map_size.get(),
            free: self.free_db.state(),
            main: self.main_db.state(),
            catalog: self.catalog_db.state(),
        }
    }

    /// Renders a complete meta page of `page_size` bytes.
    pub fn to_page(&self, page_size: usize) -> Vec<u8> {
        let mut page = vec![0u8; page_size];
        let header = PageHeader::new(PageType::Meta, page_size);
        page[..PAGE_HEADER_SIZE].copy_from_slice(header.as_bytes());
        page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_RECORD_SIZE]
            .copy_from_slice(self.as_bytes());
        page
    }
}

fn read_slot(head: &[u8], offset: usize) -> Result<MetaState> {
    ensure!(
        head.len() >= offset + PAGE_HEADER_SIZE + META_RECORD_SIZE,
        "file too short for meta page at offset {}",
        offset
    );
    Ok(MetaRecord::from_page(&head[offset..])?.state())
}

/// Picks the authoritative meta page from the first bytes of a data file.
///
/// Slot 0 sits at offset 0 and tells the page size; slot 1 sits one page
/// later. When slot 0 is unreadable every supported page size is probed for
/// a valid slot 1 whose recorded page size matches its position.
pub fn select_meta(head: &[u8]) -> crate::Result<MetaState> {
    let first = read_slot(head, 0);

    if let Ok(meta0) = &first {
        let page_size = meta0.page_size as usize;
        return match read_slot(head, page_size) {
            Ok(meta1) if meta1.page_size == meta0.page_size && meta1.txn_id > meta0.txn_id => {
                Ok(meta1)
            }
            Ok(_) => Ok(*meta0),
            Err(err) => {
                warn!("meta page 1 rejected: {err:#}");
                Ok(*meta0)
            }
        };
    }

    if let Err(err) = &first {
        warn!("meta page 0 rejected: {err:#}");
    }

    let mut page_size = MIN_PAGE_SIZE;
    while page_size <= MAX_PAGE_SIZE {
        if let Ok(meta1) = read_slot(head, page_size) {
            if meta1.page_size as usize == page_size {
                return Ok(meta1);
            }
        }
        page_size *= 2;
    }

    Err(Error::corrupted("no valid meta page"))
}
