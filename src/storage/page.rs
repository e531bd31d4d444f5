//! # Page Header and Page Types
//!
//! Every page except the two meta pages starts with a 16-byte header:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       1     page_type (Meta=0x01, Branch=0x02, Leaf=0x03, Overflow=0x04)
//! 1       1     flags (reserved, zero)
//! 2       2     cell_count
//! 4       2     free_start (end of slot array, relative to the body)
//! 6       2     free_end (start of cell content, relative to the body)
//! 8       2     frag_bytes (dead cell bytes between free_end and the page end)
//! 10      2     reserved
//! 12      4     right_child (branch) / run length in pages (overflow)
//! ```
//!
//! All multi-byte fields are little-endian. Offsets are relative to the
//! page *body*, the bytes after the header, so a 64KB page still addresses
//! its whole body with u16 offsets.
//!
//! ## Body Layout (branch and leaf)
//!
//! ```text
//! +------------------+
//! | Header (16 bytes)|
//! +------------------+  body offset 0
//! | Slot array       |  grows toward the page end
//! +------------------+  free_start
//! | Free space       |
//! +------------------+  free_end
//! | Cell content     |  grows toward the header
//! +------------------+  body end
//! ```
//!
//! Meta pages carry the same header with `page_type = Meta` followed by the
//! meta record (see `meta.rs`).

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::PAGE_HEADER_SIZE;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    Meta = 0x01,
    Branch = 0x02,
    Leaf = 0x03,
    Overflow = 0x04,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::Meta,
            0x02 => PageType::Branch,
            0x03 => PageType::Leaf,
            0x04 => PageType::Overflow,
            _ => PageType::Unknown,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    page_type: u8,
    flags: u8,
    cell_count: U16,
    free_start: U16,
    free_end: U16,
    frag_bytes: U16,
    reserved: U16,
    right_child: U32,
}

const _: () = assert!(size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    zerocopy_accessors! {
        cell_count: u16,
        free_start: u16,
        free_end: u16,
        frag_bytes: u16,
        right_child: u32,
    }

    pub fn new(page_type: PageType, page_size: usize) -> Self {
        Self {
            page_type: page_type as u8,
            flags: 0,
            cell_count: U16::new(0),
            free_start: U16::new(0),
            free_end: U16::new((page_size - PAGE_HEADER_SIZE) as u16),
            frag_bytes: U16::new(0),
            reserved: U16::new(0),
            right_child: U32::new(0),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Ok(Self::split(data)?.0)
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        Ok(Self::split_mut(data)?.0)
    }

    /// Splits a page into its header and body.
    pub fn split(data: &[u8]) -> Result<(&Self, &[u8])> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::ref_from_prefix(data).map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn split_mut(data: &mut [u8]) -> Result<(&mut Self, &mut [u8])> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::mut_from_prefix(data).map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        data[..PAGE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.page_type)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.page_type = page_type as u8;
    }

    pub fn free_space(&self) -> usize {
        self.free_end().saturating_sub(self.free_start()) as usize
    }

    /// Pages in an overflow run, stored in the first page's header.
    pub fn overflow_pages(&self) -> u32 {
        self.right_child()
    }

    pub fn set_overflow_pages(&mut self, count: u32) {
        self.set_right_child(count);
    }
}

/// Checks the header of a tree page for internal consistency.
pub fn validate_page(data: &[u8], page_size: usize) -> Result<PageType> {
    ensure!(
        data.len() >= page_size,
        "invalid page length: {} < {}",
        data.len(),
        page_size
    );

    let header = PageHeader::from_bytes(data)?;
    let page_type = header.page_type();

    ensure!(
        page_type != PageType::Unknown,
        "invalid page type: {:02x}",
        header.page_type
    );

    if matches!(page_type, PageType::Branch | PageType::Leaf) {
        let body = page_size - PAGE_HEADER_SIZE;

        ensure!(
            header.free_end() as usize <= body,
            "free_end {} > body size {}",
            header.free_end(),
            body
        );

        ensure!(
            header.free_start() <= header.free_end(),
            "free_start {} > free_end {}",
            header.free_start(),
            header.free_end()
        );
    }

    Ok(page_type)
}
