//! # B+Tree Leaf Node Implementation
//!
//! Leaf pages store the entries of a tree. There are no sibling links:
//! under copy-on-write a link would force every neighbour to be copied on
//! each split, so cursors walk leaves through their root-to-leaf stack.
//!
//! ## Slot Array
//!
//! The slot array holds one u16 per cell: the cell's offset in the page body.
//! Slots are kept in key order; cells can sit anywhere in the content area.
//!
//! ## Cell Layout
//!
//! ```text
//! +-------+-----------+------------+-------------+--------------------+
//! | flags | key_len   | data_len   | key         | data               |
//! | (1B)  | (2B LE)   | (4B LE)    | (key_len B) | (stored size)      |
//! +-------+-----------+------------+-------------+--------------------+
//! ```
//!
//! - inline: `data` holds `data_len` value bytes
//! - `BIGDATA`: `data` holds the u32 first page of an overflow run and
//!   `data_len` is the full value length
//! - `DUPDATA`: `data` holds a 40-byte database record describing the
//!   nested tree of duplicate values for this key
//!
//! ## Insertion
//!
//! ```text
//! 1. Caller determines the slot index (search())
//! 2. If contiguous free space is short but fragmented space suffices, compact
//! 3. Write the cell below free_end, shift slots right, write the new slot
//! ```
//!
//! ## Deletion
//!
//! Removing a cell only drops its slot; the cell bytes become fragmentation
//! that is reclaimed by compaction once it exceeds a quarter of the body.

use bitflags::bitflags;
use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::compare::Comparator;
use crate::config::{LEAF_CELL_HEADER_SIZE, LEAF_SLOT_SIZE};
use crate::storage::{PageHeader, PageNo, PageType};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CellFlags: u8 {
        /// Value lives in an overflow run.
        const BIGDATA = 0x01;
        /// Value is a nested tree of duplicates.
        const DUPDATA = 0x02;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct CellHeader {
    flags: u8,
    key_len: U16,
    data_len: U32,
}

const _: () = assert!(size_of::<CellHeader>() == LEAF_CELL_HEADER_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

impl SearchResult {
    pub fn index(self) -> usize {
        match self {
            SearchResult::Found(i) | SearchResult::NotFound(i) => i,
        }
    }
}

/// A decoded leaf cell, borrowing from the page.
#[derive(Debug, Clone, Copy)]
pub struct LeafCell<'a> {
    pub flags: CellFlags,
    pub key: &'a [u8],
    /// Stored bytes: the value, an overflow page number or a dup record.
    pub data: &'a [u8],
    /// Logical value length.
    pub data_len: u32,
}

impl LeafCell<'_> {
    pub fn overflow_page(&self) -> Option<PageNo> {
        if self.flags.contains(CellFlags::BIGDATA) && self.data.len() == 4 {
            Some(PageNo::from_le_bytes([
                self.data[0],
                self.data[1],
                self.data[2],
                self.data[3],
            ]))
        } else {
            None
        }
    }
}

/// Bytes a cell occupies in the content area, excluding its slot.
#[inline]
pub fn cell_size(key_len: usize, stored_len: usize) -> usize {
    LEAF_CELL_HEADER_SIZE + key_len + stored_len
}

/// Encodes a complete cell into `out`.
pub fn encode_cell(out: &mut Vec<u8>, flags: CellFlags, key: &[u8], data_len: u32, data: &[u8]) {
    let header = CellHeader {
        flags: flags.bits(),
        key_len: U16::new(key.len() as u16),
        data_len: U32::new(data_len),
    };
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(data);
}

fn parse_cell(body: &[u8], offset: usize) -> Result<(LeafCell<'_>, usize)> {
    ensure!(
        offset + LEAF_CELL_HEADER_SIZE <= body.len(),
        "cell header at offset {} beyond page body ({})",
        offset,
        body.len()
    );

    let (header, rest) = CellHeader::ref_from_prefix(&body[offset..])
        .map_err(|e| eyre::eyre!("failed to read cell header at offset {}: {:?}", offset, e))?;

    let flags = CellFlags::from_bits(header.flags)
        .ok_or_else(|| eyre::eyre!("unknown cell flags {:02x}", header.flags))?;
    let key_len = header.key_len.get() as usize;
    let data_len = header.data_len.get();
    let stored = if flags.contains(CellFlags::BIGDATA) {
        4
    } else {
        data_len as usize
    };

    ensure!(
        key_len + stored <= rest.len(),
        "cell at offset {} extends beyond page body: key_len={}, stored={}",
        offset,
        key_len,
        stored
    );

    let cell = LeafCell {
        flags,
        key: &rest[..key_len],
        data: &rest[key_len..key_len + stored],
        data_len,
    };
    Ok((cell, cell_size(key_len, stored)))
}

#[derive(Debug)]
pub struct LeafNode<'a> {
    header: &'a PageHeader,
    body: &'a [u8],
}

pub struct LeafNodeMut<'a> {
    header: &'a mut PageHeader,
    body: &'a mut [u8],
}

fn slot_at(body: &[u8], count: usize, index: usize) -> Result<usize> {
    ensure!(
        index < count,
        "slot index {} out of bounds (cell_count={})",
        index,
        count
    );
    let pos = index * LEAF_SLOT_SIZE;
    Ok(u16::from_le_bytes([body[pos], body[pos + 1]]) as usize)
}

impl<'a> LeafNode<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        let (header, body) = PageHeader::split(data)?;
        ensure!(
            header.page_type() == PageType::Leaf,
            "expected Leaf page, got {:?}",
            header.page_type()
        );
        ensure!(
            header.free_start() as usize >= header.cell_count() as usize * LEAF_SLOT_SIZE
                && header.free_start() <= header.free_end()
                && header.free_end() as usize <= body.len(),
            "inconsistent leaf header: cell_count={}, free_start={}, free_end={}",
            header.cell_count(),
            header.free_start(),
            header.free_end()
        );
        Ok(Self { header, body })
    }

    pub fn cell_count(&self) -> usize {
        self.header.cell_count() as usize
    }

    pub fn free_space(&self) -> usize {
        self.header.free_space()
    }

    /// Bytes taken by slots and live cells.
    pub fn used_bytes(&self) -> usize {
        let content = self.body.len() - self.header.free_end() as usize;
        self.header.free_start() as usize + content - self.header.frag_bytes() as usize
    }

    pub fn body_size(&self) -> usize {
        self.body.len()
    }

    pub fn cell_at(&self, index: usize) -> Result<LeafCell<'a>> {
        let offset = slot_at(self.body, self.cell_count(), index)?;
        Ok(parse_cell(self.body, offset)?.0)
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        Ok(self.cell_at(index)?.key)
    }

    /// The encoded cell bytes, as accepted by `insert_raw`.
    pub fn raw_cell(&self, index: usize) -> Result<&'a [u8]> {
        let offset = slot_at(self.body, self.cell_count(), index)?;
        let (_, size) = parse_cell(self.body, offset)?;
        Ok(&self.body[offset..offset + size])
    }

    /// Binary search for `key` under `cmp`.
    pub fn search(&self, key: &[u8], cmp: &dyn Comparator) -> Result<SearchResult> {
        let mut lo = 0;
        let mut hi = self.cell_count();

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match cmp.compare(self.key_at(mid)?, key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(SearchResult::Found(mid)),
            }
        }

        Ok(SearchResult::NotFound(lo))
    }
}

impl<'a> LeafNodeMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        LeafNode::from_page(data)?;
        let (header, body) = PageHeader::split_mut(data)?;
        Ok(Self { header, body })
    }

    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        let fresh = PageHeader::new(PageType::Leaf, data.len());
        fresh.write_to(data)?;
        let (header, body) = PageHeader::split_mut(data)?;
        Ok(Self { header, body })
    }

    pub fn as_ref(&self) -> LeafNode<'_> {
        LeafNode {
            header: &*self.header,
            body: &*self.body,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.header.cell_count() as usize
    }

    /// Space available for new cells after compaction.
    pub fn available(&self) -> usize {
        self.header.free_space() + self.header.frag_bytes() as usize
    }

    pub fn fits(&self, cell_len: usize) -> bool {
        self.available() >= cell_len + LEAF_SLOT_SIZE
    }

    pub fn insert_cell(
        &mut self,
        index: usize,
        flags: CellFlags,
        key: &[u8],
        data_len: u32,
        data: &[u8],
    ) -> Result<()> {
        let mut cell = Vec::with_capacity(cell_size(key.len(), data.len()));
        encode_cell(&mut cell, flags, key, data_len, data);
        self.insert_raw(index, &cell)
    }

    pub fn insert_raw(&mut self, index: usize, cell: &[u8]) -> Result<()> {
        let count = self.cell_count();
        ensure!(
            index <= count,
            "insert index {} out of bounds (cell_count={})",
            index,
            count
        );

        let space_needed = cell.len() + LEAF_SLOT_SIZE;
        ensure!(
            self.available() >= space_needed,
            "not enough free space: need {}, have {}",
            space_needed,
            self.available()
        );

        if self.header.free_space() < space_needed {
            self.compact()?;
        }

        let new_free_end = self.header.free_end() as usize - cell.len();
        self.body[new_free_end..new_free_end + cell.len()].copy_from_slice(cell);

        let slot_pos = index * LEAF_SLOT_SIZE;
        let slots_end = count * LEAF_SLOT_SIZE;
        self.body
            .copy_within(slot_pos..slots_end, slot_pos + LEAF_SLOT_SIZE);
        self.body[slot_pos..slot_pos + LEAF_SLOT_SIZE]
            .copy_from_slice(&(new_free_end as u16).to_le_bytes());

        self.header.set_cell_count(count as u16 + 1);
        self.header
            .set_free_start((slots_end + LEAF_SLOT_SIZE) as u16);
        self.header.set_free_end(new_free_end as u16);

        Ok(())
    }

    pub fn delete_cell(&mut self, index: usize) -> Result<()> {
        let count = self.cell_count();
        let offset = slot_at(self.body, count, index)?;
        let (_, size) = parse_cell(self.body, offset)?;

        let slot_pos = index * LEAF_SLOT_SIZE;
        let slots_end = count * LEAF_SLOT_SIZE;
        self.body
            .copy_within(slot_pos + LEAF_SLOT_SIZE..slots_end, slot_pos);

        self.header.set_cell_count(count as u16 - 1);
        self.header
            .set_free_start((slots_end - LEAF_SLOT_SIZE) as u16);
        self.header
            .set_frag_bytes(self.header.frag_bytes() + size as u16);

        if self.should_compact() {
            self.compact()?;
        }

        Ok(())
    }

    /// Rewrites the stored data of a cell whose size does not change.
    pub fn overwrite_data(&mut self, index: usize, data_len: u32, data: &[u8]) -> Result<()> {
        let offset = slot_at(self.body, self.cell_count(), index)?;
        let (cell, _) = parse_cell(self.body, offset)?;
        ensure!(
            cell.data.len() == data.len(),
            "in-place overwrite changes cell size: {} -> {}",
            cell.data.len(),
            data.len()
        );

        let data_start = offset + LEAF_CELL_HEADER_SIZE + cell.key.len();
        self.body[offset + 3..offset + LEAF_CELL_HEADER_SIZE]
            .copy_from_slice(&data_len.to_le_bytes());
        self.body[data_start..data_start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn should_compact(&self) -> bool {
        self.header.frag_bytes() as usize > self.body.len() / 4
    }

    pub fn compact(&mut self) -> Result<()> {
        let count = self.cell_count();
        let snapshot = self.body.to_vec();
        let mut free_end = self.body.len();

        for i in 0..count {
            let offset = slot_at(&snapshot, count, i)?;
            let (_, size) = parse_cell(&snapshot, offset)?;
            free_end -= size;
            self.body[free_end..free_end + size].copy_from_slice(&snapshot[offset..offset + size]);
            let slot_pos = i * LEAF_SLOT_SIZE;
            self.body[slot_pos..slot_pos + LEAF_SLOT_SIZE]
                .copy_from_slice(&(free_end as u16).to_le_bytes());
        }

        self.header.set_free_end(free_end as u16);
        self.header.set_frag_bytes(0);
        Ok(())
    }
}
