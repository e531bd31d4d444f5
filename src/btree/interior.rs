//! # B+Tree Interior Node Implementation
//!
//! Interior (branch) pages route a search from the root to a leaf. They
//! hold separator keys and child page numbers; no values.
//!
//! ## Interior Slot Architecture
//!
//! ```text
//! InteriorSlot (8 bytes):
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |       child_page (4B LE)          |  offset (2B)    |  key_len (2B)   |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! - **child_page**: left child of the separator (keys < separator go here)
//! - **offset**: body offset of the separator key bytes
//! - **key_len**: separator length
//!
//! ## Navigation Semantics
//!
//! A node with N separators has N + 1 children. For a search key K:
//! - If K < separator[0]: go to slot[0].child_page
//! - If separator[i-1] <= K < separator[i]: go to slot[i].child_page
//! - If K >= separator[N-1]: go to header.right_child
//!
//! Child index `N` always means `right_child`, so callers can address all
//! children uniformly through `child_at(0..=N)`.
//!
//! Separators are full keys. Suffix truncation would assume byte order,
//! and trees may use any comparator.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::compare::Comparator;
use crate::config::BRANCH_SLOT_SIZE;
use crate::storage::{PageHeader, PageNo, PageType};

pub const INTERIOR_SLOT_SIZE: usize = BRANCH_SLOT_SIZE;

#[repr(C)]
#[derive(
    Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq,
)]
pub struct InteriorSlot {
    child_page: U32,
    offset: U16,
    key_len: U16,
}

const _: () = assert!(size_of::<InteriorSlot>() == INTERIOR_SLOT_SIZE);

impl InteriorSlot {
    zerocopy_accessors! {
        child_page: u32,
        offset: u16,
        key_len: u16,
    }

    pub fn new(child_page: PageNo, offset: u16, key_len: u16) -> Self {
        Self {
            child_page: U32::new(child_page),
            offset: U16::new(offset),
            key_len: U16::new(key_len),
        }
    }
}

fn slot_at(body: &[u8], count: usize, index: usize) -> Result<&InteriorSlot> {
    ensure!(
        index < count,
        "slot index {} out of bounds (cell_count={})",
        index,
        count
    );
    let offset = index * INTERIOR_SLOT_SIZE;
    InteriorSlot::ref_from_bytes(&body[offset..offset + INTERIOR_SLOT_SIZE])
        .map_err(|e| eyre::eyre!("failed to read interior slot at index {}: {:?}", index, e))
}

fn key_at(body: &[u8], count: usize, index: usize) -> Result<&[u8]> {
    let slot = slot_at(body, count, index)?;
    let start = slot.offset() as usize;
    let end = start + slot.key_len() as usize;

    ensure!(
        end <= body.len(),
        "key extends beyond page boundary: offset={}, key_len={}",
        start,
        slot.key_len()
    );

    Ok(&body[start..end])
}

#[derive(Debug)]
pub struct InteriorNode<'a> {
    header: &'a PageHeader,
    body: &'a [u8],
}

pub struct InteriorNodeMut<'a> {
    header: &'a mut PageHeader,
    body: &'a mut [u8],
}

impl<'a> InteriorNode<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        let (header, body) = PageHeader::split(data)?;
        ensure!(
            header.page_type() == PageType::Branch,
            "expected Branch page, got {:?}",
            header.page_type()
        );
        ensure!(
            header.free_start() as usize >= header.cell_count() as usize * INTERIOR_SLOT_SIZE
                && header.free_start() <= header.free_end()
                && header.free_end() as usize <= body.len(),
            "inconsistent branch header: cell_count={}, free_start={}, free_end={}",
            header.cell_count(),
            header.free_start(),
            header.free_end()
        );
        Ok(Self { header, body })
    }

    /// Number of separators; the node has one more child.
    pub fn cell_count(&self) -> usize {
        self.header.cell_count() as usize
    }

    pub fn right_child(&self) -> PageNo {
        self.header.right_child()
    }

    pub fn used_bytes(&self) -> usize {
        let content = self.body.len() - self.header.free_end() as usize;
        self.header.free_start() as usize + content - self.header.frag_bytes() as usize
    }

    pub fn body_size(&self) -> usize {
        self.body.len()
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        key_at(self.body, self.cell_count(), index)
    }

    pub fn child_at(&self, index: usize) -> Result<PageNo> {
        if index == self.cell_count() {
            return Ok(self.right_child());
        }
        Ok(slot_at(self.body, self.cell_count(), index)?.child_page())
    }

    /// Index of the child whose subtree may contain `key`.
    pub fn find_child(&self, key: &[u8], cmp: &dyn Comparator) -> Result<usize> {
        let mut lo = 0;
        let mut hi = self.cell_count();

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cmp.compare(self.key_at(mid)?, key).is_le() {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        Ok(lo)
    }
}

impl<'a> InteriorNodeMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        InteriorNode::from_page(data)?;
        let (header, body) = PageHeader::split_mut(data)?;
        Ok(Self { header, body })
    }

    pub fn init(data: &'a mut [u8], right_child: PageNo) -> Result<Self> {
        let mut fresh = PageHeader::new(PageType::Branch, data.len());
        fresh.set_right_child(right_child);
        fresh.write_to(data)?;
        let (header, body) = PageHeader::split_mut(data)?;
        Ok(Self { header, body })
    }

    pub fn as_ref(&self) -> InteriorNode<'_> {
        InteriorNode {
            header: &*self.header,
            body: &*self.body,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.header.cell_count() as usize
    }

    pub fn available(&self) -> usize {
        self.header.free_space() + self.header.frag_bytes() as usize
    }

    pub fn fits(&self, key_len: usize) -> bool {
        self.available() >= key_len + INTERIOR_SLOT_SIZE
    }

    pub fn set_right_child(&mut self, page_no: PageNo) {
        self.header.set_right_child(page_no);
    }

    pub fn set_child(&mut self, index: usize, page_no: PageNo) -> Result<()> {
        let count = self.cell_count();
        if index == count {
            self.header.set_right_child(page_no);
            return Ok(());
        }

        ensure!(
            index < count,
            "child index {} out of bounds (children={})",
            index,
            count + 1
        );
        let offset = index * INTERIOR_SLOT_SIZE;
        self.body[offset..offset + 4].copy_from_slice(&page_no.to_le_bytes());
        Ok(())
    }

    /// Inserts separator `key` at slot `index` with `left_child` as the
    /// child to its left. Children at and after `index` shift right.
    pub fn insert_separator(&mut self, index: usize, key: &[u8], left_child: PageNo) -> Result<()> {
        let count = self.cell_count();
        ensure!(
            index <= count,
            "insert index {} out of bounds (cell_count={})",
            index,
            count
        );

        let space_needed = key.len() + INTERIOR_SLOT_SIZE;
        ensure!(
            self.available() >= space_needed,
            "not enough free space: need {}, have {}",
            space_needed,
            self.available()
        );

        if self.header.free_space() < space_needed {
            self.compact()?;
        }

        let new_free_end = self.header.free_end() as usize - key.len();
        self.body[new_free_end..new_free_end + key.len()].copy_from_slice(key);

        let slot_pos = index * INTERIOR_SLOT_SIZE;
        let slots_end = count * INTERIOR_SLOT_SIZE;
        self.body
            .copy_within(slot_pos..slots_end, slot_pos + INTERIOR_SLOT_SIZE);

        let slot = InteriorSlot::new(left_child, new_free_end as u16, key.len() as u16);
        self.body[slot_pos..slot_pos + INTERIOR_SLOT_SIZE].copy_from_slice(slot.as_bytes());

        self.header.set_cell_count(count as u16 + 1);
        self.header
            .set_free_start((slots_end + INTERIOR_SLOT_SIZE) as u16);
        self.header.set_free_end(new_free_end as u16);

        Ok(())
    }

    /// Records a split of child `index` into `left` and `right`, promoting
    /// `separator` between them.
    pub fn insert_split(
        &mut self,
        index: usize,
        separator: &[u8],
        left: PageNo,
        right: PageNo,
    ) -> Result<()> {
        self.insert_separator(index, separator, left)?;
        self.set_child(index + 1, right)
    }

    /// Removes separator `index` together with its left child pointer.
    pub fn delete_separator(&mut self, index: usize) -> Result<()> {
        let count = self.cell_count();
        let slot = *slot_at(self.body, count, index)?;

        let slot_pos = index * INTERIOR_SLOT_SIZE;
        let slots_end = count * INTERIOR_SLOT_SIZE;
        self.body
            .copy_within(slot_pos + INTERIOR_SLOT_SIZE..slots_end, slot_pos);

        self.header.set_cell_count(count as u16 - 1);
        self.header
            .set_free_start((slots_end - INTERIOR_SLOT_SIZE) as u16);
        self.header
            .set_frag_bytes(self.header.frag_bytes() + slot.key_len());

        Ok(())
    }

    /// Whether separator `index` can be swapped for a key of `key_len` bytes.
    pub fn can_replace(&self, index: usize, key_len: usize) -> Result<bool> {
        let old_len = self.as_ref().key_at(index)?.len();
        Ok(self.available() + old_len >= key_len)
    }

    /// Swaps the key of separator `index`, keeping its left child.
    pub fn replace_separator(&mut self, index: usize, key: &[u8]) -> Result<()> {
        let child = self.as_ref().child_at(index)?;
        self.delete_separator(index)?;
        self.insert_separator(index, key, child)
    }

    /// Removes separator `index` after children `index` and `index + 1`
    /// were merged into child `index`.
    pub fn remove_merged(&mut self, index: usize) -> Result<()> {
        let merged = self.as_ref().child_at(index)?;
        self.set_child(index + 1, merged)?;
        self.delete_separator(index)
    }

    pub fn compact(&mut self) -> Result<()> {
        let count = self.cell_count();
        let snapshot = self.body.to_vec();
        let mut free_end = self.body.len();

        for i in 0..count {
            let key = key_at(&snapshot, count, i)?;
            free_end -= key.len();
            self.body[free_end..free_end + key.len()].copy_from_slice(key);
            let slot_pos = i * INTERIOR_SLOT_SIZE;
            self.body[slot_pos + 4..slot_pos + 6].copy_from_slice(&(free_end as u16).to_le_bytes());
        }

        self.header.set_free_end(free_end as u16);
        self.header.set_frag_bytes(0);
        Ok(())
    }
}
