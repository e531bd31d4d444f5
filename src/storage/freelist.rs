//! # Freelist Management
//!
//! Freed pages are tracked by the free-list database, an ordinary B+tree
//! whose root lives in the meta page:
//!
//! ```text
//! key   = freeing transaction id (8 bytes, big-endian so byte order = numeric order)
//! value = page numbers freed by that transaction (u32 little-endian, ascending)
//! ```
//!
//! A page freed by transaction `F` may still be reachable from every
//! snapshot older than `F`. It becomes reusable only once `F` is older than
//! the oldest live reader's snapshot; see `mvcc::WritePager` for the
//! gating logic.
//!
//! ## In-Transaction Pool
//!
//! The writer loads eligible records into a [`PagePool`]: a sorted set of
//! page numbers that can be handed out immediately. Pages allocated and
//! freed within the same transaction go straight back to the pool since no
//! snapshot ever saw them. At commit, whatever is left in the pool is
//! written back to the free list under the committing transaction's id.
//!
//! ## Contiguous Runs
//!
//! Overflow values need contiguous runs. `take_run` scans the sorted pool
//! for `count` consecutive page numbers; single pages come from the front.

use eyre::{ensure, Result};

use crate::{PageNo, TxnId};

/// Sorted set of page numbers available to the current writer.
#[derive(Debug, Default, Clone)]
pub struct PagePool {
    pages: Vec<PageNo>,
}

impl PagePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn as_slice(&self) -> &[PageNo] {
        &self.pages
    }

    /// Adds `count` pages starting at `start`.
    pub fn insert_run(&mut self, start: PageNo, count: u32) {
        for page_no in start..start + count {
            match self.pages.binary_search(&page_no) {
                Ok(_) => {}
                Err(pos) => self.pages.insert(pos, page_no),
            }
        }
    }

    pub fn extend(&mut self, pages: &[PageNo]) {
        self.pages.extend_from_slice(pages);
        self.pages.sort_unstable();
        self.pages.dedup();
    }

    /// Removes and returns the first run of `count` consecutive pages.
    pub fn take_run(&mut self, count: u32) -> Option<PageNo> {
        let count = count as usize;
        if count == 0 || self.pages.len() < count {
            return None;
        }

        if count == 1 {
            return Some(self.pages.remove(0));
        }

        let mut run_start = 0;
        for i in 1..self.pages.len() {
            if self.pages[i] != self.pages[i - 1] + 1 {
                run_start = i;
            }
            if i + 1 - run_start == count {
                let first = self.pages[run_start];
                self.pages.drain(run_start..=i);
                return Some(first);
            }
        }

        None
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

pub fn freelist_key(txn_id: TxnId) -> [u8; 8] {
    txn_id.to_be_bytes()
}

pub fn decode_freelist_key(key: &[u8]) -> Result<TxnId> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| eyre::eyre!("free-list key has {} bytes, expected 8", key.len()))?;
    Ok(TxnId::from_be_bytes(bytes))
}

pub fn encode_page_list(pages: &[PageNo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pages.len() * 4);
    for page_no in pages {
        out.extend_from_slice(&page_no.to_le_bytes());
    }
    out
}

pub fn decode_page_list(data: &[u8]) -> Result<Vec<PageNo>> {
    ensure!(
        data.len() % 4 == 0,
        "free-list record of {} bytes is not a list of page numbers",
        data.len()
    );

    Ok(data
        .chunks_exact(4)
        .map(|chunk| PageNo::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
