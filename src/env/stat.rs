//! Statistics reported by `Environment::stat`, `Transaction::stat` and
//! `Environment::info`.

use crate::btree::TreeInfo;
use crate::{PageNo, TxnId};

/// Shape of one database tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub page_size: u32,
    pub depth: u32,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    /// Key/value pairs; every duplicate counts.
    pub entries: u64,
}

impl Stat {
    pub(crate) fn new(page_size: usize, tree: &TreeInfo) -> Self {
        Self {
            page_size: page_size as u32,
            depth: tree.depth as u32,
            branch_pages: tree.branch_pages as u64,
            leaf_pages: tree.leaf_pages as u64,
            overflow_pages: tree.overflow_pages as u64,
            entries: tree.entries,
        }
    }

    pub fn total_pages(&self) -> u64 {
        self.branch_pages + self.leaf_pages + self.overflow_pages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    pub map_size: u64,
    /// First page never used; the data file holds at least this many.
    pub last_page: PageNo,
    pub last_txn_id: TxnId,
    pub max_readers: u32,
    pub num_readers: u32,
    pub page_size: u32,
}
