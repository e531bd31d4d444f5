//! # Write Pager
//!
//! The single writer's view of the page store. Pages created by the
//! transaction live in private buffers until commit; everything else is
//! read straight from the mapping.
//!
//! ## Page Sources
//!
//! ```text
//! allocate(count)
//!   1. pool: pages already known to be unreachable by any snapshot
//!   2. refill the pool from the next reusable free-list record
//!   3. high-water mark, bounded by the map size (OutOfSpace)
//! ```
//!
//! Releasing a page created by this transaction returns it to the pool at
//! once. Releasing a page of the base snapshot records it as freed by this
//! transaction; it becomes reusable once no reader can see the base.
//!
//! ## Free-List Upkeep
//!
//! Writing the free list changes the free-list tree, which may free and
//! allocate pages, which changes what has to be written. The free-list
//! tree allocates from the pool like every other tree, so at commit the
//! record is rewritten until it stops changing:
//!
//! ```text
//! loop {
//!     delete consumed records
//!     pages = freed ∪ pool
//!     if pages == last written and nothing was consumed: done
//!     put(txn_id, pages)      may take pages out of the pool
//! }
//! ```
//!
//! A page taken from the pool by the last `put` changes `pages`, so the
//! final record never lists a page the free-list tree itself uses.
//!
//! ## Savepoints
//!
//! Nested transactions stack savepoints on the pager. While one is open,
//! the first change to a page journals what it looked like before:
//!
//! ```text
//! page dirty at the savepoint   journal[p] = Some(old bytes)
//! page dirtied after it         journal[p] = None
//! ```
//!
//! Rolling back puts journaled pages back, forgets the rest and resets the
//! allocation state. Releasing merges the journal into the savepoint below,
//! keeping the older entry for pages both have seen.

use hashbrown::HashMap;
use log::{debug, trace, warn};

use super::TxnId;
use crate::btree::tree::{cell_value, BTree, CellData};
use crate::btree::{Lexicographic, TreeCursor, TreeInfo};
use crate::config::FREELIST_SETTLE_MAX_ROUNDS;
use crate::storage::{
    decode_freelist_key, decode_page_list, encode_page_list, freelist_key, MmapStorage, PagePool,
    PageSink, PageSource,
};
use crate::{Error, PageNo, Result};

pub struct WritePager<'env> {
    storage: &'env MmapStorage,
    page_size: usize,
    txn_id: TxnId,
    /// Free-list records below this id are reusable.
    threshold: TxnId,
    free: TreeInfo,
    dirty: HashMap<PageNo, Box<[u8]>>,
    pool: PagePool,
    freed: Vec<PageNo>,
    consumed: Vec<TxnId>,
    next_record: TxnId,
    records_exhausted: bool,
    next_page: PageNo,
    map_pages: u32,
    savepoints: Vec<Savepoint>,
}

/// Pager state at the start of a nested transaction.
struct Savepoint {
    journal: HashMap<PageNo, Option<Box<[u8]>>>,
    free: TreeInfo,
    pool: PagePool,
    freed: usize,
    consumed: usize,
    next_record: TxnId,
    records_exhausted: bool,
    next_page: PageNo,
}

impl<'env> WritePager<'env> {
    pub fn new(
        storage: &'env MmapStorage,
        txn_id: TxnId,
        threshold: TxnId,
        free: TreeInfo,
        next_page: PageNo,
    ) -> Self {
        Self {
            storage,
            page_size: storage.page_size(),
            txn_id,
            threshold,
            free,
            dirty: HashMap::new(),
            pool: PagePool::new(),
            freed: Vec::new(),
            consumed: Vec::new(),
            next_record: 0,
            records_exhausted: false,
            next_page,
            map_pages: storage.map_pages(),
            savepoints: Vec::new(),
        }
    }

    pub fn savepoint(&mut self) {
        self.savepoints.push(Savepoint {
            journal: HashMap::new(),
            free: self.free,
            pool: self.pool.clone(),
            freed: self.freed.len(),
            consumed: self.consumed.len(),
            next_record: self.next_record,
            records_exhausted: self.records_exhausted,
            next_page: self.next_page,
        });
        trace!("txn {} savepoint {}", self.txn_id, self.savepoints.len());
    }

    /// Keeps every change since the last savepoint.
    pub fn release_savepoint(&mut self) {
        let Some(top) = self.savepoints.pop() else {
            return;
        };
        if let Some(below) = self.savepoints.last_mut() {
            for (page_no, before) in top.journal {
                below.journal.entry(page_no).or_insert(before);
            }
        }
    }

    /// Undoes every change since the last savepoint.
    pub fn rollback_savepoint(&mut self) {
        let Some(top) = self.savepoints.pop() else {
            return;
        };
        let restored = top.journal.len();
        for (page_no, before) in top.journal {
            match before {
                Some(run) => {
                    self.dirty.insert(page_no, run);
                }
                None => {
                    self.dirty.remove(&page_no);
                }
            }
        }
        self.free = top.free;
        self.pool = top.pool;
        self.freed.truncate(top.freed);
        self.consumed.truncate(top.consumed);
        self.next_record = top.next_record;
        self.records_exhausted = top.records_exhausted;
        self.next_page = top.next_page;
        debug!("txn {} rolled back {} pages to a savepoint", self.txn_id, restored);
    }

    /// Records how `page_no` looked before its first change under the
    /// current savepoint.
    fn journal(&mut self, page_no: PageNo) {
        if let Some(top) = self.savepoints.last_mut() {
            let dirty = &self.dirty;
            top.journal
                .entry(page_no)
                .or_insert_with(|| dirty.get(&page_no).cloned());
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// First page number never handed out.
    pub fn next_page(&self) -> PageNo {
        self.next_page
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    fn take_from_pool(&mut self, count: u32) -> Result<Option<PageNo>> {
        loop {
            if let Some(page_no) = self.pool.take_run(count) {
                return Ok(Some(page_no));
            }
            if !self.refill()? {
                return Ok(None);
            }
        }
    }

    /// Loads the next reusable free-list record into the pool.
    fn refill(&mut self) -> Result<bool> {
        if self.records_exhausted || self.free.is_empty() {
            return Ok(false);
        }

        let record = {
            let mut cursor = TreeCursor::new();
            let pager = &*self;
            if cursor.seek(pager, &pager.free, &Lexicographic, &freelist_key(pager.next_record))? {
                let cell = cursor.cell(pager)?;
                let id = decode_freelist_key(cell.key)?;
                if id < pager.threshold {
                    Some((id, decode_page_list(cell_value(pager, &cell)?)?))
                } else {
                    None
                }
            } else {
                None
            }
        };

        let Some((id, pages)) = record else {
            self.records_exhausted = true;
            return Ok(false);
        };

        trace!("reclaiming {} pages freed by txn {}", pages.len(), id);
        self.pool.extend(&pages);
        self.consumed.push(id);
        self.next_record = id + 1;
        Ok(true)
    }

    fn extend_file(&mut self, count: u32) -> Result<PageNo> {
        let page_no = self.next_page;
        let end = page_no as u64 + count as u64;
        if end > self.map_pages as u64 {
            return Err(Error::OutOfSpace {
                requested_pages: end,
                max_pages: self.map_pages as u64,
            });
        }
        self.next_page = end as PageNo;
        Ok(page_no)
    }

    /// Rewrites the free list for commit and returns its final shape.
    pub fn settle_freelist(&mut self) -> Result<TreeInfo> {
        let key = freelist_key(self.txn_id);
        let mut written: Option<Vec<PageNo>> = None;
        let mut reclaimed = 0;
        let mut free = self.free;

        for round in 0.. {
            let consumed = std::mem::take(&mut self.consumed);
            reclaimed += consumed.len();
            for id in &consumed {
                BTree::new(&mut *self, &mut free, &Lexicographic).delete(&freelist_key(*id))?;
            }

            let mut pages = self.freed.clone();
            pages.extend_from_slice(self.pool.as_slice());
            pages.sort_unstable();
            pages.dedup();

            if consumed.is_empty() && written.as_ref() == Some(&pages) {
                break;
            }
            if round >= FREELIST_SETTLE_MAX_ROUNDS {
                warn!(
                    "free list of txn {} still changing after {} rounds",
                    self.txn_id, round
                );
                break;
            }

            if !pages.is_empty() {
                let value = encode_page_list(&pages);
                BTree::new(&mut *self, &mut free, &Lexicographic)
                    .put(&key, CellData::Value(&value))?;
            } else if written.as_ref().is_some_and(|last| !last.is_empty()) {
                BTree::new(&mut *self, &mut free, &Lexicographic).delete(&key)?;
            }
            written = Some(pages);
        }

        debug!(
            "txn {} free list: {} freed, {} pooled, {} records reclaimed",
            self.txn_id,
            self.freed.len(),
            self.pool.len(),
            reclaimed
        );
        self.free = free;
        Ok(free)
    }

    /// Writes every dirty page to the file. Returns the new high-water mark.
    pub fn flush(&mut self, growth_pages: u32) -> Result<PageNo> {
        self.storage.ensure_pages(self.next_page, growth_pages)?;

        let mut pages: Vec<(&PageNo, &Box<[u8]>)> = self.dirty.iter().collect();
        pages.sort_unstable_by_key(|(page_no, _)| **page_no);
        for (page_no, data) in pages {
            self.storage.write_pages(*page_no, data)?;
        }
        Ok(self.next_page)
    }
}

impl PageSource for WritePager<'_> {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn pages(&self, page_no: PageNo, count: u32) -> Result<&[u8]> {
        match self.dirty.get(&page_no) {
            Some(run) => {
                let len = count as usize * self.page_size;
                if run.len() < len {
                    return Err(Error::bad_page(page_no, "dirty run shorter than requested"));
                }
                Ok(&run[..len])
            }
            None => Ok(self.storage.pages(page_no, count)?),
        }
    }
}

impl PageSink for WritePager<'_> {
    fn page_mut(&mut self, page_no: PageNo) -> Result<&mut [u8]> {
        self.journal(page_no);
        self.dirty
            .get_mut(&page_no)
            .map(|run| &mut run[..])
            .ok_or_else(|| Error::bad_page(page_no, "write to a page outside the transaction"))
    }

    fn allocate(&mut self, count: u32) -> Result<PageNo> {
        let page_no = match self.take_from_pool(count)? {
            Some(page_no) => {
                trace!("allocated {} pages at {} from the free pool", count, page_no);
                page_no
            }
            None => {
                let page_no = self.extend_file(count)?;
                trace!("allocated {} pages at {} from the high-water mark", count, page_no);
                page_no
            }
        };

        self.journal(page_no);
        self.dirty.insert(
            page_no,
            vec![0u8; count as usize * self.page_size].into_boxed_slice(),
        );
        Ok(page_no)
    }

    fn touch(&mut self, page_no: PageNo) -> Result<PageNo> {
        if self.dirty.contains_key(&page_no) {
            return Ok(page_no);
        }

        let storage = self.storage;
        let original = storage.page(page_no)?;
        let fresh = self.allocate(1)?;
        self.page_mut(fresh)?.copy_from_slice(original);
        self.freed.push(page_no);
        Ok(fresh)
    }

    fn release(&mut self, page_no: PageNo, count: u32) -> Result<()> {
        if self.dirty.contains_key(&page_no) {
            self.journal(page_no);
        }
        if self.dirty.remove(&page_no).is_some() {
            self.pool.insert_run(page_no, count);
        } else {
            self.freed.extend(page_no..page_no + count);
        }
        Ok(())
    }

    fn is_dirty(&self, page_no: PageNo) -> bool {
        self.dirty.contains_key(&page_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MetaRecord, MetaState};
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 512;
    const MAP_SIZE: u64 = 256 * PAGE_SIZE as u64;

    fn storage(dir: &std::path::Path) -> MmapStorage {
        let storage = MmapStorage::create(dir.join("data.tkv"), PAGE_SIZE, MAP_SIZE, 2).unwrap();
        let meta = MetaState::initial(PAGE_SIZE as u32, MAP_SIZE, 2);
        storage
            .write_pages(0, &MetaRecord::new(&meta).to_page(PAGE_SIZE))
            .unwrap();
        storage
    }

    /// Runs one "transaction" that writes `keys` and commits its pages.
    fn commit_round(
        storage: &MmapStorage,
        txn_id: TxnId,
        threshold: TxnId,
        free: TreeInfo,
        next_page: PageNo,
        tree: &mut TreeInfo,
        keys: std::ops::Range<u32>,
    ) -> (TreeInfo, PageNo) {
        let mut pager = WritePager::new(storage, txn_id, threshold, free, next_page);
        for i in keys {
            BTree::new(&mut pager, tree, &Lexicographic)
                .put(&i.to_be_bytes(), CellData::Value(&[0u8; 40]))
                .unwrap();
        }
        let free = pager.settle_freelist().unwrap();
        let next = pager.flush(8).unwrap();
        (free, next)
    }

    #[test]
    fn allocation_extends_high_water_mark() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let mut pager = WritePager::new(&storage, 1, 1, TreeInfo::default(), 2);

        assert_eq!(pager.allocate(1).unwrap(), 2);
        assert_eq!(pager.allocate(3).unwrap(), 3);
        assert_eq!(pager.next_page(), 6);
    }

    #[test]
    fn map_limit_is_out_of_space() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let mut pager = WritePager::new(&storage, 1, 1, TreeInfo::default(), 2);

        let err = pager.allocate(300).unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::OutOfSpace);
    }

    #[test]
    fn released_dirty_page_is_reused_immediately() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let mut pager = WritePager::new(&storage, 1, 1, TreeInfo::default(), 2);

        let page_no = pager.allocate(1).unwrap();
        pager.release(page_no, 1).unwrap();

        assert_eq!(pager.allocate(1).unwrap(), page_no);
        assert_eq!(pager.next_page(), 3);
    }

    #[test]
    fn rollback_to_savepoint_restores_pages_and_allocation() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let mut pager = WritePager::new(&storage, 1, 1, TreeInfo::default(), 2);
        let kept = pager.allocate(1).unwrap();
        pager.page_mut(kept).unwrap()[0] = 1;

        pager.savepoint();
        pager.page_mut(kept).unwrap()[0] = 2;
        let added = pager.allocate(2).unwrap();
        pager.rollback_savepoint();

        assert_eq!(pager.pages(kept, 1).unwrap()[0], 1, "journaled page SHOULD be restored");
        assert!(!pager.is_dirty(added), "page allocated after the savepoint SHOULD be forgotten");
        assert_eq!(pager.next_page(), 3);
        assert_eq!(pager.allocate(1).unwrap(), added);
    }

    #[test]
    fn rollback_restores_released_pages() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let mut pager = WritePager::new(&storage, 1, 1, TreeInfo::default(), 2);
        let page_no = pager.allocate(1).unwrap();
        pager.page_mut(page_no).unwrap()[7] = 42;

        pager.savepoint();
        pager.release(page_no, 1).unwrap();
        assert_eq!(pager.allocate(1).unwrap(), page_no);
        pager.rollback_savepoint();

        assert!(pager.is_dirty(page_no));
        assert_eq!(pager.pages(page_no, 1).unwrap()[7], 42);
    }

    #[test]
    fn released_savepoint_hands_its_journal_down() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let mut pager = WritePager::new(&storage, 1, 1, TreeInfo::default(), 2);
        let page_no = pager.allocate(1).unwrap();
        pager.page_mut(page_no).unwrap()[0] = 1;

        pager.savepoint();
        pager.savepoint();
        pager.page_mut(page_no).unwrap()[0] = 2;
        pager.release_savepoint();
        assert_eq!(pager.pages(page_no, 1).unwrap()[0], 2, "release SHOULD keep the change");
        pager.rollback_savepoint();

        assert_eq!(pager.pages(page_no, 1).unwrap()[0], 1);
    }

    #[test]
    fn clean_pages_are_written_to_the_free_list() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let mut tree = TreeInfo::default();

        let (free, next) = commit_round(&storage, 1, 1, TreeInfo::default(), 2, &mut tree, 0..5);
        assert!(free.is_empty(), "nothing was freed yet");
        let old_root = tree.root;

        let (free, _) = commit_round(&storage, 2, 2, free, next, &mut tree, 5..6);

        assert!(!free.is_empty());
        let mut cursor = TreeCursor::new();
        assert!(cursor.first(&storage, &free).unwrap());
        let cell = cursor.cell(&storage).unwrap();
        assert_eq!(decode_freelist_key(cell.key).unwrap(), 2);
        let pages = decode_page_list(cell_value(&storage, &cell).unwrap()).unwrap();
        assert!(pages.contains(&old_root), "old root SHOULD be recorded as freed by txn 2");
    }

    #[test]
    fn records_below_threshold_are_reused() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let mut tree = TreeInfo::default();

        let (free, next) = commit_round(&storage, 1, 1, TreeInfo::default(), 2, &mut tree, 0..5);
        let (free, next) = commit_round(&storage, 2, 2, free, next, &mut tree, 5..6);

        let mut pager = WritePager::new(&storage, 3, 3, free, next);
        let page_no = pager.allocate(1).unwrap();

        assert!(page_no < next, "page {page_no} SHOULD come from the free list");
    }

    #[test]
    fn commits_without_readers_reach_a_steady_high_water_mark() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let mut tree = TreeInfo::default();
        let mut free = TreeInfo::default();
        let mut next = 2;

        let mut marks = Vec::new();
        for txn_id in 1..=120 {
            (free, next) = commit_round(&storage, txn_id, txn_id, free, next, &mut tree, 0..1);
            marks.push(next);
        }

        assert!(
            next <= marks[29],
            "free-list upkeep SHOULD draw from reclaimed pages: {marks:?}"
        );
    }

    #[test]
    fn free_list_record_never_lists_its_own_pages() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let mut tree = TreeInfo::default();
        let mut free = TreeInfo::default();
        let mut next = 2;
        for txn_id in 1..=10 {
            (free, next) = commit_round(&storage, txn_id, txn_id, free, next, &mut tree, 0..20);
        }

        let mut tree_pages = vec![free.root];
        let mut listed = Vec::new();
        let mut cursor = TreeCursor::new();
        let mut more = cursor.first(&storage, &free).unwrap();
        while more {
            tree_pages.push(cursor.leaf_slot().unwrap().0);
            let cell = cursor.cell(&storage).unwrap();
            listed.extend(decode_page_list(cell_value(&storage, &cell).unwrap()).unwrap());
            more = cursor.next(&storage).unwrap();
        }

        for page_no in tree_pages {
            assert!(!listed.contains(&page_no), "page {page_no} is both live and free");
        }
        assert!(listed.iter().all(|&page_no| page_no < next));
    }

    #[test]
    fn records_at_or_above_threshold_are_kept() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let mut tree = TreeInfo::default();

        let (free, next) = commit_round(&storage, 1, 1, TreeInfo::default(), 2, &mut tree, 0..5);
        let (free, next) = commit_round(&storage, 2, 2, free, next, &mut tree, 5..6);

        // A reader still on snapshot 1 pins the pages freed by txn 2.
        let mut pager = WritePager::new(&storage, 3, 1, free, next);
        let page_no = pager.allocate(1).unwrap();

        assert_eq!(page_no, next);
    }
}
