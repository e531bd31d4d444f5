//! In-memory pager for unit tests of the tree code.
//!
//! Pages live in a map keyed by the first page of each run. `checkpoint`
//! plays the role of a commit: every existing page becomes clean, so the
//! next `touch` has to copy it.

use hashbrown::{HashMap, HashSet};

use super::{PageNo, PageSink, PageSource};
use crate::config::FIRST_DATA_PAGE;
use crate::Error;

pub(crate) struct MemPager {
    page_size: usize,
    pages: HashMap<PageNo, Box<[u8]>>,
    dirty: HashSet<PageNo>,
    released: Vec<(PageNo, u32)>,
    next: PageNo,
}

impl MemPager {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: HashMap::new(),
            dirty: HashSet::new(),
            released: Vec::new(),
            next: FIRST_DATA_PAGE,
        }
    }

    pub fn checkpoint(&mut self) {
        self.dirty.clear();
        self.released.clear();
    }

    /// Clean runs retired since the last checkpoint.
    pub fn released(&self) -> &[(PageNo, u32)] {
        &self.released
    }

    pub fn live_pages(&self) -> usize {
        self.pages
            .values()
            .map(|run| run.len() / self.page_size)
            .sum()
    }
}

impl PageSource for MemPager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn pages(&self, page_no: PageNo, count: u32) -> crate::Result<&[u8]> {
        let run = self
            .pages
            .get(&page_no)
            .ok_or_else(|| Error::bad_page(page_no, "not allocated"))?;
        let len = count as usize * self.page_size;
        if run.len() < len {
            return Err(Error::bad_page(page_no, "run shorter than requested"));
        }
        Ok(&run[..len])
    }
}

impl PageSink for MemPager {
    fn page_mut(&mut self, page_no: PageNo) -> crate::Result<&mut [u8]> {
        if !self.dirty.contains(&page_no) {
            return Err(Error::bad_page(page_no, "write to a clean page"));
        }
        self.pages
            .get_mut(&page_no)
            .map(|run| &mut run[..])
            .ok_or_else(|| Error::bad_page(page_no, "not allocated"))
    }

    fn allocate(&mut self, count: u32) -> crate::Result<PageNo> {
        let page_no = self.next;
        self.next += count;
        self.pages.insert(
            page_no,
            vec![0u8; count as usize * self.page_size].into_boxed_slice(),
        );
        self.dirty.insert(page_no);
        Ok(page_no)
    }

    fn touch(&mut self, page_no: PageNo) -> crate::Result<PageNo> {
        if self.dirty.contains(&page_no) {
            return Ok(page_no);
        }
        let copy = self.page(page_no)?.to_vec();
        let fresh = self.allocate(1)?;
        self.page_mut(fresh)?.copy_from_slice(&copy);
        self.release(page_no, 1)?;
        Ok(fresh)
    }

    fn release(&mut self, page_no: PageNo, count: u32) -> crate::Result<()> {
        if self.pages.remove(&page_no).is_none() {
            return Err(Error::bad_page(page_no, "double release"));
        }
        if !self.dirty.remove(&page_no) {
            self.released.push((page_no, count));
        }
        Ok(())
    }

    fn is_dirty(&self, page_no: PageNo) -> bool {
        self.dirty.contains(&page_no)
    }
}
