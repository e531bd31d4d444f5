//! # Overflow Runs
//!
//! Values too large to sit inline in a leaf are stored in a run of
//! contiguous pages. The leaf cell keeps the first page number and the
//! full value length; the first page carries a header whose
//! `overflow_pages` field holds the run length.
//!
//! ```text
//! +------------------+-----------------------------------------------+
//! | Header (16 bytes)| value bytes, continuing across the whole run   |
//! +------------------+-----------------------------------------------+
//! ```
//!
//! A run is replaced wholesale when its value changes. The exception is a
//! run allocated by the current transaction with the same page count: no
//! snapshot can see it, so it is rewritten in place.

use eyre::{ensure, Result};
use log::trace;

use crate::config::PAGE_HEADER_SIZE;
use crate::storage::{PageHeader, PageSink, PageSource, PageType};
use crate::PageNo;

/// Pages needed for a value of `len` bytes.
pub fn pages_needed(len: usize, page_size: usize) -> u32 {
    (len + PAGE_HEADER_SIZE).div_ceil(page_size) as u32
}

pub fn write_run<P: PageSink + ?Sized>(pager: &mut P, value: &[u8]) -> crate::Result<PageNo> {
    let count = pages_needed(value.len(), pager.page_size());
    let page_no = pager.allocate(count)?;
    fill_run(pager.page_mut(page_no)?, count, value)?;
    trace!("overflow run of {} pages at {}", count, page_no);
    Ok(page_no)
}

fn fill_run(run: &mut [u8], count: u32, value: &[u8]) -> Result<()> {
    ensure!(
        run.len() >= PAGE_HEADER_SIZE + value.len(),
        "overflow run of {} bytes cannot hold {} value bytes",
        run.len(),
        value.len()
    );

    let page_size = run.len() / count as usize;
    let mut header = PageHeader::new(PageType::Overflow, page_size);
    header.set_overflow_pages(count);
    header.write_to(run)?;
    run[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + value.len()].copy_from_slice(value);
    Ok(())
}

/// Page count of the run starting at `page_no`.
pub fn run_length<P: PageSource + ?Sized>(pager: &P, page_no: PageNo) -> crate::Result<u32> {
    let header = PageHeader::from_bytes(pager.page(page_no)?)?;
    if header.page_type() != PageType::Overflow || header.overflow_pages() == 0 {
        return Err(crate::Error::bad_page(page_no, "not the start of an overflow run"));
    }
    Ok(header.overflow_pages())
}

pub fn read_run<'p, P: PageSource + ?Sized>(
    pager: &'p P,
    page_no: PageNo,
    len: usize,
) -> crate::Result<&'p [u8]> {
    let count = run_length(pager, page_no)?;
    let run = pager.pages(page_no, count)?;
    if run.len() < PAGE_HEADER_SIZE + len {
        return Err(crate::Error::bad_page(
            page_no,
            format!("overflow run of {count} pages shorter than value of {len} bytes"),
        ));
    }
    Ok(&run[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len])
}

/// Returns the run to the pager and its page count.
pub fn free_run<P: PageSink + ?Sized>(pager: &mut P, page_no: PageNo) -> crate::Result<u32> {
    let count = run_length(pager, page_no)?;
    pager.release(page_no, count)?;
    Ok(count)
}

/// Stores `value` in place of the run at `page_no`. Returns the page of
/// the new run and the change in overflow page count.
pub fn replace_run<P: PageSink + ?Sized>(
    pager: &mut P,
    page_no: PageNo,
    value: &[u8],
) -> crate::Result<(PageNo, i64)> {
    let old = run_length(pager, page_no)?;
    let new = pages_needed(value.len(), pager.page_size());

    if old == new && pager.is_dirty(page_no) {
        fill_run(pager.page_mut(page_no)?, new, value)?;
        return Ok((page_no, 0));
    }

    pager.release(page_no, old)?;
    let fresh = write_run(pager, value)?;
    Ok((fresh, new as i64 - old as i64))
}
