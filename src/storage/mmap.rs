//! # Memory-Mapped File Storage
//!
//! `MmapStorage` gives zero-copy read access to the data file and writes
//! committed pages back through the file descriptor.
//!
//! ## Reserved Mapping
//!
//! The whole configured map size is mapped once at open, even when the file
//! is still smaller. Growing the file (`ensure_pages`) only extends it with
//! `set_len`; the mapping never moves, so page slices handed to readers stay
//! valid while the writer grows the file. Only pages below the current file
//! length are ever handed out.
//!
//! Changing the map size requires `remap(&mut self)`. The exclusive borrow
//! guarantees no transaction holds page references at that point:
//!
//! ```text
//! page(&self) -> &[u8]            // shared borrow, any thread
//! write_pages(&self, ..)          // writer only, pages unreachable by readers
//! remap(&mut self, ..)            // exclusive, no live transactions
//! ```
//!
//! ## Write Path
//!
//! The map is read-only. Commits write staged pages with positioned writes
//! (`pwrite`) into the same file; the unified page cache makes them visible
//! through the mapping. A writer never writes a page that a live snapshot
//! can reach, so readers never observe a page changing underneath them.
//!
//! ## File Format
//!
//! ```text
//! Offset 0:              Meta page 0
//! Offset page_size:      Meta page 1
//! Offset 2 * page_size:  First data page
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use eyre::{ensure, Result, WrapErr};
use log::trace;
use memmap2::{Mmap, MmapOptions};

use crate::PageNo;

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    mmap: Mmap,
    page_size: usize,
    map_pages: u32,
    file_pages: AtomicU32,
}

impl MmapStorage {
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize, map_size: u64) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty data file '{}'",
            path.display()
        );

        ensure!(
            file_size % page_size as u64 == 0,
            "data file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            page_size
        );

        let file_pages = (file_size / page_size as u64) as u32;
        let map_pages = map_pages_for(map_size, page_size).max(file_pages);
        let mmap = map_file(&file, map_pages, page_size)
            .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?;

        Ok(Self {
            file,
            mmap,
            page_size,
            map_pages,
            file_pages: AtomicU32::new(file_pages),
        })
    }

    pub fn create<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        map_size: u64,
        initial_page_count: u32,
    ) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            initial_page_count > 0,
            "initial page count must be at least 1"
        );

        let map_pages = map_pages_for(map_size, page_size);
        ensure!(
            initial_page_count <= map_pages,
            "initial page count {} exceeds map capacity {}",
            initial_page_count,
            map_pages
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create data file '{}'", path.display()))?;

        let file_size = initial_page_count as u64 * page_size as u64;

        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", file_size))?;

        let mmap = map_file(&file, map_pages, page_size)
            .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?;

        Ok(Self {
            file,
            mmap,
            page_size,
            map_pages,
            file_pages: AtomicU32::new(initial_page_count),
        })
    }

    pub fn page(&self, page_no: PageNo) -> Result<&[u8]> {
        self.pages(page_no, 1)
    }

    /// A contiguous run of `count` pages starting at `page_no`.
    pub fn pages(&self, page_no: PageNo, count: u32) -> Result<&[u8]> {
        let file_pages = self.file_pages.load(Ordering::Acquire);
        let end = page_no as u64 + count as u64;

        ensure!(
            count > 0 && end <= file_pages as u64,
            "pages {}..{} out of bounds (page_count={})",
            page_no,
            end,
            file_pages
        );

        let offset = page_no as usize * self.page_size;
        Ok(&self.mmap[offset..offset + count as usize * self.page_size])
    }

    /// Writes whole pages at `page_no`. The target range must already be
    /// inside the file.
    pub fn write_pages(&self, page_no: PageNo, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() % self.page_size == 0,
            "write of {} bytes is not page aligned",
            data.len()
        );

        let count = (data.len() / self.page_size) as u64;
        let file_pages = self.file_pages.load(Ordering::Acquire) as u64;
        ensure!(
            page_no as u64 + count <= file_pages,
            "write to pages {}..{} beyond file end {}",
            page_no,
            page_no as u64 + count,
            file_pages
        );

        let offset = page_no as u64 * self.page_size as u64;
        write_all_at(&self.file, data, offset)
            .wrap_err_with(|| format!("failed to write {} pages at page {}", count, page_no))
    }

    /// Extends the file so that at least `needed` pages exist, in steps of
    /// `increment` pages, never past the mapped capacity.
    pub fn ensure_pages(&self, needed: u32, increment: u32) -> Result<()> {
        let current = self.file_pages.load(Ordering::Acquire);
        if needed <= current {
            return Ok(());
        }

        ensure!(
            needed <= self.map_pages,
            "file needs {} pages, map holds {}",
            needed,
            self.map_pages
        );

        let step = increment.max(1) as u64;
        let rounded = (needed as u64).div_ceil(step) * step;
        let new_count = rounded.min(self.map_pages as u64) as u32;
        let new_size = new_count as u64 * self.page_size as u64;

        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

        trace!("data file grown from {} to {} pages", current, new_count);
        self.file_pages.store(new_count, Ordering::Release);
        Ok(())
    }

    /// Maps the file again with a new capacity.
    pub fn remap(&mut self, map_size: u64) -> Result<()> {
        let file_pages = self.file_pages.load(Ordering::Acquire);
        let map_pages = map_pages_for(map_size, self.page_size);

        ensure!(
            map_pages >= file_pages,
            "map size {} is smaller than the data file ({} pages)",
            map_size,
            file_pages
        );

        self.mmap = map_file(&self.file, map_pages, self.page_size)
            .wrap_err("failed to remap data file")?;
        self.map_pages = map_pages;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data().wrap_err("failed to sync data file to disk")
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.file_pages.load(Ordering::Acquire)
    }

    pub fn map_pages(&self) -> u32 {
        self.map_pages
    }

    pub fn map_size(&self) -> u64 {
        self.map_pages as u64 * self.page_size as u64
    }

    pub fn file_size(&self) -> u64 {
        self.page_count() as u64 * self.page_size as u64
    }

    pub fn prefetch_pages(&self, start_page: PageNo, count: u32) {
        let page_count = self.page_count();
        if start_page >= page_count {
            return;
        }

        let end_page = start_page.saturating_add(count).min(page_count);
        let start_offset = start_page as usize * self.page_size;
        let len = (end_page - start_page) as usize * self.page_size;

        #[cfg(unix)]
        // SAFETY: madvise with MADV_WILLNEED is only a hint to the kernel. This is safe because:
        // 1. start_page was bounds-checked above against the file length
        // 2. end_page is clamped to the file length, which never exceeds the mapping
        // 3. the mapping is alive for the duration of &self
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(start_offset) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }

        #[cfg(not(unix))]
        let _ = (start_offset, len);
    }
}

fn map_pages_for(map_size: u64, page_size: usize) -> u32 {
    (map_size / page_size as u64).min(u32::MAX as u64) as u32
}

fn map_file(file: &File, map_pages: u32, page_size: usize) -> std::io::Result<Mmap> {
    let len = map_pages as usize * page_size;

    // SAFETY: Mmap::map is unsafe because the file could be modified externally. This is safe because:
    // 1. the data file belongs to this environment and is only written through MmapStorage
    // 2. pages are only handed out below the current file length, so the part of the
    //    mapping past the end of the file is never touched
    // 3. the mapping lives inside MmapStorage, and remapping requires &mut self
    unsafe { MmapOptions::new().len(len).map(file) }
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let written = file.seek_write(data, offset)?;
        if written == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        data = &data[written..];
        offset += written as u64;
    }
    Ok(())
}
