//! # Environment Copy
//!
//! Backups are taken from a read snapshot, so writers keep going while a
//! copy runs.
//!
//! - [`CopyMode::Raw`] copies every page up to the snapshot's high-water
//!   mark, free pages included.
//! - [`CopyMode::Compact`] walks the live trees and writes only reachable
//!   pages, renumbered densely. Child pointers, overflow references and
//!   nested tree roots are rewritten on the way; the free list is dropped.
//!
//! ```text
//! compact layout of the copy
//! [meta 0][meta 1][ main tree pages ... ][ catalog + named db pages ... ]
//!                  children before parents, overflow runs next to their leaf
//! ```
//!
//! Both modes write both meta slots with the snapshot's meta state.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::btree::overflow::run_length;
use crate::btree::{CellFlags, InteriorNode, InteriorNodeMut, LeafNode, LeafNodeMut, TreeInfo};
use crate::config::{DATA_FILE_NAME, FIRST_DATA_PAGE, MAX_TREE_DEPTH};
use crate::storage::{
    decode_db_state, encode_db_state, DbState, MetaRecord, MetaState, MmapStorage, PageHeader,
    PageType, DB_RECORD_SIZE,
};
use crate::{Error, PageNo, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    #[default]
    Raw,
    Compact,
}

/// Cells of a tree hold plain values, or database records whose trees
/// must be copied too.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Cells {
    Values,
    Records,
}

fn create_target(dest: &Path) -> Result<File> {
    fs::create_dir_all(dest)?;
    Ok(OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest.join(DATA_FILE_NAME))?)
}

fn finish(out: BufWriter<File>) -> Result<()> {
    let file = out.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn meta_pages(meta: &MetaState, page_size: usize) -> Vec<u8> {
    let page = MetaRecord::new(meta).to_page(page_size);
    let mut both = Vec::with_capacity(2 * page_size);
    both.extend_from_slice(&page);
    both.extend_from_slice(&page);
    both
}

pub(crate) fn copy_snapshot(
    storage: &MmapStorage,
    meta: &MetaState,
    dest: &Path,
    mode: CopyMode,
) -> Result<()> {
    let file = create_target(dest)?;
    let out = BufWriter::new(file);
    let pages = match mode {
        CopyMode::Raw => copy_raw(storage, meta, out)?,
        CopyMode::Compact => Compactor::new(storage, out).run(meta)?,
    };
    debug!(
        "copied snapshot {} to '{}' ({:?}, {} pages)",
        meta.txn_id,
        dest.display(),
        mode,
        pages
    );
    Ok(())
}

fn copy_raw(storage: &MmapStorage, meta: &MetaState, mut out: BufWriter<File>) -> Result<PageNo> {
    let page_size = storage.page_size();
    out.write_all(&meta_pages(meta, page_size))?;

    let data_pages = meta.last_page.saturating_sub(FIRST_DATA_PAGE);
    if data_pages > 0 {
        storage.prefetch_pages(FIRST_DATA_PAGE, data_pages);
        out.write_all(storage.pages(FIRST_DATA_PAGE, data_pages)?)?;
    }
    finish(out)?;
    Ok(meta.last_page)
}

struct Compactor<'s> {
    src: &'s MmapStorage,
    page_size: usize,
    out: BufWriter<File>,
    next_page: PageNo,
}

impl<'s> Compactor<'s> {
    fn new(src: &'s MmapStorage, out: BufWriter<File>) -> Self {
        Self {
            src,
            page_size: src.page_size(),
            out,
            next_page: FIRST_DATA_PAGE,
        }
    }

    fn run(mut self, meta: &MetaState) -> Result<PageNo> {
        self.out.write_all(&vec![0u8; FIRST_DATA_PAGE as usize * self.page_size])?;

        let main = DbState {
            tree: self.copy_tree(&meta.main.tree, Cells::Values)?,
            ..meta.main
        };
        let catalog = DbState {
            tree: self.copy_tree(&meta.catalog.tree, Cells::Records)?,
            ..meta.catalog
        };
        let compacted = MetaState {
            last_page: self.next_page,
            free: DbState::default(),
            main,
            catalog,
            ..*meta
        };

        self.out.seek(SeekFrom::Start(0))?;
        self.out.write_all(&meta_pages(&compacted, self.page_size))?;
        let pages = self.next_page;
        finish(self.out)?;
        Ok(pages)
    }

    fn emit(&mut self, pages: &[u8]) -> Result<PageNo> {
        let page_no = self.next_page;
        self.out.write_all(pages)?;
        self.next_page += (pages.len() / self.page_size) as PageNo;
        Ok(page_no)
    }

    fn copy_tree(&mut self, tree: &TreeInfo, cells: Cells) -> Result<TreeInfo> {
        if tree.is_empty() {
            return Ok(*tree);
        }
        Ok(TreeInfo {
            root: self.copy_page(tree.root, cells, 0)?,
            ..*tree
        })
    }

    fn copy_page(&mut self, page_no: PageNo, cells: Cells, depth: usize) -> Result<PageNo> {
        if depth > MAX_TREE_DEPTH {
            return Err(Error::bad_page(page_no, "tree deeper than supported"));
        }
        let src = self.src;
        let data = src.page(page_no)?;
        let mut page = data.to_vec();

        match PageHeader::from_bytes(data)?.page_type() {
            PageType::Branch => {
                let node = InteriorNode::from_page(data)?;
                for index in 0..=node.cell_count() {
                    let child = self.copy_page(node.child_at(index)?, cells, depth + 1)?;
                    InteriorNodeMut::from_page(&mut page)?.set_child(index, child)?;
                }
            }
            PageType::Leaf => {
                let node = LeafNode::from_page(data)?;
                for index in 0..node.cell_count() {
                    let cell = node.cell_at(index)?;
                    if let Some(run) = cell.overflow_page() {
                        let count = run_length(src, run)?;
                        let fresh = self.emit(src.pages(run, count)?)?;
                        LeafNodeMut::from_page(&mut page)?.overwrite_data(
                            index,
                            cell.data_len,
                            &fresh.to_le_bytes(),
                        )?;
                    } else if cell.flags.contains(CellFlags::DUPDATA) || cells == Cells::Records {
                        let mut state = decode_db_state(cell.data)?;
                        state.tree = self.copy_tree(&state.tree, Cells::Values)?;
                        LeafNodeMut::from_page(&mut page)?.overwrite_data(
                            index,
                            DB_RECORD_SIZE as u32,
                            &encode_db_state(&state),
                        )?;
                    }
                }
            }
            other => {
                return Err(Error::bad_page(
                    page_no,
                    format!("unexpected {other:?} page inside a tree"),
                ))
            }
        }

        self.emit(&page)
    }
}
