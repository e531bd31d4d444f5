//! # TurKV Configuration Constants
//!
//! This module centralizes the numeric limits and defaults of the engine,
//! grouping interdependent values together. Constants that constrain each
//! other are co-located and checked with compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! MIN_PAGE_SIZE ... MAX_PAGE_SIZE (power of two)
//!       │
//!       ├─> PAGE_HEADER_SIZE (16 bytes, fixed)
//!       │
//!       ├─> node body offsets are u16, so MAX_PAGE_SIZE - PAGE_HEADER_SIZE
//!       │   must fit in u16
//!       │
//!       └─> max_key_size(page_size)
//!             A branch page must hold at least BRANCH_MIN_KEYS separators of
//!             maximum size, which keeps fan-out >= 2 after any split.
//!
//! META_PAGE_COUNT (2)
//!       │
//!       └─> FIRST_DATA_PAGE (page numbers below are never allocated)
//!
//! DEFAULT_MAP_SIZE / DEFAULT_GROWTH_INCREMENT
//!       The data file grows in increments, never beyond the map size.
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use crate::config::{DEFAULT_PAGE_SIZE, max_key_size};
//! ```

// ============================================================================
// PAGE LAYOUT CONSTANTS
// ============================================================================

/// Page size used when neither the caller nor the OS provide one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 65536;

/// Size of the common header at the start of every page.
pub const PAGE_HEADER_SIZE: usize = 16;

const _: () = assert!(MIN_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_PAGE_SIZE.is_power_of_two());
const _: () = assert!(
    MAX_PAGE_SIZE - PAGE_HEADER_SIZE <= u16::MAX as usize,
    "node body offsets are stored as u16"
);

// ============================================================================
// NODE CAPACITY CONSTANTS
// ============================================================================

/// Slot size in a leaf page (one u16 cell offset).
pub const LEAF_SLOT_SIZE: usize = 2;

/// Fixed part of a leaf cell: flags (1), key length (2), data length (4).
pub const LEAF_CELL_HEADER_SIZE: usize = 7;

/// Slot size in a branch page: child (4), offset (2), key length (2).
pub const BRANCH_SLOT_SIZE: usize = 8;

/// A branch page holding this many maximum-size keys must still fit.
pub const BRANCH_MIN_KEYS: usize = 4;

/// Nodes whose used bytes drop below this share of the body rebalance.
pub const FILL_THRESHOLD_PERCENT: usize = 25;

/// Inline capacity of the root-to-leaf path stacks.
pub const PATH_INLINE_DEPTH: usize = 16;

/// Deeper trees are treated as corruption (a page cycle).
pub const MAX_TREE_DEPTH: usize = 48;

const _: () = assert!(PATH_INLINE_DEPTH <= MAX_TREE_DEPTH);

/// Usable bytes of a page after its header.
#[inline]
pub const fn page_body_size(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE
}

/// Largest key accepted by a database using `page_size` pages.
#[inline]
pub const fn max_key_size(page_size: usize) -> usize {
    page_body_size(page_size) / BRANCH_MIN_KEYS - BRANCH_SLOT_SIZE
}

/// Largest leaf cell (including its slot) that is stored inline; bigger
/// values move to overflow pages.
#[inline]
pub const fn max_inline_cell(page_size: usize) -> usize {
    page_body_size(page_size) / 2
}

const _: () = assert!(
    LEAF_CELL_HEADER_SIZE + max_key_size(MIN_PAGE_SIZE) + 4 + LEAF_SLOT_SIZE
        <= max_inline_cell(MIN_PAGE_SIZE),
    "a maximum key with an overflow reference must fit inline"
);

// ============================================================================
// FILE LAYOUT CONSTANTS
// ============================================================================

/// Meta pages at the start of the file (page 0 and page 1).
pub const META_PAGE_COUNT: u32 = 2;

/// First page number handed out by the allocator.
pub const FIRST_DATA_PAGE: u32 = META_PAGE_COUNT;

/// Magic bytes identifying a meta page.
pub const META_MAGIC: [u8; 16] = *b"TurKV meta page\0";

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Data file created inside the environment directory.
pub const DATA_FILE_NAME: &str = "data.tkv";

// ============================================================================
// ENVIRONMENT DEFAULTS
// ============================================================================

/// Default upper bound of the memory map (and file size).
pub const DEFAULT_MAP_SIZE: u64 = 64 * 1024 * 1024;

/// Default step by which the data file is extended.
pub const DEFAULT_GROWTH_INCREMENT: u64 = 1024 * 1024;

/// A map must hold at least this many pages.
pub const MIN_MAP_PAGES: u64 = 16;

/// Default limit of named databases in one environment.
pub const DEFAULT_MAX_NAMED_DATABASES: u32 = 32;

/// Default limit of concurrently live read transactions.
pub const DEFAULT_MAX_READERS: u32 = 126;

/// Upper bound of free-list write rounds during commit.
pub const FREELIST_SETTLE_MAX_ROUNDS: usize = 32;

const _: () = assert!(DEFAULT_MAP_SIZE >= MIN_MAP_PAGES * MAX_PAGE_SIZE as u64);
const _: () = assert!(DEFAULT_GROWTH_INCREMENT <= DEFAULT_MAP_SIZE);
