//! # Storage Module
//!
//! The paged storage layer: on-disk page format, the memory-mapped
//! allocation page, and the buffer pool that serves every page access.
//!
//! ## File layout
//!
//! The index is a single file of fixed-size pages; page `N` lives at byte
//! offset `N << bits` with `bits` in `[9, 24]`. Three pages exist from the
//! moment the file is created:
//!
//! ```text
//! Page 0   allocation page: next fresh page number, free-chain head
//! Page 1   tree root (never relocated)
//! Page 2   first leaf
//! ```
//!
//! Page 0 is memory-mapped ([`PageZero`]); every other page moves through
//! the buffer pool ([`BufMgr`]).
//!
//! ## Module organization
//!
//! - `page`: page header codec, slot array and key/value heap
//! - `page_zero`: the mapped allocation page
//! - `pool`: hash-chained buffer pool with CLOCK eviction and the
//!   lock-coupling page loader

mod page;
mod page_zero;
mod pool;

pub use page::{get_id, put_id, Page, PageHeader, SlotType};
pub use page_zero::PageZero;
pub use pool::{BufMgr, PoolStats};

/// 48-bit page number; stored on disk as 6 big-endian bytes.
pub type PageNo = u64;

/// Width of an encoded page number, and of the fixed-size values the tree
/// stores at non-leaf levels.
pub const BT_ID: usize = 6;

/// Longest supported key in bytes; the length is encoded in a single byte.
pub const MAX_KEY: usize = 255;

pub const PAGE_HEADER_SIZE: usize = 26;
pub const SLOT_SIZE: usize = 6;

pub const MIN_BITS: u8 = 9;
pub const MAX_BITS: u8 = 24;
pub const MIN_PAGE_SIZE: usize = 1 << MIN_BITS;

pub const ALLOC_PAGE: PageNo = 0;
pub const ROOT_PAGE: PageNo = 1;
pub const LEAF_PAGE: PageNo = 2;

/// Number of tree levels written when a new file is created.
pub const MIN_LEVEL: u8 = 2;
