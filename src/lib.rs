//! # blinktree — a concurrent B-link tree index
//!
//! A persistent, concurrent ordered key→value index stored in a single
//! paged file. Keys are byte strings up to 255 bytes; values are opaque
//! 6-byte payloads (page numbers on the tree's own inner levels).
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use blinktree::{BLTree, BufMgr, BT_ID};
//!
//! let mgr = Arc::new(BufMgr::open("./index.db", 15, 64)?);
//! let mut tree = BLTree::new(Arc::clone(&mgr));
//!
//! tree.insert_key(b"alpha", 0, [0, 0, 0, 0, 0, 1], true)?;
//! if let Some((key, value)) = tree.find_key(b"alpha", BT_ID)? {
//!     println!("{key:?} -> {value:?}");
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        BLTree (per thread)          │   search / insert / delete / scan
//! ├─────────────────────────────────────┤
//! │        BufMgr (shared)              │   frame pinning, CLOCK eviction,
//! │                                     │   free-page recycling, page I/O
//! ├─────────────────────────────────────┤
//! │   Latch manager (per frame)         │   phase-fair RW latches in three
//! │                                     │   sets: access/delete, read/write,
//! │                                     │   parent modification
//! ├─────────────────────────────────────┤
//! │   Paged file + mapped page zero     │   read_at/write_at pages, mmap'd
//! │                                     │   allocator and free chain
//! └─────────────────────────────────────┘
//! ```
//!
//! The tree is a **B-link tree**: every node points at its right sibling,
//! so a reader racing a split or merge slides right instead of waiting on
//! parent locks. Combined with lock-coupling during the descent, at most
//! one page lock is held per step, and writers on disjoint keys proceed
//! in parallel.
//!
//! Clean shutdown flushes dirty frames (`BufMgr::flush`, also run on
//! drop). There is no write-ahead log: a crash may leave the file
//! structurally inconsistent, and recovery is out of scope.
//!
//! ## Module Overview
//!
//! - [`storage`]: page format, mapped allocation page, buffer pool
//! - [`btree`]: the B-link tree operations
//! - [`latch`]: phase-fair RW latch, spin latch, per-frame latch sets
//! - [`error`]: typed error kinds

pub mod btree;
pub mod error;
pub mod latch;
pub mod storage;

pub use btree::BLTree;
pub use error::{BltError, Result};
pub use latch::LockMode;
pub use storage::{BufMgr, Page, PageNo, PoolStats, BT_ID, MAX_KEY};
