//! # B-link Tree
//!
//! The ordered index built on top of the buffer pool. Every node carries a
//! right-sibling pointer, so readers that race an in-flight split or merge
//! simply slide right instead of waiting on parent locks — the B-link
//! property that lets one page lock at a time suffice for the descent.
//!
//! [`BLTree`] is a per-thread handle: it owns a private cursor page for
//! range scans and the `found` flag of the last mutation, while all shared
//! state lives in the [`crate::storage::BufMgr`] it wraps.

mod tree;

pub use tree::BLTree;
