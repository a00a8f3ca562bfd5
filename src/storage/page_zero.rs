//! # Allocation Page
//!
//! Page 0 never moves through the buffer pool: it is memory-mapped for the
//! life of the index and holds the two allocator fields.
//!
//! ```text
//! File byte  Field        Description
//! ---------  -----------  ---------------------------------------------
//! 16         bits         page size in bits, read back on reopen
//! 20..26     alloc right  next fresh page number (header `right` field)
//! 26..32     chain        head of the free-page list (first data bytes)
//! ```
//!
//! Freed pages form a singly linked list through their own `right` fields,
//! with the head stored here. Both fields are guarded by the buffer
//! manager's allocation latch, never by page locks.
//!
//! The duplicate-key sequence counter lives beside the map as a process
//! atomic: the mapped data area starts at file offset 26, so an atomic u64
//! view on the map itself would be misaligned.

use std::cell::UnsafeCell;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{BltError, Result};
use crate::storage::{get_id, put_id, PageNo, BT_ID, PAGE_HEADER_SIZE};

/// Byte offset of the header `right` field, where the allocator keeps the
/// next fresh page number.
const ALLOC_RIGHT: usize = 4 * 4 + 4;

/// Byte offset of the free-chain head: the first slot bytes of the data
/// area, unused on the allocation page.
const CHAIN: usize = PAGE_HEADER_SIZE;

pub struct PageZero {
    map: UnsafeCell<MmapMut>,
    dups: AtomicU64,
}

// SAFETY: all reads and writes of the mapped bytes happen under the buffer
// manager's allocation spin latch, which serializes every accessor. The
// UnsafeCell only exists so mutation does not require &mut BufMgr.
unsafe impl Send for PageZero {}
unsafe impl Sync for PageZero {}

impl PageZero {
    /// Maps the first page of an already-initialized index file.
    pub(crate) fn map(file: &File, page_size: u32) -> Result<Self> {
        // SAFETY: the index file is opened read-write by this process and
        // is not shared with other writers; the map covers exactly the
        // first page, which the initializer has already written.
        let map = unsafe {
            MmapOptions::new()
                .len(page_size as usize)
                .map_mut(file)
                .map_err(BltError::Map)?
        };

        Ok(Self {
            map: UnsafeCell::new(map),
            dups: AtomicU64::new(0),
        })
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: callers hold the allocation latch; see type-level comment.
        unsafe { &*self.map.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes_mut(&self) -> &mut [u8] {
        // SAFETY: callers hold the allocation latch; see type-level comment.
        unsafe { &mut *self.map.get() }
    }

    /// Highest page number ever allocated, plus one.
    pub fn alloc_right(&self) -> PageNo {
        get_id(&self.bytes()[ALLOC_RIGHT..ALLOC_RIGHT + BT_ID])
    }

    pub fn set_alloc_right(&self, page_no: PageNo) {
        put_id(&mut self.bytes_mut()[ALLOC_RIGHT..ALLOC_RIGHT + BT_ID], page_no);
    }

    /// Head of the free-page chain; zero means empty.
    pub fn chain(&self) -> PageNo {
        get_id(&self.bytes()[CHAIN..CHAIN + BT_ID])
    }

    pub fn set_chain(&self, page_no: PageNo) {
        put_id(&mut self.bytes_mut()[CHAIN..CHAIN + BT_ID], page_no);
    }

    /// Next duplicate-key uniqueifier.
    pub fn next_dup(&self) -> u64 {
        self.dups.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn flush(&self) -> Result<()> {
        // SAFETY: flush takes &self on the map and does not alias the bytes.
        unsafe { &*self.map.get() }.flush().map_err(BltError::Map)
    }
}
