//! # Buffer Pool
//!
//! A fixed-size pool of page frames with hash-chain lookup, CLOCK
//! eviction and free-page recycling. Every page access in the index goes
//! through [`BufMgr`]; it owns the file handle, the mapped allocation page
//! and all frames.
//!
//! ## Frame lookup
//!
//! Page numbers hash into `latch_total / 16` buckets. Each bucket head
//! holds a frame index and a spin latch; frames chain through the
//! `prev`/`next` indices of their [`LatchSet`]. A page number appears in
//! at most one frame, enforced by linking only under the bucket's write
//! latch.
//!
//! ## Pin/unpin and CLOCK replacement
//!
//! `pin_latch` pins the frame before returning it; pinned frames are
//! never evicted. `unpin_latch` first sets the clock bit, granting the
//! frame one grace sweep. The eviction sweep advances a global hand over
//! the frames:
//!
//! - frames hashing into the requester's own bucket are skipped (their
//!   chain latch is already held),
//! - buckets that cannot be try-locked are skipped,
//! - pinned frames are skipped; a set clock bit is cleared for a second
//!   chance,
//! - the victim is written out if dirty, unlinked from its old chain and
//!   relinked under the new page number.
//!
//! ## Page loading
//!
//! `load_page` drills from the root one page at a time using lock
//! coupling: pin child, take its Access lock, release the parent, take
//! the requested mode, drop Access. Pages marked `kill` or yielding no
//! slot are crossed via their right sibling pointer, which is what makes
//! an in-flight split or merge invisible to readers.
//!
//! ## Mutable page access
//!
//! Frames live in `UnsafeCell`s so that page contents can be mutated
//! while the pool is shared between threads. The latch protocol is the
//! guard: `page_mut` callers hold the frame's Write latch (or have sole
//! ownership of a frame that is not yet visible, as in `latch_link`).

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use tracing::{info, warn};
use zerocopy::FromBytes;

use crate::error::{BltError, Result};
use crate::latch::{LatchSet, LockMode, SpinLatch, CLOCK_BIT};

use super::{
    get_id, put_id, Page, PageHeader, PageNo, PageZero, ALLOC_PAGE, BT_ID, MAX_BITS, MIN_BITS,
    MIN_LEVEL, MIN_PAGE_SIZE, PAGE_HEADER_SIZE, ROOT_PAGE,
};

/// Cumulative page I/O counters.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub reads: u64,
    pub writes: u64,
}

struct HashEntry {
    /// Frame index at the head of this bucket's chain; 0 = empty.
    slot: AtomicUsize,
    latch: SpinLatch,
}

impl HashEntry {
    fn new() -> Self {
        Self {
            slot: AtomicUsize::new(0),
            latch: SpinLatch::new(),
        }
    }
}

pub struct BufMgr {
    page_size: u32,
    page_bits: u8,
    page_data_size: u32,
    file: File,

    page_zero: PageZero,
    alloc_latch: SpinLatch,

    latch_deployed: AtomicU32,
    latch_total: usize,
    latch_hash: usize,
    latch_victim: AtomicU32,

    hash_table: Box<[HashEntry]>,
    latch_sets: Box<[LatchSet]>,
    page_pool: Box<[UnsafeCell<Page>]>,

    reads: AtomicU64,
    writes: AtomicU64,
}

// SAFETY: the UnsafeCell page frames are only read under a frame Read (or
// stronger) latch and only mutated under the frame Write latch or before
// the frame is published on a hash chain. PageZero carries its own latch
// discipline. Everything else is atomics, latches and the immutable file
// handle.
unsafe impl Send for BufMgr {}
unsafe impl Sync for BufMgr {}

fn read_page_from(file: &File, page_bits: u8, page: &mut Page, page_no: PageNo) -> Result<()> {
    let off = page_no << page_bits;
    let mut header = [0u8; PAGE_HEADER_SIZE];
    file.read_exact_at(&mut header, off).map_err(BltError::Read)?;
    page.set_header(
        PageHeader::read_from_bytes(&header).map_err(|_| BltError::Struct("short page header"))?,
    );
    file.read_exact_at(page.data_mut(), off + PAGE_HEADER_SIZE as u64)
        .map_err(BltError::Read)?;
    Ok(())
}

fn write_page_to(file: &File, page_bits: u8, page: &Page, page_no: PageNo) -> Result<()> {
    let off = page_no << page_bits;
    file.write_all_at(page.header_bytes(), off)
        .map_err(BltError::Write)?;
    file.write_all_at(page.data(), off + PAGE_HEADER_SIZE as u64)
        .map_err(BltError::Write)?;
    Ok(())
}

impl BufMgr {
    /// Opens or creates an index file.
    ///
    /// `bits` is the page size in bits, clamped to `[9, 24]`; an existing
    /// file overrides it with the size it was created with. `node_max` is
    /// the number of buffer-pool frames and must be at least 16.
    pub fn open<P: AsRef<Path>>(path: P, bits: u8, node_max: usize) -> Result<Self> {
        let mut bits = bits.clamp(MIN_BITS, MAX_BITS);

        if node_max < 16 {
            return Err(BltError::Config(format!(
                "buffer pool too small: {node_max} frames (minimum 16)"
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .map_err(BltError::Map)?;

        // an existing file knows its own page size; probe the smallest
        // possible page and read the bits byte from its header
        let mut initialize = true;
        let file_size = file.metadata().map_err(BltError::Map)?.len();
        if file_size > 0 {
            let mut probe = [0u8; MIN_PAGE_SIZE];
            if file.read_exact_at(&mut probe, 0).is_ok()
                && (MIN_BITS..=MAX_BITS).contains(&probe[16])
            {
                bits = probe[16];
                initialize = false;
            }
        }

        let page_size = 1u32 << bits;
        let page_data_size = page_size - PAGE_HEADER_SIZE as u32;
        let latch_total = node_max;
        let latch_hash = node_max / 16;

        if initialize {
            let mut page = Page::new(page_data_size);
            page.set_bits(bits);
            page.set_right_id(PageNo::from(MIN_LEVEL) + 1);
            write_page_to(&file, bits, &page, ALLOC_PAGE)?;

            // seed each level with its {0xff,0xff} stopper; the root's
            // stopper points one level down, the leaf's value is empty
            let mut page = Page::new(page_data_size);
            page.set_bits(bits);
            for lvl in (0..MIN_LEVEL).rev() {
                let cell = if lvl > 0 { 1 + BT_ID as u32 } else { 1 };
                page.set_key_offset(1, page_data_size - 3 - cell);
                page.set_key(1, &[0xff, 0xff]);
                if lvl > 0 {
                    let mut value = [0u8; BT_ID];
                    put_id(&mut value, PageNo::from(MIN_LEVEL - lvl) + 1);
                    page.set_value(1, &value);
                } else {
                    page.set_value(1, &[]);
                }
                page.set_min(page.key_offset(1));
                page.set_lvl(lvl);
                page.set_cnt(1);
                page.set_act(1);
                write_page_to(&file, bits, &page, PageNo::from(MIN_LEVEL - lvl))?;
            }
        }

        let page_zero = PageZero::map(&file, page_size)?;

        let hash_table: Box<[HashEntry]> = (0..latch_hash).map(|_| HashEntry::new()).collect();
        let latch_sets: Box<[LatchSet]> = (0..latch_total).map(|_| LatchSet::new()).collect();
        let page_pool: Box<[UnsafeCell<Page>]> = (0..latch_total)
            .map(|_| UnsafeCell::new(Page::new(page_data_size)))
            .collect();

        Ok(Self {
            page_size,
            page_bits: bits,
            page_data_size,
            file,
            page_zero,
            alloc_latch: SpinLatch::new(),
            latch_deployed: AtomicU32::new(0),
            latch_total,
            latch_hash,
            latch_victim: AtomicU32::new(0),
            hash_table,
            latch_sets,
            page_pool,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub(crate) fn page_bits(&self) -> u8 {
        self.page_bits
    }

    pub(crate) fn page_data_size(&self) -> u32 {
        self.page_data_size
    }

    pub(crate) fn page_zero(&self) -> &PageZero {
        &self.page_zero
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn latch(&self, entry: usize) -> &LatchSet {
        &self.latch_sets[entry]
    }

    /// Shared view of a pooled page.
    ///
    /// The caller must hold the frame pinned and Read-or-stronger locked.
    pub(crate) fn page(&self, entry: usize) -> &Page {
        // SAFETY: the frame is pinned by the caller, so it cannot be
        // relinked underneath us, and the latch protocol keeps writers
        // exclusive; see the type-level comment.
        unsafe { &*self.page_pool[entry].get() }
    }

    /// Exclusive view of a pooled page.
    ///
    /// The caller must hold the frame's Write latch, or sole ownership of
    /// a frame that is not yet published on any hash chain.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn page_mut(&self, entry: usize) -> &mut Page {
        // SAFETY: exclusivity is provided by the frame Write latch (or by
        // the frame being unpublished); see the type-level comment.
        unsafe { &mut *self.page_pool[entry].get() }
    }

    pub(crate) fn read_page(&self, page: &mut Page, page_no: PageNo) -> Result<()> {
        read_page_from(&self.file, self.page_bits, page, page_no)
    }

    pub(crate) fn write_page(&self, page: &Page, page_no: PageNo) -> Result<()> {
        write_page_to(&self.file, self.page_bits, page, page_no)
    }

    /// Links frame `slot` to `page_no` at the head of its hash chain,
    /// optionally reading the page from disk. Call with the chain's latch
    /// write-held.
    fn latch_link(&self, hash_idx: usize, slot: usize, page_no: PageNo, load_it: bool) -> Result<()> {
        let head = &self.hash_table[hash_idx];
        let latch = &self.latch_sets[slot];

        let old_head = head.slot.load(Ordering::Relaxed);
        latch.set_next(old_head);
        if old_head > 0 {
            self.latch_sets[old_head].set_prev(slot);
        }
        head.slot.store(slot, Ordering::Relaxed);

        latch.set_page_no(page_no);
        latch.set_prev(0);
        latch.pin.store(1, Ordering::Release);

        if load_it {
            self.read_page(self.page_mut(slot), page_no)?;
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Pins the frame holding `page_no`, loading the page from disk on a
    /// miss when `load_it` is set. Returns the frame index.
    pub(crate) fn pin_latch(&self, page_no: PageNo, load_it: bool) -> Result<usize> {
        let hash_idx = (page_no as usize) % self.latch_hash;
        let head = &self.hash_table[hash_idx];
        head.latch.write_lock();

        // hit: bump the pin under the chain latch
        let mut slot = head.slot.load(Ordering::Relaxed);
        while slot > 0 {
            let latch = &self.latch_sets[slot];
            if latch.page_no() == page_no {
                break;
            }
            slot = latch.next();
        }
        if slot > 0 {
            self.latch_sets[slot].pin.fetch_add(1, Ordering::AcqRel);
            head.latch.release_write();
            return Ok(slot);
        }

        // miss: claim an unused frame below the high-water mark
        let slot = self.latch_deployed.fetch_add(1, Ordering::AcqRel) as usize + 1;
        if slot < self.latch_total {
            let res = self.latch_link(hash_idx, slot, page_no, load_it);
            head.latch.release_write();
            return res.map(|()| slot);
        }
        self.latch_deployed.fetch_sub(1, Ordering::AcqRel);

        // pool full: run the clock sweep for a victim
        loop {
            let slot = self.latch_victim.fetch_add(1, Ordering::AcqRel) as usize % self.latch_total;
            if slot == 0 {
                continue;
            }
            let latch = &self.latch_sets[slot];
            let idx = (latch.page_no() as usize) % self.latch_hash;

            // a victim on our own chain would deadlock on the chain latch
            if idx == hash_idx {
                continue;
            }
            if !self.hash_table[idx].latch.try_write_lock() {
                continue;
            }

            // pinned frames stay; a set clock bit buys one more sweep
            let pins = latch.pins();
            if pins != 0 {
                if pins & CLOCK_BIT != 0 {
                    latch.pin.fetch_and(!CLOCK_BIT, Ordering::AcqRel);
                }
                self.hash_table[idx].latch.release_write();
                continue;
            }

            if latch.is_dirty() {
                if let Err(err) = self.write_page(self.page(slot), latch.page_no()) {
                    self.hash_table[idx].latch.release_write();
                    head.latch.release_write();
                    return Err(err);
                }
                latch.set_dirty(false);
                self.writes.fetch_add(1, Ordering::Relaxed);
            }

            // unlink the victim from its old chain
            let prev = latch.prev();
            let next = latch.next();
            if prev > 0 {
                self.latch_sets[prev].set_next(next);
            } else {
                self.hash_table[idx].slot.store(next, Ordering::Relaxed);
            }
            if next > 0 {
                self.latch_sets[next].set_prev(prev);
            }

            let res = self.latch_link(hash_idx, slot, page_no, load_it);
            self.hash_table[idx].latch.release_write();
            head.latch.release_write();
            return res.map(|()| slot);
        }
    }

    pub(crate) fn unpin_latch(&self, entry: usize) {
        self.latch_sets[entry].unpin();
    }

    /// Allocates a page, preferring the free chain over extending the
    /// file. Returns the frame, pinned and dirty but unlocked, holding a
    /// copy of `contents`.
    pub(crate) fn new_page(&self, contents: &Page) -> Result<usize> {
        self.alloc_latch.write_lock();

        let page_no = self.page_zero.chain();
        if page_no > 0 {
            let entry = match self.pin_latch(page_no, true) {
                Ok(entry) => entry,
                Err(err) => {
                    self.alloc_latch.release_write();
                    return Err(err);
                }
            };
            let page = self.page_mut(entry);
            self.page_zero.set_chain(page.right_id());
            self.alloc_latch.release_write();

            page.copy_from(contents);
            self.latch(entry).set_dirty(true);
            return Ok(entry);
        }

        let page_no = self.page_zero.alloc_right();
        self.page_zero.set_alloc_right(page_no + 1);
        self.alloc_latch.release_write();

        // a fresh page number: nothing on disk to load
        let entry = self.pin_latch(page_no, false)?;
        let page = self.page_mut(entry);
        page.copy_from(contents);
        self.latch(entry).set_dirty(true);
        Ok(entry)
    }

    /// Returns a page to the free chain. Call with the frame Delete and
    /// Write locked; both locks are released and the frame unpinned.
    pub(crate) fn free_page(&self, entry: usize) {
        self.alloc_latch.write_lock();

        let latch = self.latch(entry);
        let page = self.page_mut(entry);
        page.set_right_id(self.page_zero.chain());
        page.set_free(true);
        self.page_zero.set_chain(latch.page_no());
        latch.set_dirty(true);

        latch.unlock(LockMode::Delete);
        latch.unlock(LockMode::Write);
        latch.unpin();

        self.alloc_latch.release_write();
    }

    /// Drills from the root to `lvl` for `key` using lock coupling,
    /// leaving the target page pinned and locked in `lock` mode. Returns
    /// the frame and the slot found for the key.
    pub(crate) fn load_page(&self, key: &[u8], lvl: u8, lock: LockMode) -> Result<(usize, u32)> {
        let mut page_no = ROOT_PAGE;
        let mut drill: u8 = 0xff;
        let mut prev: Option<(usize, LockMode)> = None;

        while page_no > 0 {
            let mode = if drill == lvl { lock } else { LockMode::Read };

            let entry = self.pin_latch(page_no, true)?;
            let latch = self.latch(entry);

            // chain through the access lock ahead of the page lock
            if page_no > ROOT_PAGE {
                latch.lock(LockMode::Access);
            }

            // release & unpin the parent page
            if let Some((prev_entry, prev_mode)) = prev.take() {
                let prev_latch = self.latch(prev_entry);
                prev_latch.unlock(prev_mode);
                prev_latch.unpin();
            }

            latch.lock(mode);

            if self.page(entry).is_free() {
                return Err(BltError::Struct("descended into a free page"));
            }

            if page_no > ROOT_PAGE {
                latch.unlock(LockMode::Access);
            }

            // first touch of the real root: learn its level, and retry
            // under the stronger lock when the root itself is the target
            if self.page(entry).lvl() != drill {
                if latch.page_no() != ROOT_PAGE {
                    return Err(BltError::Struct("level mismatch below the root"));
                }
                drill = self.page(entry).lvl();
                if lock != LockMode::Read && drill == lvl {
                    latch.unlock(mode);
                    latch.unpin();
                    continue;
                }
            }

            prev = Some((entry, mode));

            let page = self.page(entry);
            if !page.is_kill() {
                let slot = page.find_slot(key);
                if slot > 0 {
                    if drill == lvl {
                        return Ok((entry, slot));
                    }

                    // descend through the next live slot
                    let mut slot = slot;
                    let mut slide = false;
                    while page.dead(slot) {
                        if slot < page.cnt() {
                            slot += 1;
                        } else {
                            slide = true;
                            break;
                        }
                    }
                    if !slide {
                        page_no = get_id(page.value(slot));
                        drill -= 1;
                        continue;
                    }
                }
            }

            // slide right past a killed or overtaken page
            page_no = page.right_id();
        }

        Err(BltError::Struct("end of right sibling chain"))
    }

    /// Writes every dirty frame and the allocation page; returns the
    /// number of frames flushed.
    pub fn flush(&self) -> Result<usize> {
        let deployed =
            (self.latch_deployed.load(Ordering::Acquire) as usize).min(self.latch_total - 1);
        let mut flushed = 0;
        for slot in 1..=deployed {
            let latch = &self.latch_sets[slot];
            if latch.is_dirty() {
                self.write_page(self.page(slot), latch.page_no())?;
                latch.set_dirty(false);
                flushed += 1;
            }
        }
        self.page_zero.flush()?;
        info!(flushed, "buffer pool pages flushed");
        Ok(flushed)
    }

    /// Diagnostic sweep reporting frames still locked or pinned; useful
    /// right before close.
    pub fn pool_audit(&self) {
        let deployed =
            (self.latch_deployed.load(Ordering::Acquire) as usize).min(self.latch_total - 1);
        for slot in 0..=deployed {
            let latch = &self.latch_sets[slot];
            if latch.read_wr.write_held() {
                warn!(slot, page_no = latch.page_no(), "frame still read/write locked");
            }
            if latch.access.write_held() {
                warn!(slot, page_no = latch.page_no(), "frame still access locked");
            }
            if latch.parent.write_held() {
                warn!(slot, page_no = latch.page_no(), "frame still parent locked");
            }
            if latch.pins() & !CLOCK_BIT != 0 {
                warn!(
                    slot,
                    page_no = latch.page_no(),
                    pins = latch.pins() & !CLOCK_BIT,
                    "frame still pinned"
                );
            }
        }
    }
}

impl Drop for BufMgr {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(%err, "failed to flush buffer pool on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_mgr(bits: u8, node_max: usize) -> (TempDir, BufMgr) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BufMgr::open(dir.path().join("test.db"), bits, node_max).unwrap();
        (dir, mgr)
    }

    #[test]
    fn open_rejects_tiny_pool() {
        let dir = tempfile::tempdir().unwrap();
        let result = BufMgr::open(dir.path().join("test.db"), 15, 8);
        assert!(matches!(result, Err(BltError::Config(_))));
    }

    #[test]
    fn open_writes_initial_pages() {
        let (_dir, mgr) = open_mgr(12, 100);

        let mut page = Page::new(mgr.page_data_size());
        for page_no in 0..3 {
            mgr.read_page(&mut page, page_no).unwrap();
        }
        assert!(matches!(
            mgr.read_page(&mut page, 3),
            Err(BltError::Read(_))
        ));
    }

    #[test]
    fn open_seeds_root_and_leaf_with_stoppers() {
        let (_dir, mgr) = open_mgr(12, 100);

        let mut page = Page::new(mgr.page_data_size());
        mgr.read_page(&mut page, ROOT_PAGE).unwrap();
        assert_eq!(page.lvl(), 1);
        assert_eq!(page.cnt(), 1);
        assert_eq!(page.act(), 1);
        assert_eq!(page.key(1), &[0xff, 0xff]);
        assert_eq!(get_id(page.value(1)), 2);

        mgr.read_page(&mut page, 2).unwrap();
        assert_eq!(page.lvl(), 0);
        assert_eq!(page.key(1), &[0xff, 0xff]);
        assert!(page.value(1).is_empty());
    }

    #[test]
    fn reopen_learns_page_size_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mgr = BufMgr::open(&path, 12, 100).unwrap();
        assert_eq!(mgr.page_size(), 1 << 12);
        drop(mgr);

        // ask for different bits; the file knows better
        let mgr = BufMgr::open(&path, 15, 100).unwrap();
        assert_eq!(mgr.page_size(), 1 << 12);
    }

    #[test]
    fn pin_latch_sets_page_no_and_pin() {
        let (_dir, mgr) = open_mgr(15, 20);

        let page = Page::new(mgr.page_data_size());
        mgr.write_page(&page, 3).unwrap();
        mgr.write_page(&page, 4).unwrap();

        let entry = mgr.pin_latch(3, false).unwrap();
        assert_eq!(mgr.latch(entry).page_no(), 3);
        assert_eq!(mgr.latch(entry).pins(), 1);
        assert_eq!(mgr.stats().reads, 0);

        let entry = mgr.pin_latch(4, true).unwrap();
        assert_eq!(mgr.latch(entry).page_no(), 4);
        assert_eq!(mgr.latch(entry).pins(), 1);
        assert_eq!(mgr.stats().reads, 1);
    }

    #[test]
    fn pin_latch_twice_bumps_pin() {
        let (_dir, mgr) = open_mgr(15, 20);

        let first = mgr.pin_latch(3, false).unwrap();
        let second = mgr.pin_latch(3, false).unwrap();

        assert_eq!(first, second);
        assert_eq!(mgr.latch(second).pins(), 2);
    }

    #[test]
    fn unpin_grants_clock_bit() {
        let (_dir, mgr) = open_mgr(15, 32);

        let entry = mgr.pin_latch(2, false).unwrap();
        assert_eq!(mgr.latch(entry).pins(), 1);

        mgr.unpin_latch(entry);
        assert_eq!(mgr.latch(entry).pins(), CLOCK_BIT);

        mgr.latch(entry).pin.fetch_and(!CLOCK_BIT, Ordering::SeqCst);
        assert_eq!(mgr.latch(entry).pins(), 0);
    }

    #[test]
    fn clock_sweep_evicts_unpinned_frame() {
        let (_dir, mgr) = open_mgr(15, 32);

        // fill every frame, keeping one page unpinned
        let mut unpinned = None;
        for page_no in 3..34 {
            let entry = mgr.pin_latch(page_no, false).unwrap();
            if page_no == 9 {
                unpinned = Some(entry);
            }
        }
        mgr.unpin_latch(unpinned.unwrap());

        let entry = mgr.pin_latch(34, false).unwrap();
        assert_eq!(mgr.latch(entry).page_no(), 34);
        assert_eq!(mgr.latch(entry).pins(), 1);
    }

    #[test]
    fn eviction_writes_back_dirty_victim() {
        let (_dir, mgr) = open_mgr(15, 32);

        let entry = mgr.pin_latch(9, false).unwrap();
        {
            let page = mgr.page_mut(entry);
            page.set_cnt(42);
            page.set_lvl(3);
        }
        mgr.latch(entry).set_dirty(true);
        mgr.unpin_latch(entry);

        for page_no in 10..41 {
            let entry = mgr.pin_latch(page_no, false).unwrap();
            if page_no >= 40 {
                // force enough pressure to take the dirty frame
                mgr.unpin_latch(entry);
            }
        }

        let mut page = Page::new(mgr.page_data_size());
        mgr.read_page(&mut page, 9).unwrap();
        assert_eq!(page.cnt(), 42);
        assert_eq!(page.lvl(), 3);
    }

    #[test]
    fn new_page_bumps_alloc_right() {
        let (_dir, mgr) = open_mgr(15, 20);

        assert_eq!(mgr.page_zero().alloc_right(), PageNo::from(MIN_LEVEL) + 1);

        let mut contents = Page::new(mgr.page_data_size());
        contents.set_lvl(0);
        contents.data_mut()[0] = 7;

        let entry = mgr.new_page(&contents).unwrap();
        assert_eq!(mgr.page_zero().alloc_right(), PageNo::from(MIN_LEVEL) + 2);
        assert_eq!(mgr.latch(entry).page_no(), 3);
        assert_eq!(mgr.page(entry).data()[0], 7);
        assert!(mgr.latch(entry).is_dirty());
        mgr.unpin_latch(entry);
    }

    #[test]
    fn free_page_chains_and_new_page_reuses() {
        let (_dir, mgr) = open_mgr(15, 20);

        let contents = Page::new(mgr.page_data_size());
        let entry = mgr.new_page(&contents).unwrap();
        let freed_no = mgr.latch(entry).page_no();

        mgr.latch(entry).lock(LockMode::Delete);
        mgr.latch(entry).lock(LockMode::Write);
        mgr.free_page(entry);
        assert_eq!(mgr.page_zero().chain(), freed_no);

        let entry = mgr.new_page(&contents).unwrap();
        assert_eq!(mgr.latch(entry).page_no(), freed_no);
        assert_eq!(mgr.page_zero().chain(), 0);
        assert!(!mgr.page(entry).is_free());
        mgr.unpin_latch(entry);
    }

    #[test]
    fn load_page_descends_to_leaf() {
        let (_dir, mgr) = open_mgr(15, 20);

        let (entry, slot) = mgr.load_page(&[1, 2, 3], 0, LockMode::Read).unwrap();
        assert_eq!(mgr.latch(entry).page_no(), 2);
        assert_eq!(slot, 1);
        assert_eq!(mgr.page(entry).key(slot), &[0xff, 0xff]);

        mgr.latch(entry).unlock(LockMode::Read);
        mgr.unpin_latch(entry);
    }

    #[test]
    fn flush_writes_dirty_frames_once() {
        let (_dir, mgr) = open_mgr(15, 20);

        let entry = mgr.pin_latch(2, true).unwrap();
        mgr.page_mut(entry).set_act(5);
        mgr.latch(entry).set_dirty(true);
        mgr.unpin_latch(entry);

        assert_eq!(mgr.flush().unwrap(), 1);
        assert_eq!(mgr.flush().unwrap(), 0);

        let mut page = Page::new(mgr.page_data_size());
        mgr.read_page(&mut page, 2).unwrap();
        assert_eq!(page.act(), 5);
    }

    #[test]
    fn pool_audit_runs_clean() {
        let (_dir, mgr) = open_mgr(12, 100);
        mgr.pool_audit();
    }
}
