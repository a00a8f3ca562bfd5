//! # Latch Manager
//!
//! Synchronization primitives for the buffer pool and the tree algorithms.
//!
//! Each buffer-pool frame carries a [`LatchSet`] with three independent
//! reader/writer word-pairs, giving six lock modes in four compatibility
//! sets:
//!
//! ```text
//! Set 1   Access  (shared)     going to read the page; incompatible with Delete
//!         Delete  (exclusive)  about to release the page; incompatible with Access
//! Set 2   Read    (shared)     read page contents; incompatible with Write
//!         Write   (exclusive)  modify page contents
//! Set 3   Parent  (exclusive)  posting or changing the page's fence key in its parent
//! ```
//!
//! (A fourth set for atomic multi-key updates exists in the lineage of this
//! design but is not part of this implementation.)
//!
//! ## Phase-fair reader/writer lock
//!
//! [`PhaseFairRwLock`] alternates reader and writer phases so neither side
//! starves. The state is four `u32` words:
//!
//! - `ticket`/`serving`: FIFO ticket lock ordering writers.
//! - `rin`/`rout`: reader entry and exit counters in units of `RINC`, with
//!   the writer phase id (`PHID`) and writer-present flag (`PRES`) packed
//!   into the two low bits of `rin`.
//!
//! A writer takes a ticket, waits its turn, publishes `PRES` plus the phase
//! bit, then waits for in-flight readers to drain (`rout` catches up to the
//! reader count it observed). A reader registers with one atomic add and
//! only spins when a writer currently holds the phase. All spinning yields
//! the scheduler, so heavy contention degrades to cooperative waiting.
//!
//! ## Spin latch
//!
//! [`SpinLatch`] protects hash-chain heads and the allocation area. Critical
//! sections are a few loads and stores, so it is a mutex-backed
//! share/exclusive counter with a non-blocking write attempt used by the
//! clock sweep.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::storage::PageNo;

const PHID: u32 = 0x1;
const PRES: u32 = 0x2;
const MASK: u32 = 0x3;
const RINC: u32 = 0x4;

/// Second-chance bit folded into the high part of a frame's pin count.
pub const CLOCK_BIT: u32 = 0x8000;

/// Lock modes placed on a buffer-pool frame. See the module docs for the
/// compatibility sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Access,
    Delete,
    Read,
    Write,
    Parent,
}

/// Phase-fair reader/writer lock.
///
/// Guarantees FIFO ordering among writers and admits waiting readers in at
/// most two phases between any two writers.
#[derive(Debug, Default)]
pub struct PhaseFairRwLock {
    rin: AtomicU32,
    rout: AtomicU32,
    ticket: AtomicU32,
    serving: AtomicU32,
}

impl PhaseFairRwLock {
    pub const fn new() -> Self {
        Self {
            rin: AtomicU32::new(0),
            rout: AtomicU32::new(0),
            ticket: AtomicU32::new(0),
            serving: AtomicU32::new(0),
        }
    }

    pub fn write_lock(&self) {
        let tix = self.ticket.fetch_add(1, Ordering::AcqRel);

        // wait for our ticket to come up
        while tix != self.serving.load(Ordering::Acquire) {
            thread::yield_now();
        }

        let w = PRES | (tix & PHID);
        let r = self.rin.fetch_add(w, Ordering::AcqRel);

        // wait for the readers that entered before us to drain
        while r != self.rout.load(Ordering::Acquire) {
            thread::yield_now();
        }
    }

    pub fn write_release(&self) {
        self.rin.fetch_and(!MASK, Ordering::AcqRel);
        self.serving.fetch_add(1, Ordering::AcqRel);
    }

    pub fn read_lock(&self) {
        let w = self.rin.fetch_add(RINC, Ordering::AcqRel) & MASK;
        if w > 0 {
            // a writer holds the current phase; wait for the phase to flip
            while w == self.rin.load(Ordering::Acquire) & MASK {
                thread::yield_now();
            }
        }
    }

    pub fn read_release(&self) {
        self.rout.fetch_add(RINC, Ordering::AcqRel);
    }

    /// A writer currently holds or is acquiring the lock. Diagnostic only.
    pub(crate) fn write_held(&self) -> bool {
        self.rin.load(Ordering::Relaxed) & MASK != 0
    }
}

#[derive(Debug, Default)]
struct SpinState {
    exclusive: bool,
    pending: bool,
    share: u16,
}

/// Short-duration share/exclusive latch backing the hash-chain heads and
/// the allocation area.
#[derive(Debug, Default)]
pub struct SpinLatch {
    state: Mutex<SpinState>,
}

impl SpinLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no writer holds or awaits the latch, then adds a share.
    pub fn read_lock(&self) {
        loop {
            let mut state = self.state.lock();
            if !(state.exclusive || state.pending) {
                state.share += 1;
                return;
            }
            drop(state);
            thread::yield_now();
        }
    }

    /// Waits for all shares and any writer to relinquish.
    pub fn write_lock(&self) {
        loop {
            let mut state = self.state.lock();
            if state.share == 0 && !state.exclusive {
                state.exclusive = true;
                state.pending = false;
                return;
            }
            state.pending = true;
            drop(state);
            thread::yield_now();
        }
    }

    /// Non-blocking write attempt used by the eviction sweep.
    pub fn try_write_lock(&self) -> bool {
        match self.state.try_lock() {
            Some(mut state) => {
                if state.share == 0 && !state.exclusive {
                    state.exclusive = true;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    pub fn release_write(&self) {
        self.state.lock().exclusive = false;
    }

    pub fn release_read(&self) {
        self.state.lock().share -= 1;
    }
}

/// Per-frame latch table entry.
///
/// `pin` counts the threads holding the frame; its [`CLOCK_BIT`] is the
/// second-chance bit of the CLOCK replacement policy. `prev`/`next` are
/// frame indices chaining this entry into its hash bucket; they are only
/// touched while the bucket's spin latch is write-held.
#[derive(Debug)]
pub struct LatchSet {
    page_no: AtomicU64,
    pub(crate) read_wr: PhaseFairRwLock,
    pub(crate) access: PhaseFairRwLock,
    pub(crate) parent: PhaseFairRwLock,
    pub(crate) pin: AtomicU32,
    dirty: AtomicBool,
    next: AtomicUsize,
    prev: AtomicUsize,
}

impl LatchSet {
    pub fn new() -> Self {
        Self {
            page_no: AtomicU64::new(0),
            read_wr: PhaseFairRwLock::new(),
            access: PhaseFairRwLock::new(),
            parent: PhaseFairRwLock::new(),
            pin: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            next: AtomicUsize::new(0),
            prev: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self, mode: LockMode) {
        match mode {
            LockMode::Read => self.read_wr.read_lock(),
            LockMode::Write => self.read_wr.write_lock(),
            LockMode::Access => self.access.read_lock(),
            LockMode::Delete => self.access.write_lock(),
            LockMode::Parent => self.parent.write_lock(),
        }
    }

    pub fn unlock(&self, mode: LockMode) {
        match mode {
            LockMode::Read => self.read_wr.read_release(),
            LockMode::Write => self.read_wr.write_release(),
            LockMode::Access => self.access.read_release(),
            LockMode::Delete => self.access.write_release(),
            LockMode::Parent => self.parent.write_release(),
        }
    }

    pub fn page_no(&self) -> PageNo {
        self.page_no.load(Ordering::Acquire)
    }

    pub(crate) fn set_page_no(&self, page_no: PageNo) {
        self.page_no.store(page_no, Ordering::Release);
    }

    pub fn pins(&self) -> u32 {
        self.pin.load(Ordering::Acquire)
    }

    /// Drops one pin, first granting the frame a grace sweep by setting the
    /// clock bit if it is clear.
    pub fn unpin(&self) {
        if self.pin.load(Ordering::Acquire) & CLOCK_BIT == 0 {
            self.pin.fetch_or(CLOCK_BIT, Ordering::AcqRel);
        }
        self.pin.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub(crate) fn next(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next(&self, next: usize) {
        self.next.store(next, Ordering::Relaxed);
    }

    pub(crate) fn prev(&self) -> usize {
        self.prev.load(Ordering::Relaxed)
    }

    pub(crate) fn set_prev(&self, prev: usize) {
        self.prev.store(prev, Ordering::Relaxed);
    }
}

impl Default for LatchSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn words(lock: &PhaseFairRwLock) -> (u32, u32, u32, u32) {
        (
            lock.rin.load(Ordering::SeqCst),
            lock.rout.load(Ordering::SeqCst),
            lock.ticket.load(Ordering::SeqCst),
            lock.serving.load(Ordering::SeqCst),
        )
    }

    #[test]
    fn write_lock_and_release_word_values() {
        let lock = PhaseFairRwLock::new();

        lock.write_lock();
        assert_eq!(words(&lock), (2, 0, 1, 0));

        lock.write_release();
        assert_eq!(words(&lock), (0, 0, 1, 1));
    }

    #[test]
    fn read_lock_and_release_word_values() {
        let lock = PhaseFairRwLock::new();

        lock.read_lock();
        assert_eq!(words(&lock), (4, 0, 0, 0));

        lock.read_release();
        assert_eq!(words(&lock), (4, 4, 0, 0));
    }

    #[test]
    fn writer_waits_for_reader_to_drain() {
        let lock = Arc::new(PhaseFairRwLock::new());

        lock.read_lock();

        let bg = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                lock.read_release();
            })
        };

        lock.write_lock();
        assert_eq!(words(&lock), (6, 4, 1, 0));

        lock.write_release();
        bg.join().unwrap();
    }

    #[test]
    fn reader_waits_for_writer_to_release() {
        let lock = Arc::new(PhaseFairRwLock::new());

        lock.write_lock();

        let bg = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                lock.write_release();
            })
        };

        lock.read_lock();
        assert_eq!(words(&lock), (4, 0, 1, 1));

        lock.read_release();
        bg.join().unwrap();
    }

    #[test]
    fn readers_share_the_lock() {
        let lock = PhaseFairRwLock::new();

        lock.read_lock();
        lock.read_lock();
        assert_eq!(words(&lock), (8, 0, 0, 0));

        lock.read_release();
        lock.read_release();
    }

    #[test]
    fn writers_queue_on_tickets() {
        let lock = Arc::new(PhaseFairRwLock::new());

        lock.write_lock();

        let bg = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                lock.write_release();
            })
        };

        lock.write_lock();
        assert_eq!(words(&lock), (3, 0, 2, 1));

        lock.write_release();
        bg.join().unwrap();
    }

    #[test]
    fn exclusion_under_contention() {
        let lock = Arc::new(PhaseFairRwLock::new());
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        lock.write_lock();
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                        lock.write_release();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4000);
    }

    #[test]
    fn spin_latch_try_write_fails_under_share() {
        let latch = SpinLatch::new();

        latch.read_lock();
        assert!(!latch.try_write_lock());
        latch.release_read();

        assert!(latch.try_write_lock());
        assert!(!latch.try_write_lock());
        latch.release_write();
        assert!(latch.try_write_lock());
        latch.release_write();
    }

    #[test]
    fn unpin_sets_clock_bit_then_drops_pin() {
        let latch = LatchSet::new();
        latch.pin.store(1, Ordering::SeqCst);

        latch.unpin();
        assert_eq!(latch.pins(), CLOCK_BIT);

        latch.pin.fetch_and(!CLOCK_BIT, Ordering::SeqCst);
        assert_eq!(latch.pins(), 0);
    }
}
