//! # B-link Tree Operations
//!
//! Point lookup, insert with update-in-place, delete with page coalescing
//! and root collapse, and forward scans over a private cursor page.
//!
//! ## Page organization
//!
//! Key offsets and slots grow from the low end of a page while cell text
//! grows from the high end; when the two meet, the page splits 50/50. The
//! root is always page 1 and the first leaf page 2. Deleted keys are
//! marked dead until cleanup; the fence (highest) key of a page is always
//! present. Pages on every level are linked through right-sibling
//! pointers, which both serves enumeration and lets concurrent readers
//! cross a page that is being split or consolidated.
//!
//! ## Locking
//!
//! The descent locks one page at a time (see `BufMgr::load_page`). Cross
//! level maintenance — posting fence keys after a split, removing them
//! when a page empties — converts the page's Write lock into a Parent
//! lock and recurses into `insert_key`/`delete_key` one level up, which
//! establishes the only lock order in which two siblings are ever held.
//!
//! ## Insert
//!
//! ```text
//! 1. load the leaf (or requested level) write-locked
//! 2. same key found        -> revive if dead, overwrite value in place
//! 3. room on the page      -> insert_slot, reusing a librarian if adjacent
//! 4. page cleanable        -> compact in place, then insert_slot
//! 5. otherwise             -> split, post fences one level up, retry
//! ```
//!
//! ## Delete
//!
//! Keys are dead-marked and their bytes counted as garbage; trailing dead
//! slots under the fence are dropped eagerly. Deleting an inner fence
//! promotes the new highest key upward (`fix_fence`). A page reaching
//! zero live keys pulls its right sibling's contents over itself and
//! frees the sibling (`delete_page`), and a root reduced to one child
//! swallows that child (`collapse_root`), shrinking the tree's height.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use crate::error::{BltError, Result};
use crate::latch::LockMode;
use crate::storage::{
    get_id, put_id, BufMgr, Page, PageNo, SlotType, BT_ID, MAX_KEY, PAGE_HEADER_SIZE, ROOT_PAGE,
    SLOT_SIZE,
};

/// Inline capacity for a key plus a duplicate-key uniqueifier.
type KeyBuf = SmallVec<[u8; MAX_KEY + 1]>;

/// A thread's handle onto the shared index.
pub struct BLTree {
    mgr: Arc<BufMgr>,
    cursor: Page,
    cursor_page: PageNo,
    found: bool,
}

impl BLTree {
    pub fn new(mgr: Arc<BufMgr>) -> Self {
        let cursor = Page::new(mgr.page_data_size());
        Self {
            mgr,
            cursor,
            cursor_page: 0,
            found: false,
        }
    }

    /// Whether the last `insert_key` or `delete_key` found an existing
    /// live key. Deleting an absent key is a silent no-op; this is how
    /// callers observe it.
    pub fn found(&self) -> bool {
        self.found
    }

    /// The cursor page populated by `start_key`/`next_key`.
    pub fn cursor(&self) -> &Page {
        &self.cursor
    }

    pub fn cursor_page_no(&self) -> PageNo {
        self.cursor_page
    }

    fn new_dup(&self) -> PageNo {
        self.mgr.page_zero().next_dup()
    }

    /// A fence key was deleted from an inner page: push the new, smaller
    /// fence upward, then remove the old one. Call with the page write
    /// locked; returns with it unpinned.
    fn fix_fence(&mut self, entry: usize, lvl: u8) -> Result<()> {
        let mgr = Arc::clone(&self.mgr);
        let latch = mgr.latch(entry);

        let (right_key, left_key) = {
            let page = mgr.page_mut(entry);
            let right_key: Vec<u8> = page.key(page.cnt()).to_vec();
            page.clear_slot(page.cnt());
            page.set_cnt(page.cnt() - 1);
            let left_key: Vec<u8> = page.key(page.cnt()).to_vec();
            (right_key, left_key)
        };
        latch.set_dirty(true);

        latch.lock(LockMode::Parent);
        latch.unlock(LockMode::Write);

        let mut value = [0u8; BT_ID];
        put_id(&mut value, latch.page_no());

        self.insert_key(&left_key, lvl + 1, value, true)?;
        self.delete_key(&right_key, lvl + 1)?;

        latch.unlock(LockMode::Parent);
        latch.unpin();
        Ok(())
    }

    /// The root holds a single live child: promote that child's contents
    /// into the root, freeing the child, until the root is branchy again
    /// or has become a leaf parent. Call with the root write locked;
    /// returns with it unpinned.
    fn collapse_root(&mut self, root_entry: usize) -> Result<()> {
        let mgr = Arc::clone(&self.mgr);

        loop {
            let page_no = {
                let root = mgr.page(root_entry);
                let mut idx = 1;
                while idx <= root.cnt() && root.dead(idx) {
                    idx += 1;
                }
                get_id(root.value(idx))
            };

            let child_entry = mgr.pin_latch(page_no, true)?;
            let child_latch = mgr.latch(child_entry);
            child_latch.lock(LockMode::Delete);
            child_latch.lock(LockMode::Write);

            mgr.page_mut(root_entry).copy_from(mgr.page(child_entry));
            mgr.latch(root_entry).set_dirty(true);
            mgr.free_page(child_entry);

            let root = mgr.page(root_entry);
            if !(root.lvl() > 1 && root.act() == 1) {
                break;
            }
        }

        mgr.latch(root_entry).unlock(LockMode::Write);
        mgr.latch(root_entry).unpin();
        Ok(())
    }

    /// The page has no live keys left: pull the right sibling's contents
    /// over it, post the sibling's fence at our page number one level up,
    /// drop our old fence there, and free the sibling. The `kill` mark
    /// plus the repointed right link keep racing readers on course while
    /// the parent updates are in flight. Call with the page write locked;
    /// returns with it unpinned.
    fn delete_page(&mut self, entry: usize) -> Result<()> {
        let mgr = Arc::clone(&self.mgr);
        let latch = mgr.latch(entry);

        // fence to remove from the parent once the merge is visible
        let lower_fence: Vec<u8> = {
            let page = mgr.page(entry);
            page.key(page.cnt()).to_vec()
        };

        let right_no = mgr.page(entry).right_id();
        if right_no == 0 {
            return Err(BltError::Struct("empty page has no right sibling"));
        }
        let right_entry = mgr.pin_latch(right_no, true)?;
        let right_latch = mgr.latch(right_entry);
        right_latch.lock(LockMode::Write);

        let higher_fence: Vec<u8> = {
            let right = mgr.page(right_entry);
            right.key(right.cnt()).to_vec()
        };

        if mgr.page(right_entry).is_kill() {
            return Err(BltError::Struct("right sibling already being deleted"));
        }

        // pull the sibling's contents into our empty frame
        mgr.page_mut(entry).copy_from(mgr.page(right_entry));
        latch.set_dirty(true);

        // mark the sibling deleted and point it back at us until the
        // parent no longer routes anyone there
        {
            let right = mgr.page_mut(right_entry);
            right.set_right_id(latch.page_no());
            right.set_kill(true);
        }
        right_latch.set_dirty(true);

        right_latch.lock(LockMode::Parent);
        right_latch.unlock(LockMode::Write);
        latch.lock(LockMode::Parent);
        latch.unlock(LockMode::Write);

        // route the higher fence to our page, then drop the lower one
        let mut value = [0u8; BT_ID];
        put_id(&mut value, latch.page_no());
        let lvl = mgr.page(entry).lvl();
        self.insert_key(&higher_fence, lvl + 1, value, true)?;
        self.delete_key(&lower_fence, lvl + 1)?;

        right_latch.unlock(LockMode::Parent);
        right_latch.lock(LockMode::Delete);
        right_latch.lock(LockMode::Write);
        mgr.free_page(right_entry);

        latch.unlock(LockMode::Parent);
        latch.unpin();
        self.found = true;
        Ok(())
    }

    /// Finds and dead-marks a key at the given level. If the page becomes
    /// empty it is removed from the tree; absence of the key is a silent
    /// no-op reported through [`found`](Self::found).
    pub fn delete_key(&mut self, key: &[u8], lvl: u8) -> Result<()> {
        let mgr = Arc::clone(&self.mgr);
        let (entry, mut slot) = mgr.load_page(key, lvl, LockMode::Write)?;

        let (fence, act) = {
            let page = mgr.page_mut(entry);

            // a librarian at the found slot fronts for the real key
            if page.typ(slot) == SlotType::Librarian {
                slot += 1;
            }
            let fence = slot == page.cnt();

            self.found = page.key(slot) == key;
            if self.found {
                self.found = !page.dead(slot);
                if self.found {
                    let reclaimed = (2 + page.key(slot).len() + page.value(slot).len()) as u32;
                    page.set_dead(slot, true);
                    page.set_garbage(page.garbage() + reclaimed);
                    page.set_act(page.act() - 1);

                    // drop trailing dead slots beneath the fence
                    let mut idx = page.cnt() - 1;
                    while idx > 0 {
                        if !page.dead(idx) {
                            break;
                        }
                        page.copy_slot(idx, idx + 1);
                        page.clear_slot(page.cnt());
                        page.set_cnt(page.cnt() - 1);
                        idx = page.cnt() - 1;
                    }
                }
            }
            (fence, page.act())
        };

        let latch = mgr.latch(entry);

        // an inner fence went away: promote the new one upward
        if self.found && lvl > 0 && act > 0 && fence {
            return self.fix_fence(entry, lvl);
        }

        if lvl > 1 && latch.page_no() == ROOT_PAGE && act == 1 {
            return self.collapse_root(entry);
        }

        if act == 0 {
            return self.delete_page(entry);
        }

        latch.set_dirty(true);
        latch.unlock(LockMode::Write);
        latch.unpin();
        Ok(())
    }

    /// Advances the search position for `find_key`, crossing to the right
    /// sibling under Access/Read chaining when the page is exhausted.
    /// Returns 0 at the end of the level.
    fn find_next(&mut self, entry: &mut usize, slot: u32) -> Result<u32> {
        let mgr = Arc::clone(&self.mgr);

        let page_no = {
            let page = mgr.page(*entry);
            if slot < page.cnt() {
                return Ok(slot + 1);
            }
            page.right_id()
        };
        if page_no == 0 {
            return Ok(0);
        }

        let prev = *entry;
        let next = mgr.pin_latch(page_no, true)?;
        let next_latch = mgr.latch(next);

        next_latch.lock(LockMode::Access);
        mgr.latch(prev).unlock(LockMode::Read);
        mgr.latch(prev).unpin();
        next_latch.lock(LockMode::Read);
        next_latch.unlock(LockMode::Access);

        *entry = next;
        Ok(1)
    }

    /// Looks up a unique key (or the first of its duplicates) at the leaf
    /// level. Returns the stored key and up to `val_max` value bytes, or
    /// `None` when the key is absent.
    pub fn find_key(&mut self, key: &[u8], val_max: usize) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mgr = Arc::clone(&self.mgr);
        let (mut entry, mut slot) = mgr.load_page(key, 0, LockMode::Read)?;

        let mut result = None;
        while slot > 0 {
            let advance = {
                let page = mgr.page(entry);

                if page.typ(slot) == SlotType::Librarian {
                    slot += 1;
                }
                let ptr = page.key(slot);
                let mut key_len = ptr.len();
                if page.typ(slot) == SlotType::Duplicate {
                    key_len -= BT_ID;
                }

                // the rightmost fence is the stopper: the key is not there
                if slot == page.cnt() && page.right_id() == 0 {
                    break;
                }

                if page.dead(slot) {
                    true
                } else {
                    if key_len == key.len() && &ptr[..key_len] == key {
                        let value = page.value(slot);
                        let n = val_max.min(value.len());
                        result = Some((ptr.to_vec(), value[..n].to_vec()));
                    }
                    break;
                }
            };

            if advance {
                match self.find_next(&mut entry, slot) {
                    Ok(0) => break,
                    Ok(next) => slot = next,
                    Err(err) => {
                        mgr.latch(entry).unlock(LockMode::Read);
                        mgr.latch(entry).unpin();
                        return Err(err);
                    }
                }
            }
        }

        mgr.latch(entry).unlock(LockMode::Read);
        mgr.latch(entry).unpin();
        Ok(result)
    }

    /// Checks whether the page can absorb a new `(key, value)` pair with
    /// two spare slots, compacting away dead cells when the garbage makes
    /// it worthwhile.
    ///
    /// Returns the (possibly renumbered) insertion slot, or 0 when the
    /// page must split.
    fn clean_page(&mut self, entry: usize, key_len: u8, slot: u32, val_len: u8) -> u32 {
        let mgr = Arc::clone(&self.mgr);
        let page_data_size = mgr.page_data_size();
        let latch = mgr.latch(entry);
        let page = mgr.page_mut(entry);

        let max = page.cnt();
        let fits = |min: u32, slots: u32| {
            min >= (slots + 2) * SLOT_SIZE as u32
                + PAGE_HEADER_SIZE as u32
                + u32::from(key_len)
                + 1
                + u32::from(val_len)
                + 1
        };

        if fits(page.min(), max) {
            return slot;
        }

        // not enough garbage to bother with: force a split
        if page.garbage() < page_data_size / 5 {
            return 0;
        }

        debug!(
            page_no = latch.page_no(),
            min = page.min(),
            garbage = page.garbage(),
            "compacting page"
        );

        let mut frame = Page::new(page_data_size);
        frame.copy_from(page);

        page.reset_data();
        latch.set_dirty(true);
        page.set_garbage(0);
        page.set_act(0);

        // rewrite live cells from the top, a librarian between each pair,
        // tracking where the caller's slot lands
        let mut nxt = page_data_size;
        let mut new_slot = max;
        let mut idx = 0u32;
        let mut cnt = 0u32;
        while cnt < max {
            cnt += 1;
            if cnt == slot {
                new_slot = if idx == 0 { 1 } else { idx + 2 };
            }
            if cnt < max && frame.dead(cnt) {
                continue;
            }

            nxt = page.push_cell(nxt, frame.value(cnt));
            nxt = page.push_cell(nxt, frame.key(cnt));

            if idx > 0 {
                idx += 1;
                page.set_key_offset(idx, nxt);
                page.set_typ(idx, SlotType::Librarian);
                page.set_dead(idx, true);
            }

            idx += 1;
            page.set_key_offset(idx, nxt);
            page.set_typ(idx, frame.typ(cnt));
            page.set_dead(idx, frame.dead(cnt));
            if !page.dead(idx) {
                page.set_act(page.act() + 1);
            }
        }

        page.set_min(nxt);
        page.set_cnt(idx);

        if fits(page.min(), idx) {
            new_slot
        } else {
            0
        }
    }

    /// Splits the root, raising the tree height: the old root's contents
    /// move to a fresh left child, and the root is rewritten with two
    /// keys, the left fence and the `{0xff,0xff}` stopper over the new
    /// right page.
    fn split_root(&mut self, root_entry: usize, right_entry: usize) -> Result<()> {
        let mgr = Arc::clone(&self.mgr);
        let page_data_size = mgr.page_data_size();

        let left_key: Vec<u8> = {
            let root = mgr.page(root_entry);
            root.key(root.cnt()).to_vec()
        };

        let left_entry = mgr.new_page(mgr.page(root_entry))?;
        let left_page_no = mgr.latch(left_entry).page_no();
        mgr.unpin_latch(left_entry);

        {
            let root = mgr.page_mut(root_entry);
            root.reset_data();

            let mut value = [0u8; BT_ID];
            let mut nxt = page_data_size;

            // stopper key over the new right half
            put_id(&mut value, mgr.latch(right_entry).page_no());
            nxt = root.push_cell(nxt, &value);
            nxt = root.push_cell(nxt, &[0xff, 0xff]);
            root.set_key_offset(2, nxt);

            // left fence over the old contents as the first key
            put_id(&mut value, left_page_no);
            nxt = root.push_cell(nxt, &value);
            nxt = root.push_cell(nxt, &left_key);
            root.set_key_offset(1, nxt);

            root.set_right_id(0);
            root.set_min(nxt);
            root.set_cnt(2);
            root.set_act(2);
            root.set_lvl(root.lvl() + 1);
        }

        mgr.latch(root_entry).unlock(LockMode::Write);
        mgr.latch(root_entry).unpin();
        mgr.unpin_latch(right_entry);
        Ok(())
    }

    /// Splits a full, write-locked page, leaving it locked. The upper
    /// half of the live slots moves to a new right sibling that inherits
    /// the old right link; the lower half is rewritten in place. Returns
    /// the new page's frame, pinned but unlocked.
    fn split_page(&mut self, entry: usize) -> Result<usize> {
        let mgr = Arc::clone(&self.mgr);
        let page_data_size = mgr.page_data_size();
        let latch = mgr.latch(entry);

        let mut frame = Page::new(page_data_size);
        let max = mgr.page(entry).cnt();

        debug!(page_no = latch.page_no(), cnt = max, "splitting page");

        {
            let page = mgr.page(entry);
            let mut nxt = page_data_size;
            let mut cnt = max / 2;
            let mut idx = 0u32;
            while cnt < max {
                cnt += 1;
                // the leaf fence travels even when dead
                if (cnt < max || page.lvl() > 0) && page.dead(cnt) {
                    continue;
                }

                nxt = frame.push_cell(nxt, page.value(cnt));
                nxt = frame.push_cell(nxt, page.key(cnt));

                if idx > 0 {
                    idx += 1;
                    frame.set_key_offset(idx, nxt);
                    frame.set_typ(idx, SlotType::Librarian);
                    frame.set_dead(idx, true);
                }

                idx += 1;
                frame.set_key_offset(idx, nxt);
                frame.set_typ(idx, page.typ(cnt));
                frame.set_dead(idx, page.dead(cnt));
                if !frame.dead(idx) {
                    frame.set_act(frame.act() + 1);
                }
            }

            frame.set_bits(mgr.page_bits());
            frame.set_min(nxt);
            frame.set_cnt(idx);
            frame.set_lvl(page.lvl());

            // link the right node; a splitting root keeps right = 0
            if latch.page_no() > ROOT_PAGE {
                frame.set_right_id(page.right_id());
            }
        }

        let right_entry = mgr.new_page(&frame)?;

        // rebuild the lower half in place from a copy
        frame.copy_from(mgr.page(entry));
        {
            let page = mgr.page_mut(entry);
            page.reset_data();
            latch.set_dirty(true);

            let mut nxt = page_data_size;
            page.set_garbage(0);
            page.set_act(0);

            let mut max = max / 2;
            if frame.typ(max) == SlotType::Librarian {
                max -= 1;
            }

            let mut cnt = 0u32;
            let mut idx = 0u32;
            while cnt < max {
                cnt += 1;
                if frame.dead(cnt) {
                    continue;
                }

                nxt = page.push_cell(nxt, frame.value(cnt));
                nxt = page.push_cell(nxt, frame.key(cnt));

                if idx > 0 {
                    idx += 1;
                    page.set_key_offset(idx, nxt);
                    page.set_typ(idx, SlotType::Librarian);
                    page.set_dead(idx, true);
                }

                idx += 1;
                page.set_key_offset(idx, nxt);
                page.set_typ(idx, frame.typ(cnt));
                page.set_act(page.act() + 1);
            }

            page.set_right_id(mgr.latch(right_entry).page_no());
            page.set_min(nxt);
            page.set_cnt(idx);
        }

        Ok(right_entry)
    }

    /// Posts the fence keys for a freshly split page. Call with the left
    /// page write locked; both pages are unpinned on return.
    fn split_keys(&mut self, entry: usize, right_entry: usize) -> Result<()> {
        let mgr = Arc::clone(&self.mgr);
        let lvl = mgr.page(entry).lvl();

        if mgr.latch(entry).page_no() == ROOT_PAGE {
            return self.split_root(entry, right_entry);
        }

        let left_key: Vec<u8> = {
            let page = mgr.page(entry);
            page.key(page.cnt()).to_vec()
        };
        let right_key: Vec<u8> = {
            let page = mgr.page(right_entry);
            page.key(page.cnt()).to_vec()
        };

        mgr.latch(right_entry).lock(LockMode::Parent);
        mgr.latch(entry).lock(LockMode::Parent);
        mgr.latch(entry).unlock(LockMode::Write);

        let mut value = [0u8; BT_ID];

        // fence for the reformulated left block of smaller keys
        put_id(&mut value, mgr.latch(entry).page_no());
        self.insert_key(&left_key, lvl + 1, value, true)?;

        // fence for the right block of larger keys
        put_id(&mut value, mgr.latch(right_entry).page_no());
        self.insert_key(&right_key, lvl + 1, value, true)?;

        mgr.latch(entry).unlock(LockMode::Parent);
        mgr.latch(entry).unpin();
        mgr.latch(right_entry).unlock(LockMode::Parent);
        mgr.latch(right_entry).unpin();
        Ok(())
    }

    /// Installs a new key and value at `slot` on a page already known to
    /// have room. Reuses an adjacent librarian slot when there is one;
    /// otherwise shifts the slot array up by one or two, planting a fresh
    /// librarian beside the new key. Releases the page.
    fn insert_slot(
        &mut self,
        entry: usize,
        slot: u32,
        key: &[u8],
        value: &[u8; BT_ID],
        typ: SlotType,
    ) -> Result<()> {
        let mgr = Arc::clone(&self.mgr);
        let latch = mgr.latch(entry);
        let page = mgr.page_mut(entry);

        let mut slot = slot;
        if slot > 1 && page.typ(slot - 1) == SlotType::Librarian {
            slot -= 1;
        }

        let mut min = page.min();
        min = page.push_cell(min, value);
        min = page.push_cell(min, key);
        page.set_min(min);

        // first dead slot at or after the insertion point gets reused
        let mut idx = slot;
        while idx < page.cnt() {
            if page.dead(idx) {
                break;
            }
            idx += 1;
        }

        let librarian: u32 = if idx == page.cnt() {
            idx += 2;
            page.set_cnt(page.cnt() + 2);
            2
        } else {
            1
        };
        latch.set_dirty(true);
        page.set_act(page.act() + 1);

        // shift slots up to make room
        while idx > slot + librarian - 1 {
            page.set_dead(idx, page.dead(idx - librarian));
            page.set_typ(idx, page.typ(idx - librarian));
            page.set_key_offset(idx, page.key_offset(idx - librarian));
            idx -= 1;
        }

        if librarian > 1 {
            page.set_key_offset(slot, page.min());
            page.set_typ(slot, SlotType::Librarian);
            page.set_dead(slot, true);
            slot += 1;
        }

        page.set_key_offset(slot, page.min());
        page.set_typ(slot, typ);
        page.set_dead(slot, false);

        latch.unlock(LockMode::Write);
        latch.unpin();
        Ok(())
    }

    /// Inserts a key at the given level, or updates the value in place on
    /// a unique match. Non-unique inserts extend the key with a 6-byte
    /// uniqueifier so equal user keys sort adjacently yet stay distinct.
    pub fn insert_key(
        &mut self,
        key: &[u8],
        lvl: u8,
        value: [u8; BT_ID],
        unique: bool,
    ) -> Result<()> {
        if key.len() > MAX_KEY {
            return Err(BltError::Overflow);
        }

        let mgr = Arc::clone(&self.mgr);

        let mut ins: KeyBuf = SmallVec::from_slice(key);
        let typ = if unique {
            SlotType::Unique
        } else {
            let mut sequence = [0u8; BT_ID];
            put_id(&mut sequence, self.new_dup());
            ins.extend_from_slice(&sequence);
            if ins.len() > MAX_KEY {
                return Err(BltError::Overflow);
            }
            SlotType::Duplicate
        };

        loop {
            let (entry, mut slot) = mgr.load_page(key, lvl, LockMode::Write)?;
            let latch = mgr.latch(entry);

            let is_new = {
                let page = mgr.page(entry);

                // a librarian fronting an equal key hides the real slot
                if page.typ(slot) == SlotType::Librarian && page.key(slot) == key {
                    slot += 1;
                }

                let ptr = page.key(slot);
                let mut key_len = ptr.len();
                if page.typ(slot) == SlotType::Duplicate {
                    key_len -= BT_ID;
                }

                !unique || key_len != ins.len() || ptr != &ins[..]
            };

            if is_new {
                let slot = self.clean_page(entry, ins.len() as u8, slot, BT_ID as u8);
                if slot == 0 {
                    let right_entry = self.split_page(entry)?;
                    self.split_keys(entry, right_entry)?;
                    continue;
                }
                self.found = false;
                return self.insert_slot(entry, slot, &ins, &value, typ);
            }

            // key already present: revive it if dead, update the value
            let page = mgr.page_mut(entry);
            if page.dead(slot) {
                page.set_act(page.act() + 1);
            }
            page.set_dead(slot, false);
            page.set_value(slot, &value);
            latch.set_dirty(true);

            self.found = true;
            latch.unlock(LockMode::Write);
            latch.unpin();
            return Ok(());
        }
    }

    /// Positions the cursor at the leaf covering `key` and returns the
    /// starting slot. The leaf is copied out under its Read lock, so the
    /// scan itself never holds page locks.
    pub fn start_key(&mut self, key: &[u8]) -> Result<u32> {
        let mgr = Arc::clone(&self.mgr);
        let (entry, slot) = mgr.load_page(key, 0, LockMode::Read)?;

        self.cursor.copy_from(mgr.page(entry));
        self.cursor_page = mgr.latch(entry).page_no();

        mgr.latch(entry).unlock(LockMode::Read);
        mgr.latch(entry).unpin();
        Ok(slot)
    }

    /// Returns the next live slot on the cursor page, crossing to the
    /// right sibling when the page is exhausted. Returns 0 past the last
    /// key; dead slots and the stopper are skipped.
    pub fn next_key(&mut self, slot: u32) -> Result<u32> {
        let mgr = Arc::clone(&self.mgr);
        let mut slot = slot;

        loop {
            let right = self.cursor.right_id();

            while slot < self.cursor.cnt() {
                slot += 1;
                if self.cursor.dead(slot) {
                    continue;
                }
                if right > 0 || slot < self.cursor.cnt() {
                    return Ok(slot);
                }
                // rightmost fence is the stopper
                break;
            }

            if right == 0 {
                break;
            }

            self.cursor_page = right;

            let entry = mgr.pin_latch(right, true)?;
            let latch = mgr.latch(entry);
            latch.lock(LockMode::Read);
            self.cursor.copy_from(mgr.page(entry));
            latch.unlock(LockMode::Read);
            latch.unpin();
            slot = 0;
        }

        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LEAF_PAGE;
    use rand::seq::SliceRandom;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_tree(bits: u8, node_max: usize) -> (TempDir, Arc<BufMgr>, BLTree) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(BufMgr::open(dir.path().join("tree.db"), bits, node_max).unwrap());
        let tree = BLTree::new(Arc::clone(&mgr));
        (dir, mgr, tree)
    }

    fn be_key(i: u64) -> [u8; 8] {
        i.to_be_bytes()
    }

    #[test]
    fn find_on_empty_tree_returns_none() {
        let (_dir, _mgr, mut tree) = open_tree(15, 20);

        let found = tree.find_key(&[1, 1, 1, 1], BT_ID).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn insert_then_find_returns_key_and_value() {
        let (_dir, _mgr, mut tree) = open_tree(15, 20);

        tree.insert_key(&[1, 1, 1, 1], 0, [0, 0, 0, 0, 0, 1], true)
            .unwrap();

        let (found_key, value) = tree.find_key(&[1, 1, 1, 1], BT_ID).unwrap().unwrap();
        assert_eq!(found_key, &[1, 1, 1, 1]);
        assert_eq!(value, &[0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn reinsert_updates_value_in_place() {
        let (_dir, mgr, mut tree) = open_tree(15, 20);

        tree.insert_key(&[5, 5], 0, [0, 0, 0, 0, 0, 1], true).unwrap();
        let act_before = {
            let entry = mgr.pin_latch(LEAF_PAGE, true).unwrap();
            let act = mgr.page(entry).act();
            mgr.unpin_latch(entry);
            act
        };

        tree.insert_key(&[5, 5], 0, [0, 0, 0, 0, 0, 2], true).unwrap();
        assert!(tree.found());

        let act_after = {
            let entry = mgr.pin_latch(LEAF_PAGE, true).unwrap();
            let act = mgr.page(entry).act();
            mgr.unpin_latch(entry);
            act
        };
        assert_eq!(act_before, act_after);

        let (_, value) = tree.find_key(&[5, 5], BT_ID).unwrap().unwrap();
        assert_eq!(value, &[0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn delete_then_find_returns_none() {
        let (_dir, _mgr, mut tree) = open_tree(15, 20);

        tree.insert_key(&[1, 1, 1, 1], 0, [0, 0, 0, 0, 0, 1], true)
            .unwrap();
        tree.delete_key(&[1, 1, 1, 1], 0).unwrap();
        assert!(tree.found());

        assert!(tree.find_key(&[1, 1, 1, 1], BT_ID).unwrap().is_none());
    }

    #[test]
    fn delete_of_absent_key_is_silent_noop() {
        let (_dir, _mgr, mut tree) = open_tree(15, 20);

        tree.insert_key(&[1, 1], 0, [0; BT_ID], true).unwrap();
        tree.delete_key(&[9, 9], 0).unwrap();
        assert!(!tree.found());

        assert!(tree.find_key(&[1, 1], BT_ID).unwrap().is_some());
    }

    #[test]
    fn collapse_root_promotes_single_child() {
        let (_dir, mgr, mut tree) = open_tree(15, 20);

        for key in [[1u8, 1, 1, 1], [1, 1, 1, 2]] {
            tree.insert_key(&key, 0, [0, 0, 0, 0, 0, 1], true).unwrap();
        }

        // root carries only the stopper; the sole child has both keys
        let root = mgr.pin_latch(ROOT_PAGE, true).unwrap();
        assert_eq!(mgr.page(root).act(), 1);
        let child = mgr.pin_latch(LEAF_PAGE, true).unwrap();
        assert_eq!(mgr.page(child).act(), 3);
        mgr.unpin_latch(child);

        mgr.latch(root).lock(LockMode::Write);
        tree.collapse_root(root).unwrap();

        let root = mgr.pin_latch(ROOT_PAGE, true).unwrap();
        assert_eq!(mgr.page(root).act(), 3);
        mgr.unpin_latch(root);

        let child = mgr.pin_latch(LEAF_PAGE, true).unwrap();
        assert!(mgr.page(child).is_free());
        mgr.unpin_latch(child);
    }

    #[test]
    fn split_propagates_fences_and_keeps_keys_findable() {
        // tiny pages force plenty of splits
        let (_dir, _mgr, mut tree) = open_tree(9, 32);

        let total = 500u64;
        for i in 0..total {
            tree.insert_key(&be_key(i), 0, [0; BT_ID], true).unwrap();
        }

        for i in 0..total {
            let (found_key, value) = tree.find_key(&be_key(i), BT_ID).unwrap().unwrap();
            assert_eq!(found_key, be_key(i), "key {i} lost after splits");
            assert_eq!(value.len(), BT_ID);
        }
    }

    #[test]
    fn reverse_order_inserts_stay_sorted() {
        let (_dir, _mgr, mut tree) = open_tree(9, 32);

        for i in (0..300u64).rev() {
            tree.insert_key(&be_key(i), 0, [0; BT_ID], true).unwrap();
        }

        for i in 0..300u64 {
            assert!(tree.find_key(&be_key(i), BT_ID).unwrap().is_some());
        }
    }

    #[test]
    fn shuffled_inserts_scan_in_sorted_order() {
        let (_dir, _mgr, mut tree) = open_tree(9, 32);

        let mut ids: Vec<u64> = (0..400).collect();
        ids.shuffle(&mut rand::thread_rng());
        for &i in &ids {
            tree.insert_key(&be_key(i), 0, [0; BT_ID], true).unwrap();
        }

        let mut seen = Vec::new();
        let mut slot = tree.start_key(&[]).unwrap();
        if tree.cursor().dead(slot) {
            slot = tree.next_key(slot).unwrap();
        }
        while slot > 0 {
            let key = tree.cursor().key(slot);
            if key != [0xff, 0xff] {
                seen.push(key.to_vec());
            }
            slot = tree.next_key(slot).unwrap();
        }

        assert_eq!(seen.len(), 400);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn duplicate_keys_get_uniqueifiers() {
        let (_dir, _mgr, mut tree) = open_tree(15, 20);

        let key = [7u8, 7, 7];
        tree.insert_key(&key, 0, [0, 0, 0, 0, 0, 1], false).unwrap();
        tree.insert_key(&key, 0, [0, 0, 0, 0, 0, 2], false).unwrap();

        // lookup matches on the user key with the uniqueifier stripped;
        // the descent searches with the bare key, so the most recent
        // duplicate sits first
        let (found_key, value) = tree.find_key(&key, BT_ID).unwrap().unwrap();
        assert_eq!(found_key.len(), key.len() + BT_ID);
        assert_eq!(&found_key[..key.len()], &key);
        assert_eq!(value, &[0, 0, 0, 0, 0, 2]);

        // both entries are live on the leaf
        let mut dups = 0;
        let mut slot = tree.start_key(&key).unwrap();
        while slot > 0 {
            let cursor = tree.cursor();
            if !cursor.dead(slot)
                && cursor.typ(slot) == SlotType::Duplicate
                && cursor.key(slot).starts_with(&key)
            {
                dups += 1;
            }
            slot = tree.next_key(slot).unwrap();
        }
        assert_eq!(dups, 2);
    }

    #[test]
    fn delete_every_other_key_across_splits() {
        let (_dir, _mgr, mut tree) = open_tree(9, 32);

        let total = 400u64;
        for i in 0..total {
            tree.insert_key(&be_key(i), 0, [0; BT_ID], true).unwrap();
            if i % 2 == 0 {
                tree.delete_key(&be_key(i), 0).unwrap();
            }
        }

        for i in 0..total {
            let found = tree.find_key(&be_key(i), BT_ID).unwrap();
            if i % 2 == 0 {
                assert!(found.is_none(), "even key {i} should be deleted");
            } else {
                let (_, value) = found.expect("odd key should exist");
                assert_eq!(value.len(), BT_ID);
            }
        }
    }

    #[test]
    fn oversize_key_is_rejected() {
        let (_dir, _mgr, mut tree) = open_tree(15, 20);

        let long = vec![1u8; MAX_KEY + 1];
        assert!(matches!(
            tree.insert_key(&long, 0, [0; BT_ID], true),
            Err(BltError::Overflow)
        ));
    }
}
