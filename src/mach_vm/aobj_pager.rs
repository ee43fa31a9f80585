//! Anonymous Object Paging Operations
//!
//! Based on Mach4 vm/vm_fault.c and the BSD anonymous pager's get/put.
//!
//! `get` brings a run of pages resident and hands them to the caller busy.
//! `put` deactivates or frees a range of resident pages.
//!
//! Per page, `get` runs this state machine under the object lock:
//!
//! ```text
//!   resident, not busy     -> take it (set BUSY)
//!   resident, busy         -> set WANTED, unlock, sleep, relock, retry
//!   absent, no slot        -> allocate zero-filled, take it
//!   absent, slot           -> allocate BUSY|FAKE, unlock, read, relock
//!   absent, poisoned slot  -> fail, nothing allocated
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, error, trace, warn};

use crate::counter;
use crate::mach_vm::pmap::VmProt;
use crate::mach_vm::swap_pager::SwapSlot;
use crate::mach_vm::vm_aobj::{AnonManager, AnonObject, AobjError, AobjId};
use crate::mach_vm::vm_page::{atop, ptoa, PageFlags, VmPage, PAGE_SIZE};

// ============================================================================
// Get
// ============================================================================

/// Calling convention for [`AnonManager::get`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMode {
    /// Caller holds locks and cannot sleep: take only what is resident and
    /// idle, or can be zero-filled on the spot
    NonBlocking,
    /// Run the full state machine, sleeping and doing I/O as needed
    Blocking,
}

/// Pages returned by [`AnonManager::get`]
#[derive(Debug, Default)]
pub struct PageRun {
    /// One entry per requested page; `None` where a non-blocking get could
    /// not satisfy the page
    pub pages: Vec<Option<Arc<VmPage>>>,
    /// Number of `Some` entries
    pub satisfied: usize,
}

impl PageRun {
    /// Every requested page was supplied
    pub fn is_complete(&self) -> bool {
        self.satisfied == self.pages.len()
    }

    /// The supplied pages, in offset order
    pub fn into_pages(self) -> Vec<Arc<VmPage>> {
        self.pages.into_iter().flatten().collect()
    }
}

impl AnonManager {
    /// Fetch `count` pages starting at page `index`.
    ///
    /// Supplied pages are busy; the caller releases them with
    /// [`AnonManager::unbusy_pages`]. In blocking mode either every page is
    /// supplied or the first error is returned, with every page this call
    /// took already given back.
    pub fn get(
        &self,
        id: AobjId,
        index: u64,
        count: usize,
        access: VmProt,
        mode: GetMode,
    ) -> Result<PageRun, AobjError> {
        let obj = self.lookup(id)?;
        let end = index
            .checked_add(count as u64)
            .ok_or(AobjError::OutOfRange)?;
        if end > obj.page_count() {
            return Err(AobjError::OutOfRange);
        }

        match mode {
            GetMode::NonBlocking => self.get_nonblocking(&obj, index, end),
            GetMode::Blocking => self.get_blocking(&obj, index, end, access),
        }
    }

    fn get_nonblocking(&self, obj: &Arc<AnonObject>, start: u64, end: u64) -> Result<PageRun, AobjError> {
        let mut state = obj.lock_alive()?;
        let mut run = PageRun::default();

        for idx in start..end {
            if let Some(page) = state.pages.get(&idx) {
                if page.is_busy() {
                    run.pages.push(None);
                } else {
                    page.set_busy();
                    run.pages.push(Some(Arc::clone(page)));
                    run.satisfied += 1;
                }
                continue;
            }

            if !state.swslots.find(idx).is_none() {
                run.pages.push(None);
                continue;
            }

            match self.ctx.pages.alloc(obj.id, ptoa(idx), true) {
                Some(page) => {
                    page.set_flags(PageFlags::BUSY);
                    state.pages.insert(idx, Arc::clone(&page));
                    counter!(self.counters.zero_fills);
                    trace!("aobj: {:?} page {} zero-filled", obj.id, idx);
                    run.pages.push(Some(page));
                    run.satisfied += 1;
                }
                None => run.pages.push(None),
            }
        }

        Ok(run)
    }

    fn get_blocking(
        &self,
        obj: &Arc<AnonObject>,
        start: u64,
        end: u64,
        access: VmProt,
    ) -> Result<PageRun, AobjError> {
        let mut taken: Vec<(u64, Arc<VmPage>, bool)> = Vec::new();

        for idx in start..end {
            match self.fetch_page(obj, idx, access) {
                Ok((page, fresh)) => taken.push((idx, page, fresh)),
                Err(err) => {
                    self.release_taken(obj, taken);
                    return Err(err);
                }
            }
        }

        let satisfied = taken.len();
        Ok(PageRun {
            pages: taken.into_iter().map(|(_, page, _)| Some(page)).collect(),
            satisfied,
        })
    }

    /// Undo a partially completed blocking get
    fn release_taken(&self, obj: &AnonObject, taken: Vec<(u64, Arc<VmPage>, bool)>) {
        let mut state = obj.lock();
        for (idx, page, fresh) in taken {
            if fresh {
                if state.pages.get(&idx).map_or(false, |p| Arc::ptr_eq(p, &page)) {
                    state.pages.remove(&idx);
                }
                page.unbusy();
                self.free_page(page);
            } else {
                page.unbusy();
            }
        }
    }

    /// Make page `idx` resident and busy. The flag is `true` when the page
    /// was allocated by this call.
    pub(crate) fn fetch_page(
        &self,
        obj: &AnonObject,
        idx: u64,
        access: VmProt,
    ) -> Result<(Arc<VmPage>, bool), AobjError> {
        let mut state = obj.lock_alive()?;

        loop {
            if let Some(page) = state.pages.get(&idx).cloned() {
                if page.is_busy() {
                    counter!(self.counters.busy_waits);
                    let ticket = page.want();
                    drop(state);
                    page.wait(ticket);
                    state = obj.lock_alive()?;
                    continue;
                }
                page.set_busy();
                return Ok((page, false));
            }

            let slot = state.swslots.find(idx);
            if slot.is_bad() {
                return Err(AobjError::Io { slot });
            }

            let page = match self.ctx.pages.alloc(obj.id, ptoa(idx), slot.is_none()) {
                Some(page) => page,
                None => {
                    drop(state);
                    if !self.ctx.pages.wait_for_memory() {
                        debug!("aobj: {:?} page {}: out of memory", obj.id, idx);
                        return Err(AobjError::ResourceShortage);
                    }
                    state = obj.lock_alive()?;
                    continue;
                }
            };

            page.set_flags(PageFlags::BUSY | PageFlags::FAKE);
            state.pages.insert(idx, Arc::clone(&page));

            if slot.is_none() {
                page.clear_flags(PageFlags::FAKE);
                counter!(self.counters.zero_fills);
                trace!("aobj: {:?} page {} zero-filled", obj.id, idx);
                return Ok((page, true));
            }

            drop(state);
            trace!("aobj: {:?} page {} reading {}", obj.id, idx, slot);
            let result = self.ctx.swap.read(slot, &page);
            let mut state = obj.lock();

            return match result {
                Ok(()) => {
                    page.clear_flags(PageFlags::FAKE);
                    if !access.can_write() {
                        page.set_flags(PageFlags::CLEAN);
                        self.ctx.pmap.protect(&page, access.without_write());
                    }
                    counter!(self.counters.swap_pageins);
                    Ok((page, true))
                }
                Err(err) => {
                    error!("aobj: {:?} page {}: read of {} failed: {:?}", obj.id, idx, slot, err);
                    counter!(self.counters.swap_io_errors);

                    self.ctx.swap.mark_bad(slot, 1);
                    // A slot stored while the read was in flight is released
                    let current = state.swslots.find(idx);
                    if current.is_valid() && current != slot {
                        self.ctx.swap.free_slot(current, 1);
                    }
                    // Overwrites a live entry, so no cluster is allocated
                    let _ = state.swslots.set(idx, SwapSlot::BAD);

                    state.pages.remove(&idx);
                    page.unbusy();
                    self.free_page(page);
                    Err(AobjError::Io { slot })
                }
            };
        }
    }
}

// ============================================================================
// Put
// ============================================================================

/// Flags for [`AnonManager::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutFlags(u32);

impl PutFlags {
    /// Write dirty pages back (nothing to do for anonymous memory)
    pub const CLEANIT: Self = Self(0x0001);
    /// Move pages to the inactive queue
    pub const DEACTIVATE: Self = Self(0x0002);
    /// Free pages and their swap slots
    pub const FREE: Self = Self(0x0004);
    /// Ignore the range, operate on the whole object
    pub const ALLPAGES: Self = Self(0x0008);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn intersects(&self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }
}

impl core::ops::BitOr for PutFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl AnonManager {
    /// Deactivate or free the resident pages in byte range `[start, stop)`.
    /// `stop == 0` means the end of the object.
    ///
    /// Wired pages are skipped. `FREE` on an object with other owners only
    /// deactivates.
    pub fn put(&self, id: AobjId, start: u64, stop: u64, flags: PutFlags) -> Result<(), AobjError> {
        let obj = self.lookup(id)?;
        let page_count = obj.page_count();

        let (lo, hi) = if flags.contains(PutFlags::ALLPAGES) {
            (0, page_count)
        } else {
            let lo = atop(start);
            let mut hi = if stop == 0 {
                page_count
            } else {
                atop(stop) + u64::from(stop % PAGE_SIZE as u64 != 0)
            };
            if hi > page_count {
                warn!(
                    "aobj: {:?} put range {:#x}..{:#x} past end, clamped to {} pages",
                    id, start, stop, page_count
                );
                hi = page_count;
            }
            (lo, hi)
        };

        if lo >= hi || !flags.intersects(PutFlags::FREE | PutFlags::DEACTIVATE) {
            return Ok(());
        }

        let mut free = flags.contains(PutFlags::FREE);
        if free && !obj.is_kernel() && obj.ref_count() > 1 {
            debug!("aobj: {:?} shared, free of {}..{} deactivates", id, lo, hi);
            free = false;
        }

        let mut state = obj.lock_alive()?;
        let by_list = state.pages.len() as u64 <= (hi - lo).saturating_mul(self.config.page_tree_penalty);
        let mut cursor = lo;

        loop {
            let next = if by_list {
                state
                    .pages
                    .range(cursor..hi)
                    .next()
                    .map(|(&idx, page)| (idx, Arc::clone(page)))
            } else {
                let mut found = None;
                while cursor < hi {
                    if let Some(page) = state.pages.get(&cursor) {
                        found = Some((cursor, Arc::clone(page)));
                        break;
                    }
                    cursor += 1;
                }
                found
            };
            let (idx, page) = match next {
                Some(next) => next,
                None => break,
            };
            cursor = idx;

            if page.is_busy() {
                counter!(self.counters.busy_waits);
                let ticket = page.want();
                drop(state);
                page.wait(ticket);
                state = obj.lock_alive()?;
                continue;
            }

            cursor = idx + 1;
            if page.is_wired() {
                continue;
            }

            if free {
                trace!("aobj: {:?} put frees page {}", id, idx);
                self.ctx.pmap.unmap_all(&page);
                self.dropswap(&mut state, idx);
                state.pages.remove(&idx);
                self.free_page(page);
            } else {
                self.ctx.queues.deactivate(&page);
            }
        }

        if free {
            let released = state.swslots.drop_range(lo, hi, &*self.ctx.swap);
            counter!(self.counters.swap_only_released, released);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_vm::testing::TestEnv;
    use crate::mach_vm::vm_aobj::{AobjConfig, AobjFlags};
    use alloc::vec;
    use std::collections::BTreeSet;
    use std::thread;
    use std::time::Duration;

    fn pages(n: u64) -> u64 {
        n * PAGE_SIZE as u64
    }

    #[test]
    fn test_end_to_end() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(100), AobjFlags::empty()).unwrap();

        let run = mgr.get(id, 5, 1, VmProt::DEFAULT, GetMode::Blocking).unwrap();
        assert_eq!(run.satisfied, 1);
        let got = run.into_pages();
        let page = &got[0];
        assert!(page.is_busy());
        assert!(!page.is_fake());
        assert_eq!(page.offset(), ptoa(5));
        assert_eq!(page.get_object(), Some(id));
        assert_eq!(env.pages.zero_filled(), 1);
        mgr.unbusy_pages(id, &got).unwrap();

        mgr.set_swap_slot(id, 5, SwapSlot(42)).unwrap();
        mgr.detach(id).unwrap();

        assert_eq!(env.pages.outstanding(), 0);
        assert_eq!(env.swap.freed(), vec![SwapSlot(42)]);
        assert!(!mgr.contains(id));
        assert_eq!(mgr.drop_swap_range(id, 0, 0), Err(AobjError::InvalidHandle));
    }

    #[test]
    fn test_resident_page_is_reused() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(8), AobjFlags::empty()).unwrap();

        let first = mgr.get(id, 2, 1, VmProt::DEFAULT, GetMode::Blocking).unwrap().into_pages();
        mgr.unbusy_pages(id, &first).unwrap();
        let second = mgr.get(id, 2, 1, VmProt::DEFAULT, GetMode::Blocking).unwrap().into_pages();

        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert_eq!(env.pages.allocated(), 1);
    }

    #[test]
    fn test_read_only_fetch_from_swap() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(10), AobjFlags::empty()).unwrap();
        mgr.set_swap_slot(id, 3, SwapSlot(7)).unwrap();

        let page = mgr.get(id, 3, 1, VmProt::READ, GetMode::Blocking).unwrap().into_pages().remove(0);
        assert_eq!(env.swap.reads(), 1);
        assert!(page.is_clean());
        assert!(!page.is_fake());
        assert_eq!(env.pmap.protects(), vec![(page.phys_addr, VmProt::READ)]);
        assert_eq!(env.pages.zero_filled(), 0);

        // The backing copy stays until someone drops it
        assert_eq!(mgr.find_swap_slot(id, 3).unwrap(), SwapSlot(7));
        assert_eq!(mgr.counters().swap_pageins, 1);
    }

    #[test]
    fn test_write_fetch_leaves_page_dirty() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(10), AobjFlags::empty()).unwrap();
        mgr.set_swap_slot(id, 3, SwapSlot(7)).unwrap();

        let page = mgr.get(id, 3, 1, VmProt::DEFAULT, GetMode::Blocking).unwrap().into_pages().remove(0);
        assert!(!page.is_clean());
        assert!(env.pmap.protects().is_empty());
    }

    #[test]
    fn test_read_error_poisons_slot() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(10), AobjFlags::empty()).unwrap();
        mgr.set_swap_slot(id, 2, SwapSlot(9)).unwrap();
        env.swap.fail_reads_of(SwapSlot(9));

        let err = mgr.get(id, 2, 1, VmProt::DEFAULT, GetMode::Blocking).unwrap_err();
        assert_eq!(err, AobjError::Io { slot: SwapSlot(9) });
        assert_eq!(mgr.find_swap_slot(id, 2).unwrap(), SwapSlot::BAD);
        assert_eq!(env.swap.bad(), vec![SwapSlot(9)]);
        assert_eq!(env.pages.outstanding(), 0);
        assert_eq!(mgr.resident_count(id).unwrap(), 0);

        // A poisoned slot fails again without touching the device
        let err = mgr.get(id, 2, 1, VmProt::DEFAULT, GetMode::Blocking).unwrap_err();
        assert_eq!(err, AobjError::Io { slot: SwapSlot::BAD });
        assert_eq!(env.swap.reads(), 1);

        // and is never handed back to the swap layer
        mgr.detach(id).unwrap();
        assert!(env.swap.freed().is_empty());
        assert_eq!(mgr.counters().swap_io_errors, 1);
    }

    #[test]
    fn test_concurrent_get_reads_once() {
        let env = TestEnv::new();
        let mgr = Arc::new(env.manager());
        let id = mgr.create(pages(4), AobjFlags::empty()).unwrap();
        mgr.set_swap_slot(id, 0, SwapSlot(5)).unwrap();
        env.swap.set_read_delay_ms(50);

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                thread::spawn(move || {
                    let got = mgr.get(id, 0, 1, VmProt::DEFAULT, GetMode::Blocking).unwrap().into_pages();
                    let addr = got[0].phys_addr;
                    assert!(!got[0].is_fake());
                    thread::sleep(Duration::from_millis(5));
                    mgr.unbusy_pages(id, &got).unwrap();
                    addr
                })
            })
            .collect();
        let addrs: Vec<u64> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(addrs[0], addrs[1]);
        assert_eq!(env.swap.reads(), 1);
        assert_eq!(env.pages.allocated(), 1);
    }

    #[test]
    fn test_concurrent_get_of_failing_slot() {
        let env = TestEnv::new();
        let mgr = Arc::new(env.manager());
        let id = mgr.create(pages(4), AobjFlags::empty()).unwrap();
        mgr.set_swap_slot(id, 0, SwapSlot(5)).unwrap();
        env.swap.fail_reads_of(SwapSlot(5));
        env.swap.set_read_delay_ms(50);

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                thread::spawn(move || mgr.get(id, 0, 1, VmProt::DEFAULT, GetMode::Blocking).unwrap_err())
            })
            .collect();
        let mut errs: Vec<AobjError> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        errs.sort_by_key(|e| match e {
            AobjError::Io { slot } => slot.0,
            _ => i32::MAX,
        });

        // The loser sees the poisoned entry, never a half-read page
        assert_eq!(
            errs,
            vec![AobjError::Io { slot: SwapSlot::BAD }, AobjError::Io { slot: SwapSlot(5) }]
        );
        assert_eq!(env.swap.reads(), 1);
        assert_eq!(env.pages.outstanding(), 0);
        assert_eq!(mgr.resident_count(id).unwrap(), 0);
    }

    #[test]
    fn test_read_error_marks_the_failed_slot() {
        let env = TestEnv::new();
        let mgr = Arc::new(env.manager());
        let id = mgr.create(pages(4), AobjFlags::empty()).unwrap();
        mgr.set_swap_slot(id, 2, SwapSlot(9)).unwrap();
        env.swap.fail_reads_of(SwapSlot(9));
        env.swap.set_read_delay_ms(50);

        let reader = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || mgr.get(id, 2, 1, VmProt::DEFAULT, GetMode::Blocking).unwrap_err())
        };

        // Rewrite the entry while the read is in flight
        while env.swap.reads() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        mgr.set_swap_slot(id, 2, SwapSlot(10)).unwrap();

        assert_eq!(reader.join().unwrap(), AobjError::Io { slot: SwapSlot(9) });
        assert_eq!(env.swap.bad(), vec![SwapSlot(9)]);
        assert_eq!(env.swap.freed(), vec![SwapSlot(10)]);
        assert_eq!(mgr.find_swap_slot(id, 2).unwrap(), SwapSlot::BAD);
    }

    #[test]
    fn test_nonblocking_reports_unsatisfied() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(10), AobjFlags::empty()).unwrap();
        mgr.set_swap_slot(id, 2, SwapSlot(20)).unwrap();
        let held = mgr.get(id, 1, 1, VmProt::DEFAULT, GetMode::Blocking).unwrap();

        let run = mgr.get(id, 0, 4, VmProt::DEFAULT, GetMode::NonBlocking).unwrap();
        assert_eq!(run.satisfied, 2);
        assert!(!run.is_complete());
        assert!(run.pages[0].is_some());
        assert!(run.pages[1].is_none());
        assert!(run.pages[2].is_none());
        assert!(run.pages[3].is_some());
        assert_eq!(env.swap.reads(), 0);

        drop(held);
    }

    #[test]
    fn test_out_of_range() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(100), AobjFlags::empty()).unwrap();

        assert_eq!(
            mgr.get(id, 99, 2, VmProt::DEFAULT, GetMode::Blocking).unwrap_err(),
            AobjError::OutOfRange
        );
        assert_eq!(
            mgr.get(id, u64::MAX, 2, VmProt::DEFAULT, GetMode::Blocking).unwrap_err(),
            AobjError::OutOfRange
        );
    }

    #[test]
    fn test_failed_get_releases_partial_run() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(10), AobjFlags::empty()).unwrap();

        let first = mgr.get(id, 0, 1, VmProt::DEFAULT, GetMode::Blocking).unwrap().into_pages();
        mgr.unbusy_pages(id, &first).unwrap();

        env.pages.set_budget(Some(1));
        let err = mgr.get(id, 0, 3, VmProt::DEFAULT, GetMode::Blocking).unwrap_err();
        assert_eq!(err, AobjError::ResourceShortage);

        // Page 1 was allocated by the failed call and is gone again;
        // page 0 predates it and is merely released
        assert_eq!(mgr.resident_count(id).unwrap(), 1);
        assert_eq!(env.pages.outstanding(), 1);
        assert_eq!(env.pages.freed().len(), 1);
        assert!(!first[0].is_busy());
    }

    #[test]
    fn test_get_waits_for_memory() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(4), AobjFlags::empty()).unwrap();

        env.pages.set_budget(Some(0));
        env.pages.set_refill(1);
        let run = mgr.get(id, 0, 2, VmProt::DEFAULT, GetMode::Blocking).unwrap();
        assert!(run.is_complete());
    }

    fn populate(mgr: &AnonManager, id: AobjId, n: u64) -> Vec<Arc<VmPage>> {
        let got = mgr.get(id, 0, n as usize, VmProt::DEFAULT, GetMode::Blocking).unwrap().into_pages();
        mgr.unbusy_pages(id, &got).unwrap();
        got
    }

    #[test]
    fn test_put_deactivate() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(8), AobjFlags::empty()).unwrap();
        populate(&mgr, id, 4);
        mgr.set_swap_slot(id, 1, SwapSlot(11)).unwrap();

        mgr.put(id, 0, pages(4), PutFlags::DEACTIVATE).unwrap();
        assert_eq!(env.queues.deactivated().len(), 4);
        assert_eq!(mgr.resident_count(id).unwrap(), 4);
        assert_eq!(mgr.find_swap_slot(id, 1).unwrap(), SwapSlot(11));
    }

    #[test]
    fn test_put_free() {
        for penalty in [4, 0] {
            let env = TestEnv::new();
            let mgr = env.manager_with(AobjConfig::default().with_page_tree_penalty(penalty));
            let id = mgr.create(pages(32), AobjFlags::empty()).unwrap();
            populate(&mgr, id, 4);
            mgr.set_swap_slot(id, 1, SwapSlot(11)).unwrap();
            mgr.set_swap_slot(id, 6, SwapSlot(16)).unwrap();
            mgr.set_swap_slot(id, 20, SwapSlot(30)).unwrap();

            // Unaligned bounds round outwards to pages 0..8
            mgr.put(id, 100, pages(7) + 1, PutFlags::FREE).unwrap();

            assert_eq!(mgr.resident_count(id).unwrap(), 0);
            assert_eq!(env.pages.outstanding(), 0);
            assert_eq!(env.pmap.unmaps().len(), 4);
            let freed: BTreeSet<_> = env.swap.freed().into_iter().collect();
            assert_eq!(freed, [SwapSlot(11), SwapSlot(16)].into_iter().collect());
            assert_eq!(mgr.find_swap_slot(id, 20).unwrap(), SwapSlot(30));
        }
    }

    #[test]
    fn test_put_free_shared_object_deactivates() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(8), AobjFlags::empty()).unwrap();
        populate(&mgr, id, 3);
        mgr.set_swap_slot(id, 0, SwapSlot(4)).unwrap();
        mgr.reference(id).unwrap();

        mgr.put(id, 0, 0, PutFlags::FREE | PutFlags::ALLPAGES).unwrap();
        assert_eq!(mgr.resident_count(id).unwrap(), 3);
        assert_eq!(env.queues.deactivated().len(), 3);
        assert!(env.swap.freed().is_empty());
    }

    #[test]
    fn test_put_skips_wired_pages() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(8), AobjFlags::empty()).unwrap();
        let got = populate(&mgr, id, 3);
        got[1].wire();

        mgr.put(id, 0, pages(8), PutFlags::DEACTIVATE).unwrap();
        assert_eq!(env.queues.deactivated().len(), 2);

        mgr.put(id, 0, pages(8), PutFlags::FREE).unwrap();
        assert_eq!(mgr.resident_count(id).unwrap(), 1);
        assert!(mgr.page_lookup(id, 1).unwrap().is_some());
    }

    #[test]
    fn test_put_range_normalization() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(4), AobjFlags::empty()).unwrap();
        populate(&mgr, id, 4);

        // Cleaning alone is a no-op for anonymous memory
        mgr.put(id, 0, pages(4), PutFlags::CLEANIT).unwrap();
        // Empty range
        mgr.put(id, pages(2), pages(2), PutFlags::FREE).unwrap();
        assert_eq!(mgr.resident_count(id).unwrap(), 4);

        // Clamped to the end of the object
        mgr.put(id, pages(2), u64::MAX, PutFlags::FREE).unwrap();
        assert_eq!(mgr.resident_count(id).unwrap(), 2);
    }

    #[test]
    fn test_put_zero_stop_runs_to_end() {
        let env = TestEnv::new();
        let mgr = env.manager();
        let id = mgr.create(pages(8), AobjFlags::empty()).unwrap();
        populate(&mgr, id, 4);
        mgr.set_swap_slot(id, 6, SwapSlot(60)).unwrap();

        mgr.put(id, pages(1), 0, PutFlags::FREE).unwrap();
        assert_eq!(mgr.resident_count(id).unwrap(), 1);
        assert!(mgr.page_lookup(id, 0).unwrap().is_some());
        assert_eq!(env.swap.freed(), vec![SwapSlot(60)]);
    }

    #[test]
    fn test_put_waits_for_busy_page() {
        let env = TestEnv::new();
        let mgr = Arc::new(env.manager());
        let id = mgr.create(pages(4), AobjFlags::empty()).unwrap();
        populate(&mgr, id, 2);
        let held = mgr.get(id, 1, 1, VmProt::DEFAULT, GetMode::Blocking).unwrap().into_pages();

        let flusher = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || mgr.put(id, 0, 0, PutFlags::FREE | PutFlags::ALLPAGES).unwrap())
        };

        while mgr.resident_count(id).unwrap() != 1 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!flusher.is_finished());
        assert_eq!(mgr.resident_count(id).unwrap(), 1);

        mgr.unbusy_pages(id, &held).unwrap();
        flusher.join().unwrap();
        assert_eq!(mgr.resident_count(id).unwrap(), 0);
        assert!(mgr.counters().busy_waits >= 1);
    }
}
