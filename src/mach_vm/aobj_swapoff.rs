//! Swap-Off: Evacuating a Swap Range
//!
//! When a swap device is removed, every page whose backing copy lives in
//! the device's slot range must be brought back into memory first. The
//! walk visits every registered object, pages in each matching entry and
//! leaves the page dirty on the reclaim queue so the pageout daemon writes
//! it to a surviving device.

use alloc::sync::Arc;
use log::{debug, warn};

use crate::counter;
use crate::mach_vm::pmap::VmProt;
use crate::mach_vm::swap_pager::SwapSlot;
use crate::mach_vm::vm_aobj::{AnonManager, AnonObject, AobjError, AobjId};
use crate::mach_vm::vm_page::PageFlags;

impl AnonManager {
    /// Page in every page backed by a slot in `[lo, hi)`.
    ///
    /// Returns `true` if the walk was aborted for lack of memory; the caller
    /// should retry later. Read errors are not fatal: the slot is poisoned
    /// and the walk moves on.
    pub fn swap_off(&self, lo: SwapSlot, hi: SwapSlot) -> bool {
        debug!("aobj: swap_off {}..{}", lo, hi);
        let mut cursor = AobjId::NULL;

        while let Some(obj) = self.reference_next(cursor) {
            cursor = obj.id;
            let aborted = self.pagein(&obj, lo, hi);
            let _ = self.release(&obj);
            if aborted {
                warn!("aobj: swap_off {}..{} aborted at {:?}", lo, hi, cursor);
                return true;
            }
        }

        debug!("aobj: swap_off {}..{} complete", lo, hi);
        false
    }

    /// Page in one object's entries in the range, a cluster at a time.
    /// Returns `true` on memory exhaustion.
    fn pagein(&self, obj: &Arc<AnonObject>, lo: SwapSlot, hi: SwapSlot) -> bool {
        loop {
            let batch = match obj.lock_alive() {
                Ok(state) => state.swslots.next_batch_in_slot_range(lo, hi),
                Err(_) => return false,
            };
            if batch.is_empty() {
                return false;
            }

            for &idx in batch.iter() {
                match self.pagein_page(obj, idx) {
                    Ok(()) => {}
                    Err(AobjError::ResourceShortage) => return true,
                    Err(AobjError::InvalidHandle) => return false,
                    // Page is gone; its slot was poisoned
                    Err(_) => {}
                }
            }
        }
    }

    fn pagein_page(&self, obj: &AnonObject, idx: u64) -> Result<(), AobjError> {
        let (page, _) = self.fetch_page(obj, idx, VmProt::DEFAULT)?;

        let mut state = obj.lock();
        self.dropswap(&mut state, idx);
        page.clear_flags(PageFlags::CLEAN | PageFlags::FAKE);
        self.ctx.queues.enqueue_for_reclaim(&page);
        page.unbusy();

        counter!(self.counters.swapoff_pageins);
        Ok(())
    }
}
