//! Recording collaborators for pager tests

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::mach_vm::pmap::{PhysMap, VmProt};
use crate::mach_vm::swap_pager::{SwapDevice, SwapIoError, SwapSlot};
use crate::mach_vm::vm_aobj::{AnonManager, AobjConfig, AobjId, VmContext};
use crate::mach_vm::vm_page::{PageAllocator, PageQueues, VmPage, PAGE_SIZE};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Page Allocator
// ============================================================================

pub(crate) struct MockPages {
    next_addr: AtomicU64,
    /// Remaining pages, `None` for unlimited
    budget: Mutex<Option<usize>>,
    /// Pages granted back per `wait_for_memory` call (0 = give up)
    refill: AtomicUsize,
    allocated: AtomicUsize,
    zero_filled: AtomicUsize,
    freed: Mutex<Vec<u64>>,
}

impl MockPages {
    pub(crate) fn new() -> Self {
        Self {
            next_addr: AtomicU64::new(0x10_0000),
            budget: Mutex::new(None),
            refill: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            zero_filled: AtomicUsize::new(0),
            freed: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_budget(&self, pages: Option<usize>) {
        *self.budget.lock() = pages;
    }

    pub(crate) fn set_refill(&self, pages: usize) {
        self.refill.store(pages, Ordering::SeqCst);
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub(crate) fn zero_filled(&self) -> usize {
        self.zero_filled.load(Ordering::SeqCst)
    }

    pub(crate) fn freed(&self) -> Vec<u64> {
        self.freed.lock().clone()
    }

    /// Pages handed out and not yet returned
    pub(crate) fn outstanding(&self) -> usize {
        self.allocated() - self.freed.lock().len()
    }
}

impl PageAllocator for MockPages {
    fn alloc(&self, owner: AobjId, offset: u64, zero_fill: bool) -> Option<Arc<VmPage>> {
        {
            let mut budget = self.budget.lock();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return None;
                }
                *left -= 1;
            }
        }
        let addr = self.next_addr.fetch_add(PAGE_SIZE as u64, Ordering::SeqCst);
        let page = Arc::new(VmPage::new(addr));
        page.set_object(Some(owner), offset);
        self.allocated.fetch_add(1, Ordering::SeqCst);
        if zero_fill {
            self.zero_filled.fetch_add(1, Ordering::SeqCst);
        }
        Some(page)
    }

    fn free(&self, page: Arc<VmPage>) {
        assert!(!page.is_busy(), "freeing a busy page");
        self.freed.lock().push(page.phys_addr);
        if let Some(left) = self.budget.lock().as_mut() {
            *left += 1;
        }
    }

    fn wait_for_memory(&self) -> bool {
        let refill = self.refill.load(Ordering::SeqCst);
        if refill == 0 {
            return false;
        }
        if let Some(left) = self.budget.lock().as_mut() {
            *left += refill;
        }
        true
    }
}

// ============================================================================
// Pmap
// ============================================================================

pub(crate) struct MockPmap {
    protects: Mutex<Vec<(u64, VmProt)>>,
    unmaps: Mutex<Vec<u64>>,
}

impl MockPmap {
    pub(crate) fn new() -> Self {
        Self {
            protects: Mutex::new(Vec::new()),
            unmaps: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn protects(&self) -> Vec<(u64, VmProt)> {
        self.protects.lock().clone()
    }

    pub(crate) fn unmaps(&self) -> Vec<u64> {
        self.unmaps.lock().clone()
    }
}

impl PhysMap for MockPmap {
    fn protect(&self, page: &VmPage, access: VmProt) {
        self.protects.lock().push((page.phys_addr, access));
    }

    fn unmap_all(&self, page: &VmPage) {
        self.unmaps.lock().push(page.phys_addr);
    }
}

// ============================================================================
// Swap Device
// ============================================================================

pub(crate) struct MockSwap {
    reads: AtomicUsize,
    /// Milliseconds each read takes
    read_delay_ms: AtomicU64,
    failing: Mutex<BTreeSet<SwapSlot>>,
    freed: Mutex<Vec<SwapSlot>>,
    bad: Mutex<Vec<SwapSlot>>,
}

impl MockSwap {
    pub(crate) fn new() -> Self {
        Self {
            reads: AtomicUsize::new(0),
            read_delay_ms: AtomicU64::new(0),
            failing: Mutex::new(BTreeSet::new()),
            freed: Mutex::new(Vec::new()),
            bad: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn fail_reads_of(&self, slot: SwapSlot) {
        self.failing.lock().insert(slot);
    }

    pub(crate) fn set_read_delay_ms(&self, ms: u64) {
        self.read_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn freed(&self) -> Vec<SwapSlot> {
        self.freed.lock().clone()
    }

    pub(crate) fn bad(&self) -> Vec<SwapSlot> {
        self.bad.lock().clone()
    }
}

impl SwapDevice for MockSwap {
    fn read(&self, slot: SwapSlot, _page: &VmPage) -> Result<(), SwapIoError> {
        assert!(slot.is_valid(), "read of {}", slot);
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(std::time::Duration::from_millis(delay));
        }
        if self.failing.lock().contains(&slot) {
            return Err(SwapIoError::Io);
        }
        Ok(())
    }

    fn free_slot(&self, slot: SwapSlot, count: usize) {
        assert!(slot.is_valid(), "free of {}", slot);
        let mut freed = self.freed.lock();
        for i in 0..count {
            let s = SwapSlot(slot.0 + i as i32);
            assert!(!freed.contains(&s), "double free of {}", s);
            freed.push(s);
        }
    }

    fn mark_bad(&self, slot: SwapSlot, count: usize) {
        let mut bad = self.bad.lock();
        for i in 0..count {
            bad.push(SwapSlot(slot.0 + i as i32));
        }
    }
}

// ============================================================================
// Page Queues
// ============================================================================

pub(crate) struct MockQueues {
    deactivated: Mutex<Vec<u64>>,
    reclaim: Mutex<Vec<u64>>,
}

impl MockQueues {
    pub(crate) fn new() -> Self {
        Self {
            deactivated: Mutex::new(Vec::new()),
            reclaim: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn deactivated(&self) -> Vec<u64> {
        self.deactivated.lock().clone()
    }

    pub(crate) fn reclaim(&self) -> Vec<u64> {
        self.reclaim.lock().clone()
    }
}

impl PageQueues for MockQueues {
    fn enqueue_for_reclaim(&self, page: &Arc<VmPage>) {
        self.reclaim.lock().push(page.phys_addr);
    }

    fn deactivate(&self, page: &Arc<VmPage>) {
        self.deactivated.lock().push(page.phys_addr);
    }
}

// ============================================================================
// Test Environment
// ============================================================================

pub(crate) struct TestEnv {
    pub(crate) pages: Arc<MockPages>,
    pub(crate) pmap: Arc<MockPmap>,
    pub(crate) swap: Arc<MockSwap>,
    pub(crate) queues: Arc<MockQueues>,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        init_logging();
        Self {
            pages: Arc::new(MockPages::new()),
            pmap: Arc::new(MockPmap::new()),
            swap: Arc::new(MockSwap::new()),
            queues: Arc::new(MockQueues::new()),
        }
    }

    pub(crate) fn context(&self) -> VmContext {
        VmContext {
            pages: self.pages.clone(),
            pmap: self.pmap.clone(),
            swap: self.swap.clone(),
            queues: self.queues.clone(),
        }
    }

    pub(crate) fn manager(&self) -> AnonManager {
        AnonManager::new(self.context())
    }

    pub(crate) fn manager_with(&self, config: AobjConfig) -> AnonManager {
        AnonManager::with_config(self.context(), config)
    }
}
