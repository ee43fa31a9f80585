//! VM Page Management - Physical Page Abstraction
//!
//! Based on Mach4 vm/vm_page.h/c
//!
//! Pages are owned by the physical page allocator; an anonymous object only
//! holds them while they are tabled at one of its offsets. The object lock
//! covers a page's identity, while the Busy/Wanted pair lets a single thread
//! own a page across a sleep without holding that lock.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::kern::sched_prim::{WaitEvent, WaitReason, WaitResult, WaitTicket};
use crate::mach_vm::vm_aobj::AobjId;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

// ============================================================================
// Page Flags
// ============================================================================

/// Page state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(u32);

impl PageFlags {
    /// Page is busy (an operation owns it exclusively)
    pub const BUSY: Self = Self(0x0001);
    /// Someone is waiting for BUSY to clear
    pub const WANTED: Self = Self(0x0002);
    /// Allocated, contents not yet valid
    pub const FAKE: Self = Self(0x0004);
    /// Unmodified since last write to backing store
    pub const CLEAN: Self = Self(0x0008);

    /// Empty flags
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Get bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Create from bits
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0x000F)
    }

    /// Check if contains flags
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check if any of the given flags are set
    pub const fn intersects(&self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Union with another flags
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for PageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// VM Page Structure
// ============================================================================

/// Virtual Memory Page
///
/// Represents a single physical page of memory.
#[derive(Debug)]
pub struct VmPage {
    /// Physical address of this page
    pub phys_addr: u64,

    /// Object this page belongs to (if any)
    object: Mutex<Option<AobjId>>,

    /// Byte offset within the object
    offset: AtomicU64,

    /// Page flags
    flags: AtomicU32,

    /// Wire count (pinned pages are never paged out)
    wire_count: AtomicU32,

    /// Wakeup channel for threads waiting on BUSY
    event: WaitEvent,
}

impl VmPage {
    /// Create a new VM page
    pub fn new(phys_addr: u64) -> Self {
        Self {
            phys_addr,
            object: Mutex::new(None),
            offset: AtomicU64::new(0),
            flags: AtomicU32::new(0),
            wire_count: AtomicU32::new(0),
            event: WaitEvent::new(),
        }
    }

    /// Get page flags
    pub fn get_flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Set page flags
    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// Clear page flags
    pub fn clear_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// Check if page has specific flags
    pub fn has_flags(&self, flags: PageFlags) -> bool {
        self.get_flags().contains(flags)
    }

    pub fn is_busy(&self) -> bool {
        self.has_flags(PageFlags::BUSY)
    }

    pub fn is_fake(&self) -> bool {
        self.has_flags(PageFlags::FAKE)
    }

    pub fn is_clean(&self) -> bool {
        self.has_flags(PageFlags::CLEAN)
    }

    /// Take exclusive ownership of the page.
    ///
    /// The caller holds the owning object's lock and has checked the page
    /// is not already busy.
    pub fn set_busy(&self) {
        let prev = self.flags.fetch_or(PageFlags::BUSY.bits(), Ordering::SeqCst);
        debug_assert!(prev & PageFlags::BUSY.bits() == 0, "page already busy");
    }

    /// Release exclusive ownership and wake any waiters
    pub fn unbusy(&self) {
        let mask = !(PageFlags::BUSY.bits() | PageFlags::WANTED.bits());
        let prev = self.flags.fetch_and(mask, Ordering::SeqCst);
        if prev & PageFlags::WANTED.bits() != 0 {
            self.event.thread_wakeup();
        }
    }

    /// Mark the page wanted and return a ticket for [`VmPage::wait`].
    ///
    /// Called under the object lock on a busy page.
    pub fn want(&self) -> WaitTicket {
        let ticket = self.event.assert_wait();
        self.set_flags(PageFlags::WANTED);
        ticket
    }

    /// Sleep until the page is unbusied. The object lock must be dropped.
    pub fn wait(&self, ticket: WaitTicket) -> WaitResult {
        self.event
            .thread_block(ticket, WaitReason::VmPage, || self.is_busy())
    }

    /// Wire the page (pin in memory)
    pub fn wire(&self) {
        self.wire_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Unwire the page
    pub fn unwire(&self) {
        let _ = self
            .wire_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| w.checked_sub(1));
    }

    /// Check if page is wired
    pub fn is_wired(&self) -> bool {
        self.wire_count.load(Ordering::SeqCst) > 0
    }

    /// Get the object this page belongs to
    pub fn get_object(&self) -> Option<AobjId> {
        *self.object.lock()
    }

    /// Byte offset of the page within its object
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Set the object this page belongs to
    pub fn set_object(&self, object: Option<AobjId>, offset: u64) {
        *self.object.lock() = object;
        self.offset.store(offset, Ordering::SeqCst);
    }

    /// Reset all state before the page returns to the allocator
    pub fn reset(&self) {
        self.set_object(None, 0);
        self.flags.store(0, Ordering::SeqCst);
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Physical page allocator
pub trait PageAllocator: Send + Sync {
    /// Allocate a page for `owner` at byte `offset`. A `zero_fill` page
    /// comes back with zeroed contents.
    fn alloc(&self, owner: AobjId, offset: u64, zero_fill: bool) -> Option<Arc<VmPage>>;

    /// Return a page to the free pool
    fn free(&self, page: Arc<VmPage>);

    /// Sleep until memory may be available again. Returns `false` when the
    /// caller should give up instead of retrying.
    fn wait_for_memory(&self) -> bool;
}

/// Paging queues (active/inactive LRU) maintained by the pageout daemon
pub trait PageQueues: Send + Sync {
    /// Queue a dirty page so the pageout daemon writes it back soon
    fn enqueue_for_reclaim(&self, page: &Arc<VmPage>);

    /// Move a page to the inactive queue
    fn deactivate(&self, page: &Arc<VmPage>);
}

// ============================================================================
// Address Helpers
// ============================================================================

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Byte offset to page index
pub const fn atop(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// Page index to byte offset
pub const fn ptoa(index: u64) -> u64 {
    index << PAGE_SHIFT
}
