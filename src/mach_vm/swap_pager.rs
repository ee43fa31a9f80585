//! Swap Device Interface
//!
//! Based on the Mach default pager's backing-store calls.
//!
//! A swap slot is an opaque handle to one page of backing store, owned by
//! the swap layer. Zero is never a valid slot, so the anonymous pager uses
//! it to mean "no backing copy". A slot whose read failed is replaced in
//! the object's index by [`SwapSlot::BAD`] so it is never read, freed or
//! handed out again.

use core::fmt;

use crate::mach_vm::vm_page::VmPage;

/// Swap slot handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct SwapSlot(pub i32);

impl SwapSlot {
    /// No backing copy
    pub const NONE: Self = Self(0);
    /// Poisoned after an I/O error
    pub const BAD: Self = Self(-1);

    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_bad(&self) -> bool {
        self.0 == Self::BAD.0
    }

    /// Slot refers to real backing store
    pub const fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Slot lies in `[lo, hi)`
    pub const fn in_range(&self, lo: SwapSlot, hi: SwapSlot) -> bool {
        self.0 >= lo.0 && self.0 < hi.0
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bad() {
            write!(f, "slot(bad)")
        } else {
            write!(f, "slot({})", self.0)
        }
    }
}

/// Swap read failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapIoError {
    /// Device reported a transfer error
    Io,
    /// Slot does not belong to any configured device
    NoDevice,
}

/// Swap-device transport
pub trait SwapDevice: Send + Sync {
    /// Synchronously read `slot` into `page`
    fn read(&self, slot: SwapSlot, page: &VmPage) -> Result<(), SwapIoError>;

    /// Release `count` slots starting at `slot`
    fn free_slot(&self, slot: SwapSlot, count: usize);

    /// Record `count` slots starting at `slot` as unusable
    fn mark_bad(&self, slot: SwapSlot, count: usize);
}
