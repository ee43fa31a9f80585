//! Physical Map (pmap) - Hardware Page Table Interface
//!
//! Based on Mach4 vm/pmap.h
//!
//! The pager never walks page tables itself. It asks the machine-dependent
//! layer to narrow or remove every mapping of a physical page:
//!
//! - `protect`: lower the access allowed through existing mappings
//!   (write-protect a clean page so the next store faults)
//! - `unmap_all`: remove the page from every address space before it is
//!   freed or its backing slot is released

use crate::mach_vm::vm_page::VmPage;

// ============================================================================
// Protection
// ============================================================================

/// VM protection bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmProt(u32);

impl VmProt {
    /// No access
    pub const NONE: Self = Self(0);
    /// Read access
    pub const READ: Self = Self(1);
    /// Write access
    pub const WRITE: Self = Self(2);
    /// Execute access
    pub const EXECUTE: Self = Self(4);
    /// Default (read/write)
    pub const DEFAULT: Self = Self(3); // READ | WRITE
    /// All permissions
    pub const ALL: Self = Self(7); // READ | WRITE | EXECUTE

    pub fn new(bits: u32) -> Self {
        Self(bits & 0x7)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Same protection with write access removed
    pub fn without_write(self) -> Self {
        Self(self.0 & !Self::WRITE.0)
    }
}

impl core::ops::BitOr for VmProt {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Physical Map Operations
// ============================================================================

/// Machine-dependent mapping operations on physical pages
pub trait PhysMap: Send + Sync {
    /// Restrict every mapping of `page` to at most `access`
    fn protect(&self, page: &VmPage, access: VmProt);

    /// Remove every mapping of `page`
    fn unmap_all(&self, page: &VmPage);
}
