//! Mach_R anonymous memory objects
//!
//! Demand-paged, swap-backed memory objects for anonymous memory (heaps,
//! stacks, copy-on-write working pages and the kernel's own pageable
//! memory), following the Mach VM object model.
//!
//! The physical page allocator, the pmap layer, the swap device and the
//! paging queues are collaborators supplied by the kernel through
//! [`mach_vm::VmContext`].

#![no_std]

// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Kernel code often needs explicit casts between page and byte units
#![allow(clippy::unnecessary_cast)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

// Standard library replacement for no_std
extern crate alloc;

// Tests run hosted and use threads
#[cfg(test)]
extern crate std;

pub mod kern;
pub mod mach_vm;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
