//! Mach Virtual Memory Subsystem
//!
//! Based on Mach4 vm/ subsystem.
//! Provides anonymous memory objects and their paging machinery:
//! - vm_page: Physical page abstraction and busy/wanted protocol
//! - pmap: Physical map interface (protect, unmap)
//! - swap_pager: Swap slots and the swap device interface
//! - swap_index: Per-object page-to-slot index (flat or hashed)
//! - vm_aobj: Anonymous objects, the registry and reference counting
//! - aobj_pager: Page fetch (get) and reclamation (put)
//! - aobj_swapoff: Evacuating a swap slot range

pub mod aobj_pager;
pub mod aobj_swapoff;
pub mod pmap;
pub mod swap_index;
pub mod swap_pager;
pub mod vm_aobj;
pub mod vm_page;

#[cfg(test)]
mod testing;

pub use aobj_pager::{GetMode, PageRun, PutFlags};
pub use pmap::{PhysMap, VmProt};
pub use swap_index::{SwapIndex, SwapIndexKind, SWHASH_CLUSTER_SIZE, SWHASH_THRESHOLD};
pub use swap_pager::{SwapDevice, SwapIoError, SwapSlot};
pub use vm_aobj::{
    aobj_manager, AnonManager, AobjConfig, AobjError, AobjFlags, AobjId, VmContext,
};
pub use vm_page::{PageAllocator, PageFlags, PageQueues, VmPage, PAGE_SHIFT, PAGE_SIZE};

/// Initialize the anonymous memory subsystem
pub fn init(ctx: VmContext, config: AobjConfig) -> &'static AnonManager {
    vm_aobj::init(ctx, config)
}
