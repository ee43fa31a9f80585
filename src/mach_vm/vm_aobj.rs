//! Anonymous Memory Objects
//!
//! Based on Mach4 vm/vm_object.h/c and the BSD anonymous object pager.
//!
//! An anonymous object backs memory that has no file behind it: heaps,
//! stacks, copy-on-write working pages and the kernel's own pageable
//! memory. Its pages are zero-filled on first touch and, once the pageout
//! daemon has written them out, restored from swap.
//!
//! ## Ownership
//!
//! - Objects live in the manager's registry, keyed by an [`AobjId`] that is
//!   never reused. Callers hold ids, never the object itself, so a stale id
//!   fails cleanly with [`AobjError::InvalidHandle`].
//! - The registry lock is always taken before an object lock. An object is
//!   registered only once fully built and is unregistered before teardown,
//!   so a registry walker never sees a half-built or half-destroyed object.
//! - No lock is held across a page wait, a memory wait or swap I/O.
//!
//! Paging operations (`get`, `put`) live in `aobj_pager`, swap device
//! removal in `aobj_swapoff`.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use log::{debug, trace};
use spin::{Mutex, MutexGuard};

use crate::counter;
use crate::kern::counters::{AobjCounters, CounterSnapshot};
use crate::mach_vm::pmap::PhysMap;
use crate::mach_vm::swap_index::{
    SwapIndex, SwapIndexKind, SWHASH_MAX_BUCKETS, SWHASH_THRESHOLD,
};
use crate::mach_vm::swap_pager::{SwapDevice, SwapSlot};
use crate::mach_vm::vm_page::{PageAllocator, PageQueues, VmPage, PAGE_SHIFT, PAGE_SIZE};

// ============================================================================
// Identifiers and Flags
// ============================================================================

/// Anonymous object handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AobjId(pub u64);

impl AobjId {
    /// Null object ID
    pub const NULL: Self = Self(0);
}

/// Creation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AobjFlags(u32);

impl AobjFlags {
    /// Create the kernel object (once, no swap)
    pub const KERNOBJ: Self = Self(0x0001);
    /// Give the kernel object swap (once, after KERNOBJ)
    pub const KERNSWAP: Self = Self(0x0002);

    /// Ordinary object
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitOr for AobjFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Internal object state bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ObjectFlags(u32);

impl ObjectFlags {
    /// Object is registered and usable
    const ALIVE: Self = Self(0x0001);
    /// Object may never be given swap
    const NOSWAP: Self = Self(0x0002);
    /// The kernel object: immortal
    const KERNEL: Self = Self(0x0004);
}

// ============================================================================
// Errors
// ============================================================================

/// Anonymous object pager errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AobjError {
    /// Object id is unknown or the object was destroyed
    InvalidHandle,
    /// Page index beyond the end of the object
    OutOfRange,
    /// No page or index memory available
    ResourceShortage,
    /// Backing store could not be read; the slot has been poisoned
    Io { slot: SwapSlot },
    /// The kernel object already exists (or already has swap)
    AlreadyInitialized,
    /// The kernel object does not exist yet
    NotInitialized,
}

impl fmt::Display for AobjError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AobjError::InvalidHandle => write!(f, "invalid anonymous object handle"),
            AobjError::OutOfRange => write!(f, "page index out of range"),
            AobjError::ResourceShortage => write!(f, "out of memory"),
            AobjError::Io { slot } => write!(f, "swap read failed at {}", slot),
            AobjError::AlreadyInitialized => write!(f, "kernel object already initialized"),
            AobjError::NotInitialized => write!(f, "kernel object not initialized"),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for the anonymous object pager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AobjConfig {
    /// Objects with more pages than this use a hashed swap index
    pub swhash_threshold: u64,
    /// Upper bound on hash buckets per object
    pub swhash_max_buckets: usize,
    /// `put` walks the resident list instead of probing each offset when
    /// `resident <= range_pages * page_tree_penalty`
    pub page_tree_penalty: u64,
}

impl AobjConfig {
    pub const fn new() -> Self {
        Self {
            swhash_threshold: SWHASH_THRESHOLD,
            swhash_max_buckets: SWHASH_MAX_BUCKETS,
            page_tree_penalty: 4,
        }
    }

    pub const fn with_swhash_threshold(mut self, pages: u64) -> Self {
        self.swhash_threshold = pages;
        self
    }

    pub const fn with_swhash_max_buckets(mut self, buckets: usize) -> Self {
        self.swhash_max_buckets = buckets;
        self
    }

    pub const fn with_page_tree_penalty(mut self, penalty: u64) -> Self {
        self.page_tree_penalty = penalty;
        self
    }
}

impl Default for AobjConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Subsystems the pager calls out to
#[derive(Clone)]
pub struct VmContext {
    pub pages: Arc<dyn PageAllocator>,
    pub pmap: Arc<dyn PhysMap>,
    pub swap: Arc<dyn SwapDevice>,
    pub queues: Arc<dyn PageQueues>,
}

// ============================================================================
// Anonymous Object
// ============================================================================

/// State covered by the object lock
#[derive(Debug)]
pub(crate) struct AobjState {
    /// Resident pages by page index
    pub(crate) pages: BTreeMap<u64, Arc<VmPage>>,
    pub(crate) swslots: SwapIndex,
}

/// An anonymous memory object
#[derive(Debug)]
pub struct AnonObject {
    pub id: AobjId,

    /// Size in pages, fixed at creation
    page_count: u64,

    ref_count: AtomicU32,

    flags: AtomicU32,

    state: Mutex<AobjState>,
}

impl AnonObject {
    fn new(id: AobjId, page_count: u64, swslots: SwapIndex, flags: ObjectFlags) -> Self {
        Self {
            id,
            page_count,
            ref_count: AtomicU32::new(1),
            flags: AtomicU32::new(ObjectFlags::ALIVE.0 | flags.0),
            state: Mutex::new(AobjState {
                pages: BTreeMap::new(),
                swslots,
            }),
        }
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    fn has_flags(&self, flags: ObjectFlags) -> bool {
        self.flags.load(Ordering::SeqCst) & flags.0 == flags.0
    }

    fn clear_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_and(!flags.0, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.has_flags(ObjectFlags::ALIVE)
    }

    pub fn is_kernel(&self) -> bool {
        self.has_flags(ObjectFlags::KERNEL)
    }

    pub fn is_no_swap(&self) -> bool {
        self.has_flags(ObjectFlags::NOSWAP)
    }

    /// Take a reference unless the count already reached zero
    pub(crate) fn try_reference(&self) -> bool {
        if self.is_kernel() {
            return true;
        }
        self.ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| {
                if r == 0 {
                    None
                } else {
                    Some(r + 1)
                }
            })
            .is_ok()
    }

    /// Lock the object, failing if it has been torn down
    pub(crate) fn lock_alive(&self) -> Result<MutexGuard<'_, AobjState>, AobjError> {
        let state = self.state.lock();
        if !self.is_alive() {
            return Err(AobjError::InvalidHandle);
        }
        Ok(state)
    }

    /// Lock the object regardless of liveness
    pub(crate) fn lock(&self) -> MutexGuard<'_, AobjState> {
        self.state.lock()
    }
}

/// State of the distinguished kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KernelObject {
    Absent,
    NoSwap(AobjId),
    Swap(AobjId),
}

// ============================================================================
// Manager
// ============================================================================

/// Owner of every anonymous object and of the registry walked by swap-off
pub struct AnonManager {
    pub(crate) ctx: VmContext,
    pub(crate) config: AobjConfig,
    registry: Mutex<BTreeMap<AobjId, Arc<AnonObject>>>,
    next_id: AtomicU64,
    kernel_object: Mutex<KernelObject>,
    pub(crate) counters: AobjCounters,
}

impl AnonManager {
    pub fn new(ctx: VmContext) -> Self {
        Self::with_config(ctx, AobjConfig::default())
    }

    pub fn with_config(ctx: VmContext, config: AobjConfig) -> Self {
        Self {
            ctx,
            config,
            registry: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            kernel_object: Mutex::new(KernelObject::Absent),
            counters: AobjCounters::new(),
        }
    }

    pub fn config(&self) -> &AobjConfig {
        &self.config
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    fn alloc_id(&self) -> AobjId {
        AobjId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn register(&self, obj: Arc<AnonObject>) {
        self.registry.lock().insert(obj.id, obj);
    }

    /// Look up a live object
    pub(crate) fn lookup(&self, id: AobjId) -> Result<Arc<AnonObject>, AobjError> {
        self.registry
            .lock()
            .get(&id)
            .cloned()
            .ok_or(AobjError::InvalidHandle)
    }

    /// Next registered object after `cursor`, with a reference taken on it.
    /// Objects whose last reference is already gone are skipped.
    pub(crate) fn reference_next(&self, cursor: AobjId) -> Option<Arc<AnonObject>> {
        use core::ops::Bound::{Excluded, Unbounded};

        let registry = self.registry.lock();
        registry
            .range((Excluded(cursor), Unbounded))
            .map(|(_, obj)| obj)
            .find(|obj| obj.try_reference())
            .cloned()
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create an anonymous object of `size` bytes.
    ///
    /// `AobjFlags::KERNOBJ` creates the kernel object; `AobjFlags::KERNSWAP`
    /// gives the existing kernel object swap and returns its id.
    pub fn create(&self, size: u64, flags: AobjFlags) -> Result<AobjId, AobjError> {
        if flags.contains(AobjFlags::KERNSWAP) {
            return self.enable_kernel_swap();
        }
        if flags.contains(AobjFlags::KERNOBJ) {
            return self.create_kernel_object(size);
        }

        let page_count = size_to_pages(size);
        let swslots = SwapIndex::new(page_count, &self.config)?;
        let id = self.alloc_id();
        let obj = Arc::new(AnonObject::new(id, page_count, swslots, ObjectFlags(0)));

        self.register(obj);
        counter!(self.counters.objects_created);
        debug!("aobj: created {:?} pages={}", id, page_count);
        Ok(id)
    }

    /// Create the immortal kernel object. It has no swap until
    /// [`AnonManager::enable_kernel_swap`] is called.
    pub fn create_kernel_object(&self, size: u64) -> Result<AobjId, AobjError> {
        let mut kernel = self.kernel_object.lock();
        if *kernel != KernelObject::Absent {
            return Err(AobjError::AlreadyInitialized);
        }

        let page_count = size_to_pages(size);
        let id = self.alloc_id();
        let obj = Arc::new(AnonObject::new(
            id,
            page_count,
            SwapIndex::no_swap(page_count),
            ObjectFlags(ObjectFlags::KERNEL.0 | ObjectFlags::NOSWAP.0),
        ));

        self.register(obj);
        *kernel = KernelObject::NoSwap(id);
        counter!(self.counters.objects_created);
        debug!("aobj: kernel object {:?} pages={}", id, page_count);
        Ok(id)
    }

    /// Allocate the kernel object's swap index once swap is configured
    pub fn enable_kernel_swap(&self) -> Result<AobjId, AobjError> {
        let mut kernel = self.kernel_object.lock();
        let id = match *kernel {
            KernelObject::Absent => return Err(AobjError::NotInitialized),
            KernelObject::Swap(_) => return Err(AobjError::AlreadyInitialized),
            KernelObject::NoSwap(id) => id,
        };

        let obj = self.lookup(id)?;
        let swslots = SwapIndex::new(obj.page_count, &self.config)?;
        {
            let mut state = obj.lock();
            state.swslots = swslots;
            obj.clear_flags(ObjectFlags::NOSWAP);
        }
        *kernel = KernelObject::Swap(id);
        debug!("aobj: kernel object {:?} may now swap", id);
        Ok(id)
    }

    /// The kernel object, if created
    pub fn kernel_object(&self) -> Option<AobjId> {
        match *self.kernel_object.lock() {
            KernelObject::Absent => None,
            KernelObject::NoSwap(id) | KernelObject::Swap(id) => Some(id),
        }
    }

    // ========================================================================
    // Reference Counting
    // ========================================================================

    /// Add a reference. A no-op for the kernel object.
    pub fn reference(&self, id: AobjId) -> Result<(), AobjError> {
        let obj = self.lookup(id)?;
        if obj.try_reference() {
            Ok(())
        } else {
            Err(AobjError::InvalidHandle)
        }
    }

    /// Drop a reference, destroying the object when it was the last one.
    /// A no-op for the kernel object.
    pub fn detach(&self, id: AobjId) -> Result<(), AobjError> {
        let obj = self.lookup(id)?;
        self.release(&obj)
    }

    pub(crate) fn release(&self, obj: &Arc<AnonObject>) -> Result<(), AobjError> {
        if obj.is_kernel() {
            return Ok(());
        }
        let prev = obj
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
            .map_err(|_| AobjError::InvalidHandle)?;
        if prev == 1 {
            self.destroy(obj);
        }
        Ok(())
    }

    /// Tear down an object whose last reference is gone. Only the thread
    /// that dropped the count to zero gets here.
    fn destroy(&self, obj: &Arc<AnonObject>) {
        self.registry.lock().remove(&obj.id);

        let mut state = obj.lock();
        obj.clear_flags(ObjectFlags::ALIVE);

        loop {
            let (idx, page) = match state.pages.iter().next() {
                Some((&idx, page)) => (idx, Arc::clone(page)),
                None => break,
            };
            if page.is_busy() {
                counter!(self.counters.busy_waits);
                let ticket = page.want();
                drop(state);
                page.wait(ticket);
                state = obj.lock();
                continue;
            }

            self.ctx.pmap.unmap_all(&page);
            self.dropswap(&mut state, idx);
            state.pages.remove(&idx);
            self.free_page(page);
        }

        let released = state.swslots.drop_range(0, 0, &*self.ctx.swap);
        counter!(self.counters.swap_only_released, released);
        state.swslots = SwapIndex::no_swap(0);

        counter!(self.counters.objects_destroyed);
        debug!("aobj: destroyed {:?}, {} swap-only slots released", obj.id, released);
    }

    // ========================================================================
    // Swap Slots
    // ========================================================================

    /// Swap slot recorded for page `index`
    pub fn find_swap_slot(&self, id: AobjId, index: u64) -> Result<SwapSlot, AobjError> {
        let obj = self.lookup(id)?;
        let state = obj.lock_alive()?;
        if index >= obj.page_count {
            return Err(AobjError::OutOfRange);
        }
        Ok(state.swslots.find(index))
    }

    /// Record `slot` for page `index`, returning the previous slot. The
    /// previous slot is not freed; that is the caller's job.
    ///
    /// # Panics
    ///
    /// Storing a non-zero slot into a no-swap object.
    pub fn set_swap_slot(&self, id: AobjId, index: u64, slot: SwapSlot) -> Result<SwapSlot, AobjError> {
        let obj = self.lookup(id)?;
        let mut state = obj.lock_alive()?;
        let old = state.swslots.set(index, slot)?;
        trace!("aobj: {:?} page {} {} -> {}", id, index, old, slot);
        Ok(old)
    }

    /// Release every swap slot of pages `[lo, hi)` (`hi == 0`: to the end).
    /// Returns the number of slots released.
    pub fn drop_swap_range(&self, id: AobjId, lo: u64, hi: u64) -> Result<usize, AobjError> {
        let obj = self.lookup(id)?;
        let mut state = obj.lock_alive()?;
        let released = state.swslots.drop_range(lo, hi, &*self.ctx.swap);
        counter!(self.counters.swap_only_released, released);
        Ok(released)
    }

    /// Clear the slot for one page and give it back to the swap device
    pub(crate) fn dropswap(&self, state: &mut AobjState, idx: u64) {
        if let Ok(slot) = state.swslots.set(idx, SwapSlot::NONE) {
            if slot.is_valid() {
                self.ctx.swap.free_slot(slot, 1);
            }
        }
    }

    pub(crate) fn free_page(&self, page: Arc<VmPage>) {
        trace!("aobj: free page {:#x}", page.phys_addr);
        page.reset();
        self.ctx.pages.free(page);
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Release pages handed out busy by `get`
    pub fn unbusy_pages(&self, id: AobjId, pages: &[Arc<VmPage>]) -> Result<(), AobjError> {
        let obj = self.lookup(id)?;
        let _state = obj.lock();
        for page in pages {
            page.unbusy();
        }
        Ok(())
    }

    /// Resident page at `index`, if any
    pub fn page_lookup(&self, id: AobjId, index: u64) -> Result<Option<Arc<VmPage>>, AobjError> {
        let obj = self.lookup(id)?;
        let state = obj.lock_alive()?;
        Ok(state.pages.get(&index).cloned())
    }

    pub fn resident_count(&self, id: AobjId) -> Result<usize, AobjError> {
        let obj = self.lookup(id)?;
        let state = obj.lock_alive()?;
        Ok(state.pages.len())
    }

    /// Number of non-zero swap index entries
    pub fn swap_slot_count(&self, id: AobjId) -> Result<usize, AobjError> {
        let obj = self.lookup(id)?;
        let state = obj.lock_alive()?;
        Ok(state.swslots.count())
    }

    pub fn index_kind(&self, id: AobjId) -> Result<Option<SwapIndexKind>, AobjError> {
        let obj = self.lookup(id)?;
        let state = obj.lock_alive()?;
        Ok(state.swslots.kind())
    }

    pub fn page_count(&self, id: AobjId) -> Result<u64, AobjError> {
        Ok(self.lookup(id)?.page_count)
    }

    pub fn ref_count(&self, id: AobjId) -> Result<u32, AobjError> {
        Ok(self.lookup(id)?.ref_count())
    }

    pub fn contains(&self, id: AobjId) -> bool {
        self.registry.lock().contains_key(&id)
    }

    pub fn object_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Ids of every registered object
    pub fn objects(&self) -> Vec<AobjId> {
        self.registry.lock().keys().copied().collect()
    }
}

/// Bytes to pages, rounding up
pub const fn size_to_pages(size: u64) -> u64 {
    let pages = size >> PAGE_SHIFT;
    if size & (PAGE_SIZE as u64 - 1) != 0 {
        pages + 1
    } else {
        pages
    }
}

// ============================================================================
// Global State
// ============================================================================

static AOBJ_MANAGER: spin::Once<AnonManager> = spin::Once::new();

/// Initialize the anonymous object subsystem
pub fn init(ctx: VmContext, config: AobjConfig) -> &'static AnonManager {
    AOBJ_MANAGER.call_once(|| AnonManager::with_config(ctx, config))
}

/// The system anonymous object manager, once initialized
pub fn aobj_manager() -> Option<&'static AnonManager> {
    AOBJ_MANAGER.get()
}
