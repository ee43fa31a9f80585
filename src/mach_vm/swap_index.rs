//! Swap Slot Index
//!
//! Based on Mach4 vm/vm_external.h/c by CMU (1989)
//!
//! Per-object map from page index to the swap slot holding that page's
//! backing copy. Like the existence maps it descends from, the index picks
//! its representation once, from the object's size:
//!
//! - **Flat**: one entry per page. O(1) lookup, memory proportional to the
//!   object size. Used up to the hash threshold.
//! - **Hashed**: page indices are grouped into clusters of
//!   [`SWHASH_CLUSTER_SIZE`] consecutive pages; clusters hang off a bucket
//!   array keyed by `index >> SWHASH_CLUSTER_SHIFT`. A cluster exists only
//!   while it holds a non-zero entry, so large sparse objects stay cheap.
//!
//! Zero is never a valid slot, so an absent entry and a zero entry are the
//! same thing in both representations.

use alloc::vec::Vec;
use log::trace;

use crate::mach_vm::swap_pager::{SwapDevice, SwapSlot};
use crate::mach_vm::vm_aobj::{AobjConfig, AobjError};

// ============================================================================
// Constants
// ============================================================================

/// log2 of the number of pages per hash cluster
pub const SWHASH_CLUSTER_SHIFT: u32 = 4;

/// Pages per hash cluster
pub const SWHASH_CLUSTER_SIZE: usize = 1 << SWHASH_CLUSTER_SHIFT;

/// Objects larger than this many pages use the hashed representation
pub const SWHASH_THRESHOLD: u64 = SWHASH_CLUSTER_SIZE as u64 * 4;

/// Upper bound on the bucket array
pub const SWHASH_MAX_BUCKETS: usize = 256;

/// Page indices of one scan batch
pub type SlotBatch = heapless::Vec<u64, SWHASH_CLUSTER_SIZE>;

/// Which representation an index uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapIndexKind {
    Flat,
    Hashed,
}

// ============================================================================
// Hashed Representation
// ============================================================================

/// One cluster of consecutive page indices
#[derive(Debug, Clone)]
struct SwapCluster {
    /// `page_index >> SWHASH_CLUSTER_SHIFT`
    tag: u64,
    /// Number of non-zero slots
    count: usize,
    slots: [SwapSlot; SWHASH_CLUSTER_SIZE],
}

impl SwapCluster {
    fn new(tag: u64) -> Self {
        Self {
            tag,
            count: 0,
            slots: [SwapSlot::NONE; SWHASH_CLUSTER_SIZE],
        }
    }

    fn base(&self) -> u64 {
        self.tag << SWHASH_CLUSTER_SHIFT
    }
}

#[derive(Debug)]
struct SwapHash {
    buckets: Vec<Vec<SwapCluster>>,
    mask: u64,
}

impl SwapHash {
    fn new(page_count: u64, max_buckets: usize) -> Result<Self, AobjError> {
        let wanted = (page_count >> SWHASH_CLUSTER_SHIFT).min(max_buckets as u64) as usize;
        let nbuckets = wanted.max(1).next_power_of_two();

        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(nbuckets)
            .map_err(|_| AobjError::ResourceShortage)?;
        buckets.resize_with(nbuckets, Vec::new);

        Ok(Self {
            buckets,
            mask: nbuckets as u64 - 1,
        })
    }

    fn bucket_of(&self, tag: u64) -> usize {
        (tag & self.mask) as usize
    }

    fn lookup(&self, idx: u64) -> SwapSlot {
        let tag = idx >> SWHASH_CLUSTER_SHIFT;
        self.buckets[self.bucket_of(tag)]
            .iter()
            .find(|c| c.tag == tag)
            .map(|c| c.slots[cluster_offset(idx)])
            .unwrap_or(SwapSlot::NONE)
    }

    fn store(&mut self, idx: u64, slot: SwapSlot) -> Result<SwapSlot, AobjError> {
        let tag = idx >> SWHASH_CLUSTER_SHIFT;
        let b = self.bucket_of(tag);
        let bucket = &mut self.buckets[b];

        let pos = match bucket.iter().position(|c| c.tag == tag) {
            Some(pos) => pos,
            // Clearing an entry that has no cluster is a no-op
            None if slot.is_none() => return Ok(SwapSlot::NONE),
            None => {
                bucket
                    .try_reserve(1)
                    .map_err(|_| AobjError::ResourceShortage)?;
                bucket.push(SwapCluster::new(tag));
                trace!("swap_index: new cluster tag={} bucket={}", tag, b);
                bucket.len() - 1
            }
        };

        let cluster = &mut bucket[pos];
        let off = cluster_offset(idx);
        let old = cluster.slots[off];
        cluster.slots[off] = slot;

        if old.is_none() && !slot.is_none() {
            cluster.count += 1;
        } else if !old.is_none() && slot.is_none() {
            cluster.count -= 1;
            if cluster.count == 0 {
                bucket.swap_remove(pos);
                trace!("swap_index: freed cluster tag={}", tag);
            }
        }
        Ok(old)
    }
}

fn cluster_offset(idx: u64) -> usize {
    (idx as usize) & (SWHASH_CLUSTER_SIZE - 1)
}

// ============================================================================
// Swap Index
// ============================================================================

#[derive(Debug)]
enum Slots {
    /// Object may never be given swap
    NoSwap,
    Flat(Vec<SwapSlot>),
    Hashed(SwapHash),
}

/// Page index to swap slot map for one anonymous object
#[derive(Debug)]
pub struct SwapIndex {
    page_count: u64,
    slots: Slots,
}

impl SwapIndex {
    /// Allocate an index for an object of `page_count` pages
    pub fn new(page_count: u64, config: &AobjConfig) -> Result<Self, AobjError> {
        let slots = if page_count > config.swhash_threshold {
            Slots::Hashed(SwapHash::new(page_count, config.swhash_max_buckets)?)
        } else {
            let len = page_count as usize;
            let mut flat = Vec::new();
            flat.try_reserve_exact(len)
                .map_err(|_| AobjError::ResourceShortage)?;
            flat.resize(len, SwapSlot::NONE);
            Slots::Flat(flat)
        };
        Ok(Self { page_count, slots })
    }

    /// Index for an object that may never be paged to swap
    pub const fn no_swap(page_count: u64) -> Self {
        Self {
            page_count,
            slots: Slots::NoSwap,
        }
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn is_no_swap(&self) -> bool {
        matches!(self.slots, Slots::NoSwap)
    }

    /// Representation in use, `None` for a no-swap index
    pub fn kind(&self) -> Option<SwapIndexKind> {
        match self.slots {
            Slots::NoSwap => None,
            Slots::Flat(_) => Some(SwapIndexKind::Flat),
            Slots::Hashed(_) => Some(SwapIndexKind::Hashed),
        }
    }

    /// Slot recorded for page `idx`, or [`SwapSlot::NONE`]
    pub fn find(&self, idx: u64) -> SwapSlot {
        if idx >= self.page_count {
            return SwapSlot::NONE;
        }
        match &self.slots {
            Slots::NoSwap => SwapSlot::NONE,
            Slots::Flat(flat) => flat[idx as usize],
            Slots::Hashed(hash) => hash.lookup(idx),
        }
    }

    /// Record `slot` for page `idx` and return the previous entry.
    ///
    /// Only a non-zero store into a hashed index can fail, when a new
    /// cluster cannot be allocated.
    ///
    /// # Panics
    ///
    /// Storing a non-zero slot in a no-swap index.
    pub fn set(&mut self, idx: u64, slot: SwapSlot) -> Result<SwapSlot, AobjError> {
        if idx >= self.page_count {
            return Err(AobjError::OutOfRange);
        }
        match &mut self.slots {
            Slots::NoSwap => {
                if slot.is_none() {
                    Ok(SwapSlot::NONE)
                } else {
                    panic!("swap_index: set {} at page {} of a no-swap object", slot, idx);
                }
            }
            Slots::Flat(flat) => Ok(core::mem::replace(&mut flat[idx as usize], slot)),
            Slots::Hashed(hash) => hash.store(idx, slot),
        }
    }

    /// Visit every non-zero entry with page index in `[lo, hi)`.
    /// `hi == 0` means the end of the object.
    pub fn for_each<F>(&self, lo: u64, hi: u64, mut f: F)
    where
        F: FnMut(u64, SwapSlot),
    {
        let hi = self.normalize_end(hi);
        match &self.slots {
            Slots::NoSwap => {}
            Slots::Flat(flat) => {
                for idx in lo..hi {
                    let slot = flat[idx as usize];
                    if !slot.is_none() {
                        f(idx, slot);
                    }
                }
            }
            Slots::Hashed(hash) => {
                for cluster in hash.buckets.iter().flatten() {
                    let base = cluster.base();
                    for (i, slot) in cluster.slots.iter().enumerate() {
                        let idx = base + i as u64;
                        if !slot.is_none() && idx >= lo && idx < hi {
                            f(idx, *slot);
                        }
                    }
                }
            }
        }
    }

    /// Clear every entry with page index in `[lo, hi)`, releasing real slots
    /// to the swap device. Returns how many slots were released.
    /// `hi == 0` means the end of the object.
    pub fn drop_range(&mut self, lo: u64, hi: u64, swap: &dyn SwapDevice) -> usize {
        let hi = self.normalize_end(hi);
        let mut released = 0;

        let mut release = |slot: &mut SwapSlot| {
            if slot.is_valid() {
                swap.free_slot(*slot, 1);
                released += 1;
            }
            *slot = SwapSlot::NONE;
        };

        match &mut self.slots {
            Slots::NoSwap => {}
            Slots::Flat(flat) => {
                for slot in &mut flat[lo.min(hi) as usize..hi as usize] {
                    release(slot);
                }
            }
            Slots::Hashed(hash) => {
                for bucket in hash.buckets.iter_mut() {
                    bucket.retain_mut(|cluster| {
                        let base = cluster.base();
                        if base >= hi || base + SWHASH_CLUSTER_SIZE as u64 <= lo {
                            return true;
                        }
                        for (i, slot) in cluster.slots.iter_mut().enumerate() {
                            let idx = base + i as u64;
                            if idx >= lo && idx < hi && !slot.is_none() {
                                release(slot);
                                cluster.count -= 1;
                            }
                        }
                        cluster.count > 0
                    });
                }
            }
        }
        released
    }

    /// Page indices of up to one cluster's worth of entries whose slot
    /// lies in `[lo, hi)`. Poisoned entries never match. Empty once no such
    /// entry remains; callers page in a batch and ask again.
    pub fn next_batch_in_slot_range(&self, lo: SwapSlot, hi: SwapSlot) -> SlotBatch {
        let mut batch = SlotBatch::new();
        self.for_each(0, 0, |idx, slot| {
            if slot.is_valid() && slot.in_range(lo, hi) {
                // Entries past the batch capacity are picked up next time
                let _ = batch.push(idx);
            }
        });
        batch
    }

    /// Number of non-zero entries
    pub fn count(&self) -> usize {
        match &self.slots {
            Slots::NoSwap => 0,
            Slots::Flat(flat) => flat.iter().filter(|s| !s.is_none()).count(),
            Slots::Hashed(hash) => hash.buckets.iter().flatten().map(|c| c.count).sum(),
        }
    }

    /// Number of allocated hash clusters (0 for other representations)
    pub fn cluster_count(&self) -> usize {
        match &self.slots {
            Slots::Hashed(hash) => hash.buckets.iter().map(Vec::len).sum(),
            _ => 0,
        }
    }

    fn normalize_end(&self, hi: u64) -> u64 {
        if hi == 0 || hi > self.page_count {
            self.page_count
        } else {
            hi
        }
    }
}
