//! Kernel Performance Counters
//!
//! Based on Mach4 kern/counters.h/c by CMU (1987-1991)
//!
//! Counters for the anonymous memory object pager. Each pager instance
//! owns one [`AobjCounters`] block so independent managers (and tests)
//! never share totals.

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Mach counter type (atomically updated)
#[derive(Debug)]
pub struct MachCounter {
    value: AtomicU64,
    name: &'static str,
}

impl MachCounter {
    /// Create a new counter
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment counter by n
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero
    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    /// Get counter name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// Counter Macros (compile-time switchable)
// ============================================================================

/// Whether counters are enabled
pub const MACH_COUNTERS_ENABLED: bool = true;

/// Increment counter (only if counters enabled)
#[macro_export]
macro_rules! counter {
    ($counter:expr) => {
        if $crate::kern::counters::MACH_COUNTERS_ENABLED {
            $counter.inc();
        }
    };
    ($counter:expr, $n:expr) => {
        if $crate::kern::counters::MACH_COUNTERS_ENABLED {
            $counter.add($n as u64);
        }
    };
}

// ============================================================================
// Anonymous Object Counters
// ============================================================================

/// Event counters for one anonymous object manager
#[derive(Debug)]
pub struct AobjCounters {
    pub objects_created: MachCounter,
    pub objects_destroyed: MachCounter,
    pub zero_fills: MachCounter,
    pub swap_pageins: MachCounter,
    pub swap_io_errors: MachCounter,
    pub busy_waits: MachCounter,
    /// Slots released for pages that lived only in swap
    pub swap_only_released: MachCounter,
    pub swapoff_pageins: MachCounter,
}

impl AobjCounters {
    pub const fn new() -> Self {
        Self {
            objects_created: MachCounter::new("aobj_created"),
            objects_destroyed: MachCounter::new("aobj_destroyed"),
            zero_fills: MachCounter::new("aobj_zero_fill"),
            swap_pageins: MachCounter::new("aobj_swap_pagein"),
            swap_io_errors: MachCounter::new("aobj_swap_io_error"),
            busy_waits: MachCounter::new("aobj_busy_wait"),
            swap_only_released: MachCounter::new("aobj_swap_only_released"),
            swapoff_pageins: MachCounter::new("aobj_swapoff_pagein"),
        }
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            objects_created: self.objects_created.get(),
            objects_destroyed: self.objects_destroyed.get(),
            zero_fills: self.zero_fills.get(),
            swap_pageins: self.swap_pageins.get(),
            swap_io_errors: self.swap_io_errors.get(),
            busy_waits: self.busy_waits.get(),
            swap_only_released: self.swap_only_released.get(),
            swapoff_pageins: self.swapoff_pageins.get(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for c in [
            &self.objects_created,
            &self.objects_destroyed,
            &self.zero_fills,
            &self.swap_pageins,
            &self.swap_io_errors,
            &self.busy_waits,
            &self.swap_only_released,
            &self.swapoff_pageins,
        ] {
            c.reset();
        }
    }
}

/// Plain-value copy of [`AobjCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub objects_created: u64,
    pub objects_destroyed: u64,
    pub zero_fills: u64,
    pub swap_pageins: u64,
    pub swap_io_errors: u64,
    pub busy_waits: u64,
    pub swap_only_released: u64,
    pub swapoff_pageins: u64,
}
