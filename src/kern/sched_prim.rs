//! Scheduling Primitives - Wait/Wakeup on Events
//!
//! Based on Mach4 kern/sched_prim.h/c
//!
//! Mach blocks a thread with the `assert_wait()` / `thread_block()` pair and
//! releases it with `thread_wakeup()`. Here each sleepable resource embeds its
//! own [`WaitEvent`], so a wakeup only disturbs threads waiting on that
//! resource. The event is a generation number: `assert_wait()` records the
//! current generation, and `thread_block()` returns once a wakeup has moved
//! it on (or the caller's own condition says there is nothing to wait for).
//!
//! There is no run queue at this layer, so blocking spins with a CPU hint
//! instead of parking the thread on a wait queue. A waiter keeps its CPU
//! until the page owner unbusies the page, so busy periods must stay short
//! (one swap read). A kernel with a scheduler should park the thread on the
//! event and wake it from `thread_wakeup()`.

use core::sync::atomic::{AtomicU32, Ordering};
use log::trace;

// ============================================================================
// Wait Results
// ============================================================================

/// Result of a wait operation (from Mach4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WaitResult {
    /// Thread was awakened by `thread_wakeup()`
    Normal = 0,
    /// The condition cleared before any wakeup was posted
    Abnormal = 1,
}

/// Wait reason (for debugging/statistics)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WaitReason {
    /// No reason
    None = 0,
    /// Waiting for a busy VM page
    VmPage = 3,
    /// Waiting for free memory
    VmMemory = 8,
}

// ============================================================================
// Wait Event
// ============================================================================

/// Token returned by [`WaitEvent::assert_wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTicket(u32);

/// A wakeup channel embedded in a sleepable object
#[derive(Debug, Default)]
pub struct WaitEvent {
    generation: AtomicU32,
}

impl WaitEvent {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
        }
    }

    /// Declare intent to wait. Must be called while the condition being
    /// waited for is still known to hold (normally under the owner's lock).
    pub fn assert_wait(&self) -> WaitTicket {
        WaitTicket(self.generation.load(Ordering::SeqCst))
    }

    /// Block until a wakeup is posted after `ticket` was taken, or until
    /// `still_blocked` reports the condition is gone.
    ///
    /// The caller must not hold any lock the waker needs.
    pub fn thread_block<F>(&self, ticket: WaitTicket, reason: WaitReason, still_blocked: F) -> WaitResult
    where
        F: Fn() -> bool,
    {
        trace!("thread_block: reason={:?}", reason);
        loop {
            if self.generation.load(Ordering::SeqCst) != ticket.0 {
                return WaitResult::Normal;
            }
            if !still_blocked() {
                return WaitResult::Abnormal;
            }
            core::hint::spin_loop();
        }
    }

    /// Wake every thread waiting on this event
    pub fn thread_wakeup(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}
