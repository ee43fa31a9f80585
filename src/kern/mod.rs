//! Kern subsystem - Core kernel primitives
//!
//! Based on Mach4 kern/ directory
//! Contains the wait/wakeup primitive and statistics counters used by the
//! VM subsystem.

pub mod counters;
pub mod sched_prim;

pub use counters::{AobjCounters, CounterSnapshot, MachCounter};
pub use sched_prim::{WaitEvent, WaitReason, WaitResult, WaitTicket};
