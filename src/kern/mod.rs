//! Kernel services consumed by the VM layer
//!
//! Based on Mach4 kern/. Only the scheduling seam survives here; the
//! embedding kernel supplies the real scheduler.

pub mod sched_prim;

pub use sched_prim::{
    event_from_addr, Scheduler, SpinScheduler, WaitEvent, WaitReason, MEMORY_EVENT,
    PAGEOUT_EVENT,
};
