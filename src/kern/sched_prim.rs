//! Scheduling Primitives - Wait/Wakeup seam for the VM layer
//!
//! Based on Mach4 kern/sched_prim.h/c
//!
//! The fault path never owns a scheduler. It blocks and wakes through the
//! [`Scheduler`] trait so the embedding kernel decides what "sleep" means.
//! A return from [`Scheduler::block`] is only a hint that something changed:
//! callers always re-check the condition they slept on.

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Wait Events
// ============================================================================

/// Event that threads can wait on
/// In Mach, this is typically a pointer cast to an integer
pub type WaitEvent = u64;

/// Special value indicating no event
pub const EVENT_NULL: WaitEvent = 0;

/// Free memory became available (vm_page_free wakes this)
pub const MEMORY_EVENT: WaitEvent = 1;

/// The pageout daemon was asked to run
pub const PAGEOUT_EVENT: WaitEvent = 2;

/// Create an event from a pointer/address
pub fn event_from_addr<T>(addr: &T) -> WaitEvent {
    addr as *const T as usize as WaitEvent
}

/// Wait reason (for debugging/statistics)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WaitReason {
    /// No reason
    None = 0,
    /// Waiting for a busy VM page
    VmPage = 1,
    /// Waiting for free memory
    Memory = 2,
    /// Waiting for paging_in_progress to drain on an object
    ObjectPaging = 3,
    /// Pageout daemon idle
    Pageout = 4,
}

// ============================================================================
// Scheduler Seam
// ============================================================================

/// Blocking and wakeup as seen by the VM layer
pub trait Scheduler: Send + Sync {
    /// Give up the processor until `event` is posted (or spuriously).
    fn block(&self, event: WaitEvent, reason: WaitReason);

    /// Wake every thread blocked on `event`.
    fn wakeup(&self, event: WaitEvent);

    /// Is the calling thread the one that reclaims memory?
    ///
    /// Wiring must never park the pageout thread waiting for itself.
    fn is_pageout_thread(&self) -> bool {
        false
    }
}

// ============================================================================
// Spin Scheduler
// ============================================================================

/// Spin iterations before a blocked thread gives up and re-checks
pub const SPIN_LIMIT: u32 = 1 << 12;

/// Scheduler for environments without a run queue
///
/// Every wakeup bumps a generation counter; a blocked thread spins until
/// the generation moves or [`SPIN_LIMIT`] iterations pass. Both outcomes
/// look the same to the caller, which re-checks its condition anyway.
#[derive(Debug, Default)]
pub struct SpinScheduler {
    generation: AtomicU64,
    blocks: AtomicU64,
}

impl SpinScheduler {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
        }
    }

    /// Number of times a thread blocked
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

impl Scheduler for SpinScheduler {
    fn block(&self, _event: WaitEvent, _reason: WaitReason) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        let seen = self.generation.load(Ordering::Acquire);
        for _ in 0..SPIN_LIMIT {
            if self.generation.load(Ordering::Acquire) != seen {
                return;
            }
            core::hint::spin_loop();
        }
    }

    fn wakeup(&self, _event: WaitEvent) {
        self.generation.fetch_add(1, Ordering::Release);
    }
}
