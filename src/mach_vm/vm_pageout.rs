//! Page Daemon (Pageout)
//!
//! Based on Mach4 vm/vm_pageout.h/c by Avadis Tevanian, Jr. (1986)
//!
//! The daemon keeps frames available for the fault path:
//! - Moves unreferenced active pages to the inactive queue
//! - Moves clean, unreferenced inactive pages to the cache queue
//! - Frees cached pages until the free target is met
//!
//! Dirty pages stay where they are; writing them back belongs to the
//! pager. The fault handler wakes the daemon when it runs short.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::kern::sched_prim::{Scheduler, WaitReason, PAGEOUT_EVENT};
use crate::mach_vm::pmap::PhysMap;
use crate::mach_vm::vm_map::VmProt;
use crate::mach_vm::vm_page::{PageFlags, PageManager, PageQueueType, VM_PAGE_BITS_ALL};

// ============================================================================
// Pageout Constants
// ============================================================================

/// Number of pages to scan per pageout iteration
pub const PAGEOUT_BURST: usize = 32;

// ============================================================================
// Pageout Statistics
// ============================================================================

/// Pageout statistics
#[derive(Debug, Default)]
pub struct PageoutStats {
    /// Pages scanned
    pub scanned: AtomicU64,
    /// Pages reclaimed (freed)
    pub reclaimed: AtomicU64,
    /// Pages moved to the cache queue
    pub cached: AtomicU64,
    /// Pages moved to inactive
    pub deactivated: AtomicU64,
    /// Pages reactivated (referenced while inactive)
    pub reactivated: AtomicU64,
    /// Pages skipped (busy/wired/dirty)
    pub skipped: AtomicU64,
    /// Daemon wakeups
    pub wakeups: AtomicU64,
}

impl PageoutStats {
    pub fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// Pageout Daemon State
// ============================================================================

/// Pageout daemon state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DaemonState {
    /// Daemon sleeping (waiting for work)
    Sleeping = 0,
    /// Daemon running (scanning pages)
    Running = 1,
}

// ============================================================================
// Pageout Daemon
// ============================================================================

/// The pageout daemon
pub struct PageoutDaemon {
    /// Daemon state
    state: Mutex<DaemonState>,

    /// Someone asked for pages since the last scan
    wanted: AtomicBool,

    /// Statistics
    pub stats: PageoutStats,

    sched: Arc<dyn Scheduler>,

    /// Used to revoke mappings before a page is cached
    phys: Arc<dyn PhysMap>,
}

impl PageoutDaemon {
    /// Create a new pageout daemon
    pub fn new(sched: Arc<dyn Scheduler>, phys: Arc<dyn PhysMap>) -> Self {
        Self {
            state: Mutex::new(DaemonState::Sleeping),
            wanted: AtomicBool::new(false),
            stats: PageoutStats::new(),
            sched,
            phys,
        }
    }

    /// Wake up the daemon (pagedaemon_wakeup)
    pub fn wakeup(&self) {
        self.stats.wakeups.fetch_add(1, Ordering::Relaxed);
        self.wanted.store(true, Ordering::SeqCst);
        self.sched.wakeup(PAGEOUT_EVENT);
    }

    /// Has a wakeup arrived since the last scan?
    pub fn is_wanted(&self) -> bool {
        self.wanted.load(Ordering::SeqCst)
    }

    /// Number of wakeups so far
    pub fn wakeups(&self) -> u64 {
        self.stats.wakeups.load(Ordering::Relaxed)
    }

    /// Get current state
    pub fn state(&self) -> DaemonState {
        *self.state.lock()
    }

    /// Sleep until woken
    pub fn wait_for_work(&self) {
        while !self.is_wanted() {
            self.sched.block(PAGEOUT_EVENT, WaitReason::Pageout);
        }
    }

    /// Free-page level the daemon works towards
    fn free_target(pm: &PageManager) -> u32 {
        pm.free_reserved() + pm.pageout_free_min() + 1
    }

    /// Run one iteration of the pageout daemon
    ///
    /// Returns the number of pages freed.
    pub fn run_iteration(&self, pm: &PageManager) -> u32 {
        *self.state.lock() = DaemonState::Running;
        self.wanted.store(false, Ordering::SeqCst);

        self.scan_active_pages(pm);
        self.scan_inactive_pages(pm);
        let reclaimed = self.free_cached_pages(pm);

        self.stats
            .reclaimed
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
        *self.state.lock() = DaemonState::Sleeping;
        log::debug!(
            "vm_pageout: freed {} pages, {} free, {} cached",
            reclaimed,
            pm.free_count(),
            pm.cache_count()
        );
        reclaimed
    }

    /// Clear reference bits on active pages; unreferenced ones go inactive
    fn scan_active_pages(&self, pm: &PageManager) {
        for page in pm
            .queue_snapshot(PageQueueType::Active)
            .into_iter()
            .take(PAGEOUT_BURST)
        {
            self.stats.scanned.fetch_add(1, Ordering::Relaxed);
            let Some(busy) = pm.try_busy(&page) else {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            if busy.is_wired() {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            } else if busy.has_flags(PageFlags::REFERENCED) {
                // Second chance
                busy.clear_flags(PageFlags::REFERENCED);
            } else {
                pm.deactivate(&busy);
                self.stats.deactivated.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Move clean inactive pages to the cache queue
    ///
    /// A page stored to through a writable mapping counts as dirty even
    /// if the fault that mapped it was a read.
    fn scan_inactive_pages(&self, pm: &PageManager) {
        for page in pm
            .queue_snapshot(PageQueueType::Inactive)
            .into_iter()
            .take(PAGEOUT_BURST)
        {
            self.stats.scanned.fetch_add(1, Ordering::Relaxed);
            let Some(busy) = pm.try_busy(&page) else {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            // vm_page_test_dirty
            if busy.dirty() == 0 && self.phys.is_modified(busy.phys_addr) {
                busy.set_dirty(VM_PAGE_BITS_ALL);
            }
            if busy.is_wired() || busy.dirty() != 0 {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            } else if busy.has_flags(PageFlags::REFERENCED) {
                busy.clear_flags(PageFlags::REFERENCED);
                pm.activate(&busy);
                self.stats.reactivated.fetch_add(1, Ordering::Relaxed);
            } else {
                self.phys.page_protect(busy.phys_addr, VmProt::NONE);
                busy.clear_flags(PageFlags::MAPPED | PageFlags::WRITEABLE);
                pm.cache(&busy);
                self.stats.cached.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Free cached pages until the free target is met
    fn free_cached_pages(&self, pm: &PageManager) -> u32 {
        let target = Self::free_target(pm);
        let mut freed = 0;
        for page in pm.queue_snapshot(PageQueueType::Cache) {
            if pm.free_count() >= target {
                break;
            }
            if let Some(busy) = pm.try_busy(&page) {
                // Re-check under busy: a fault may have pulled it off the cache.
                if busy.queue() == PageQueueType::Cache {
                    pm.free(busy);
                    freed += 1;
                }
            }
        }
        freed
    }
}
