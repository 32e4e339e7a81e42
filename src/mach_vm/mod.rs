//! Mach Virtual Memory Subsystem
//!
//! Based on Mach4 vm/ subsystem.
//! Provides the page-fault path and what it stands on:
//! - vm_page: Physical page pool, queues and the busy protocol
//! - vm_object: Memory objects, shadow chains and collapse
//! - vm_map: Address space lookup
//! - pmap: Physical map (translation installation)
//! - vm_pager: Backing store contract
//! - vm_pageout: Page daemon for memory reclamation
//! - vm_fault: Fault resolution, wiring and wired-region copy

pub mod pmap;
pub mod vm_fault;
pub mod vm_map;
pub mod vm_object;
pub mod vm_page;
pub mod vm_pageout;
pub mod vm_pager;

use alloc::sync::Arc;

pub use pmap::{PhysMap, Pmap, PmapId, PvTable, SoftPmap};
pub use vm_fault::{
    cluster_window, ClusterPlan, FaultError, FaultEvent, FaultObserver, FaultOutcome,
    FaultStats, KernReturn,
};
pub use vm_map::{LookupGuard, MapError, MapLookup, SimpleMap, VmMap, VmMapEntry, VmProt};
pub use vm_object::{ObjectFlags, ObjectManager, ObjectRef, PagingGuard, VmObject, VmObjectId};
pub use vm_page::{BusyPage, PageFlags, PageManager, PageQueueType, VmPage, PAGE_SIZE};
pub use vm_pageout::PageoutDaemon;
pub use vm_pager::{MemoryPager, Pager, PagerExtent, PagerResult};

use crate::kern::sched_prim::Scheduler;

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for a VM instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Physical address of the first frame
    pub memory_start: u64,
    /// Number of frames in the pool
    pub page_count: usize,
    /// Free frames only privileged allocations may take
    pub free_reserved: u32,
    /// Wiring stalls while free frames are at or below this
    pub pageout_free_min: u32,
    /// Pages to read behind a faulted page
    pub read_behind: usize,
    /// Pages to read ahead of a faulted page
    pub read_ahead: usize,
}

impl VmConfig {
    /// Defaults for a pool of `page_count` frames at address 0
    pub fn with_pages(page_count: usize) -> Self {
        Self {
            memory_start: 0,
            page_count,
            free_reserved: (page_count / 20) as u32,
            pageout_free_min: (page_count / 50) as u32,
            read_behind: vm_fault::VM_FAULT_READ_BEHIND,
            read_ahead: vm_fault::VM_FAULT_READ_AHEAD,
        }
    }

    /// Defaults for the physical range `[start, end)`
    pub fn with_memory(start: u64, end: u64) -> Self {
        let start = vm_page::round_page(start);
        let end = vm_page::trunc_page(end);
        let pages = (end.saturating_sub(start) / PAGE_SIZE as u64) as usize;
        Self {
            memory_start: start,
            ..Self::with_pages(pages)
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::with_pages(1024)
    }
}

// ============================================================================
// VM Instance
// ============================================================================

/// One virtual memory system: page pool, objects, pageout and fault path
pub struct VmSystem {
    pub(crate) config: VmConfig,
    pub(crate) sched: Arc<dyn Scheduler>,
    pub(crate) pages: Arc<PageManager>,
    pub(crate) objects: ObjectManager,
    pub(crate) phys: Arc<dyn PhysMap>,
    pub(crate) pageout: PageoutDaemon,
    pub(crate) observer: Arc<dyn FaultObserver>,
}

impl VmSystem {
    /// Build a VM over a fresh page pool.
    ///
    /// `phys` revokes mappings by physical page and must see every pmap
    /// faults will enter translations into.
    pub fn new(config: VmConfig, sched: Arc<dyn Scheduler>, phys: Arc<dyn PhysMap>) -> Self {
        let pages = Arc::new(PageManager::init_with_memory(&config, Arc::clone(&sched)));
        let objects = ObjectManager::new(Arc::clone(&pages));
        let pageout = PageoutDaemon::new(Arc::clone(&sched), Arc::clone(&phys));

        log::info!(
            "vm: {} pages at {:#x}, reserve {}, free min {}",
            config.page_count,
            config.memory_start,
            config.free_reserved,
            config.pageout_free_min
        );

        Self {
            config,
            sched,
            pages,
            objects,
            phys,
            pageout,
            observer: Arc::new(FaultStats::new()),
        }
    }

    /// Send fault events to `observer` instead of the built-in counters
    pub fn with_observer(mut self, observer: Arc<dyn FaultObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.sched
    }

    /// Physical page pool
    pub fn pages(&self) -> &Arc<PageManager> {
        &self.pages
    }

    /// Object arena
    pub fn objects(&self) -> &ObjectManager {
        &self.objects
    }

    pub fn pageout(&self) -> &PageoutDaemon {
        &self.pageout
    }

    pub fn phys_map(&self) -> &Arc<dyn PhysMap> {
        &self.phys
    }

    pub fn observer(&self) -> &Arc<dyn FaultObserver> {
        &self.observer
    }

    /// Run one pageout pass
    pub fn run_pageout(&self) -> u32 {
        self.pageout.run_iteration(&self.pages)
    }
}
