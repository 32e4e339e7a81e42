//! Shared fixtures for the fault integration tests

#![allow(dead_code)]

use std::sync::Arc;

use mach_fault::kern::sched_prim::{Scheduler, SpinScheduler};
use mach_fault::mach_vm::pmap::PvTable;
use mach_fault::mach_vm::vm_page::{PAGE_SIZE, VM_PAGE_BITS_ALL};
use mach_fault::mach_vm::{FaultStats, SimpleMap, VmConfig, VmMapEntry, VmObject, VmProt, VmSystem};

pub const PAGE: u64 = PAGE_SIZE as u64;

/// Base of the test mappings
pub const BASE: u64 = 0x10_0000;

/// Address of page `n` of the test mapping
pub fn va(n: u64) -> u64 {
    BASE + n * PAGE
}

/// A VM instance plus the pieces tests inspect
pub struct Harness {
    pub sys: VmSystem,
    pub pv: Arc<PvTable>,
    pub stats: Arc<FaultStats>,
}

impl Harness {
    /// `pages` frames, no reserve
    pub fn new(pages: usize) -> Self {
        let mut config = VmConfig::with_pages(pages);
        config.free_reserved = 0;
        config.pageout_free_min = 0;
        Self::with_config(config, Arc::new(SpinScheduler::new()))
    }

    pub fn with_config(config: VmConfig, sched: Arc<dyn Scheduler>) -> Self {
        let pv = Arc::new(PvTable::new());
        let stats = Arc::new(FaultStats::new());
        let sys = VmSystem::new(config, sched, pv.clone()).with_observer(stats.clone());
        Self { sys, pv, stats }
    }

    /// An empty user map on its own pmap
    pub fn map(&self) -> SimpleMap {
        SimpleMap::new(self.pv.create_pmap())
    }

    /// Map `object` at [`BASE`] for `pages` pages
    pub fn map_object(&self, object: &Arc<VmObject>, pages: u64, prot: VmProt) -> SimpleMap {
        let map = self.map();
        map.enter(
            VmMapEntry::new(BASE, BASE + pages * PAGE, Some(Arc::clone(object)), 0)
                .with_protection(prot),
        )
        .expect("enter entry");
        map
    }

    /// Make page `n` of `object` resident, valid and filled with `byte`
    pub fn populate(&self, object: &Arc<VmObject>, n: u64, byte: u8) {
        let page = self
            .sys
            .pages()
            .alloc(object, n * PAGE, false)
            .expect("alloc page");
        page.write(0, &vec![byte; PAGE_SIZE]);
        page.set_valid(VM_PAGE_BITS_ALL);
        self.sys.pages().activate(&page);
    }
}

/// First byte of the frame mapped at `vaddr`
pub fn byte_at(h: &Harness, map: &SimpleMap, vaddr: u64) -> u8 {
    let entry = map.soft_pmap().mapping(vaddr).expect("mapped");
    let page = h.sys.pages().page_for_phys(entry.phys).expect("frame");
    let mut buf = [0u8; 1];
    page.read(0, &mut buf);
    buf[0]
}

/// Store `byte` at `vaddr` through its translation, as a user store would
pub fn store_byte(h: &Harness, map: &SimpleMap, vaddr: u64, byte: u8) {
    let pa = map.soft_pmap().store(vaddr).expect("writable mapping");
    let page = h.sys.pages().page_for_phys(pa).expect("frame");
    page.write((pa % PAGE) as usize, &[byte]);
}
