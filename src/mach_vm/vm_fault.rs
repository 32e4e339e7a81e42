//! VM Fault - Page Fault Handling
//!
//! Based on Mach4 vm/vm_fault.h/c
//! Resolves page faults by walking an object's shadow chain, bringing
//! pages in from pagers, performing copy-on-write and installing the
//! resulting translation.
//!
//! ## Fault Types
//!
//! - **Zero-fill**: nothing down the chain has the page; the top object
//!   gets a zeroed page
//! - **Page-in**: a pager supplies the page, possibly with neighbours
//! - **Copy-on-write**: a page found below the top object is copied up on
//!   write access
//!
//! ## Locking
//!
//! A fault holds at most one object lock at a time and none across a pager
//! call or a sleep. While following the chain it keeps a busy placeholder
//! page in the top object so a racing fault cannot enter a second page
//! there, and raises `paging_in_progress` on every object where it holds a
//! busy page so collapse leaves that object alone. Contended or starved
//! faults give everything back and start over from the map lookup.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::kern::sched_prim::{event_from_addr, WaitReason};
use crate::mach_vm::vm_map::{LookupGuard, VmMap, VmMapEntry, VmProt};
use crate::mach_vm::vm_object::{ObjectFlags, ObjectRef, PagingGuard, VmObject};
use crate::mach_vm::vm_page::{
    trunc_page, AllocError, BusyPage, PageFlags, PageManager, VmPage, PAGE_SIZE,
    VM_PAGE_BITS_ALL,
};
use crate::mach_vm::vm_pager::PagerResult;
use crate::mach_vm::VmSystem;

// ============================================================================
// Return Codes
// ============================================================================

/// Mach kernel return code
pub type KernReturn = i32;

pub const KERN_SUCCESS: KernReturn = 0;
pub const KERN_INVALID_ADDRESS: KernReturn = 1;
pub const KERN_PROTECTION_FAILURE: KernReturn = 2;
pub const KERN_FAILURE: KernReturn = 5;

/// Why a fault could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    /// Access not permitted by the mapping
    #[error("protection failure")]
    Protection,
    /// Offset beyond the end of the object or the pager's range
    #[error("offset out of range of object")]
    OutOfRange,
    /// Pager could not read the page
    #[error("pager I/O error")]
    Io,
    /// Nothing is mapped at the address
    #[error("no mapping at address")]
    InvalidAddress,
}

impl FaultError {
    /// Return code handed back to the trap handler
    pub fn kern_return(&self) -> KernReturn {
        match self {
            FaultError::Protection | FaultError::OutOfRange => KERN_PROTECTION_FAILURE,
            FaultError::Io => KERN_FAILURE,
            FaultError::InvalidAddress => KERN_INVALID_ADDRESS,
        }
    }
}

/// How a successful fault was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Pager I/O was needed
    Hard,
    /// Satisfied from memory
    Soft,
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Something worth counting happened during a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultEvent {
    Fault,
    Hard,
    Soft,
    ZeroFill,
    CopyOnWrite,
    PageBusyWait,
    MemoryWait,
    Failure(FaultError),
}

/// Receiver of fault events
pub trait FaultObserver: Send + Sync {
    fn record(&self, event: FaultEvent);
}

/// Fault statistics counters
#[derive(Debug, Default)]
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Faults that needed pager I/O
    pub hard: AtomicU64,
    /// Faults satisfied from memory
    pub soft: AtomicU64,
    /// Zero-fill faults
    pub zero_fill: AtomicU64,
    /// Copy-on-write faults
    pub cow: AtomicU64,
    /// Sleeps on a busy page
    pub busy_waits: AtomicU64,
    /// Sleeps for free memory
    pub memory_waits: AtomicU64,
    /// Failed faults
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            hard: AtomicU64::new(0),
            soft: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            cow: AtomicU64::new(0),
            busy_waits: AtomicU64::new(0),
            memory_waits: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn hard(&self) -> u64 {
        self.hard.load(Ordering::Relaxed)
    }

    pub fn soft(&self) -> u64 {
        self.soft.load(Ordering::Relaxed)
    }

    pub fn zero_fill(&self) -> u64 {
        self.zero_fill.load(Ordering::Relaxed)
    }

    pub fn cow(&self) -> u64 {
        self.cow.load(Ordering::Relaxed)
    }

    pub fn busy_waits(&self) -> u64 {
        self.busy_waits.load(Ordering::Relaxed)
    }

    pub fn memory_waits(&self) -> u64 {
        self.memory_waits.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl FaultObserver for FaultStats {
    fn record(&self, event: FaultEvent) {
        let counter = match event {
            FaultEvent::Fault => &self.total,
            FaultEvent::Hard => &self.hard,
            FaultEvent::Soft => &self.soft,
            FaultEvent::ZeroFill => &self.zero_fill,
            FaultEvent::CopyOnWrite => &self.cow,
            FaultEvent::PageBusyWait => &self.busy_waits,
            FaultEvent::MemoryWait => &self.memory_waits,
            FaultEvent::Failure(_) => &self.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Clustered Page-in
// ============================================================================

/// Pages read ahead of the faulting page
pub const VM_FAULT_READ_AHEAD: usize = 4;
/// Pages read behind the faulting page
pub const VM_FAULT_READ_BEHIND: usize = 3;
/// Largest cluster handed to a pager
pub const VM_FAULT_READ: usize = VM_FAULT_READ_AHEAD + VM_FAULT_READ_BEHIND + 1;

/// Byte range `[start, end)` of non-resident pages around `offset`
///
/// Scans back at most `behind` pages (stopping at a resident page or
/// offset 0) and forward at most `ahead` pages (stopping at a resident
/// page or `size`). The page at `offset` itself is always included.
pub fn cluster_window(
    offset: u64,
    size: u64,
    behind: usize,
    ahead: usize,
    resident: impl Fn(u64) -> bool,
) -> (u64, u64) {
    let page = PAGE_SIZE as u64;

    let behind = (behind as u64).min(offset / page);
    let mut start = offset;
    for i in 1..=behind {
        let candidate = offset - i * page;
        if resident(candidate) {
            break;
        }
        start = candidate;
    }

    let limit = size.min(offset + (ahead as u64 + 1) * page);
    let mut end = offset + page;
    while end < limit && !resident(end) {
        end += page;
    }

    (start, end)
}

/// Pages to fetch together with a faulted page
///
/// Slots are in offset order; the faulted page's slot is empty because
/// the fault already owns that page.
pub struct ClusterPlan {
    start: u64,
    slots: heapless::Vec<Option<BusyPage>, VM_FAULT_READ>,
    reqpage: usize,
}

impl ClusterPlan {
    fn single(offset: u64) -> Self {
        let mut slots = heapless::Vec::new();
        // Capacity is at least one.
        let _ = slots.push(None);
        Self {
            start: offset,
            slots,
            reqpage: 0,
        }
    }

    /// Number of pages in the cluster
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Index of the faulted page
    pub fn reqpage(&self) -> usize {
        self.reqpage
    }

    /// Object offsets covered, ascending
    pub fn offsets(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.slots.len() as u64).map(move |i| self.start + i * PAGE_SIZE as u64)
    }

    /// The cluster as a pager sees it, with `m` in the faulted slot
    fn pages<'a>(&'a self, m: &'a VmPage) -> heapless::Vec<&'a VmPage, VM_FAULT_READ> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Some(page) => &**page,
                None => m,
            })
            .collect()
    }

    fn into_neighbours(self) -> impl Iterator<Item = BusyPage> {
        self.slots.into_iter().flatten()
    }
}

// ============================================================================
// Fault Engine
// ============================================================================

/// Busy page in the top object that is freed unless claimed
struct Placeholder<'a> {
    page: Option<BusyPage>,
    pages: &'a PageManager,
}

impl<'a> Placeholder<'a> {
    fn empty(pages: &'a PageManager) -> Self {
        Self { page: None, pages }
    }

    fn set(&mut self, page: BusyPage) {
        if let Some(old) = self.page.replace(page) {
            self.pages.free(old);
        }
    }

    fn take(&mut self) -> Option<BusyPage> {
        self.page.take()
    }
}

impl Drop for Placeholder<'_> {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            self.pages.free(page);
        }
    }
}

/// What a fault attempt must wait for before starting over
enum RetryWait<'a> {
    /// Retry at once
    None,
    /// Sleep until `page` is not busy, holding only `hold`
    PageBusy {
        page: Arc<VmPage>,
        hold: ObjectRef<'a>,
    },
    /// Sleep until memory is freed
    Memory,
}

enum FaultStep<'a> {
    Done(Result<FaultOutcome, FaultError>),
    Retry(RetryWait<'a>),
}

enum Resident {
    Absent,
    Busy(Arc<VmPage>),
    Held(BusyPage),
}

impl VmSystem {
    /// Handle a page fault at `vaddr` needing `fault_type` access.
    ///
    /// With `change_wiring` the page is wired (or unwired) to match the
    /// map entry. On success exactly one page is installed at `vaddr` and
    /// left not busy.
    pub fn vm_fault(
        &self,
        map: &dyn VmMap,
        vaddr: u64,
        fault_type: VmProt,
        change_wiring: bool,
    ) -> Result<FaultOutcome, FaultError> {
        let vaddr = trunc_page(vaddr);
        self.observer.record(FaultEvent::Fault);

        loop {
            match self.fault_once(map, vaddr, fault_type, change_wiring) {
                FaultStep::Done(result) => {
                    self.observer.record(match result {
                        Ok(FaultOutcome::Hard) => FaultEvent::Hard,
                        Ok(FaultOutcome::Soft) => FaultEvent::Soft,
                        Err(err) => FaultEvent::Failure(err),
                    });
                    return result;
                }
                FaultStep::Retry(RetryWait::None) => {
                    log::debug!("vm_fault: retry at {:#x}", vaddr);
                }
                FaultStep::Retry(RetryWait::PageBusy { page, hold }) => {
                    self.observer.record(FaultEvent::PageBusyWait);
                    if page.set_wanted() {
                        self.sched
                            .block(event_from_addr(&*page), WaitReason::VmPage);
                    }
                    drop(hold);
                }
                FaultStep::Retry(RetryWait::Memory) => {
                    self.observer.record(FaultEvent::MemoryWait);
                    log::debug!("vm_fault: waiting for memory at {:#x}", vaddr);
                    self.vm_wait();
                }
            }
        }
    }

    /// One pass from map lookup to installed page.
    ///
    /// Locals are declared so that their reverse drop order gives the
    /// resources back in the order the fault took them.
    fn fault_once<'a>(
        &'a self,
        map: &'a dyn VmMap,
        vaddr: u64,
        mut fault_type: VmProt,
        change_wiring: bool,
    ) -> FaultStep<'a> {
        let lookup = match map.lookup(vaddr, fault_type) {
            Ok(lookup) => lookup,
            Err(err) => return FaultStep::Done(Err(err)),
        };
        let first_object = Arc::clone(&lookup.object);
        let first_offset = lookup.offset;
        let mut prot = lookup.protection;
        let mut wired = lookup.wired;

        let first_ref = self.objects.reference(&first_object);
        let mut lookup_guard = LookupGuard::new(map, lookup);
        if wired || change_wiring {
            fault_type = prot;
        }
        let mut first_pip = Some(first_object.begin_paging(&self.sched));
        let mut first_m = Placeholder::empty(&self.pages);
        let mut object_pip: Option<PagingGuard> = None;

        let mut object = Arc::clone(&first_object);
        let mut offset = first_offset;
        let mut hardfault = false;

        let mut m: BusyPage = loop {
            let is_top = Arc::ptr_eq(&object, &first_object);
            let pager_allowed = object.has_pager() && (!change_wiring || wired);

            let resident = {
                let state = object.lock_state();
                match state.pages.get(&offset) {
                    None => Resident::Absent,
                    Some(page) => match self.pages.try_busy(page) {
                        Some(busy) => Resident::Held(busy),
                        None => Resident::Busy(Arc::clone(page)),
                    },
                }
            };

            let page = match resident {
                Resident::Busy(page) => {
                    return FaultStep::Retry(RetryWait::PageBusy {
                        page,
                        hold: first_ref,
                    });
                }
                Resident::Held(page) => {
                    if page.has_flags(PageFlags::CACHE) && self.pages.reclaimable_headroom() <= 0
                    {
                        return FaultStep::Retry(RetryWait::Memory);
                    }
                    // Partial data is read again or replaced from below.
                    if !page.is_partially_valid() || object.is_kernel() {
                        break page;
                    }
                    Some(page)
                }
                Resident::Absent if pager_allowed || is_top => {
                    if offset >= object.size() {
                        if is_top {
                            return FaultStep::Done(Err(FaultError::OutOfRange));
                        }
                        None
                    } else {
                        match self.pages.alloc(&object, offset, false) {
                            Ok(page) => Some(page),
                            Err(AllocError::Exists) => return FaultStep::Retry(RetryWait::None),
                            Err(AllocError::NoMemory) => {
                                return FaultStep::Retry(RetryWait::Memory)
                            }
                        }
                    }
                }
                Resident::Absent => None,
            };

            if let Some(page) = page {
                let page = match object.pager().filter(|_| pager_allowed).cloned() {
                    Some(pager) => {
                        let plan = self.vm_fault_additional_pages(
                            &object,
                            offset,
                            self.config.read_behind,
                            self.config.read_ahead,
                        );
                        lookup_guard.release();

                        let rv = match &plan {
                            Some(plan) => {
                                pager.get_pages(&object, &plan.pages(&page), plan.reqpage())
                            }
                            None => PagerResult::Fail,
                        };
                        if let Some(plan) = plan {
                            self.release_neighbours(plan);
                        }

                        match rv {
                            PagerResult::Ok => {
                                // The pager may have put a different page there.
                                let current = object.page_lookup(offset);
                                let page = match current {
                                    Some(p) if Arc::ptr_eq(&p, page.page()) => page,
                                    Some(p) => {
                                        page.free(&self.pages);
                                        match self.pages.try_busy(&p) {
                                            Some(adopted) => adopted,
                                            None => {
                                                return FaultStep::Retry(RetryWait::PageBusy {
                                                    page: p,
                                                    hold: first_ref,
                                                })
                                            }
                                        }
                                    }
                                    None => {
                                        page.free(&self.pages);
                                        return FaultStep::Retry(RetryWait::None);
                                    }
                                };
                                self.phys.clear_modify(page.phys_addr);
                                hardfault = true;
                                break page;
                            }
                            PagerResult::Error if map.is_kernel() => {
                                panic!("vm_fault: pager I/O error on kernel map at {:#x}", vaddr);
                            }
                            PagerResult::Error | PagerResult::Bad => {
                                log::warn!(
                                    "vm_fault: pager {:?} for object {:?} offset {:#x}",
                                    rv,
                                    object.id,
                                    offset
                                );
                                page.free(&self.pages);
                                return FaultStep::Done(Err(if rv == PagerResult::Error {
                                    FaultError::Io
                                } else {
                                    FaultError::OutOfRange
                                }));
                            }
                            PagerResult::Fail => {
                                if is_top {
                                    Some(page)
                                } else {
                                    page.free(&self.pages);
                                    None
                                }
                            }
                        }
                    }
                    None => Some(page),
                };
                // Below the top a page the pager could not fill stays
                // where it is; only the top keeps a placeholder.
                match page {
                    Some(page) if is_top => first_m.set(page),
                    _ => {}
                }
            }

            // Move on to the next object down the chain.
            let next = {
                let state = object.lock_state();
                offset += state.backing_offset;
                state.backing.map(|id| match self.objects.lookup(id) {
                    Some(next) => {
                        let pip = next.begin_paging(&self.sched);
                        (next, pip)
                    }
                    None => panic!("vm_fault: backing object {:?} missing", id),
                })
            };

            match next {
                Some((next, pip)) => {
                    object_pip = Some(pip);
                    object = next;
                }
                None => {
                    if !Arc::ptr_eq(&object, &first_object) {
                        drop(object_pip.take());
                        object = Arc::clone(&first_object);
                        offset = first_offset;
                    }
                    let Some(page) = first_m.take() else {
                        panic!("vm_fault: no page in top object at {:#x}", vaddr);
                    };
                    if !page.has_flags(PageFlags::ZERO) {
                        page.zero_fill();
                    }
                    page.set_valid(VM_PAGE_BITS_ALL);
                    self.phys.clear_modify(page.phys_addr);
                    self.observer.record(FaultEvent::ZeroFill);
                    break page;
                }
            }
        };

        // The page was found below the top object.
        if !Arc::ptr_eq(&object, &first_object) {
            if fault_type.can_write() {
                let Some(copy) = first_m.take() else {
                    panic!("vm_fault: no copy page in top object at {:#x}", vaddr);
                };
                copy.copy_from(&m);
                copy.set_valid(VM_PAGE_BITS_ALL);
                self.phys.clear_modify(copy.phys_addr);

                if !m.has_flags(PageFlags::ACTIVE) {
                    self.pages.activate(&m);
                }
                self.phys.page_protect(m.phys_addr, VmProt::NONE);
                m.clear_flags(PageFlags::MAPPED | PageFlags::WRITEABLE);

                m = copy;
                drop(object_pip.take());
                object = Arc::clone(&first_object);
                offset = first_offset;
                self.observer.record(FaultEvent::CopyOnWrite);

                // Collapse needs our paging reference out of the way.
                drop(first_pip.take());
                self.objects.collapse(&first_object);
                first_pip.get_or_insert_with(|| first_object.begin_paging(&self.sched));
            } else {
                prot = prot.difference(VmProt::WRITE);
            }
        }

        // The map may have changed while the lookup was released.
        if !lookup_guard.is_held() {
            match map.lookup(vaddr, fault_type.difference(VmProt::WRITE)) {
                Err(err) => {
                    self.release_page(m);
                    return FaultStep::Done(Err(err));
                }
                Ok(relookup) => {
                    let moved = !Arc::ptr_eq(&relookup.object, &first_object)
                        || relookup.offset != first_offset;
                    let retry_prot = relookup.protection;
                    wired = relookup.wired;
                    lookup_guard.hold(relookup);
                    if moved {
                        self.release_page(m);
                        return FaultStep::Retry(RetryWait::None);
                    }
                    prot &= retry_prot;
                }
            }
        }

        if prot.can_write() {
            m.set_flags(PageFlags::WRITEABLE);
            object.set_flags(ObjectFlags::WRITEABLE | ObjectFlags::MIGHTBEDIRTY);
            if fault_type.can_write() {
                m.set_dirty(VM_PAGE_BITS_ALL);
            }
        }
        m.set_flags(PageFlags::MAPPED | PageFlags::REFERENCED);
        m.clear_flags(PageFlags::ZERO);

        map.pmap().enter(vaddr, m.phys_addr, prot, wired);
        log::trace!(
            "vm_fault: {:#x} -> {:#x} prot {:#x} offset {:#x}",
            vaddr,
            m.phys_addr,
            prot.bits(),
            offset
        );

        if change_wiring {
            if wired {
                self.pages.wire(&m);
            } else {
                self.pages.unwire(&m);
            }
        } else if !m.has_flags(PageFlags::ACTIVE) {
            self.pages.activate(&m);
        }

        FaultStep::Done(Ok(if hardfault {
            FaultOutcome::Hard
        } else {
            FaultOutcome::Soft
        }))
    }

    /// Wake waiters and leave the page where the pageout daemon finds it
    fn release_page(&self, m: BusyPage) {
        if !m.has_flags(PageFlags::ACTIVE) {
            self.pages.activate(&m);
        }
    }

    /// Settle the neighbours of a clustered page-in
    fn release_neighbours(&self, plan: ClusterPlan) {
        for page in plan.into_neighbours() {
            if page.is_fully_valid() {
                self.pages.deactivate(&page);
            } else {
                self.pages.free(page);
            }
        }
    }

    /// Wait for free memory (VM_WAIT)
    pub fn vm_wait(&self) {
        self.pageout.wakeup();
        self.pages.wait_for_memory();
    }

    /// Decide which pages to read together with the one at `offset`.
    ///
    /// The page at `offset` must already be resident and busy. Returns
    /// `None` if the pager does not have it. Neighbour placeholders are
    /// allocated busy; when memory is tight the plan is the single page.
    pub fn vm_fault_additional_pages(
        &self,
        object: &Arc<VmObject>,
        offset: u64,
        rbehind: usize,
        rahead: usize,
    ) -> Option<ClusterPlan> {
        let pager = object.pager()?;
        let extent = pager.has_page(object, offset)?;

        if extent.behind == 0 && extent.ahead == 0 {
            return Some(ClusterPlan::single(offset));
        }

        let rbehind = rbehind.min(extent.behind).min(VM_FAULT_READ - 1);
        let rahead = rahead.min(extent.ahead).min(VM_FAULT_READ - 1 - rbehind);

        if (rahead + rbehind) as i64 > self.pages.reclaimable_headroom() {
            self.pageout.wakeup();
            return Some(ClusterPlan::single(offset));
        }

        let (start, end) = {
            let state = object.lock_state();
            cluster_window(offset, state.size, rbehind, rahead, |o| {
                state.pages.contains_key(&o)
            })
        };
        let page = PAGE_SIZE as u64;
        let count = ((end - start) / page) as usize;
        let reqpage = ((offset - start) / page) as usize;

        if self.pages.reclaimable_headroom() <= count as i64 {
            return Some(ClusterPlan::single(offset));
        }

        let mut plan = ClusterPlan {
            start,
            slots: heapless::Vec::new(),
            reqpage,
        };
        for i in 0..count {
            let slot = if i == reqpage {
                None
            } else {
                match self.pages.alloc(object, start + i as u64 * page, false) {
                    Ok(busy) => Some(busy),
                    Err(_) if i < reqpage => {
                        for busy in plan.into_neighbours() {
                            self.pages.free(busy);
                        }
                        return Some(ClusterPlan::single(offset));
                    }
                    Err(_) => break,
                }
            };
            if let Err(Some(busy)) = plan.slots.push(slot) {
                self.pages.free(busy);
                break;
            }
        }
        Some(plan)
    }

    // ========================================================================
    // Wiring
    // ========================================================================

    /// Wire down a range of virtual addresses in a map.
    ///
    /// The map entries covering the range must already be marked wired.
    /// On failure everything wired so far is unwired again.
    pub fn vm_fault_wire(&self, map: &dyn VmMap, start: u64, end: u64) -> Result<(), FaultError> {
        map.pmap().pageable(start, end, false);

        let mut va = start;
        while va < end {
            while !self.sched.is_pageout_thread()
                && self.pages.free_count() <= self.pages.pageout_free_min()
            {
                self.vm_wait();
            }

            if let Err(err) = self.vm_fault(map, va, VmProt::READ | VmProt::WRITE, true) {
                if va != start {
                    self.vm_fault_unwire(map, start, va);
                }
                return Err(err);
            }
            va += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Unwire a range of virtual addresses in a map.
    ///
    /// Every page in the range must be mapped.
    pub fn vm_fault_unwire(&self, map: &dyn VmMap, start: u64, end: u64) {
        let pmap = map.pmap();

        for va in (start..end).step_by(PAGE_SIZE) {
            let Some(pa) = pmap.extract(va) else {
                panic!("unwire: page not in pmap");
            };
            pmap.change_wiring(va, false);
            let Some(page) = self.pages.page_for_phys(pa) else {
                panic!("unwire: no page for {:#x}", pa);
            };
            self.pages.unwire(page);
        }

        pmap.pageable(start, end, true);
    }

    // ========================================================================
    // Wired Region Copy
    // ========================================================================

    /// Copy the resident pages of a wired region into a fresh object.
    ///
    /// `dst_entry` gets a new anonymous object sized to it; every page is
    /// copied from the source entry's object and entered in `dst_map`
    /// with the destination's maximum protection.
    pub fn vm_fault_copy_entry(
        &self,
        dst_map: &dyn VmMap,
        dst_entry: &mut VmMapEntry,
        src_entry: &VmMapEntry,
    ) {
        let Some(src_object) = src_entry.object.as_ref() else {
            panic!("vm_fault_copy_wired: source entry has no object");
        };
        let src_offset = src_entry.offset;

        let dst_object = self.objects.allocate(dst_entry.size());
        if let Some(old) = dst_entry.object.replace(Arc::clone(&dst_object)) {
            self.objects.deallocate(&old);
        }
        dst_entry.offset = 0;
        let prot = dst_entry.max_protection;

        let mut dst_offset = 0;
        for vaddr in (dst_entry.start..dst_entry.end).step_by(PAGE_SIZE) {
            let dst_m = loop {
                match self.pages.alloc(&dst_object, dst_offset, false) {
                    Ok(page) => break page,
                    Err(AllocError::NoMemory) => self.vm_wait(),
                    Err(AllocError::Exists) => {
                        panic!("vm_fault_copy_wired: fresh object has page at {:#x}", dst_offset)
                    }
                }
            };

            let Some(src_m) = src_object.page_lookup(dst_offset + src_offset) else {
                panic!("vm_fault_copy_wired: page missing");
            };

            dst_m.copy_from(&src_m);
            dst_m.set_valid(VM_PAGE_BITS_ALL);
            dst_m.set_dirty(VM_PAGE_BITS_ALL);
            dst_m.set_flags(PageFlags::WRITEABLE | PageFlags::MAPPED);
            dst_m.clear_flags(PageFlags::ZERO);

            dst_map.pmap().enter(vaddr, dst_m.phys_addr, prot, false);
            self.pages.activate(&dst_m);

            dst_offset += PAGE_SIZE as u64;
        }
    }

    // ========================================================================
    // Prefault
    // ========================================================================

    /// Read-fault every unmapped page of a range, ignoring failures.
    ///
    /// Returns the number of pages brought in.
    pub fn vm_fault_prefault(&self, map: &dyn VmMap, start: u64, end: u64) -> usize {
        (trunc_page(start)..end)
            .step_by(PAGE_SIZE)
            .filter(|&va| map.pmap().extract(va).is_none())
            .filter(|&va| self.vm_fault(map, va, VmProt::READ, false).is_ok())
            .count()
    }
}
