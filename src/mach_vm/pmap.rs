//! Physical Map (pmap) - Translation Layer Contract
//!
//! Based on Mach4 vm/pmap.h/c
//!
//! The fault handler talks to hardware translation through two seams:
//!
//! - [`Pmap`]: per address space (`pmap_enter`, `pmap_extract`,
//!   `pmap_change_wiring`, `pmap_pageable`)
//! - [`PhysMap`]: per physical page across every address space
//!   (`pmap_page_protect`, `pmap_is_modified`, `pmap_clear_modify`)
//!
//! [`SoftPmap`] and [`PvTable`] implement both in software so the fault
//! path can be driven without real page tables.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::mach_vm::vm_map::VmProt;
use crate::mach_vm::vm_page::trunc_page;

// ============================================================================
// Translation Contracts
// ============================================================================

/// Address-space translation operations used by the fault handler
pub trait Pmap: Send + Sync {
    /// Install `vaddr -> phys` with `prot`, replacing any prior mapping.
    fn enter(&self, vaddr: u64, phys: u64, prot: VmProt, wired: bool);

    /// Physical address currently mapped at `vaddr`
    fn extract(&self, vaddr: u64) -> Option<u64>;

    /// Set the wired attribute of an existing mapping
    fn change_wiring(&self, vaddr: u64, wired: bool);

    /// Hint that `[start, end)` may (or may not) be paged
    fn pageable(&self, _start: u64, _end: u64, _pageable: bool) {}
}

/// Physical-page operations spanning all address spaces
pub trait PhysMap: Send + Sync {
    /// Lower the protection of every mapping of `phys` to `prot`.
    ///
    /// `VmProt::NONE` removes the mappings.
    fn page_protect(&self, phys: u64, prot: VmProt);

    /// Has `phys` been stored to through any translation?
    fn is_modified(&self, phys: u64) -> bool;

    /// Forget earlier stores to `phys`
    fn clear_modify(&self, phys: u64);
}

// ============================================================================
// Pmap ID
// ============================================================================

/// Pmap identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PmapId(pub u64);

impl PmapId {
    pub const KERNEL: Self = Self(1);
}

// ============================================================================
// Pmap Statistics
// ============================================================================

/// Statistics for a pmap
#[derive(Debug, Default)]
pub struct PmapStats {
    /// Number of resident pages
    pub resident_count: AtomicU32,
    /// Number of wired pages
    pub wired_count: AtomicU32,
}

impl PmapStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resident(&self) -> u32 {
        self.resident_count.load(Ordering::Relaxed)
    }

    pub fn wired(&self) -> u32 {
        self.wired_count.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Software Pmap
// ============================================================================

/// One translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmapEntry {
    pub phys: u64,
    pub prot: VmProt,
    pub wired: bool,
    /// Hardware modified bit
    pub modified: bool,
}

/// Translation table kept in a map instead of hardware page tables
pub struct SoftPmap {
    /// Pmap identifier
    pub id: PmapId,

    /// Statistics
    pub stats: PmapStats,

    /// virt_page -> entry
    mappings: Mutex<BTreeMap<u64, PmapEntry>>,

    /// Number of `pmap_enter` calls
    enters: AtomicU64,
}

impl SoftPmap {
    /// Create a new pmap
    pub fn new(id: PmapId) -> Self {
        Self {
            id,
            stats: PmapStats::new(),
            mappings: Mutex::new(BTreeMap::new()),
            enters: AtomicU64::new(0),
        }
    }

    /// Translation installed at `vaddr`
    pub fn mapping(&self, vaddr: u64) -> Option<PmapEntry> {
        self.mappings.lock().get(&trunc_page(vaddr)).copied()
    }

    /// Protection of the mapping at `vaddr`
    pub fn protection(&self, vaddr: u64) -> Option<VmProt> {
        self.mapping(vaddr).map(|e| e.prot)
    }

    /// Is `vaddr` mapped and wired?
    pub fn is_wired(&self, vaddr: u64) -> bool {
        self.mapping(vaddr).is_some_and(|e| e.wired)
    }

    /// Check if a virtual address is mapped
    pub fn is_mapped(&self, vaddr: u64) -> bool {
        self.mapping(vaddr).is_some()
    }

    /// A store through the mapping at `vaddr`, as the MMU would see it.
    ///
    /// Sets the modified bit and returns the physical address, or `None`
    /// if the mapping is missing or read-only.
    pub fn store(&self, vaddr: u64) -> Option<u64> {
        let mut mappings = self.mappings.lock();
        let entry = mappings.get_mut(&trunc_page(vaddr))?;
        if !entry.prot.can_write() {
            return None;
        }
        entry.modified = true;
        Some(entry.phys | (vaddr & (crate::mach_vm::vm_page::PAGE_SIZE as u64 - 1)))
    }

    /// Remove a mapping
    pub fn remove(&self, vaddr: u64) {
        if let Some(old) = self.mappings.lock().remove(&trunc_page(vaddr)) {
            self.stats.resident_count.fetch_sub(1, Ordering::Relaxed);
            if old.wired {
                self.stats.wired_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of `enter` calls so far
    pub fn enter_count(&self) -> u64 {
        self.enters.load(Ordering::Relaxed)
    }

    /// Lower or remove every mapping of `phys` in this pmap.
    ///
    /// Returns true if a removed mapping had been stored through.
    fn protect_phys(&self, phys: u64, prot: VmProt) -> bool {
        let phys = trunc_page(phys);
        let mut mappings = self.mappings.lock();
        if prot.is_empty() {
            let before = mappings.len();
            let mut unwired = 0;
            let mut modified = false;
            mappings.retain(|_, e| {
                let keep = e.phys != phys;
                if !keep {
                    unwired += e.wired as u32;
                    modified |= e.modified;
                }
                keep
            });
            let removed = (before - mappings.len()) as u32;
            self.stats.resident_count.fetch_sub(removed, Ordering::Relaxed);
            self.stats.wired_count.fetch_sub(unwired, Ordering::Relaxed);
            modified
        } else {
            for entry in mappings.values_mut().filter(|e| e.phys == phys) {
                entry.prot &= prot;
            }
            false
        }
    }

    fn phys_modified(&self, phys: u64) -> bool {
        self.mappings
            .lock()
            .values()
            .any(|e| e.phys == phys && e.modified)
    }

    fn clear_phys_modified(&self, phys: u64) {
        for entry in self.mappings.lock().values_mut().filter(|e| e.phys == phys) {
            entry.modified = false;
        }
    }
}

impl Pmap for SoftPmap {
    fn enter(&self, vaddr: u64, phys: u64, prot: VmProt, wired: bool) {
        let phys = trunc_page(phys);
        let mut mappings = self.mappings.lock();
        let modified = mappings
            .get(&trunc_page(vaddr))
            .is_some_and(|old| old.phys == phys && old.modified);
        let entry = PmapEntry {
            phys,
            prot,
            wired,
            modified,
        };
        let old = mappings.insert(trunc_page(vaddr), entry);
        drop(mappings);
        match old {
            None => {
                self.stats.resident_count.fetch_add(1, Ordering::Relaxed);
            }
            Some(old) if old.wired => {
                self.stats.wired_count.fetch_sub(1, Ordering::Relaxed);
            }
            Some(_) => {}
        }
        if wired {
            self.stats.wired_count.fetch_add(1, Ordering::Relaxed);
        }
        self.enters.fetch_add(1, Ordering::Relaxed);
    }

    fn extract(&self, vaddr: u64) -> Option<u64> {
        self.mapping(vaddr)
            .map(|e| e.phys | (vaddr & (crate::mach_vm::vm_page::PAGE_SIZE as u64 - 1)))
    }

    fn change_wiring(&self, vaddr: u64, wired: bool) {
        let mut mappings = self.mappings.lock();
        if let Some(entry) = mappings.get_mut(&trunc_page(vaddr)) {
            if entry.wired != wired {
                entry.wired = wired;
                if wired {
                    self.stats.wired_count.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.wired_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }
}

// ============================================================================
// Physical-to-Virtual Registry
// ============================================================================

/// Registry of live pmaps, answering per-physical-page requests
pub struct PvTable {
    next_id: AtomicU64,
    pmaps: Mutex<Vec<Weak<SoftPmap>>>,
    /// Frames whose modified mappings were torn down
    modified: Mutex<BTreeSet<u64>>,
}

impl PvTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(PmapId::KERNEL.0),
            pmaps: Mutex::new(Vec::new()),
            modified: Mutex::new(BTreeSet::new()),
        }
    }

    fn live(&self) -> Vec<Arc<SoftPmap>> {
        self.pmaps.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Create a pmap registered with this table
    pub fn create_pmap(&self) -> Arc<SoftPmap> {
        let id = PmapId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let pmap = Arc::new(SoftPmap::new(id));
        let mut pmaps = self.pmaps.lock();
        pmaps.retain(|w| w.strong_count() > 0);
        pmaps.push(Arc::downgrade(&pmap));
        pmap
    }

    /// Number of mappings of `phys` across every pmap
    pub fn mapping_count(&self, phys: u64) -> usize {
        let phys = trunc_page(phys);
        self.pmaps
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|p| p.mappings.lock().values().filter(|e| e.phys == phys).count())
            .sum()
    }
}

impl Default for PvTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysMap for PvTable {
    fn page_protect(&self, phys: u64, prot: VmProt) {
        let mut modified = false;
        for pmap in self.live() {
            modified |= pmap.protect_phys(phys, prot);
        }
        if modified {
            self.modified.lock().insert(trunc_page(phys));
        }
    }

    fn is_modified(&self, phys: u64) -> bool {
        let phys = trunc_page(phys);
        self.modified.lock().contains(&phys) || self.live().iter().any(|p| p.phys_modified(phys))
    }

    fn clear_modify(&self, phys: u64) {
        let phys = trunc_page(phys);
        self.modified.lock().remove(&phys);
        for pmap in self.live() {
            pmap.clear_phys_modified(phys);
        }
    }
}
