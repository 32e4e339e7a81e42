//! VM Map - Address Space Lookup Contract
//!
//! Based on Mach4 vm/vm_map.h/c
//!
//! The fault path does not own address spaces. It asks a [`VmMap`] to
//! translate a faulting address into `(object, offset, protection)` and
//! hands the answer back through [`VmMap::lookup_done`] exactly once.
//! [`SimpleMap`] is a small entry table implementing that contract.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::mach_vm::pmap::{Pmap, SoftPmap};
use crate::mach_vm::vm_fault::FaultError;
use crate::mach_vm::vm_object::VmObject;

// ============================================================================
// Protection
// ============================================================================

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmProt(u32);

impl VmProt {
    /// No access
    pub const NONE: Self = Self(0);
    /// Read access
    pub const READ: Self = Self(1);
    /// Write access
    pub const WRITE: Self = Self(2);
    /// Execute access
    pub const EXECUTE: Self = Self(4);
    /// Default (read/write)
    pub const DEFAULT: Self = Self(3); // READ | WRITE
    /// All permissions
    pub const ALL: Self = Self(7); // READ | WRITE | EXECUTE

    /// Empty (no permissions)
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(bits: u32) -> Self {
        Self(bits & 0x7)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Rights in `self` that are not in `other`
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn can_execute(&self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

impl core::ops::BitOr for VmProt {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for VmProt {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl core::ops::BitAnd for VmProt {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl core::ops::BitAndAssign for VmProt {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Default for VmProt {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ============================================================================
// Lookup Contract
// ============================================================================

/// Answer of a successful map lookup
///
/// Holds a reference to the top-level object for as long as the lookup
/// is outstanding.
#[derive(Debug, Clone)]
pub struct MapLookup {
    /// Top-level object named by the map entry
    pub object: Arc<VmObject>,
    /// Offset of the faulting page within `object`
    pub offset: u64,
    /// Protection allowed by the entry
    pub protection: VmProt,
    /// Entry is wired
    pub wired: bool,
    /// Entry is shared with other maps
    pub shared: bool,
}

/// Address space as seen by the fault handler
pub trait VmMap: Send + Sync {
    /// Translate `vaddr` for an access of type `fault_type`.
    ///
    /// On success the caller owes exactly one [`VmMap::lookup_done`].
    fn lookup(&self, vaddr: u64, fault_type: VmProt) -> Result<MapLookup, FaultError>;

    /// Release a lookup returned by [`VmMap::lookup`].
    fn lookup_done(&self, lookup: &MapLookup);

    /// Hardware translation table of this map
    fn pmap(&self) -> &dyn Pmap;

    /// Is this the kernel's own map?
    fn is_kernel(&self) -> bool {
        false
    }
}

/// Scope guard for an outstanding lookup
///
/// Dropping the guard (or calling [`LookupGuard::release`]) hands the
/// lookup back to the map. Releasing twice is a no-op.
pub struct LookupGuard<'a> {
    map: &'a dyn VmMap,
    lookup: Option<MapLookup>,
}

impl<'a> LookupGuard<'a> {
    pub fn new(map: &'a dyn VmMap, lookup: MapLookup) -> Self {
        Self {
            map,
            lookup: Some(lookup),
        }
    }

    /// Is the lookup still held?
    pub fn is_held(&self) -> bool {
        self.lookup.is_some()
    }

    /// Release the lookup now
    pub fn release(&mut self) {
        if let Some(lookup) = self.lookup.take() {
            self.map.lookup_done(&lookup);
        }
    }

    /// Hold a fresh lookup, releasing any previous one first
    pub fn hold(&mut self, lookup: MapLookup) {
        self.release();
        self.lookup = Some(lookup);
    }
}

impl Drop for LookupGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// VM Map Entry
// ============================================================================

/// VM Map Entry - describes a single mapping in the address space
#[derive(Debug, Clone)]
pub struct VmMapEntry {
    /// Start address of this entry
    pub start: u64,

    /// End address of this entry
    pub end: u64,

    /// Backing object
    pub object: Option<Arc<VmObject>>,

    /// Offset into object
    pub offset: u64,

    /// Current protection
    pub protection: VmProt,

    /// Maximum protection
    pub max_protection: VmProt,

    /// Wire count
    pub wired_count: u32,

    /// Entry shares its object with other maps
    pub is_shared: bool,
}

impl VmMapEntry {
    /// Create a new map entry
    pub fn new(start: u64, end: u64, object: Option<Arc<VmObject>>, offset: u64) -> Self {
        Self {
            start,
            end,
            object,
            offset,
            protection: VmProt::DEFAULT,
            max_protection: VmProt::ALL,
            wired_count: 0,
            is_shared: false,
        }
    }

    /// Set current protection
    pub fn with_protection(mut self, protection: VmProt) -> Self {
        self.protection = protection;
        self
    }

    /// Get entry size
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Check if address is in this entry
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if range overlaps this entry
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    /// Check if entry is wired
    pub fn is_wired(&self) -> bool {
        self.wired_count > 0
    }
}

// ============================================================================
// Map Errors
// ============================================================================

/// VM Map operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Invalid address range
    InvalidRange,
    /// Range overlaps an existing entry
    NoSpace,
    /// Entry not found
    NotFound,
}

// ============================================================================
// Simple Map
// ============================================================================

/// Entry table implementing the lookup contract
pub struct SimpleMap {
    /// Map entries (ordered by start address)
    entries: Mutex<BTreeMap<u64, VmMapEntry>>,

    /// Hardware translation for this map
    pmap: Arc<SoftPmap>,

    /// Is this the kernel map?
    is_kernel_map: bool,

    /// Lookups handed out and not yet released
    outstanding: AtomicU32,

    /// Total successful lookups
    lookups: AtomicU64,
}

impl SimpleMap {
    /// Create a user map over `pmap`
    pub fn new(pmap: Arc<SoftPmap>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            pmap,
            is_kernel_map: false,
            outstanding: AtomicU32::new(0),
            lookups: AtomicU64::new(0),
        }
    }

    /// Create the kernel map
    pub fn kernel(pmap: Arc<SoftPmap>) -> Self {
        let mut map = Self::new(pmap);
        map.is_kernel_map = true;
        map
    }

    /// The concrete translation table
    pub fn soft_pmap(&self) -> &Arc<SoftPmap> {
        &self.pmap
    }

    /// Insert an entry
    pub fn enter(&self, entry: VmMapEntry) -> Result<(), MapError> {
        if entry.start >= entry.end {
            return Err(MapError::InvalidRange);
        }
        let mut entries = self.entries.lock();
        if entries.values().any(|e| e.overlaps(entry.start, entry.end)) {
            return Err(MapError::NoSpace);
        }
        entries.insert(entry.start, entry);
        Ok(())
    }

    /// Copy of the entry starting at `start`
    pub fn entry(&self, start: u64) -> Option<VmMapEntry> {
        self.entries.lock().get(&start).cloned()
    }

    /// Replace the entry starting at `entry.start`
    pub fn replace(&self, entry: VmMapEntry) -> Result<(), MapError> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&entry.start) {
            Some(slot) => {
                *slot = entry;
                Ok(())
            }
            None => Err(MapError::NotFound),
        }
    }

    /// Adjust the wire count of every entry overlapping `[start, end)`
    pub fn set_wired(&self, start: u64, end: u64, wired: bool) {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut().filter(|e| e.overlaps(start, end)) {
            if wired {
                entry.wired_count += 1;
            } else {
                entry.wired_count = entry.wired_count.saturating_sub(1);
            }
        }
    }

    /// Lookups not yet released
    pub fn outstanding_lookups(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Successful lookups so far
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl VmMap for SimpleMap {
    fn lookup(&self, vaddr: u64, fault_type: VmProt) -> Result<MapLookup, FaultError> {
        let entries = self.entries.lock();
        let entry = entries
            .range(..=vaddr)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.contains(vaddr))
            .ok_or(FaultError::InvalidAddress)?;

        // A wired entry is faulted with everything it allows.
        let wired = entry.is_wired();
        let required = if wired { entry.protection } else { fault_type };
        if !entry.protection.contains(required) {
            return Err(FaultError::Protection);
        }

        let object = entry.object.clone().ok_or(FaultError::InvalidAddress)?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.lookups.fetch_add(1, Ordering::SeqCst);

        Ok(MapLookup {
            object,
            offset: vaddr - entry.start + entry.offset,
            protection: entry.protection,
            wired,
            shared: entry.is_shared,
        })
    }

    fn lookup_done(&self, _lookup: &MapLookup) {
        let prev = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "lookup_done without lookup");
    }

    fn pmap(&self) -> &dyn Pmap {
        self.pmap.as_ref()
    }

    fn is_kernel(&self) -> bool {
        self.is_kernel_map
    }
}
