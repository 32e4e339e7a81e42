//! VM Object - Memory Object Abstraction
//!
//! Based on Mach4 vm/vm_object.h/c
//! VM objects are containers of resident pages. They can be backed by:
//! - Nothing (anonymous zero-fill memory)
//! - A pager supplying page contents
//! - A backing object, forming a copy-on-write shadow chain
//!
//! Objects live in an [`ObjectManager`] arena and name their backing
//! object by id. Two counters keep an object alive: the reference count
//! and `paging_in_progress`. Both are taken as guards ([`ObjectRef`],
//! [`PagingGuard`]) so every exit path gives them back.
//!
//! Lock order: an object's state lock may be held while taking its
//! backing object's state lock, never the reverse.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::kern::sched_prim::{event_from_addr, Scheduler, WaitReason};
use crate::mach_vm::vm_page::{AllocError, BusyPage, PageManager, VmPage};
use crate::mach_vm::vm_pager::Pager;

// ============================================================================
// VM Object Types
// ============================================================================

/// VM Object ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

// ============================================================================
// VM Object Flags
// ============================================================================

/// VM Object flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectFlags(u32);

impl ObjectFlags {
    /// Some page was ever mapped writeable
    pub const WRITEABLE: Self = Self(0x0001);
    /// Pages may have been modified since last clean
    pub const MIGHTBEDIRTY: Self = Self(0x0002);
    /// Object backs kernel memory
    pub const KERNEL: Self = Self(0x0004);
    /// Object was terminated or collapsed away
    pub const DEAD: Self = Self(0x0008);

    /// Empty flags
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Get bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Create from bits
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits)
    }

    /// Check if contains flags
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for ObjectFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for ObjectFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// VM Object Structure
// ============================================================================

/// Mutable part of an object, guarded by its lock
#[derive(Debug, Default)]
pub struct ObjectState {
    /// Size in bytes
    pub size: u64,

    /// Resident pages (offset -> page)
    pub pages: BTreeMap<u64, Arc<VmPage>>,

    /// Next object down the shadow chain
    pub backing: Option<VmObjectId>,

    /// Offset of this object within `backing`
    pub backing_offset: u64,
}

/// VM Object - represents a unit of backing store
pub struct VmObject {
    /// Object ID
    pub id: VmObjectId,

    /// Reference count
    ref_count: AtomicU32,

    /// Paging operations in flight
    paging_in_progress: AtomicU32,

    /// Object flags
    flags: AtomicU32,

    /// Pager supplying contents, if any
    pager: Option<Arc<dyn Pager>>,

    state: Mutex<ObjectState>,
}

impl VmObject {
    /// Create a new VM object
    pub fn new(id: VmObjectId, size: u64) -> Self {
        Self {
            id,
            ref_count: AtomicU32::new(1),
            paging_in_progress: AtomicU32::new(0),
            flags: AtomicU32::new(ObjectFlags::default().bits()),
            pager: None,
            state: Mutex::new(ObjectState {
                size,
                ..ObjectState::default()
            }),
        }
    }

    /// Create an anonymous (zero-fill) object
    pub fn anonymous(id: VmObjectId, size: u64) -> Self {
        Self::new(id, size)
    }

    /// Create an object whose contents come from `pager`
    pub fn with_pager(id: VmObjectId, size: u64, pager: Arc<dyn Pager>) -> Self {
        let mut obj = Self::new(id, size);
        obj.pager = Some(pager);
        obj
    }

    /// Create a kernel object
    pub fn kernel(id: VmObjectId, size: u64) -> Self {
        let obj = Self::new(id, size);
        obj.set_flags(ObjectFlags::KERNEL);
        obj
    }

    /// Get object size
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Get object flags
    pub fn get_flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Set object flags
    pub fn set_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub fn is_kernel(&self) -> bool {
        self.get_flags().contains(ObjectFlags::KERNEL)
    }

    pub fn is_dead(&self) -> bool {
        self.get_flags().contains(ObjectFlags::DEAD)
    }

    /// The object's pager
    pub fn pager(&self) -> Option<&Arc<dyn Pager>> {
        self.pager.as_ref()
    }

    pub fn has_pager(&self) -> bool {
        self.pager.is_some()
    }

    /// Increment reference count
    pub fn reference(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Get reference count
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Paging operations in flight
    pub fn paging_in_progress(&self) -> u32 {
        self.paging_in_progress.load(Ordering::SeqCst)
    }

    /// Lock the object's mutable state
    pub fn lock_state(&self) -> MutexGuard<'_, ObjectState> {
        self.state.lock()
    }

    /// Next object down the chain and our offset within it
    pub fn backing(&self) -> Option<(VmObjectId, u64)> {
        let state = self.state.lock();
        state.backing.map(|id| (id, state.backing_offset))
    }

    /// Resident page at `offset`
    pub fn page_lookup(&self, offset: u64) -> Option<Arc<VmPage>> {
        self.state.lock().pages.get(&offset).cloned()
    }

    /// Number of resident pages
    pub fn resident_page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Offsets of resident pages, ascending
    pub fn resident_offsets(&self) -> Vec<u64> {
        self.state.lock().pages.keys().copied().collect()
    }

    /// Enter `page` at `offset` (vm_page_insert)
    pub(crate) fn insert_page(
        self: &Arc<Self>,
        offset: u64,
        page: &Arc<VmPage>,
    ) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        if state.pages.contains_key(&offset) {
            return Err(AllocError::Exists);
        }
        page.set_owner(self, offset);
        state.pages.insert(offset, Arc::clone(page));
        Ok(())
    }

    /// Drop `page` from `offset` if it is still the page there
    pub(crate) fn remove_page(&self, offset: u64, page: &Arc<VmPage>) {
        let mut state = self.state.lock();
        if state.pages.get(&offset).is_some_and(|p| Arc::ptr_eq(p, page)) {
            state.pages.remove(&offset);
        }
    }

    /// Start a paging operation (paging_in_progress++)
    ///
    /// The count is raised under the object lock so it serialises with
    /// collapse, which checks it under the same lock.
    pub fn begin_paging(self: &Arc<Self>, sched: &Arc<dyn Scheduler>) -> PagingGuard {
        let _state = self.state.lock();
        self.begin_paging_locked(sched)
    }

    /// [`VmObject::begin_paging`] for a caller already holding the lock
    pub(crate) fn begin_paging_locked(self: &Arc<Self>, sched: &Arc<dyn Scheduler>) -> PagingGuard {
        self.paging_in_progress.fetch_add(1, Ordering::SeqCst);
        PagingGuard {
            object: Arc::clone(self),
            sched: Arc::clone(sched),
        }
    }

    /// Sleep until no paging operation is in flight
    pub fn paging_wait(&self, sched: &dyn Scheduler) {
        while self.paging_in_progress() > 0 {
            sched.block(event_from_addr(self), WaitReason::ObjectPaging);
        }
    }
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("ref_count", &self.ref_count())
            .field("paging_in_progress", &self.paging_in_progress())
            .field("flags", &self.get_flags())
            .field("has_pager", &self.has_pager())
            .finish()
    }
}

// ============================================================================
// Guards
// ============================================================================

/// One in-flight paging operation on an object
///
/// Dropping the guard lowers `paging_in_progress` and wakes anyone
/// draining the object once it reaches zero (vm_object_pip_wakeup).
pub struct PagingGuard {
    object: Arc<VmObject>,
    sched: Arc<dyn Scheduler>,
}

impl PagingGuard {
    pub fn object(&self) -> &Arc<VmObject> {
        &self.object
    }
}

impl Drop for PagingGuard {
    fn drop(&mut self) {
        if self.object.paging_in_progress.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.sched.wakeup(event_from_addr(self.object.as_ref()));
        }
    }
}

/// A counted reference to an object, released through its manager
pub struct ObjectRef<'a> {
    object: Arc<VmObject>,
    manager: &'a ObjectManager,
}

impl ObjectRef<'_> {
    pub fn object(&self) -> &Arc<VmObject> {
        &self.object
    }
}

impl Deref for ObjectRef<'_> {
    type Target = VmObject;

    fn deref(&self) -> &VmObject {
        &self.object
    }
}

impl Drop for ObjectRef<'_> {
    fn drop(&mut self) {
        self.manager.deallocate(&self.object);
    }
}

// ============================================================================
// Object Manager
// ============================================================================

/// VM Object manager
pub struct ObjectManager {
    /// All live objects
    objects: Mutex<BTreeMap<VmObjectId, Arc<VmObject>>>,
    /// Next object ID
    next_id: AtomicU64,
    /// Frame allocator that receives pages of dead objects
    pages: Arc<PageManager>,
    sched: Arc<dyn Scheduler>,
    collapses: AtomicU64,
}

impl ObjectManager {
    pub fn new(pages: Arc<PageManager>) -> Self {
        let sched = Arc::clone(pages.scheduler());
        Self {
            objects: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            pages,
            sched,
            collapses: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> VmObjectId {
        VmObjectId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn install(&self, object: VmObject) -> Arc<VmObject> {
        let object = Arc::new(object);
        self.objects.lock().insert(object.id, Arc::clone(&object));
        object
    }

    /// Allocate a new anonymous object holding one reference
    pub fn allocate(&self, size: u64) -> Arc<VmObject> {
        self.install(VmObject::anonymous(self.next_id(), size))
    }

    /// Allocate object with a pager
    pub fn allocate_with_pager(&self, size: u64, pager: Arc<dyn Pager>) -> Arc<VmObject> {
        self.install(VmObject::with_pager(self.next_id(), size, pager))
    }

    /// Allocate a kernel object
    pub fn allocate_kernel(&self, size: u64) -> Arc<VmObject> {
        self.install(VmObject::kernel(self.next_id(), size))
    }

    /// Shadow an existing object (copy-on-write)
    ///
    /// The caller's reference to `source` moves to the new shadow.
    pub fn shadow(&self, source: &Arc<VmObject>, offset: u64, size: u64) -> Arc<VmObject> {
        let shadow = VmObject::anonymous(self.next_id(), size);
        {
            let mut state = shadow.state.lock();
            state.backing = Some(source.id);
            state.backing_offset = offset;
        }
        self.install(shadow)
    }

    /// Look up an object
    pub fn lookup(&self, id: VmObjectId) -> Option<Arc<VmObject>> {
        self.objects.lock().get(&id).cloned()
    }

    /// Number of live objects
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Number of successful collapses
    pub fn collapse_count(&self) -> u64 {
        self.collapses.load(Ordering::Relaxed)
    }

    /// Take a reference that is released when the guard drops
    pub fn reference(&self, object: &Arc<VmObject>) -> ObjectRef<'_> {
        object.reference();
        ObjectRef {
            object: Arc::clone(object),
            manager: self,
        }
    }

    /// Release a reference; the last one terminates the object
    pub fn deallocate(&self, object: &Arc<VmObject>) {
        let mut next = Some(Arc::clone(object));
        while let Some(object) = next.take() {
            let prev = object.ref_count.fetch_sub(1, Ordering::SeqCst);
            if prev == 0 {
                panic!("vm_object_deallocate: object {:?} has no references", object.id);
            }
            if prev == 1 {
                next = self.terminate(&object);
            }
        }
    }

    /// Tear down an unreferenced object, returning its backing object
    fn terminate(&self, object: &Arc<VmObject>) -> Option<Arc<VmObject>> {
        object.paging_wait(self.sched.as_ref());
        object.set_flags(ObjectFlags::DEAD);

        let (pages, backing) = {
            let mut state = object.state.lock();
            (mem::take(&mut state.pages), state.backing.take())
        };

        for page in pages.into_values() {
            let busy = loop {
                if let Some(busy) = self.pages.try_busy(&page) {
                    break busy;
                }
                if page.set_wanted() {
                    self.sched.block(event_from_addr(page.as_ref()), WaitReason::VmPage);
                }
            };
            // Someone else may have freed it while we slept.
            if busy.object_id() == Some(object.id) {
                self.pages.free(busy);
            }
        }

        self.objects.lock().remove(&object.id);
        log::debug!("vm_object_terminate: object {:?}", object.id);
        backing.and_then(|id| self.lookup(id))
    }

    /// Merge `object`'s backing object into it while that is allowed
    ///
    /// A backing object is absorbed when `object` is its only referrer,
    /// it has no pager, and neither object has paging in flight. Returns
    /// true if at least one level was collapsed.
    pub fn collapse(&self, object: &Arc<VmObject>) -> bool {
        let mut collapsed = false;

        while let Some((backing_id, _)) = object.backing() {
            let Some(backing) = self.lookup(backing_id) else {
                break;
            };

            let mut discard: Vec<BusyPage> = Vec::new();
            let mut moved: Vec<BusyPage> = Vec::new();
            {
                let mut state = object.state.lock();
                if state.backing != Some(backing_id) {
                    break;
                }
                let mut bstate = backing.state.lock();

                if object.paging_in_progress() != 0
                    || backing.paging_in_progress() != 0
                    || backing.ref_count() != 1
                    || backing.has_pager()
                    || backing.is_kernel()
                {
                    break;
                }

                let mut held = Vec::with_capacity(bstate.pages.len());
                for page in bstate.pages.values() {
                    match self.pages.try_busy(page) {
                        Some(busy) => held.push(busy),
                        None => break,
                    }
                }
                if held.len() != bstate.pages.len() {
                    break;
                }

                let backing_offset = state.backing_offset;
                let size = state.size;
                bstate.pages.clear();

                for busy in held {
                    let Some(offset) = busy.offset() else {
                        continue;
                    };
                    let target = offset.wrapping_sub(backing_offset);
                    if offset < backing_offset
                        || target >= size
                        || state.pages.contains_key(&target)
                    {
                        discard.push(busy);
                    } else {
                        busy.set_owner(object, target);
                        state.pages.insert(target, Arc::clone(busy.page()));
                        moved.push(busy);
                    }
                }

                state.backing = bstate.backing.take();
                state.backing_offset = backing_offset + bstate.backing_offset;
                backing.set_flags(ObjectFlags::DEAD);
                backing.ref_count.store(0, Ordering::SeqCst);
            }

            drop(moved);
            for busy in discard {
                self.pages.free(busy);
            }
            self.objects.lock().remove(&backing_id);
            self.collapses.fetch_add(1, Ordering::Relaxed);
            log::debug!("vm_object_collapse: {:?} absorbed {:?}", object.id, backing_id);
            collapsed = true;
        }

        collapsed
    }
}
