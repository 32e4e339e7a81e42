//! VM Page Management - Resident Pages and the Frame Allocator
//!
//! Based on Mach4 vm/vm_page.h/c
//!
//! A resident page is a physical frame bound to one (object, offset) pair.
//! Ownership of a page's state is expressed by the `busy` bit: whoever set
//! it may move, fill or free the page. [`BusyPage`] is that ownership as a
//! value; dropping it clears `busy` and wakes anyone who asked to be told.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use spin::Mutex;
use thiserror::Error;

use crate::kern::sched_prim::{event_from_addr, Scheduler, WaitReason, MEMORY_EVENT};
use crate::mach_vm::vm_object::{VmObject, VmObjectId};
use crate::mach_vm::VmConfig;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Size of one validity/dirty block
pub const DEV_BSIZE: usize = 512;

/// Every block of a page valid (or dirty)
pub const VM_PAGE_BITS_ALL: u8 = 0xff;

// ============================================================================
// Page Flags
// ============================================================================

/// Page state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(u32);

impl PageFlags {
    /// Page is in active queue
    pub const ACTIVE: Self = Self(0x0001);
    /// Page is in inactive queue
    pub const INACTIVE: Self = Self(0x0002);
    /// Page is in cache queue (clean, reclaimable)
    pub const CACHE: Self = Self(0x0004);
    /// Page is free
    pub const FREE: Self = Self(0x0008);
    /// Page contents are known to be zero
    pub const ZERO: Self = Self(0x0010);
    /// Page is mapped by some pmap
    pub const MAPPED: Self = Self(0x0020);
    /// Page was referenced recently
    pub const REFERENCED: Self = Self(0x0040);
    /// Page has been mapped writeable
    pub const WRITEABLE: Self = Self(0x0080);

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

impl core::ops::BitOr for PageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// Page Queue Type
// ============================================================================

/// Page queue type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageQueueType {
    /// Not on any queue (wired, or in transit)
    None = 0,
    /// Free page queue
    Free = 1,
    /// Active page queue
    Active = 2,
    /// Inactive page queue
    Inactive = 3,
    /// Cache queue (clean pages still named by an object)
    Cache = 4,
}

// ============================================================================
// VM Page Structure
// ============================================================================

/// Virtual Memory Page
///
/// Represents a single physical page of memory.
/// Based on Mach4 vm_page structure.
#[derive(Debug)]
pub struct VmPage {
    /// Physical address of this page
    pub phys_addr: u64,

    /// Page number in system
    pub page_num: u32,

    /// Object (and offset) this page belongs to
    owner: Mutex<Option<(Weak<VmObject>, u64)>>,

    /// Which queue this page is on
    queue: Mutex<PageQueueType>,

    /// Page flags
    flags: AtomicU32,

    /// Wire count (reference count for wiring)
    wire_count: AtomicU32,

    /// Busy flag: held by whoever owns the page's state
    busy: AtomicBool,

    /// Wanted flag (someone waiting for this page)
    wanted: AtomicBool,

    /// One bit per DEV_BSIZE block holding valid data
    valid: AtomicU8,

    /// One bit per DEV_BSIZE block modified since last clean
    dirty: AtomicU8,

    /// Frame contents
    data: Mutex<Box<[u8]>>,
}

impl VmPage {
    /// Create a new, zeroed VM page
    pub fn new(phys_addr: u64, page_num: u32) -> Self {
        Self {
            phys_addr,
            page_num,
            owner: Mutex::new(None),
            queue: Mutex::new(PageQueueType::None),
            flags: AtomicU32::new(PageFlags::ZERO.bits()),
            wire_count: AtomicU32::new(0),
            busy: AtomicBool::new(false),
            wanted: AtomicBool::new(false),
            valid: AtomicU8::new(0),
            dirty: AtomicU8::new(0),
            data: Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
        }
    }

    /// Get page flags
    pub fn get_flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Set page flags
    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// Clear page flags
    pub fn clear_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// Check if page has specific flags
    pub fn has_flags(&self, flags: PageFlags) -> bool {
        self.get_flags().contains(flags)
    }

    /// Check if page is busy
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Take the busy bit; false if someone else holds it
    pub(crate) fn try_busy(&self) -> bool {
        !self.busy.swap(true, Ordering::SeqCst)
    }

    /// Ask to be woken when the page stops being busy.
    ///
    /// Returns false if the page is no longer busy, in which case the
    /// caller must not sleep.
    pub fn set_wanted(&self) -> bool {
        self.set_flags(PageFlags::REFERENCED);
        self.wanted.store(true, Ordering::SeqCst);
        self.is_busy()
    }

    /// Clear busy and wake waiters (PAGE_WAKEUP)
    fn wakeup_busy(&self, sched: &dyn Scheduler) {
        self.busy.store(false, Ordering::SeqCst);
        if self.wanted.swap(false, Ordering::SeqCst) {
            sched.wakeup(event_from_addr(self));
        }
    }

    /// Valid block bitmap
    pub fn valid(&self) -> u8 {
        self.valid.load(Ordering::SeqCst)
    }

    /// Replace the valid block bitmap
    pub fn set_valid(&self, bits: u8) {
        self.valid.store(bits, Ordering::SeqCst);
    }

    /// Every block valid?
    pub fn is_fully_valid(&self) -> bool {
        self.valid() == VM_PAGE_BITS_ALL
    }

    /// Some but not all blocks valid?
    pub fn is_partially_valid(&self) -> bool {
        let valid = self.valid();
        valid != 0 && valid != VM_PAGE_BITS_ALL
    }

    /// Dirty block bitmap
    pub fn dirty(&self) -> u8 {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Replace the dirty block bitmap
    pub fn set_dirty(&self, bits: u8) {
        self.dirty.store(bits, Ordering::SeqCst);
    }

    /// Check if page is wired
    pub fn is_wired(&self) -> bool {
        self.wire_count.load(Ordering::SeqCst) > 0
    }

    /// Wire count
    pub fn wire_count(&self) -> u32 {
        self.wire_count.load(Ordering::SeqCst)
    }

    /// Queue this page currently sits on
    pub fn queue(&self) -> PageQueueType {
        *self.queue.lock()
    }

    /// Object and offset naming this page
    pub fn owner(&self) -> Option<(Arc<VmObject>, u64)> {
        let owner = self.owner.lock();
        let (object, offset) = owner.as_ref()?;
        Some((object.upgrade()?, *offset))
    }

    /// Id of the owning object
    pub fn object_id(&self) -> Option<VmObjectId> {
        self.owner().map(|(object, _)| object.id)
    }

    /// Offset within the owning object
    pub fn offset(&self) -> Option<u64> {
        self.owner.lock().as_ref().map(|(_, offset)| *offset)
    }

    pub(crate) fn set_owner(&self, object: &Arc<VmObject>, offset: u64) {
        *self.owner.lock() = Some((Arc::downgrade(object), offset));
    }

    pub(crate) fn take_owner(&self) -> Option<(Weak<VmObject>, u64)> {
        self.owner.lock().take()
    }

    /// Copy `buf.len()` bytes out of the frame at `offset`
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copy `bytes` into the frame at `offset`
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        if bytes.iter().any(|&b| b != 0) {
            self.clear_flags(PageFlags::ZERO);
        }
    }

    /// Fill the frame with zeros (vm_page_zero_fill)
    pub fn zero_fill(&self) {
        self.data.lock().fill(0);
        self.set_flags(PageFlags::ZERO);
    }

    /// Copy the whole frame of `src` into this one (vm_page_copy)
    pub fn copy_from(&self, src: &VmPage) {
        let mut buf = [0u8; PAGE_SIZE];
        src.read(0, &mut buf);
        self.data.lock().copy_from_slice(&buf);
        self.clear_flags(PageFlags::ZERO);
    }

    /// Does every byte of the frame read as zero?
    pub fn is_zero(&self) -> bool {
        self.data.lock().iter().all(|&b| b == 0)
    }
}

// ============================================================================
// Busy Page Guard
// ============================================================================

/// Exclusive ownership of a page's state
///
/// Dropping the guard clears `busy` and wakes waiters. [`BusyPage::forget`]
/// hands the busy bit to someone else without waking anyone.
pub struct BusyPage {
    page: Arc<VmPage>,
    sched: Arc<dyn Scheduler>,
    armed: bool,
}

impl BusyPage {
    /// Wrap a page whose busy bit the caller already took
    pub(crate) fn new(page: Arc<VmPage>, sched: Arc<dyn Scheduler>) -> Self {
        debug_assert!(page.is_busy(), "BusyPage over a page that is not busy");
        Self {
            page,
            sched,
            armed: true,
        }
    }

    /// Shared handle to the page
    pub fn page(&self) -> &Arc<VmPage> {
        &self.page
    }

    /// Give up the guard without clearing busy
    pub fn forget(mut self) -> Arc<VmPage> {
        self.armed = false;
        Arc::clone(&self.page)
    }

    /// Return the page to the allocator
    pub fn free(self, pages: &PageManager) {
        pages.free(self);
    }
}

impl Deref for BusyPage {
    type Target = VmPage;

    fn deref(&self) -> &VmPage {
        &self.page
    }
}

impl Drop for BusyPage {
    fn drop(&mut self) {
        if self.armed {
            self.page.wakeup_busy(self.sched.as_ref());
        }
    }
}

impl core::fmt::Debug for BusyPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BusyPage")
            .field("page_num", &self.page.page_num)
            .field("offset", &self.page.offset())
            .finish()
    }
}

// ============================================================================
// Page Queue
// ============================================================================

/// A queue of pages
#[derive(Debug, Default)]
pub struct PageQueue {
    /// Pages in this queue
    pages: VecDeque<u32>, // Page numbers
}

impl PageQueue {
    /// Create a new page queue
    pub fn new() -> Self {
        Self {
            pages: VecDeque::new(),
        }
    }

    /// Add a page to the queue
    pub fn enqueue(&mut self, page_num: u32) {
        self.pages.push_back(page_num);
    }

    /// Remove a page from the front of the queue
    pub fn dequeue(&mut self) -> Option<u32> {
        self.pages.pop_front()
    }

    /// Remove a specific page from the queue
    pub fn remove(&mut self, page_num: u32) -> bool {
        if let Some(pos) = self.pages.iter().position(|&p| p == page_num) {
            self.pages.remove(pos);
            true
        } else {
            false
        }
    }

    /// Page numbers, oldest first
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.pages.iter().copied()
    }

    /// Get queue length
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

struct PageQueues {
    free: PageQueue,
    active: PageQueue,
    inactive: PageQueue,
    cache: PageQueue,
}

impl PageQueues {
    fn get_mut(&mut self, which: PageQueueType) -> Option<&mut PageQueue> {
        match which {
            PageQueueType::Free => Some(&mut self.free),
            PageQueueType::Active => Some(&mut self.active),
            PageQueueType::Inactive => Some(&mut self.inactive),
            PageQueueType::Cache => Some(&mut self.cache),
            PageQueueType::None => None,
        }
    }
}

// ============================================================================
// Allocation Errors
// ============================================================================

/// Why a frame could not be bound to an (object, offset)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// No frame available without dipping into the reserve
    #[error("no free page available")]
    NoMemory,
    /// Another thread already entered a page at this offset
    #[error("page already resident at offset")]
    Exists,
}

// ============================================================================
// Page Manager
// ============================================================================

/// Page statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub total: u32,
    pub free: u32,
    pub active: u32,
    pub inactive: u32,
    pub cache: u32,
    pub wired: u32,
}

/// Fixed pool of frames and their reclaim queues
pub struct PageManager {
    /// All pages in the system (indexed by page number - first_page)
    pages: Vec<Arc<VmPage>>,

    /// Page number of `pages[0]`
    first_page: u32,

    queues: Mutex<PageQueues>,

    free_count: AtomicU32,
    active_count: AtomicU32,
    inactive_count: AtomicU32,
    cache_count: AtomicU32,
    wire_count: AtomicU32,

    /// Ordinary allocations leave this many free pages alone
    free_reserved: u32,

    /// Wiring pauses while free pages are at or below this
    pageout_free_min: u32,

    sched: Arc<dyn Scheduler>,
}

impl PageManager {
    /// Build the pool described by `config`
    pub fn init_with_memory(config: &VmConfig, sched: Arc<dyn Scheduler>) -> Self {
        let start_page = (config.memory_start >> PAGE_SHIFT) as u32;
        let mut free = PageQueue::new();
        let mut pages = Vec::with_capacity(config.page_count);

        for i in 0..config.page_count {
            let page_num = start_page + i as u32;
            let page = VmPage::new(page_to_addr(page_num), page_num);
            page.set_flags(PageFlags::FREE);
            *page.queue.lock() = PageQueueType::Free;
            pages.push(Arc::new(page));
            free.enqueue(page_num);
        }

        Self {
            pages,
            first_page: start_page,
            queues: Mutex::new(PageQueues {
                free,
                active: PageQueue::new(),
                inactive: PageQueue::new(),
                cache: PageQueue::new(),
            }),
            free_count: AtomicU32::new(config.page_count as u32),
            active_count: AtomicU32::new(0),
            inactive_count: AtomicU32::new(0),
            cache_count: AtomicU32::new(0),
            wire_count: AtomicU32::new(0),
            free_reserved: config.free_reserved,
            pageout_free_min: config.pageout_free_min,
            sched,
        }
    }

    /// Scheduler used for page wakeups
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.sched
    }

    /// Get page by number
    pub fn get_page(&self, page_num: u32) -> Option<&Arc<VmPage>> {
        let index = page_num.checked_sub(self.first_page)?;
        self.pages.get(index as usize)
    }

    /// Page owning physical address `phys` (PHYS_TO_VM_PAGE)
    pub fn page_for_phys(&self, phys: u64) -> Option<&Arc<VmPage>> {
        self.get_page(addr_to_page(phys))
    }

    /// Take the busy bit on `page`, if free to do so
    pub fn try_busy(&self, page: &Arc<VmPage>) -> Option<BusyPage> {
        page.try_busy()
            .then(|| BusyPage::new(Arc::clone(page), Arc::clone(&self.sched)))
    }

    /// Allocate a busy page and enter it at `object`/`offset`.
    ///
    /// With `zero` the frame is guaranteed to read as zero.
    pub fn alloc(
        &self,
        object: &Arc<VmObject>,
        offset: u64,
        zero: bool,
    ) -> Result<BusyPage, AllocError> {
        let page = self.take_frame(object.is_kernel())?;

        if let Err(err) = object.insert_page(offset, page.page()) {
            self.release_frame(page.forget());
            return Err(err);
        }

        page.set_valid(0);
        page.set_dirty(0);
        if zero && !page.has_flags(PageFlags::ZERO) {
            page.zero_fill();
        }
        Ok(page)
    }

    /// Pull a frame off the free queue, or reclaim a cached one
    fn take_frame(&self, privileged: bool) -> Result<BusyPage, AllocError> {
        let mut queues = self.queues.lock();
        let free = self.free_count.load(Ordering::SeqCst);

        if free > 0 && (privileged || free > self.free_reserved) {
            if let Some(page_num) = queues.free.dequeue() {
                self.free_count.fetch_sub(1, Ordering::SeqCst);
                let page = self.page_ref(page_num);
                if !page.try_busy() {
                    panic!("vm_page_alloc: free page {} busy", page_num);
                }
                *page.queue.lock() = PageQueueType::None;
                page.clear_flags(PageFlags::FREE);
                return Ok(BusyPage::new(Arc::clone(page), Arc::clone(&self.sched)));
            }
        }

        // Reclaim the oldest cache page nobody is looking at.
        let mut victim = None;
        for _ in 0..queues.cache.len() {
            let Some(page_num) = queues.cache.dequeue() else {
                break;
            };
            let page = self.page_ref(page_num);
            if page.try_busy() {
                victim = Some(Arc::clone(page));
                break;
            }
            queues.cache.enqueue(page_num);
        }
        let page = victim.ok_or(AllocError::NoMemory)?;
        self.cache_count.fetch_sub(1, Ordering::SeqCst);
        *page.queue.lock() = PageQueueType::None;
        page.clear_flags(PageFlags::CACHE);
        drop(queues);

        log::trace!("vm_page_alloc: reclaiming cache page {}", page.page_num);
        Self::disown(&page);
        page.clear_flags(PageFlags::ZERO | PageFlags::MAPPED | PageFlags::WRITEABLE);
        Ok(BusyPage::new(page, Arc::clone(&self.sched)))
    }

    fn page_ref(&self, page_num: u32) -> &Arc<VmPage> {
        &self.pages[(page_num - self.first_page) as usize]
    }

    /// Remove `page` from whatever object names it
    fn disown(page: &Arc<VmPage>) {
        if let Some((object, offset)) = page.take_owner() {
            if let Some(object) = object.upgrade() {
                object.remove_page(offset, page);
            }
        }
    }

    /// Free a busy page (vm_page_free)
    pub fn free(&self, page: BusyPage) {
        let page = page.forget();
        if page.is_wired() {
            panic!("vm_page_free: freeing wired page {}", page.page_num);
        }
        Self::disown(&page);
        self.release_frame(page);
    }

    /// Free a busy page that no object names any more
    pub(crate) fn release_frame(&self, page: Arc<VmPage>) {
        let wanted = {
            let mut queues = self.queues.lock();
            self.unqueue_locked(&mut queues, &page);
            page.flags.store(PageFlags::FREE.bits(), Ordering::SeqCst);
            page.set_valid(0);
            page.set_dirty(0);
            page.wire_count.store(0, Ordering::SeqCst);
            *page.queue.lock() = PageQueueType::Free;
            // Busy must be clear before the frame is visible on the free queue.
            page.busy.store(false, Ordering::SeqCst);
            let wanted = page.wanted.swap(false, Ordering::SeqCst);
            queues.free.enqueue(page.page_num);
            self.free_count.fetch_add(1, Ordering::SeqCst);
            wanted
        };
        if wanted {
            self.sched.wakeup(event_from_addr(page.as_ref()));
        }
        self.sched.wakeup(MEMORY_EVENT);
    }

    fn unqueue_locked(&self, queues: &mut PageQueues, page: &VmPage) {
        let mut current = page.queue.lock();
        if let Some(queue) = queues.get_mut(*current) {
            queue.remove(page.page_num);
        }
        if let Some(count) = self.counter(*current) {
            count.fetch_sub(1, Ordering::SeqCst);
        }
        page.clear_flags(PageFlags::ACTIVE | PageFlags::INACTIVE | PageFlags::CACHE);
        *current = PageQueueType::None;
    }

    fn enqueue_locked(&self, queues: &mut PageQueues, page: &VmPage, which: PageQueueType) {
        self.unqueue_locked(queues, page);
        if let Some(queue) = queues.get_mut(which) {
            queue.enqueue(page.page_num);
        }
        if let Some(count) = self.counter(which) {
            count.fetch_add(1, Ordering::SeqCst);
        }
        match which {
            PageQueueType::Active => page.set_flags(PageFlags::ACTIVE),
            PageQueueType::Inactive => page.set_flags(PageFlags::INACTIVE),
            PageQueueType::Cache => page.set_flags(PageFlags::CACHE),
            _ => {}
        }
        *page.queue.lock() = which;
    }

    fn counter(&self, which: PageQueueType) -> Option<&AtomicU32> {
        match which {
            PageQueueType::Free => Some(&self.free_count),
            PageQueueType::Active => Some(&self.active_count),
            PageQueueType::Inactive => Some(&self.inactive_count),
            PageQueueType::Cache => Some(&self.cache_count),
            PageQueueType::None => None,
        }
    }

    fn move_to(&self, page: &VmPage, which: PageQueueType) {
        if page.is_wired() {
            return;
        }
        let mut queues = self.queues.lock();
        self.enqueue_locked(&mut queues, page, which);
    }

    /// Activate a page (move to active queue)
    pub fn activate(&self, page: &VmPage) {
        if page.queue() != PageQueueType::Active {
            self.move_to(page, PageQueueType::Active);
        }
    }

    /// Deactivate a page (move to inactive queue)
    pub fn deactivate(&self, page: &VmPage) {
        self.move_to(page, PageQueueType::Inactive);
    }

    /// Move a clean page to the cache queue
    pub fn cache(&self, page: &VmPage) {
        self.move_to(page, PageQueueType::Cache);
    }

    /// Wire the page (pin in memory)
    pub fn wire(&self, page: &VmPage) {
        if page.wire_count.fetch_add(1, Ordering::SeqCst) == 0 {
            let mut queues = self.queues.lock();
            self.unqueue_locked(&mut queues, page);
            self.wire_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Unwire the page; the last unwire puts it back on the active queue
    pub fn unwire(&self, page: &VmPage) {
        let prev = page
            .wire_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        if prev == Ok(1) {
            self.wire_count.fetch_sub(1, Ordering::SeqCst);
            let mut queues = self.queues.lock();
            self.enqueue_locked(&mut queues, page, PageQueueType::Active);
        }
    }

    /// Snapshot of `which` queue, oldest first
    pub fn queue_snapshot(&self, which: PageQueueType) -> Vec<Arc<VmPage>> {
        let mut queues = self.queues.lock();
        match queues.get_mut(which) {
            Some(queue) => queue.iter().map(|n| Arc::clone(self.page_ref(n))).collect(),
            None => Vec::new(),
        }
    }

    /// Get number of free pages
    pub fn free_count(&self) -> u32 {
        self.free_count.load(Ordering::SeqCst)
    }

    /// Get number of cached pages
    pub fn cache_count(&self) -> u32 {
        self.cache_count.load(Ordering::SeqCst)
    }

    /// Pages held back from ordinary allocations
    pub fn free_reserved(&self) -> u32 {
        self.free_reserved
    }

    /// Wiring threshold
    pub fn pageout_free_min(&self) -> u32 {
        self.pageout_free_min
    }

    /// Free plus cached pages beyond the reserve (may be negative)
    pub fn reclaimable_headroom(&self) -> i64 {
        self.free_count() as i64 + self.cache_count() as i64 - self.free_reserved as i64
    }

    /// Total frames in the pool
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Get statistics
    pub fn stats(&self) -> PageStats {
        PageStats {
            total: self.pages.len() as u32,
            free: self.free_count.load(Ordering::SeqCst),
            active: self.active_count.load(Ordering::SeqCst),
            inactive: self.inactive_count.load(Ordering::SeqCst),
            cache: self.cache_count.load(Ordering::SeqCst),
            wired: self.wire_count.load(Ordering::SeqCst),
        }
    }

    /// Block until a page is freed (the caller re-checks)
    pub fn wait_for_memory(&self) {
        self.sched.block(MEMORY_EVENT, WaitReason::Memory);
    }
}

/// Convert address to page number
pub const fn addr_to_page(addr: u64) -> u32 {
    (addr >> PAGE_SHIFT) as u32
}

/// Convert page number to address
pub const fn page_to_addr(page: u32) -> u64 {
    (page as u64) << PAGE_SHIFT
}

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}
