//! VM Pager - Backing Store Contract
//!
//! Based on Mach4 vm/vm_pager.h and the memory_object data request path.
//!
//! A pager answers two questions for the fault handler: does it hold the
//! page at an offset (and how many neighbours are contiguous with it), and
//! please fill these pages. The pager fills frame contents and valid bits;
//! what happens to the pages afterwards is the caller's business.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::mach_vm::vm_object::VmObject;
use crate::mach_vm::vm_page::{VmPage, PAGE_SIZE, VM_PAGE_BITS_ALL};

// ============================================================================
// Pager Contract
// ============================================================================

/// Contiguous pages a pager holds around a queried offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PagerExtent {
    /// Pages available immediately before the offset
    pub behind: usize,
    /// Pages available immediately after the offset
    pub ahead: usize,
}

/// Result of a page-in request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerResult {
    /// Requested page filled
    Ok,
    /// Pager does not have the page
    Fail,
    /// I/O error reading the page
    Error,
    /// Offset outside the pager's range
    Bad,
}

/// Supplier of page contents for an object
pub trait Pager: Send + Sync {
    /// Does the pager hold `offset`? (vm_pager_has_page)
    fn has_page(&self, object: &VmObject, offset: u64) -> Option<PagerExtent>;

    /// Fill `pages`, of which `pages[reqpage]` is the one faulted on.
    ///
    /// Pages arrive busy and entered in `object`. The pager writes their
    /// contents and sets their valid bits.
    fn get_pages(&self, object: &VmObject, pages: &[&VmPage], reqpage: usize) -> PagerResult;
}

// ============================================================================
// Memory Pager
// ============================================================================

type FetchHook = Box<dyn Fn(u64) + Send + Sync>;

/// Pager serving page images held in memory
///
/// Images are keyed by object offset. A failure can be planted at an
/// offset; requests whose faulted page sits there return that result.
pub struct MemoryPager {
    images: Mutex<BTreeMap<u64, Box<[u8]>>>,
    failures: Mutex<BTreeMap<u64, PagerResult>>,
    hook: Option<FetchHook>,
    fetches: AtomicU64,
    pages_read: AtomicU64,
}

impl MemoryPager {
    pub fn new() -> Self {
        Self {
            images: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(BTreeMap::new()),
            hook: None,
            fetches: AtomicU64::new(0),
            pages_read: AtomicU64::new(0),
        }
    }

    /// Run `hook(offset)` at the start of every fetch
    pub fn with_fetch_hook(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Store the image for the page at `offset`, zero padded
    pub fn insert(&self, offset: u64, bytes: &[u8]) {
        let mut image = alloc::vec![0u8; PAGE_SIZE];
        let len = bytes.len().min(PAGE_SIZE);
        image[..len].copy_from_slice(&bytes[..len]);
        self.images.lock().insert(offset, image.into_boxed_slice());
    }

    /// Store a page at `offset` whose every byte is `byte`
    pub fn insert_filled(&self, offset: u64, byte: u8) {
        self.images
            .lock()
            .insert(offset, alloc::vec![byte; PAGE_SIZE].into_boxed_slice());
    }

    /// Make requests for `offset` fail with `result`
    pub fn fail_at(&self, offset: u64, result: PagerResult) {
        self.failures.lock().insert(offset, result);
    }

    /// Remove a planted failure
    pub fn clear_failure(&self, offset: u64) {
        self.failures.lock().remove(&offset);
    }

    /// Number of `get_pages` calls
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of pages filled
    pub fn pages_read(&self) -> u64 {
        self.pages_read.load(Ordering::SeqCst)
    }

    /// Offsets held, ascending
    pub fn offsets(&self) -> Vec<u64> {
        self.images.lock().keys().copied().collect()
    }
}

impl Default for MemoryPager {
    fn default() -> Self {
        Self::new()
    }
}

impl Pager for MemoryPager {
    fn has_page(&self, _object: &VmObject, offset: u64) -> Option<PagerExtent> {
        let images = self.images.lock();
        if !images.contains_key(&offset) {
            return None;
        }

        let page = PAGE_SIZE as u64;
        let behind = (1..)
            .take_while(|i| {
                offset
                    .checked_sub(i * page)
                    .is_some_and(|o| images.contains_key(&o))
            })
            .count();
        let ahead = (1..)
            .take_while(|i| images.contains_key(&(offset + i * page)))
            .count();
        Some(PagerExtent { behind, ahead })
    }

    fn get_pages(&self, _object: &VmObject, pages: &[&VmPage], reqpage: usize) -> PagerResult {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let Some(requested) = pages.get(reqpage).and_then(|p| p.offset()) else {
            return PagerResult::Bad;
        };
        if let Some(hook) = &self.hook {
            hook(requested);
        }
        if let Some(&result) = self.failures.lock().get(&requested) {
            log::warn!("memory pager: planted {:?} at {:#x}", result, requested);
            return result;
        }

        let images = self.images.lock();
        if !images.contains_key(&requested) {
            return PagerResult::Fail;
        }
        for page in pages {
            let Some(image) = page.offset().and_then(|o| images.get(&o)) else {
                continue;
            };
            page.write(0, image);
            page.set_valid(VM_PAGE_BITS_ALL);
            self.pages_read.fetch_add(1, Ordering::SeqCst);
        }
        PagerResult::Ok
    }
}
