//! End-to-end fault resolution scenarios
//!
//! Each test builds a small VM, maps objects into a software pmap and
//! drives `vm_fault` the way a trap handler would.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use mach_fault::kern::sched_prim::{Scheduler, WaitEvent, WaitReason};
use mach_fault::mach_vm::vm_page::{PageQueueType, VM_PAGE_BITS_ALL};
use mach_fault::mach_vm::{
    FaultError, FaultOutcome, MemoryPager, PagerResult, SimpleMap, VmConfig, VmMapEntry,
    VmObject, VmProt,
};

// ════════════════════════════════════════════════════════════
// Zero-fill and Soft Faults
// ════════════════════════════════════════════════════════════

#[test]
fn test_zero_fill_installs_one_page() {
    let h = Harness::new(32);
    let obj = h.sys.objects().allocate(4 * PAGE);
    let map = h.map_object(&obj, 4, VmProt::DEFAULT);
    let refs = obj.ref_count();

    let outcome = h.sys.vm_fault(&map, va(1) + 0x123, VmProt::READ, false);
    assert_eq!(outcome, Ok(FaultOutcome::Soft));

    let entry = map.soft_pmap().mapping(va(1)).expect("page installed");
    let page = h.sys.pages().page_for_phys(entry.phys).expect("frame");
    assert!(!page.is_busy());
    assert!(page.is_zero());
    assert_eq!(page.valid(), VM_PAGE_BITS_ALL);
    assert_eq!(page.offset(), Some(PAGE));
    assert_eq!(page.queue(), PageQueueType::Active);
    assert_eq!(obj.resident_offsets(), vec![PAGE]);

    assert_eq!(obj.ref_count(), refs);
    assert_eq!(obj.paging_in_progress(), 0);
    assert_eq!(map.outstanding_lookups(), 0);
    assert_eq!(h.stats.zero_fill(), 1);
    assert_eq!(h.stats.total(), 1);
}

#[test]
fn test_write_fault_marks_page_dirty() {
    let h = Harness::new(32);
    let obj = h.sys.objects().allocate(4 * PAGE);
    let map = h.map_object(&obj, 4, VmProt::DEFAULT);

    h.sys.vm_fault(&map, va(0), VmProt::WRITE, false).unwrap();

    let entry = map.soft_pmap().mapping(va(0)).unwrap();
    assert!(entry.prot.can_write());
    let page = obj.page_lookup(0).unwrap();
    assert_eq!(page.dirty(), VM_PAGE_BITS_ALL);
    assert!(obj
        .get_flags()
        .contains(mach_fault::mach_vm::ObjectFlags::MIGHTBEDIRTY));
}

#[test]
fn test_soft_refault_does_no_io() {
    let h = Harness::new(32);
    let pager = Arc::new(MemoryPager::new());
    pager.insert_filled(0, 0xab);
    let obj = h.sys.objects().allocate_with_pager(PAGE, pager.clone());
    let map = h.map_object(&obj, 1, VmProt::DEFAULT);

    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::READ, false), Ok(FaultOutcome::Hard));
    assert_eq!(pager.fetches(), 1);
    assert_eq!(byte_at(&h, &map, va(0)), 0xab);

    let page = obj.page_lookup(0).unwrap();
    let (valid, dirty) = (page.valid(), page.dirty());

    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::READ, false), Ok(FaultOutcome::Soft));
    assert_eq!(pager.fetches(), 1);
    assert_eq!(page.valid(), valid);
    assert_eq!(page.dirty(), dirty);
    assert_eq!(h.stats.hard(), 1);
    assert_eq!(h.stats.soft(), 1);
}

// ════════════════════════════════════════════════════════════
// Errors
// ════════════════════════════════════════════════════════════

#[test]
fn test_fault_past_object_end() {
    let h = Harness::new(32);
    let obj = h.sys.objects().allocate(2 * PAGE);
    // The entry is larger than the object behind it.
    let map = h.map_object(&obj, 4, VmProt::DEFAULT);
    let free = h.sys.pages().free_count();
    let refs = obj.ref_count();

    assert_eq!(
        h.sys.vm_fault(&map, va(2), VmProt::READ, false),
        Err(FaultError::OutOfRange)
    );
    assert_eq!(h.sys.pages().free_count(), free);
    assert_eq!(obj.resident_page_count(), 0);
    assert_eq!(obj.ref_count(), refs);
    assert_eq!(map.outstanding_lookups(), 0);
    assert_eq!(h.stats.failures(), 1);
}

#[test]
fn test_lookup_failures_pass_through() {
    let h = Harness::new(8);
    let obj = h.sys.objects().allocate(PAGE);
    let map = h.map_object(&obj, 1, VmProt::READ);

    assert_eq!(
        h.sys.vm_fault(&map, va(0), VmProt::WRITE, false),
        Err(FaultError::Protection)
    );
    assert_eq!(
        h.sys.vm_fault(&map, va(5), VmProt::READ, false),
        Err(FaultError::InvalidAddress)
    );
    assert_eq!(FaultError::InvalidAddress.kern_return(), 1);
    assert_eq!(obj.resident_page_count(), 0);
}

#[test]
fn test_pager_errors_free_the_page() {
    let h = Harness::new(32);
    let pager = Arc::new(MemoryPager::new());
    pager.insert_filled(0, 1);
    pager.insert_filled(PAGE, 2);
    pager.fail_at(0, PagerResult::Error);
    pager.fail_at(PAGE, PagerResult::Bad);
    let obj = h.sys.objects().allocate_with_pager(2 * PAGE, pager.clone());
    let map = h.map_object(&obj, 2, VmProt::DEFAULT);
    let free = h.sys.pages().free_count();
    let refs = obj.ref_count();

    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::READ, false), Err(FaultError::Io));
    assert_eq!(
        h.sys.vm_fault(&map, va(1), VmProt::READ, false),
        Err(FaultError::OutOfRange)
    );
    assert_eq!(FaultError::Io.kern_return(), 5);
    assert_eq!(obj.resident_page_count(), 0);
    assert_eq!(h.sys.pages().free_count(), free);
    assert_eq!(obj.ref_count(), refs);
    assert!(!map.soft_pmap().is_mapped(va(0)));

    // Once the pager recovers the same address resolves.
    pager.clear_failure(0);
    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::READ, false), Ok(FaultOutcome::Hard));
    assert_eq!(byte_at(&h, &map, va(0)), 1);
}

#[test]
#[should_panic(expected = "kernel map")]
fn test_pager_error_on_kernel_map_panics() {
    let h = Harness::new(16);
    let pager = Arc::new(MemoryPager::new());
    pager.insert_filled(0, 1);
    pager.fail_at(0, PagerResult::Error);
    let obj = h.sys.objects().allocate_with_pager(PAGE, pager);
    let map = SimpleMap::kernel(h.pv.create_pmap());
    map.enter(VmMapEntry::new(BASE, BASE + PAGE, Some(obj), 0))
        .unwrap();

    let _ = h.sys.vm_fault(&map, BASE, VmProt::READ, false);
}

#[test]
fn test_pager_without_page_zero_fills() {
    let h = Harness::new(16);
    let pager = Arc::new(MemoryPager::new());
    pager.insert_filled(PAGE, 9);
    let obj = h.sys.objects().allocate_with_pager(2 * PAGE, pager.clone());
    let map = h.map_object(&obj, 2, VmProt::DEFAULT);

    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::READ, false), Ok(FaultOutcome::Soft));
    assert_eq!(byte_at(&h, &map, va(0)), 0);
    assert_eq!(pager.fetches(), 0);
    assert_eq!(h.stats.zero_fill(), 1);
}

// ════════════════════════════════════════════════════════════
// Shadow Chains and Copy-on-Write
// ════════════════════════════════════════════════════════════

#[test]
fn test_read_through_shadow_is_read_only() {
    let h = Harness::new(32);
    let backing = h.sys.objects().allocate(2 * PAGE);
    h.populate(&backing, 0, 0x11);
    let top = h.sys.objects().shadow(&backing, 0, 2 * PAGE);
    let map = h.map_object(&top, 2, VmProt::DEFAULT);
    let free = h.sys.pages().free_count();

    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::READ, false), Ok(FaultOutcome::Soft));

    let entry = map.soft_pmap().mapping(va(0)).unwrap();
    assert!(!entry.prot.can_write());
    assert_eq!(entry.phys, backing.page_lookup(0).unwrap().phys_addr);
    // The placeholder in the top object was given back.
    assert_eq!(top.resident_page_count(), 0);
    assert_eq!(h.sys.pages().free_count(), free);
    assert_eq!(h.stats.cow(), 0);
}

#[test]
fn test_copy_on_write_diverges() {
    let h = Harness::new(32);
    let backing = h.sys.objects().allocate(2 * PAGE);
    h.populate(&backing, 0, 0x11);

    // Two address spaces share the backing object through their own shadows.
    backing.reference();
    let top_a = h.sys.objects().shadow(&backing, 0, 2 * PAGE);
    let top_b = h.sys.objects().shadow(&backing, 0, 2 * PAGE);
    let map_a = h.map_object(&top_a, 2, VmProt::DEFAULT);
    let map_b = h.map_object(&top_b, 2, VmProt::DEFAULT);

    h.sys.vm_fault(&map_a, va(0), VmProt::READ, false).unwrap();
    h.sys.vm_fault(&map_b, va(0), VmProt::READ, false).unwrap();
    let original = backing.page_lookup(0).unwrap();
    assert_eq!(h.pv.mapping_count(original.phys_addr), 2);

    assert_eq!(h.sys.vm_fault(&map_a, va(0), VmProt::WRITE, false), Ok(FaultOutcome::Soft));
    assert_eq!(h.stats.cow(), 1);

    let copy = top_a.page_lookup(0).expect("copy in top object");
    assert!(!Arc::ptr_eq(&copy, &original));
    assert_eq!(copy.dirty(), VM_PAGE_BITS_ALL);
    let entry = map_a.soft_pmap().mapping(va(0)).unwrap();
    assert_eq!(entry.phys, copy.phys_addr);
    assert!(entry.prot.can_write());

    // Every mapping of the original was revoked.
    assert_eq!(h.pv.mapping_count(original.phys_addr), 0);
    assert!(!map_b.soft_pmap().is_mapped(va(0)));

    copy.write(0, &[0x22]);
    assert_eq!(byte_at(&h, &map_a, va(0)), 0x22);
    h.sys.vm_fault(&map_b, va(0), VmProt::READ, false).unwrap();
    assert_eq!(byte_at(&h, &map_b, va(0)), 0x11);
    assert!(!original.is_busy());
    assert_eq!(backing.paging_in_progress(), 0);
}

#[test]
fn test_copy_on_write_collapses_private_backing() {
    let h = Harness::new(32);
    let backing = h.sys.objects().allocate(2 * PAGE);
    h.populate(&backing, 0, 0x31);
    h.populate(&backing, 1, 0x32);
    let top = h.sys.objects().shadow(&backing, 0, 2 * PAGE);
    let map = h.map_object(&top, 2, VmProt::DEFAULT);
    let objects = h.sys.objects().object_count();

    h.sys.vm_fault(&map, va(0), VmProt::WRITE, false).unwrap();

    // The backing object was only reachable through `top` and folds into it.
    assert_eq!(h.sys.objects().collapse_count(), 1);
    assert_eq!(h.sys.objects().object_count(), objects - 1);
    assert!(backing.is_dead());
    assert_eq!(top.backing(), None);
    assert_eq!(top.resident_offsets(), vec![0, PAGE]);

    h.sys.vm_fault(&map, va(1), VmProt::READ, false).unwrap();
    assert_eq!(byte_at(&h, &map, va(1)), 0x32);
    assert_eq!(byte_at(&h, &map, va(0)), 0x31);
}

#[test]
fn test_deep_chain_reaches_bottom_pager() {
    let h = Harness::new(32);
    let pager = Arc::new(MemoryPager::new());
    pager.insert_filled(2 * PAGE, 0x5a);
    let bottom = h.sys.objects().allocate_with_pager(4 * PAGE, pager.clone());
    let middle = h.sys.objects().shadow(&bottom, PAGE, 3 * PAGE);
    let top = h.sys.objects().shadow(&middle, 0, 3 * PAGE);
    let map = h.map_object(&top, 3, VmProt::DEFAULT);

    // Page 1 of the top is page 2 of the bottom.
    assert_eq!(h.sys.vm_fault(&map, va(1), VmProt::READ, false), Ok(FaultOutcome::Hard));
    assert_eq!(byte_at(&h, &map, va(1)), 0x5a);
    assert_eq!(bottom.resident_offsets(), vec![2 * PAGE]);
    assert_eq!(middle.resident_page_count(), 0);
    assert_eq!(top.resident_page_count(), 0);
    assert_eq!(bottom.paging_in_progress(), 0);
    assert_eq!(middle.paging_in_progress(), 0);

    // Nothing anywhere for page 0 of the top: zero-filled there.
    h.sys.vm_fault(&map, va(0), VmProt::READ, false).unwrap();
    assert_eq!(top.resident_offsets(), vec![0]);
    assert_eq!(byte_at(&h, &map, va(0)), 0);
}

// ════════════════════════════════════════════════════════════
// Clustered Page-in
// ════════════════════════════════════════════════════════════

#[test]
fn test_cluster_stops_at_resident_neighbours() {
    let h = Harness::new(64);
    let pager = Arc::new(MemoryPager::new());
    for n in 0..16 {
        pager.insert_filled(n * PAGE, n as u8 + 1);
    }
    let obj = h.sys.objects().allocate_with_pager(16 * PAGE, pager.clone());
    h.populate(&obj, 5, 0xee);
    h.populate(&obj, 8, 0xee);

    let requested = h.sys.pages().alloc(&obj, 7 * PAGE, false).unwrap();
    let plan = h
        .sys
        .vm_fault_additional_pages(&obj, 7 * PAGE, 4, 4)
        .expect("pager has the page");
    assert_eq!(plan.offsets().collect::<Vec<_>>(), vec![6 * PAGE, 7 * PAGE]);
    assert_eq!(plan.reqpage(), 1);
    assert_eq!(plan.len(), 2);
    assert!(obj.page_lookup(6 * PAGE).unwrap().is_busy());
    drop(plan);
    requested.free(h.sys.pages());
}

#[test]
fn test_fault_reads_cluster() {
    let h = Harness::new(64);
    let pager = Arc::new(MemoryPager::new());
    for n in 0..16 {
        pager.insert_filled(n * PAGE, n as u8 + 1);
    }
    let obj = h.sys.objects().allocate_with_pager(16 * PAGE, pager.clone());
    h.populate(&obj, 5, 0xee);
    h.populate(&obj, 8, 0xee);
    let map = h.map_object(&obj, 16, VmProt::DEFAULT);

    assert_eq!(h.sys.vm_fault(&map, va(7), VmProt::READ, false), Ok(FaultOutcome::Hard));
    assert_eq!(pager.fetches(), 1);
    assert_eq!(pager.pages_read(), 2);
    assert_eq!(byte_at(&h, &map, va(7)), 8);

    // The neighbour is resident but not mapped and waits on the inactive queue.
    let neighbour = obj.page_lookup(6 * PAGE).unwrap();
    assert!(!neighbour.is_busy());
    assert!(neighbour.is_fully_valid());
    assert_eq!(neighbour.queue(), PageQueueType::Inactive);
    assert!(!map.soft_pmap().is_mapped(va(6)));

    assert_eq!(h.sys.vm_fault(&map, va(6), VmProt::READ, false), Ok(FaultOutcome::Soft));
    assert_eq!(byte_at(&h, &map, va(6)), 7);
    assert_eq!(pager.fetches(), 1);
}

#[test]
fn test_tight_memory_reads_single_page() {
    let mut config = VmConfig::with_pages(8);
    config.free_reserved = 6;
    config.pageout_free_min = 0;
    let h = Harness::with_config(config, Arc::new(mach_fault::SpinScheduler::new()));
    let pager = Arc::new(MemoryPager::new());
    for n in 0..8 {
        pager.insert_filled(n * PAGE, 1);
    }
    let obj = h.sys.objects().allocate_with_pager(8 * PAGE, pager.clone());
    let map = h.map_object(&obj, 8, VmProt::DEFAULT);

    assert_eq!(h.sys.vm_fault(&map, va(3), VmProt::READ, false), Ok(FaultOutcome::Hard));
    assert_eq!(pager.pages_read(), 1);
    assert_eq!(obj.resident_offsets(), vec![3 * PAGE]);
    assert!(h.sys.pageout().wakeups() >= 1);
}

// ════════════════════════════════════════════════════════════
// Concurrency
// ════════════════════════════════════════════════════════════

#[test]
fn test_concurrent_faults_fetch_once() {
    let h = Harness::new(64);
    let stats = Arc::clone(&h.stats);
    let pager = Arc::new(MemoryPager::new().with_fetch_hook(move |_| {
        // Hold the page busy until the other fault has queued up behind it.
        let deadline = Instant::now() + Duration::from_secs(2);
        while stats.busy_waits() == 0 && Instant::now() < deadline {
            thread::yield_now();
        }
    }));
    pager.insert_filled(0, 0x77);
    let obj = h.sys.objects().allocate_with_pager(PAGE, pager.clone());
    let map = h.map_object(&obj, 1, VmProt::DEFAULT);

    let (sys, shared_map) = (&h.sys, &map);
    let outcomes: Vec<_> = thread::scope(|s| {
        let workers: Vec<_> = (0..2)
            .map(|_| s.spawn(move || sys.vm_fault(shared_map, va(0), VmProt::READ, false)))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert!(outcomes.contains(&Ok(FaultOutcome::Hard)));
    assert!(outcomes.contains(&Ok(FaultOutcome::Soft)));
    assert_eq!(pager.fetches(), 1);
    assert!(h.stats.busy_waits() >= 1);
    assert_eq!(obj.resident_page_count(), 1);
    assert!(!obj.page_lookup(0).unwrap().is_busy());
    assert_eq!(obj.paging_in_progress(), 0);
    assert_eq!(map.outstanding_lookups(), 0);
}

// ════════════════════════════════════════════════════════════
// Memory Shortage
// ════════════════════════════════════════════════════════════

type Reclaim = Box<dyn FnMut() + Send>;

/// Scheduler that frees memory the first time a thread waits for it
struct ReclaimingScheduler {
    reclaim: Mutex<Option<Reclaim>>,
    memory_waits: AtomicU64,
}

impl ReclaimingScheduler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            reclaim: Mutex::new(None),
            memory_waits: AtomicU64::new(0),
        })
    }

    /// Deallocate `hog` the first time a thread waits for memory
    fn free_on_wait(&self, h: &Arc<Harness>, hog: Arc<VmObject>) {
        let weak = Arc::downgrade(h);
        let hog_slot = Mutex::new(Some(hog));
        *self.reclaim.lock().unwrap() = Some(Box::new(move || {
            if let (Some(h), Some(hog)) = (weak.upgrade(), hog_slot.lock().unwrap().take()) {
                h.sys.objects().deallocate(&hog);
            }
        }));
    }
}

impl Scheduler for ReclaimingScheduler {
    fn block(&self, _event: WaitEvent, reason: WaitReason) {
        if reason == WaitReason::Memory {
            self.memory_waits.fetch_add(1, Ordering::SeqCst);
            let reclaim = self.reclaim.lock().unwrap().take();
            if let Some(mut reclaim) = reclaim {
                reclaim();
            }
        }
    }

    fn wakeup(&self, _event: WaitEvent) {}
}

#[test]
fn test_fault_waits_for_memory() {
    let sched = ReclaimingScheduler::new();
    let mut config = VmConfig::with_pages(4);
    config.free_reserved = 0;
    config.pageout_free_min = 0;
    let h = Arc::new(Harness::with_config(config, sched.clone()));

    let hog: Arc<VmObject> = h.sys.objects().allocate(4 * PAGE);
    for n in 0..4 {
        h.populate(&hog, n, 1);
    }
    assert_eq!(h.sys.pages().free_count(), 0);
    sched.free_on_wait(&h, hog);

    let obj = h.sys.objects().allocate(PAGE);
    let map = h.map_object(&obj, 1, VmProt::DEFAULT);
    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::READ, false), Ok(FaultOutcome::Soft));

    assert_eq!(sched.memory_waits.load(Ordering::SeqCst), 1);
    assert_eq!(h.stats.memory_waits(), 1);
    assert!(h.sys.pageout().wakeups() >= 1);
    assert_eq!(h.sys.pages().free_count(), 3);
    assert_eq!(map.outstanding_lookups(), 0);
}

#[test]
fn test_pageout_then_refault() {
    let h = Harness::new(16);
    let pager = Arc::new(MemoryPager::new());
    pager.insert_filled(0, 0x42);
    let obj = h.sys.objects().allocate_with_pager(PAGE, pager.clone());
    let map = h.map_object(&obj, 1, VmProt::DEFAULT);

    h.sys.vm_fault(&map, va(0), VmProt::READ, false).unwrap();
    let page = obj.page_lookup(0).unwrap();
    h.sys.pages().deactivate(&page);
    page.clear_flags(mach_fault::mach_vm::PageFlags::REFERENCED);

    // Cached and unmapped, but still resident.
    h.sys.run_pageout();
    assert_eq!(page.queue(), PageQueueType::Cache);
    assert!(!map.soft_pmap().is_mapped(va(0)));

    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::READ, false), Ok(FaultOutcome::Soft));
    assert_eq!(page.queue(), PageQueueType::Active);
    assert_eq!(byte_at(&h, &map, va(0)), 0x42);
    assert_eq!(pager.fetches(), 1);
}

#[test]
fn test_cached_page_below_reserve_waits_for_memory() {
    let sched = ReclaimingScheduler::new();
    let mut config = VmConfig::with_pages(4);
    config.free_reserved = 2;
    config.pageout_free_min = 0;
    let h = Arc::new(Harness::with_config(config, sched.clone()));

    let obj = h.sys.objects().allocate(PAGE);
    h.populate(&obj, 0, 0x21);
    let map = h.map_object(&obj, 1, VmProt::DEFAULT);

    // Kernel objects may dig into the reserve.
    let hog = h.sys.objects().allocate_kernel(2 * PAGE);
    h.populate(&hog, 0, 1);
    h.populate(&hog, 1, 1);
    let page = obj.page_lookup(0).unwrap();
    h.sys.pages().cache(&page);
    assert_eq!(h.sys.pages().free_count() + h.sys.pages().cache_count(), 2);
    sched.free_on_wait(&h, hog);

    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::READ, false), Ok(FaultOutcome::Soft));
    assert_eq!(sched.memory_waits.load(Ordering::SeqCst), 1);
    assert_eq!(h.stats.memory_waits(), 1);
    assert_eq!(page.queue(), PageQueueType::Active);
    assert!(!page.is_busy());
    assert_eq!(byte_at(&h, &map, va(0)), 0x21);
    assert_eq!(h.sys.pages().free_count(), 3);
}

#[test]
fn test_store_after_read_fault_survives_pageout() {
    let h = Harness::new(4);
    let obj = h.sys.objects().allocate(PAGE);
    let map = h.map_object(&obj, 1, VmProt::DEFAULT);

    h.sys.vm_fault(&map, va(0), VmProt::READ, false).unwrap();
    let page = obj.page_lookup(0).unwrap();
    assert!(map.soft_pmap().protection(va(0)).unwrap().can_write());
    assert_eq!(page.dirty(), 0);

    store_byte(&h, &map, va(0), 0x5c);
    h.sys.pages().deactivate(&page);
    page.clear_flags(mach_fault::mach_vm::PageFlags::REFERENCED);
    h.sys.run_pageout();

    // The store shows up as dirt and keeps the page off the cache queue.
    assert_eq!(page.dirty(), VM_PAGE_BITS_ALL);
    assert_eq!(page.queue(), PageQueueType::Inactive);
    assert!(map.soft_pmap().is_mapped(va(0)));

    let hog = h.sys.objects().allocate(3 * PAGE);
    for n in 0..3 {
        h.populate(&hog, n, 1);
    }
    assert_eq!(h.sys.pages().free_count(), 0);

    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::READ, false), Ok(FaultOutcome::Soft));
    assert!(Arc::ptr_eq(&obj.page_lookup(0).unwrap(), &page));
    assert_eq!(byte_at(&h, &map, va(0)), 0x5c);
}

// ════════════════════════════════════════════════════════════
// Partially Valid Pages
// ════════════════════════════════════════════════════════════

#[test]
fn test_partially_valid_page_is_zero_filled() {
    let h = Harness::new(16);
    let obj = h.sys.objects().allocate(PAGE);
    h.populate(&obj, 0, 0xaa);
    let page = obj.page_lookup(0).unwrap();
    page.set_valid(0x0f);
    let map = h.map_object(&obj, 1, VmProt::DEFAULT);
    let free = h.sys.pages().free_count();

    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::READ, false), Ok(FaultOutcome::Soft));
    assert_eq!(map.soft_pmap().mapping(va(0)).unwrap().phys, page.phys_addr);
    assert_eq!(page.valid(), VM_PAGE_BITS_ALL);
    assert_eq!(byte_at(&h, &map, va(0)), 0);
    assert_eq!(h.stats.zero_fill(), 1);
    assert_eq!(h.sys.pages().free_count(), free);
}

#[test]
fn test_partially_valid_top_page_copied_from_backing() {
    let h = Harness::new(16);
    let backing = h.sys.objects().allocate(PAGE);
    h.populate(&backing, 0, 0x11);
    let top = h.sys.objects().shadow(&backing, 0, PAGE);
    h.populate(&top, 0, 0xaa);
    let partial = top.page_lookup(0).unwrap();
    partial.set_valid(0x0f);
    let map = h.map_object(&top, 1, VmProt::DEFAULT);

    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::WRITE, false), Ok(FaultOutcome::Soft));
    assert_eq!(h.stats.cow(), 1);
    assert!(Arc::ptr_eq(&top.page_lookup(0).unwrap(), &partial));
    assert_eq!(partial.valid(), VM_PAGE_BITS_ALL);
    assert_eq!(partial.dirty(), VM_PAGE_BITS_ALL);
    assert_eq!(byte_at(&h, &map, va(0)), 0x11);
}

#[test]
fn test_pager_fail_below_top_zero_fills_top() {
    let h = Harness::new(16);
    let pager = Arc::new(MemoryPager::new());
    pager.insert_filled(0, 0x33);
    pager.fail_at(0, PagerResult::Fail);
    let bottom = h.sys.objects().allocate_with_pager(PAGE, pager.clone());
    let top = h.sys.objects().shadow(&bottom, 0, PAGE);
    let map = h.map_object(&top, 1, VmProt::DEFAULT);
    let free = h.sys.pages().free_count();

    assert_eq!(h.sys.vm_fault(&map, va(0), VmProt::WRITE, false), Ok(FaultOutcome::Soft));
    assert_eq!(pager.fetches(), 1);
    // The page offered to the pager was discarded.
    assert_eq!(bottom.resident_page_count(), 0);
    assert_eq!(bottom.paging_in_progress(), 0);
    assert_eq!(top.resident_offsets(), vec![0]);
    assert_eq!(byte_at(&h, &map, va(0)), 0);
    assert_eq!(h.stats.zero_fill(), 1);
    assert_eq!(h.stats.cow(), 0);
    assert_eq!(h.sys.pages().free_count(), free - 1);
}

// ════════════════════════════════════════════════════════════
// Re-validation After Page-in
// ════════════════════════════════════════════════════════════

type EntrySwap = Arc<Mutex<Option<(Weak<SimpleMap>, VmMapEntry)>>>;

/// Pager whose first fetch replaces a map entry, as a racing thread might
fn pager_replacing_entry(slot: &EntrySwap) -> MemoryPager {
    let slot = Arc::clone(slot);
    MemoryPager::new().with_fetch_hook(move |_| {
        let swap = slot.lock().unwrap().take();
        if let Some((map, entry)) = swap {
            if let Some(map) = map.upgrade() {
                map.replace(entry).unwrap();
            }
        }
    })
}

#[test]
fn test_mapping_moved_during_pagein_retries() {
    let h = Harness::new(16);
    let slot: EntrySwap = Arc::new(Mutex::new(None));
    let pager = Arc::new(pager_replacing_entry(&slot));
    pager.insert_filled(0, 0x10);
    let paged = h.sys.objects().allocate_with_pager(PAGE, pager.clone());
    let other = h.sys.objects().allocate(PAGE);
    h.populate(&other, 0, 0x20);
    let map = Arc::new(h.map_object(&paged, 1, VmProt::DEFAULT));
    *slot.lock().unwrap() = Some((
        Arc::downgrade(&map),
        VmMapEntry::new(BASE, BASE + PAGE, Some(Arc::clone(&other)), 0),
    ));

    assert_eq!(h.sys.vm_fault(&*map, va(0), VmProt::READ, false), Ok(FaultOutcome::Soft));
    assert_eq!(pager.fetches(), 1);
    assert_eq!(byte_at(&h, &map, va(0)), 0x20);

    // The page read for the old mapping stays resident, unmapped.
    let stale = paged.page_lookup(0).expect("page kept");
    assert!(!stale.is_busy());
    assert!(stale.is_fully_valid());
    assert_eq!(stale.queue(), PageQueueType::Active);
    assert_eq!(h.pv.mapping_count(stale.phys_addr), 0);
    assert_eq!(paged.paging_in_progress(), 0);
    assert_eq!(map.outstanding_lookups(), 0);
}

#[test]
fn test_mapping_revoked_during_pagein_fails() {
    let h = Harness::new(16);
    let slot: EntrySwap = Arc::new(Mutex::new(None));
    let pager = Arc::new(pager_replacing_entry(&slot));
    pager.insert_filled(0, 0x10);
    let paged = h.sys.objects().allocate_with_pager(PAGE, pager.clone());
    let map = Arc::new(h.map_object(&paged, 1, VmProt::DEFAULT));
    *slot.lock().unwrap() = Some((
        Arc::downgrade(&map),
        VmMapEntry::new(BASE, BASE + PAGE, Some(Arc::clone(&paged)), 0)
            .with_protection(VmProt::NONE),
    ));
    let free = h.sys.pages().free_count();

    assert_eq!(
        h.sys.vm_fault(&*map, va(0), VmProt::READ, false),
        Err(FaultError::Protection)
    );
    assert!(!map.soft_pmap().is_mapped(va(0)));
    assert_eq!(h.stats.failures(), 1);

    // The page that was read is released, not leaked busy.
    let page = paged.page_lookup(0).expect("page kept");
    assert!(!page.is_busy());
    let mut buf = [0u8; 1];
    page.read(0, &mut buf);
    assert_eq!(buf[0], 0x10);
    assert_eq!(h.sys.pages().free_count(), free - 1);
    assert_eq!(paged.paging_in_progress(), 0);
    assert_eq!(map.outstanding_lookups(), 0);
}
