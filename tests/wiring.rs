//! Wiring, wired-region copy and prefault

mod common;

use std::sync::Arc;

use common::*;
use mach_fault::mach_vm::vm_page::PageQueueType;
use mach_fault::mach_vm::{FaultError, MemoryPager, VmMapEntry, VmProt};

#[test]
fn test_wire_and_unwire_range() {
    let h = Harness::new(32);
    let obj = h.sys.objects().allocate(4 * PAGE);
    let map = h.map_object(&obj, 4, VmProt::DEFAULT);
    map.set_wired(va(0), va(4), true);

    h.sys.vm_fault_wire(&map, va(0), va(4)).unwrap();

    let pmap = map.soft_pmap();
    for n in 0..4 {
        assert!(pmap.is_wired(va(n)));
        let page = obj.page_lookup(n * PAGE).unwrap();
        assert_eq!(page.wire_count(), 1);
        assert_eq!(page.queue(), PageQueueType::None);
        assert!(!page.is_busy());
    }
    assert_eq!(h.sys.pages().stats().wired, 4);
    assert_eq!(pmap.stats.wired(), 4);

    h.sys.vm_fault_unwire(&map, va(0), va(4));
    map.set_wired(va(0), va(4), false);

    for n in 0..4 {
        assert!(pmap.is_mapped(va(n)));
        assert!(!pmap.is_wired(va(n)));
        assert_eq!(obj.page_lookup(n * PAGE).unwrap().queue(), PageQueueType::Active);
    }
    assert_eq!(h.sys.pages().stats().wired, 0);
}

#[test]
fn test_wire_read_only_entry() {
    let h = Harness::new(16);
    let pager = Arc::new(MemoryPager::new());
    pager.insert_filled(0, 3);
    let obj = h.sys.objects().allocate_with_pager(PAGE, pager.clone());
    let map = h.map_object(&obj, 1, VmProt::READ);
    map.set_wired(va(0), va(1), true);

    // A wired entry is faulted with its own protection.
    h.sys.vm_fault_wire(&map, va(0), va(1)).unwrap();
    let entry = map.soft_pmap().mapping(va(0)).unwrap();
    assert!(entry.wired);
    assert_eq!(entry.prot, VmProt::READ);
    assert_eq!(pager.fetches(), 1);
    assert_eq!(byte_at(&h, &map, va(0)), 3);
}

#[test]
fn test_failed_wire_unwinds() {
    let h = Harness::new(32);
    // Ten pages mapped, seven backed: the eighth page faults out of range.
    let obj = h.sys.objects().allocate(7 * PAGE);
    let map = h.map_object(&obj, 10, VmProt::DEFAULT);
    map.set_wired(va(0), va(10), true);

    assert_eq!(
        h.sys.vm_fault_wire(&map, va(0), va(10)),
        Err(FaultError::OutOfRange)
    );

    let pmap = map.soft_pmap();
    for n in 0..10 {
        assert!(!pmap.is_wired(va(n)));
    }
    assert_eq!(h.sys.pages().stats().wired, 0);
    assert_eq!(pmap.stats.wired(), 0);
    assert_eq!(obj.resident_page_count(), 7);
    assert_eq!(map.outstanding_lookups(), 0);
}

#[test]
#[should_panic(expected = "unwire: page not in pmap")]
fn test_unwire_unmapped_page_panics() {
    let h = Harness::new(8);
    let obj = h.sys.objects().allocate(PAGE);
    let map = h.map_object(&obj, 1, VmProt::DEFAULT);
    h.sys.vm_fault_unwire(&map, va(0), va(1));
}

#[test]
fn test_copy_wired_entry() {
    let h = Harness::new(32);
    let src_obj = h.sys.objects().allocate(4 * PAGE);
    let src_map = h.map_object(&src_obj, 3, VmProt::DEFAULT);
    src_map.set_wired(va(0), va(3), true);
    h.sys.vm_fault_wire(&src_map, va(0), va(3)).unwrap();
    for n in 0..3 {
        src_obj.page_lookup(n * PAGE).unwrap().write(0, &[0x40 + n as u8]);
    }
    let src_entry = src_map.entry(BASE).unwrap();

    let dst_map = h.map();
    let mut dst_entry = VmMapEntry::new(BASE, BASE + 3 * PAGE, None, 0x5000);
    dst_entry.max_protection = VmProt::DEFAULT;
    h.sys.vm_fault_copy_entry(&dst_map, &mut dst_entry, &src_entry);

    let dst_obj = dst_entry.object.clone().expect("fresh object");
    assert!(!Arc::ptr_eq(&dst_obj, &src_obj));
    assert_eq!(dst_obj.size(), 3 * PAGE);
    assert_eq!(dst_entry.offset, 0);
    assert_eq!(dst_obj.resident_offsets(), vec![0, PAGE, 2 * PAGE]);

    for n in 0..3 {
        let entry = dst_map.soft_pmap().mapping(va(n)).expect("copy mapped");
        assert_eq!(entry.prot, VmProt::DEFAULT);
        assert!(!entry.wired);
        assert_eq!(byte_at(&h, &dst_map, va(n)), 0x40 + n as u8);

        let page = dst_obj.page_lookup(n * PAGE).unwrap();
        assert!(!page.is_busy());
        assert!(page.is_fully_valid());
        assert_eq!(page.queue(), PageQueueType::Active);
    }

    // The copy is private: the source frames are untouched.
    dst_obj.page_lookup(0).unwrap().write(0, &[0xff]);
    assert_eq!(byte_at(&h, &src_map, va(0)), 0x40);

    dst_map.enter(dst_entry).unwrap();
    assert_eq!(h.sys.vm_fault(&dst_map, va(1), VmProt::WRITE, false), Ok(mach_fault::FaultOutcome::Soft));
}

#[test]
fn test_prefault_skips_mapped_and_failing_pages() {
    let h = Harness::new(32);
    let obj = h.sys.objects().allocate(3 * PAGE);
    let map = h.map_object(&obj, 4, VmProt::DEFAULT);

    h.sys.vm_fault(&map, va(1), VmProt::READ, false).unwrap();

    // Page 1 is already mapped and page 3 lies past the object.
    assert_eq!(h.sys.vm_fault_prefault(&map, va(0), va(4)), 2);
    for n in 0..3 {
        assert!(map.soft_pmap().is_mapped(va(n)));
    }
    assert!(!map.soft_pmap().is_mapped(va(3)));
    assert_eq!(h.sys.vm_fault_prefault(&map, va(0), va(3)), 0);
}
