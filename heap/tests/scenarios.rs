use std::cell::RefCell;
use std::rc::Rc;

use heap::{
    AllocationContext, AllocationSpace, GarbageCollector, GcTypeFlags, Heap, HeapSettings,
    Pretenure,
};
use object::{MapWord, Value, layout};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn create_test_settings() -> HeapSettings {
    HeapSettings {
        page_size: 64 * 1024,
        initial_semispace_size: 128 * 1024,
        max_semispace_size: 512 * 1024,
        max_old_generation_size: 16 * 1024 * 1024,
        code_range_size: 0,
        min_promotion_limit: 256 * 1024,
        min_allocation_limit: 512 * 1024,
        concurrent_unmapping: false,
        incremental_marking: false,
        verify_heap: true,
        ..HeapSettings::default()
    }
}

fn create_test_heap() -> Heap {
    init_logging();
    let mut heap = Heap::new(create_test_settings());
    heap.setup(true).unwrap();
    heap
}

fn element(object: object::HeapObject, index: usize) -> Value {
    unsafe { object.field(layout::fixed_array::element_offset(index)) }
}

#[test]
fn unrooted_young_object_dies_and_rooted_one_moves() {
    let mut heap = create_test_heap();
    let ctx = AllocationContext::mutator();

    // Header and length plus six elements: 64 bytes
    let garbage = heap.allocate_fixed_array(ctx, 6, Value::smi(1), Pretenure::NotTenured);
    assert_eq!(layout::fixed_array_size(6), 64);
    assert!(heap.in_new_space(garbage));
    heap.collect_garbage(0, AllocationSpace::New);
    assert_eq!(heap.stats().scavenges, 1);
    assert_eq!(heap.new_space().size(), 0);

    let kept = heap.allocate_fixed_array(ctx, 6, Value::smi(2), Pretenure::NotTenured);
    let handle = heap.create_handle(kept.into());
    heap.collect_garbage(0, AllocationSpace::New);

    let moved = heap.handle_value(handle).as_object().unwrap();
    assert_ne!(moved, kept);
    assert!(heap.new_space().to_space_contains(moved.address()));
    assert_eq!(unsafe { kept.map_word() }, MapWord::Forwarded(moved));
    assert_eq!(element(moved, 5), Value::smi(2));
}

#[test]
fn second_scavenge_promotes() {
    let mut heap = create_test_heap();
    let ctx = AllocationContext::mutator();
    let young = heap.allocate_fixed_array(ctx, 3, Value::smi(7), Pretenure::NotTenured);
    let handle = heap.create_handle(young.into());

    heap.collect_garbage(0, AllocationSpace::New);
    let survivor = heap.handle_value(handle).as_object().unwrap();
    assert_eq!(heap.space_of(survivor), Some(AllocationSpace::New));

    heap.collect_garbage(0, AllocationSpace::New);
    let promoted = heap.handle_value(handle).as_object().unwrap();
    assert_eq!(heap.space_of(promoted), Some(AllocationSpace::OldPointer));
    assert!(!heap.in_new_space(promoted));
    assert_eq!(element(promoted, 2), Value::smi(7));
}

#[test]
fn unrooted_cycles_are_collected() {
    let mut heap = create_test_heap();
    let ctx = AllocationContext::mutator();
    heap.collect_all_garbage(false);
    let baseline = heap.paged_space(AllocationSpace::OldPointer).accounting().size;

    let mut watchers = Vec::new();
    for pair in 0..500 {
        let a = heap.allocate_fixed_array(ctx, 1, Value::ZERO, Pretenure::Tenured);
        let b = heap.allocate_fixed_array(ctx, 1, a.into(), Pretenure::Tenured);
        unsafe { heap.write_field(a, layout::fixed_array::element_offset(0), b.into()) };
        if pair % 50 == 0 {
            watchers.push(heap.create_weak_handle(a.into()));
            watchers.push(heap.create_weak_handle(b.into()));
        }
    }
    assert!(heap.paged_space(AllocationSpace::OldPointer).accounting().size > baseline);

    heap.collect_all_garbage(false);
    for watcher in watchers {
        assert_eq!(heap.handle_value(watcher), Value::ZERO);
    }
    assert_eq!(heap.paged_space(AllocationSpace::OldPointer).accounting().size, baseline);
}

#[test]
fn exceeding_the_allocation_limit_selects_mark_compact() {
    let mut heap = create_test_heap();
    let ctx = AllocationContext::mutator();
    let mut handles = Vec::new();
    while !heap.old_generation_allocation_limit_reached() {
        let array = heap.allocate_fixed_array(ctx, 126, Value::ZERO, Pretenure::Tenured);
        handles.push(heap.create_handle(array.into()));
        assert!(handles.len() < 10_000);
    }
    assert_eq!(heap.stats().mark_compacts, 0);
    assert_eq!(
        heap.select_garbage_collector(AllocationSpace::New),
        GarbageCollector::MarkCompactor
    );

    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = seen.clone();
    heap.add_gc_prologue_callback(
        GcTypeFlags::ALL,
        Box::new(move |collector| log.borrow_mut().push(collector)),
    );
    let mut allocations = 0;
    while seen.borrow().is_empty() {
        let array = heap.allocate_fixed_array(ctx, 126, Value::ZERO, Pretenure::Tenured);
        handles.push(heap.create_handle(array.into()));
        allocations += 1;
        assert!(allocations < 10_000);
    }
    assert_eq!(seen.borrow()[0], GarbageCollector::MarkCompactor);
    assert_eq!(heap.stats().scavenges, 0);
    assert!(!heap.old_generation_allocation_limit_reached());
}

#[test]
fn array_buffer_follows_its_owner() {
    let mut heap = create_test_heap();
    let ctx = AllocationContext::mutator();
    let buffer = heap.allocate_array_buffer(ctx, 100, Pretenure::NotTenured);
    assert!(heap.array_buffer_tracker().is_tracked_young(buffer));
    let handle = heap.create_handle(buffer.into());

    heap.collect_garbage(0, AllocationSpace::New);
    heap.collect_garbage(0, AllocationSpace::New);
    let buffer = heap.handle_value(handle).as_object().unwrap();
    assert!(!heap.in_new_space(buffer));
    let tracker = heap.array_buffer_tracker();
    assert!(tracker.is_tracked_old(buffer));
    assert!(!tracker.is_tracked_young(buffer));
    assert_eq!(tracker.backing_store(buffer).map(|store| store.byte_length), Some(100));

    let freed_before = heap.array_buffer_tracker().freed_count();
    heap.destroy_handle(handle);
    heap.collect_all_garbage(false);
    assert_eq!(heap.array_buffer_tracker().freed_count(), freed_before + 1);
    assert!(heap.array_buffer_tracker().is_empty());
}
