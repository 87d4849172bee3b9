//! Copying collection of new space.
//!
//! Survivors are evacuated breadth-first: to-space doubles as the Cheney
//! queue for copied objects, and a separate queue holds promoted objects
//! whose bodies still have to be scanned. Old-to-new pointers are found
//! through the dirty regions the write barrier left behind.

use std::sync::Arc;

use object::{
    Address, HeapObject, MapWord, ObjectVisitor, ShapeTable, Slot, Value, iterate_body,
    object_size, size_with_shape,
};

use crate::heap::{CollectionOutcome, MoveListener};
use crate::space::for_each_object;
use crate::{
    ChunkFlags, Heap, MemoryAllocator, NewSpace, PagedSpace, VisitMode, fatal_out_of_memory,
};

// ── Dirty regions ─────────────────────────────────────────────────────

/// Old-space slots that pointed into new space before the flip.
#[derive(Default)]
struct DirtySlots {
    strong: Vec<Slot>,
    weak: Vec<Slot>,
}

struct DirtySlotCollector<'a> {
    new_space: &'a NewSpace,
    slots: &'a mut DirtySlots,
}

impl DirtySlotCollector<'_> {
    #[inline]
    fn points_to_new_space(&self, slot: Slot) -> bool {
        // SAFETY: slots of initialized objects are readable
        unsafe { slot.load() }
            .as_object()
            .is_some_and(|target| self.new_space.contains(target.address()))
    }
}

impl ObjectVisitor for DirtySlotCollector<'_> {
    fn visit_pointers(&mut self, _host: HeapObject, start: Slot, end: Slot) {
        for slot in Slot::range(start, end) {
            if self.points_to_new_space(slot) {
                self.slots.strong.push(slot);
            }
        }
    }

    fn visit_weak_pointers(&mut self, _host: HeapObject, start: Slot, end: Slot) {
        for slot in Slot::range(start, end) {
            if self.points_to_new_space(slot) {
                self.slots.weak.push(slot);
            }
        }
    }
}

/// Turn dirty regions into a slot list and clear them. Slots that still
/// point into new space after the scavenge are marked dirty again.
fn collect_dirty_slots(
    shapes: &ShapeTable,
    allocator: &MemoryAllocator,
    new_space: &NewSpace,
) -> DirtySlots {
    let mut slots = DirtySlots::default();
    for chunk in allocator.chunks() {
        if !chunk.has_dirty_regions() {
            continue;
        }
        if !chunk.has_flag(ChunkFlags::READ_ONLY) && chunk.owner().has_pointers() {
            let mut collector = DirtySlotCollector {
                new_space,
                slots: &mut slots,
            };
            let mut visit = |object: HeapObject, size: usize| {
                if chunk.any_dirty_in(object.address(), object.address() + size) {
                    // SAFETY: objects outside new space are never forwarded
                    // between collections
                    unsafe { iterate_body(shapes, object, &mut collector) };
                }
            };
            if chunk.has_flag(ChunkFlags::LARGE) {
                let object = HeapObject::from_address(chunk.area_start());
                // SAFETY: a large chunk holds one object at its area start
                let size = unsafe { object_size(shapes, object) };
                visit(object, size);
            } else {
                // SAFETY: linear allocation areas are closed, pages are
                // iterable
                unsafe { for_each_object(shapes, chunk.area_start(), chunk.area_end(), visit) };
            }
        }
        chunk.clear_dirty_regions();
    }
    slots
}

// ── Evacuation ────────────────────────────────────────────────────────

struct Scavenger<'a> {
    shapes: &'a ShapeTable,
    allocator: &'a mut MemoryAllocator,
    new_space: &'a mut NewSpace,
    old_pointer: &'a mut PagedSpace,
    old_data: &'a mut PagedSpace,
    move_listeners: &'a mut [MoveListener],
    /// Incremental marking is running; mark bits move with their objects.
    marking: bool,
    age_mark: Address,
    /// Once to-space holds this many bytes, every survivor is promoted.
    promotion_threshold: usize,
    promotion_queue: Vec<HeapObject>,
    weak_slots: Vec<Slot>,
    outcome: CollectionOutcome,
}

impl Scavenger<'_> {
    #[inline]
    fn should_promote(&self, object: HeapObject, size: usize) -> bool {
        object.address() < self.age_mark
            || self.new_space.size() + size > self.promotion_threshold
    }

    fn promote(&mut self, size: usize, has_pointers: bool) -> Option<HeapObject> {
        let space = if has_pointers {
            &mut *self.old_pointer
        } else {
            &mut *self.old_data
        };
        let target = space.allocate_raw(self.allocator, size, true).ok()?;
        self.outcome.promoted_bytes += size;
        if has_pointers {
            self.promotion_queue.push(target);
        }
        Some(target)
    }

    fn allocate_target(&mut self, object: HeapObject, size: usize, has_pointers: bool) -> HeapObject {
        if self.should_promote(object, size) {
            if let Some(target) = self.promote(size, has_pointers) {
                return target;
            }
        }
        if let Some(target) = self.new_space.allocate_raw(size).ok() {
            self.outcome.copied_bytes += size;
            return target;
        }
        match self.promote(size, has_pointers) {
            Some(target) => target,
            None => fatal_out_of_memory("Scavenger::evacuate"),
        }
    }

    /// Copy a from-space object out, once.
    fn evacuate(&mut self, object: HeapObject) -> HeapObject {
        // SAFETY: from-space objects stay readable until the next flip
        let shape_id = match unsafe { object.map_word() } {
            MapWord::Forwarded(to) => return to,
            MapWord::Shape(id) => id,
        };
        let shape = self.shapes.get(shape_id);
        // SAFETY: as above
        let size = unsafe { size_with_shape(shape, object) };
        let target = self.allocate_target(object, size, shape.kind.has_pointers());
        // SAFETY: source and target are distinct blocks of `size` bytes
        unsafe {
            std::ptr::copy_nonoverlapping(
                object.address() as *const u8,
                target.address() as *mut u8,
                size,
            );
            object.set_map_word(MapWord::Forwarded(target));
        }
        if self.marking {
            self.transfer_mark(object, target, size);
        }
        for listener in self.move_listeners.iter_mut() {
            listener(object, target);
        }
        target
    }

    fn transfer_mark(&mut self, from: HeapObject, to: HeapObject, size: usize) {
        let from_marks = self.new_space.from_space().marks();
        if !from_marks.is_marked(from) {
            return;
        }
        let overflowed = from_marks.take_overflow(from);
        if self.new_space.contains(to.address()) {
            let marks = self.new_space.to_space().marks();
            marks.mark(to);
            if overflowed {
                marks.set_overflow(to);
            }
        } else if let Some(chunk) = self.allocator.chunk_for_address(to.address()) {
            chunk.marks().mark(to);
            chunk.increment_live_bytes(size);
            if overflowed {
                chunk.marks().set_overflow(to);
                chunk.set_flag(ChunkFlags::HAS_OVERFLOW);
            }
        }
    }

    fn mark_dirty(&self, slot: Slot) {
        if let Some(chunk) = self.allocator.chunk_for_address(slot.address()) {
            chunk.mark_dirty(slot);
        }
    }

    /// Update a root in place.
    fn scavenge_value(&mut self, value: &mut Value) {
        if let Some(object) = value.as_object() {
            if self.new_space.from_space_contains(object.address()) {
                *value = self.evacuate(object).into();
            }
        }
    }

    /// Update a heap slot. Old hosts that keep pointing into new space get
    /// their slot marked dirty again.
    fn scavenge_slot(&mut self, slot: Slot, old_host: bool) {
        // SAFETY: slots of scanned objects are readable
        let Some(object) = unsafe { slot.load() }.as_object() else {
            return;
        };
        if !self.new_space.from_space_contains(object.address()) {
            return;
        }
        let target = self.evacuate(object);
        // SAFETY: as above
        unsafe { slot.store(target.into()) };
        if old_host && self.new_space.contains(target.address()) {
            self.mark_dirty(slot);
        }
    }

    /// Scan copied and promoted objects until both queues are empty.
    fn drain(&mut self) {
        let shapes = self.shapes;
        let mut scan = self.new_space.to_space().start();
        loop {
            if scan < self.new_space.top() {
                let object = HeapObject::from_address(scan);
                // SAFETY: to-space below top holds complete copies
                unsafe {
                    scan += object_size(shapes, object);
                    iterate_body(shapes, object, &mut ScavengeVisitor {
                        scavenger: &mut *self,
                        old_host: false,
                    });
                }
            } else if let Some(object) = self.promotion_queue.pop() {
                // SAFETY: promoted objects are complete copies
                unsafe {
                    iterate_body(shapes, object, &mut ScavengeVisitor {
                        scavenger: &mut *self,
                        old_host: true,
                    });
                }
            } else {
                break;
            }
        }
    }

    /// Follow or clear weak slots once every survivor has moved.
    fn process_weak_slots(&mut self, slots: &[Slot]) {
        for &slot in slots {
            // SAFETY: weak slots come from scanned, live hosts
            let Some(target) = unsafe { slot.load() }.as_object() else {
                continue;
            };
            if !self.new_space.from_space_contains(target.address()) {
                continue;
            }
            // SAFETY: from-space objects stay readable until the next flip
            match unsafe { target.map_word() } {
                MapWord::Forwarded(to) => {
                    // SAFETY: as above
                    unsafe { slot.store(to.into()) };
                    if !self.new_space.contains(slot.address())
                        && self.new_space.contains(to.address())
                    {
                        self.mark_dirty(slot);
                    }
                }
                // SAFETY: as above
                MapWord::Shape(_) => unsafe { slot.store(Value::ZERO) },
            }
        }
    }
}

struct ScavengeVisitor<'s, 'a> {
    scavenger: &'s mut Scavenger<'a>,
    old_host: bool,
}

impl ObjectVisitor for ScavengeVisitor<'_, '_> {
    fn visit_pointers(&mut self, _host: HeapObject, start: Slot, end: Slot) {
        for slot in Slot::range(start, end) {
            self.scavenger.scavenge_slot(slot, self.old_host);
        }
    }

    fn visit_weak_pointers(&mut self, _host: HeapObject, start: Slot, end: Slot) {
        for slot in Slot::range(start, end) {
            // SAFETY: slots of scanned objects are readable
            if let Some(target) = unsafe { slot.load() }.as_object() {
                if self.scavenger.new_space.from_space_contains(target.address()) {
                    self.scavenger.weak_slots.push(slot);
                }
            }
        }
    }
}

/// Where a young object went, or `None` if the scavenge left it behind.
fn forwarded_young(new_space: &NewSpace, object: HeapObject) -> Option<HeapObject> {
    if !new_space.from_space_contains(object.address()) {
        return Some(object);
    }
    // SAFETY: from-space objects stay readable until the next flip
    match unsafe { object.map_word() } {
        MapWord::Forwarded(to) => Some(to),
        MapWord::Shape(_) => None,
    }
}

impl Heap {
    pub(crate) fn scavenge(&mut self) -> CollectionOutcome {
        let shapes = Arc::clone(&self.shapes);
        let marking = self.incremental.is_active();
        for space in &mut self.paged_spaces {
            space.close_linear_allocation_area();
        }
        let size_before = self.new_space.size();
        let dirty = collect_dirty_slots(&shapes, &self.allocator, &self.new_space);
        log::trace!(
            "scavenge: {} dirty slots, {} weak",
            dirty.strong.len(),
            dirty.weak.len()
        );
        self.new_space.flip();

        let promotion_threshold =
            (self.new_space.capacity() as f64 * self.settings.promotion_fraction) as usize;
        let age_mark = self.new_space.age_mark();
        let Heap {
            allocator,
            new_space,
            paged_spaces,
            roots,
            move_listeners,
            external_strings,
            array_buffers,
            marking: marking_state,
            ..
        } = self;
        let [old_pointer, old_data, ..] = paged_spaces;
        let mut scavenger = Scavenger {
            shapes: &shapes,
            allocator,
            new_space: &mut *new_space,
            old_pointer,
            old_data,
            move_listeners: move_listeners.as_mut_slice(),
            marking,
            age_mark,
            promotion_threshold,
            promotion_queue: Vec::new(),
            weak_slots: dirty.weak,
            outcome: CollectionOutcome::default(),
        };

        roots.iterate(&mut |value| scavenger.scavenge_value(value), VisitMode::StrongOnly);
        for slot in dirty.strong {
            scavenger.scavenge_slot(slot, true);
        }
        scavenger.drain();

        let weak_slots = std::mem::take(&mut scavenger.weak_slots);
        scavenger.process_weak_slots(&weak_slots);
        roots.handles.iterate_weak(&mut |value| {
            if let Some(object) = value.as_object() {
                if scavenger.new_space.from_space_contains(object.address()) {
                    *value = forwarded_young(scavenger.new_space, object)
                        .map_or(Value::ZERO, Value::from);
                }
            }
        });
        let outcome = scavenger.outcome;
        drop(scavenger);

        let top = new_space.top();
        new_space.set_age_mark(top);
        let new_space: &NewSpace = new_space;
        let young = |address: Address| new_space.contains(address);
        external_strings.process_young(|object| forwarded_young(new_space, object), young);
        let freed = array_buffers.process_young(|object| forwarded_young(new_space, object), young);
        if marking {
            marking_state.update_after_scavenge(|object| forwarded_young(new_space, object));
            new_space.from_space().marks().clear();
        }

        self.adjust_external_memory(-(freed as isize));

        let survived = outcome.promoted_bytes + outcome.copied_bytes;
        if size_before > 0 {
            self.tracer.survival_rate = survived as f64 / size_before as f64;
        }
        self.survived_since_last_expansion += survived;
        if self.survived_since_last_expansion > self.new_space.capacity() {
            self.new_space.grow();
            self.survived_since_last_expansion = 0;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use object::layout::fixed_array;

    use crate::{AllocationContext, AllocationSpace, HeapSettings, Pretenure};

    use super::*;

    const KB: usize = 1024;

    fn create_test_heap() -> Heap {
        let settings = HeapSettings {
            page_size: 64 * KB,
            initial_semispace_size: 128 * KB,
            max_semispace_size: 256 * KB,
            code_range_size: 0,
            concurrent_unmapping: false,
            verify_heap: true,
            ..HeapSettings::default()
        };
        let mut heap = Heap::new(settings);
        heap.setup(true).unwrap();
        heap
    }

    fn scavenge(heap: &mut Heap) {
        assert_eq!(
            heap.select_garbage_collector(AllocationSpace::New),
            crate::GarbageCollector::Scavenger
        );
        heap.collect_garbage(0, AllocationSpace::New);
    }

    #[test]
    fn survivors_are_copied_then_promoted() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let array = heap.allocate_fixed_array(ctx, 3, Value::smi(5), Pretenure::NotTenured);
        let handle = heap.create_handle(array.into());
        heap.allocate_fixed_array(ctx, 50, Value::ZERO, Pretenure::NotTenured);

        scavenge(&mut heap);
        let copied = heap.handle_value(handle).as_object().unwrap();
        assert_ne!(copied, array);
        assert_eq!(heap.space_of(copied), Some(AllocationSpace::New));

        scavenge(&mut heap);
        let promoted = heap.handle_value(handle).as_object().unwrap();
        assert_eq!(heap.space_of(promoted), Some(AllocationSpace::OldPointer));
        unsafe { assert_eq!(promoted.field(fixed_array::element_offset(2)), Value::smi(5)) };
        assert_eq!(heap.new_space().size(), 0);
    }

    #[test]
    fn dirty_slots_keep_young_objects_alive() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let old = heap.allocate_fixed_array(ctx, 1, Value::ZERO, Pretenure::Tenured);
        let handle = heap.create_handle(old.into());
        let young = heap.allocate_fixed_array(ctx, 1, Value::smi(42), Pretenure::NotTenured);
        unsafe { heap.write_field(old, fixed_array::element_offset(0), young.into()) };

        scavenge(&mut heap);
        let old = heap.handle_value(handle).as_object().unwrap();
        let slot = old.slot(fixed_array::element_offset(0));
        let moved = unsafe { slot.load() }.as_object().unwrap();
        assert!(heap.in_new_space(moved));
        assert!(heap.is_slot_dirty(slot));
        unsafe { assert_eq!(moved.field(fixed_array::element_offset(0)), Value::smi(42)) };
    }

    #[test]
    fn weak_references_to_dead_young_objects_are_cleared() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let dead = heap.allocate_fixed_array(ctx, 1, Value::ZERO, Pretenure::NotTenured);
        let live = heap.allocate_fixed_array(ctx, 1, Value::ZERO, Pretenure::NotTenured);
        let strong = heap.create_handle(live.into());
        let weak_dead = heap.create_weak_handle(dead.into());
        let weak_live = heap.create_weak_handle(live.into());
        let cell = heap.allocate_weak_cell(ctx, Value::ZERO, Pretenure::Tenured);
        let cell_handle = heap.create_handle(cell.into());
        let dead = heap.handle_value(weak_dead);
        unsafe { heap.write_field(cell, object::layout::weak_cell::VALUE_OFFSET, dead) };

        scavenge(&mut heap);
        assert_eq!(heap.handle_value(weak_dead), Value::ZERO);
        assert_eq!(heap.handle_value(weak_live), heap.handle_value(strong));
        let cell = heap.handle_value(cell_handle).as_object().unwrap();
        unsafe { assert_eq!(cell.field(object::layout::weak_cell::VALUE_OFFSET), Value::ZERO) };
    }

    #[test]
    fn old_ephemeron_table_keeps_young_entries_through_a_scavenge() {
        use object::layout::ephemeron_table;

        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let table = heap.allocate_ephemeron_table(ctx, 2, Pretenure::Tenured);
        let handle = heap.create_handle(table.into());
        let young: Vec<HeapObject> = (0..4)
            .map(|i| heap.allocate_fixed_array(ctx, 1, Value::smi(i), Pretenure::NotTenured))
            .collect();
        let key_handle = heap.create_handle(young[0].into());
        for index in 0..2 {
            unsafe {
                heap.write_field(table, ephemeron_table::key_offset(index), young[2 * index].into());
                heap.write_field(
                    table,
                    ephemeron_table::value_offset(index),
                    young[2 * index + 1].into(),
                );
            }
        }

        scavenge(&mut heap);
        let table = heap.handle_value(handle).as_object().unwrap();
        for index in 0..4 {
            let offset = match index % 2 {
                0 => ephemeron_table::key_offset(index / 2),
                _ => ephemeron_table::value_offset(index / 2),
            };
            let slot = table.slot(offset);
            let target = unsafe { slot.load() }.as_object().unwrap();
            assert!(heap.in_new_space(target));
            assert!(heap.is_slot_dirty(slot));
            unsafe {
                assert_eq!(target.field(fixed_array::element_offset(0)), Value::smi(index as i64))
            };
        }
        unsafe {
            assert_eq!(table.field(ephemeron_table::key_offset(0)), heap.handle_value(key_handle))
        };

        // A full collection drops the pair whose key nothing else holds
        heap.collect_all_garbage(false);
        let table = heap.handle_value(handle).as_object().unwrap();
        unsafe {
            assert_eq!(table.field(ephemeron_table::key_offset(0)), heap.handle_value(key_handle));
            let value = table.field(ephemeron_table::value_offset(0)).as_object().unwrap();
            assert_eq!(value.field(fixed_array::element_offset(0)), Value::smi(1));
            assert_eq!(table.field(ephemeron_table::key_offset(1)), Value::ZERO);
            assert_eq!(table.field(ephemeron_table::value_offset(1)), Value::ZERO);
        }
    }
}
