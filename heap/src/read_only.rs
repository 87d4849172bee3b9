//! One-time promotion of immutable objects into read-only space.
//!
//! The candidates are the objects reachable from the strong roots whose
//! shape is immutable. A candidate that points at anything other than
//! another candidate or an object already in read-only space is dropped,
//! and so is everything that points at it, until nothing changes. Cycles
//! therefore survive or fall as a whole.

use object::{HeapObject, ObjectVisitor, ShapeTable, Slot, Value, iterate_body, layout, object_size};

use crate::space::{AddressMap, AddressSet, for_each_object};
use crate::{AllocationSpace, ChunkFlags, Heap, MemoryAllocator, VisitMode, fatal_out_of_memory};

/// Collects the objects a body points at.
struct Targets(Vec<HeapObject>);

impl ObjectVisitor for Targets {
    fn visit_pointers(&mut self, _host: HeapObject, start: Slot, end: Slot) {
        for slot in Slot::range(start, end) {
            // SAFETY: slots of a live object's body
            if let Some(target) = unsafe { slot.load() }.as_object() {
                self.0.push(target);
            }
        }
    }
}

/// Rewrites slots holding a promoted original to hold its copy.
struct Remapper<'a> {
    moved: &'a AddressMap<HeapObject>,
}

impl Remapper<'_> {
    fn remap(&self, value: &mut Value) {
        if let Some(to) = value.as_object().and_then(|from| self.moved.get(&from.address())) {
            *value = (*to).into();
        }
    }
}

impl ObjectVisitor for Remapper<'_> {
    fn visit_pointers(&mut self, _host: HeapObject, start: Slot, end: Slot) {
        for slot in Slot::range(start, end) {
            // SAFETY: slots of an iterable object's body
            unsafe {
                let mut value = slot.load();
                let before = value;
                self.remap(&mut value);
                if value != before {
                    slot.store(value);
                }
            }
        }
    }
}

fn targets_of(shapes: &ShapeTable, object: HeapObject) -> Vec<HeapObject> {
    let mut targets = Targets(Vec::new());
    // SAFETY: callers only pass live, unforwarded objects
    unsafe { iterate_body(shapes, object, &mut targets) };
    targets.0
}

fn is_read_only_object(allocator: &MemoryAllocator, object: HeapObject) -> bool {
    allocator
        .chunk_for_address(object.address())
        .is_some_and(|chunk| chunk.has_flag(ChunkFlags::READ_ONLY))
}

impl Heap {
    /// Move every promotable immutable object into read-only space and seal
    /// it. Returns the number of objects promoted. Only the first call does
    /// anything.
    pub fn promote_read_only(&mut self) -> usize {
        let Some(index) = AllocationSpace::ReadOnly.paged_index() else {
            return 0;
        };
        if self.paged_spaces[index].is_sealed() {
            log::warn!("read-only space is already sealed");
            return 0;
        }
        if self.incremental.is_active() {
            self.collect_all_garbage(false);
        }
        for space in &mut self.paged_spaces {
            space.close_linear_allocation_area();
        }

        let promotable = self.find_promotable();
        let moved = self.copy_to_read_only(&promotable);
        self.remap_promoted(&moved);

        for (&from, &to) in &moved {
            // SAFETY: the original is a complete object nobody points at any
            // more; the copy has its size
            unsafe {
                let size = object_size(&self.shapes, to);
                layout::write_filler(from, size);
            }
            for listener in self.move_listeners.iter_mut() {
                listener(HeapObject::from_address(from), to);
            }
        }
        let space = &mut self.paged_spaces[index];
        space.seal(&self.allocator);
        log::info!("promoted {} objects to read-only space", moved.len());
        moved.len()
    }

    /// Immutable objects reachable from the strong roots that only point at
    /// each other or at read-only objects, in discovery order.
    fn find_promotable(&mut self) -> Vec<HeapObject> {
        let mut seen = AddressSet::default();
        let mut worklist = Vec::new();
        self.roots.iterate(
            &mut |value| {
                if let Some(object) = value.as_object() {
                    if seen.insert(object.address()) {
                        worklist.push(object);
                    }
                }
            },
            VisitMode::StrongOnly,
        );

        let shapes = &*self.shapes;
        let allocator = &self.allocator;
        let mut candidates = Vec::new();
        while let Some(object) = worklist.pop() {
            if is_read_only_object(allocator, object) {
                continue;
            }
            for target in targets_of(shapes, object) {
                if seen.insert(target.address()) {
                    worklist.push(target);
                }
            }
            let large = allocator
                .chunk_for_address(object.address())
                .is_some_and(|chunk| chunk.has_flag(ChunkFlags::LARGE));
            // SAFETY: reachable objects outside a collection are unforwarded
            let immutable = shapes.get(unsafe { object.shape() }).is_immutable();
            if immutable && !large {
                candidates.push(object);
            }
        }

        let mut eligible: AddressSet = candidates.iter().map(|object| object.address()).collect();
        loop {
            let before = eligible.len();
            candidates.retain(|object| {
                let keep = targets_of(shapes, *object).into_iter().all(|target| {
                    eligible.contains(&target.address()) || is_read_only_object(allocator, target)
                });
                if !keep {
                    eligible.remove(&object.address());
                }
                keep
            });
            if eligible.len() == before {
                break;
            }
        }
        candidates
    }

    fn copy_to_read_only(&mut self, objects: &[HeapObject]) -> AddressMap<HeapObject> {
        let mut moved = AddressMap::default();
        let Some(index) = AllocationSpace::ReadOnly.paged_index() else {
            return moved;
        };
        for &object in objects {
            // SAFETY: candidates are live and unforwarded
            let size = unsafe { object_size(&self.shapes, object) };
            let space = &mut self.paged_spaces[index];
            let Some(copy) = space.allocate_raw(&mut self.allocator, size, true).ok() else {
                fatal_out_of_memory("Heap::promote_read_only");
            };
            // SAFETY: distinct blocks of `size` bytes
            unsafe {
                std::ptr::copy_nonoverlapping(
                    object.address() as *const u8,
                    copy.address() as *mut u8,
                    size,
                );
            }
            moved.insert(object.address(), copy);
        }
        self.paged_spaces[index].close_linear_allocation_area();
        moved
    }

    /// Point the roots and every object in the heap at the copies.
    fn remap_promoted(&mut self, moved: &AddressMap<HeapObject>) {
        let mut remapper = Remapper { moved };
        self.roots.iterate(&mut |value| remapper.remap(value), VisitMode::All);

        let shapes = &*self.shapes;
        let mut visit = |object: HeapObject, _size: usize| {
            // SAFETY: every walked object is complete and unforwarded
            unsafe { iterate_body(shapes, object, &mut remapper) };
        };
        let (start, top) = self.new_space.to_space_range();
        // SAFETY: to-space is iterable up to top outside a collection
        unsafe { for_each_object(shapes, start, top, &mut visit) };
        for space in &self.paged_spaces {
            // SAFETY: every LAB was closed before copying
            unsafe { space.for_each_object(&self.allocator, shapes, &mut visit) };
        }
        for (object, _) in self.lo_space.objects(&self.allocator) {
            visit(object, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use object::{ShapeFlags, ShapeId};

    use super::*;
    use crate::{AllocationContext, HeapSettings, Pretenure, RootIndex};

    fn create_test_heap() -> Heap {
        let settings = HeapSettings {
            page_size: 64 * 1024,
            initial_semispace_size: 128 * 1024,
            max_semispace_size: 256 * 1024,
            code_range_size: 0,
            concurrent_unmapping: false,
            verify_heap: true,
            ..HeapSettings::default()
        };
        let mut heap = Heap::new(settings);
        heap.setup(true).unwrap();
        heap
    }

    #[test]
    fn immutable_subgraph_moves_and_mutable_referrers_follow() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let pair = heap.register_struct_shape("frozen-pair", 2, ShapeFlags::IMMUTABLE);
        let name = heap.allocate_byte_string(ctx, b"frozen", Pretenure::NotTenured);
        let frozen = heap.allocate_struct(ctx, pair, name.into(), Pretenure::Tenured);
        let holder = heap.allocate_fixed_array(ctx, 1, frozen.into(), Pretenure::Tenured);
        let handle = heap.create_handle(holder.into());

        let promoted = heap.promote_read_only();
        assert!(promoted >= 3);

        let holder = heap.handle_value(handle).as_object().unwrap();
        assert!(!heap.is_read_only(holder));
        let frozen = unsafe { holder.field(layout::fixed_array::element_offset(0)) };
        let frozen = frozen.as_object().unwrap();
        assert!(heap.is_read_only(frozen));
        assert_eq!(unsafe { frozen.shape() }, pair);
        let name = unsafe { frozen.field(layout::HEADER_SIZE) }.as_object().unwrap();
        assert!(heap.is_read_only(name));
        assert_eq!(unsafe { name.shape() }, ShapeId::BYTE_STRING);
        let empty = heap.root(RootIndex::EmptyString).as_object().unwrap();
        assert!(heap.is_read_only(empty));

        assert_eq!(heap.promote_read_only(), 0);
        heap.collect_all_garbage(true);
        let holder = heap.handle_value(handle).as_object().unwrap();
        let again = unsafe { holder.field(layout::fixed_array::element_offset(0)) };
        assert_eq!(again.as_object(), Some(frozen));
    }

    #[test]
    fn cycle_through_a_mutable_object_stays_put() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let pair = heap.register_struct_shape("frozen-pair", 2, ShapeFlags::IMMUTABLE);
        let a = heap.allocate_struct(ctx, pair, Value::ZERO, Pretenure::Tenured);
        let b = heap.allocate_struct(ctx, pair, a.into(), Pretenure::Tenured);
        let mutable = heap.allocate_fixed_array(ctx, 1, b.into(), Pretenure::Tenured);
        unsafe {
            heap.write_field(a, layout::HEADER_SIZE, b.into());
            heap.write_field(a, layout::HEADER_SIZE + object::WORD_SIZE, mutable.into());
        }
        let handle = heap.create_handle(a.into());

        heap.promote_read_only();
        let a = heap.handle_value(handle).as_object().unwrap();
        assert!(!heap.is_read_only(a));
        let b = unsafe { a.field(layout::HEADER_SIZE) }.as_object().unwrap();
        assert!(!heap.is_read_only(b));
    }
}
