//! Full collection: mark, clear weak references, evacuate, update pointers
//! and sweep.
//!
//! New space is always evacuated. Old pages are evacuated only when they
//! were picked as candidates at the start of the cycle; every other old
//! page is swept in place. Pointers into candidates are found through the
//! slots recorded during marking, pointers into new space through the
//! dirty regions.

use std::sync::Arc;

use object::{
    HeapObject, MapWord, ObjectVisitor, ShapeTable, Slot, Value, iterate_body, object_size,
    size_with_shape,
};

use crate::heap::{CollectionOutcome, MoveListener};
use crate::marking::{Marker, clear_dead_references, is_marked};
use crate::sweeper::sweep_space;
use crate::{
    AllocationSpace, ChunkFlags, ChunkId, FreeMode, Heap, MemoryAllocator, MemoryChunk, NewSpace,
    PAGED_SPACE_COUNT, PagedSpace, VisitMode, fatal_out_of_memory,
};

/// Paged spaces whose pages may be compacted. Code pages are never moved.
const COMPACTABLE_SPACES: [AllocationSpace; 4] = [
    AllocationSpace::OldPointer,
    AllocationSpace::OldData,
    AllocationSpace::Map,
    AllocationSpace::Cell,
];

// ── Evacuation ────────────────────────────────────────────────────────

struct Evacuator<'a> {
    shapes: &'a ShapeTable,
    allocator: &'a mut MemoryAllocator,
    new_space: &'a mut NewSpace,
    paged_spaces: &'a mut [PagedSpace; PAGED_SPACE_COUNT],
    move_listeners: &'a mut [MoveListener],
    age_mark: usize,
    promotion_threshold: usize,
    /// New locations of every moved object; their bodies still point at
    /// old locations.
    migrated: Vec<HeapObject>,
    outcome: CollectionOutcome,
}

impl Evacuator<'_> {
    fn allocate_in(&mut self, space: AllocationSpace, size: usize) -> Option<HeapObject> {
        let index = space.paged_index()?;
        self.paged_spaces[index].allocate_raw(self.allocator, size, true).ok()
    }

    /// Move a marked object to `target`, leaving a forwarding address and a
    /// mark on the copy so the sweeper keeps it.
    fn migrate(&mut self, object: HeapObject, target: HeapObject, size: usize) {
        // SAFETY: source and target are distinct blocks of `size` bytes
        unsafe {
            std::ptr::copy_nonoverlapping(
                object.address() as *const u8,
                target.address() as *mut u8,
                size,
            );
            object.set_map_word(MapWord::Forwarded(target));
        }
        if !self.new_space.contains(target.address()) {
            if let Some(chunk) = self.allocator.chunk_for_address(target.address()) {
                chunk.marks().mark(target);
                chunk.increment_live_bytes(size);
            }
        }
        self.migrated.push(target);
        for listener in self.move_listeners.iter_mut() {
            listener(object, target);
        }
    }

    /// Survivors of the old to-space: promote or copy, like a scavenge.
    fn evacuate_new_space(&mut self, survivors: Vec<HeapObject>) {
        for object in survivors {
            // SAFETY: survivors are marked and not yet forwarded
            let shape = self.shapes.get(unsafe { object.shape() });
            // SAFETY: as above
            let size = unsafe { size_with_shape(shape, object) };
            let old_space = if shape.kind.has_pointers() {
                AllocationSpace::OldPointer
            } else {
                AllocationSpace::OldData
            };
            let promote = object.address() < self.age_mark
                || self.new_space.size() + size > self.promotion_threshold;
            let promoted = if promote {
                self.allocate_in(old_space, size)
            } else {
                None
            };
            let target = match promoted {
                Some(target) => {
                    self.outcome.promoted_bytes += size;
                    target
                }
                None => match self.new_space.allocate_raw(size).ok() {
                    Some(target) => {
                        self.outcome.copied_bytes += size;
                        target
                    }
                    None => match self.allocate_in(old_space, size) {
                        Some(target) => {
                            self.outcome.promoted_bytes += size;
                            target
                        }
                        None => fatal_out_of_memory("MarkCompact::evacuate_new_space"),
                    },
                },
            };
            self.migrate(object, target, size);
        }
    }

    /// Copy the marked objects of a candidate page into its own space.
    fn evacuate_page(&mut self, space: AllocationSpace, id: ChunkId) {
        let live: Vec<HeapObject> = self.allocator.chunk(id).marks().marked_objects().collect();
        for object in live {
            // SAFETY: marked objects are live and not yet forwarded
            let size = unsafe { object_size(self.shapes, object) };
            let Some(target) = self.allocate_in(space, size) else {
                fatal_out_of_memory("MarkCompact::evacuate_page");
            };
            self.migrate(object, target, size);
        }
    }
}

// ── Pointer updating ──────────────────────────────────────────────────

/// Rewrites slots that still hold an old location and re-dirties old-to-new
/// slots.
struct PointerUpdater<'a> {
    allocator: &'a MemoryAllocator,
    new_space: &'a NewSpace,
}

impl PointerUpdater<'_> {
    #[inline]
    fn forward(value: Value) -> Option<HeapObject> {
        let object = value.as_object()?;
        // SAFETY: targets of live slots are live objects or forwarded
        // copies whose originals are still mapped
        match unsafe { object.map_word() } {
            MapWord::Forwarded(to) => Some(to),
            MapWord::Shape(_) => None,
        }
    }

    fn update_value(&self, value: &mut Value) {
        if let Some(to) = Self::forward(*value) {
            *value = to.into();
        }
    }

    fn update_slot(&self, slot: Slot) {
        // SAFETY: slots come from live hosts or the recorded-slot buffers
        unsafe {
            let value = slot.load();
            if let Some(to) = Self::forward(value) {
                slot.store(to.into());
            }
        }
    }
}

impl ObjectVisitor for PointerUpdater<'_> {
    fn visit_pointers(&mut self, host: HeapObject, start: Slot, end: Slot) {
        let old_host = !self.new_space.contains(host.address());
        for slot in Slot::range(start, end) {
            self.update_slot(slot);
            if !old_host {
                continue;
            }
            // SAFETY: as in `update_slot`
            let value = unsafe { slot.load() };
            if value
                .as_object()
                .is_some_and(|target| self.new_space.contains(target.address()))
            {
                if let Some(chunk) = self.allocator.chunk_for_address(slot.address()) {
                    chunk.mark_dirty(slot);
                }
            }
        }
    }
}

/// Marked objects on a chunk, for hosts that need their slots revisited.
fn marked_objects(chunk: &MemoryChunk) -> Vec<HeapObject> {
    if chunk.has_flag(ChunkFlags::LARGE) {
        let object = HeapObject::from_address(chunk.area_start());
        if chunk.marks().is_marked(object) {
            return vec![object];
        }
        return Vec::new();
    }
    chunk.marks().marked_objects().collect()
}

impl Heap {
    pub(crate) fn mark_compact(&mut self, force_compaction: bool) -> CollectionOutcome {
        let shapes = Arc::clone(&self.shapes);
        for space in &mut self.paged_spaces {
            space.close_linear_allocation_area();
        }
        self.flush_number_string_cache();
        if self.incremental.is_active() {
            log::debug!("finalizing incremental marking");
        } else {
            self.prepare_marking(true);
            self.select_evacuation_candidates(force_compaction);
        }

        self.mark_live_objects(&shapes);
        self.clear_non_live_references(&shapes);
        let (migrated, outcome) = self.evacuate(&shapes);
        self.update_pointers(&shapes, &migrated);
        self.update_off_heap_references();
        self.release_evacuation_candidates();
        self.sweep_spaces(&shapes);
        self.finish_mark_compact();
        self.update_old_generation_limits();
        outcome
    }

    /// Pick sparse pages of the compactable spaces. `force` picks every page
    /// that is not completely full.
    fn select_evacuation_candidates(&mut self, force: bool) {
        let threshold = if force {
            1.0
        } else {
            self.settings.evacuation_threshold
        };
        for space in COMPACTABLE_SPACES {
            let Some(index) = space.paged_index() else {
                continue;
            };
            let paged = &mut self.paged_spaces[index];
            if paged.page_count() < 2 && !force {
                continue;
            }
            let free = paged.free_bytes_by_page(&self.allocator);
            let mut candidates: Vec<(usize, ChunkId)> = paged
                .page_ids()
                .filter_map(|id| {
                    let chunk = self.allocator.chunk(id);
                    if chunk.has_flag(ChunkFlags::NEVER_EVACUATE) {
                        return None;
                    }
                    let area = chunk.area_size();
                    let free = free.get(&chunk.base()).copied().unwrap_or(0);
                    let used = area.saturating_sub(free + chunk.wasted_bytes);
                    ((used as f64) < area as f64 * threshold).then_some((used, id))
                })
                .collect();
            candidates.sort_unstable();
            candidates.truncate(self.settings.max_evacuation_candidates);
            for &(_, id) in &candidates {
                self.allocator.chunk(id).set_flag(ChunkFlags::EVACUATION_CANDIDATE);
                paged.evict_free_list_entries(&self.allocator, id);
            }
            if !candidates.is_empty() {
                log::debug!(
                    "{} space: {} evacuation candidates",
                    space.name(),
                    candidates.len()
                );
            }
        }
    }

    fn mark_live_objects(&mut self, shapes: &ShapeTable) {
        self.mark_roots();
        let Heap {
            allocator,
            new_space,
            marking,
            array_buffers,
            ..
        } = self;
        let mut marker = Marker {
            shapes,
            allocator,
            new_space,
            state: marking,
            array_buffers,
        };
        marker.drain_all();
        marker.process_ephemerons();
        debug_assert!(marker.is_done());
    }

    fn clear_non_live_references(&mut self, shapes: &ShapeTable) {
        let Heap {
            allocator,
            new_space,
            roots,
            marking,
            external_strings,
            array_buffers,
            ..
        } = self;
        let cleared = clear_dead_references(shapes, allocator, new_space, marking);
        roots.handles.iterate_weak(&mut |value| {
            if let Some(object) = value.as_object() {
                if !is_marked(new_space, allocator, object) {
                    *value = Value::ZERO;
                }
            }
        });
        let disposed = external_strings.process_dead(|string| is_marked(new_space, allocator, string));
        let freed = array_buffers.free_undiscovered();
        log::trace!(
            "cleared {cleared} weak references, disposed {disposed} strings, freed {freed} buffer bytes"
        );
        self.adjust_external_memory(-(freed as isize));
    }

    fn evacuate(&mut self, shapes: &ShapeTable) -> (Vec<HeapObject>, CollectionOutcome) {
        let survivors: Vec<HeapObject> =
            self.new_space.to_space().marks().marked_objects().collect();
        self.new_space.flip();
        let promotion_threshold =
            (self.new_space.capacity() as f64 * self.settings.promotion_fraction) as usize;
        let age_mark = self.new_space.age_mark();
        let Heap {
            allocator,
            new_space,
            paged_spaces,
            move_listeners,
            ..
        } = self;
        let candidates: Vec<(AllocationSpace, ChunkId)> = COMPACTABLE_SPACES
            .iter()
            .filter_map(|space| space.paged_index().map(|index| (*space, index)))
            .flat_map(|(space, index)| {
                paged_spaces[index]
                    .page_ids()
                    .filter(|&id| allocator.chunk(id).is_evacuation_candidate())
                    .map(move |id| (space, id))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut evacuator = Evacuator {
            shapes,
            allocator: &mut *allocator,
            new_space: &mut *new_space,
            paged_spaces: &mut *paged_spaces,
            move_listeners: move_listeners.as_mut_slice(),
            age_mark,
            promotion_threshold,
            migrated: Vec::new(),
            outcome: CollectionOutcome::default(),
        };
        evacuator.evacuate_new_space(survivors);
        for (space, id) in candidates {
            evacuator.evacuate_page(space, id);
        }
        log::debug!(
            "evacuated {} objects: {} bytes promoted, {} copied",
            evacuator.migrated.len(),
            evacuator.outcome.promoted_bytes,
            evacuator.outcome.copied_bytes
        );
        (evacuator.migrated, evacuator.outcome)
    }

    fn update_pointers(&mut self, shapes: &ShapeTable, migrated: &[HeapObject]) {
        let Heap {
            allocator,
            new_space,
            roots,
            ..
        } = self;
        let mut updater = PointerUpdater {
            allocator,
            new_space,
        };
        roots.iterate(&mut |value| updater.update_value(value), VisitMode::All);

        let allocator: &MemoryAllocator = updater.allocator;
        for chunk in allocator.chunks() {
            if chunk.is_evacuation_candidate() || chunk.has_flag(ChunkFlags::READ_ONLY) {
                continue;
            }
            if chunk.has_flag(ChunkFlags::RESCAN_ON_EVACUATION) {
                chunk.clear_dirty_regions();
                for host in marked_objects(chunk) {
                    // SAFETY: marked hosts that were not moved are live
                    unsafe { iterate_body(shapes, host, &mut updater) };
                }
                continue;
            }
            if !chunk.has_dirty_regions() {
                continue;
            }
            let hosts: Vec<HeapObject> = marked_objects(chunk)
                .into_iter()
                .filter(|host| {
                    // SAFETY: as above
                    let size = unsafe { object_size(shapes, *host) };
                    chunk.any_dirty_in(host.address(), host.address() + size)
                })
                .collect();
            chunk.clear_dirty_regions();
            for host in hosts {
                // SAFETY: as above
                unsafe { iterate_body(shapes, host, &mut updater) };
            }
        }

        for chunk in allocator.chunks() {
            if chunk.is_evacuation_candidate() {
                for slot in chunk.take_slots() {
                    updater.update_slot(slot);
                }
            }
        }

        for &object in migrated {
            // SAFETY: copies are complete objects
            unsafe { iterate_body(shapes, object, &mut updater) };
        }
    }

    /// Follow moved objects in the tracker and string table.
    fn update_off_heap_references(&mut self) {
        let new_space = &self.new_space;
        // SAFETY: tracked objects are live; moved ones left a forwarding
        // address in memory that is still mapped
        let forward = |object: HeapObject| unsafe { Heap::forwarded(object) };
        let young = |address| new_space.contains(address);
        self.array_buffers.update_references(forward, young);
        self.external_strings.update_references(forward, young);
    }

    fn release_evacuation_candidates(&mut self) {
        for space in COMPACTABLE_SPACES {
            let Some(index) = space.paged_index() else {
                continue;
            };
            let paged = &mut self.paged_spaces[index];
            let candidates: Vec<ChunkId> = paged
                .page_ids()
                .filter(|&id| self.allocator.chunk(id).is_evacuation_candidate())
                .collect();
            for id in candidates {
                paged.evict_free_list_entries(&self.allocator, id);
                if let Some(page) = paged.take_page(id) {
                    self.allocator.free_chunk(page, FreeMode::Queued);
                }
            }
        }
    }

    fn sweep_spaces(&mut self, shapes: &ShapeTable) {
        for space in &mut self.paged_spaces {
            if space.id() == AllocationSpace::ReadOnly {
                continue;
            }
            sweep_space(space, &mut self.allocator, shapes);
            space.shrink(&mut self.allocator);
        }
        let (count, bytes) = self.lo_space.free_dead(&mut self.allocator, |allocator, object| {
            allocator
                .chunk_for_address(object.address())
                .is_some_and(|chunk| chunk.marks().is_marked(object))
        });
        if count > 0 {
            log::debug!("freed {count} large objects, {bytes} bytes");
        }
    }

    fn finish_mark_compact(&mut self) {
        for chunk in self.allocator.chunks() {
            if chunk.has_flag(ChunkFlags::LARGE) {
                chunk.marks().clear();
            }
            chunk.clear_flag(ChunkFlags::RESCAN_ON_EVACUATION | ChunkFlags::HAS_OVERFLOW);
            chunk.clear_slots();
        }
        self.new_space.to_space().marks().clear();
        self.new_space.from_space().marks().clear();
        self.marking.reset();
        self.incremental.stop();
        let top = self.new_space.top();
        self.new_space.set_age_mark(top);
    }
}

#[cfg(test)]
mod tests {
    use object::layout::{ephemeron_table, fixed_array, map};

    use crate::{AllocationContext, HeapSettings, Pretenure};

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

    #[test]
    fn unreachable_old_objects_are_swept() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let keep = heap.allocate_fixed_array(ctx, 10, Value::smi(1), Pretenure::Tenured);
        let handle = heap.create_handle(keep.into());
        for _ in 0..100 {
            heap.allocate_fixed_array(ctx, 10, Value::ZERO, Pretenure::Tenured);
        }
        let before = heap.paged_space(AllocationSpace::OldPointer).accounting().size;
        heap.collect_all_garbage(false);
        let after = heap.paged_space(AllocationSpace::OldPointer).accounting().size;
        assert!(after < before);
        let keep = heap.handle_value(handle).as_object().unwrap();
        unsafe { assert_eq!(keep.field(fixed_array::element_offset(9)), Value::smi(1)) };
    }

    #[test]
    fn forced_compaction_moves_objects_off_sparse_pages() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let mut handles = Vec::new();
        for i in 0..400 {
            let array = heap.allocate_fixed_array(ctx, 30, Value::smi(i), Pretenure::Tenured);
            if i % 10 == 0 {
                handles.push((i, heap.create_handle(array.into())));
            }
        }
        let pages_before = heap.paged_space(AllocationSpace::OldPointer).page_count();
        assert!(pages_before >= 2);
        let moves = std::rc::Rc::new(std::cell::Cell::new(0));
        let seen = moves.clone();
        heap.add_move_listener(Box::new(move |_, _| seen.set(seen.get() + 1)));
        heap.collect_all_garbage(true);
        assert!(moves.get() >= 40);
        assert!(heap.paged_space(AllocationSpace::OldPointer).page_count() <= pages_before);
        for (i, handle) in handles {
            let array = heap.handle_value(handle).as_object().unwrap();
            assert_eq!(heap.space_of(array), Some(AllocationSpace::OldPointer));
            unsafe { assert_eq!(array.field(fixed_array::element_offset(29)), Value::smi(i)) };
        }
    }

    #[test]
    fn young_survivors_keep_their_contents() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let inner = heap.allocate_fixed_array(ctx, 2, Value::smi(3), Pretenure::NotTenured);
        let outer = heap.allocate_fixed_array(ctx, 1, inner.into(), Pretenure::NotTenured);
        let handle = heap.create_handle(outer.into());
        heap.collect_all_garbage(false);
        let outer = heap.handle_value(handle).as_object().unwrap();
        let inner = unsafe { outer.field(fixed_array::element_offset(0)) }.as_object().unwrap();
        unsafe { assert_eq!(inner.field(fixed_array::element_offset(1)), Value::smi(3)) };
    }

    #[test]
    fn transition_links_do_not_keep_child_maps_alive() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let parent = heap.allocate_map(ctx, Value::ZERO, Value::ZERO, 0);
        let parent_handle = heap.create_handle(parent.into());
        let child = heap.allocate_map(ctx, Value::ZERO, Value::ZERO, 0);
        let watcher = heap.create_weak_handle(child.into());
        unsafe {
            heap.write_field(child, map::BACK_POINTER_OFFSET, parent.into());
            heap.write_field(parent, map::TRANSITIONS_OFFSET, child.into());
        }

        heap.collect_all_garbage(false);
        assert_eq!(heap.handle_value(watcher), Value::ZERO);
        let parent = heap.handle_value(parent_handle).as_object().unwrap();
        unsafe { assert_eq!(parent.field(map::TRANSITIONS_OFFSET), Value::ZERO) };

        // A child that is live on its own keeps its transition
        let child = heap.allocate_map(ctx, Value::ZERO, Value::ZERO, 0);
        let child_handle = heap.create_handle(child.into());
        unsafe {
            heap.write_field(child, map::BACK_POINTER_OFFSET, parent.into());
            heap.write_field(parent, map::TRANSITIONS_OFFSET, child.into());
        }
        heap.collect_all_garbage(true);
        let parent = heap.handle_value(parent_handle).as_object().unwrap();
        let child = heap.handle_value(child_handle);
        unsafe {
            assert_eq!(parent.field(map::TRANSITIONS_OFFSET), child);
            let child = child.as_object().unwrap();
            assert_eq!(child.field(map::BACK_POINTER_OFFSET), parent.into());
        }
    }

    #[test]
    fn descriptors_beyond_the_owned_prefix_are_cleared() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let mut watchers = Vec::new();
        let mut entries = Vec::new();
        for i in 0..4 {
            let entry = heap.allocate_fixed_array(ctx, 1, Value::smi(i), Pretenure::Tenured);
            watchers.push(heap.create_weak_handle(entry.into()));
            entries.push(entry);
        }
        let descriptors = heap.allocate_fixed_array(ctx, 4, Value::ZERO, Pretenure::Tenured);
        for (index, entry) in entries.iter().enumerate() {
            unsafe {
                heap.write_field(descriptors, fixed_array::element_offset(index), (*entry).into())
            };
        }
        let owner = heap.allocate_map(ctx, Value::ZERO, descriptors.into(), 2);
        let handle = heap.create_handle(owner.into());

        heap.collect_all_garbage(false);
        let owner = heap.handle_value(handle).as_object().unwrap();
        let descriptors = unsafe { owner.field(map::DESCRIPTORS_OFFSET) }.as_object().unwrap();
        for index in 0..4 {
            let element = unsafe { descriptors.field(fixed_array::element_offset(index)) };
            if index < 2 {
                let entry = element.as_object().unwrap();
                assert_eq!(heap.handle_value(watchers[index]), element);
                unsafe {
                    assert_eq!(entry.field(fixed_array::element_offset(0)), Value::smi(index as i64))
                };
            } else {
                assert_eq!(element, Value::ZERO);
                assert_eq!(heap.handle_value(watchers[index]), Value::ZERO);
            }
        }
    }

    #[test]
    fn ephemeron_values_live_exactly_as_long_as_their_keys() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let table = heap.allocate_ephemeron_table(ctx, 3, Pretenure::Tenured);
        let table_handle = heap.create_handle(table.into());
        let fresh = |heap: &mut Heap, i: i64| {
            heap.allocate_fixed_array(ctx, 1, Value::smi(i), Pretenure::Tenured)
        };
        let live_key = fresh(&mut heap, 0);
        let key_handle = heap.create_handle(live_key.into());
        let value = fresh(&mut heap, 1);
        let dead_key = fresh(&mut heap, 2);
        let orphan = fresh(&mut heap, 3);
        let chained = fresh(&mut heap, 4);
        let orphan_watcher = heap.create_weak_handle(orphan.into());
        // Entry 2 is keyed by entry 0's value, so it only survives through
        // the fixpoint
        let entries = [(live_key, value), (dead_key, orphan), (value, chained)];
        for (index, (key, value)) in entries.iter().enumerate() {
            unsafe {
                heap.write_field(table, ephemeron_table::key_offset(index), (*key).into());
                heap.write_field(table, ephemeron_table::value_offset(index), (*value).into());
            }
        }

        heap.collect_all_garbage(false);
        let table = heap.handle_value(table_handle).as_object().unwrap();
        let field = |offset| unsafe { table.field(offset) };
        let smi_in = |value: Value| unsafe {
            value.as_object().unwrap().field(fixed_array::element_offset(0))
        };
        assert_eq!(field(ephemeron_table::key_offset(0)), heap.handle_value(key_handle));
        assert_eq!(smi_in(field(ephemeron_table::value_offset(0))), Value::smi(1));
        assert_eq!(field(ephemeron_table::key_offset(1)), Value::ZERO);
        assert_eq!(field(ephemeron_table::value_offset(1)), Value::ZERO);
        assert_eq!(heap.handle_value(orphan_watcher), Value::ZERO);
        assert_eq!(
            field(ephemeron_table::key_offset(2)),
            field(ephemeron_table::value_offset(0))
        );
        assert_eq!(smi_in(field(ephemeron_table::value_offset(2))), Value::smi(4));
    }
}
