//! Rebuilding free lists from mark bits.
//!
//! Every gap between marked objects on a page goes back to the space's free
//! list. Gaps below the minimum block size become waste. Either way the gap
//! is overwritten with a filler so the page stays iterable.

use object::{HeapObject, ShapeTable, object_size};

use crate::{ChunkId, MemoryAllocator, PagedSpace};

/// What one sweep found on a space.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepResult {
    pub(crate) live_bytes: usize,
    pub(crate) free_bytes: usize,
    pub(crate) wasted_bytes: usize,
}

/// Sweep every page of `space` and clear its mark bits.
pub(crate) fn sweep_space(
    space: &mut PagedSpace,
    allocator: &mut MemoryAllocator,
    shapes: &ShapeTable,
) -> SweepResult {
    space.reset_free_list();
    let pages: Vec<ChunkId> = space.page_ids().collect();
    let mut total = SweepResult::default();
    for id in pages {
        let page = sweep_page(space, allocator, shapes, id);
        total.live_bytes += page.live_bytes;
        total.free_bytes += page.free_bytes;
        total.wasted_bytes += page.wasted_bytes;
    }
    log::trace!(
        "swept {}: {} live, {} free, {} wasted",
        space.id().name(),
        total.live_bytes,
        total.free_bytes,
        total.wasted_bytes
    );
    total
}

fn sweep_page(
    space: &mut PagedSpace,
    allocator: &mut MemoryAllocator,
    shapes: &ShapeTable,
    id: ChunkId,
) -> SweepResult {
    let chunk = allocator.chunk(id);
    let (area_start, area_end) = (chunk.area_start(), chunk.area_end());
    let live: Vec<HeapObject> = chunk.marks().marked_objects().collect();
    chunk.marks().clear();

    let mut result = SweepResult::default();
    let mut free_gap = |start: usize, end: usize, result: &mut SweepResult| {
        if end > start {
            // SAFETY: nothing marked lies in the gap, so it holds only
            // dead objects and fillers
            let wasted = unsafe { space.free(start, end - start) };
            result.wasted_bytes += wasted;
            result.free_bytes += end - start - wasted;
        }
    };
    let mut cursor = area_start;
    for object in live {
        free_gap(cursor, object.address(), &mut result);
        // SAFETY: marked objects are live and unforwarded
        let size = unsafe { object_size(shapes, object) };
        result.live_bytes += size;
        cursor = object.address() + size;
    }
    free_gap(cursor, area_end, &mut result);

    let chunk = allocator.chunk_mut(id);
    chunk.set_live_bytes(result.live_bytes);
    chunk.free_bytes = result.free_bytes;
    chunk.wasted_bytes = result.wasted_bytes;
    result
}

#[cfg(test)]
mod tests {
    use object::{ShapeId, Value, layout};

    use super::*;
    use crate::{AllocationSpace, CodeRangeAddressHint, HeapSettings};

    fn create_test_space() -> (MemoryAllocator, PagedSpace) {
        let settings = HeapSettings {
            page_size: 64 * 1024,
            max_old_generation_size: 256 * 1024,
            code_range_size: 0,
            concurrent_unmapping: false,
            ..HeapSettings::default()
        };
        let allocator = MemoryAllocator::new(&settings, CodeRangeAddressHint::shared());
        let space = PagedSpace::new(AllocationSpace::OldPointer, &settings);
        (allocator, space)
    }

    fn alloc_array(space: &mut PagedSpace, allocator: &mut MemoryAllocator, length: usize) -> HeapObject {
        let size = layout::fixed_array_size(length);
        let object = space.allocate_raw(allocator, size, true).ok().unwrap();
        unsafe { layout::init_fixed_array(object, ShapeId::FIXED_ARRAY, length, Value::ZERO) };
        object
    }

    #[test]
    fn free_and_live_bytes_cover_the_page() {
        let (mut allocator, mut space) = create_test_space();
        let shapes = ShapeTable::new();
        let objects: Vec<HeapObject> = (0..20)
            .map(|i| alloc_array(&mut space, &mut allocator, i % 5 + 1))
            .collect();
        space.close_linear_allocation_area();
        let id = space.page_ids().next().unwrap();
        let mut expected_live = 0;
        for object in objects.iter().step_by(3) {
            allocator.chunk(id).marks().mark(*object);
            expected_live += unsafe { object_size(&shapes, *object) };
        }

        let result = sweep_space(&mut space, &mut allocator, &shapes);
        let chunk = allocator.chunk(id);
        assert_eq!(result.live_bytes, expected_live);
        assert_eq!(chunk.live_bytes(), expected_live);
        assert_eq!(
            result.live_bytes + result.free_bytes + result.wasted_bytes,
            chunk.area_size()
        );
        assert_eq!(chunk.marks().marked_count(), 0);

        let accounting = space.accounting();
        assert_eq!(accounting.size, expected_live);
        assert_eq!(accounting.available, result.free_bytes);
        assert_eq!(accounting.waste, result.wasted_bytes);

        let mut walked = 0;
        unsafe { space.for_each_object(&allocator, &shapes, |_, size| walked += size) };
        assert_eq!(walked, chunk.area_size());
        space.tear_down(&mut allocator);
    }

    #[test]
    fn unmarked_page_becomes_one_free_block() {
        let (mut allocator, mut space) = create_test_space();
        let shapes = ShapeTable::new();
        alloc_array(&mut space, &mut allocator, 8);
        let result = sweep_space(&mut space, &mut allocator, &shapes);
        assert_eq!(result.live_bytes, 0);
        assert_eq!(result.free_bytes, 64 * 1024);
        assert!(space.can_allocate_without_expanding(64 * 1024));
        assert_eq!(space.shrink(&mut allocator), 0);
        space.tear_down(&mut allocator);
    }
}
