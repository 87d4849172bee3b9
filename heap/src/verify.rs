//! Whole-heap consistency checks.
//!
//! Verification is slow and panics on the first broken invariant. It runs
//! after every collection when `verify_heap` is set.

use object::{HeapObject, MapWord, ObjectVisitor, ShapeTable, Slot, Value, iterate_body};

use crate::space::{AddressSet, for_each_object};
use crate::{ChunkFlags, Heap, MemoryAllocator, NewSpace, VisitMode};

struct VerifyVisitor<'a> {
    starts: &'a AddressSet,
    allocator: &'a MemoryAllocator,
    new_space: &'a NewSpace,
    /// Hosts outside new space need their old-to-new slots dirty.
    old_host: bool,
    read_only_host: bool,
}

impl VerifyVisitor<'_> {
    fn check_target(&self, what: &dyn std::fmt::Debug, value: Value) -> Option<HeapObject> {
        let target = value.as_object()?;
        assert!(
            self.starts.contains(&target.address()),
            "{what:?} points at 0x{:x}, which is not an object",
            target.address()
        );
        assert!(
            !self.new_space.from_space_contains(target.address()),
            "{what:?} points into from-space"
        );
        // SAFETY: target is a known object start
        match unsafe { target.map_word() } {
            MapWord::Shape(_) => {}
            MapWord::Forwarded(to) => panic!("{what:?} points at a forwarded object (to {to:?})"),
        }
        Some(target)
    }
}

impl ObjectVisitor for VerifyVisitor<'_> {
    fn visit_pointers(&mut self, host: HeapObject, start: Slot, end: Slot) {
        for slot in Slot::range(start, end) {
            // SAFETY: slots of an iterable object
            let value = unsafe { slot.load() };
            let Some(target) = self.check_target(&host, value) else {
                continue;
            };
            let young = self.new_space.contains(target.address());
            if self.read_only_host {
                assert!(
                    self.allocator
                        .chunk_for_address(target.address())
                        .is_some_and(|chunk| chunk.has_flag(ChunkFlags::READ_ONLY)),
                    "read-only {host:?} points out of read-only space"
                );
            }
            if self.old_host && young {
                let dirty = self
                    .allocator
                    .chunk_for_address(slot.address())
                    .is_some_and(|chunk| chunk.is_dirty(slot));
                assert!(dirty, "old-to-new slot {slot:?} of {host:?} is not dirty");
            }
        }
    }
}

/// Walk `[start, end)` and check that the objects tile it exactly.
///
/// # Safety
/// The range must hold complete objects and fillers.
unsafe fn collect_starts(shapes: &ShapeTable, start: usize, end: usize, starts: &mut AddressSet) {
    let mut covered = start;
    // SAFETY: forwarded by contract
    unsafe {
        for_each_object(shapes, start, end, |object, size| {
            assert_eq!(object.address(), covered, "gap before {object:?}");
            covered += size;
            starts.insert(object.address());
        });
    }
    assert_eq!(covered, end, "objects overrun 0x{end:x}");
}

impl Heap {
    /// Check every object of every space. Panics on the first violation.
    pub fn verify_heap(&mut self) {
        for space in &mut self.paged_spaces {
            space.close_linear_allocation_area();
        }
        let shapes = &*self.shapes;
        let allocator = &self.allocator;
        let new_space = &self.new_space;

        let mut starts = AddressSet::default();
        let (to_start, to_top) = new_space.to_space_range();
        // SAFETY: to-space is iterable up to top outside a collection
        unsafe { collect_starts(shapes, to_start, to_top, &mut starts) };
        for space in &self.paged_spaces {
            for id in space.page_ids() {
                let chunk = allocator.chunk(id);
                // SAFETY: LABs are closed and nothing is forwarded
                unsafe { collect_starts(shapes, chunk.area_start(), chunk.area_end(), &mut starts) };
            }
        }
        let large: Vec<HeapObject> = self.lo_space.objects(allocator).map(|(object, _)| object).collect();
        starts.extend(large.iter().map(|object| object.address()));

        let mut visitor = VerifyVisitor {
            starts: &starts,
            allocator,
            new_space,
            old_host: false,
            read_only_host: false,
        };
        let mut verify = |visitor: &mut VerifyVisitor<'_>, object: HeapObject| {
            // SAFETY: every start was collected from an iterable range
            let shape = shapes.get(unsafe { object.shape() });
            if shape.kind.is_filler() {
                return;
            }
            let chunk = allocator.chunk_for_address(object.address());
            visitor.old_host = chunk.is_some();
            visitor.read_only_host = chunk.is_some_and(|chunk| chunk.has_flag(ChunkFlags::READ_ONLY));
            // SAFETY: as above
            unsafe { iterate_body(shapes, object, visitor) };
        };
        for &address in &starts {
            verify(&mut visitor, HeapObject::from_address(address));
        }
        let mut count = 0;
        self.roots.iterate(
            &mut |value| {
                visitor.check_target(&"root", *value);
                count += 1;
            },
            VisitMode::All,
        );
        log::trace!("verified {} objects and {count} roots", starts.len());
    }
}
