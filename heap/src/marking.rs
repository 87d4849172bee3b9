//! Tri-color marking shared by the full and the incremental collector.
//!
//! White objects have a clear mark bit. Gray objects are marked and sit on
//! the deque or carry an overflow bit. Black objects are marked and have
//! been visited. Objects without pointer slots go straight to black.

use object::{
    HeapObject, ObjectVisitor, ShapeTable, Slot, Value, VisitorKind, iterate_body,
    iterate_body_with_shape,
    layout::{self, fixed_array},
    size_with_shape,
};

use crate::space::AddressMap;
use crate::{ArrayBufferTracker, ChunkFlags, MarkBits, MemoryAllocator, MemoryChunk, NewSpace};

// ── Marking deque ─────────────────────────────────────────────────────

/// Bounded stack of gray objects. A full deque refuses pushes; the caller
/// flags the object as overflowed and a rescan picks it up later.
#[derive(Debug)]
pub(crate) struct MarkingDeque {
    items: Vec<HeapObject>,
    capacity: usize,
}

impl MarkingDeque {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    #[inline(always)]
    pub(crate) fn push(&mut self, object: HeapObject) -> bool {
        if self.items.len() >= self.capacity {
            return false;
        }
        self.items.push(object);
        true
    }

    #[inline(always)]
    pub(crate) fn pop(&mut self) -> Option<HeapObject> {
        self.items.pop()
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline(always)]
    pub(crate) fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    /// Replace every entry by `f(entry)`, dropping those mapped to `None`.
    pub(crate) fn update(&mut self, mut f: impl FnMut(HeapObject) -> Option<HeapObject>) {
        self.items = self.items.drain(..).filter_map(&mut f).collect();
    }
}

// ── Marking state ─────────────────────────────────────────────────────

/// Everything a marking cycle accumulates between steps.
#[derive(Debug)]
pub(crate) struct MarkingState {
    pub(crate) deque: MarkingDeque,
    /// Some gray object carries an overflow bit.
    pub(crate) overflowed: bool,
    /// Slots into evacuation candidates are being recorded.
    pub(crate) compacting: bool,
    /// Visited objects with weak slots, resolved after marking.
    pub(crate) weak_hosts: Vec<HeapObject>,
    pub(crate) ephemeron_tables: Vec<HeapObject>,
    /// Descriptor arrays marked through a map only, with the number of
    /// leading entries kept alive so far.
    pub(crate) descriptor_arrays: AddressMap<usize>,
    /// Bytes of objects visited.
    pub(crate) visited_bytes: usize,
}

impl MarkingState {
    pub(crate) fn new(deque_capacity: usize) -> Self {
        Self {
            deque: MarkingDeque::new(deque_capacity),
            overflowed: false,
            compacting: false,
            weak_hosts: Vec::new(),
            ephemeron_tables: Vec::new(),
            descriptor_arrays: AddressMap::default(),
            visited_bytes: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.deque.clear();
        self.overflowed = false;
        self.compacting = false;
        self.weak_hosts.clear();
        self.ephemeron_tables.clear();
        self.descriptor_arrays.clear();
        self.visited_bytes = 0;
    }

    /// Follow objects a scavenge moved. `forward` maps an object to its new
    /// location, or `None` if it died.
    pub(crate) fn update_after_scavenge(
        &mut self,
        mut forward: impl FnMut(HeapObject) -> Option<HeapObject>,
    ) {
        self.deque.update(&mut forward);
        self.weak_hosts = self.weak_hosts.drain(..).filter_map(&mut forward).collect();
        self.ephemeron_tables = self
            .ephemeron_tables
            .drain(..)
            .filter_map(&mut forward)
            .collect();
        self.descriptor_arrays = self
            .descriptor_arrays
            .drain()
            .filter_map(|(address, done)| {
                forward(HeapObject::from_address(address)).map(|to| (to.address(), done))
            })
            .collect();
    }
}

// ── Liveness ──────────────────────────────────────────────────────────

/// Where an object's mark bit lives.
pub(crate) enum Location<'a> {
    New(&'a MarkBits),
    Chunk(&'a MemoryChunk),
    /// Read-only or outside the heap: never collected.
    Immortal,
}

#[inline]
pub(crate) fn locate<'a>(
    new_space: &'a NewSpace,
    allocator: &'a MemoryAllocator,
    object: HeapObject,
) -> Location<'a> {
    let address = object.address();
    if new_space.contains(address) {
        return Location::New(new_space.marks_for(address));
    }
    match allocator.chunk_for_address(address) {
        Some(chunk) if !chunk.has_flag(ChunkFlags::READ_ONLY) => Location::Chunk(chunk),
        _ => Location::Immortal,
    }
}

#[inline]
pub(crate) fn is_marked(new_space: &NewSpace, allocator: &MemoryAllocator, object: HeapObject) -> bool {
    match locate(new_space, allocator, object) {
        Location::New(marks) => marks.is_marked(object),
        Location::Chunk(chunk) => chunk.marks().is_marked(object),
        Location::Immortal => true,
    }
}

/// Remember `slot` of `host` for pointer updating if `target` is about to
/// be evacuated. Hosts that move themselves, or live in new space, are
/// updated wholesale and need no record.
pub(crate) fn record_slot(
    compacting: bool,
    new_space: &NewSpace,
    allocator: &MemoryAllocator,
    host: HeapObject,
    slot: Slot,
    target: HeapObject,
) {
    if !compacting || new_space.contains(target.address()) {
        return;
    }
    let Some(target_chunk) = allocator.chunk_for_address(target.address()) else {
        return;
    };
    if !target_chunk.is_evacuation_candidate() || new_space.contains(host.address()) {
        return;
    }
    if allocator
        .chunk_for_address(host.address())
        .is_some_and(|chunk| chunk.is_evacuation_candidate())
    {
        return;
    }
    if !target_chunk.record_slot(slot) {
        evict_evacuation_candidate(target_chunk);
    }
}

/// Drop a page from the candidate set after its slots buffer overflowed.
/// Its own objects were never recorded as hosts, so they are rescanned
/// when pointers are updated.
pub(crate) fn evict_evacuation_candidate(chunk: &MemoryChunk) {
    log::warn!(
        "slots buffer of page {:?} overflowed, evicting it from evacuation",
        chunk.id()
    );
    chunk.clear_flag(ChunkFlags::EVACUATION_CANDIDATE);
    chunk.set_flag(ChunkFlags::RESCAN_ON_EVACUATION);
    chunk.clear_slots();
}

// ── Marker ────────────────────────────────────────────────────────────

/// Marks objects and visits gray ones.
pub(crate) struct Marker<'a> {
    pub(crate) shapes: &'a ShapeTable,
    pub(crate) allocator: &'a MemoryAllocator,
    pub(crate) new_space: &'a NewSpace,
    pub(crate) state: &'a mut MarkingState,
    pub(crate) array_buffers: &'a mut ArrayBufferTracker,
}

impl<'a> Marker<'a> {
    #[inline]
    fn mark_bits(&self, object: HeapObject) -> Option<(&'a MarkBits, Option<&'a MemoryChunk>)> {
        match locate(self.new_space, self.allocator, object) {
            Location::New(marks) => Some((marks, None)),
            Location::Chunk(chunk) => Some((chunk.marks(), Some(chunk))),
            Location::Immortal => None,
        }
    }

    #[inline]
    fn is_live(&self, object: HeapObject) -> bool {
        is_marked(self.new_space, self.allocator, object)
    }

    /// Mark a root value.
    #[inline]
    pub(crate) fn mark_value(&mut self, value: Value) {
        if let Some(object) = value.as_object() {
            self.mark_object(object);
        }
    }

    /// White to gray (or straight to black for objects without pointers).
    pub(crate) fn mark_object(&mut self, object: HeapObject) {
        let Some((marks, chunk)) = self.mark_bits(object) else {
            return;
        };
        if !marks.mark(object) {
            self.revisit_descriptor_array(object, marks, chunk);
            return;
        }
        let kind = self.account(object, chunk);
        if kind == VisitorKind::ArrayBuffer {
            self.array_buffers.discover(object);
        }
        if kind.has_pointers() {
            self.push(object, marks, chunk);
        }
    }

    fn account(&mut self, object: HeapObject, chunk: Option<&MemoryChunk>) -> VisitorKind {
        // SAFETY: only live, unforwarded objects get marked
        let shape = self.shapes.get(unsafe { object.shape() });
        if let Some(chunk) = chunk {
            // SAFETY: as above
            chunk.increment_live_bytes(unsafe { size_with_shape(shape, object) });
        }
        shape.kind
    }

    fn push(&mut self, object: HeapObject, marks: &MarkBits, chunk: Option<&MemoryChunk>) {
        if self.state.deque.push(object) {
            return;
        }
        marks.set_overflow(object);
        if let Some(chunk) = chunk {
            chunk.set_flag(ChunkFlags::HAS_OVERFLOW);
        }
        if !self.state.overflowed {
            log::warn!("marking deque overflowed, falling back to rescanning");
        }
        self.state.overflowed = true;
    }

    /// A strong reference reached a descriptor array that so far was only
    /// kept alive through a map; visit all of it.
    fn revisit_descriptor_array(
        &mut self,
        object: HeapObject,
        marks: &MarkBits,
        chunk: Option<&MemoryChunk>,
    ) {
        if self.state.descriptor_arrays.is_empty() {
            return;
        }
        if self.state.descriptor_arrays.remove(&object.address()).is_some() {
            self.push(object, marks, chunk);
        }
    }

    fn record(&mut self, host: HeapObject, slot: Slot, target: HeapObject) {
        record_slot(
            self.state.compacting,
            self.new_space,
            self.allocator,
            host,
            slot,
            target,
        );
    }

    /// Visit gray objects until the deque is empty or `budget` bytes were
    /// visited. Returns the bytes visited.
    pub(crate) fn drain(&mut self, budget: usize) -> usize {
        let shapes = self.shapes;
        let mut visited = 0;
        while visited < budget {
            let Some(object) = self.state.deque.pop() else {
                break;
            };
            // SAFETY: gray objects are live and unforwarded
            unsafe {
                let shape = shapes.get(object.shape());
                visited += size_with_shape(shape, object);
                iterate_body_with_shape(shape, object, self);
            }
        }
        self.state.visited_bytes += visited;
        visited
    }

    /// Drain completely, rescanning overflowed objects until none remain.
    pub(crate) fn drain_all(&mut self) {
        loop {
            self.drain(usize::MAX);
            if !self.refill_from_overflow() {
                break;
            }
        }
    }

    /// Move overflowed objects back onto the deque. Returns false if there
    /// were none.
    pub(crate) fn refill_from_overflow(&mut self) -> bool {
        if !self.state.overflowed {
            return false;
        }
        self.state.overflowed = false;
        let allocator = self.allocator;
        for chunk in allocator.chunks() {
            if !chunk.has_flag(ChunkFlags::HAS_OVERFLOW) {
                continue;
            }
            chunk.clear_flag(ChunkFlags::HAS_OVERFLOW);
            self.refill_from(chunk.marks(), Some(chunk));
        }
        let new_space = self.new_space;
        for semispace in [new_space.to_space(), new_space.from_space()] {
            if semispace.marks().has_overflow() {
                self.refill_from(semispace.marks(), None);
            }
        }
        true
    }

    fn refill_from(&mut self, marks: &MarkBits, chunk: Option<&MemoryChunk>) {
        for object in marks.overflowed_objects() {
            marks.take_overflow(object);
            if self.state.deque.is_full() {
                self.drain(usize::MAX);
            }
            self.push(object, marks, chunk);
        }
    }

    /// Mark ephemeron values whose keys turned out live, until nothing
    /// changes.
    pub(crate) fn process_ephemerons(&mut self) {
        loop {
            let tables = self.state.ephemeron_tables.clone();
            let mut progress = false;
            for table in tables {
                // SAFETY: tables on the list are marked, live objects
                let entries = unsafe { table.field(layout::ephemeron_table::ENTRIES_OFFSET) }
                    .smi_usize();
                for index in 0..entries {
                    let key = table.slot(layout::ephemeron_table::key_offset(index));
                    let value_slot = table.slot(layout::ephemeron_table::value_offset(index));
                    if !self.key_is_live(key) {
                        continue;
                    }
                    // SAFETY: as above
                    let Some(value) = (unsafe { value_slot.load() }).as_object() else {
                        continue;
                    };
                    if !self.is_live(value) {
                        self.record(table, value_slot, value);
                        self.mark_object(value);
                        progress = true;
                    }
                }
            }
            if !progress {
                break;
            }
            self.drain_all();
        }
    }

    fn key_is_live(&self, key: Slot) -> bool {
        // SAFETY: key slots belong to live tables
        match unsafe { key.load() }.as_object() {
            Some(object) => self.is_live(object),
            None => true,
        }
    }

    /// Marking is finished once nothing is gray.
    pub(crate) fn is_done(&self) -> bool {
        self.state.deque.is_empty() && !self.state.overflowed
    }
}

impl ObjectVisitor for Marker<'_> {
    fn visit_pointers(&mut self, host: HeapObject, start: Slot, end: Slot) {
        for slot in Slot::range(start, end) {
            // SAFETY: slots of a visited object are readable
            if let Some(target) = unsafe { slot.load() }.as_object() {
                self.record(host, slot, target);
                self.mark_object(target);
            }
        }
    }

    fn visit_weak_pointers(&mut self, host: HeapObject, _start: Slot, _end: Slot) {
        self.state.weak_hosts.push(host);
    }

    fn visit_descriptors(&mut self, host: HeapObject, slot: Slot, own: usize) {
        // SAFETY: the slot belongs to a visited map
        let Some(array) = unsafe { slot.load() }.as_object() else {
            return;
        };
        self.record(host, slot, array);
        let Some((marks, chunk)) = self.mark_bits(array) else {
            return;
        };
        // SAFETY: referents of live objects are live and unforwarded
        let kind = self.shapes.kind(unsafe { array.shape() });
        if kind != VisitorKind::FixedArray {
            self.mark_object(array);
            return;
        }
        if marks.mark(array) {
            self.account(array, chunk);
            self.state.descriptor_arrays.insert(array.address(), 0);
        }
        let Some(&done) = self.state.descriptor_arrays.get(&array.address()) else {
            return;
        };
        // SAFETY: as above
        let length = unsafe { array.field(fixed_array::LENGTH_OFFSET) }.smi_usize();
        let own = own.min(length);
        if own > done {
            self.state.descriptor_arrays.insert(array.address(), own);
            self.visit_pointers(
                array,
                array.slot(fixed_array::element_offset(done)),
                array.slot(fixed_array::element_offset(own)),
            );
        }
    }

    fn visit_ephemerons(&mut self, host: HeapObject, start: Slot, end: Slot) {
        self.state.ephemeron_tables.push(host);
        for key in Slot::range(start, end).step_by(2) {
            if self.key_is_live(key) {
                let value = key.next();
                self.visit_pointers(host, value, value.next());
            }
        }
    }
}

// ── Weak reference clearing ───────────────────────────────────────────

/// Clears weak slots whose targets stayed white and records the live ones.
struct WeakClearer<'a> {
    allocator: &'a MemoryAllocator,
    new_space: &'a NewSpace,
    compacting: bool,
    cleared: usize,
}

impl WeakClearer<'_> {
    fn process_slot(&mut self, host: HeapObject, slot: Slot) {
        // SAFETY: weak hosts are live objects
        let Some(target) = unsafe { slot.load() }.as_object() else {
            return;
        };
        if is_marked(self.new_space, self.allocator, target) {
            record_slot(self.compacting, self.new_space, self.allocator, host, slot, target);
        } else {
            // SAFETY: as above
            unsafe { slot.store(Value::ZERO) };
            self.cleared += 1;
        }
    }
}

impl ObjectVisitor for WeakClearer<'_> {
    fn visit_pointers(&mut self, _host: HeapObject, _start: Slot, _end: Slot) {}

    fn visit_weak_pointers(&mut self, host: HeapObject, start: Slot, end: Slot) {
        for slot in Slot::range(start, end) {
            self.process_slot(host, slot);
        }
    }

    fn visit_descriptors(&mut self, _host: HeapObject, _slot: Slot, _own: usize) {}

    fn visit_ephemerons(&mut self, _host: HeapObject, _start: Slot, _end: Slot) {}
}

/// Resolve weak references once marking is complete: weak slots, the
/// unowned tails of descriptor arrays and ephemerons with dead keys.
/// Returns the number of references cleared.
pub(crate) fn clear_dead_references(
    shapes: &ShapeTable,
    allocator: &MemoryAllocator,
    new_space: &NewSpace,
    state: &mut MarkingState,
) -> usize {
    let mut clearer = WeakClearer {
        allocator,
        new_space,
        compacting: state.compacting,
        cleared: 0,
    };
    for &host in &state.weak_hosts {
        // SAFETY: weak hosts are marked, live objects
        unsafe { iterate_body(shapes, host, &mut clearer) };
    }
    for (&address, &done) in &state.descriptor_arrays {
        let array = HeapObject::from_address(address);
        // SAFETY: partially marked arrays are live
        let length = unsafe { array.field(fixed_array::LENGTH_OFFSET) }.smi_usize();
        for index in done..length {
            clearer.process_slot(array, array.slot(fixed_array::element_offset(index)));
        }
    }
    for &table in &state.ephemeron_tables {
        // SAFETY: tables on the list are live
        let entries =
            unsafe { table.field(layout::ephemeron_table::ENTRIES_OFFSET) }.smi_usize();
        for index in 0..entries {
            let key = table.slot(layout::ephemeron_table::key_offset(index));
            let value = table.slot(layout::ephemeron_table::value_offset(index));
            // SAFETY: as above
            let key_target = unsafe { key.load() }.as_object();
            match key_target {
                Some(object) if !is_marked(new_space, allocator, object) => {
                    // SAFETY: as above
                    unsafe {
                        key.store(Value::ZERO);
                        value.store(Value::ZERO);
                    }
                    clearer.cleared += 1;
                }
                _ => {
                    for slot in [key, value] {
                        // SAFETY: as above
                        if let Some(target) = unsafe { slot.load() }.as_object() {
                            record_slot(
                                clearer.compacting,
                                new_space,
                                allocator,
                                table,
                                slot,
                                target,
                            );
                        }
                    }
                }
            }
        }
    }
    clearer.cleared
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deque_refuses_beyond_capacity() {
        let mut deque = MarkingDeque::new(2);
        assert!(deque.push(HeapObject::from_address(8)));
        assert!(deque.push(HeapObject::from_address(16)));
        assert!(deque.is_full());
        assert!(!deque.push(HeapObject::from_address(24)));
        assert_eq!(deque.len(), 2);
        assert_eq!(deque.pop(), Some(HeapObject::from_address(16)));
    }

    #[test]
    fn deque_update_forwards_and_drops() {
        let mut deque = MarkingDeque::new(8);
        for address in [8, 16, 24] {
            deque.push(HeapObject::from_address(address));
        }
        deque.update(|object| match object.address() {
            16 => None,
            address => Some(HeapObject::from_address(address + 1000)),
        });
        assert_eq!(deque.pop(), Some(HeapObject::from_address(1024)));
        assert_eq!(deque.pop(), Some(HeapObject::from_address(1008)));
        assert!(deque.is_empty());
    }

    #[test]
    fn state_update_rekeys_descriptor_progress() {
        let mut state = MarkingState::new(4);
        state.descriptor_arrays.insert(64, 2);
        state.descriptor_arrays.insert(128, 1);
        state.weak_hosts.push(HeapObject::from_address(64));
        state.update_after_scavenge(|object| {
            (object.address() == 64).then(|| HeapObject::from_address(256))
        });
        assert_eq!(state.descriptor_arrays.get(&256), Some(&2));
        assert_eq!(state.descriptor_arrays.len(), 1);
        assert_eq!(state.weak_hosts, vec![HeapObject::from_address(256)]);
    }
}
