use crate::layout::{self, ephemeron_table, fixed_array, map};
use crate::{HeapObject, Shape, ShapeTable, Slot, VisitorKind, WORD_SIZE};

/// Callback interface for walking the tagged slots of one object.
///
/// Only `visit_pointers` is required. The other hooks exist so collectors
/// can treat weak references, map descriptor arrays and ephemeron pairs
/// specially; by default they are visited like ordinary strong slots.
pub trait ObjectVisitor {
    /// Visit the strong tagged slots in `[start, end)` of `host`.
    fn visit_pointers(&mut self, host: HeapObject, start: Slot, end: Slot);

    /// Visit slots that do not keep their target alive.
    fn visit_weak_pointers(&mut self, host: HeapObject, start: Slot, end: Slot) {
        self.visit_pointers(host, start, end);
    }

    /// Visit a map's descriptor array slot. `own` is the number of leading
    /// entries this map owns.
    fn visit_descriptors(&mut self, host: HeapObject, slot: Slot, own: usize) {
        let _ = own;
        self.visit_pointers(host, slot, slot.next());
    }

    /// Visit the key/value pairs of an ephemeron table. `[start, end)`
    /// holds alternating key and value slots.
    fn visit_ephemerons(&mut self, host: HeapObject, start: Slot, end: Slot) {
        self.visit_pointers(host, start, end);
    }
}

/// Number of bytes `object` occupies, given its shape.
///
/// # Safety
/// `object` must be a readable object of shape `shape`. The map word itself
/// is not read, so this also works on a copy whose original was forwarded.
#[inline]
pub unsafe fn size_with_shape(shape: &Shape, object: HeapObject) -> usize {
    if let Some(size) = shape.instance_size {
        return size;
    }
    // SAFETY: length fields are inside the object by contract
    let length = |offset: usize| unsafe { object.field(offset).smi_usize() };
    match shape.kind {
        VisitorKind::Filler => length(layout::filler::SIZE_OFFSET),
        VisitorKind::ByteArray => layout::byte_array_size(length(layout::byte_array::LENGTH_OFFSET)),
        VisitorKind::FixedArray | VisitorKind::WeakArray => {
            layout::fixed_array_size(length(fixed_array::LENGTH_OFFSET))
        }
        VisitorKind::EphemeronTable => {
            layout::ephemeron_table_size(length(ephemeron_table::ENTRIES_OFFSET))
        }
        VisitorKind::Code => layout::code_size(length(layout::code::INSTRUCTION_SIZE_OFFSET)),
        kind => panic!("shape {} of kind {kind:?} has no instance size", shape.name),
    }
}

/// Number of bytes `object` occupies.
///
/// # Safety
/// `object` must be a readable, non-forwarded object.
#[inline]
pub unsafe fn object_size(shapes: &ShapeTable, object: HeapObject) -> usize {
    // SAFETY: forwarded by contract
    unsafe { size_with_shape(shapes.get(object.shape()), object) }
}

/// Report every tagged slot of `object` to `visitor`.
///
/// # Safety
/// `object` must be a readable, non-forwarded object.
pub unsafe fn iterate_body(shapes: &ShapeTable, object: HeapObject, visitor: &mut dyn ObjectVisitor) {
    // SAFETY: forwarded by contract
    unsafe {
        let shape = shapes.get(object.shape());
        iterate_body_with_shape(shape, object, visitor);
    }
}

/// Like [`iterate_body`] but with the shape already resolved.
///
/// # Safety
/// `object` must be a readable object of shape `shape`.
pub unsafe fn iterate_body_with_shape(
    shape: &Shape,
    object: HeapObject,
    visitor: &mut dyn ObjectVisitor,
) {
    let range = |from: usize, to: usize| (object.slot(from), object.slot(to));
    match shape.kind {
        VisitorKind::OneWordFiller
        | VisitorKind::Filler
        | VisitorKind::ByteArray
        | VisitorKind::DataObject
        | VisitorKind::ExternalString
        | VisitorKind::ArrayBuffer => {}
        VisitorKind::FixedArray => {
            // SAFETY: forwarded by contract
            let size = unsafe { size_with_shape(shape, object) };
            let (start, end) = range(fixed_array::ELEMENTS_OFFSET, size);
            visitor.visit_pointers(object, start, end);
        }
        VisitorKind::WeakArray => {
            // SAFETY: forwarded by contract
            let size = unsafe { size_with_shape(shape, object) };
            let (start, end) = range(fixed_array::ELEMENTS_OFFSET, size);
            visitor.visit_weak_pointers(object, start, end);
        }
        VisitorKind::Struct => {
            // SAFETY: forwarded by contract
            let size = unsafe { size_with_shape(shape, object) };
            let (start, end) = range(layout::HEADER_SIZE, size);
            visitor.visit_pointers(object, start, end);
        }
        VisitorKind::Map => {
            // SAFETY: forwarded by contract
            let own = unsafe { object.field(map::OWN_DESCRIPTORS_OFFSET) }
                .to_smi()
                .unwrap_or(0)
                .max(0) as usize;
            let (start, end) = range(map::PROTOTYPE_OFFSET, map::DESCRIPTORS_OFFSET);
            visitor.visit_pointers(object, start, end);
            visitor.visit_descriptors(object, object.slot(map::DESCRIPTORS_OFFSET), own);
            // Back pointer and transitions
            let (start, end) = range(map::BACK_POINTER_OFFSET, map::SIZE);
            visitor.visit_weak_pointers(object, start, end);
        }
        VisitorKind::WeakCell => {
            let (start, end) = range(layout::weak_cell::VALUE_OFFSET, layout::weak_cell::SIZE);
            visitor.visit_weak_pointers(object, start, end);
        }
        VisitorKind::EphemeronTable => {
            // SAFETY: forwarded by contract
            let entries = unsafe { object.field(ephemeron_table::ENTRIES_OFFSET) }.smi_usize();
            let (start, end) = range(
                ephemeron_table::FIRST_ENTRY_OFFSET,
                layout::ephemeron_table_size(entries),
            );
            visitor.visit_ephemerons(object, start, end);
        }
        VisitorKind::Code => {
            let (start, end) = range(
                layout::code::CONSTANT_POOL_OFFSET,
                layout::code::CONSTANT_POOL_OFFSET + WORD_SIZE,
            );
            visitor.visit_pointers(object, start, end);
        }
        VisitorKind::Cell => {
            let (start, end) = range(layout::cell::VALUE_OFFSET, layout::cell::SIZE);
            visitor.visit_pointers(object, start, end);
        }
    }
}
