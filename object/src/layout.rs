//! Field offsets and size rules for the built-in shapes.
//!
//! Every object begins with its map word at offset 0. Lengths are stored as
//! Smis so a heap walk never confuses them with pointers.

use crate::{Address, HeapObject, MapWord, ShapeId, Value, WORD_SIZE, align_object_size};

pub const HEADER_SIZE: usize = WORD_SIZE;

pub mod filler {
    use crate::WORD_SIZE;

    /// Byte size of the covered region, as a Smi. Absent for one-word fillers.
    pub const SIZE_OFFSET: usize = WORD_SIZE;
    pub const MIN_SIZE: usize = 2 * WORD_SIZE;
}

pub mod byte_array {
    use crate::WORD_SIZE;

    pub const LENGTH_OFFSET: usize = WORD_SIZE;
    pub const DATA_OFFSET: usize = 2 * WORD_SIZE;
}

pub mod fixed_array {
    use crate::WORD_SIZE;

    pub const LENGTH_OFFSET: usize = WORD_SIZE;
    pub const ELEMENTS_OFFSET: usize = 2 * WORD_SIZE;

    #[inline(always)]
    pub const fn element_offset(index: usize) -> usize {
        ELEMENTS_OFFSET + index * WORD_SIZE
    }
}

pub mod map {
    use crate::WORD_SIZE;

    pub const PROTOTYPE_OFFSET: usize = WORD_SIZE;
    /// Descriptor array shared along a transition tree.
    pub const DESCRIPTORS_OFFSET: usize = 2 * WORD_SIZE;
    /// How many leading descriptor entries this map owns, as a Smi.
    pub const OWN_DESCRIPTORS_OFFSET: usize = 3 * WORD_SIZE;
    /// Held weakly: a dead parent map is cleared to Smi zero.
    pub const BACK_POINTER_OFFSET: usize = 4 * WORD_SIZE;
    /// Also weak: a parent map does not keep its transition targets alive.
    pub const TRANSITIONS_OFFSET: usize = 5 * WORD_SIZE;
    pub const SIZE: usize = 6 * WORD_SIZE;
}

pub mod weak_cell {
    use crate::WORD_SIZE;

    pub const VALUE_OFFSET: usize = WORD_SIZE;
    pub const SIZE: usize = 2 * WORD_SIZE;
}

pub mod ephemeron_table {
    use crate::WORD_SIZE;

    pub const ENTRIES_OFFSET: usize = WORD_SIZE;
    pub const FIRST_ENTRY_OFFSET: usize = 2 * WORD_SIZE;
    pub const ENTRY_SIZE: usize = 2 * WORD_SIZE;

    #[inline(always)]
    pub const fn key_offset(index: usize) -> usize {
        FIRST_ENTRY_OFFSET + index * ENTRY_SIZE
    }

    #[inline(always)]
    pub const fn value_offset(index: usize) -> usize {
        key_offset(index) + WORD_SIZE
    }
}

pub mod external_string {
    use crate::WORD_SIZE;

    pub const LENGTH_OFFSET: usize = WORD_SIZE;
    /// Index into the heap's external resource table, as a Smi.
    pub const RESOURCE_OFFSET: usize = 2 * WORD_SIZE;
    pub const SIZE: usize = 3 * WORD_SIZE;
}

pub mod array_buffer {
    use crate::WORD_SIZE;

    pub const BYTE_LENGTH_OFFSET: usize = WORD_SIZE;
    /// Raw (untagged) backing store pointer; zero when detached.
    pub const BACKING_STORE_OFFSET: usize = 2 * WORD_SIZE;
    pub const SIZE: usize = 3 * WORD_SIZE;
}

pub mod code {
    use crate::WORD_SIZE;

    pub const INSTRUCTION_SIZE_OFFSET: usize = WORD_SIZE;
    pub const CONSTANT_POOL_OFFSET: usize = 2 * WORD_SIZE;
    pub const INSTRUCTIONS_OFFSET: usize = 3 * WORD_SIZE;
}

pub mod cell {
    use crate::WORD_SIZE;

    pub const VALUE_OFFSET: usize = WORD_SIZE;
    pub const SIZE: usize = 2 * WORD_SIZE;
}

// ── Size rules ─────────────────────────────────────────────────────

#[inline(always)]
pub const fn byte_array_size(length: usize) -> usize {
    align_object_size(byte_array::DATA_OFFSET + length)
}

#[inline(always)]
pub const fn fixed_array_size(length: usize) -> usize {
    fixed_array::ELEMENTS_OFFSET + length * WORD_SIZE
}

#[inline(always)]
pub const fn ephemeron_table_size(entries: usize) -> usize {
    ephemeron_table::FIRST_ENTRY_OFFSET + entries * ephemeron_table::ENTRY_SIZE
}

#[inline(always)]
pub const fn code_size(instruction_size: usize) -> usize {
    align_object_size(code::INSTRUCTIONS_OFFSET + instruction_size)
}

// ── Fillers ────────────────────────────────────────────────────────

/// Turn `[start, start + size)` into a filler object so the region can be
/// walked like any other object.
///
/// # Safety
/// The region must be writable heap memory; `size` must be a non-zero
/// multiple of the word size.
pub unsafe fn write_filler(start: Address, size: usize) {
    debug_assert!(size >= WORD_SIZE && size % WORD_SIZE == 0, "bad filler size {size}");
    let object = HeapObject::from_address(start);
    // SAFETY: caller guarantees the region is writable
    unsafe {
        if size == WORD_SIZE {
            object.set_map_word(MapWord::Shape(ShapeId::ONE_WORD_FILLER));
        } else {
            object.set_map_word(MapWord::Shape(ShapeId::FILLER));
            object.set_field(filler::SIZE_OFFSET, Value::smi(size as i64));
        }
    }
}

// ── Initializers ───────────────────────────────────────────────────
//
// These write a complete, walkable object into freshly allocated memory.
// The caller owns the write barrier: fresh objects need none.

/// # Safety
/// `object` must point at `byte_array_size(length)` writable bytes.
pub unsafe fn init_byte_array(object: HeapObject, shape: ShapeId, length: usize) {
    // SAFETY: caller guarantees the allocation
    unsafe {
        object.set_map_word(MapWord::Shape(shape));
        object.set_field(byte_array::LENGTH_OFFSET, Value::smi(length as i64));
        let data = object.byte_ptr(byte_array::DATA_OFFSET);
        let padded = byte_array_size(length) - byte_array::DATA_OFFSET;
        data.write_bytes(0, padded);
    }
}

/// # Safety
/// `object` must point at `fixed_array_size(length)` writable bytes.
pub unsafe fn init_fixed_array(object: HeapObject, shape: ShapeId, length: usize, fill: Value) {
    // SAFETY: caller guarantees the allocation
    unsafe {
        object.set_map_word(MapWord::Shape(shape));
        object.set_field(fixed_array::LENGTH_OFFSET, Value::smi(length as i64));
        for i in 0..length {
            object.set_field(fixed_array::element_offset(i), fill);
        }
    }
}

/// # Safety
/// `object` must point at `size` writable bytes, where `size` is the
/// shape's instance size.
pub unsafe fn init_struct(object: HeapObject, shape: ShapeId, size: usize, fill: Value) {
    // SAFETY: caller guarantees the allocation
    unsafe {
        object.set_map_word(MapWord::Shape(shape));
        let mut offset = HEADER_SIZE;
        while offset < size {
            object.set_field(offset, fill);
            offset += WORD_SIZE;
        }
    }
}

/// # Safety
/// `object` must point at `map::SIZE` writable bytes.
pub unsafe fn init_map(object: HeapObject, prototype: Value, descriptors: Value, own: usize) {
    // SAFETY: caller guarantees the allocation
    unsafe {
        object.set_map_word(MapWord::Shape(ShapeId::MAP));
        object.set_field(map::PROTOTYPE_OFFSET, prototype);
        object.set_field(map::DESCRIPTORS_OFFSET, descriptors);
        object.set_field(map::OWN_DESCRIPTORS_OFFSET, Value::smi(own as i64));
        object.set_field(map::BACK_POINTER_OFFSET, Value::ZERO);
        object.set_field(map::TRANSITIONS_OFFSET, Value::ZERO);
    }
}

/// # Safety
/// `object` must point at `weak_cell::SIZE` writable bytes.
pub unsafe fn init_weak_cell(object: HeapObject, value: Value) {
    // SAFETY: caller guarantees the allocation
    unsafe {
        object.set_map_word(MapWord::Shape(ShapeId::WEAK_CELL));
        object.set_field(weak_cell::VALUE_OFFSET, value);
    }
}

/// # Safety
/// `object` must point at `ephemeron_table_size(entries)` writable bytes.
pub unsafe fn init_ephemeron_table(object: HeapObject, entries: usize) {
    // SAFETY: caller guarantees the allocation
    unsafe {
        object.set_map_word(MapWord::Shape(ShapeId::EPHEMERON_TABLE));
        object.set_field(ephemeron_table::ENTRIES_OFFSET, Value::smi(entries as i64));
        for i in 0..entries {
            object.set_field(ephemeron_table::key_offset(i), Value::ZERO);
            object.set_field(ephemeron_table::value_offset(i), Value::ZERO);
        }
    }
}

/// # Safety
/// `object` must point at `external_string::SIZE` writable bytes.
pub unsafe fn init_external_string(object: HeapObject, length: usize, resource: usize) {
    // SAFETY: caller guarantees the allocation
    unsafe {
        object.set_map_word(MapWord::Shape(ShapeId::EXTERNAL_STRING));
        object.set_field(external_string::LENGTH_OFFSET, Value::smi(length as i64));
        object.set_field(external_string::RESOURCE_OFFSET, Value::smi(resource as i64));
    }
}

/// # Safety
/// `object` must point at `array_buffer::SIZE` writable bytes.
pub unsafe fn init_array_buffer(object: HeapObject, byte_length: usize, backing_store: Address) {
    // SAFETY: caller guarantees the allocation
    unsafe {
        object.set_map_word(MapWord::Shape(ShapeId::ARRAY_BUFFER));
        object.set_field(array_buffer::BYTE_LENGTH_OFFSET, Value::smi(byte_length as i64));
        object.set_raw_word(array_buffer::BACKING_STORE_OFFSET, backing_store as u64);
    }
}

/// # Safety
/// `object` must point at `code_size(instructions.len())` writable bytes.
pub unsafe fn init_code(object: HeapObject, instructions: &[u8], constant_pool: Value) {
    // SAFETY: caller guarantees the allocation
    unsafe {
        object.set_map_word(MapWord::Shape(ShapeId::CODE));
        object.set_field(
            code::INSTRUCTION_SIZE_OFFSET,
            Value::smi(instructions.len() as i64),
        );
        object.set_field(code::CONSTANT_POOL_OFFSET, constant_pool);
        let dst = object.byte_ptr(code::INSTRUCTIONS_OFFSET);
        dst.copy_from_nonoverlapping(instructions.as_ptr(), instructions.len());
        let padded = code_size(instructions.len()) - code::INSTRUCTIONS_OFFSET;
        dst.add(instructions.len())
            .write_bytes(0, padded - instructions.len());
    }
}

/// # Safety
/// `object` must point at `cell::SIZE` writable bytes.
pub unsafe fn init_cell(object: HeapObject, value: Value) {
    // SAFETY: caller guarantees the allocation
    unsafe {
        object.set_map_word(MapWord::Shape(ShapeId::CELL));
        object.set_field(cell::VALUE_OFFSET, value);
    }
}
