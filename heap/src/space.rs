use std::collections::{HashMap, HashSet};

use object::{Address, HeapObject, ShapeTable, object_size};

pub(crate) type AddressMap<V> = HashMap<Address, V, ahash::RandomState>;
pub(crate) type AddressSet = HashSet<Address, ahash::RandomState>;

/// The spaces an allocation can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AllocationSpace {
    New,
    OldPointer,
    OldData,
    Code,
    Map,
    Cell,
    Lo,
    ReadOnly,
}

impl AllocationSpace {
    pub const ALL: [AllocationSpace; 8] = [
        AllocationSpace::New,
        AllocationSpace::OldPointer,
        AllocationSpace::OldData,
        AllocationSpace::Code,
        AllocationSpace::Map,
        AllocationSpace::Cell,
        AllocationSpace::Lo,
        AllocationSpace::ReadOnly,
    ];

    /// Index into the heap's paged space array, if this is a paged space.
    #[inline(always)]
    pub const fn paged_index(self) -> Option<usize> {
        match self {
            AllocationSpace::OldPointer => Some(0),
            AllocationSpace::OldData => Some(1),
            AllocationSpace::Code => Some(2),
            AllocationSpace::Map => Some(3),
            AllocationSpace::Cell => Some(4),
            AllocationSpace::ReadOnly => Some(5),
            AllocationSpace::New | AllocationSpace::Lo => None,
        }
    }

    pub const PAGED: [AllocationSpace; PAGED_SPACE_COUNT] = [
        AllocationSpace::OldPointer,
        AllocationSpace::OldData,
        AllocationSpace::Code,
        AllocationSpace::Map,
        AllocationSpace::Cell,
        AllocationSpace::ReadOnly,
    ];

    #[inline(always)]
    pub const fn is_old(self) -> bool {
        !matches!(self, AllocationSpace::New)
    }

    /// Spaces whose objects may hold pointers and therefore need dirty
    /// region tracking.
    #[inline(always)]
    pub const fn has_pointers(self) -> bool {
        !matches!(self, AllocationSpace::OldData | AllocationSpace::New)
    }

    #[inline(always)]
    pub const fn executability(self) -> Executability {
        match self {
            AllocationSpace::Code => Executability::Executable,
            _ => Executability::NotExecutable,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AllocationSpace::New => "new",
            AllocationSpace::OldPointer => "old_pointer",
            AllocationSpace::OldData => "old_data",
            AllocationSpace::Code => "code",
            AllocationSpace::Map => "map",
            AllocationSpace::Cell => "cell",
            AllocationSpace::Lo => "lo",
            AllocationSpace::ReadOnly => "read_only",
        }
    }
}

pub const PAGED_SPACE_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executability {
    NotExecutable,
    Executable,
}

/// Walk the objects laid out back to back in `[start, end)`.
///
/// The callback receives each object and its size. Fillers are included.
///
/// # Safety
/// The range must be iterable: every byte covered by a valid object or
/// filler, with no forwarded map words.
pub(crate) unsafe fn for_each_object(
    shapes: &ShapeTable,
    start: Address,
    end: Address,
    mut f: impl FnMut(HeapObject, usize),
) {
    let mut cursor = start;
    while cursor < end {
        let object = HeapObject::from_address(cursor);
        // SAFETY: forwarded by contract
        let size = unsafe { object_size(shapes, object) };
        debug_assert!(size > 0 && cursor + size <= end, "object overruns its range");
        f(object, size);
        cursor += size;
    }
}
