use crate::{MapWord, ShapeId, Value};

/// A raw machine address inside one of the heap's reservations.
pub type Address = usize;

pub const WORD_SIZE: usize = 8;
pub const OBJECT_ALIGNMENT: usize = WORD_SIZE;

/// Round `size` up to the object alignment.
#[inline(always)]
pub const fn align_object_size(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// An untagged reference to the start of a heap object.
///
/// The first word of every object is its [`MapWord`]. Everything else is
/// laid out according to the object's [`Shape`](crate::Shape).
///
/// All memory accessors are `unsafe`: the caller guarantees the object
/// lies in committed heap memory and `offset` stays inside its body.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HeapObject(Address);

impl HeapObject {
    #[inline(always)]
    pub fn from_address(address: Address) -> Self {
        debug_assert!(
            address % OBJECT_ALIGNMENT == 0,
            "misaligned object 0x{address:x}"
        );
        Self(address)
    }

    #[inline(always)]
    pub const fn address(self) -> Address {
        self.0
    }

    #[inline(always)]
    pub const fn slot(self, offset: usize) -> Slot {
        Slot(self.0 + offset)
    }

    /// # Safety
    /// The object must be readable.
    #[inline(always)]
    pub unsafe fn map_word(self) -> MapWord {
        // SAFETY: forwarded by contract
        MapWord::decode(unsafe { self.raw_word(0) })
    }

    /// # Safety
    /// The object must be writable.
    #[inline(always)]
    pub unsafe fn set_map_word(self, word: MapWord) {
        // SAFETY: forwarded by contract
        unsafe { self.set_raw_word(0, word.encode()) }
    }

    /// The object's shape. Panics if the object has been forwarded.
    ///
    /// # Safety
    /// The object must be readable.
    #[inline(always)]
    pub unsafe fn shape(self) -> ShapeId {
        // SAFETY: forwarded by contract
        match unsafe { self.map_word() } {
            MapWord::Shape(id) => id,
            MapWord::Forwarded(target) => panic!(
                "object 0x{:x} is forwarded to 0x{:x}",
                self.0,
                target.address()
            ),
        }
    }

    /// # Safety
    /// `offset` must address a tagged field of a readable object.
    #[inline(always)]
    pub unsafe fn field(self, offset: usize) -> Value {
        // SAFETY: forwarded by contract
        unsafe { self.slot(offset).load() }
    }

    /// Plain store without any write barrier.
    ///
    /// # Safety
    /// `offset` must address a tagged field of a writable object.
    #[inline(always)]
    pub unsafe fn set_field(self, offset: usize, value: Value) {
        // SAFETY: forwarded by contract
        unsafe { self.slot(offset).store(value) }
    }

    /// # Safety
    /// `offset` must be word aligned and inside a readable object.
    #[inline(always)]
    pub unsafe fn raw_word(self, offset: usize) -> u64 {
        // SAFETY: forwarded by contract
        unsafe { ((self.0 + offset) as *const u64).read() }
    }

    /// # Safety
    /// `offset` must be word aligned and inside a writable object.
    #[inline(always)]
    pub unsafe fn set_raw_word(self, offset: usize, word: u64) {
        // SAFETY: forwarded by contract
        unsafe { ((self.0 + offset) as *mut u64).write(word) }
    }

    #[inline(always)]
    pub fn byte_ptr(self, offset: usize) -> *mut u8 {
        (self.0 + offset) as *mut u8
    }
}

impl core::fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "HeapObject(0x{:x})", self.0)
    }
}

/// The address of one tagged word inside an object (or a root cell).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Slot(Address);

impl Slot {
    #[inline(always)]
    pub const fn new(address: Address) -> Self {
        Self(address)
    }

    #[inline(always)]
    pub const fn address(self) -> Address {
        self.0
    }

    #[inline(always)]
    pub const fn next(self) -> Self {
        Self(self.0 + WORD_SIZE)
    }

    /// # Safety
    /// The slot must be readable.
    #[inline(always)]
    pub unsafe fn load(self) -> Value {
        // SAFETY: forwarded by contract
        Value::from_raw(unsafe { (self.0 as *const u64).read() })
    }

    /// # Safety
    /// The slot must be writable.
    #[inline(always)]
    pub unsafe fn store(self, value: Value) {
        // SAFETY: forwarded by contract
        unsafe { (self.0 as *mut u64).write(value.raw()) }
    }

    /// Iterate the slots in `[start, end)`.
    #[inline]
    pub fn range(start: Slot, end: Slot) -> impl Iterator<Item = Slot> {
        (start.0..end.0).step_by(WORD_SIZE).map(Slot)
    }
}

impl core::fmt::Debug for Slot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Slot(0x{:x})", self.0)
    }
}
