use crate::HeapObject;

/// Tag constants.
const SMI_MASK: u64 = 0b1;
const TAG_MASK: u64 = 0b11;
const HEAP_OBJECT_TAG: u64 = 0b01;

const SMI_MIN: i64 = -(1i64 << 62);
const SMI_MAX: i64 = (1i64 << 62) - 1;

/// A tagged 64-bit word, the content of every pointer slot.
///
/// Encoding:
/// - **Smi**:        `...XXXXX0`: 63-bit signed integer (low bit 0).
/// - **HeapObject**: `...XXXX01`: object start address (8-byte aligned).
///
/// Map words reuse `0b11` and `0b10` in the header word, which is never
/// read as a `Value`. The collector only looks at
/// heap-object values; Smis are transparent to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// Smi zero. Also the value weak slots are cleared to.
    pub const ZERO: Self = Self(0);

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    // ── Smi ────────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_smi(self) -> bool {
        self.0 & SMI_MASK == 0
    }

    #[inline(always)]
    pub fn smi(n: i64) -> Self {
        debug_assert!((SMI_MIN..=SMI_MAX).contains(&n), "smi overflow: {n}");
        Self((n << 1) as u64)
    }

    #[inline(always)]
    pub const fn fits_smi(n: i64) -> bool {
        n >= SMI_MIN && n <= SMI_MAX
    }

    #[inline(always)]
    pub const fn to_smi(self) -> Option<i64> {
        if self.is_smi() {
            Some((self.0 as i64) >> 1)
        } else {
            None
        }
    }

    /// Untag a Smi that is known to be a non-negative length or count.
    #[inline(always)]
    pub fn smi_usize(self) -> usize {
        debug_assert!(self.is_smi(), "expected smi, found {self:?}");
        let n = (self.0 as i64) >> 1;
        debug_assert!(n >= 0, "negative smi used as length: {n}");
        n as usize
    }

    // ── HeapObject ─────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_object(self) -> bool {
        self.0 & TAG_MASK == HEAP_OBJECT_TAG
    }

    #[inline(always)]
    pub fn from_object(object: HeapObject) -> Self {
        let addr = object.address() as u64;
        debug_assert!(addr & TAG_MASK == 0, "object not aligned");
        Self(addr | HEAP_OBJECT_TAG)
    }

    #[inline(always)]
    pub fn as_object(self) -> Option<HeapObject> {
        if self.is_object() {
            Some(HeapObject::from_address((self.0 & !TAG_MASK) as usize))
        } else {
            None
        }
    }
}

impl From<HeapObject> for Value {
    #[inline(always)]
    fn from(object: HeapObject) -> Self {
        Self::from_object(object)
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(n) = self.to_smi() {
            write!(f, "Smi({n})")
        } else if let Some(object) = self.as_object() {
            write!(f, "Object(0x{:x})", object.address())
        } else {
            write!(f, "Invalid(0x{:016x})", self.0)
        }
    }
}
