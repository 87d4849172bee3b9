use crate::{HeapObject, ShapeId};

const TAG_MASK: u64 = 0b11;
const SHAPE_TAG: u64 = 0b11;
const FORWARDING_TAG: u64 = 0b10;
const SHAPE_SHIFT: u32 = 2;

/// The first word of every heap object.
///
/// Outside a collection it always names the object's shape. While a
/// scavenge, an evacuation or read-only promotion is moving objects, the
/// old copy's map word is replaced by a forwarding reference to the new
/// location; every phase that installs forwarding words removes them
/// (by fixup or by turning the old copy into a filler) before it ends.
///
/// ```text
/// Shape:     [shape id:62] [0b11]
/// Forwarded: [address :62] [0b10]
/// ```
///
/// Both tags differ from [`Value`](crate::Value)'s Smi (`..0`) and object
/// (`01`) tags, so a map word is never mistaken for a slot value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapWord {
    Shape(ShapeId),
    Forwarded(HeapObject),
}

impl MapWord {
    #[inline(always)]
    pub fn encode(self) -> u64 {
        match self {
            MapWord::Shape(id) => ((id.0 as u64) << SHAPE_SHIFT) | SHAPE_TAG,
            MapWord::Forwarded(target) => {
                let addr = target.address() as u64;
                debug_assert!(addr & TAG_MASK == 0);
                addr | FORWARDING_TAG
            }
        }
    }

    /// Decode a raw header word. A word with a Smi or object tag means the
    /// address does not hold an object start, which is a heap corruption.
    #[inline(always)]
    pub fn decode(raw: u64) -> Self {
        match raw & TAG_MASK {
            SHAPE_TAG => MapWord::Shape(ShapeId((raw >> SHAPE_SHIFT) as u32)),
            FORWARDING_TAG => MapWord::Forwarded(HeapObject::from_address(
                (raw & !TAG_MASK) as usize,
            )),
            _ => panic!("corrupt map word 0x{raw:016x}"),
        }
    }

    #[inline(always)]
    pub fn is_forwarded(raw: u64) -> bool {
        raw & TAG_MASK == FORWARDING_TAG
    }

    #[inline(always)]
    pub fn is_shape(raw: u64) -> bool {
        raw & TAG_MASK == SHAPE_TAG
    }

    #[inline(always)]
    pub fn forwarding_target(self) -> Option<HeapObject> {
        match self {
            MapWord::Forwarded(target) => Some(target),
            MapWord::Shape(_) => None,
        }
    }
}
