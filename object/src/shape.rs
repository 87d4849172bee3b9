use std::borrow::Cow;

use bitflags::bitflags;

use crate::{WORD_SIZE, layout};

/// How the collector walks an object's body.
///
/// Every shape carries exactly one kind; visiting dispatches on it with a
/// single `match` (see [`iterate_body`](crate::iterate_body)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VisitorKind {
    OneWordFiller = 0,
    Filler,
    ByteArray,
    FixedArray,
    WeakArray,
    Struct,
    DataObject,
    Map,
    WeakCell,
    EphemeronTable,
    ExternalString,
    ArrayBuffer,
    Code,
    Cell,
}

impl VisitorKind {
    pub const COUNT: usize = Self::Cell as usize + 1;

    /// Whether instances may contain tagged pointer slots.
    #[inline(always)]
    pub const fn has_pointers(self) -> bool {
        !matches!(
            self,
            VisitorKind::OneWordFiller
                | VisitorKind::Filler
                | VisitorKind::ByteArray
                | VisitorKind::DataObject
                | VisitorKind::ExternalString
                | VisitorKind::ArrayBuffer
        )
    }

    #[inline(always)]
    pub const fn is_filler(self) -> bool {
        matches!(self, VisitorKind::OneWordFiller | VisitorKind::Filler)
    }
}

bitflags! {
    /// Per-shape flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ShapeFlags: u8 {
        /// Instances never change after initialization and may be promoted
        /// into read-only space.
        const IMMUTABLE = 1 << 0;
    }
}

impl ShapeFlags {
    pub const NONE: Self = Self::empty();
}

/// Dense index of a shape descriptor; stored in every object's map word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ShapeId(pub u32);

impl ShapeId {
    pub const ONE_WORD_FILLER: Self = Self(0);
    pub const FILLER: Self = Self(1);
    pub const BYTE_ARRAY: Self = Self(2);
    pub const FIXED_ARRAY: Self = Self(3);
    pub const COW_FIXED_ARRAY: Self = Self(4);
    pub const WEAK_ARRAY: Self = Self(5);
    pub const MAP: Self = Self(6);
    pub const WEAK_CELL: Self = Self(7);
    pub const EPHEMERON_TABLE: Self = Self(8);
    pub const EXTERNAL_STRING: Self = Self(9);
    pub const ARRAY_BUFFER: Self = Self(10);
    pub const CODE: Self = Self(11);
    pub const CELL: Self = Self(12);
    pub const BYTE_STRING: Self = Self(13);

    pub const FIRST_USER: Self = Self(14);

    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A shape descriptor: the object layer's answer to "how big is this
/// object and where are its pointers".
#[derive(Debug, Clone)]
pub struct Shape {
    pub name: Cow<'static, str>,
    pub kind: VisitorKind,
    /// `Some(bytes)` for fixed-size shapes, `None` when the size is read
    /// from a length field.
    pub instance_size: Option<usize>,
    pub flags: ShapeFlags,
}

impl Shape {
    #[inline(always)]
    pub fn is_immutable(&self) -> bool {
        self.flags.contains(ShapeFlags::IMMUTABLE)
    }
}

/// The table of all shapes known to a heap, indexed by [`ShapeId`].
///
/// Built-in shapes occupy the ids below [`ShapeId::FIRST_USER`]; the
/// embedder registers its own fixed-size struct and data shapes after.
#[derive(Debug, Clone)]
pub struct ShapeTable {
    shapes: Vec<Shape>,
}

impl ShapeTable {
    pub fn new() -> Self {
        use VisitorKind::*;

        let builtin = |name: &'static str,
                       kind: VisitorKind,
                       instance_size: Option<usize>,
                       flags: ShapeFlags| Shape {
            name: Cow::Borrowed(name),
            kind,
            instance_size,
            flags,
        };

        let shapes = vec![
            builtin("one-word-filler", OneWordFiller, Some(WORD_SIZE), ShapeFlags::NONE),
            builtin("filler", Filler, None, ShapeFlags::NONE),
            builtin("byte-array", ByteArray, None, ShapeFlags::NONE),
            builtin("fixed-array", FixedArray, None, ShapeFlags::NONE),
            builtin("cow-fixed-array", FixedArray, None, ShapeFlags::IMMUTABLE),
            builtin("weak-array", WeakArray, None, ShapeFlags::NONE),
            builtin("map", Map, Some(layout::map::SIZE), ShapeFlags::NONE),
            builtin("weak-cell", WeakCell, Some(layout::weak_cell::SIZE), ShapeFlags::NONE),
            builtin("ephemeron-table", EphemeronTable, None, ShapeFlags::NONE),
            builtin(
                "external-string",
                ExternalString,
                Some(layout::external_string::SIZE),
                ShapeFlags::NONE,
            ),
            builtin(
                "array-buffer",
                ArrayBuffer,
                Some(layout::array_buffer::SIZE),
                ShapeFlags::NONE,
            ),
            builtin("code", Code, None, ShapeFlags::NONE),
            builtin("cell", Cell, Some(layout::cell::SIZE), ShapeFlags::NONE),
            builtin("byte-string", ByteArray, None, ShapeFlags::IMMUTABLE),
        ];
        debug_assert_eq!(shapes.len(), ShapeId::FIRST_USER.index());

        Self { shapes }
    }

    /// Register a fixed-size object whose `fields` words after the map word
    /// are all tagged pointer slots.
    pub fn register_struct(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        fields: usize,
        flags: ShapeFlags,
    ) -> ShapeId {
        self.push(Shape {
            name: name.into(),
            kind: VisitorKind::Struct,
            instance_size: Some(WORD_SIZE * (1 + fields)),
            flags,
        })
    }

    /// Register a fixed-size object whose `words` body words are raw data.
    pub fn register_data(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        words: usize,
        flags: ShapeFlags,
    ) -> ShapeId {
        self.push(Shape {
            name: name.into(),
            kind: VisitorKind::DataObject,
            instance_size: Some(WORD_SIZE * (1 + words)),
            flags,
        })
    }

    fn push(&mut self, shape: Shape) -> ShapeId {
        let id = ShapeId(self.shapes.len() as u32);
        self.shapes.push(shape);
        id
    }

    /// Look up a shape. An unknown id can only come from a corrupt map word.
    #[inline(always)]
    pub fn get(&self, id: ShapeId) -> &Shape {
        match self.shapes.get(id.index()) {
            Some(shape) => shape,
            None => panic!("unknown shape id {}", id.0),
        }
    }

    #[inline(always)]
    pub fn kind(&self, id: ShapeId) -> VisitorKind {
        self.get(id).kind
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

impl Default for ShapeTable {
    fn default() -> Self {
        Self::new()
    }
}
