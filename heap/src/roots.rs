//! Root table, global handles and embedder root providers.

use object::Value;

/// Consumers implement this to provide GC roots.
///
/// Called at the start of every collection (and at the end of incremental
/// marking). The visitor receives `&mut Value` so the collector can update
/// root pointers in place when objects move.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// Which roots an iteration covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitMode {
    All,
    StrongOnly,
    WeakOnly,
}

// ── Root table ────────────────────────────────────────────────────────

/// Index of a permanent root in the single contiguous root array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RootIndex {
    EmptyFixedArray,
    EmptyByteArray,
    EmptyWeakArray,
    EmptyString,
    EmptyDescriptorArray,
    /// Cleared at the start of every mark-compact.
    NumberStringCache,
    /// Weak array of interned strings; dead entries are cleared.
    SymbolTable,
    /// Free slots for the embedder.
    Embedder0,
    Embedder1,
    Embedder2,
    Embedder3,
}

impl RootIndex {
    pub const COUNT: usize = RootIndex::Embedder3 as usize + 1;

    pub const ALL: [RootIndex; RootIndex::COUNT] = [
        RootIndex::EmptyFixedArray,
        RootIndex::EmptyByteArray,
        RootIndex::EmptyWeakArray,
        RootIndex::EmptyString,
        RootIndex::EmptyDescriptorArray,
        RootIndex::NumberStringCache,
        RootIndex::SymbolTable,
        RootIndex::Embedder0,
        RootIndex::Embedder1,
        RootIndex::Embedder2,
        RootIndex::Embedder3,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            RootIndex::EmptyFixedArray => "empty_fixed_array",
            RootIndex::EmptyByteArray => "empty_byte_array",
            RootIndex::EmptyWeakArray => "empty_weak_array",
            RootIndex::EmptyString => "empty_string",
            RootIndex::EmptyDescriptorArray => "empty_descriptor_array",
            RootIndex::NumberStringCache => "number_string_cache",
            RootIndex::SymbolTable => "symbol_table",
            RootIndex::Embedder0 => "embedder_0",
            RootIndex::Embedder1 => "embedder_1",
            RootIndex::Embedder2 => "embedder_2",
            RootIndex::Embedder3 => "embedder_3",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "empty_fixed_array" => RootIndex::EmptyFixedArray,
            "empty_byte_array" => RootIndex::EmptyByteArray,
            "empty_weak_array" => RootIndex::EmptyWeakArray,
            "empty_string" => RootIndex::EmptyString,
            "empty_descriptor_array" => RootIndex::EmptyDescriptorArray,
            "number_string_cache" => RootIndex::NumberStringCache,
            "symbol_table" => RootIndex::SymbolTable,
            "embedder_0" => RootIndex::Embedder0,
            "embedder_1" => RootIndex::Embedder1,
            "embedder_2" => RootIndex::Embedder2,
            "embedder_3" => RootIndex::Embedder3,
            _ => return None,
        })
    }

    /// Byte offset of this root from the start of the table.
    #[inline(always)]
    pub const fn offset(self) -> usize {
        self as usize * object::WORD_SIZE
    }
}

/// The permanent roots, one contiguous array.
#[derive(Debug, Clone)]
#[repr(transparent)]
pub struct RootsTable([Value; RootIndex::COUNT]);

impl RootsTable {
    pub fn new() -> Self {
        Self([Value::ZERO; RootIndex::COUNT])
    }

    #[inline(always)]
    pub fn get(&self, index: RootIndex) -> Value {
        self.0[index as usize]
    }

    #[inline(always)]
    pub fn set(&mut self, index: RootIndex, value: Value) {
        self.0[index as usize] = value;
    }

    pub fn iterate(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for value in &mut self.0 {
            visitor(value);
        }
    }

    /// Address of the first root, for base+offset access from generated
    /// code.
    pub fn as_ptr(&self) -> *const Value {
        self.0.as_ptr()
    }
}

impl Default for RootsTable {
    fn default() -> Self {
        Self::new()
    }
}

// ── Global handles ────────────────────────────────────────────────────

/// An embedder-held reference into the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

#[derive(Debug, Clone, Copy)]
struct HandleEntry {
    value: Value,
    weak: bool,
}

/// Strong handles are roots. Weak handles are cleared to Smi zero when
/// their target dies.
#[derive(Debug, Default)]
pub struct GlobalHandles {
    entries: Vec<Option<HandleEntry>>,
    free: Vec<u32>,
}

impl GlobalHandles {
    pub fn create(&mut self, value: Value, weak: bool) -> Handle {
        let entry = Some(HandleEntry { value, weak });
        match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = entry;
                Handle(index)
            }
            None => {
                self.entries.push(entry);
                Handle((self.entries.len() - 1) as u32)
            }
        }
    }

    fn entry(&self, handle: Handle) -> &HandleEntry {
        match self.entries.get(handle.0 as usize) {
            Some(Some(entry)) => entry,
            _ => panic!("use of destroyed handle {}", handle.0),
        }
    }

    pub fn get(&self, handle: Handle) -> Value {
        self.entry(handle).value
    }

    pub fn set(&mut self, handle: Handle, value: Value) {
        match self.entries.get_mut(handle.0 as usize) {
            Some(Some(entry)) => entry.value = value,
            _ => panic!("use of destroyed handle {}", handle.0),
        }
    }

    pub fn is_weak(&self, handle: Handle) -> bool {
        self.entry(handle).weak
    }

    pub fn destroy(&mut self, handle: Handle) {
        if let Some(slot) = self.entries.get_mut(handle.0 as usize) {
            if slot.take().is_some() {
                self.free.push(handle.0);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iterate_strong(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for entry in self.entries.iter_mut().flatten() {
            if !entry.weak {
                visitor(&mut entry.value);
            }
        }
    }

    pub fn iterate_weak(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for entry in self.entries.iter_mut().flatten() {
            if entry.weak {
                visitor(&mut entry.value);
            }
        }
    }
}

// ── Root set ──────────────────────────────────────────────────────────

/// Everything the collectors treat as a root. Collections detach this from
/// the heap while they visit it.
#[derive(Default)]
pub struct Roots {
    pub table: RootsTable,
    pub handles: GlobalHandles,
    pub providers: Vec<Box<dyn RootProvider>>,
    /// Values the heap itself holds across an allocation.
    pub(crate) scratch: Vec<Value>,
}

impl Roots {
    pub fn iterate(&mut self, visitor: &mut dyn FnMut(&mut Value), mode: VisitMode) {
        if mode != VisitMode::WeakOnly {
            self.table.iterate(visitor);
            self.handles.iterate_strong(visitor);
            for provider in &mut self.providers {
                provider.visit_roots(visitor);
            }
            for value in &mut self.scratch {
                visitor(value);
            }
        }
        if mode != VisitMode::StrongOnly {
            self.handles.iterate_weak(visitor);
        }
    }
}

impl core::fmt::Debug for Roots {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Roots")
            .field("handles", &self.handles.len())
            .field("providers", &self.providers.len())
            .finish()
    }
}
