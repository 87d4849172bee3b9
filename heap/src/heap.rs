//! The heap façade.
//!
//! A [`Heap`] owns every space, the root set and the off-heap bookkeeping,
//! and decides which collector runs when an allocation fails. Nothing here
//! is global: two heaps in one process share only the code-range address
//! hint they were handed.
//!
//! Objects move. A [`HeapObject`] held in a Rust local is only valid until
//! the next allocation; keep references across allocations in a handle, the
//! root table or a [`RootProvider`].

use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use object::{
    Address, HeapObject, MapWord, ShapeFlags, ShapeId, ShapeTable, Slot, Value, VisitorKind,
    WORD_SIZE, layout,
};

use crate::incremental_marking::IncrementalMarking;
use crate::marking::MarkingState;
use crate::tracer::{GcEvent, GcTracer};
use crate::{
    AllocationContext, AllocationResult, AllocationSpace, ArrayBufferTracker, BackingStore,
    ChunkFlags, CodeRangeAddressHint, Executability, ExternalStringResource, ExternalStringTable,
    GlobalHandles, Handle, HeapError, HeapSettings, HeapStats, LargeObjectSpace, MemoryAllocator,
    NewSpace, PAGED_SPACE_COUNT, PagedSpace, RootIndex, RootProvider, Roots, SharedAddressHint,
    SpaceStats, VisitMode, fatal_out_of_memory,
};

const NUMBER_STRING_CACHE_SIZE: usize = 64;
const SYMBOL_TABLE_SIZE: usize = 64;
/// Upper bound on back-to-back full collections in a low-memory request.
const MAX_LOW_MEMORY_ROUNDS: usize = 7;

// ── Collector selection ───────────────────────────────────────────────

/// What the heap is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapState {
    NotInGc,
    Scavenge,
    MarkCompact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GarbageCollector {
    Scavenger,
    MarkCompactor,
}

bitflags! {
    /// Which collections a callback wants to hear about.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct GcTypeFlags: u8 {
        const SCAVENGE = 1 << 0;
        const MARK_COMPACT = 1 << 1;
        const ALL = Self::SCAVENGE.bits() | Self::MARK_COMPACT.bits();
    }
}

impl GarbageCollector {
    pub fn type_flag(self) -> GcTypeFlags {
        match self {
            GarbageCollector::Scavenger => GcTypeFlags::SCAVENGE,
            GarbageCollector::MarkCompactor => GcTypeFlags::MARK_COMPACT,
        }
    }
}

/// Whether a typed allocation starts in new space or goes straight to the
/// old generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pretenure {
    #[default]
    NotTenured,
    Tenured,
}

pub type GcCallback = Box<dyn FnMut(GarbageCollector)>;
pub type GlobalGcCallback = Box<dyn FnMut()>;
/// Called with the old and new location of every object a collection
/// moves.
pub type MoveListener = Box<dyn FnMut(HeapObject, HeapObject)>;

#[derive(Default)]
struct GcCallbacks {
    prologue: Vec<(GcTypeFlags, GcCallback)>,
    epilogue: Vec<(GcTypeFlags, GcCallback)>,
    global_prologue: Option<GlobalGcCallback>,
    global_epilogue: Option<GlobalGcCallback>,
}

impl GcCallbacks {
    fn run_prologue(&mut self, collector: GarbageCollector) {
        for (filter, callback) in &mut self.prologue {
            if filter.contains(collector.type_flag()) {
                callback(collector);
            }
        }
        if collector == GarbageCollector::MarkCompactor {
            if let Some(callback) = &mut self.global_prologue {
                callback();
            }
        }
    }

    fn run_epilogue(&mut self, collector: GarbageCollector) {
        if collector == GarbageCollector::MarkCompactor {
            if let Some(callback) = &mut self.global_epilogue {
                callback();
            }
        }
        for (filter, callback) in &mut self.epilogue {
            if filter.contains(collector.type_flag()) {
                callback(collector);
            }
        }
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

pub struct Heap {
    pub(crate) settings: HeapSettings,
    address_hint: SharedAddressHint,
    pub(crate) shapes: Arc<ShapeTable>,
    pub(crate) allocator: MemoryAllocator,
    pub(crate) new_space: NewSpace,
    pub(crate) paged_spaces: [PagedSpace; PAGED_SPACE_COUNT],
    pub(crate) lo_space: LargeObjectSpace,
    pub(crate) roots: Roots,
    pub(crate) array_buffers: ArrayBufferTracker,
    pub(crate) external_strings: ExternalStringTable,
    pub(crate) marking: MarkingState,
    pub(crate) incremental: IncrementalMarking,
    pub(crate) move_listeners: Vec<MoveListener>,
    callbacks: GcCallbacks,
    pub(crate) tracer: GcTracer,
    pub(crate) state: HeapState,
    set_up: bool,
    old_gen_promotion_limit: usize,
    old_gen_allocation_limit: usize,
    /// An old-generation allocation failed since the last mark-compact.
    old_gen_exhausted: bool,
    old_gen_size_at_last_mc: usize,
    external_memory: usize,
    external_memory_at_last_mc: usize,
    pub(crate) survived_since_last_expansion: usize,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        Self::with_address_hint(settings, CodeRangeAddressHint::shared())
    }

    /// A heap that shares its code-range address hint with other heaps.
    pub fn with_address_hint(settings: HeapSettings, address_hint: SharedAddressHint) -> Self {
        let allocator = MemoryAllocator::new(&settings, address_hint.clone());
        let paged_spaces = AllocationSpace::PAGED.map(|id| PagedSpace::new(id, &settings));
        let marking = MarkingState::new(settings.marking_deque_capacity);
        Self {
            old_gen_promotion_limit: settings.min_promotion_limit,
            old_gen_allocation_limit: settings.min_allocation_limit,
            settings,
            address_hint,
            shapes: Arc::new(ShapeTable::new()),
            allocator,
            new_space: NewSpace::new(),
            paged_spaces,
            lo_space: LargeObjectSpace::new(),
            roots: Roots::default(),
            array_buffers: ArrayBufferTracker::new(),
            external_strings: ExternalStringTable::new(),
            marking,
            incremental: IncrementalMarking::default(),
            move_listeners: Vec::new(),
            callbacks: GcCallbacks::default(),
            tracer: GcTracer::default(),
            state: HeapState::NotInGc,
            set_up: false,
            old_gen_exhausted: false,
            old_gen_size_at_last_mc: 0,
            external_memory: 0,
            external_memory_at_last_mc: 0,
            survived_since_last_expansion: 0,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Install new settings. Only possible before [`Heap::setup`].
    pub fn configure(&mut self, settings: HeapSettings) -> Result<(), HeapError> {
        if self.set_up {
            return Err(HeapError::AlreadySetUp);
        }
        settings.validate().map_err(HeapError::InvalidSettings)?;
        self.allocator = MemoryAllocator::new(&settings, self.address_hint.clone());
        self.paged_spaces = AllocationSpace::PAGED.map(|id| PagedSpace::new(id, &settings));
        self.marking = MarkingState::new(settings.marking_deque_capacity);
        self.old_gen_promotion_limit = settings.min_promotion_limit;
        self.old_gen_allocation_limit = settings.min_allocation_limit;
        self.settings = settings;
        Ok(())
    }

    /// Adjust the semispace and old-generation maxima. Zero keeps the
    /// current value.
    pub fn configure_heap(
        &mut self,
        max_semispace_size: usize,
        max_old_generation_size: usize,
    ) -> Result<(), HeapError> {
        let mut settings = self.settings.clone();
        if max_semispace_size > 0 {
            settings.max_semispace_size = max_semispace_size.next_power_of_two();
            settings.initial_semispace_size = settings
                .initial_semispace_size
                .min(settings.max_semispace_size);
        }
        if max_old_generation_size > 0 {
            settings.max_old_generation_size = max_old_generation_size;
        }
        self.configure(settings)
    }

    /// Reserve new space and, if asked, allocate the permanent roots.
    pub fn setup(&mut self, create_heap_objects: bool) -> Result<(), HeapError> {
        if self.set_up {
            return Err(HeapError::AlreadySetUp);
        }
        self.settings.validate().map_err(HeapError::InvalidSettings)?;
        self.new_space.setup(
            self.settings.initial_semispace_size,
            self.settings.max_semispace_size,
        )?;
        self.old_gen_promotion_limit = self.settings.min_promotion_limit;
        self.old_gen_allocation_limit = self.settings.min_allocation_limit;
        self.set_up = true;
        log::info!(
            "heap set up: {} byte pages, {} byte semispaces, {} byte old generation",
            self.settings.page_size,
            self.settings.initial_semispace_size,
            self.settings.max_old_generation_size
        );
        if create_heap_objects {
            self.create_initial_objects();
        }
        Ok(())
    }

    pub fn has_been_setup(&self) -> bool {
        self.set_up
    }

    /// Release every page, backing store and external resource.
    pub fn tear_down(&mut self) {
        if !self.set_up {
            return;
        }
        debug_assert_eq!(self.state, HeapState::NotInGc, "tear down during a collection");
        if self.incremental.is_active() {
            self.abort_incremental_marking();
        }
        self.external_strings.tear_down();
        self.array_buffers.tear_down();
        self.roots = Roots::default();
        self.new_space.tear_down();
        for space in &mut self.paged_spaces {
            space.tear_down(&mut self.allocator);
        }
        self.lo_space.tear_down(&mut self.allocator);
        self.allocator.tear_down();
        self.external_memory = 0;
        self.set_up = false;
        log::info!("heap torn down");
    }

    fn create_initial_objects(&mut self) {
        let ctx = AllocationContext::mutator();
        let tenured = Pretenure::Tenured;
        let empty_fixed_array = self.allocate_fixed_array(ctx, 0, Value::ZERO, tenured);
        self.set_root(RootIndex::EmptyFixedArray, empty_fixed_array.into());
        let empty_byte_array = self.allocate_byte_array(ctx, 0, tenured);
        self.set_root(RootIndex::EmptyByteArray, empty_byte_array.into());
        let empty_weak_array = self.allocate_weak_array(ctx, 0, tenured);
        self.set_root(RootIndex::EmptyWeakArray, empty_weak_array.into());
        let empty_string = self.allocate_byte_string(ctx, b"", tenured);
        self.set_root(RootIndex::EmptyString, empty_string.into());
        let empty_descriptors = self.allocate_fixed_array(ctx, 0, Value::ZERO, tenured);
        self.set_root(RootIndex::EmptyDescriptorArray, empty_descriptors.into());
        let cache = self.allocate_fixed_array(ctx, NUMBER_STRING_CACHE_SIZE, Value::ZERO, tenured);
        self.set_root(RootIndex::NumberStringCache, cache.into());
        let symbols = self.allocate_weak_array(ctx, SYMBOL_TABLE_SIZE, tenured);
        self.set_root(RootIndex::SymbolTable, symbols.into());
    }

    // ── Accessors ─────────────────────────────────────────────────────

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn shapes(&self) -> &ShapeTable {
        &self.shapes
    }

    /// Register an embedder struct shape with `fields` pointer slots.
    pub fn register_struct_shape(
        &mut self,
        name: &'static str,
        fields: usize,
        flags: ShapeFlags,
    ) -> ShapeId {
        Arc::make_mut(&mut self.shapes).register_struct(name, fields, flags)
    }

    /// Register an embedder shape with `words` raw data words.
    pub fn register_data_shape(
        &mut self,
        name: &'static str,
        words: usize,
        flags: ShapeFlags,
    ) -> ShapeId {
        Arc::make_mut(&mut self.shapes).register_data(name, words, flags)
    }

    pub fn state(&self) -> HeapState {
        self.state
    }

    pub fn new_space(&self) -> &NewSpace {
        &self.new_space
    }

    /// # Panics
    /// If `space` is not a paged space.
    pub fn paged_space(&self, space: AllocationSpace) -> &PagedSpace {
        match space.paged_index() {
            Some(index) => &self.paged_spaces[index],
            None => panic!("{} is not a paged space", space.name()),
        }
    }

    pub fn lo_space(&self) -> &LargeObjectSpace {
        &self.lo_space
    }

    pub fn memory_allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    pub fn array_buffer_tracker(&self) -> &ArrayBufferTracker {
        &self.array_buffers
    }

    pub fn external_string_table(&self) -> &ExternalStringTable {
        &self.external_strings
    }

    /// Whether `address` lies in memory this heap manages.
    pub fn contains(&self, address: Address) -> bool {
        self.new_space.contains(address) || self.allocator.chunk_for_address(address).is_some()
    }

    #[inline(always)]
    pub fn in_new_space(&self, object: HeapObject) -> bool {
        self.new_space.contains(object.address())
    }

    /// The space currently holding `object`.
    pub fn space_of(&self, object: HeapObject) -> Option<AllocationSpace> {
        if self.new_space.contains(object.address()) {
            return Some(AllocationSpace::New);
        }
        self.allocator
            .chunk_for_address(object.address())
            .map(|chunk| chunk.owner())
    }

    pub fn is_read_only(&self, object: HeapObject) -> bool {
        self.allocator
            .chunk_for_address(object.address())
            .is_some_and(|chunk| chunk.has_flag(ChunkFlags::READ_ONLY))
    }

    // ── Raw allocation ────────────────────────────────────────────────

    /// Allocate `size` bytes in `space`. New-space requests fall back to
    /// `retry_space` only under an always-allocate context.
    ///
    /// The memory is uninitialized; the caller must write a complete
    /// object before the next allocation.
    pub fn allocate_raw(
        &mut self,
        ctx: AllocationContext,
        size: usize,
        space: AllocationSpace,
        retry_space: AllocationSpace,
    ) -> AllocationResult {
        self.allocate_raw_in(ctx, size, space, retry_space, space.executability())
    }

    fn allocate_raw_in(
        &mut self,
        ctx: AllocationContext,
        size: usize,
        mut space: AllocationSpace,
        retry_space: AllocationSpace,
        executable: Executability,
    ) -> AllocationResult {
        debug_assert!(ctx.allows_allocation(), "allocation with a forbidden context");
        debug_assert!(
            self.state == HeapState::NotInGc || ctx.is_always_allocate(),
            "mutator allocation during a collection"
        );
        debug_assert!(self.set_up, "allocation before setup");
        debug_assert!(size.is_multiple_of(WORD_SIZE) && size > 0, "bad allocation size {size}");
        if space == AllocationSpace::New {
            let result = self.new_space.allocate_raw(size);
            if !result.is_retry() || !ctx.is_always_allocate() {
                return result;
            }
            space = retry_space;
        }
        let can_expand = ctx.is_always_allocate() || !self.old_generation_allocation_limit_reached();
        let result = match space.paged_index() {
            Some(index) => self.paged_spaces[index].allocate_raw(&mut self.allocator, size, can_expand),
            None if can_expand => self.lo_space.allocate_raw(&mut self.allocator, size, executable),
            None => AllocationResult::Retry {
                size,
                space: AllocationSpace::Lo,
            },
        };
        if result.is_retry() {
            self.old_gen_exhausted = true;
        }
        result
    }

    /// Allocate, collecting garbage on failure. Twice the selected
    /// collector, then a low-memory collection, then one last try that may
    /// grow past every limit. Failure after that is fatal.
    fn allocate_with_retry(
        &mut self,
        ctx: AllocationContext,
        size: usize,
        space: AllocationSpace,
        retry_space: AllocationSpace,
        executable: Executability,
    ) -> HeapObject {
        for attempt in 0..3 {
            match self.allocate_raw_in(ctx, size, space, retry_space, executable) {
                AllocationResult::Ok(object) => return object,
                AllocationResult::Retry { space: failed, .. } if attempt < 2 => {
                    self.collect_garbage(size, failed);
                }
                AllocationResult::Retry { .. } => self.collect_all_available_garbage(),
            }
        }
        let last = AllocationContext::always_allocate();
        match self.allocate_raw_in(last, size, space, retry_space, executable) {
            AllocationResult::Ok(object) => object,
            AllocationResult::Retry { space, .. } => {
                fatal_out_of_memory(&format!("allocating {size} bytes in {}", space.name()))
            }
        }
    }

    /// Allocate while `values` are kept alive and updated across any
    /// collection the allocation triggers.
    fn allocate_protecting(
        &mut self,
        ctx: AllocationContext,
        values: &mut [Value],
        size: usize,
        spaces: (AllocationSpace, AllocationSpace),
        executable: Executability,
    ) -> HeapObject {
        let base = self.roots.scratch.len();
        self.roots.scratch.extend_from_slice(values);
        let object = self.allocate_with_retry(ctx, size, spaces.0, spaces.1, executable);
        values.copy_from_slice(&self.roots.scratch[base..]);
        self.roots.scratch.truncate(base);
        object
    }

    fn select_spaces(
        &self,
        size: usize,
        pretenure: Pretenure,
        old_space: AllocationSpace,
    ) -> (AllocationSpace, AllocationSpace) {
        if size > self.settings.max_regular_object_size() {
            (AllocationSpace::Lo, AllocationSpace::Lo)
        } else if pretenure == Pretenure::Tenured {
            (old_space, old_space)
        } else {
            (AllocationSpace::New, old_space)
        }
    }

    fn allocate_plain(
        &mut self,
        ctx: AllocationContext,
        size: usize,
        pretenure: Pretenure,
        old_space: AllocationSpace,
    ) -> HeapObject {
        let (space, retry) = self.select_spaces(size, pretenure, old_space);
        self.allocate_with_retry(ctx, size, space, retry, Executability::NotExecutable)
    }

    // ── Typed allocation ──────────────────────────────────────────────

    pub fn allocate_fixed_array(
        &mut self,
        ctx: AllocationContext,
        length: usize,
        fill: Value,
        pretenure: Pretenure,
    ) -> HeapObject {
        let size = layout::fixed_array_size(length);
        let spaces = self.select_spaces(size, pretenure, AllocationSpace::OldPointer);
        let mut values = [fill];
        let object =
            self.allocate_protecting(ctx, &mut values, size, spaces, Executability::NotExecutable);
        // SAFETY: freshly allocated with the right size
        unsafe {
            layout::init_fixed_array(object, ShapeId::FIXED_ARRAY, length, values[0]);
            self.record_writes(object, layout::fixed_array::ELEMENTS_OFFSET, length);
        }
        object
    }

    /// A copy-on-write array: immutable once built, eligible for read-only
    /// promotion.
    pub fn allocate_immutable_array(
        &mut self,
        ctx: AllocationContext,
        elements: &[Value],
        pretenure: Pretenure,
    ) -> HeapObject {
        let size = layout::fixed_array_size(elements.len());
        let spaces = self.select_spaces(size, pretenure, AllocationSpace::OldPointer);
        let mut values = elements.to_vec();
        let object =
            self.allocate_protecting(ctx, &mut values, size, spaces, Executability::NotExecutable);
        // SAFETY: freshly allocated with the right size
        unsafe {
            layout::init_fixed_array(object, ShapeId::COW_FIXED_ARRAY, values.len(), Value::ZERO);
            for (index, value) in values.iter().enumerate() {
                object.set_field(layout::fixed_array::element_offset(index), *value);
            }
            self.record_writes(object, layout::fixed_array::ELEMENTS_OFFSET, values.len());
        }
        object
    }

    /// An array of weak references, all initially Smi zero.
    pub fn allocate_weak_array(
        &mut self,
        ctx: AllocationContext,
        length: usize,
        pretenure: Pretenure,
    ) -> HeapObject {
        let size = layout::fixed_array_size(length);
        let object = self.allocate_plain(ctx, size, pretenure, AllocationSpace::OldPointer);
        // SAFETY: freshly allocated with the right size
        unsafe { layout::init_fixed_array(object, ShapeId::WEAK_ARRAY, length, Value::ZERO) };
        object
    }

    pub fn allocate_byte_array(
        &mut self,
        ctx: AllocationContext,
        length: usize,
        pretenure: Pretenure,
    ) -> HeapObject {
        let size = layout::byte_array_size(length);
        let object = self.allocate_plain(ctx, size, pretenure, AllocationSpace::OldData);
        // SAFETY: freshly allocated with the right size
        unsafe { layout::init_byte_array(object, ShapeId::BYTE_ARRAY, length) };
        object
    }

    /// An immutable byte string holding a copy of `bytes`.
    pub fn allocate_byte_string(
        &mut self,
        ctx: AllocationContext,
        bytes: &[u8],
        pretenure: Pretenure,
    ) -> HeapObject {
        let size = layout::byte_array_size(bytes.len());
        let object = self.allocate_plain(ctx, size, pretenure, AllocationSpace::OldData);
        // SAFETY: freshly allocated with the right size
        unsafe {
            layout::init_byte_array(object, ShapeId::BYTE_STRING, bytes.len());
            object
                .byte_ptr(layout::byte_array::DATA_OFFSET)
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
        object
    }

    /// An instance of a registered struct shape with every field set to
    /// `fill`.
    pub fn allocate_struct(
        &mut self,
        ctx: AllocationContext,
        shape: ShapeId,
        fill: Value,
        pretenure: Pretenure,
    ) -> HeapObject {
        let (kind, size) = self.instance_layout(shape);
        debug_assert_eq!(kind, VisitorKind::Struct, "shape {shape:?} is not a struct");
        let spaces = self.select_spaces(size, pretenure, AllocationSpace::OldPointer);
        let mut values = [fill];
        let object =
            self.allocate_protecting(ctx, &mut values, size, spaces, Executability::NotExecutable);
        // SAFETY: freshly allocated with the shape's size
        unsafe {
            layout::init_struct(object, shape, size, values[0]);
            self.record_writes(object, layout::HEADER_SIZE, size / WORD_SIZE - 1);
        }
        object
    }

    /// An instance of a registered data shape, zero-filled.
    pub fn allocate_data_object(
        &mut self,
        ctx: AllocationContext,
        shape: ShapeId,
        pretenure: Pretenure,
    ) -> HeapObject {
        let (kind, size) = self.instance_layout(shape);
        debug_assert_eq!(kind, VisitorKind::DataObject, "shape {shape:?} is not data");
        let object = self.allocate_plain(ctx, size, pretenure, AllocationSpace::OldData);
        // SAFETY: freshly allocated with the shape's size
        unsafe { layout::init_struct(object, shape, size, Value::ZERO) };
        object
    }

    fn instance_layout(&self, shape: ShapeId) -> (VisitorKind, usize) {
        let shape = self.shapes.get(shape);
        match shape.instance_size {
            Some(size) => (shape.kind, size),
            None => panic!("shape {} has no fixed instance size", shape.name),
        }
    }

    /// Maps always live in map space.
    pub fn allocate_map(
        &mut self,
        ctx: AllocationContext,
        prototype: Value,
        descriptors: Value,
        own_descriptors: usize,
    ) -> HeapObject {
        let size = layout::map::SIZE;
        let spaces = (AllocationSpace::Map, AllocationSpace::Map);
        let mut values = [prototype, descriptors];
        let object =
            self.allocate_protecting(ctx, &mut values, size, spaces, Executability::NotExecutable);
        // SAFETY: freshly allocated with the right size
        unsafe {
            layout::init_map(object, values[0], values[1], own_descriptors);
            self.record_writes(object, layout::map::PROTOTYPE_OFFSET, 2);
        }
        object
    }

    pub fn allocate_weak_cell(
        &mut self,
        ctx: AllocationContext,
        value: Value,
        pretenure: Pretenure,
    ) -> HeapObject {
        let size = layout::weak_cell::SIZE;
        let spaces = self.select_spaces(size, pretenure, AllocationSpace::OldPointer);
        let mut values = [value];
        let object =
            self.allocate_protecting(ctx, &mut values, size, spaces, Executability::NotExecutable);
        // SAFETY: freshly allocated with the right size
        unsafe {
            layout::init_weak_cell(object, values[0]);
            self.record_write(object, layout::weak_cell::VALUE_OFFSET);
        }
        object
    }

    /// A table of `entries` key/value pairs, all Smi zero.
    pub fn allocate_ephemeron_table(
        &mut self,
        ctx: AllocationContext,
        entries: usize,
        pretenure: Pretenure,
    ) -> HeapObject {
        let size = layout::ephemeron_table_size(entries);
        let object = self.allocate_plain(ctx, size, pretenure, AllocationSpace::OldPointer);
        // SAFETY: freshly allocated with the right size
        unsafe { layout::init_ephemeron_table(object, entries) };
        object
    }

    /// A string whose characters live in `resource`. The resource is
    /// disposed when the string dies.
    pub fn allocate_external_string(
        &mut self,
        ctx: AllocationContext,
        resource: Box<dyn ExternalStringResource>,
        pretenure: Pretenure,
    ) -> HeapObject {
        let size = layout::external_string::SIZE;
        let object = self.allocate_plain(ctx, size, pretenure, AllocationSpace::OldData);
        let length = resource.bytes().len();
        let id = self.external_strings.add_resource(resource);
        // SAFETY: freshly allocated with the right size
        unsafe { layout::init_external_string(object, length, id) };
        let young = self.in_new_space(object);
        self.external_strings.register(object, young);
        object
    }

    /// An array buffer with a zeroed off-heap backing store.
    pub fn allocate_array_buffer(
        &mut self,
        ctx: AllocationContext,
        byte_length: usize,
        pretenure: Pretenure,
    ) -> HeapObject {
        let size = layout::array_buffer::SIZE;
        let object = self.allocate_plain(ctx, size, pretenure, AllocationSpace::OldData);
        let store = BackingStore::allocate(byte_length);
        // SAFETY: freshly allocated with the right size
        unsafe { layout::init_array_buffer(object, byte_length, store.data) };
        let young = self.in_new_space(object);
        self.array_buffers.register(object, store, young);
        self.adjust_external_memory(byte_length as isize);
        object
    }

    /// Code objects live in code space, or in executable large-object
    /// chunks.
    pub fn allocate_code(
        &mut self,
        ctx: AllocationContext,
        instructions: &[u8],
        constant_pool: Value,
    ) -> HeapObject {
        let size = layout::code_size(instructions.len());
        let spaces = self.select_spaces(size, Pretenure::Tenured, AllocationSpace::Code);
        let mut values = [constant_pool];
        let object =
            self.allocate_protecting(ctx, &mut values, size, spaces, Executability::Executable);
        // SAFETY: freshly allocated with the right size
        unsafe {
            layout::init_code(object, instructions, values[0]);
            self.record_write(object, layout::code::CONSTANT_POOL_OFFSET);
        }
        object
    }

    /// Cells always live in cell space.
    pub fn allocate_cell(&mut self, ctx: AllocationContext, value: Value) -> HeapObject {
        let size = layout::cell::SIZE;
        let spaces = (AllocationSpace::Cell, AllocationSpace::Cell);
        let mut values = [value];
        let object =
            self.allocate_protecting(ctx, &mut values, size, spaces, Executability::NotExecutable);
        // SAFETY: freshly allocated with the right size
        unsafe {
            layout::init_cell(object, values[0]);
            self.record_write(object, layout::cell::VALUE_OFFSET);
        }
        object
    }

    // ── Write barrier ─────────────────────────────────────────────────

    /// Store `value` into the tagged slot at `offset` of `host` and run
    /// the write barrier.
    ///
    /// # Safety
    /// `host` must be a live object and `offset` one of its tagged slots.
    #[inline(always)]
    pub unsafe fn write_field(&mut self, host: HeapObject, offset: usize, value: Value) {
        debug_assert!(!self.is_read_only(host), "write into read-only object {host:?}");
        // SAFETY: forwarded by contract
        unsafe {
            host.set_field(offset, value);
            self.record_write(host, offset);
        }
    }

    /// The write barrier for one slot that was just stored to.
    ///
    /// # Safety
    /// `host` must be a live object and `offset` one of its tagged slots.
    #[inline(always)]
    pub unsafe fn record_write(&mut self, host: HeapObject, offset: usize) {
        let slot = host.slot(offset);
        // SAFETY: forwarded by contract
        let Some(target) = unsafe { slot.load() }.as_object() else {
            return;
        };
        // Fast path: only old-to-new stores touch the remembered set
        if self.new_space.contains(target.address()) && !self.new_space.contains(host.address()) {
            self.record_old_to_new(slot);
        }
        if self.incremental.is_active() {
            self.record_write_marking(host, target);
        }
    }

    /// The write barrier for `count` consecutive slots from `offset`.
    ///
    /// # Safety
    /// As for [`Heap::record_write`], for every slot in the range.
    pub unsafe fn record_writes(&mut self, host: HeapObject, offset: usize, count: usize) {
        for index in 0..count {
            // SAFETY: forwarded by contract
            unsafe { self.record_write(host, offset + index * WORD_SIZE) };
        }
    }

    #[cold]
    fn record_old_to_new(&self, slot: Slot) {
        match self.allocator.chunk_for_address(slot.address()) {
            Some(chunk) => chunk.mark_dirty(slot),
            None => debug_assert!(false, "slot 0x{:x} is outside the heap", slot.address()),
        }
    }

    /// Whether the remembered set covers `slot`.
    pub fn is_slot_dirty(&self, slot: Slot) -> bool {
        self.allocator
            .chunk_for_address(slot.address())
            .is_some_and(|chunk| chunk.is_dirty(slot))
    }

    // ── Roots and handles ─────────────────────────────────────────────

    #[inline(always)]
    pub fn root(&self, index: RootIndex) -> Value {
        self.roots.table.get(index)
    }

    pub fn set_root(&mut self, index: RootIndex, value: Value) {
        self.roots.table.set(index, value);
    }

    pub fn create_handle(&mut self, value: Value) -> Handle {
        self.roots.handles.create(value, false)
    }

    /// A handle that does not keep its target alive. It reads as Smi zero
    /// once the target died.
    pub fn create_weak_handle(&mut self, value: Value) -> Handle {
        self.roots.handles.create(value, true)
    }

    pub fn handle_value(&self, handle: Handle) -> Value {
        self.roots.handles.get(handle)
    }

    pub fn set_handle(&mut self, handle: Handle, value: Value) {
        self.roots.handles.set(handle, value);
    }

    pub fn destroy_handle(&mut self, handle: Handle) {
        self.roots.handles.destroy(handle);
    }

    pub fn global_handles(&self) -> &GlobalHandles {
        &self.roots.handles
    }

    pub fn add_root_provider(&mut self, provider: Box<dyn RootProvider>) {
        self.roots.providers.push(provider);
    }

    pub fn iterate_roots(&mut self, visitor: &mut dyn FnMut(&mut Value), mode: VisitMode) {
        self.roots.iterate(visitor, mode);
    }

    pub fn iterate_strong_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.roots.iterate(visitor, VisitMode::StrongOnly);
    }

    pub fn iterate_weak_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.roots.iterate(visitor, VisitMode::WeakOnly);
    }

    // ── Callbacks and listeners ───────────────────────────────────────

    pub fn add_gc_prologue_callback(&mut self, filter: GcTypeFlags, callback: GcCallback) {
        self.callbacks.prologue.push((filter, callback));
    }

    pub fn add_gc_epilogue_callback(&mut self, filter: GcTypeFlags, callback: GcCallback) {
        self.callbacks.epilogue.push((filter, callback));
    }

    /// Runs before every mark-compact.
    pub fn set_global_gc_prologue_callback(&mut self, callback: Option<GlobalGcCallback>) {
        self.callbacks.global_prologue = callback;
    }

    /// Runs after every mark-compact.
    pub fn set_global_gc_epilogue_callback(&mut self, callback: Option<GlobalGcCallback>) {
        self.callbacks.global_epilogue = callback;
    }

    pub fn add_move_listener(&mut self, listener: MoveListener) {
        self.move_listeners.push(listener);
    }

    // ── External memory ───────────────────────────────────────────────

    /// Account for embedder memory kept alive by heap objects. Returns the
    /// new total.
    pub fn adjust_external_memory(&mut self, delta: isize) -> usize {
        self.external_memory = self.external_memory.saturating_add_signed(delta);
        self.external_memory
    }

    pub fn external_memory(&self) -> usize {
        self.external_memory
    }

    fn external_memory_limit_reached(&self) -> bool {
        self.external_memory
            > self.external_memory_at_last_mc + self.settings.external_memory_limit
    }

    // ── Policy ────────────────────────────────────────────────────────

    /// Bytes in the old generation: every old space but read-only.
    pub fn promoted_space_size(&self) -> usize {
        let paged: usize = self
            .paged_spaces
            .iter()
            .filter(|space| space.id() != AllocationSpace::ReadOnly)
            .map(|space| space.accounting().size)
            .sum();
        paged + self.lo_space.size()
    }

    /// Bytes of objects in all spaces.
    pub fn size_of_objects(&self) -> usize {
        let paged: usize = self
            .paged_spaces
            .iter()
            .map(|space| space.accounting().size)
            .sum();
        self.new_space.size() + paged + self.lo_space.size()
    }

    pub fn old_generation_promotion_limit_reached(&self) -> bool {
        self.promoted_space_size() > self.old_gen_promotion_limit
    }

    pub fn old_generation_allocation_limit_reached(&self) -> bool {
        self.promoted_space_size() > self.old_gen_allocation_limit
    }

    pub fn old_gen_promotion_limit(&self) -> usize {
        self.old_gen_promotion_limit
    }

    pub fn old_gen_allocation_limit(&self) -> usize {
        self.old_gen_allocation_limit
    }

    /// Recompute both old-generation limits from the surviving size.
    pub(crate) fn update_old_generation_limits(&mut self) {
        let size = self.promoted_space_size();
        self.old_gen_promotion_limit = size + self.settings.min_promotion_limit.max(size / 3);
        self.old_gen_allocation_limit = size + self.settings.min_allocation_limit.max(size / 2);
        self.old_gen_exhausted = false;
        self.old_gen_size_at_last_mc = size;
        self.external_memory_at_last_mc = self.external_memory;
        log::info!(
            "old generation {size} bytes: promotion limit {}, allocation limit {}",
            self.old_gen_promotion_limit,
            self.old_gen_allocation_limit
        );
    }

    /// Pick the collector for a failed allocation in `space`.
    pub fn select_garbage_collector(&self, space: AllocationSpace) -> GarbageCollector {
        if space != AllocationSpace::New {
            return GarbageCollector::MarkCompactor;
        }
        if self.incremental.is_complete() {
            return GarbageCollector::MarkCompactor;
        }
        if self.old_generation_promotion_limit_reached() {
            return GarbageCollector::MarkCompactor;
        }
        if self.old_generation_allocation_limit_reached() {
            return GarbageCollector::MarkCompactor;
        }
        if self.old_gen_exhausted {
            return GarbageCollector::MarkCompactor;
        }
        // A scavenge may have to promote a full semispace
        if self.allocator.available() <= self.new_space.capacity() {
            return GarbageCollector::MarkCompactor;
        }
        if self.external_memory_limit_reached() {
            return GarbageCollector::MarkCompactor;
        }
        GarbageCollector::Scavenger
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Collect after an allocation of `required` bytes in `space` failed.
    /// Returns whether the space can now take such an allocation.
    pub fn collect_garbage(&mut self, required: usize, space: AllocationSpace) -> bool {
        let collector = self.select_garbage_collector(space);
        let reason = match space {
            AllocationSpace::New => "new space exhausted",
            _ => "old generation exhausted",
        };
        self.perform_garbage_collection(collector, reason, false);
        self.has_room_for(required, space)
    }

    /// A full mark-compact. `force_compaction` evacuates every page that is
    /// not completely full.
    pub fn collect_all_garbage(&mut self, force_compaction: bool) {
        self.perform_garbage_collection(GarbageCollector::MarkCompactor, "requested", force_compaction);
    }

    /// Full compacting collections until one frees nothing more.
    pub fn collect_all_available_garbage(&mut self) {
        for _ in 0..MAX_LOW_MEMORY_ROUNDS {
            let before = self.size_of_objects();
            self.perform_garbage_collection(GarbageCollector::MarkCompactor, "low memory", true);
            if self.size_of_objects() >= before {
                break;
            }
        }
    }

    fn has_room_for(&self, size: usize, space: AllocationSpace) -> bool {
        if space == AllocationSpace::New {
            return self.new_space.available() >= size;
        }
        let can_grow = !self.old_generation_allocation_limit_reached();
        match space.paged_index() {
            Some(index) => {
                self.paged_spaces[index].can_allocate_without_expanding(size)
                    || (can_grow && self.allocator.available() >= self.settings.page_size)
            }
            None => can_grow && self.allocator.available() >= size,
        }
    }

    pub(crate) fn perform_garbage_collection(
        &mut self,
        collector: GarbageCollector,
        reason: &'static str,
        force_compaction: bool,
    ) {
        if !self.set_up {
            return;
        }
        assert_eq!(self.state, HeapState::NotInGc, "collection during a collection");
        self.callbacks.run_prologue(collector);

        let start = Instant::now();
        let size_before = self.size_of_objects();
        let outcome = match collector {
            GarbageCollector::Scavenger => {
                self.state = HeapState::Scavenge;
                self.scavenge()
            }
            GarbageCollector::MarkCompactor => {
                self.state = HeapState::MarkCompact;
                self.mark_compact(force_compaction)
            }
        };
        self.state = HeapState::NotInGc;
        self.tracer.record(GcEvent {
            collector,
            reason,
            size_before,
            size_after: self.size_of_objects(),
            promoted_bytes: outcome.promoted_bytes,
            copied_bytes: outcome.copied_bytes,
            duration: start.elapsed(),
        });

        self.callbacks.run_epilogue(collector);
        if self.settings.verify_heap {
            self.verify_heap();
        }
        self.allocator.free_queued_chunks();
    }

    /// Spend up to `steps` units of idle work. Each unit marks
    /// `idle_marking_step` bytes. Returns true once there is nothing left
    /// to do.
    pub fn idle_notification(&mut self, steps: usize) -> bool {
        if !self.set_up || self.state != HeapState::NotInGc {
            return true;
        }
        if self.settings.incremental_marking {
            if !self.incremental.is_active()
                && self.promoted_space_size() > self.old_gen_size_at_last_mc
            {
                self.start_incremental_marking();
            }
            if self.incremental.is_active() {
                let step = self.settings.idle_marking_step;
                for _ in 0..steps.max(1) {
                    if self.incremental_marking_step(step) {
                        break;
                    }
                }
                if !self.incremental.is_complete() {
                    return false;
                }
                self.perform_garbage_collection(
                    GarbageCollector::MarkCompactor,
                    "idle notification",
                    false,
                );
            }
        }
        self.new_space.shrink();
        for space in &mut self.paged_spaces {
            if space.id() != AllocationSpace::ReadOnly {
                space.shrink(&mut self.allocator);
            }
        }
        self.allocator.free_queued_chunks();
        true
    }

    /// Clear the number-string cache; it only holds data that can be
    /// recomputed.
    pub(crate) fn flush_number_string_cache(&mut self) {
        let Some(cache) = self.root(RootIndex::NumberStringCache).as_object() else {
            return;
        };
        // SAFETY: the root keeps the cache alive and unforwarded
        unsafe {
            let length = cache.field(layout::fixed_array::LENGTH_OFFSET).smi_usize();
            for index in 0..length {
                cache.set_field(layout::fixed_array::element_offset(index), Value::ZERO);
            }
        }
    }

    /// Where `object` went, if a collection moved it.
    ///
    /// # Safety
    /// `object` must be readable.
    pub(crate) unsafe fn forwarded(object: HeapObject) -> HeapObject {
        // SAFETY: forwarded by contract
        match unsafe { object.map_word() } {
            MapWord::Forwarded(to) => to,
            MapWord::Shape(_) => object,
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut spaces = vec![SpaceStats {
            space: AllocationSpace::New,
            capacity: self.new_space.capacity(),
            size: self.new_space.size(),
            available: self.new_space.available(),
            waste: 0,
        }];
        spaces.extend(
            self.paged_spaces
                .iter()
                .map(|space| SpaceStats::paged(space.id(), space.accounting())),
        );
        spaces.push(SpaceStats {
            space: AllocationSpace::Lo,
            capacity: self.lo_space.committed(),
            size: self.lo_space.size(),
            available: 0,
            waste: 0,
        });
        HeapStats {
            spaces,
            scavenges: self.tracer.scavenges,
            mark_compacts: self.tracer.mark_compacts,
            promoted_bytes: self.tracer.promoted_bytes,
            copied_bytes: self.tracer.copied_bytes,
            total_pause: self.tracer.total_pause,
            max_pause: self.tracer.max_pause,
            survival_rate: self.tracer.survival_rate,
            old_generation_size: self.promoted_space_size(),
            promotion_limit: self.old_gen_promotion_limit,
            allocation_limit: self.old_gen_allocation_limit,
            external_memory: self.external_memory,
            array_buffers: self.array_buffers.len(),
            freed_array_buffers: self.array_buffers.freed_count(),
            global_handles: self.roots.handles.len(),
            recent: self.tracer.events().cloned().collect(),
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.tear_down();
    }
}

impl core::fmt::Debug for Heap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("set_up", &self.set_up)
            .field("state", &self.state)
            .field("new_space", &self.new_space.size())
            .field("old_generation", &self.promoted_space_size())
            .field("large_objects", &self.lo_space.object_count())
            .field("roots", &self.roots)
            .finish()
    }
}

/// Work counters a collection reports to the tracer.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CollectionOutcome {
    pub(crate) promoted_bytes: usize,
    pub(crate) copied_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: usize = 1024;

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            page_size: 64 * KB,
            initial_semispace_size: 128 * KB,
            max_semispace_size: 256 * KB,
            max_old_generation_size: 8 * 1024 * KB,
            code_range_size: 0,
            min_promotion_limit: 512 * KB,
            min_allocation_limit: 1024 * KB,
            concurrent_unmapping: false,
            verify_heap: true,
            ..HeapSettings::default()
        }
    }

    fn create_test_heap() -> Heap {
        let mut heap = Heap::new(create_test_settings());
        heap.setup(true).unwrap();
        heap
    }

    #[test]
    fn setup_twice_fails() {
        let mut heap = create_test_heap();
        assert_eq!(heap.setup(true), Err(HeapError::AlreadySetUp));
        assert_eq!(heap.configure_heap(0, 0), Err(HeapError::AlreadySetUp));
    }

    #[test]
    fn configure_rejects_invalid_settings() {
        let mut heap = Heap::new(create_test_settings());
        let bad = HeapSettings {
            page_size: 12345,
            ..create_test_settings()
        };
        assert!(matches!(heap.configure(bad), Err(HeapError::InvalidSettings(_))));
        assert!(heap.configure_heap(300 * KB, 0).is_ok());
        assert_eq!(heap.settings().max_semispace_size, 512 * KB);
    }

    #[test]
    fn initial_objects_are_rooted() {
        let heap = create_test_heap();
        for index in [
            RootIndex::EmptyFixedArray,
            RootIndex::EmptyString,
            RootIndex::NumberStringCache,
            RootIndex::SymbolTable,
        ] {
            let object = heap.root(index).as_object().unwrap();
            assert_eq!(heap.space_of(object).map(|s| s.is_old()), Some(true));
        }
    }

    #[test]
    fn spaces_follow_size_and_pretenuring() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let young = heap.allocate_fixed_array(ctx, 4, Value::ZERO, Pretenure::NotTenured);
        let old = heap.allocate_fixed_array(ctx, 4, Value::ZERO, Pretenure::Tenured);
        let data = heap.allocate_byte_array(ctx, 16, Pretenure::Tenured);
        let large = heap.allocate_byte_array(ctx, 40 * KB, Pretenure::NotTenured);
        let map = heap.allocate_map(ctx, Value::ZERO, Value::ZERO, 0);
        let cell = heap.allocate_cell(ctx, Value::smi(1));
        let code = heap.allocate_code(ctx, &[0x90; 24], Value::ZERO);
        assert_eq!(heap.space_of(young), Some(AllocationSpace::New));
        assert_eq!(heap.space_of(old), Some(AllocationSpace::OldPointer));
        assert_eq!(heap.space_of(data), Some(AllocationSpace::OldData));
        assert_eq!(heap.space_of(large), Some(AllocationSpace::Lo));
        assert_eq!(heap.space_of(map), Some(AllocationSpace::Map));
        assert_eq!(heap.space_of(cell), Some(AllocationSpace::Cell));
        assert_eq!(heap.space_of(code), Some(AllocationSpace::Code));
    }

    #[test]
    fn write_barrier_marks_old_to_new_slots() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let old = heap.allocate_fixed_array(ctx, 2, Value::ZERO, Pretenure::Tenured);
        let young = heap.allocate_fixed_array(ctx, 1, Value::ZERO, Pretenure::NotTenured);
        let slot = old.slot(layout::fixed_array::element_offset(1));
        assert!(!heap.is_slot_dirty(slot));
        unsafe { heap.write_field(old, layout::fixed_array::element_offset(1), young.into()) };
        assert!(heap.is_slot_dirty(slot));
    }

    #[test]
    fn forbidden_context_is_not_an_allocation_context() {
        assert!(!AllocationContext::forbidden().allows_allocation());
        assert!(AllocationContext::mutator().allows_allocation());
    }

    #[test]
    fn callbacks_run_around_collections() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut heap = create_test_heap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let prologue = log.clone();
        heap.add_gc_prologue_callback(
            GcTypeFlags::ALL,
            Box::new(move |collector| prologue.borrow_mut().push(("pre", collector))),
        );
        let epilogue = log.clone();
        heap.add_gc_epilogue_callback(
            GcTypeFlags::MARK_COMPACT,
            Box::new(move |collector| epilogue.borrow_mut().push(("post", collector))),
        );
        heap.collect_garbage(0, AllocationSpace::New);
        heap.collect_all_garbage(false);
        assert_eq!(
            *log.borrow(),
            vec![
                ("pre", GarbageCollector::Scavenger),
                ("pre", GarbageCollector::MarkCompactor),
                ("post", GarbageCollector::MarkCompactor),
            ]
        );
    }

    #[test]
    fn collection_selection_follows_policy() {
        let mut heap = create_test_heap();
        assert_eq!(
            heap.select_garbage_collector(AllocationSpace::New),
            GarbageCollector::Scavenger
        );
        assert_eq!(
            heap.select_garbage_collector(AllocationSpace::OldPointer),
            GarbageCollector::MarkCompactor
        );
        heap.adjust_external_memory((heap.settings().external_memory_limit + 1) as isize);
        assert_eq!(
            heap.select_garbage_collector(AllocationSpace::New),
            GarbageCollector::MarkCompactor
        );
    }

    #[test]
    fn allocation_limit_alone_selects_mark_compact() {
        let settings = HeapSettings {
            min_promotion_limit: 4 * 1024 * KB,
            min_allocation_limit: 256 * KB,
            ..create_test_settings()
        };
        let mut heap = Heap::new(settings);
        heap.setup(true).unwrap();
        let ctx = AllocationContext::mutator();
        let mut handles = Vec::new();
        while !heap.old_generation_allocation_limit_reached() {
            let array = heap.allocate_fixed_array(ctx, 126, Value::ZERO, Pretenure::Tenured);
            handles.push(heap.create_handle(array.into()));
            assert!(handles.len() < 10_000);
        }
        assert!(!heap.old_generation_promotion_limit_reached());
        assert_eq!(
            heap.select_garbage_collector(AllocationSpace::New),
            GarbageCollector::MarkCompactor
        );

        heap.collect_garbage(0, AllocationSpace::New);
        assert_eq!(heap.stats().mark_compacts, 1);
        assert_eq!(heap.stats().scavenges, 0);
        assert!(!heap.old_generation_allocation_limit_reached());
    }

    #[test]
    fn scavenge_needs_room_to_promote_a_full_semispace() {
        let settings = HeapSettings {
            max_old_generation_size: 256 * KB,
            ..create_test_settings()
        };
        let mut heap = Heap::new(settings);
        heap.setup(true).unwrap();
        // The initial objects take one page each in the two old spaces
        assert_eq!(heap.new_space().size(), 0);
        assert!(!heap.old_generation_promotion_limit_reached());
        assert!(heap.memory_allocator().available() <= heap.new_space().capacity());
        assert_eq!(
            heap.select_garbage_collector(AllocationSpace::New),
            GarbageCollector::MarkCompactor
        );
    }

    #[test]
    fn number_string_cache_is_flushed_by_mark_compact() {
        let mut heap = create_test_heap();
        let cache = heap.root(RootIndex::NumberStringCache).as_object().unwrap();
        unsafe { heap.write_field(cache, layout::fixed_array::element_offset(3), Value::smi(7)) };
        heap.collect_all_garbage(false);
        let cache = heap.root(RootIndex::NumberStringCache).as_object().unwrap();
        unsafe {
            assert_eq!(cache.field(layout::fixed_array::element_offset(3)), Value::ZERO);
        }
    }

    #[test]
    fn idle_time_finishes_marking_then_reports_done() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let kept = heap.allocate_fixed_array(ctx, 8, Value::smi(3), Pretenure::Tenured);
        let handle = heap.create_handle(kept.into());
        heap.allocate_fixed_array(ctx, 8, Value::ZERO, Pretenure::Tenured);

        assert!(heap.idle_notification(16));
        assert_eq!(heap.stats().mark_compacts, 1);
        assert!(!heap.incremental.is_active());
        let kept = heap.handle_value(handle).as_object().unwrap();
        unsafe { assert_eq!(kept.field(layout::fixed_array::element_offset(7)), Value::smi(3)) };

        // Nothing was promoted since, so there is no marking to do
        assert!(heap.idle_notification(16));
        assert_eq!(heap.stats().mark_compacts, 1);
    }

    #[test]
    fn tear_down_releases_memory() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        heap.allocate_array_buffer(ctx, 100, Pretenure::NotTenured);
        heap.allocate_byte_array(ctx, 40 * KB, Pretenure::Tenured);
        heap.tear_down();
        assert!(!heap.has_been_setup());
        heap.memory_allocator().ensure_unmapping_completed();
        assert_eq!(heap.memory_allocator().size(), 0);
        assert!(heap.array_buffer_tracker().is_empty());
    }
}
