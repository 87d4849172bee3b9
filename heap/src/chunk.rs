use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use object::{Address, HeapObject, Slot, WORD_SIZE};
use parking_lot::Mutex;

use crate::{AllocationSpace, Bitmap, SlotsBuffer, VirtualMemory};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ChunkFlags: u32 {
        /// Live objects will be moved off this page by the current
        /// mark-compact.
        const EVACUATION_CANDIDATE = 1 << 0;
        const NEVER_EVACUATE = 1 << 1;
        /// Evicted from the candidate set; its live objects are rescanned
        /// during pointer updating.
        const RESCAN_ON_EVACUATION = 1 << 2;
        const LARGE = 1 << 3;
        const EXECUTABLE = 1 << 4;
        /// Holds gray objects that did not fit on the marking deque.
        const HAS_OVERFLOW = 1 << 5;
        const READ_ONLY = 1 << 6;
    }
}

/// Dense index of a chunk in the allocator's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub(crate) u32);

/// Move-only ownership token for one chunk.
///
/// Only the [`MemoryAllocator`](crate::MemoryAllocator) creates these, and
/// freeing a chunk consumes its handle.
#[derive(Debug, PartialEq, Eq)]
pub struct PageHandle {
    id: ChunkId,
}

impl PageHandle {
    pub(crate) fn new(id: ChunkId) -> Self {
        Self { id }
    }

    #[inline(always)]
    pub fn id(&self) -> ChunkId {
        self.id
    }
}

/// Mark and overflow bits, one per word of a region.
///
/// A set mark bit means gray or black; an object is gray exactly while it
/// sits on the marking deque or has its overflow bit set.
#[derive(Debug)]
pub struct MarkBits {
    base: Address,
    marks: Bitmap,
    overflow: Bitmap,
}

impl MarkBits {
    pub fn new(base: Address, size: usize) -> Self {
        let words = size / WORD_SIZE;
        Self {
            base,
            marks: Bitmap::new(words),
            overflow: Bitmap::new(words),
        }
    }

    #[inline(always)]
    fn index(&self, object: HeapObject) -> usize {
        (object.address() - self.base) / WORD_SIZE
    }

    #[inline(always)]
    pub fn base(&self) -> Address {
        self.base
    }

    #[inline(always)]
    pub fn is_marked(&self, object: HeapObject) -> bool {
        self.marks.get(self.index(object))
    }

    /// Mark the object; returns whether it was white.
    #[inline(always)]
    pub fn mark(&self, object: HeapObject) -> bool {
        self.marks.set(self.index(object))
    }

    #[inline(always)]
    pub fn unmark(&self, object: HeapObject) {
        self.marks.clear(self.index(object));
    }

    #[inline(always)]
    pub fn set_overflow(&self, object: HeapObject) {
        self.overflow.set(self.index(object));
    }

    #[inline(always)]
    pub fn take_overflow(&self, object: HeapObject) -> bool {
        self.overflow.clear(self.index(object))
    }

    pub fn has_overflow(&self) -> bool {
        self.overflow.any()
    }

    pub fn overflowed_objects(&self) -> Vec<HeapObject> {
        self.overflow
            .iter_ones()
            .map(|i| HeapObject::from_address(self.base + i * WORD_SIZE))
            .collect()
    }

    /// Marked objects in ascending address order.
    pub fn marked_objects(&self) -> impl Iterator<Item = HeapObject> + '_ {
        self.marks
            .iter_ones()
            .map(|i| HeapObject::from_address(self.base + i * WORD_SIZE))
    }

    pub fn marked_count(&self) -> usize {
        self.marks.count_ones()
    }

    pub fn clear(&self) {
        self.marks.clear_all();
        self.overflow.clear_all();
    }

    /// Clear marks in `[start, end)`.
    pub fn clear_range(&self, start: Address, end: Address) {
        let from = (start - self.base) / WORD_SIZE;
        let to = (end - self.base) / WORD_SIZE;
        self.marks.clear_range(from, to);
        self.overflow.clear_range(from, to);
    }
}

/// Where a chunk's memory came from.
#[derive(Debug)]
pub(crate) enum ChunkBacking {
    Reservation(VirtualMemory),
    CodeRange,
}

/// Metadata for one page or large-object chunk.
///
/// The metadata lives off-chunk so the whole chunk is object area. Fields
/// touched during marking are atomics or locked so collectors can work
/// through a shared reference.
pub struct MemoryChunk {
    id: ChunkId,
    base: Address,
    size: usize,
    owner: AllocationSpace,
    flags: AtomicU32,
    live_bytes: AtomicUsize,
    /// Bytes on the free list after the last sweep.
    pub(crate) free_bytes: usize,
    /// Bytes too small for the free list after the last sweep.
    pub(crate) wasted_bytes: usize,
    marks: MarkBits,
    dirty: Bitmap,
    region_shift: u32,
    slots: Mutex<SlotsBuffer>,
    pub(crate) backing: ChunkBacking,
}

impl MemoryChunk {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ChunkId,
        base: Address,
        size: usize,
        owner: AllocationSpace,
        flags: ChunkFlags,
        dirty_region_size: usize,
        slots_capacity: usize,
        backing: ChunkBacking,
    ) -> Self {
        let region_shift = dirty_region_size.trailing_zeros();
        Self {
            id,
            base,
            size,
            owner,
            flags: AtomicU32::new(flags.bits()),
            live_bytes: AtomicUsize::new(0),
            free_bytes: 0,
            wasted_bytes: 0,
            marks: MarkBits::new(base, size),
            dirty: Bitmap::new(size.div_ceil(dirty_region_size)),
            region_shift,
            slots: Mutex::new(SlotsBuffer::new(slots_capacity)),
            backing,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    #[inline(always)]
    pub fn base(&self) -> Address {
        self.base
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn area_start(&self) -> Address {
        self.base
    }

    #[inline(always)]
    pub fn area_end(&self) -> Address {
        self.base + self.size
    }

    #[inline(always)]
    pub fn area_size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.base + self.size
    }

    #[inline(always)]
    pub fn owner(&self) -> AllocationSpace {
        self.owner
    }

    // ── Flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> ChunkFlags {
        ChunkFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: ChunkFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub fn set_flag(&self, flag: ChunkFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn clear_flag(&self, flag: ChunkFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_evacuation_candidate(&self) -> bool {
        self.has_flag(ChunkFlags::EVACUATION_CANDIDATE)
    }

    // ── Liveness ───────────────────────────────────────────────────

    #[inline(always)]
    pub fn marks(&self) -> &MarkBits {
        &self.marks
    }

    #[inline(always)]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn increment_live_bytes(&self, by: usize) {
        self.live_bytes.fetch_add(by, Ordering::Relaxed);
    }

    pub fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Relaxed);
    }

    // ── Remembered set ─────────────────────────────────────────────

    #[inline(always)]
    fn region_index(&self, address: Address) -> usize {
        (address - self.base) >> self.region_shift
    }

    #[inline(always)]
    pub fn region_size(&self) -> usize {
        1 << self.region_shift
    }

    /// Mark the region holding `slot` as possibly containing a pointer
    /// into new space.
    #[inline(always)]
    pub fn mark_dirty(&self, slot: Slot) {
        self.dirty.set(self.region_index(slot.address()));
    }

    #[inline(always)]
    pub fn is_dirty(&self, slot: Slot) -> bool {
        self.dirty.get(self.region_index(slot.address()))
    }

    pub fn has_dirty_regions(&self) -> bool {
        self.dirty.any()
    }

    /// Whether any region overlapping `[start, end)` is dirty.
    pub fn any_dirty_in(&self, start: Address, end: Address) -> bool {
        if start >= end {
            return false;
        }
        let first = self.region_index(start);
        let last = self.region_index(end - 1);
        self.dirty.any_in(first, last + 1)
    }

    pub fn clear_dirty_regions(&self) {
        self.dirty.clear_all();
    }

    pub fn dirty_region_count(&self) -> usize {
        self.dirty.count_ones()
    }

    // ── Slots buffer ───────────────────────────────────────────────

    /// Record a slot pointing into this page. Returns false on overflow.
    pub fn record_slot(&self, slot: Slot) -> bool {
        self.slots.lock().record(slot)
    }

    pub fn take_slots(&self) -> Vec<Slot> {
        self.slots.lock().take()
    }

    pub fn clear_slots(&self) {
        self.slots.lock().clear();
    }

    pub fn recorded_slots(&self) -> usize {
        self.slots.lock().len()
    }
}

impl core::fmt::Debug for MemoryChunk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryChunk")
            .field("id", &self.id)
            .field("base", &format_args!("0x{:x}", self.base))
            .field("size", &self.size)
            .field("owner", &self.owner)
            .field("flags", &self.flags())
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}
