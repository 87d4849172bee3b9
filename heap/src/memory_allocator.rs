//! Raw chunk management.
//!
//! The allocator is the only owner of OS reservations. Spaces hold
//! [`PageHandle`] tokens and give them back to free a chunk; the chunk
//! metadata itself lives in an arena indexed by [`ChunkId`].

use std::ptr::NonNull;

use object::Address;

use crate::code_range::{CodeRange, SharedAddressHint};
use crate::space::AddressMap;
use crate::system::{self, Protection};
use crate::unmapper::Unmapper;
use crate::{
    AllocationSpace, ChunkBacking, ChunkFlags, ChunkId, Executability, HeapSettings, MemoryChunk,
    PageHandle,
};

// ── Virtual memory ────────────────────────────────────────────────────

/// Move-only token for one OS reservation. Dropping it unmaps the range.
pub struct VirtualMemory {
    base: Address,
    size: usize,
}

impl VirtualMemory {
    /// Reserve `size` bytes aligned to `alignment`, trying `hint` first.
    pub fn reserve(size: usize, alignment: usize, hint: usize) -> Option<Self> {
        let ptr = system::reserve_aligned_memory(hint, size, alignment)?;
        log::trace!("reserved {size} bytes at {:p}", ptr.as_ptr());
        Some(Self {
            base: ptr.as_ptr() as Address,
            size,
        })
    }

    #[inline(always)]
    pub fn address(&self) -> Address {
        self.base
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.base + self.size
    }

    fn ptr(&self, address: Address) -> Option<NonNull<u8>> {
        debug_assert!(address == self.base + self.size || self.contains(address));
        NonNull::new(address as *mut u8)
    }

    pub fn commit(&self, address: Address, size: usize, executable: Executability) -> bool {
        let protection = match executable {
            Executability::Executable => Protection::ReadWriteExecute,
            Executability::NotExecutable => Protection::ReadWrite,
        };
        match self.ptr(address) {
            Some(ptr) => system::commit_memory(ptr, size, protection),
            None => false,
        }
    }

    pub fn uncommit(&self, address: Address, size: usize) -> bool {
        match self.ptr(address) {
            Some(ptr) => system::uncommit_memory(ptr, size),
            None => false,
        }
    }

    pub fn protect(&self, address: Address, size: usize, protection: Protection) -> bool {
        match self.ptr(address) {
            Some(ptr) => system::protect_memory(ptr, size, protection),
            None => false,
        }
    }

    /// Unmap the reservation now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        let Some(ptr) = NonNull::new(self.base as *mut u8) else {
            return;
        };
        if !system::release_memory(ptr, self.size) {
            log::error!("munmap of {} bytes at 0x{:x} failed", self.size, self.base);
            panic!("failed to release virtual memory at 0x{:x}", self.base);
        }
        log::trace!("released {} bytes at 0x{:x}", self.size, self.base);
    }
}

impl core::fmt::Debug for VirtualMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VirtualMemory(0x{:x}, {})", self.base, self.size)
    }
}

// ── Memory allocator ──────────────────────────────────────────────────

/// How a freed chunk's memory is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeMode {
    /// Unmap on the calling thread.
    Immediately,
    /// Hand to the unmapper: regular pages are uncommitted and pooled,
    /// everything else is unmapped in the background.
    Queued,
}

pub struct MemoryAllocator {
    page_size: usize,
    dirty_region_size: usize,
    slots_capacity: usize,
    /// Upper bound on bytes in non-executable chunks.
    capacity: usize,
    capacity_executable: usize,
    size: usize,
    size_executable: usize,
    chunks: Vec<Option<MemoryChunk>>,
    free_ids: Vec<u32>,
    /// Every page-aligned address inside a live chunk, mapped to its chunk.
    by_base: AddressMap<ChunkId>,
    unmapper: Unmapper,
    code_range: Option<CodeRange>,
}

impl MemoryAllocator {
    pub fn new(settings: &HeapSettings, hint: SharedAddressHint) -> Self {
        let code_range = if settings.code_range_size > 0 {
            let range = CodeRange::new(settings.code_range_size, settings.page_size, hint);
            if range.is_none() {
                log::warn!(
                    "could not reserve a {} byte code range, code pages will be scattered",
                    settings.code_range_size
                );
            }
            range
        } else {
            None
        };
        Self {
            page_size: settings.page_size,
            dirty_region_size: settings.dirty_region_size,
            slots_capacity: settings.slots_buffer_capacity,
            capacity: settings.max_old_generation_size,
            capacity_executable: settings.max_executable_size,
            size: 0,
            size_executable: 0,
            chunks: Vec::new(),
            free_ids: Vec::new(),
            by_base: AddressMap::default(),
            unmapper: Unmapper::new(settings),
            code_range,
        }
    }

    #[inline(always)]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes held by live chunks.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn size_executable(&self) -> usize {
        self.size_executable
    }

    /// Bytes still available before the capacity limit.
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.size)
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn unmapper(&self) -> &Unmapper {
        &self.unmapper
    }

    pub fn code_range(&self) -> Option<&CodeRange> {
        self.code_range.as_ref()
    }

    /// Reserve `reserve_size` bytes aligned to `alignment` and commit the
    /// first `commit_size`. Returns `None` if either step fails.
    pub fn allocate_aligned_memory(
        &self,
        reserve_size: usize,
        commit_size: usize,
        alignment: usize,
        executable: Executability,
    ) -> Option<VirtualMemory> {
        debug_assert!(commit_size <= reserve_size);
        let reservation = VirtualMemory::reserve(reserve_size, alignment, 0)?;
        if commit_size > 0 && !reservation.commit(reservation.address(), commit_size, executable)
        {
            log::warn!("failed to commit {commit_size} bytes");
            return None;
        }
        Some(reservation)
    }

    /// Unmap a reservation. Failure is fatal.
    pub fn free_memory(&self, reservation: VirtualMemory) {
        reservation.release();
    }

    fn fits(&self, size: usize, executable: Executability) -> bool {
        match executable {
            Executability::Executable => {
                self.size_executable + size <= self.capacity_executable
                    && self.size + size <= self.capacity
            }
            Executability::NotExecutable => self.size + size <= self.capacity,
        }
    }

    /// Allocate and commit one regular page for `owner`.
    pub fn allocate_page(&mut self, owner: AllocationSpace) -> Option<PageHandle> {
        let executable = owner.executability();
        let size = self.page_size;
        if !self.fits(size, executable) {
            return None;
        }
        let pooled = match executable {
            Executability::NotExecutable => self.unmapper.try_take_pooled(),
            Executability::Executable => None,
        };
        let (base, backing) = if let (Executability::Executable, Some(range)) =
            (executable, self.code_range.as_mut())
        {
            (range.allocate(size)?, ChunkBacking::CodeRange)
        } else if let Some(pooled) = pooled {
            if !pooled.commit(pooled.address(), size, executable) {
                return None;
            }
            (pooled.address(), ChunkBacking::Reservation(pooled))
        } else {
            let reservation = self.allocate_aligned_memory(size, size, size, executable)?;
            (reservation.address(), ChunkBacking::Reservation(reservation))
        };
        let mut flags = ChunkFlags::empty();
        if executable == Executability::Executable {
            flags |= ChunkFlags::EXECUTABLE;
        }
        Some(self.register(base, size, owner, flags, backing))
    }

    /// Allocate a chunk holding exactly one object of `object_size` bytes.
    pub fn allocate_large_chunk(
        &mut self,
        object_size: usize,
        owner: AllocationSpace,
        executable: Executability,
    ) -> Option<PageHandle> {
        let size = object_size.checked_next_multiple_of(self.page_size)?;
        if !self.fits(size, executable) {
            return None;
        }
        let from_range = match (executable, self.code_range.as_mut()) {
            (Executability::Executable, Some(range)) => range.allocate(size),
            _ => None,
        };
        let (base, backing) = match from_range {
            Some(base) => (base, ChunkBacking::CodeRange),
            None => {
                let reservation =
                    self.allocate_aligned_memory(size, size, self.page_size, executable)?;
                (reservation.address(), ChunkBacking::Reservation(reservation))
            }
        };
        let mut flags = ChunkFlags::LARGE;
        if executable == Executability::Executable {
            flags |= ChunkFlags::EXECUTABLE;
        }
        Some(self.register(base, size, owner, flags, backing))
    }

    fn register(
        &mut self,
        base: Address,
        size: usize,
        owner: AllocationSpace,
        flags: ChunkFlags,
        backing: ChunkBacking,
    ) -> PageHandle {
        let id = match self.free_ids.pop() {
            Some(index) => ChunkId(index),
            None => {
                self.chunks.push(None);
                ChunkId((self.chunks.len() - 1) as u32)
            }
        };
        let chunk = MemoryChunk::new(
            id,
            base,
            size,
            owner,
            flags,
            self.dirty_region_size,
            self.slots_capacity,
            backing,
        );
        self.size += size;
        if flags.contains(ChunkFlags::EXECUTABLE) {
            self.size_executable += size;
        }
        for page in (base..base + size).step_by(self.page_size) {
            self.by_base.insert(page, id);
        }
        log::trace!(
            "chunk {} for {} at 0x{base:x} ({size} bytes)",
            id.0,
            owner.name()
        );
        self.chunks[id.0 as usize] = Some(chunk);
        PageHandle::new(id)
    }

    /// Give a chunk back. Consumes its ownership token.
    pub fn free_chunk(&mut self, handle: PageHandle, mode: FreeMode) {
        let id = handle.id();
        let Some(chunk) = self.chunks[id.0 as usize].take() else {
            panic!("chunk {} freed twice", id.0);
        };
        self.free_ids.push(id.0);
        for page in (chunk.base()..chunk.area_end()).step_by(self.page_size) {
            self.by_base.remove(&page);
        }
        self.size -= chunk.size();
        let executable = chunk.has_flag(ChunkFlags::EXECUTABLE);
        if executable {
            self.size_executable -= chunk.size();
        }
        let regular = chunk.size() == self.page_size && !executable;
        let (base, size) = (chunk.base(), chunk.size());
        log::trace!("freeing chunk {} at 0x{base:x} ({mode:?})", id.0);
        match chunk.backing {
            ChunkBacking::CodeRange => {
                if let Some(range) = self.code_range.as_mut() {
                    range.free(base, size);
                }
            }
            ChunkBacking::Reservation(reservation) => match mode {
                FreeMode::Immediately => self.free_memory(reservation),
                FreeMode::Queued => self.unmapper.add(reservation, regular),
            },
        }
    }

    #[inline]
    pub fn chunk(&self, id: ChunkId) -> &MemoryChunk {
        match self.chunks.get(id.0 as usize) {
            Some(Some(chunk)) => chunk,
            _ => panic!("stale chunk id {}", id.0),
        }
    }

    #[inline]
    pub fn chunk_mut(&mut self, id: ChunkId) -> &mut MemoryChunk {
        match self.chunks.get_mut(id.0 as usize) {
            Some(Some(chunk)) => chunk,
            _ => panic!("stale chunk id {}", id.0),
        }
    }

    /// The chunk containing `address`, if it lies in any live chunk.
    #[inline]
    pub fn chunk_for_address(&self, address: Address) -> Option<&MemoryChunk> {
        let page = address & !(self.page_size - 1);
        let id = self.by_base.get(&page)?;
        self.chunks[id.0 as usize].as_ref()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &MemoryChunk> {
        self.chunks.iter().flatten()
    }

    /// Start background work on everything queued since the last call.
    pub fn free_queued_chunks(&self) {
        self.unmapper.free_queued_chunks();
    }

    /// Block until all queued unmapping has finished.
    pub fn ensure_unmapping_completed(&self) {
        self.unmapper.ensure_unmapping_completed();
    }

    /// Release every chunk and all pooled memory.
    pub fn tear_down(&mut self) {
        let ids: Vec<ChunkId> = self.chunks().map(|c| c.id()).collect();
        for id in ids {
            self.free_chunk(PageHandle::new(id), FreeMode::Immediately);
        }
        self.unmapper.tear_down();
        debug_assert_eq!(self.size, 0);
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        self.tear_down();
    }
}

impl core::fmt::Debug for MemoryAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryAllocator")
            .field("size", &self.size)
            .field("size_executable", &self.size_executable)
            .field("capacity", &self.capacity)
            .field("chunks", &self.chunks().count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::CodeRangeAddressHint;

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            page_size: 64 * 1024,
            code_range_size: 1024 * 1024,
            max_old_generation_size: 4 * 1024 * 1024,
            concurrent_unmapping: false,
            ..HeapSettings::default()
        }
    }

    fn create_test_allocator() -> MemoryAllocator {
        let hint = Arc::new(Mutex::new(CodeRangeAddressHint::default()));
        MemoryAllocator::new(&create_test_settings(), hint)
    }

    #[test]
    fn pages_are_aligned_and_registered() {
        let mut allocator = create_test_allocator();
        let page = allocator.allocate_page(AllocationSpace::OldPointer).unwrap();
        let chunk = allocator.chunk(page.id());
        assert_eq!(chunk.base() % allocator.page_size(), 0);
        let middle = chunk.base() + 1000;
        assert_eq!(allocator.chunk_for_address(middle).unwrap().id(), page.id());
        assert_eq!(allocator.size(), allocator.page_size());
        unsafe { (chunk.base() as *mut u64).write(7) };

        allocator.free_chunk(page, FreeMode::Immediately);
        assert_eq!(allocator.size(), 0);
        assert!(allocator.chunk_for_address(middle).is_none());
    }

    #[test]
    fn large_chunks_cover_every_page() {
        let mut allocator = create_test_allocator();
        let size = 3 * allocator.page_size() + 8;
        let handle = allocator
            .allocate_large_chunk(size, AllocationSpace::Lo, Executability::NotExecutable)
            .unwrap();
        let chunk = allocator.chunk(handle.id());
        assert_eq!(chunk.size(), 4 * allocator.page_size());
        assert!(chunk.has_flag(ChunkFlags::LARGE));
        let tail = chunk.base() + size - 8;
        assert_eq!(allocator.chunk_for_address(tail).unwrap().id(), handle.id());
        allocator.free_chunk(handle, FreeMode::Queued);
        allocator.ensure_unmapping_completed();
        assert_eq!(allocator.size(), 0);
    }

    #[test]
    fn capacity_limits_allocation() {
        let mut allocator = create_test_allocator();
        let mut pages = Vec::new();
        while let Some(page) = allocator.allocate_page(AllocationSpace::OldData) {
            pages.push(page);
        }
        assert_eq!(pages.len(), 4 * 1024 * 1024 / (64 * 1024));
        for page in pages {
            allocator.free_chunk(page, FreeMode::Immediately);
        }
    }

    #[test]
    fn code_pages_come_from_the_code_range() {
        let mut allocator = create_test_allocator();
        let page = allocator.allocate_page(AllocationSpace::Code).unwrap();
        let base = allocator.chunk(page.id()).base();
        assert!(allocator.code_range().unwrap().contains(base));
        assert!(allocator.chunk(page.id()).has_flag(ChunkFlags::EXECUTABLE));
        assert_eq!(allocator.size_executable(), allocator.page_size());
        allocator.free_chunk(page, FreeMode::Queued);
        assert_eq!(allocator.size_executable(), 0);
    }

    #[test]
    fn queued_pages_are_pooled_and_reused() {
        let mut allocator = create_test_allocator();
        let page = allocator.allocate_page(AllocationSpace::OldPointer).unwrap();
        let base = allocator.chunk(page.id()).base();
        allocator.free_chunk(page, FreeMode::Queued);
        allocator.free_queued_chunks();
        allocator.ensure_unmapping_completed();
        assert_eq!(allocator.unmapper().pooled_count(), 1);

        let again = allocator.allocate_page(AllocationSpace::OldPointer).unwrap();
        assert_eq!(allocator.chunk(again.id()).base(), base);
        assert_eq!(allocator.unmapper().pooled_count(), 0);
        allocator.free_chunk(again, FreeMode::Immediately);
    }

    #[test]
    fn aligned_memory_is_committed() {
        let allocator = create_test_allocator();
        let memory = allocator
            .allocate_aligned_memory(1 << 20, 1 << 16, 1 << 20, Executability::NotExecutable)
            .unwrap();
        assert_eq!(memory.address() % (1 << 20), 0);
        unsafe { (memory.address() as *mut u64).write(1) };
        allocator.free_memory(memory);
    }
}
