use object::{Address, HeapObject, ShapeTable};

use crate::space::{AddressMap, for_each_object};
use crate::system::Protection;
use crate::{
    AllocationResult, AllocationSpace, ChunkBacking, ChunkFlags, ChunkId, FreeList, FreeMode,
    HeapSettings, MemoryAllocator, PageHandle,
};

/// Byte accounting of one space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceAccounting {
    /// Committed object area.
    pub capacity: usize,
    /// Bytes handed out to objects, live or not yet swept.
    pub size: usize,
    /// Bytes on the free list.
    pub available: usize,
    /// Bytes lost to holes too small to reuse.
    pub waste: usize,
}

/// A space made of regular pages with a free list and a linear
/// allocation area (LAB) carved from it.
#[derive(Debug)]
pub struct PagedSpace {
    id: AllocationSpace,
    pages: Vec<PageHandle>,
    free_list: FreeList,
    top: Address,
    limit: Address,
    waste: usize,
    page_size: usize,
    sealed: bool,
}

impl PagedSpace {
    pub fn new(id: AllocationSpace, settings: &HeapSettings) -> Self {
        debug_assert!(id.paged_index().is_some());
        Self {
            id,
            pages: Vec::new(),
            free_list: FreeList::new(settings.min_free_block_size),
            top: 0,
            limit: 0,
            waste: 0,
            page_size: settings.page_size,
            sealed: false,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> AllocationSpace {
        self.id
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.pages.iter().map(|page| page.id())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Linear allocation first, then the free list, then a fresh page if
    /// `can_expand` allows it.
    pub fn allocate_raw(
        &mut self,
        allocator: &mut MemoryAllocator,
        size: usize,
        can_expand: bool,
    ) -> AllocationResult {
        debug_assert!(!self.sealed, "allocation in sealed space {}", self.id.name());
        if let Some(object) = self.allocate_linearly(size) {
            return AllocationResult::Ok(object);
        }
        if self.refill_linear_area(size) {
            if let Some(object) = self.allocate_linearly(size) {
                return AllocationResult::Ok(object);
            }
        }
        if can_expand && self.expand(allocator) && self.refill_linear_area(size) {
            if let Some(object) = self.allocate_linearly(size) {
                return AllocationResult::Ok(object);
            }
        }
        AllocationResult::Retry {
            size,
            space: self.id,
        }
    }

    #[inline(always)]
    fn allocate_linearly(&mut self, size: usize) -> Option<HeapObject> {
        let new_top = self.top.checked_add(size)?;
        if self.top == 0 || new_top > self.limit {
            return None;
        }
        let object = HeapObject::from_address(self.top);
        self.top = new_top;
        Some(object)
    }

    fn refill_linear_area(&mut self, size: usize) -> bool {
        self.close_linear_allocation_area();
        match self.free_list.allocate(size) {
            Some(block) => {
                self.top = block.start;
                self.limit = block.start + block.size;
                true
            }
            None => false,
        }
    }

    /// Add a fresh page and put its whole area on the free list.
    pub fn expand(&mut self, allocator: &mut MemoryAllocator) -> bool {
        let Some(page) = allocator.allocate_page(self.id) else {
            return false;
        };
        let chunk = allocator.chunk_mut(page.id());
        let (start, size) = (chunk.area_start(), chunk.area_size());
        chunk.free_bytes = size;
        chunk.wasted_bytes = 0;
        // SAFETY: the page was just committed and holds no objects
        self.waste += unsafe { self.free_list.free(start, size) };
        log::trace!("{} space expanded to {} pages", self.id.name(), self.pages.len() + 1);
        self.pages.push(page);
        true
    }

    /// Give the unused rest of the LAB back to the free list so the space
    /// is iterable.
    pub fn close_linear_allocation_area(&mut self) {
        if self.top != 0 && self.top < self.limit {
            // SAFETY: the LAB tail is owned by this space and unused
            self.waste += unsafe { self.free_list.free(self.top, self.limit - self.top) };
        }
        self.top = 0;
        self.limit = 0;
    }

    pub fn has_linear_allocation_area(&self) -> bool {
        self.top != 0
    }

    /// Return a dead range to the free list.
    ///
    /// # Safety
    /// `[start, start + size)` must lie in one of this space's pages and
    /// hold no live object.
    pub unsafe fn free(&mut self, start: Address, size: usize) -> usize {
        // SAFETY: forwarded by contract
        let wasted = unsafe { self.free_list.free(start, size) };
        self.waste += wasted;
        wasted
    }

    /// Drop all free-list entries and waste; a sweep rebuilds them.
    pub fn reset_free_list(&mut self) {
        self.close_linear_allocation_area();
        self.free_list.reset();
        self.waste = 0;
    }

    /// Remove free-list entries that lie on page `id`.
    pub fn evict_free_list_entries(&mut self, allocator: &MemoryAllocator, id: ChunkId) -> usize {
        let chunk = allocator.chunk(id);
        self.free_list.evict(|address| chunk.contains(address))
    }

    /// Detach a page from this space. Its free-list entries must already
    /// be evicted.
    pub fn take_page(&mut self, id: ChunkId) -> Option<PageHandle> {
        let index = self.pages.iter().position(|page| page.id() == id)?;
        Some(self.pages.swap_remove(index))
    }

    /// Free-list bytes on each page, keyed by page base.
    pub(crate) fn free_bytes_by_page(&self, allocator: &MemoryAllocator) -> AddressMap<usize> {
        let mut bytes = AddressMap::default();
        for block in self.free_list.blocks() {
            if let Some(chunk) = allocator.chunk_for_address(block.start) {
                *bytes.entry(chunk.base()).or_default() += block.size;
            }
        }
        bytes
    }

    /// Release pages that are entirely on the free list, keeping at least
    /// one.
    pub fn shrink(&mut self, allocator: &mut MemoryAllocator) -> usize {
        self.close_linear_allocation_area();
        let free = self.free_bytes_by_page(allocator);
        let empty: Vec<ChunkId> = self
            .page_ids()
            .filter(|&id| {
                let chunk = allocator.chunk(id);
                free.get(&chunk.base()) == Some(&chunk.area_size())
            })
            .collect();
        let mut released = 0;
        for id in empty {
            if self.pages.len() <= 1 {
                break;
            }
            self.evict_free_list_entries(allocator, id);
            if let Some(page) = self.take_page(id) {
                allocator.free_chunk(page, FreeMode::Queued);
                released += 1;
            }
        }
        if released > 0 {
            log::debug!("{} space released {released} empty pages", self.id.name());
        }
        released
    }

    pub fn accounting(&self) -> SpaceAccounting {
        let capacity = self.pages.len() * self.page_size;
        let available = self.free_list.available();
        let lab = self.limit - self.top;
        SpaceAccounting {
            capacity,
            size: capacity - available - self.waste - lab,
            available,
            waste: self.waste,
        }
    }

    /// Whether `size` more bytes can be allocated without a new page.
    pub fn can_allocate_without_expanding(&self, size: usize) -> bool {
        self.limit - self.top >= size || self.free_list.blocks().any(|b| b.size >= size)
    }

    pub fn contains(&self, allocator: &MemoryAllocator, address: Address) -> bool {
        allocator
            .chunk_for_address(address)
            .is_some_and(|chunk| chunk.owner() == self.id)
    }

    /// Walk every object and filler on every page.
    ///
    /// # Safety
    /// The LAB must be closed and no object may be forwarded.
    pub unsafe fn for_each_object(
        &self,
        allocator: &MemoryAllocator,
        shapes: &ShapeTable,
        mut f: impl FnMut(HeapObject, usize),
    ) {
        debug_assert!(!self.has_linear_allocation_area());
        for id in self.page_ids() {
            let chunk = allocator.chunk(id);
            // SAFETY: forwarded by contract
            unsafe { for_each_object(shapes, chunk.area_start(), chunk.area_end(), &mut f) };
        }
    }

    /// Write-protect every page. Further allocation is an invariant
    /// violation.
    pub fn seal(&mut self, allocator: &MemoryAllocator) {
        self.close_linear_allocation_area();
        self.free_list.reset();
        for id in self.page_ids() {
            let chunk = allocator.chunk(id);
            chunk.set_flag(ChunkFlags::READ_ONLY);
            let protected = match &chunk.backing {
                ChunkBacking::Reservation(memory) => {
                    memory.protect(chunk.base(), chunk.size(), Protection::Read)
                }
                ChunkBacking::CodeRange => false,
            };
            if !protected {
                log::warn!("could not write-protect read-only page {:?}", chunk.id());
            }
        }
        self.sealed = true;
    }

    /// Give every page back to the allocator.
    pub fn tear_down(&mut self, allocator: &mut MemoryAllocator) {
        self.top = 0;
        self.limit = 0;
        self.free_list.reset();
        self.waste = 0;
        for page in self.pages.drain(..) {
            let chunk = allocator.chunk(page.id());
            if chunk.has_flag(ChunkFlags::READ_ONLY) {
                if let ChunkBacking::Reservation(memory) = &chunk.backing {
                    memory.protect(chunk.base(), chunk.size(), Protection::ReadWrite);
                }
            }
            allocator.free_chunk(page, FreeMode::Immediately);
        }
        self.sealed = false;
    }
}

#[cfg(test)]
mod tests {
    use object::{ShapeId, WORD_SIZE, layout};

    use super::*;
    use crate::CodeRangeAddressHint;

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            page_size: 64 * 1024,
            max_old_generation_size: 256 * 1024,
            code_range_size: 0,
            concurrent_unmapping: false,
            ..HeapSettings::default()
        }
    }

    fn create_test_space() -> (MemoryAllocator, PagedSpace) {
        let settings = create_test_settings();
        let allocator = MemoryAllocator::new(&settings, CodeRangeAddressHint::shared());
        let space = PagedSpace::new(AllocationSpace::OldPointer, &settings);
        (allocator, space)
    }

    fn alloc(space: &mut PagedSpace, allocator: &mut MemoryAllocator, size: usize) -> HeapObject {
        let object = space.allocate_raw(allocator, size, true).ok().unwrap();
        unsafe {
            layout::init_fixed_array(
                object,
                ShapeId::FIXED_ARRAY,
                (size - layout::fixed_array::ELEMENTS_OFFSET) / WORD_SIZE,
                object::Value::ZERO,
            )
        };
        object
    }

    #[test]
    fn bump_allocation_is_contiguous() {
        let (mut allocator, mut space) = create_test_space();
        let a = alloc(&mut space, &mut allocator, 64);
        let b = alloc(&mut space, &mut allocator, 64);
        assert_eq!(b.address(), a.address() + 64);
        assert_eq!(space.page_count(), 1);
        space.close_linear_allocation_area();
        let accounting = space.accounting();
        assert_eq!(accounting.capacity, 64 * 1024);
        assert_eq!(accounting.size, 128);
        assert_eq!(accounting.available + accounting.waste + accounting.size, accounting.capacity);
        space.tear_down(&mut allocator);
    }

    #[test]
    fn retry_without_expansion() {
        let (mut allocator, mut space) = create_test_space();
        let result = space.allocate_raw(&mut allocator, 64, false);
        assert_eq!(
            result,
            AllocationResult::Retry {
                size: 64,
                space: AllocationSpace::OldPointer
            }
        );
    }

    #[test]
    fn expansion_stops_at_capacity() {
        let (mut allocator, mut space) = create_test_space();
        let mut count = 0;
        while space.allocate_raw(&mut allocator, 16 * 1024, true).ok().is_some() {
            count += 1;
            assert!(count < 1000);
        }
        assert_eq!(space.page_count(), 4);
        space.tear_down(&mut allocator);
    }

    #[test]
    fn shrink_releases_wholly_free_pages() {
        let (mut allocator, mut space) = create_test_space();
        assert!(space.expand(&mut allocator));
        assert!(space.expand(&mut allocator));
        alloc(&mut space, &mut allocator, 64);
        assert_eq!(space.page_count(), 2);
        assert_eq!(space.shrink(&mut allocator), 1);
        assert_eq!(space.page_count(), 1);
        assert_eq!(space.accounting().size, 64);
        space.tear_down(&mut allocator);
    }

    #[test]
    fn iterating_after_closing_the_lab() {
        let (mut allocator, mut space) = create_test_space();
        let shapes = ShapeTable::new();
        for _ in 0..10 {
            alloc(&mut space, &mut allocator, 48);
        }
        space.close_linear_allocation_area();
        let mut arrays = 0;
        let mut total = 0;
        unsafe {
            space.for_each_object(&allocator, &shapes, |object, size| {
                total += size;
                if object.shape() == ShapeId::FIXED_ARRAY {
                    arrays += 1;
                }
            });
        }
        assert_eq!(arrays, 10);
        assert_eq!(total, 64 * 1024);
        space.tear_down(&mut allocator);
    }
}
