use object::HeapObject;

use crate::{
    AllocationResult, AllocationSpace, ChunkId, Executability, FreeMode, MemoryAllocator,
    PageHandle,
};

#[derive(Debug)]
struct LargePage {
    handle: PageHandle,
    object_size: usize,
}

/// One chunk per object. Objects here never move.
#[derive(Debug, Default)]
pub struct LargeObjectSpace {
    pages: Vec<LargePage>,
    size: usize,
    committed: usize,
}

impl LargeObjectSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of objects in the space.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes of committed chunks.
    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn object_count(&self) -> usize {
        self.pages.len()
    }

    pub fn allocate_raw(
        &mut self,
        allocator: &mut MemoryAllocator,
        size: usize,
        executable: Executability,
    ) -> AllocationResult {
        let Some(handle) = allocator.allocate_large_chunk(size, AllocationSpace::Lo, executable)
        else {
            return AllocationResult::Retry {
                size,
                space: AllocationSpace::Lo,
            };
        };
        let chunk = allocator.chunk(handle.id());
        let object = HeapObject::from_address(chunk.area_start());
        self.size += size;
        self.committed += chunk.size();
        log::trace!("large object of {size} bytes at {object:?}");
        self.pages.push(LargePage {
            handle,
            object_size: size,
        });
        AllocationResult::Ok(object)
    }

    /// Every object with the chunk holding it.
    pub fn objects<'a>(
        &'a self,
        allocator: &'a MemoryAllocator,
    ) -> impl Iterator<Item = (HeapObject, ChunkId)> + 'a {
        self.pages.iter().map(move |page| {
            let chunk = allocator.chunk(page.handle.id());
            (HeapObject::from_address(chunk.area_start()), page.handle.id())
        })
    }

    /// Free the chunk of every object for which `is_live` is false.
    /// Returns the number of objects and bytes freed.
    pub fn free_dead(
        &mut self,
        allocator: &mut MemoryAllocator,
        mut is_live: impl FnMut(&MemoryAllocator, HeapObject) -> bool,
    ) -> (usize, usize) {
        let mut freed = (0, 0);
        let mut kept = Vec::with_capacity(self.pages.len());
        for page in self.pages.drain(..) {
            let chunk = allocator.chunk(page.handle.id());
            let object = HeapObject::from_address(chunk.area_start());
            if is_live(allocator, object) {
                kept.push(page);
                continue;
            }
            self.size -= page.object_size;
            self.committed -= chunk.size();
            freed.0 += 1;
            freed.1 += page.object_size;
            allocator.free_chunk(page.handle, FreeMode::Queued);
        }
        self.pages = kept;
        freed
    }

    pub fn tear_down(&mut self, allocator: &mut MemoryAllocator) {
        for page in self.pages.drain(..) {
            allocator.free_chunk(page.handle, FreeMode::Immediately);
        }
        self.size = 0;
        self.committed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodeRangeAddressHint, HeapSettings};

    #[test]
    fn allocate_and_free_dead() {
        let settings = HeapSettings {
            page_size: 64 * 1024,
            code_range_size: 0,
            concurrent_unmapping: false,
            ..HeapSettings::default()
        };
        let mut allocator = MemoryAllocator::new(&settings, CodeRangeAddressHint::shared());
        let mut space = LargeObjectSpace::new();
        let a = space
            .allocate_raw(&mut allocator, 100 * 1024, Executability::NotExecutable)
            .ok()
            .unwrap();
        let b = space
            .allocate_raw(&mut allocator, 200 * 1024, Executability::NotExecutable)
            .ok()
            .unwrap();
        assert_eq!(a.address() % settings.page_size, 0);
        assert_eq!(space.size(), 300 * 1024);
        assert_eq!(space.committed(), (2 + 4) * 64 * 1024);

        let (count, bytes) = space.free_dead(&mut allocator, |_, object| object == b);
        assert_eq!((count, bytes), (1, 100 * 1024));
        assert_eq!(space.object_count(), 1);
        assert_eq!(space.objects(&allocator).next().map(|(o, _)| o), Some(b));
        space.tear_down(&mut allocator);
        allocator.ensure_unmapping_completed();
        assert_eq!(allocator.size(), 0);
    }
}
