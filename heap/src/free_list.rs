use object::{Address, layout};

/// Upper bounds (inclusive) of the size classes; the last class is open.
const CATEGORY_LIMITS: [usize; 4] = [128, 512, 2048, 16 * 1024];
const CATEGORY_COUNT: usize = CATEGORY_LIMITS.len() + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub start: Address,
    pub size: usize,
}

/// Reusable holes of a paged space, bucketed by size class.
///
/// Every hole is covered by a filler object so the page stays iterable.
/// Holes smaller than the minimum block size are not listed and count as
/// waste instead.
#[derive(Debug)]
pub struct FreeList {
    categories: [Vec<FreeBlock>; CATEGORY_COUNT],
    available: usize,
    min_block_size: usize,
}

#[inline(always)]
fn category_for(size: usize) -> usize {
    CATEGORY_LIMITS
        .iter()
        .position(|&limit| size <= limit)
        .unwrap_or(CATEGORY_LIMITS.len())
}

impl FreeList {
    pub fn new(min_block_size: usize) -> Self {
        Self {
            categories: Default::default(),
            available: 0,
            min_block_size,
        }
    }

    /// Bytes on the list.
    #[inline(always)]
    pub fn available(&self) -> usize {
        self.available
    }

    /// Put `[start, start + size)` back. Returns the number of bytes that
    /// were too small to list.
    ///
    /// # Safety
    /// The range must be writable heap memory not covered by any live
    /// object.
    pub unsafe fn free(&mut self, start: Address, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        // SAFETY: forwarded by contract
        unsafe { layout::write_filler(start, size) };
        if size < self.min_block_size {
            return size;
        }
        self.categories[category_for(size)].push(FreeBlock { start, size });
        self.available += size;
        0
    }

    /// Remove and return a block of at least `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Option<FreeBlock> {
        let first = category_for(size);
        // The home category may hold blocks smaller than `size`.
        if let Some(index) = self.categories[first].iter().position(|b| b.size >= size) {
            let block = self.categories[first].swap_remove(index);
            self.available -= block.size;
            return Some(block);
        }
        for category in &mut self.categories[first + 1..] {
            if let Some(block) = category.pop() {
                self.available -= block.size;
                return Some(block);
            }
        }
        None
    }

    /// Drop every block for which `pred` holds. Returns the bytes removed.
    pub fn evict(&mut self, mut pred: impl FnMut(Address) -> bool) -> usize {
        let mut removed = 0;
        for category in &mut self.categories {
            category.retain(|block| {
                if pred(block.start) {
                    removed += block.size;
                    false
                } else {
                    true
                }
            });
        }
        self.available -= removed;
        removed
    }

    pub fn reset(&mut self) {
        for category in &mut self.categories {
            category.clear();
        }
        self.available = 0;
    }

    pub fn blocks(&self) -> impl Iterator<Item = &FreeBlock> {
        self.categories.iter().flatten()
    }
}
