//! The executable code range.
//!
//! All code pages are carved out of one reservation so calls between code
//! objects stay within near-call distance.

use std::collections::HashMap;
use std::sync::Arc;

use object::Address;
use parking_lot::Mutex;

use crate::{Executability, VirtualMemory};

/// Process-wide cache of recently released code range bases, keyed by
/// range size. Reusing a base keeps the address space from fragmenting
/// when heaps come and go.
#[derive(Debug, Default)]
pub struct CodeRangeAddressHint {
    recently_freed: HashMap<usize, Vec<Address>, ahash::RandomState>,
}

/// The hint cache is shared between heaps and guarded by its own lock.
pub type SharedAddressHint = Arc<Mutex<CodeRangeAddressHint>>;

impl CodeRangeAddressHint {
    pub fn shared() -> SharedAddressHint {
        Arc::new(Mutex::new(Self::default()))
    }

    /// A base address to try for a new range of `size` bytes, or 0 to let
    /// the OS choose.
    pub fn get_address_hint(&mut self, size: usize) -> Address {
        self.recently_freed
            .get_mut(&size)
            .and_then(|bases| bases.pop())
            .unwrap_or(0)
    }

    pub fn notify_freed(&mut self, base: Address, size: usize) {
        self.recently_freed.entry(size).or_default().push(base);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    start: Address,
    size: usize,
}

pub struct CodeRange {
    reservation: VirtualMemory,
    hint: SharedAddressHint,
    /// Sorted by start, never adjacent.
    free_blocks: Vec<FreeBlock>,
    allocated: usize,
}

impl CodeRange {
    pub fn new(size: usize, alignment: usize, hint: SharedAddressHint) -> Option<Self> {
        let requested = hint.lock().get_address_hint(size);
        let reservation = VirtualMemory::reserve(size, alignment, requested)?;
        if requested != 0 && reservation.address() != requested {
            log::trace!("code range hint 0x{requested:x} not honored");
        }
        log::info!(
            "code range of {size} bytes at 0x{:x}",
            reservation.address()
        );
        Some(Self {
            free_blocks: vec![FreeBlock {
                start: reservation.address(),
                size,
            }],
            reservation,
            hint,
            allocated: 0,
        })
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        self.reservation.address()
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.reservation.size()
    }

    #[inline(always)]
    pub fn contains(&self, address: Address) -> bool {
        self.reservation.contains(address)
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Carve `size` bytes out of the range and commit them executable.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        let index = self.free_blocks.iter().position(|b| b.size >= size)?;
        let block = self.free_blocks[index];
        if !self
            .reservation
            .commit(block.start, size, Executability::Executable)
        {
            log::warn!("failed to commit {size} bytes of code range");
            return None;
        }
        if block.size == size {
            self.free_blocks.remove(index);
        } else {
            self.free_blocks[index] = FreeBlock {
                start: block.start + size,
                size: block.size - size,
            };
        }
        self.allocated += size;
        Some(block.start)
    }

    /// Uncommit a block and return it to the range.
    pub fn free(&mut self, start: Address, size: usize) {
        debug_assert!(self.contains(start));
        if !self.reservation.uncommit(start, size) {
            log::error!("failed to uncommit code block at 0x{start:x}");
            panic!("failed to uncommit code range block");
        }
        self.allocated -= size;
        let index = self.free_blocks.partition_point(|b| b.start < start);
        self.free_blocks.insert(index, FreeBlock { start, size });
        if index + 1 < self.free_blocks.len() {
            let next = self.free_blocks[index + 1];
            if start + size == next.start {
                self.free_blocks[index].size += next.size;
                self.free_blocks.remove(index + 1);
            }
        }
        if index > 0 {
            let prev = self.free_blocks[index - 1];
            if prev.start + prev.size == start {
                self.free_blocks[index - 1].size += self.free_blocks[index].size;
                self.free_blocks.remove(index);
            }
        }
    }

    pub fn free_block_count(&self) -> usize {
        self.free_blocks.len()
    }
}

impl Drop for CodeRange {
    fn drop(&mut self) {
        self.hint
            .lock()
            .notify_freed(self.reservation.address(), self.reservation.size());
    }
}

impl core::fmt::Debug for CodeRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CodeRange")
            .field("start", &format_args!("0x{:x}", self.start()))
            .field("size", &self.size())
            .field("allocated", &self.allocated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 64 * 1024;

    #[test]
    fn allocate_and_coalesce() {
        let hint = CodeRangeAddressHint::shared();
        let mut range = CodeRange::new(8 * PAGE, PAGE, hint).unwrap();
        let a = range.allocate(PAGE).unwrap();
        let b = range.allocate(2 * PAGE).unwrap();
        let c = range.allocate(PAGE).unwrap();
        assert_eq!(b, a + PAGE);
        assert_eq!(c, b + 2 * PAGE);
        unsafe { (b as *mut u64).write(0xC0DE) };

        range.free(b, 2 * PAGE);
        assert_eq!(range.free_block_count(), 2);
        range.free(a, PAGE);
        range.free(c, PAGE);
        assert_eq!(range.free_block_count(), 1);
        assert_eq!(range.allocated(), 0);
        assert!(range.allocate(9 * PAGE).is_none());
    }

    #[test]
    fn freed_ranges_become_hints() {
        let hint = CodeRangeAddressHint::shared();
        let base = {
            let range = CodeRange::new(4 * PAGE, PAGE, hint.clone()).unwrap();
            range.start()
        };
        assert_eq!(hint.lock().get_address_hint(4 * PAGE), base);
        assert_eq!(hint.lock().get_address_hint(4 * PAGE), 0);
    }
}
