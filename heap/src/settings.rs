use object::WORD_SIZE;

use crate::OS_PAGE_SIZE;

/// Configuration for the heap's spaces and collectors.
///
/// All tuning knobs live here; none of the numbers are load-bearing for
/// correctness, only for pause times and memory use.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Size of a regular page in bytes. A power of two, multiple of the OS
    /// page size. Pages are aligned to their size.
    pub page_size: usize,
    /// Committed size of each semispace at setup.
    pub initial_semispace_size: usize,
    /// Upper bound for semispace growth. A power of two.
    pub max_semispace_size: usize,
    /// Hard cap on committed old-generation memory.
    pub max_old_generation_size: usize,
    /// Hard cap on committed executable memory.
    pub max_executable_size: usize,
    /// Size of the executable code range; 0 places code pages anywhere.
    pub code_range_size: usize,
    /// Bytes covered by one remembered-set bit.
    pub dirty_region_size: usize,
    /// Smallest growth of the promotion limit after a mark-compact.
    pub min_promotion_limit: usize,
    /// Smallest growth of the allocation limit after a mark-compact.
    pub min_allocation_limit: usize,
    /// Once this fraction (0.0 - 1.0) of to-space is used during a
    /// scavenge, survivors are promoted instead of copied.
    pub promotion_fraction: f64,
    /// Entries in the bounded marking deque.
    pub marking_deque_capacity: usize,
    /// Recorded slots per evacuation candidate before it is evicted.
    pub slots_buffer_capacity: usize,
    /// Pages whose live fraction (0.0 - 1.0) is below this are compacted.
    pub evacuation_threshold: f64,
    /// Upper bound on evacuation candidates per paged space and cycle.
    pub max_evacuation_candidates: usize,
    /// Background unmapping tasks allowed in flight.
    pub unmapper_max_tasks: usize,
    /// Run unmapping on background threads instead of inline.
    pub concurrent_unmapping: bool,
    /// Uncommitted pages kept for reuse.
    pub max_pooled_pages: usize,
    /// Free blocks smaller than this are counted as waste.
    pub min_free_block_size: usize,
    /// External bytes beyond which the next collection is a mark-compact.
    pub external_memory_limit: usize,
    /// Allow idle time to drive incremental marking.
    pub incremental_marking: bool,
    /// Bytes marked per unit of idle budget.
    pub idle_marking_step: usize,
    /// Verify the heap after every collection.
    pub verify_heap: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            page_size: 256 * 1024,
            initial_semispace_size: 512 * 1024,
            max_semispace_size: 8 * 1024 * 1024,
            max_old_generation_size: 512 * 1024 * 1024,
            max_executable_size: 128 * 1024 * 1024,
            code_range_size: 32 * 1024 * 1024,
            dirty_region_size: 128,
            min_promotion_limit: 2 * 1024 * 1024,
            min_allocation_limit: 8 * 1024 * 1024,
            promotion_fraction: 0.25,
            marking_deque_capacity: 64 * 1024,
            slots_buffer_capacity: 16 * 1024,
            evacuation_threshold: 0.5,
            max_evacuation_candidates: 8,
            unmapper_max_tasks: 4,
            concurrent_unmapping: true,
            max_pooled_pages: 8,
            min_free_block_size: 4 * WORD_SIZE,
            external_memory_limit: 64 * 1024 * 1024,
            incremental_marking: true,
            idle_marking_step: 256 * 1024,
            verify_heap: cfg!(debug_assertions),
        }
    }
}

impl HeapSettings {
    /// Objects above this size go to the large-object space.
    #[inline(always)]
    pub fn max_regular_object_size(&self) -> usize {
        self.page_size / 2
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if !self.page_size.is_power_of_two() || self.page_size < OS_PAGE_SIZE {
            return Err("page_size must be a power of two and at least an OS page");
        }
        if !self.max_semispace_size.is_power_of_two() {
            return Err("max_semispace_size must be a power of two");
        }
        if self.initial_semispace_size == 0
            || !self.initial_semispace_size.is_multiple_of(OS_PAGE_SIZE)
        {
            return Err("initial_semispace_size must be a non-zero multiple of the OS page");
        }
        if self.initial_semispace_size > self.max_semispace_size {
            return Err("initial_semispace_size must not exceed max_semispace_size");
        }
        if self.max_old_generation_size < self.page_size {
            return Err("max_old_generation_size must hold at least one page");
        }
        if !self.code_range_size.is_multiple_of(self.page_size) {
            return Err("code_range_size must be a multiple of page_size");
        }
        if !self.dirty_region_size.is_power_of_two()
            || self.dirty_region_size < WORD_SIZE
            || self.dirty_region_size > self.page_size
        {
            return Err("dirty_region_size must be a power of two between a word and a page");
        }
        if !(0.0..=1.0).contains(&self.promotion_fraction)
            || !(0.0..=1.0).contains(&self.evacuation_threshold)
        {
            return Err("Fractions must be between 0.0 and 1.0");
        }
        if self.marking_deque_capacity == 0 || self.slots_buffer_capacity == 0 {
            return Err("marking deque and slots buffers need capacity");
        }
        if self.unmapper_max_tasks == 0 {
            return Err("unmapper_max_tasks must be > 0");
        }
        if self.min_free_block_size < WORD_SIZE {
            return Err("min_free_block_size must be at least a word");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(HeapSettings::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_unaligned_page_size() {
        let settings = HeapSettings {
            page_size: 3 * OS_PAGE_SIZE,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_initial_above_max_semispace() {
        let settings = HeapSettings {
            initial_semispace_size: 16 * 1024 * 1024,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
