use object::{Address, HeapObject};

use crate::{AllocationResult, AllocationSpace, Executability, HeapError, MarkBits, VirtualMemory};

/// One half of new space.
#[derive(Debug)]
pub struct SemiSpace {
    start: Address,
    capacity: usize,
    marks: MarkBits,
}

impl SemiSpace {
    fn new(start: Address, capacity: usize, max_capacity: usize) -> Self {
        Self {
            start,
            capacity,
            marks: MarkBits::new(start, max_capacity),
        }
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        self.start
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.start + self.capacity
    }

    #[inline(always)]
    pub fn marks(&self) -> &MarkBits {
        &self.marks
    }
}

/// The young generation: two equal semispaces in one reservation.
///
/// The reservation is twice the maximum semispace size and aligned to
/// that size, so `address & mask == start` tests membership in either
/// half with one operation.
#[derive(Debug)]
pub struct NewSpace {
    reservation: Option<VirtualMemory>,
    start: Address,
    mask: usize,
    to: SemiSpace,
    from: SemiSpace,
    top: Address,
    limit: Address,
    /// End of the objects the from-space held when it was flipped.
    from_top: Address,
    age_mark: Address,
    initial_capacity: usize,
    max_capacity: usize,
}

impl NewSpace {
    /// An unset space: contains nothing, allocates nothing.
    pub fn new() -> Self {
        Self {
            reservation: None,
            start: 0,
            mask: usize::MAX,
            to: SemiSpace::new(0, 0, 0),
            from: SemiSpace::new(0, 0, 0),
            top: 0,
            limit: 0,
            from_top: 0,
            age_mark: 0,
            initial_capacity: 0,
            max_capacity: 0,
        }
    }

    pub fn setup(&mut self, initial_capacity: usize, max_capacity: usize) -> Result<(), HeapError> {
        let size = 2 * max_capacity;
        let reservation = VirtualMemory::reserve(size, size, 0).ok_or(
            HeapError::ReservationFailed {
                what: "new space",
                size,
            },
        )?;
        let start = reservation.address();
        for half in [start, start + max_capacity] {
            if !reservation.commit(half, initial_capacity, Executability::NotExecutable) {
                return Err(HeapError::ReservationFailed {
                    what: "semispace",
                    size: initial_capacity,
                });
            }
        }
        self.start = start;
        self.mask = !(size - 1);
        self.to = SemiSpace::new(start, initial_capacity, max_capacity);
        self.from = SemiSpace::new(start + max_capacity, initial_capacity, max_capacity);
        self.top = start;
        self.limit = start + initial_capacity;
        self.from_top = self.from.start;
        self.age_mark = start;
        self.initial_capacity = initial_capacity;
        self.max_capacity = max_capacity;
        self.reservation = Some(reservation);
        log::info!(
            "new space at 0x{start:x}: {initial_capacity} bytes per semispace, up to {max_capacity}"
        );
        Ok(())
    }

    pub fn is_set_up(&self) -> bool {
        self.reservation.is_some()
    }

    pub fn tear_down(&mut self) {
        *self = Self::new();
    }

    /// Either semispace contains `address`.
    #[inline(always)]
    pub fn contains(&self, address: Address) -> bool {
        address & self.mask == self.start
    }

    #[inline(always)]
    pub fn to_space_contains(&self, address: Address) -> bool {
        self.to.contains(address)
    }

    #[inline(always)]
    pub fn from_space_contains(&self, address: Address) -> bool {
        self.from.contains(address)
    }

    #[inline(always)]
    pub fn to_space(&self) -> &SemiSpace {
        &self.to
    }

    #[inline(always)]
    pub fn from_space(&self) -> &SemiSpace {
        &self.from
    }

    /// Mark bits of whichever semispace holds `address`.
    #[inline(always)]
    pub fn marks_for(&self, address: Address) -> &MarkBits {
        if self.to.contains(address) {
            &self.to.marks
        } else {
            &self.from.marks
        }
    }

    /// Bump allocation in to-space.
    #[inline(always)]
    pub fn allocate_raw(&mut self, size: usize) -> AllocationResult {
        match self.top.checked_add(size) {
            Some(new_top) if new_top <= self.limit => {
                let object = HeapObject::from_address(self.top);
                self.top = new_top;
                AllocationResult::Ok(object)
            }
            _ => AllocationResult::Retry {
                size,
                space: AllocationSpace::New,
            },
        }
    }

    /// Swap the semispaces. The old to-space becomes from-space and
    /// allocation restarts at the bottom of the new to-space.
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.to, &mut self.from);
        self.from_top = self.top;
        self.top = self.to.start;
        self.limit = self.to.start + self.to.capacity;
    }

    /// Bytes allocated in to-space.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.top - self.to.start
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.to.capacity
    }

    #[inline(always)]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    #[inline(always)]
    pub fn available(&self) -> usize {
        self.limit - self.top
    }

    #[inline(always)]
    pub fn top(&self) -> Address {
        self.top
    }

    /// Objects below the age mark have survived one scavenge.
    #[inline(always)]
    pub fn age_mark(&self) -> Address {
        self.age_mark
    }

    pub fn set_age_mark(&mut self, mark: Address) {
        debug_assert!(mark >= self.to.start && mark <= self.top);
        self.age_mark = mark;
    }

    /// `[start, top)` of to-space.
    pub fn to_space_range(&self) -> (Address, Address) {
        (self.to.start, self.top)
    }

    /// Objects the from-space held when it was last flipped.
    pub fn from_space_range(&self) -> (Address, Address) {
        (self.from.start, self.from_top)
    }

    /// Double both semispaces, up to the maximum. Returns whether the
    /// capacity changed.
    pub fn grow(&mut self) -> bool {
        let Some(reservation) = &self.reservation else {
            return false;
        };
        let new_capacity = (self.to.capacity * 2).min(self.max_capacity);
        if new_capacity <= self.to.capacity {
            return false;
        }
        let delta = new_capacity - self.to.capacity;
        for half in [&self.to, &self.from] {
            if !reservation.commit(half.start + half.capacity, delta, Executability::NotExecutable)
            {
                log::warn!("failed to grow new space to {new_capacity} bytes");
                return false;
            }
        }
        self.to.capacity = new_capacity;
        self.from.capacity = new_capacity;
        self.limit = self.to.start + new_capacity;
        log::debug!("new space grew to {new_capacity} bytes per semispace");
        true
    }

    /// Halve both semispaces, down to the initial size, if the objects in
    /// to-space still fit.
    pub fn shrink(&mut self) -> bool {
        let Some(reservation) = &self.reservation else {
            return false;
        };
        let new_capacity = (self.to.capacity / 2).max(self.initial_capacity);
        if new_capacity >= self.to.capacity || self.size() > new_capacity {
            return false;
        }
        let delta = self.to.capacity - new_capacity;
        for half in [&self.to, &self.from] {
            if !reservation.uncommit(half.start + new_capacity, delta) {
                log::warn!("failed to shrink new space");
                return false;
            }
        }
        self.to.capacity = new_capacity;
        self.from.capacity = new_capacity;
        self.limit = self.to.start + new_capacity;
        log::debug!("new space shrank to {new_capacity} bytes per semispace");
        true
    }
}

impl Default for NewSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: usize = 1024;

    fn create_test_space() -> NewSpace {
        let mut space = NewSpace::new();
        space.setup(64 * KB, 256 * KB).unwrap();
        space
    }

    #[test]
    fn mask_covers_both_semispaces() {
        let space = create_test_space();
        let (to_start, _) = space.to_space_range();
        let from_start = space.from_space().start();
        assert!(space.contains(to_start));
        assert!(space.contains(from_start + 8));
        assert!(space.contains(to_start + 512 * KB - 8));
        assert!(!space.contains(to_start + 512 * KB));
        assert!(!space.contains(to_start.wrapping_sub(8)));
    }

    #[test]
    fn allocation_retries_when_full() {
        let mut space = create_test_space();
        let a = space.allocate_raw(64).ok().unwrap();
        let b = space.allocate_raw(64).ok().unwrap();
        assert_eq!(b.address(), a.address() + 64);
        assert!(space.allocate_raw(64 * KB).is_retry());
        assert_eq!(space.size(), 128);
    }

    #[test]
    fn flip_swaps_roles() {
        let mut space = create_test_space();
        let object = space.allocate_raw(64).ok().unwrap();
        space.flip();
        assert!(space.from_space_contains(object.address()));
        assert!(!space.to_space_contains(object.address()));
        assert_eq!(space.from_space_range(), (object.address(), object.address() + 64));
        assert_eq!(space.size(), 0);
    }

    #[test]
    fn grow_and_shrink_keep_halves_equal() {
        let mut space = create_test_space();
        assert!(space.grow());
        assert_eq!(space.capacity(), 128 * KB);
        assert_eq!(space.from_space().capacity(), 128 * KB);
        assert!(space.grow());
        assert!(!space.grow());
        assert_eq!(space.capacity(), 256 * KB);

        let top = space.allocate_raw(200 * KB).ok().unwrap();
        unsafe { (top.address() as *mut u64).write(1) };
        assert!(!space.shrink());
        space.flip();
        assert!(space.shrink());
        assert_eq!(space.capacity(), 128 * KB);
        assert_eq!(space.from_space().capacity(), 128 * KB);
        assert!(space.shrink());
        assert!(!space.shrink());
        assert_eq!(space.capacity(), 64 * KB);
    }
}
