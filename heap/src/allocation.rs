use object::HeapObject;

use crate::AllocationSpace;

/// Outcome of a raw allocation.
///
/// `Retry` is not an error: it tells the caller which collection to run
/// before asking again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum AllocationResult {
    Ok(HeapObject),
    Retry { size: usize, space: AllocationSpace },
}

impl AllocationResult {
    #[inline(always)]
    pub fn ok(self) -> Option<HeapObject> {
        match self {
            AllocationResult::Ok(object) => Some(object),
            AllocationResult::Retry { .. } => None,
        }
    }

    #[inline(always)]
    pub fn is_retry(self) -> bool {
        matches!(self, AllocationResult::Retry { .. })
    }

    /// The space whose collection would let this allocation succeed.
    #[inline(always)]
    pub fn retry_space(self) -> Option<AllocationSpace> {
        match self {
            AllocationResult::Ok(_) => None,
            AllocationResult::Retry { space, .. } => Some(space),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Mutator,
    Forbidden,
    AlwaysAllocate,
}

/// Capability token that every allocating entry point requires.
///
/// Regions that must not allocate hand out [`AllocationContext::forbidden`];
/// using it to allocate is an invariant violation caught in debug builds.
/// The collectors allocate with an internal "always allocate" context that
/// may expand spaces past their limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationContext {
    mode: Mode,
}

impl AllocationContext {
    pub const fn mutator() -> Self {
        Self {
            mode: Mode::Mutator,
        }
    }

    pub const fn forbidden() -> Self {
        Self {
            mode: Mode::Forbidden,
        }
    }

    pub(crate) const fn always_allocate() -> Self {
        Self {
            mode: Mode::AlwaysAllocate,
        }
    }

    #[inline(always)]
    pub fn allows_allocation(self) -> bool {
        self.mode != Mode::Forbidden
    }

    #[inline(always)]
    pub fn is_always_allocate(self) -> bool {
        self.mode == Mode::AlwaysAllocate
    }
}

impl Default for AllocationContext {
    fn default() -> Self {
        Self::mutator()
    }
}
