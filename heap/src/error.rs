use thiserror::Error;

/// Errors from configuring and setting up a heap.
///
/// Running out of memory during normal operation is not an error value:
/// allocation reports [`AllocationResult::Retry`](crate::AllocationResult)
/// and unrecoverable exhaustion is fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    #[error("heap is already set up")]
    AlreadySetUp,
    #[error("heap is not set up")]
    NotSetUp,
    #[error("invalid heap settings: {0}")]
    InvalidSettings(&'static str),
    #[error("failed to reserve {size} bytes for {what}")]
    ReservationFailed { what: &'static str, size: usize },
}

/// Abort after an allocation that has no recovery path failed.
///
/// Collections cannot make partial progress once they have started moving
/// objects, so the only safe response is to stop the process.
#[cold]
#[track_caller]
pub fn fatal_out_of_memory(location: &str) -> ! {
    log::error!("fatal out of memory: {location}");
    panic!("out of memory: {location}");
}
