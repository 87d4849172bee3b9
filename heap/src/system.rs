//! Thin wrappers over the OS virtual memory calls.
//!
//! Reservations are made inaccessible and without swap backing; committing
//! a range flips it to read-write (or read-write-execute) and decommitting
//! drops the physical pages and makes the range inaccessible again.

use std::ptr::NonNull;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;
    pub const PROT_EXEC: i32 = 0x4;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    #[cfg(target_os = "linux")]
    pub const MAP_NORESERVE: i32 = 0x4000;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_NORESERVE: i32 = 0x40;

    #[cfg(target_os = "linux")]
    pub const MADV_DONTNEED: i32 = 4;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MADV_DONTNEED: i32 = 4;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap, munmap, mprotect and madvise
    /// # Safety
    /// see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;

        pub fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;
    }

    /// Reserve address space without committing it.
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn reserve(hint: *mut u8, len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                hint.cast(),
                len,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANON | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be allocated by mmap
    #[inline]
    pub unsafe fn release(ptr: *mut u8, len: usize) -> bool {
        // SAFETY: safe if contract holds
        unsafe { munmap(ptr.cast(), len) == 0 }
    }

    /// # Safety
    /// range must lie inside a reservation
    #[inline]
    pub unsafe fn protect(ptr: *mut u8, len: usize, prot: i32) -> bool {
        // SAFETY: safe if contract holds
        unsafe { mprotect(ptr.cast(), len, prot) == 0 }
    }

    /// # Safety
    /// range must lie inside a reservation
    #[inline]
    pub unsafe fn discard(ptr: *mut u8, len: usize) -> bool {
        // SAFETY: safe if contract holds
        unsafe { madvise(ptr.cast(), len, MADV_DONTNEED) == 0 }
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Access mode of a committed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    NoAccess,
    Read,
    ReadWrite,
    ReadWriteExecute,
}

impl Protection {
    fn bits(self) -> i32 {
        match self {
            Protection::NoAccess => unix::PROT_NONE,
            Protection::Read => unix::PROT_READ,
            Protection::ReadWrite => unix::PROT_READ | unix::PROT_WRITE,
            Protection::ReadWriteExecute => {
                unix::PROT_READ | unix::PROT_WRITE | unix::PROT_EXEC
            }
        }
    }
}

/// Reserve `size` bytes of inaccessible address space, preferably at `hint`.
#[must_use]
pub fn reserve_memory(hint: usize, size: usize) -> Option<NonNull<u8>> {
    // SAFETY: a fresh anonymous mapping never aliases existing memory
    let ptr = unsafe { unix::reserve(hint as *mut u8, size) };
    NonNull::new(ptr)
}

/// Reserve `size` bytes aligned to `alignment` by over-reserving and
/// trimming the unaligned head and tail.
#[must_use]
pub fn reserve_aligned_memory(
    hint: usize,
    size: usize,
    alignment: usize,
) -> Option<NonNull<u8>> {
    debug_assert!(alignment.is_power_of_two());
    debug_assert!(size.is_multiple_of(OS_PAGE_SIZE));
    if alignment <= OS_PAGE_SIZE {
        return reserve_memory(hint, size);
    }
    let padded = size.checked_add(alignment)?;
    let raw = reserve_memory(hint, padded)?.as_ptr() as usize;
    let aligned = (raw + alignment - 1) & !(alignment - 1);
    let head = aligned - raw;
    let tail = padded - head - size;
    // SAFETY: both trims lie inside the mapping we just created
    unsafe {
        if head > 0 {
            unix::release(raw as *mut u8, head);
        }
        if tail > 0 {
            unix::release((aligned + size) as *mut u8, tail);
        }
    }
    NonNull::new(aligned as *mut u8)
}

/// Give a reservation back to the OS.
pub fn release_memory(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: ptr must be from a reservation of this size
    unsafe { unix::release(ptr.as_ptr(), size) }
}

/// Make `[ptr, ptr + size)` accessible with `protection`.
pub fn commit_memory(ptr: NonNull<u8>, size: usize, protection: Protection) -> bool {
    // SAFETY: ptr must point inside a reservation
    unsafe { unix::protect(ptr.as_ptr(), size, protection.bits()) }
}

/// Drop the physical pages behind `[ptr, ptr + size)` and make it
/// inaccessible. Reading it after a later commit yields zeroes.
pub fn uncommit_memory(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: ptr must point inside a reservation
    unsafe {
        unix::discard(ptr.as_ptr(), size)
            && unix::protect(ptr.as_ptr(), size, unix::PROT_NONE)
    }
}

/// Change the protection of an already committed range.
pub fn protect_memory(ptr: NonNull<u8>, size: usize, protection: Protection) -> bool {
    // SAFETY: ptr must point inside a reservation
    unsafe { unix::protect(ptr.as_ptr(), size, protection.bits()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_reservation_is_aligned() {
        let alignment = 1 << 20;
        let size = 1 << 20;
        let ptr = reserve_aligned_memory(0, size, alignment).unwrap();
        assert_eq!(ptr.as_ptr() as usize % alignment, 0);
        assert!(release_memory(ptr, size));
    }

    #[test]
    fn commit_then_write_then_uncommit() {
        let size = 4 * OS_PAGE_SIZE;
        let ptr = reserve_memory(0, size).unwrap();
        assert!(commit_memory(ptr, size, Protection::ReadWrite));
        unsafe {
            ptr.as_ptr().write(42);
            assert_eq!(ptr.as_ptr().read(), 42);
        }
        assert!(uncommit_memory(ptr, size));
        assert!(commit_memory(ptr, size, Protection::ReadWrite));
        unsafe { assert_eq!(ptr.as_ptr().read(), 0) };
        assert!(release_memory(ptr, size));
    }
}
