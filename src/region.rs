//! The growable region that backs the heap. The placement engine needs a
//! very small contract from its memory provider: a contiguous range that
//! starts empty, grows at the high end by whatever increment is asked for,
//! and never moves. That is the classic `sbrk` interface:
//!
//! ```text
//!   base                              base + brk         base + MAX_HEAP
//!    |                                    |                     |
//!    v                                    v                     v
//!    +------------------------------------+---------------------+
//!    |  heap bytes handed to the engine   |  reserved, untouched |
//!    +------------------------------------+---------------------+
//!                                         ^
//!                                         |
//!                    sbrk(n) returns this address and moves
//!                    the break n bytes to the right.
//! ```
//!
//! Instead of calling the real `sbrk` (which would fight with anything else
//! in the process that touches the program break), we reserve one fixed
//! range of [`MAX_HEAP`] bytes from the platform up front and bump a break
//! offset inside it. The pages are not committed until written, so the
//! reservation is cheap regardless of how much of it the heap ever uses.

use std::ptr::NonNull;

use crate::{platform, AllocError, Pointer};

/// Size of the backing reservation. Growth past this point fails, which is
/// how allocation failure is exercised at all.
pub(crate) const MAX_HEAP: usize = 20 * 1024 * 1024;

/// An sbrk-style memory provider: one fixed reservation and a monotonic
/// break offset. Dropping the region returns the reservation to the kernel.
pub(crate) struct Region {
    /// Start of the reservation. `None` until the first [`Region::init`].
    base: Pointer<u8>,
    /// Current break as a byte offset from `base`.
    brk: usize,
}

impl Region {
    pub const fn new() -> Self {
        Self { base: None, brk: 0 }
    }

    /// Resets the region so that the next [`Region::sbrk`] returns `base`.
    /// The backing range is reserved on first use and kept afterwards, so
    /// resetting an already initialized region is just rewinding the break.
    pub unsafe fn init(&mut self) -> Result<(), AllocError> {
        if self.base.is_none() {
            self.base = platform::reserve(MAX_HEAP);
        }

        self.brk = 0;

        match self.base {
            Some(_) => Ok(()),
            None => Err(AllocError),
        }
    }

    /// Extends the region by exactly `increment` bytes, returning a pointer
    /// to the first new byte, or `None` once the reservation is exhausted.
    pub unsafe fn sbrk(&mut self, increment: usize) -> Pointer<u8> {
        let base = self.base?;

        if increment > MAX_HEAP - self.brk {
            return None;
        }

        let address = NonNull::new_unchecked(base.as_ptr().add(self.brk));
        self.brk += increment;

        Some(address)
    }

    /// Start of the region.
    ///
    /// # Safety
    ///
    /// Callers must ensure [`Region::init`] has succeeded before.
    #[inline]
    pub unsafe fn start(&self) -> NonNull<u8> {
        self.base.unwrap_unchecked()
    }

    /// Lowest address of the region, or `None` before initialization.
    #[inline]
    pub fn heap_lo(&self) -> Pointer<u8> {
        self.base
    }

    /// First address past the region, or `None` before initialization.
    #[inline]
    pub fn heap_hi(&self) -> Pointer<u8> {
        let base = self.base?;
        unsafe { Some(NonNull::new_unchecked(base.as_ptr().add(self.brk))) }
    }

    /// Current number of bytes between the base and the break.
    #[inline]
    pub fn size(&self) -> usize {
        self.brk
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(base) = self.base {
            unsafe { platform::release(base, MAX_HEAP) };
        }
    }
}
