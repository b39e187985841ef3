//! Public allocator type. [`crate::heap::Heap`] is a single mutator state
//! machine that needs `&mut` for everything, so the public surface wraps it
//! in a [`Mutex`] and exposes two faces: the explicit allocate / free /
//! reallocate / check methods, and a [`GlobalAlloc`] implementation so the
//! allocator can serve as `#[global_allocator]` for layouts it supports.

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{block::ALIGNMENT, check::Violation, heap::Heap, AllocError, Pointer};

/// Segregated-fit allocator over one growable memory region.
///
/// The first allocation initializes the heap lazily; [`Segalloc::init`] can
/// also be called explicitly, and calling it again throws every previous
/// allocation away and starts over on the same reservation.
///
/// # Examples
///
/// ```rust
/// use segalloc::Segalloc;
///
/// let allocator = Segalloc::new();
///
/// let address = allocator.allocate(128).unwrap();
///
/// unsafe {
///     // Payloads are always 8 byte aligned.
///     assert_eq!(address.as_ptr() as usize % 8, 0);
///
///     address.as_ptr().write_bytes(42, 128);
///     assert_eq!(address.as_ptr().read(), 42);
///
///     allocator.free(Some(address));
/// }
///
/// assert!(allocator.check());
/// ```
pub struct Segalloc {
    /// One global lock. Contention is not a concern for a single mutator
    /// design; the lock only exists so that [`GlobalAlloc`] can be
    /// implemented soundly.
    heap: Mutex<Heap>,
}

unsafe impl Send for Segalloc {}
unsafe impl Sync for Segalloc {}

impl Segalloc {
    /// Builds an allocator with no memory reserved yet.
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::new()),
        }
    }

    /// Sets up a fresh empty heap, reserving the backing region on first
    /// use. Any blocks handed out earlier become dangling.
    pub fn init(&self) -> Result<(), AllocError> {
        let mut heap = self.heap.lock().map_err(|_| AllocError)?;
        unsafe { heap.init() }
    }

    /// Allocates `size` bytes and returns the payload address. Returns
    /// `None` for zero sized requests and when the region cannot grow any
    /// further.
    pub fn allocate(&self, size: usize) -> Pointer<u8> {
        let mut heap = self.heap.lock().ok()?;
        unsafe { heap.allocate(size) }
    }

    /// Releases an allocation. `None` is accepted and does nothing.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by this allocator and not freed
    /// since.
    pub unsafe fn free(&self, address: Pointer<u8>) {
        let Some(address) = address else { return };

        if let Ok(mut heap) = self.heap.lock() {
            heap.free(address);
        }
    }

    /// Resizes an allocation, in place when possible. `None` behaves like
    /// [`Segalloc::allocate`], a size of zero frees, and a size that reads
    /// negative as a signed integer is refused.
    ///
    /// # Safety
    ///
    /// A `Some` address must have been returned by this allocator and not
    /// freed since.
    pub unsafe fn reallocate(&self, address: Pointer<u8>, size: usize) -> Pointer<u8> {
        let mut heap = self.heap.lock().ok()?;
        heap.reallocate(address, size)
    }

    /// Runs the consistency checker, printing any violation to stderr.
    /// Returns whether all structural invariants hold.
    pub fn check(&self) -> bool {
        match self.heap.lock() {
            Ok(heap) => heap.check(),
            Err(_) => false,
        }
    }

    /// Like [`Segalloc::check`] but silent, returning the violations.
    pub fn verify(&self) -> Vec<Violation> {
        match self.heap.lock() {
            Ok(heap) => heap.verify(),
            Err(_) => Vec::new(),
        }
    }

    /// Current heap size in bytes, bookkeeping included.
    pub fn heap_size(&self) -> usize {
        match self.heap.lock() {
            Ok(heap) => heap.size(),
            Err(_) => 0,
        }
    }

    /// Lowest address of the heap and the first address past it, or `None`
    /// before the heap exists. Every payload this allocator hands out lies
    /// strictly inside these bounds.
    pub fn heap_bounds(&self) -> Option<(NonNull<u8>, NonNull<u8>)> {
        let heap = self.heap.lock().ok()?;
        Some((heap.heap_lo()?, heap.heap_hi()?))
    }
}

impl Default for Segalloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for Segalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // The block format guarantees 8 byte alignment and nothing more.
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.allocate(layout.size()) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(NonNull::new(ptr));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.reallocate(NonNull::new(ptr), new_size) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}
