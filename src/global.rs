//! Optional facade for installing one allocator instance as the process
//! allocator. The core allocators take `&mut self` and know nothing about
//! threads, so the facade wraps them in a spin mutex; that is the only
//! piece of this crate that synchronizes anything, and the only one that
//! speaks [`GlobalAlloc`].

use core::{
    alloc::{GlobalAlloc, Layout},
    mem, ptr,
};

use spin::{Mutex, MutexGuard};

use crate::{align::Aligner, allocator::Allocator, block::Header, freelist::FreeListAllocator};

/// A spin-locked allocator wrapper.
///
/// ```rust,no_run
/// use carve::{ConstantAligner, FreeListAllocator, Locked};
///
/// #[global_allocator]
/// static HEAP: Locked<FreeListAllocator<ConstantAligner<8>>> =
///     Locked::new(FreeListAllocator::new());
///
/// fn main() {
///     // Early in startup, before the first Box or Vec is created:
///     // unsafe { HEAP.lock().init(base, limit).unwrap() };
/// }
/// ```
pub struct Locked<A> {
    inner: Mutex<A>,
}

impl<A> Locked<A> {
    pub const fn new(inner: A) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Grants exclusive access to the wrapped allocator, e.g. for `init`.
    pub fn lock(&self) -> MutexGuard<'_, A> {
        self.inner.lock()
    }
}

// Only the free list allocator serves arbitrary sizes, so it is the one
// strategy that makes sense behind `GlobalAlloc`. Its payloads are always
// aligned to the block header, never beyond, so stricter layouts must be
// refused rather than silently violated.
unsafe impl<A: Aligner> GlobalAlloc for Locked<FreeListAllocator<A>> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > mem::align_of::<Header>() {
            return ptr::null_mut();
        }

        match self.lock().allocate(layout.size()) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, pointer: *mut u8, _layout: Layout) {
        self.lock().free(pointer);
    }
}
