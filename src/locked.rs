//! A spin-locked allocator for use as a kernel- or process-wide heap.

use core::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    ptr::{self, NonNull},
};

use crate::{AllocError, AllocInitError, Buddy, Raw, LEAF_SIZE};

/// A spin-locked buddy allocator that can serve as the global allocator.
///
/// The allocator starts empty so that it can be constructed in a `static`;
/// memory is handed to it exactly once via [`init`]. Every operation takes
/// the lock for the duration of one allocate or free — a bounded,
/// non-blocking critical section — which serializes all mutation of the
/// shared heap.
///
/// [`init`]: LockedBuddy::init
///
/// # Example
///
/// ```no_run
/// use coal_alloc::LockedBuddy;
///
/// #[global_allocator]
/// static HEAP: LockedBuddy = LockedBuddy::empty();
///
/// // During bring-up, before the first allocation:
/// // unsafe { HEAP.init(region, region_len).unwrap() };
/// ```
pub struct LockedBuddy {
    inner: spin::Mutex<Option<Buddy<Raw>>>,
}

impl LockedBuddy {
    /// Creates an allocator with no memory; every allocation fails until
    /// [`init`] is called.
    ///
    /// [`init`]: LockedBuddy::init
    pub const fn empty() -> LockedBuddy {
        LockedBuddy {
            inner: spin::Mutex::new(None),
        }
    }

    /// Hands the `size` bytes at `region` to the allocator.
    ///
    /// # Errors
    ///
    /// Returns an error under the same conditions as [`Buddy::new_raw`].
    ///
    /// # Panics
    ///
    /// Panics if the allocator already holds a region.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `size` bytes, and
    /// must not be accessed except through the allocator for the
    /// allocator's lifetime.
    pub unsafe fn init(&self, region: NonNull<u8>, size: usize) -> Result<(), AllocInitError> {
        let mut inner = self.inner.lock();
        assert!(inner.is_none(), "allocator already initialized");

        *inner = Some(unsafe { Buddy::new_raw(region, size)? });
        Ok(())
    }

    /// Allocates a block of at least `size` bytes. See [`Buddy::allocate`].
    ///
    /// # Errors
    ///
    /// Returns `Err` on exhaustion or if the allocator is uninitialized.
    pub fn allocate(&self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.inner.lock().as_mut().ok_or(AllocError)?.allocate(size)
    }

    /// Returns a block to the allocator. See [`Buddy::deallocate`].
    ///
    /// # Safety
    ///
    /// `block` must denote a block of memory currently allocated by this
    /// allocator.
    pub unsafe fn deallocate(&self, block: NonNull<u8>) {
        let mut inner = self.inner.lock();
        let heap = inner
            .as_mut()
            .expect("deallocate on an uninitialized allocator");

        unsafe { heap.deallocate(block) };
    }
}

unsafe impl GlobalAlloc for LockedBuddy {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Blocks are only guaranteed leaf alignment; stricter layouts
        // cannot be honored.
        if layout.align() > LEAF_SIZE {
            return ptr::null_mut();
        }

        match self.allocate(layout.size()) {
            Ok(block) => block.as_ptr() as *mut u8,
            Err(AllocError) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(block) = NonNull::new(ptr) {
            unsafe { self.deallocate(block) };
        }
    }
}

impl fmt::Debug for LockedBuddy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(inner) => f.debug_tuple("LockedBuddy").field(&*inner).finish(),
            None => f.write_str("LockedBuddy(<locked>)"),
        }
    }
}
