use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

/// The error returned when a [`BlockAllocator`] cannot satisfy a request.
///
/// Carries no payload; the failed [`Layout`] is known to the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("control block allocation failed")
    }
}

impl std::error::Error for AllocError {}

/// A source of memory for control blocks.
///
/// This is the allocator policy accepted by [`SharedPtr::new_in`] and friends.
/// The allocator is stored by value inside the control block it allocated, and
/// is the one used to free that block once the last weak reference goes away.
/// It therefore must be cheap to clone and safe to move across threads.
///
/// [`SharedPtr::new_in`]: crate::SharedPtr::new_in
pub trait BlockAllocator: Clone + Send + 'static {
    /// Allocate a block of memory described by `layout`.
    ///
    /// Returns a pointer that is valid for reads and writes of `layout.size()`
    /// bytes, or [`AllocError`] if the request cannot be satisfied. `layout`
    /// is never zero-sized here; every control block at least carries its
    /// reference counts.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Free a block previously returned by [`allocate`](BlockAllocator::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this allocator (or a
    /// clone of it), and `layout` must be the layout it was allocated with.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The default [`BlockAllocator`]: the global Rust allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultAllocator;

impl BlockAllocator for DefaultAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        // Safety: control block layouts are never zero-sized.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: forwarded directly from our own `deallocate` contract.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}
