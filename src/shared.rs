use crate::allocator::{AllocError, BlockAllocator, DefaultAllocator};
use crate::block::{BoxDeleter, Deleter, ExternalBlock, Header, InplaceBlock};
use crate::weak::WeakPtr;
use core::alloc::Layout;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;

/// A strong shared-ownership pointer, the atomically-publishable sibling of
/// [`Arc`](std::sync::Arc).
///
/// A `SharedPtr<T>` owns exactly one strong unit on its control block; cloning
/// adds a unit, dropping releases one, and the value is destroyed when the
/// last unit goes away. What sets it apart from `Arc` is that a `SharedPtr`
/// can be stored in an [`AtomicSharedPtr`](crate::AtomicSharedPtr) cell and
/// loaded, swapped, and compare-exchanged by concurrent threads without locks;
/// the price is a control block that is always a separate object reached
/// through type-erased function pointers.
///
/// `SharedPtr` is never null. Wherever the pointer may be absent — empty
/// atomic cells, failed weak upgrades — the API uses `Option<SharedPtr<T>>`.
///
/// Reference cycles through strong pointers are not collected; break them with
/// [`WeakPtr`].
pub struct SharedPtr<T> {
    header: NonNull<Header>,
    value: NonNull<T>,
    _marker: PhantomData<T>,
}

// Safety: same reasoning as Arc. A handle can move to (or be shared with)
// another thread only if the value itself may be accessed and dropped there.
unsafe impl<T: Send + Sync> Send for SharedPtr<T> {}
unsafe impl<T: Send + Sync> Sync for SharedPtr<T> {}

impl<T> SharedPtr<T> {
    /// Construct a new `SharedPtr` with the value stored inplace in its
    /// control block (a single allocation).
    pub fn new(value: T) -> Self {
        match Self::try_new_in(value, DefaultAllocator) {
            Ok(this) => this,
            Err(_) => std::alloc::handle_alloc_error(Layout::new::<T>()),
        }
    }

    /// Like [`SharedPtr::new`], with the control block allocated through
    /// `alloc`. Calls [`handle_alloc_error`](std::alloc::handle_alloc_error)
    /// on failure; see [`SharedPtr::try_new_in`] for the fallible variant.
    pub fn new_in<A: BlockAllocator>(value: T, alloc: A) -> Self {
        match Self::try_new_in(value, alloc) {
            Ok(this) => this,
            Err(_) => std::alloc::handle_alloc_error(Layout::new::<T>()),
        }
    }

    /// Fallible inplace construction. On allocation failure the value is
    /// dropped and the allocator's failure is returned.
    pub fn try_new_in<A: BlockAllocator>(value: T, alloc: A) -> Result<Self, AllocError> {
        let header = InplaceBlock::create(value, alloc)?;
        // Safety: the block was just created with one strong unit, which this
        // handle now owns.
        Ok(unsafe { Self::from_header(header) })
    }

    /// Take ownership of a boxed value through an external-storage control
    /// block. The value is later destroyed by reconstructing the [`Box`].
    pub fn from_box(value: Box<T>) -> Self {
        // Safety: `Box::into_raw` yields a non-null pointer that BoxDeleter
        // may reclaim, and ownership transfers here.
        let raw = unsafe { NonNull::new_unchecked(Box::into_raw(value)) };
        match unsafe { Self::try_from_raw_in(raw, BoxDeleter, DefaultAllocator) } {
            Ok(this) => this,
            Err(_) => std::alloc::handle_alloc_error(Layout::new::<T>()),
        }
    }

    /// Take ownership of a raw value, destroying it through `deleter` once the
    /// last strong reference goes away.
    ///
    /// # Safety
    ///
    /// `value` must be valid as `&T` for as long as strong references exist,
    /// ownership of it must transfer to this call, and `deleter` must be a
    /// correct way to destroy it.
    pub unsafe fn from_raw_with<D: Deleter<T>>(value: NonNull<T>, deleter: D) -> Self {
        // Safety: forwarded from our own contract.
        match unsafe { Self::try_from_raw_in(value, deleter, DefaultAllocator) } {
            Ok(this) => this,
            Err(_) => std::alloc::handle_alloc_error(Layout::new::<T>()),
        }
    }

    /// Fallible variant of [`SharedPtr::from_raw_with`] with an explicit
    /// control-block allocator.
    ///
    /// If the control block cannot be allocated, `deleter` is invoked on
    /// `value` before the error is returned, so the pointee never leaks.
    ///
    /// # Safety
    ///
    /// Same contract as [`SharedPtr::from_raw_with`].
    pub unsafe fn try_from_raw_in<D: Deleter<T>, A: BlockAllocator>(
        value: NonNull<T>,
        deleter: D,
        alloc: A,
    ) -> Result<Self, AllocError> {
        // Safety: forwarded from our own contract.
        let header = unsafe { ExternalBlock::create(value, deleter, alloc)? };
        // Safety: fresh block, one strong unit, owned by this handle.
        Ok(unsafe { Self::from_header(header) })
    }

    /// Construct a handle from a header whose strong unit the caller owns.
    ///
    /// # Safety
    ///
    /// `header` must point to a live control block and the caller must
    /// transfer exactly one strong unit to the new handle.
    pub(crate) unsafe fn from_header(header: NonNull<Header>) -> Self {
        // Safety: the block is live per contract, and the erased value
        // pointer of a block is always non-null.
        let value = unsafe { NonNull::new_unchecked(Header::value(header.as_ptr()) as *mut T) };
        SharedPtr {
            header,
            value,
            _marker: PhantomData,
        }
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: our strong unit keeps the block alive.
        unsafe { self.header.as_ref() }
    }

    pub(crate) fn header_ptr(&self) -> *mut Header {
        self.header.as_ptr()
    }

    /// Consume `this`, returning the raw header pointer (null for `None`)
    /// together with its strong unit.
    pub(crate) fn into_header(this: Option<Self>) -> *mut Header {
        match this {
            Some(this) => {
                let header = this.header.as_ptr();
                core::mem::forget(this);
                header
            }
            None => core::ptr::null_mut(),
        }
    }

    /// The number of strong references, including units held by atomic cells.
    ///
    /// Like [`Arc::strong_count`](std::sync::Arc::strong_count), this is a
    /// racy snapshot; it is reliable only at quiescent points.
    pub fn use_count(&self) -> usize {
        self.header().use_count()
    }

    /// The raw value pointer. Comparison and ordering of handles go through
    /// this pointer, not the control block.
    pub fn as_ptr(&self) -> *const T {
        self.value.as_ptr()
    }

    /// Create a non-owning [`WeakPtr`] to the same value.
    pub fn downgrade(this: &Self) -> WeakPtr<T> {
        this.header().increment_weak();
        // Safety: the weak unit we just added transfers to the new handle.
        unsafe { WeakPtr::from_parts(this.header, this.value) }
    }

    /// Whether two handles point at the same value.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.value == other.value
    }
}

impl<T> Clone for SharedPtr<T> {
    fn clone(&self) -> Self {
        self.header().increment_strong();
        SharedPtr {
            header: self.header,
            value: self.value,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for SharedPtr<T> {
    fn drop(&mut self) {
        // Safety: this handle owns one strong unit.
        unsafe { Header::decrement_strong(self.header.as_ptr()) };
    }
}

impl<T> Deref for SharedPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: our strong unit keeps the value alive and initialized.
        unsafe { self.value.as_ref() }
    }
}

impl<T> PartialEq for SharedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Eq for SharedPtr<T> {}

impl<T> PartialOrd for SharedPtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for SharedPtr<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.value.as_ptr() as usize).cmp(&(other.value.as_ptr() as usize))
    }
}

impl<T> Hash for SharedPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.value.as_ptr() as usize).hash(state);
    }
}

impl<T> fmt::Debug for SharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedPtr").field(&self.value).finish()
    }
}

impl<T> From<Box<T>> for SharedPtr<T> {
    fn from(value: Box<T>) -> Self {
        SharedPtr::from_box(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountDrops(Arc<AtomicUsize>);
    impl Drop for CountDrops {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn clone_and_drop_accounting() {
        let drops = Arc::new(AtomicUsize::new(0));
        let a = SharedPtr::new(CountDrops(Arc::clone(&drops)));
        assert_eq!(a.use_count(), 1);

        let b = a.clone();
        assert_eq!(a.use_count(), 2);
        assert!(SharedPtr::ptr_eq(&a, &b));

        drop(b);
        assert_eq!(a.use_count(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(a);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn from_box_uses_box_deleter() {
        let drops = Arc::new(AtomicUsize::new(0));
        let a = SharedPtr::from_box(Box::new(CountDrops(Arc::clone(&drops))));
        drop(a);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn custom_deleter_runs_once() {
        struct CountingDeleter(Arc<AtomicUsize>);
        impl Deleter<usize> for CountingDeleter {
            unsafe fn delete(&mut self, ptr: *mut usize) {
                self.0.fetch_add(1, Ordering::SeqCst);
                drop(unsafe { Box::from_raw(ptr) });
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let raw = NonNull::new(Box::into_raw(Box::new(31usize))).unwrap();
        let a =
            unsafe { SharedPtr::from_raw_with(raw, CountingDeleter(Arc::clone(&drops))) };
        assert_eq!(*a, 31);
        let b = a.clone();
        drop(a);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ordering_follows_value_pointer() {
        let a = SharedPtr::new(1);
        let b = SharedPtr::new(2);
        assert_ne!(a, b);
        assert_eq!(a.cmp(&b), (a.as_ptr() as usize).cmp(&(b.as_ptr() as usize)));
        assert_eq!(a, a.clone());
    }
}
