use crate::allocator::{AllocError, BlockAllocator};
use crate::sync::atomic::AtomicUsize;
use core::alloc::Layout;
use core::cell::Cell;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

/// A user-supplied deleter for values owned through external-storage control
/// blocks.
///
/// The deleter is stored by value in the control block and invoked exactly
/// once, when the last strong reference goes away. [`BoxDeleter`] is what
/// [`SharedPtr::from_box`](crate::SharedPtr::from_box) uses.
pub trait Deleter<T> {
    /// Destroy the value behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` is the pointer the deleter was registered for, no other reference
    /// to the value exists, and the deleter is called at most once.
    unsafe fn delete(&mut self, ptr: *mut T);
}

/// A [`Deleter`] for values that were allocated with [`Box`].
#[derive(Copy, Clone, Debug, Default)]
pub struct BoxDeleter;

impl<T> Deleter<T> for BoxDeleter {
    unsafe fn delete(&mut self, ptr: *mut T) {
        // Safety: the value was created by `Box::into_raw` per the contract of
        // the constructors that register this deleter.
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// Function-pointer vtable shared by every control block of one concrete
/// shape. The three slots mirror the three things a handle can ask of a block
/// it only knows by header address.
pub(crate) struct BlockVTable {
    /// Derive the erased value pointer from the header address.
    pub(crate) value: unsafe fn(*mut Header) -> *mut (),
    /// Destroy the value. Runs exactly once, when `strong` hits zero.
    pub(crate) destroy: unsafe fn(*mut Header),
    /// Free the block itself. Runs exactly once, when `weak` hits zero.
    pub(crate) dispose: unsafe fn(*mut Header),
}

/// The type-erased head of every control block.
///
/// Always the first field of a `#[repr(C)]` concrete block, so a `*mut Header`
/// and the block pointer are interchangeable.
///
/// Counter protocol: a block is born with `(strong, weak) = (1, 1)`. The weak
/// counter carries one unit held collectively by all strong references; it is
/// released by the terminal strong decrement, after `destroy`.
pub(crate) struct Header {
    strong: AtomicUsize,
    weak: AtomicUsize,
    /// Intrusive link for the per-thread deferred-destroy list. Only the
    /// thread that performed the terminal strong decrement touches this.
    pending: Cell<*mut Header>,
    vtable: &'static BlockVTable,
}

// Safety: the counters are atomic, the vtable is immutable, and `pending` is
// only accessed by the single thread that observed the strong counter reach
// zero (the counters guarantee that transition happens exactly once).
unsafe impl Send for Header {}
unsafe impl Sync for Header {}

impl Header {
    fn new(vtable: &'static BlockVTable) -> Self {
        Header {
            strong: AtomicUsize::new(1),
            weak: AtomicUsize::new(1),
            pending: Cell::new(core::ptr::null_mut()),
            vtable,
        }
    }

    /// Add one strong reference iff the counter is still nonzero.
    ///
    /// This is the only path that may revive a count that another thread is
    /// concurrently driving to zero; once zero has been observed by anyone,
    /// it fails forever.
    pub(crate) fn try_increment_strong(&self) -> bool {
        let mut n = self.strong.load(Ordering::Relaxed);
        while n != 0 {
            match self
                .strong
                .compare_exchange_weak(n, n + 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(now) => n = now,
            }
        }
        false
    }

    pub(crate) fn increment_strong(&self) {
        self.strong.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_weak(&self) {
        self.weak.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn use_count(&self) -> usize {
        self.strong.load(Ordering::Relaxed)
    }

    /// Fetch the erased value pointer.
    ///
    /// # Safety
    ///
    /// `this` must point to a live control block.
    pub(crate) unsafe fn value(this: *mut Header) -> *mut () {
        // Safety: per contract, the header (and thus its vtable) is live.
        unsafe { ((*this).vtable.value)(this) }
    }

    /// Release one strong reference; on the terminal transition, destroy the
    /// value and release the collective strong-held weak unit.
    ///
    /// # Safety
    ///
    /// The caller must own one strong unit on `this`.
    pub(crate) unsafe fn decrement_strong(this: *mut Header) {
        // Safety: a strong unit implies the block is live.
        if unsafe { &(*this).strong }.fetch_sub(1, Ordering::Release) == 1 {
            crate::sync::atomic::fence(Ordering::Acquire);
            // Safety: we observed the terminal transition, so destroy has not
            // run and no other thread can reach this path.
            unsafe { deferred_destroy(this) };
        }
    }

    /// Release one weak reference; on the terminal transition, free the block.
    ///
    /// # Safety
    ///
    /// The caller must own one weak unit on `this`.
    pub(crate) unsafe fn decrement_weak(this: *mut Header) {
        // Safety: a weak unit implies the block is live.
        if unsafe { &(*this).weak }.fetch_sub(1, Ordering::Release) == 1 {
            crate::sync::atomic::fence(Ordering::Acquire);
            // Safety: terminal weak transition happens exactly once, and
            // destroy already ran (the strong-held weak unit outlives it).
            unsafe { ((*this).vtable.dispose)(this) };
        }
    }
}

struct DestroyQueue {
    head: Cell<*mut Header>,
    in_progress: Cell<bool>,
}

#[cfg(not(loom))]
std::thread_local! {
    static DESTROY_QUEUE: DestroyQueue = const {
        DestroyQueue { head: Cell::new(core::ptr::null_mut()), in_progress: Cell::new(false) }
    };
}

#[cfg(loom)]
loom::thread_local! {
    static DESTROY_QUEUE: DestroyQueue =
        DestroyQueue { head: Cell::new(core::ptr::null_mut()), in_progress: Cell::new(false) };
}

/// Clears the in-progress flag even if a destructor panics mid-drain.
struct DrainGuard<'a>(&'a Cell<bool>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[cfg(not(loom))]
fn with_destroy_queue<R>(f: impl FnOnce(&DestroyQueue) -> R) -> Option<R> {
    DESTROY_QUEUE.try_with(f).ok()
}

#[cfg(loom)]
fn with_destroy_queue<R>(f: impl FnOnce(&DestroyQueue) -> R) -> Option<R> {
    Some(DESTROY_QUEUE.with(f))
}

/// Destroy the value of `this` without unbounded recursion.
///
/// A value may itself hold strong references (a linked list of nodes, say),
/// so running its destructor can trigger further terminal decrements. Those
/// are pushed onto a per-thread intrusive list and drained iteratively by the
/// outermost call, keeping stack depth constant no matter how deep the chain.
///
/// # Safety
///
/// `this` must be a live block whose strong counter was just observed to
/// reach zero by the calling thread.
unsafe fn deferred_destroy(this: *mut Header) {
    let queued = with_destroy_queue(|queue| {
        // Safety: only this thread reaches the terminal path for `this`.
        unsafe { &(*this).pending }.set(queue.head.get());
        queue.head.set(this);

        if queue.in_progress.get() {
            return;
        }
        queue.in_progress.set(true);
        let _reset = DrainGuard(&queue.in_progress);

        loop {
            let block = queue.head.get();
            if block.is_null() {
                break;
            }
            // Safety: blocks on the queue are live and each is drained
            // exactly once.
            unsafe {
                queue.head.set((*block).pending.get());
                ((*block).vtable.destroy)(block);
                Header::decrement_weak(block);
            }
        }
    })
    .is_some();

    if !queued {
        // The thread-local queue is already torn down (we are inside this
        // thread's exit path). Destroy directly; nesting depth is then bounded
        // by the ownership depth of values destroyed during thread exit.
        //
        // Safety: same as the queued path.
        unsafe {
            ((*this).vtable.destroy)(this);
            Header::decrement_weak(this);
        }
    }
}

/// An external-storage control block: the value was allocated elsewhere and is
/// owned through `value` plus the registered deleter.
#[repr(C)]
pub(crate) struct ExternalBlock<T, D: Deleter<T>, A: BlockAllocator> {
    header: Header,
    value: *mut T,
    deleter: ManuallyDrop<D>,
    alloc: ManuallyDrop<A>,
}

impl<T, D: Deleter<T>, A: BlockAllocator> ExternalBlock<T, D, A> {
    const VTABLE: BlockVTable = BlockVTable {
        value: Self::value_erased,
        destroy: Self::destroy_erased,
        dispose: Self::dispose_erased,
    };

    /// Allocate a block taking ownership of `value`.
    ///
    /// On allocation failure the deleter is invoked on `value` before the
    /// error propagates, so the caller never leaks the pointee.
    ///
    /// # Safety
    ///
    /// `value` must be valid for the deleter, and ownership of it transfers to
    /// this call.
    pub(crate) unsafe fn create(
        value: NonNull<T>,
        deleter: D,
        alloc: A,
    ) -> Result<NonNull<Header>, AllocError> {
        let layout = Layout::new::<Self>();
        let raw = match alloc.allocate(layout) {
            Ok(raw) => raw,
            Err(err) => {
                let mut deleter = deleter;
                // Safety: we own `value` and the deleter has not run.
                unsafe { deleter.delete(value.as_ptr()) };
                return Err(err);
            }
        };
        let block = raw.cast::<Self>();
        // Safety: `raw` is valid for writes of `Self` per the allocator
        // contract.
        unsafe {
            block.as_ptr().write(ExternalBlock {
                header: Header::new(&Self::VTABLE),
                value: value.as_ptr(),
                deleter: ManuallyDrop::new(deleter),
                alloc: ManuallyDrop::new(alloc),
            });
        }
        Ok(block.cast::<Header>())
    }

    unsafe fn value_erased(header: *mut Header) -> *mut () {
        let this = header as *mut Self;
        // Safety: the block is live per the vtable contract.
        unsafe { (*this).value as *mut () }
    }

    unsafe fn destroy_erased(header: *mut Header) {
        let this = header as *mut Self;
        // Safety: destroy runs exactly once, so taking the deleter out of its
        // ManuallyDrop slot is fine; the value pointer is the one registered.
        unsafe {
            let mut deleter = ManuallyDrop::take(&mut (*this).deleter);
            deleter.delete((*this).value);
        }
    }

    unsafe fn dispose_erased(header: *mut Header) {
        let this = header as *mut Self;
        // Safety: dispose runs exactly once and last, so the allocator can be
        // moved out before the block memory is released through it.
        unsafe {
            let alloc = ManuallyDrop::take(&mut (*this).alloc);
            alloc.deallocate(
                NonNull::new_unchecked(this as *mut u8),
                Layout::new::<Self>(),
            );
        }
    }
}

/// An inplace control block: the value lives inside the block, so one
/// allocation covers both.
#[repr(C)]
pub(crate) struct InplaceBlock<T, A: BlockAllocator> {
    header: Header,
    value: core::cell::UnsafeCell<core::mem::MaybeUninit<T>>,
    alloc: ManuallyDrop<A>,
}

impl<T, A: BlockAllocator> InplaceBlock<T, A> {
    const VTABLE: BlockVTable = BlockVTable {
        value: Self::value_erased,
        destroy: Self::destroy_erased,
        dispose: Self::dispose_erased,
    };

    /// Allocate a block and move `value` into it.
    ///
    /// On allocation failure `value` is dropped and the error propagates.
    pub(crate) fn create(value: T, alloc: A) -> Result<NonNull<Header>, AllocError> {
        let layout = Layout::new::<Self>();
        let raw = alloc.allocate(layout)?;
        let block = raw.cast::<Self>();
        // Safety: `raw` is valid for writes of `Self` per the allocator
        // contract.
        unsafe {
            block.as_ptr().write(InplaceBlock {
                header: Header::new(&Self::VTABLE),
                value: core::cell::UnsafeCell::new(core::mem::MaybeUninit::new(value)),
                alloc: ManuallyDrop::new(alloc),
            });
        }
        Ok(block.cast::<Header>())
    }

    unsafe fn value_erased(header: *mut Header) -> *mut () {
        let this = header as *mut Self;
        // Safety: the block is live per the vtable contract.
        unsafe { (*this).value.get() as *mut () }
    }

    unsafe fn destroy_erased(header: *mut Header) {
        let this = header as *mut Self;
        // Safety: destroy runs exactly once, and the value was initialized by
        // `create`.
        unsafe { core::ptr::drop_in_place((*this).value.get() as *mut T) };
    }

    unsafe fn dispose_erased(header: *mut Header) {
        let this = header as *mut Self;
        // Safety: dispose runs exactly once and last.
        unsafe {
            let alloc = ManuallyDrop::take(&mut (*this).alloc);
            alloc.deallocate(
                NonNull::new_unchecked(this as *mut u8),
                Layout::new::<Self>(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::DefaultAllocator;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;

    struct CountDrops(Arc<StdAtomicUsize>);
    impl Drop for CountDrops {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn inplace_destroy_then_dispose() {
        let drops = Arc::new(StdAtomicUsize::new(0));
        let header = InplaceBlock::create(CountDrops(Arc::clone(&drops)), DefaultAllocator)
            .unwrap()
            .as_ptr();

        assert_eq!(unsafe { &*header }.use_count(), 1);
        unsafe { Header::decrement_strong(header) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn external_runs_deleter_once() {
        let drops = Arc::new(StdAtomicUsize::new(0));
        let value = Box::into_raw(Box::new(CountDrops(Arc::clone(&drops))));
        let header = unsafe {
            ExternalBlock::create(
                NonNull::new(value).unwrap(),
                BoxDeleter,
                DefaultAllocator,
            )
        }
        .unwrap()
        .as_ptr();

        unsafe { Header::decrement_strong(header) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn try_increment_fails_after_zero() {
        let header = InplaceBlock::create(7usize, DefaultAllocator)
            .unwrap()
            .as_ptr();

        // Keep the block alive through an extra weak unit.
        unsafe { &*header }.increment_weak();
        assert!(unsafe { &*header }.try_increment_strong());
        unsafe { Header::decrement_strong(header) };
        unsafe { Header::decrement_strong(header) };

        assert!(!unsafe { &*header }.try_increment_strong());
        assert!(!unsafe { &*header }.try_increment_strong());
        unsafe { Header::decrement_weak(header) };
    }

    #[test]
    fn weak_unit_keeps_block_allocated() {
        let drops = Arc::new(StdAtomicUsize::new(0));
        let header = InplaceBlock::create(CountDrops(Arc::clone(&drops)), DefaultAllocator)
            .unwrap()
            .as_ptr();

        unsafe { &*header }.increment_weak();
        unsafe { Header::decrement_strong(header) };
        // Value destroyed, block still addressable through the weak unit.
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(unsafe { &*header }.use_count(), 0);
        unsafe { Header::decrement_weak(header) };
    }
}
