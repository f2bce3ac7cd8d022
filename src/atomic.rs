use crate::block::Header;
use crate::domain::{DefaultPolicy, Disposer, Domain, Policy};
use crate::shared::SharedPtr;
use crate::sync::atomic::AtomicPtr;
use crate::weak::WeakPtr;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::Ordering;

/// The compile-time binding from an atomic pointer cell to the reclamation
/// domain its deferred decrements go through.
///
/// Cells never decrement a replaced pointer's counter directly: a concurrent
/// `load` may hold the raw control-block pointer between its hazard
/// validation and its counter increment, so the decrement that could destroy
/// the block is retired into a [`Domain`] and runs only once no hazard
/// references the block. The reclaimer names that domain. Readers and writers
/// of the same cell always agree on it because it is part of the cell's type.
pub trait Reclaimer: 'static {
    /// The policy of the bound domain.
    type Policy: Policy;

    /// The domain all cells with this reclaimer protect and retire through.
    fn domain() -> &'static Domain<Self::Policy>;
}

/// The [`Reclaimer`] binding cells to [`Domain::global`].
pub struct DefaultReclaimer;

impl Reclaimer for DefaultReclaimer {
    type Policy = DefaultPolicy;

    fn domain() -> &'static Domain<DefaultPolicy> {
        Domain::global()
    }
}

/// Deferred release of one strong unit.
struct StrongUnit;

impl Disposer<Header> for StrongUnit {
    unsafe fn dispose(ptr: *mut Header) {
        // Safety: the retiring cell owned this unit, and the domain proved
        // the block hazard-free.
        unsafe { Header::decrement_strong(ptr) };
    }
}

/// Deferred release of one weak unit.
struct WeakUnit;

impl Disposer<Header> for WeakUnit {
    unsafe fn dispose(ptr: *mut Header) {
        // Safety: as for StrongUnit.
        unsafe { Header::decrement_weak(ptr) };
    }
}

/// Retire a strong decrement on `header`.
///
/// # Safety
///
/// The caller must transfer ownership of one strong unit on `header`.
unsafe fn retire_strong<R: Reclaimer>(header: *mut Header) {
    // Safety: forwarded; Header is the domain's pointee type here.
    unsafe { R::domain().retire::<Header, StrongUnit>(header) };
}

/// Retire a weak decrement on `header`.
///
/// # Safety
///
/// The caller must transfer ownership of one weak unit on `header`.
unsafe fn retire_weak<R: Reclaimer>(header: *mut Header) {
    // Safety: forwarded.
    unsafe { R::domain().retire::<Header, WeakUnit>(header) };
}

/// An atomic cell holding an optional [`SharedPtr`], supporting lock-free
/// concurrent `load`, `store`, `swap`, and `compare_exchange`.
///
/// The cell stores the raw control-block pointer of the shared pointer and
/// logically owns one strong unit on it. Replacing the stored pointer
/// (`store`, successful `compare_exchange`, dropping the cell) does not
/// release that unit immediately; the decrement is retired through the
/// [`Reclaimer`]'s domain and deferred until no in-flight `load` can still
/// touch the block. `load` publishes a hazard, re-validates, and then adds a
/// strong unit conditionally, so it returns either a handle that shares
/// ownership of a value the cell really held, or `None`.
///
/// Cells are neither clonable nor movable once shared; they live inside the
/// nodes of lock-free data structures:
///
/// ```
/// use hazarc::{AtomicSharedPtr, SharedPtr};
///
/// struct Node {
///     value: u64,
///     next: AtomicSharedPtr<Node>,
/// }
///
/// let head: AtomicSharedPtr<Node> = AtomicSharedPtr::default();
/// head.store(Some(SharedPtr::new(Node {
///     value: 1,
///     next: AtomicSharedPtr::default(),
/// })));
/// assert_eq!(head.load().unwrap().value, 1);
/// ```
pub struct AtomicSharedPtr<T, R: Reclaimer = DefaultReclaimer> {
    block: AtomicPtr<Header>,
    _marker: PhantomData<(SharedPtr<T>, R)>,
}

// Safety: a cell hands out clones of the handles stored into it, so the
// bounds are those under which SharedPtr itself may cross threads.
unsafe impl<T: Send + Sync, R: Reclaimer> Send for AtomicSharedPtr<T, R> {}
unsafe impl<T: Send + Sync, R: Reclaimer> Sync for AtomicSharedPtr<T, R> {}

impl<T: Send + Sync, R: Reclaimer> AtomicSharedPtr<T, R> {
    /// Whether operations on cells of this type are lock-free. They are.
    pub const IS_ALWAYS_LOCK_FREE: bool = true;

    /// Construct a cell holding `ptr`.
    pub fn new(ptr: Option<SharedPtr<T>>) -> Self {
        AtomicSharedPtr {
            block: AtomicPtr::new(SharedPtr::into_header(ptr)),
            _marker: PhantomData,
        }
    }

    pub fn is_lock_free(&self) -> bool {
        true
    }

    /// Load the stored pointer as a fresh owning handle, or `None` if the
    /// cell is empty.
    ///
    /// The handle aliases whatever value a linearizable point of this call
    /// observed in the cell; the hazard published for the duration keeps the
    /// control block alive until the handle owns its own unit.
    pub fn load(&self) -> Option<SharedPtr<T>> {
        let guard = R::domain().protect(&self.block);
        let header = guard.get();
        if header.is_null() {
            return None;
        }
        // Safety: the hazard keeps the block from being disposed.
        if !unsafe { &*header }.try_increment_strong() {
            return None;
        }
        // Safety: the increment above is the unit this handle owns.
        Some(unsafe { SharedPtr::from_header(core::ptr::NonNull::new_unchecked(header)) })
    }

    /// Store `ptr`, retiring a deferred strong decrement on the previously
    /// stored pointer.
    pub fn store(&self, ptr: Option<SharedPtr<T>>) {
        let old = self.block.swap(SharedPtr::into_header(ptr), Ordering::SeqCst);
        if !old.is_null() {
            // Safety: the cell owned one strong unit on `old`.
            unsafe { retire_strong::<R>(old) };
        }
    }

    /// Replace the stored pointer with `ptr`, returning the old one.
    ///
    /// No deferral is needed here: the cell's unit on the old block transfers
    /// directly to the returned handle.
    pub fn swap(&self, ptr: Option<SharedPtr<T>>) -> Option<SharedPtr<T>> {
        let old = self.block.swap(SharedPtr::into_header(ptr), Ordering::SeqCst);
        // Safety: the cell's unit on `old` transfers to the handle.
        core::ptr::NonNull::new(old).map(|header| unsafe { SharedPtr::from_header(header) })
    }

    /// Atomically replace `current` with `new` if the cell still holds
    /// `current`'s pointer.
    ///
    /// On success, the cell's unit on the replaced pointer is retired, `new`
    /// is consumed, and `true` is returned (`current` is untouched and keeps
    /// its own unit). On failure, `new` is dropped, `current` is reloaded
    /// from the cell through a fresh hazard-protected [`load`], and `false`
    /// is returned.
    ///
    /// The comparison is by pointer identity of the control block, and the
    /// underlying compare-exchange is the strong variant: a `false` means the
    /// cell really held something else.
    ///
    /// [`load`]: AtomicSharedPtr::load
    pub fn compare_exchange(
        &self,
        current: &mut Option<SharedPtr<T>>,
        new: Option<SharedPtr<T>>,
    ) -> bool {
        let expected = current.as_ref().map_or(core::ptr::null_mut(), SharedPtr::header_ptr);
        let desired = new.as_ref().map_or(core::ptr::null_mut(), SharedPtr::header_ptr);
        match self
            .block
            .compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(old) => {
                if !old.is_null() {
                    // Safety: the cell owned one strong unit on `old`.
                    unsafe { retire_strong::<R>(old) };
                }
                // The cell took over `new`'s unit.
                core::mem::forget(new);
                true
            }
            Err(_) => {
                drop(new);
                *current = self.load();
                false
            }
        }
    }
}

impl<T: Send + Sync, R: Reclaimer> Default for AtomicSharedPtr<T, R> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T, R: Reclaimer> Drop for AtomicSharedPtr<T, R> {
    fn drop(&mut self) {
        let old = self.block.load(Ordering::SeqCst);
        if !old.is_null() {
            // Retire rather than decrement: a load that already validated its
            // hazard against this cell may still be about to read the
            // counter.
            //
            // Safety: the cell owned one strong unit on `old`.
            unsafe { retire_strong::<R>(old) };
        }
    }
}

impl<T: Send + Sync, R: Reclaimer> From<SharedPtr<T>> for AtomicSharedPtr<T, R> {
    fn from(ptr: SharedPtr<T>) -> Self {
        Self::new(Some(ptr))
    }
}

impl<T, R: Reclaimer> fmt::Debug for AtomicSharedPtr<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicSharedPtr")
            .field(&self.block.load(Ordering::Relaxed))
            .finish()
    }
}

/// The weak counterpart of [`AtomicSharedPtr`]: an atomic cell holding an
/// optional [`WeakPtr`], owning one weak unit on its pointee.
///
/// The deferral story is identical, with weak decrements retired instead of
/// strong ones. `load` increments the weak counter under the hazard (always
/// possible while the cell's own unit is outstanding), so it never observes a
/// freed block; whether the value is still alive is decided later by
/// [`WeakPtr::upgrade`].
pub struct AtomicWeakPtr<T, R: Reclaimer = DefaultReclaimer> {
    block: AtomicPtr<Header>,
    _marker: PhantomData<(WeakPtr<T>, R)>,
}

// Safety: as for AtomicSharedPtr.
unsafe impl<T: Send + Sync, R: Reclaimer> Send for AtomicWeakPtr<T, R> {}
unsafe impl<T: Send + Sync, R: Reclaimer> Sync for AtomicWeakPtr<T, R> {}

impl<T: Send + Sync, R: Reclaimer> AtomicWeakPtr<T, R> {
    /// Whether operations on cells of this type are lock-free. They are.
    pub const IS_ALWAYS_LOCK_FREE: bool = true;

    /// Construct a cell holding `ptr`.
    pub fn new(ptr: Option<WeakPtr<T>>) -> Self {
        AtomicWeakPtr {
            block: AtomicPtr::new(WeakPtr::into_header(ptr)),
            _marker: PhantomData,
        }
    }

    pub fn is_lock_free(&self) -> bool {
        true
    }

    /// Load the stored weak pointer as a fresh handle, or `None` if the cell
    /// is empty.
    pub fn load(&self) -> Option<WeakPtr<T>> {
        let guard = R::domain().protect(&self.block);
        let header = guard.get();
        if header.is_null() {
            return None;
        }
        // Safety: the hazard keeps the block from being disposed, and the
        // cell's outstanding weak unit keeps the weak count nonzero.
        unsafe { &*header }.increment_weak();
        // Safety: the increment above is the unit this handle owns.
        Some(unsafe { WeakPtr::from_header(core::ptr::NonNull::new_unchecked(header)) })
    }

    /// Store `ptr`, retiring a deferred weak decrement on the previously
    /// stored pointer.
    pub fn store(&self, ptr: Option<WeakPtr<T>>) {
        let old = self.block.swap(WeakPtr::into_header(ptr), Ordering::SeqCst);
        if !old.is_null() {
            // Safety: the cell owned one weak unit on `old`.
            unsafe { retire_weak::<R>(old) };
        }
    }

    /// Replace the stored pointer with `ptr`, returning the old one; the
    /// cell's unit transfers directly to the returned handle.
    pub fn swap(&self, ptr: Option<WeakPtr<T>>) -> Option<WeakPtr<T>> {
        let old = self.block.swap(WeakPtr::into_header(ptr), Ordering::SeqCst);
        // Safety: the cell's unit on `old` transfers to the handle.
        core::ptr::NonNull::new(old).map(|header| unsafe { WeakPtr::from_header(header) })
    }

    /// Atomically replace `current` with `new` if the cell still holds
    /// `current`'s pointer. Unit accounting mirrors
    /// [`AtomicSharedPtr::compare_exchange`], with weak units.
    pub fn compare_exchange(
        &self,
        current: &mut Option<WeakPtr<T>>,
        new: Option<WeakPtr<T>>,
    ) -> bool {
        let expected = current.as_ref().map_or(core::ptr::null_mut(), WeakPtr::header_ptr);
        let desired = new.as_ref().map_or(core::ptr::null_mut(), WeakPtr::header_ptr);
        match self
            .block
            .compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(old) => {
                if !old.is_null() {
                    // Safety: the cell owned one weak unit on `old`.
                    unsafe { retire_weak::<R>(old) };
                }
                core::mem::forget(new);
                true
            }
            Err(_) => {
                drop(new);
                *current = self.load();
                false
            }
        }
    }
}

impl<T: Send + Sync, R: Reclaimer> Default for AtomicWeakPtr<T, R> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T, R: Reclaimer> Drop for AtomicWeakPtr<T, R> {
    fn drop(&mut self) {
        let old = self.block.load(Ordering::SeqCst);
        if !old.is_null() {
            // Safety: the cell owned one weak unit on `old`.
            unsafe { retire_weak::<R>(old) };
        }
    }
}

impl<T: Send + Sync, R: Reclaimer> From<WeakPtr<T>> for AtomicWeakPtr<T, R> {
    fn from(ptr: WeakPtr<T>) -> Self {
        Self::new(Some(ptr))
    }
}

impl<T, R: Reclaimer> fmt::Debug for AtomicWeakPtr<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicWeakPtr")
            .field(&self.block.load(Ordering::Relaxed))
            .finish()
    }
}
