use crate::domain::{Domain, Policy};
use crate::entry::Entry;
use core::fmt;
use core::marker::PhantomData;

/// A raw pointer pinned by a hazard slot.
///
/// Returned by [`Domain::protect`]; while the guard is live, no scan in its
/// domain will dispose the address it holds. Dropping the guard clears the
/// slot and returns it to the owning thread's pool (and periodically triggers
/// a scan — see [`Policy::SCAN_DELAY`]).
///
/// Guards are move-only and pinned to the thread that created them: the slot
/// they hold belongs to that thread's registry entry, so `Guarded` is neither
/// `Send` nor `Sync`.
pub struct Guarded<X, P: Policy = crate::DefaultPolicy> {
    value: *mut X,
    entry: *const Entry<P>,
    index: usize,
    domain: &'static Domain<P>,
    // Raw pointers already forbid Send/Sync; spell the intent out anyway.
    _pinned: PhantomData<*mut ()>,
}

impl<X, P: Policy> Guarded<X, P> {
    /// # Safety
    ///
    /// `index` must be a hazard slot acquired from `entry` by the current
    /// thread, currently publishing `value`.
    pub(crate) unsafe fn new(
        value: *mut X,
        entry: &Entry<P>,
        index: usize,
        domain: &'static Domain<P>,
    ) -> Self {
        Guarded {
            value,
            entry,
            index,
            domain,
            _pinned: PhantomData,
        }
    }

    /// The protected raw pointer; null if the source held null.
    pub fn get(&self) -> *mut X {
        self.value
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Borrow the pointee for the lifetime of the guard.
    ///
    /// # Safety
    ///
    /// The protected pointer must be valid as `&X` (it is, whenever the
    /// writers of the source only free it through [`Domain::retire`] on this
    /// guard's domain).
    pub unsafe fn as_ref(&self) -> Option<&X> {
        // Safety: forwarded; the hazard keeps the referent from being
        // disposed while `self` lives.
        unsafe { self.value.as_ref() }
    }
}

impl<X, P: Policy> Drop for Guarded<X, P> {
    fn drop(&mut self) {
        // Safety: `Guarded` is not Send, so we are on the thread owning the
        // entry, and the slot index came from it.
        let entry = unsafe { &*self.entry };
        self.domain.release_slot(entry, self.index);
    }
}

impl<X, P: Policy> fmt::Debug for Guarded<X, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Guarded").field(&self.value).finish()
    }
}
