use crate::domain::{Policy, Retired};
use crate::sync::atomic::{AtomicBool, AtomicPtr};
use core::cell::{Cell, UnsafeCell};
use core::marker::PhantomData;
use core::sync::atomic::Ordering;
use crossbeam_utils::CachePadded;

/// Sentinel index terminating the hazard-slot free list.
const NONE: usize = usize::MAX;

/// A single published hazard.
///
/// `protected` is written by the owning thread and read by every scanning
/// thread; it gets its own cache line so scans don't bounce the owner's other
/// state around. `next_free` threads the owner-private free list through the
/// slot pool.
pub(crate) struct HazardSlot {
    protected: AtomicPtr<u8>,
    next_free: Cell<usize>,
}

impl HazardSlot {
    pub(crate) fn publish(&self, ptr: *mut u8) {
        self.protected.store(ptr, Ordering::Release);
    }

    pub(crate) fn load(&self) -> *mut u8 {
        self.protected.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.protected.store(core::ptr::null_mut(), Ordering::Release);
    }
}

/// The owner-private half of a thread entry: the bounded retired list, the
/// hazard free-list head, and the tick counter driving periodic scans.
pub(crate) struct LocalData {
    pub(crate) retired: Vec<Retired>,
    free_head: usize,
    ticks: usize,
}

/// One registered thread's reclamation state.
///
/// An entry is exclusively owned by whichever thread holds its `active` flag:
/// the thread it was handed out to, or — after that thread exited — a peer
/// that grabbed it via [`try_acquire`](Entry::try_acquire) to drain orphaned
/// retires. The hazard slots stay readable by everyone throughout; only
/// `local` is ownership-gated.
pub(crate) struct Entry<P: Policy> {
    hazards: Box<[CachePadded<HazardSlot>]>,
    local: UnsafeCell<LocalData>,
    active: AtomicBool,
    next: AtomicPtr<Entry<P>>,
    _policy: PhantomData<P>,
}

// Safety: `hazards` is written only through atomics or by the `active` owner
// (the `next_free` cells), and `local` is only touched by the thread that
// currently holds the `active` flag.
unsafe impl<P: Policy> Send for Entry<P> {}
unsafe impl<P: Policy> Sync for Entry<P> {}

impl<P: Policy> Entry<P> {
    fn new() -> Self {
        let hazards: Box<[CachePadded<HazardSlot>]> = (0..P::MAX_HP)
            .map(|i| {
                CachePadded::new(HazardSlot {
                    protected: AtomicPtr::new(core::ptr::null_mut()),
                    next_free: Cell::new(if i + 1 < P::MAX_HP { i + 1 } else { NONE }),
                })
            })
            .collect();
        Entry {
            hazards,
            local: UnsafeCell::new(LocalData {
                retired: Vec::with_capacity(P::MAX_RETIRED),
                free_head: if P::MAX_HP > 0 { 0 } else { NONE },
                ticks: 0,
            }),
            active: AtomicBool::new(true),
            next: AtomicPtr::new(core::ptr::null_mut()),
            _policy: PhantomData,
        }
    }

    pub(crate) fn hazards(&self) -> impl Iterator<Item = &HazardSlot> {
        self.hazards.iter().map(|slot| &**slot)
    }

    pub(crate) fn slot(&self, index: usize) -> &HazardSlot {
        &self.hazards[index]
    }

    /// Claim exclusive ownership of an inactive entry.
    pub(crate) fn try_acquire(&self) -> bool {
        !self.active.load(Ordering::Relaxed)
            && self
                .active
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Give up ownership so another thread can recycle this entry.
    pub(crate) fn release(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Access the owner-private data.
    ///
    /// # Safety
    ///
    /// The caller must hold this entry's `active` flag, and must not let the
    /// returned borrow overlap another call (in particular, not across a
    /// retired-entry disposal, which may re-enter the domain).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn local(&self) -> &mut LocalData {
        // Safety: exclusivity comes from the `active` ownership contract.
        unsafe { &mut *self.local.get() }
    }

    /// Take a hazard slot off the free list.
    ///
    /// # Safety
    ///
    /// Owner thread only.
    pub(crate) unsafe fn acquire_slot(&self) -> usize {
        // Safety: owner thread per contract.
        let local = unsafe { self.local() };
        let index = local.free_head;
        assert_ne!(
            index, NONE,
            "every hazard slot of this thread is in use (MAX_HP = {})",
            P::MAX_HP
        );
        local.free_head = self.hazards[index].next_free.get();
        index
    }

    /// Clear a slot and return it to the free list, bumping the tick counter.
    /// Returns the new tick count.
    ///
    /// # Safety
    ///
    /// Owner thread only, and `index` must have come from `acquire_slot`.
    pub(crate) unsafe fn release_slot(&self, index: usize) -> usize {
        let slot = &self.hazards[index];
        slot.clear();
        // Safety: owner thread per contract.
        let local = unsafe { self.local() };
        slot.next_free.set(local.free_head);
        local.free_head = index;
        local.ticks += 1;
        local.ticks
    }

    /// Clear every hazard slot and rebuild the free list. Used on thread exit
    /// before the entry is released for recycling.
    ///
    /// # Safety
    ///
    /// Owner thread only, with no live guards on this entry.
    pub(crate) unsafe fn reset_hazards(&self) {
        for (i, slot) in self.hazards.iter().enumerate() {
            slot.clear();
            slot.next_free
                .set(if i + 1 < P::MAX_HP { i + 1 } else { NONE });
        }
        // Safety: owner thread per contract.
        let local = unsafe { self.local() };
        local.free_head = if P::MAX_HP > 0 { 0 } else { NONE };
    }
}

/// The lock-free registry of thread entries.
///
/// Append-only: entries are pushed with a CAS at the head and never unlinked;
/// a thread that exits merely releases its entry for a later thread to
/// recycle, retired list included. Scans iterate all entries, active or not.
pub(crate) struct EntryList<P: Policy> {
    head: AtomicPtr<Entry<P>>,
}

impl<P: Policy> EntryList<P> {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        EntryList {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        EntryList {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Hand out an exclusively-owned entry: a recycled inactive one if any,
    /// otherwise a freshly allocated one pushed onto the registry.
    pub(crate) fn acquire(&self) -> &Entry<P> {
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            // Safety: entries are never deallocated while the registry lives.
            let entry = unsafe { &*cur };
            if entry.try_acquire() {
                return entry;
            }
            cur = entry.next.load(Ordering::Relaxed);
        }
        self.push_new()
    }

    fn push_new(&self) -> &Entry<P> {
        let entry = Box::into_raw(Box::new(Entry::new()));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // Safety: `entry` has not been shared yet.
            unsafe { &*entry }.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, entry, Ordering::AcqRel, Ordering::Acquire)
            {
                // Safety: entries are never deallocated while the registry
                // lives.
                Ok(_) => break unsafe { &*entry },
                Err(now) => head = now,
            }
        }
    }

    pub(crate) fn iter(&self) -> EntryIter<'_, P> {
        EntryIter {
            cur: self.head.load(Ordering::Acquire),
            _list: PhantomData,
        }
    }

    /// Tear down the registry, handing each boxed entry to `f` before it is
    /// freed.
    ///
    /// # Safety
    ///
    /// No thread may be using any entry (the domain guarantees this by only
    /// dropping with `&mut self`).
    pub(crate) unsafe fn drain(&mut self, mut f: impl FnMut(&mut Entry<P>)) {
        let mut cur = self.head.swap(core::ptr::null_mut(), Ordering::Acquire);
        while !cur.is_null() {
            // Safety: exclusive access per contract; every entry was created
            // by `Box::into_raw` in `push_new`.
            let mut entry = unsafe { Box::from_raw(cur) };
            cur = entry.next.load(Ordering::Relaxed);
            f(&mut entry);
        }
    }
}

pub(crate) struct EntryIter<'a, P: Policy> {
    cur: *mut Entry<P>,
    _list: PhantomData<&'a EntryList<P>>,
}

impl<'a, P: Policy> Iterator for EntryIter<'a, P> {
    type Item = &'a Entry<P>;

    fn next(&mut self) -> Option<&'a Entry<P>> {
        if self.cur.is_null() {
            return None;
        }
        // Safety: entries are never deallocated while the registry lives, and
        // the iterator borrows the registry.
        let entry = unsafe { &*self.cur };
        self.cur = entry.next.load(Ordering::Relaxed);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DefaultPolicy;

    #[test]
    fn fresh_entries_are_owned() {
        let list = EntryList::<DefaultPolicy>::new();
        let a = list.acquire();
        let b = list.acquire();
        assert!(!core::ptr::eq(a, b));
        // Both are active, so neither can be stolen.
        assert!(!a.try_acquire());
        assert!(!b.try_acquire());
        drop_list(list);
    }

    #[test]
    fn released_entries_are_recycled() {
        let list = EntryList::<DefaultPolicy>::new();
        let a = list.acquire() as *const Entry<DefaultPolicy>;
        unsafe { (*a).release() };
        let b = list.acquire() as *const Entry<DefaultPolicy>;
        assert!(core::ptr::eq(a, b));
        drop_list(list);
    }

    #[test]
    fn iteration_sees_inactive_entries() {
        let list = EntryList::<DefaultPolicy>::new();
        let a = list.acquire();
        let b = list.acquire();
        b.release();
        assert_eq!(list.iter().count(), 2);
        let _ = a;
        drop_list(list);
    }

    #[test]
    fn slot_free_list_round_trips() {
        let list = EntryList::<DefaultPolicy>::new();
        let entry = list.acquire();

        let mut taken = Vec::new();
        for _ in 0..DefaultPolicy::MAX_HP {
            taken.push(unsafe { entry.acquire_slot() });
        }
        for index in taken.into_iter().rev() {
            unsafe { entry.release_slot(index) };
        }
        // The pool is whole again.
        for _ in 0..DefaultPolicy::MAX_HP {
            unsafe { entry.acquire_slot() };
        }
        unsafe { entry.reset_hazards() };
        drop_list(list);
    }

    fn drop_list<P: Policy>(mut list: EntryList<P>) {
        unsafe { list.drain(|_| ()) };
    }
}
