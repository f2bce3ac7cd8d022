use crate::entry::{Entry, EntryList};
use crate::guarded::Guarded;
use crate::sync::atomic::AtomicPtr;
use core::cell::{Cell, RefCell};
use core::sync::atomic::Ordering;

#[cfg(doc)]
use crate::*;

/// Compile-time tuning of a reclamation [`Domain`].
///
/// Every thread that touches a domain gets a fixed pool of `MAX_HP` hazard
/// slots and a retired list bounded at `MAX_RETIRED` entries; every
/// `SCAN_DELAY`-th hazard release triggers a scan. Sound reclamation under
/// sustained load wants `MAX_HP * threads < MAX_RETIRED`, or retiring threads
/// may spin waiting for space.
pub trait Policy: 'static + Sized {
    /// Hazard slots per thread. At most this many [`Guarded`] values can be
    /// live on one thread at a time.
    const MAX_HP: usize;
    /// Capacity of each thread's retired list.
    const MAX_RETIRED: usize;
    /// Scan every this-many hazard releases.
    const SCAN_DELAY: usize;
}

/// The default policy: 4 hazard slots, 256 retired entries, scan every 8th
/// release.
pub struct DefaultPolicy;

impl Policy for DefaultPolicy {
    const MAX_HP: usize = 4;
    const MAX_RETIRED: usize = 256;
    const SCAN_DELAY: usize = 8;
}

/// A type-recovering destructor for retired pointers.
///
/// When a pointer is retired its static type is erased; the disposer is the
/// piece that remembers it. `dispose` is invoked once the domain has proven
/// that no hazard slot references the pointer, possibly on a different thread
/// than the one that retired it. Disposers must not panic.
pub trait Disposer<X> {
    /// Destroy the retired object.
    ///
    /// # Safety
    ///
    /// `ptr` is the retired pointer, no hazard slot references it, and it has
    /// not been disposed before.
    unsafe fn dispose(ptr: *mut X);
}

/// A [`Disposer`] for pointers that came out of [`Box::into_raw`].
pub struct BoxDisposer;

impl<X> Disposer<X> for BoxDisposer {
    unsafe fn dispose(ptr: *mut X) {
        // Safety: per the Disposer contract the pointer is unreachable, and
        // per our own it originated from a Box.
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// A retired pointer paired with its type-erased disposer, waiting for a
/// hazard-free scan.
#[derive(Copy, Clone)]
pub(crate) struct Retired {
    ptr: *mut u8,
    dispose: unsafe fn(*mut u8),
}

// Safety: retire requires the pointee to be Send (it may be disposed by a
// helping thread), and the disposer is a plain fn pointer.
unsafe impl Send for Retired {}

impl Retired {
    pub(crate) fn new<X, D: Disposer<X>>(ptr: *mut X) -> Self {
        unsafe fn invoke<X, D: Disposer<X>>(ptr: *mut u8) {
            // Safety: `ptr` was erased from `*mut X` in `Retired::new`, and
            // the caller forwards the Disposer contract.
            unsafe { D::dispose(ptr as *mut X) }
        }
        Retired {
            ptr: ptr as *mut u8,
            dispose: invoke::<X, D>,
        }
    }

    pub(crate) fn address(retired: &Retired) -> usize {
        retired.ptr as usize
    }

    /// # Safety
    ///
    /// No hazard slot may reference the pointer, and this must be the last
    /// remaining `Retired` for it.
    pub(crate) unsafe fn dispose(self) {
        // Safety: forwarded.
        unsafe { (self.dispose)(self.ptr) }
    }
}

struct Registration {
    domain: *const (),
    entry: *const (),
    exit: unsafe fn(*const (), *const ()),
}

/// Thread exit runs the registered exit hook for every domain this thread
/// touched: clear hazards, scan one last time, release the entry for
/// recycling.
struct Registrations {
    regs: Vec<Registration>,
}

impl Drop for Registrations {
    fn drop(&mut self) {
        for reg in self.regs.drain(..) {
            // Safety: each registration was created with matching domain and
            // entry types, and registered domains are 'static.
            unsafe { (reg.exit)(reg.domain, reg.entry) };
        }
    }
}

#[cfg(not(loom))]
std::thread_local! {
    static REGISTRATIONS: RefCell<Registrations> =
        RefCell::new(Registrations { regs: Vec::new() });

    // A one-slot (domain, entry) cache. It carries no destructor, so unlike
    // REGISTRATIONS it stays accessible while the thread's TLS destructors
    // run; the exit scan points it at the entry being drained so that
    // retires triggered by disposals still find an owned entry.
    static ACTIVE_ENTRY: Cell<(*const (), *const ())> =
        const { Cell::new((core::ptr::null(), core::ptr::null())) };
}

#[cfg(loom)]
loom::thread_local! {
    static REGISTRATIONS: RefCell<Registrations> =
        RefCell::new(Registrations { regs: Vec::new() });

    static ACTIVE_ENTRY: Cell<(*const (), *const ())> =
        Cell::new((core::ptr::null(), core::ptr::null()));
}

#[cfg(not(loom))]
fn try_registrations<R>(f: impl FnOnce(&RefCell<Registrations>) -> R) -> Option<R> {
    REGISTRATIONS.try_with(f).ok()
}

#[cfg(loom)]
fn try_registrations<R>(f: impl FnOnce(&RefCell<Registrations>) -> R) -> Option<R> {
    Some(REGISTRATIONS.with(f))
}

unsafe fn exit_thread<P: Policy>(domain: *const (), entry: *const ()) {
    // Safety: registered with these exact types; the domain is 'static.
    let domain_ref = unsafe { &*(domain as *const Domain<P>) };
    let entry_ref = unsafe { &*(entry as *const Entry<P>) };
    // Disposals below may drop values that retire into this domain again;
    // point the teardown-safe cache at the entry being drained so they land
    // on it.
    ACTIVE_ENTRY.with(|cache| cache.set((domain, entry)));
    // Safety: the exiting thread still owns its entry, and all of its guards
    // are gone (they cannot outlive the thread).
    unsafe {
        entry_ref.reset_hazards();
        domain_ref.scan(entry_ref);
        domain_ref.help_scan(entry_ref);
    }
    ACTIVE_ENTRY.with(|cache| cache.set((core::ptr::null(), core::ptr::null())));
    entry_ref.release();
}

#[cfg(not(loom))]
static GLOBAL_DOMAIN: Domain<DefaultPolicy> = Domain::new();

#[cfg(loom)]
loom::lazy_static! {
    static ref GLOBAL_DOMAIN: Domain<DefaultPolicy> = Domain::new();
}

/// Synchronization point between hazard-protected readers and the writers
/// that retire what they replace.
///
/// A domain owns a registry of per-thread entries. Each entry carries the
/// thread's hazard slots (readable by everyone) and its retired list (owned
/// by one thread at a time). Reading threads [`protect`](Domain::protect) a
/// pointer by publishing it in a slot and re-validating the source; writers
/// [`retire`](Domain::retire) replaced pointers, and a scan disposes exactly
/// those retired pointers that no published hazard references.
///
/// Protection only works when readers and writers agree on the domain: a
/// pointer retired through one domain is invisible to hazards published in
/// another. The atomic pointer cells tie the two sides together through their
/// [`Reclaimer`] parameter.
///
/// A thread's first operation on a domain acquires a registry entry, which the
/// thread keeps until it exits. On exit the entry runs a final scan and is
/// released for a later thread to recycle; retired entries that survive (for
/// example because another thread still holds a hazard on them) stay on the
/// inactive entry until a surviving thread's help-scan drains them. Nothing
/// guarantees *prompt* reclamation: a retired object is disposed only once
/// some thread scans and finds it unprotected; [`reclaim`](Domain::reclaim)
/// forces such a pass.
///
/// `Domain::global()` is the domain used by [`AtomicSharedPtr`] and
/// [`AtomicWeakPtr`] under the [`DefaultReclaimer`]. Custom policies live in
/// user statics:
///
/// ```
/// use hazarc::{Domain, Policy};
///
/// struct BigBatches;
/// impl Policy for BigBatches {
///     const MAX_HP: usize = 8;
///     const MAX_RETIRED: usize = 2048;
///     const SCAN_DELAY: usize = 64;
/// }
///
/// static DOMAIN: Domain<BigBatches> = Domain::new();
/// ```
pub struct Domain<P: Policy = DefaultPolicy> {
    entries: EntryList<P>,
}

impl Domain<DefaultPolicy> {
    /// The process-wide domain backing the default atomic pointer cells.
    pub fn global() -> &'static Self {
        &GLOBAL_DOMAIN
    }
}

macro_rules! new {
    ($($decl:tt)*) => {
        /// Construct an empty domain.
        ///
        /// The domain has to live in a `static`: every operation takes
        /// `&'static self`, because per-thread state keyed to the domain must
        /// stay reachable until each participating thread exits.
        pub $($decl)*() -> Self {
            Self { entries: EntryList::new() }
        }
    };
}

impl<P: Policy> Domain<P> {
    #[cfg(not(loom))]
    new!(const fn new);
    #[cfg(loom)]
    new!(fn new);

    /// The calling thread's registry entry, acquiring and registering one on
    /// first use.
    ///
    /// Returns `None` only while the thread's TLS destructors are running and
    /// the exiting thread has no entry of this domain under its exit scan.
    fn thread_entry(&'static self) -> Option<&'static Entry<P>> {
        let key = self as *const Self as *const ();
        let cached = ACTIVE_ENTRY.with(|cache| cache.get());
        if cached.0 == key {
            // Safety: the cache only ever holds an `Entry<P>` of this domain,
            // still owned by the current thread.
            return Some(unsafe { &*(cached.1 as *const Entry<P>) });
        }
        let entry = try_registrations(|regs| {
            let mut regs = regs.borrow_mut();
            if let Some(reg) = regs.regs.iter().find(|reg| reg.domain == key) {
                // Safety: this registration was created below with an
                // `Entry<P>` of this very domain.
                return unsafe { &*(reg.entry as *const Entry<P>) };
            }
            let entry = self.entries.acquire();
            regs.regs.push(Registration {
                domain: key,
                entry: entry as *const Entry<P> as *const (),
                exit: exit_thread::<P>,
            });
            entry
        })?;
        ACTIVE_ENTRY.with(|cache| {
            cache.set((key, entry as *const Entry<P> as *const ()));
        });
        Some(entry)
    }

    /// Publish a hazard for the pointer stored in `src` and return it behind
    /// a [`Guarded`] handle.
    ///
    /// The returned pointer cannot be disposed by any scan in this domain for
    /// as long as the guard is live: the slot is published first and the
    /// source re-read to validate, so a writer that swaps the pointer out
    /// afterwards is bound to observe the hazard before disposing. A null
    /// guard is returned when `src` holds null.
    ///
    /// Holding more than `P::MAX_HP` guards on one thread panics.
    ///
    /// Protection is only meaningful if whoever unlinks the pointer retires
    /// it through this same domain.
    pub fn protect<X>(&'static self, src: &AtomicPtr<X>) -> Guarded<X, P> {
        let entry = self
            .thread_entry()
            .expect("cannot publish hazards while the thread is exiting");
        // Safety: the entry belongs to the current thread.
        let index = unsafe { entry.acquire_slot() };
        let slot = entry.slot(index);
        let mut ptr = src.load(Ordering::Relaxed);
        loop {
            slot.publish(ptr as *mut u8);
            crate::light_barrier();
            // The validating reread: a writer that replaced the pointer
            // before our publish would have missed the hazard, so only a
            // stable value may be handed out.
            let current = src.load(Ordering::Acquire);
            if current == ptr {
                break;
            }
            ptr = current;
        }
        // Safety: `index` was acquired from `entry` by this thread.
        unsafe { Guarded::new(ptr, entry, index, self) }
    }

    /// Hand `ptr` to the domain for deferred disposal through `D`.
    ///
    /// The disposer runs once a scan proves no hazard slot in this domain
    /// holds `ptr` — possibly immediately, possibly much later, possibly on
    /// another thread. If the calling thread's retired list is full, this
    /// scans (and then yields) until space frees up.
    ///
    /// # Safety
    ///
    /// 1. Ownership of `ptr` transfers to the domain; nobody may access it
    ///    afterwards except through a hazard published before it was
    ///    unlinked.
    /// 2. `ptr` has not already been retired.
    /// 3. `D` is a correct way to destroy `ptr`.
    pub unsafe fn retire<X: Send, D: Disposer<X>>(&'static self, ptr: *mut X) {
        let Some(entry) = self.thread_entry() else {
            // The thread is mid-exit and this domain's entry is already
            // released (a value disposed during another domain's exit scan
            // retired into this one). Borrow an entry just for the push; the
            // retired entry is adopted by a later help-scan.
            let entry = self.entries.acquire();
            // Safety: we exclusively own the freshly acquired entry, and the
            // push cannot overflow `MAX_RETIRED` without a scan first.
            unsafe {
                if entry.local().retired.len() >= P::MAX_RETIRED {
                    self.scan(entry);
                }
                entry.local().retired.push(Retired::new::<X, D>(ptr));
            }
            entry.release();
            return;
        };
        loop {
            // Safety: the entry belongs to the current thread, and the borrow
            // does not cross a disposal.
            let full = unsafe { entry.local() }.retired.len() >= P::MAX_RETIRED;
            if !full {
                break;
            }
            // Safety: same ownership.
            unsafe { self.scan(entry) };
            let still_full = unsafe { entry.local() }.retired.len() >= P::MAX_RETIRED;
            if still_full {
                // Everything retired is currently guarded by some hazard;
                // give those readers a chance to move on.
                crate::sync::yield_now();
            }
        }
        // Safety: same ownership.
        unsafe { entry.local() }.retired.push(Retired::new::<X, D>(ptr));
    }

    /// Eagerly scan the calling thread's retired list and drain orphaned
    /// entries left behind by exited threads. Returns the number of objects
    /// disposed.
    pub fn reclaim(&'static self) -> usize {
        let Some(entry) = self.thread_entry() else {
            return 0;
        };
        // Safety: the entry belongs to the current thread.
        unsafe { self.scan(entry) + self.help_scan(entry) }
    }

    /// Return a hazard slot to its entry and run the tick protocol: every
    /// `SCAN_DELAY`-th release scans.
    pub(crate) fn release_slot(&self, entry: &Entry<P>, index: usize) {
        // Safety: Guarded is not Send, so this runs on the thread that owns
        // `entry`.
        let ticks = unsafe { entry.release_slot(index) };
        if ticks % P::SCAN_DELAY == 0 {
            // Safety: same ownership.
            unsafe {
                self.scan(entry);
                self.help_scan(entry);
            }
        }
    }

    /// Dispose every entry of `entry`'s retired list that no hazard slot in
    /// the domain references; compact the survivors. Returns the number
    /// disposed.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own `entry` (be its thread, or hold its
    /// `active` flag).
    pub(crate) unsafe fn scan(&self, entry: &Entry<P>) -> usize {
        let mut unprotected = Vec::new();
        {
            // Safety: exclusive ownership per contract.
            let local = unsafe { entry.local() };
            if local.retired.is_empty() {
                return 0;
            }
            local.retired.sort_unstable_by_key(Retired::address);
            // Pairs with the publish-side barrier in `protect`: any reader
            // whose validating reread saw a pointer we are about to judge has
            // its hazard visible to the loop below.
            crate::light_barrier();
            let mut guarded = vec![false; local.retired.len()];
            for peer in self.entries.iter() {
                for slot in peer.hazards() {
                    let ptr = slot.load();
                    if ptr.is_null() {
                        continue;
                    }
                    if let Ok(at) = local
                        .retired
                        .binary_search_by_key(&(ptr as usize), Retired::address)
                    {
                        guarded[at] = true;
                    }
                }
            }
            let mut kept = 0;
            for at in 0..local.retired.len() {
                let retired = local.retired[at];
                if guarded[at] {
                    local.retired[kept] = retired;
                    kept += 1;
                } else {
                    unprotected.push(retired);
                }
            }
            local.retired.truncate(kept);
        }
        // Dispose with the `local` borrow released: a disposer can drop
        // values that re-enter this domain on this thread (retire, or even a
        // nested scan).
        let disposed = unprotected.len();
        for retired in unprotected {
            // Safety: the pass above found no hazard for this address after
            // it was retired, and retire handed over sole ownership.
            unsafe { retired.dispose() };
        }
        disposed
    }

    /// Adopt the retired lists of exited threads: every inactive peer entry
    /// that can be exclusively acquired is drained into `entry`'s list and
    /// released again, then scanned. Returns the number disposed.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own `entry`.
    pub(crate) unsafe fn help_scan(&self, entry: &Entry<P>) -> usize {
        let mut disposed = 0;
        for peer in self.entries.iter() {
            if core::ptr::eq(peer, entry) {
                continue;
            }
            if !peer.try_acquire() {
                continue;
            }
            // Safety: try_acquire just handed us exclusive ownership of the
            // peer.
            let orphans: Vec<Retired> = {
                let peer_local = unsafe { peer.local() };
                peer_local.retired.drain(..).collect()
            };
            peer.release();
            if orphans.is_empty() {
                continue;
            }
            for retired in orphans {
                loop {
                    // Safety: `entry` is owned by the caller.
                    let full = unsafe { entry.local() }.retired.len() >= P::MAX_RETIRED;
                    if !full {
                        break;
                    }
                    // Safety: same ownership.
                    unsafe { self.scan(entry) };
                }
                // Safety: same ownership.
                unsafe { entry.local() }.retired.push(retired);
            }
            // Safety: same ownership.
            disposed += unsafe { self.scan(entry) };
        }
        disposed
    }
}

impl<P: Policy> Drop for Domain<P> {
    fn drop(&mut self) {
        // `&mut self` means no thread is registered with this domain and no
        // guard refers into it, so every remaining retired entry is
        // unprotected.
        unsafe {
            self.entries.drain(|entry| {
                let local = entry.local();
                for retired in local.retired.drain(..) {
                    retired.dispose();
                }
            });
        }
    }
}
