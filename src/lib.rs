//! Lock-free atomic shared pointers backed by hazard-pointer reclamation.
//!
//! The crate provides three primitives that only work as a set:
//!
//! - [`SharedPtr`] / [`WeakPtr`] — strong and weak reference-counted handles
//!   to a heap value, with the counters living in a separate control block;
//! - [`AtomicSharedPtr`] / [`AtomicWeakPtr`] — atomic cells holding such a
//!   handle, supporting concurrent `load` / `store` / `swap` /
//!   `compare_exchange` without locks;
//! - [`Domain`] — the hazard-pointer engine that makes the cells sound.
//!
//! The problem the domain solves: a naive atomic shared pointer races the
//! reader's load of the control-block pointer against the writer's decrement
//! that may destroy the block. Here a writer never decrements a replaced
//! pointer directly; it *retires* the decrement into the domain, and a reader
//! *protects* the pointer by publishing it in a hazard slot and re-validating
//! the cell. A retired decrement only runs once a scan over every thread's
//! slots proves nobody is mid-load on that block.
//!
//! ```
//! use hazarc::{AtomicSharedPtr, SharedPtr};
//!
//! let cell: AtomicSharedPtr<u64> = AtomicSharedPtr::new(Some(SharedPtr::new(21)));
//!
//! // Concurrent readers share ownership of whatever the cell holds.
//! let snapshot = cell.load().expect("cell is not empty");
//!
//! // A writer replaces the value; the old block is retired, not freed,
//! // because `snapshot` (or a reader mid-load) may still use it.
//! cell.store(Some(SharedPtr::new(42)));
//! assert_eq!(*snapshot, 21);
//! assert_eq!(*cell.load().unwrap(), 42);
//! ```
//!
//! Reclamation is amortized: retired objects are disposed in batches when a
//! thread's retired list fills up, every [`Policy::SCAN_DELAY`]-th guard
//! release, on thread exit, and on [`Domain::reclaim`]. A thread that exits
//! with retired objects still guarded leaves them on its registry entry for a
//! surviving thread to adopt.
//!
//! Strong reference cycles are not collected — break them with [`WeakPtr`],
//! exactly as with [`Arc`](std::sync::Arc).

#![deny(unsafe_op_in_unsafe_fn)]

mod allocator;
mod atomic;
mod block;
mod domain;
mod entry;
mod guarded;
mod shared;
mod sync;
mod weak;

use core::sync::atomic::Ordering;

/// Fence between publishing a hazard and re-reading the source pointer.
///
/// Scan-side loads pair with this so a writer that replaced the pointer after
/// our publish cannot also miss the hazard.
pub(crate) fn light_barrier() {
    crate::sync::atomic::fence(Ordering::SeqCst);
}

pub use allocator::{AllocError, BlockAllocator, DefaultAllocator};
pub use atomic::{AtomicSharedPtr, AtomicWeakPtr, DefaultReclaimer, Reclaimer};
pub use block::{BoxDeleter, Deleter};
pub use domain::{BoxDisposer, DefaultPolicy, Disposer, Domain, Policy};
pub use guarded::Guarded;
pub use shared::SharedPtr;
pub use weak::WeakPtr;
