#![cfg(loom)]

use hazarc::*;

use loom::thread;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CountDrops(Arc<AtomicUsize>);
impl CountDrops {
    fn new() -> Self {
        Self(Default::default())
    }

    fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.0)
    }
}
impl Drop for CountDrops {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn weak_upgrade_races_last_strong_drop() {
    loom::model(|| {
        let value = CountDrops::new();
        let ndrops = value.counter();

        let a = SharedPtr::new(value);
        let w = SharedPtr::downgrade(&a);

        let t1 = thread::spawn(move || drop(a));
        let t2 = thread::spawn(move || {
            match w.upgrade() {
                // Either the promotion won and the value is untouched...
                Some(strong) => assert_eq!(strong.0.load(Ordering::SeqCst), 0),
                // ...or the strong count hit zero first.
                None => {}
            }
        });
        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(ndrops.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn load_races_store() {
    loom::model(|| {
        let value = CountDrops::new();
        let ndrops = value.counter();

        let cell = Arc::new(AtomicSharedPtr::new(Some(SharedPtr::new(value))));

        let reader = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                if let Some(snapshot) = cell.load() {
                    // Whatever we loaded is not destroyed while we hold it.
                    assert_eq!(snapshot.0.load(Ordering::SeqCst), 0);
                }
            })
        };

        cell.store(None);
        reader.join().unwrap();

        Domain::global().reclaim();
        assert_eq!(ndrops.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn protect_blocks_reclamation() {
    loom::model(|| {
        let value = CountDrops::new();
        let ndrops = value.counter();
        let ptr = Box::into_raw(Box::new(value));

        let src = Arc::new(loom::sync::atomic::AtomicPtr::new(ptr));
        let (tx, rx) = loom::sync::mpsc::channel();

        let reader = {
            let src = Arc::clone(&src);
            let ndrops = Arc::clone(&ndrops);
            thread::spawn(move || {
                let guard = Domain::global().protect(&src);
                tx.send(()).unwrap();
                if !guard.is_null() {
                    assert_eq!(ndrops.load(Ordering::SeqCst), 0);
                }
            })
        };

        // Wait until the reader holds its hazard, then unlink and retire.
        let _ = rx.recv();
        let unlinked = src.swap(core::ptr::null_mut(), loom::sync::atomic::Ordering::SeqCst);
        // Safety: `unlinked` came from Box::into_raw, is retired once, and is
        // only reachable through the reader's hazard.
        unsafe { Domain::global().retire::<CountDrops, BoxDisposer>(unlinked) };

        let n0 = Domain::global().reclaim();
        reader.join().unwrap();
        let n1 = Domain::global().reclaim();

        assert_eq!(n0 + n1, 1);
        assert_eq!(ndrops.load(Ordering::SeqCst), 1);
    });
}
