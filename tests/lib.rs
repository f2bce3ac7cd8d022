use hazarc::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CountDrops(Arc<AtomicUsize>);
impl Drop for CountDrops {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn counted() -> (SharedPtr<CountDrops>, Arc<AtomicUsize>) {
    let drops = Arc::new(AtomicUsize::new(0));
    (SharedPtr::new(CountDrops(Arc::clone(&drops))), drops)
}

#[test]
fn single_threaded_round_trip() {
    let drops = Arc::new(AtomicUsize::new(0));
    let a = SharedPtr::new((42u64, CountDrops(Arc::clone(&drops))));
    let b = a.clone();

    assert_eq!(a.use_count(), 2);
    assert_eq!(b.0, 42);

    drop(b);
    assert_eq!(a.use_count(), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    drop(a);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn weak_observes_but_does_not_own() {
    let (a, drops) = counted();
    let w = SharedPtr::downgrade(&a);

    assert_eq!(w.use_count(), 1);
    assert!(!w.expired());
    assert!(w.upgrade().is_some());

    drop(a);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(w.expired());
    assert!(w.upgrade().is_none());
}

#[test]
fn cell_unit_counts_as_strong() {
    let (a, _drops) = counted();
    let cell: AtomicSharedPtr<CountDrops> = AtomicSharedPtr::new(Some(a.clone()));
    assert_eq!(a.use_count(), 2);

    let loaded = cell.load().expect("cell holds a value");
    assert_eq!(a.use_count(), 3);
    assert!(SharedPtr::ptr_eq(&a, &loaded));
}

#[test]
fn store_defers_the_old_unit() {
    let (a, drops) = counted();
    let cell: AtomicSharedPtr<CountDrops> = AtomicSharedPtr::new(Some(a));

    let snapshot = cell.load().expect("cell holds a value");
    cell.store(None);

    // The cell's unit is retired, not yet released.
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    Domain::global().reclaim();
    // Released now, but `snapshot` still owns a unit.
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert_eq!(snapshot.use_count(), 1);

    drop(snapshot);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn swap_hands_the_unit_over() {
    let (a, drops) = counted();
    let cell: AtomicSharedPtr<CountDrops> = AtomicSharedPtr::new(Some(a));

    let old = cell.swap(None).expect("cell held a value");
    assert!(cell.load().is_none());

    // No deferral involved: the handle owns the cell's old unit directly.
    drop(old);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn dropping_the_cell_retires_its_unit() {
    let (a, drops) = counted();
    {
        let _cell: AtomicSharedPtr<CountDrops> = AtomicSharedPtr::new(Some(a));
    }
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    Domain::global().reclaim();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn compare_exchange_success_consumes_new() {
    let (a, drops_a) = counted();
    let (b, drops_b) = counted();
    let cell: AtomicSharedPtr<CountDrops> = AtomicSharedPtr::new(Some(a.clone()));

    let mut current = cell.load();
    assert!(cell.compare_exchange(&mut current, Some(b.clone())));

    // `current` kept its unit; the cell's old unit is retired.
    assert!(SharedPtr::ptr_eq(current.as_ref().unwrap(), &a));
    drop(current);
    drop(a);
    Domain::global().reclaim();
    assert_eq!(drops_a.load(Ordering::SeqCst), 1);

    let now = cell.load().expect("cell holds b");
    assert!(SharedPtr::ptr_eq(&now, &b));
    drop(now);
    drop(b);
    assert_eq!(drops_b.load(Ordering::SeqCst), 0);
}

#[test]
fn compare_exchange_failure_reloads_current() {
    let (a, _da) = counted();
    let (b, drops_b) = counted();
    let (c, _dc) = counted();
    let cell: AtomicSharedPtr<CountDrops> = AtomicSharedPtr::new(Some(a));

    let mut stale = Some(c);
    assert!(!cell.compare_exchange(&mut stale, Some(b.clone())));

    // `new` was dropped (its unit released), and `stale` now aliases the
    // cell's actual contents.
    drop(b);
    assert_eq!(drops_b.load(Ordering::SeqCst), 1);
    let actual = cell.load().unwrap();
    assert!(SharedPtr::ptr_eq(stale.as_ref().unwrap(), &actual));
}

#[test]
fn compare_exchange_from_empty() {
    let (a, _drops) = counted();
    let cell: AtomicSharedPtr<CountDrops> = AtomicSharedPtr::default();

    let mut current = None;
    assert!(cell.compare_exchange(&mut current, Some(a.clone())));
    assert!(SharedPtr::ptr_eq(&cell.load().unwrap(), &a));

    let mut empty = None;
    assert!(!cell.compare_exchange(&mut empty, None));
    assert!(SharedPtr::ptr_eq(empty.as_ref().unwrap(), &a));
}

#[test]
fn weak_cell_round_trip() {
    let (a, drops) = counted();
    let cell: AtomicWeakPtr<CountDrops> = AtomicWeakPtr::new(Some(SharedPtr::downgrade(&a)));

    let w = cell.load().expect("cell holds a weak pointer");
    assert!(w.upgrade().is_some());

    drop(a);
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    // The value is gone; the weak cell still loads, upgrade refuses.
    let w2 = cell.load().expect("weak pointer survives the value");
    assert!(w2.expired());
    assert!(w2.upgrade().is_none());
}

#[test]
fn weak_cell_store_defers_weak_unit() {
    let (a, _drops) = counted();
    let cell: AtomicWeakPtr<CountDrops> = AtomicWeakPtr::new(Some(SharedPtr::downgrade(&a)));
    cell.store(None);
    assert!(cell.load().is_none());
    Domain::global().reclaim();
}

#[test]
fn is_lock_free() {
    let cell: AtomicSharedPtr<u64> = AtomicSharedPtr::default();
    assert!(cell.is_lock_free());
    assert!(AtomicSharedPtr::<u64>::IS_ALWAYS_LOCK_FREE);
    let weak_cell: AtomicWeakPtr<u64> = AtomicWeakPtr::default();
    assert!(weak_cell.is_lock_free());
}

#[test]
fn upgrade_race_is_none_or_aliases() {
    // Promotion against a concurrent last-strong drop either fails or yields
    // a handle to the still-intact value; nothing in between.
    for _ in 0..100 {
        let (a, drops) = counted();
        let w = SharedPtr::downgrade(&a);

        let t1 = std::thread::spawn(move || drop(a));
        let t2 = std::thread::spawn(move || match w.upgrade() {
            Some(strong) => {
                assert_eq!(strong.0.load(Ordering::SeqCst), 0);
                drop(strong);
            }
            None => {}
        });
        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn concurrent_loads_see_a_published_value() {
    let cell: Arc<AtomicSharedPtr<u64>> = Arc::new(AtomicSharedPtr::new(Some(SharedPtr::new(0))));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let v = cell.load().expect("never stored empty");
                    assert!(*v <= 1000);
                }
            })
        })
        .collect();

    for i in 1..=1000u64 {
        cell.store(Some(SharedPtr::new(i)));
    }
    for reader in readers {
        reader.join().unwrap();
    }
    Domain::global().reclaim();
}
