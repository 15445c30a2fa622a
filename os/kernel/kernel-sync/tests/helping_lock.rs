use kernel_sync::{HelpingLock, LockHooks, install_lock_hooks, lock_pair};
use std::{panic, thread};

fn context_id() -> usize {
    thread_local!(static MARKER: u8 = const { 0 });
    MARKER.with(|m| std::ptr::from_ref(m) as usize)
}

fn yield_to(_holder: usize) {
    thread::yield_now();
}

fn hooks() {
    // Every test in this binary shares one set of hooks.
    let _ = install_lock_hooks(LockHooks {
        current: context_id,
        help: yield_to,
    });
}

#[test]
fn basic_lock_and_raii() {
    hooks();
    let l = HelpingLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_held_by_current());
    }
    assert!(!l.is_held_by_current());

    {
        let mut g = l.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
}

#[test]
#[should_panic(expected = "acquired twice")]
fn recursive_acquisition_panics() {
    hooks();
    let l = HelpingLock::new(());
    let _g = l.lock();
    let _again = l.lock();
}

#[test]
#[should_panic(expected = "acquired twice")]
fn recursive_try_lock_panics() {
    hooks();
    let l = HelpingLock::new(());
    let _g = l.lock();
    let _ = l.try_lock();
}

#[test]
fn other_thread_sees_contention_not_recursion() {
    use std::sync::Arc;

    hooks();
    let l = Arc::new(HelpingLock::new(0_u8));
    let g = l.lock();

    let probe = Arc::clone(&l);
    let failed = thread::spawn(move || probe.try_lock().is_none())
        .join()
        .unwrap();
    assert!(failed);
    drop(g);
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    hooks();
    let threads = 8;
    let iters = 2_000;

    let lock = Arc::new(HelpingLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                lock.with_lock(|v| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *v += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn opposite_pair_orders_do_not_deadlock() {
    use std::sync::{Arc, Barrier};

    hooks();
    let locks = Arc::new([HelpingLock::new(0_u32), HelpingLock::new(0_u32)]);
    let start = Arc::new(Barrier::new(2));

    let spawn = |forward: bool| {
        let locks = Arc::clone(&locks);
        let start = Arc::clone(&start);
        thread::spawn(move || {
            start.wait();
            for _ in 0..1_000 {
                let (a, b) = if forward {
                    (&locks[0], &locks[1])
                } else {
                    (&locks[1], &locks[0])
                };
                let (mut g1, g2) = lock_pair(a, b);
                *g1 += 1;
                drop(g2);
            }
        })
    };

    let t1 = spawn(true);
    let t2 = spawn(false);
    t1.join().unwrap();
    t2.join().unwrap();

    assert_eq!(*locks[0].lock(), 2_000);
}

#[test]
fn lock_is_released_on_panic() {
    hooks();
    let l = HelpingLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(l.with_lock(|v| *v), 123);
}
