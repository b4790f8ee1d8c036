//! Model checks for the portable semaphore.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test --test loom_semaphore --release`.
#![cfg(loom)]

use forkjoin::{CondvarSemaphore, RawSemaphore};
use loom::sync::Arc;
use loom::thread;

#[test]
fn loom_release_wakes_waiter() {
    loom::model(|| {
        let sem = Arc::new(CondvarSemaphore::new());
        let releaser = {
            let sem = sem.clone();
            thread::spawn(move || sem.release(1))
        };

        sem.acquire(1);
        releaser.join().unwrap();
        assert_eq!(sem.value(), 0);
    });
}

#[test]
fn loom_batch_release_wakes_every_waiter() {
    loom::model(|| {
        let sem = Arc::new(CondvarSemaphore::new());
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let sem = sem.clone();
                thread::spawn(move || sem.acquire(1))
            })
            .collect();

        sem.release(2);
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(sem.value(), 0);
    });
}

#[test]
fn loom_multi_permit_acquire_needs_all_releases() {
    loom::model(|| {
        let sem = Arc::new(CondvarSemaphore::new());
        let releaser = {
            let sem = sem.clone();
            thread::spawn(move || {
                sem.release(1);
                sem.release(1);
            })
        };

        sem.acquire(2);
        assert_eq!(sem.value(), 0);
        releaser.join().unwrap();
    });
}
