use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use corio_runtime::{sched, yield_now, Pool, Semaphore, Task};

#[test]
fn ping_pong() {
    const ROUNDS: usize = 1_000_000;

    let pool = Pool::new().unwrap();
    let a = Semaphore::new(1);
    let b = Semaphore::new(0);
    let ran_a = Rc::new(Cell::new(0usize));
    let ran_b = Rc::new(Cell::new(0usize));

    {
        let (a, b, ran_a) = (a.clone(), b.clone(), Rc::clone(&ran_a));
        pool.sched(Task::new(async move {
            for _ in 0..ROUNDS {
                a.wait().await.forget();
                ran_a.set(ran_a.get() + 1);
                b.rel();
            }
            0
        }));
    }
    {
        let (a, b, ran_b) = (a.clone(), b.clone(), Rc::clone(&ran_b));
        pool.sched(Task::new(async move {
            for _ in 0..ROUNDS {
                b.wait().await.forget();
                ran_b.set(ran_b.get() + 1);
                a.rel();
            }
            0
        }));
    }

    assert_eq!(pool.run(), 0);
    assert_eq!(ran_a.get(), ROUNDS);
    assert_eq!(ran_b.get(), ROUNDS);
    assert_eq!(a.count(), 1);
    assert_eq!(b.count(), 0);
    assert_eq!(pool.live_tasks(), 0);
}

#[test]
fn delayed_initial_release() {
    let pool = Pool::new().unwrap();
    let sem = Semaphore::new(-100);
    let resumed = Rc::new(Cell::new(false));
    let releasers_done = Rc::new(Cell::new(0u32));

    {
        let sem = sem.clone();
        let resumed = Rc::clone(&resumed);
        pool.sched(Task::new(async move {
            sem.wait().await.forget();
            resumed.set(true);
            0
        }));
    }
    for _ in 0..2 {
        let sem = sem.clone();
        let releasers_done = Rc::clone(&releasers_done);
        pool.sched(Task::new(async move {
            for _ in 0..50 {
                sem.rel();
                yield_now().await;
            }
            releasers_done.set(releasers_done.get() + 1);
            0
        }));
    }
    {
        let sem = sem.clone();
        let resumed = Rc::clone(&resumed);
        let releasers_done = Rc::clone(&releasers_done);
        pool.sched(Task::new(async move {
            while releasers_done.get() < 2 {
                yield_now().await;
            }
            // 100 releases only brought the counter back to zero.
            assert!(!resumed.get());
            assert_eq!(sem.count(), 0);
            sem.rel();
            yield_now().await;
            assert!(resumed.get());
            0
        }));
    }

    assert_eq!(pool.run(), 0);
    assert!(resumed.get());
}

#[test]
fn waiters_resume_in_fifo_order() {
    let pool = Pool::new().unwrap();
    let sem = Semaphore::new(0);
    let order = Rc::new(RefCell::new(Vec::new()));

    for i in 0..5 {
        let sem = sem.clone();
        let order = Rc::clone(&order);
        pool.sched(Task::new(async move {
            sem.wait().await.forget();
            order.borrow_mut().push(i);
            0
        }));
    }
    {
        let sem = sem.clone();
        pool.sched(Task::new(async move {
            // All five waiters are suspended by now; release them one by
            // one.
            for _ in 0..5 {
                sem.rel();
            }
            0
        }));
    }

    assert_eq!(pool.run(), 0);
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn release_hands_over_instead_of_incrementing() {
    let pool = Pool::new().unwrap();
    let sem = Semaphore::new(2);
    let sem2 = sem.clone();

    pool.sched(Task::new(async move {
        sem2.wait().await.forget();
        sem2.wait().await.forget();
        assert_eq!(sem2.count(), 0);

        let waited = Rc::new(Cell::new(false));
        {
            let sem = sem2.clone();
            let waited = Rc::clone(&waited);
            sched(Task::new(async move {
                sem.wait().await.forget();
                waited.set(true);
                0
            }));
        }
        yield_now().await;
        assert!(!waited.get());

        // The permit goes straight to the waiter; the counter stays at 0.
        sem2.rel();
        yield_now().await;
        assert!(waited.get());
        assert_eq!(sem2.count(), 0);

        // With nobody waiting the counter climbs normally.
        sem2.rel();
        assert_eq!(sem2.count(), 1);
        0
    }));

    assert_eq!(pool.run(), 0);
    assert_eq!(sem.count(), 1);
}

#[test]
fn rel_all_flushes_every_waiter() {
    let pool = Pool::new().unwrap();
    let sem = Semaphore::new(-3);
    let woken = Rc::new(Cell::new(0u32));

    for _ in 0..2 {
        let sem = sem.clone();
        let woken = Rc::clone(&woken);
        pool.sched(Task::new(async move {
            sem.wait().await.forget();
            woken.set(woken.get() + 1);
            0
        }));
    }
    {
        let sem = sem.clone();
        let woken = Rc::clone(&woken);
        pool.sched(Task::new(async move {
            sem.rel_all();
            yield_now().await;
            assert_eq!(woken.get(), 2);
            assert_eq!(sem.count(), 0);
            0
        }));
    }

    assert_eq!(pool.run(), 0);
    assert_eq!(woken.get(), 2);
}

#[test]
fn rel_all_is_a_noop_on_a_positive_counter() {
    let pool = Pool::new().unwrap();
    let sem = Semaphore::new(5);
    let sem2 = sem.clone();
    pool.sched(Task::new(async move {
        sem2.rel_all();
        0
    }));
    assert_eq!(pool.run(), 0);
    assert_eq!(sem.count(), 5);
}

#[test]
fn guard_releases_on_drop() {
    let pool = Pool::new().unwrap();
    let sem = Semaphore::new(1);
    let sem2 = sem.clone();

    pool.sched(Task::new(async move {
        {
            let _guard = sem2.wait().await;
            assert_eq!(sem2.count(), 0);
        }
        assert_eq!(sem2.count(), 1);
        0
    }));

    assert_eq!(pool.run(), 0);
    assert_eq!(sem.count(), 1);
}
