use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::{Duration, Instant},
};

use corio_runtime::{
    sleep_ms, sleep_s, timed, trace, Moment, Pool, Semaphore, Task, TIMEOUT_CODE,
};

#[test]
fn timeout_aborts_a_sem_wait() {
    let pool = Pool::new().unwrap();
    let sem = Semaphore::new(0);
    let result = Rc::new(Cell::new(0));

    {
        let sem = sem.clone();
        let result = Rc::clone(&result);
        pool.sched(Task::new(async move {
            let stuck = Task::new(async move {
                // Never released.
                sem.wait().await.forget();
                0
            });
            result.set(timed(stuck, Duration::from_millis(100)).await);
            0
        }));
    }

    let start = Instant::now();
    assert_eq!(pool.run(), 0);
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(result.get(), TIMEOUT_CODE);
    // The waiter was spliced out of the semaphore: a release increments
    // instead of waking a ghost.
    sem.rel();
    assert_eq!(sem.count(), 1);
    assert_eq!(pool.live_tasks(), 0);
}

#[test]
fn timeout_aborts_a_sleeping_chain() {
    let pool = Pool::new().unwrap();
    let result = Rc::new(Cell::new(0));

    {
        let result = Rc::clone(&result);
        pool.sched(Task::new(async move {
            let leaf = Task::new(async {
                sleep_s(10).await;
                0
            });
            let mid = Task::new(async move { leaf.await });
            let root = Task::new(async move { mid.await });
            result.set(timed(root, Duration::from_millis(50)).await);
            0
        }));
    }

    let start = Instant::now();
    assert_eq!(pool.run(), 0);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(result.get(), TIMEOUT_CODE);
    assert_eq!(pool.live_tasks(), 0);
}

#[test]
fn early_return_cancels_the_timer() {
    let pool = Pool::new().unwrap();
    let result = Rc::new(Cell::new(-100));
    let events = Rc::new(RefCell::new(Vec::new()));

    {
        let result = Rc::clone(&result);
        let events = Rc::clone(&events);
        pool.sched(Task::new(async move {
            let quick = Task::new(async {
                sleep_ms(10).await;
                0
            });
            let quick = timed(quick, Duration::from_secs(1));
            let quick = trace(quick, {
                let events = Rc::clone(&events);
                move |moment, _| events.borrow_mut().push(moment)
            });
            result.set(quick.await);
            0
        }));
    }

    let start = Instant::now();
    assert_eq!(pool.run(), 0);
    // The sleeper was stopped early: the run drains well before the one
    // second timeout.
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(result.get(), 0);
    assert_eq!(
        *events.borrow(),
        vec![
            Moment::Call,
            Moment::FdWait,
            Moment::FdUnwait,
            Moment::Return
        ]
    );
    assert_eq!(pool.live_tasks(), 0);
}

#[test]
fn trace_observes_the_whole_call_chain() {
    let pool = Pool::new().unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));

    {
        let events = Rc::clone(&events);
        pool.sched(Task::new(async move {
            let inner = Task::new(async { 3 });
            let outer = Task::new(async move { inner.await });
            let outer = trace(outer, {
                let events = Rc::clone(&events);
                move |moment, _| events.borrow_mut().push(moment)
            });
            assert_eq!(outer.await, 3);
            0
        }));
    }

    assert_eq!(pool.run(), 0);
    assert_eq!(
        *events.borrow(),
        vec![
            Moment::Call,    // outer entered
            Moment::Leave,   // outer hands control to inner
            Moment::Call,    // inner entered
            Moment::Return,  // inner done
            Moment::Reentry, // outer resumes
            Moment::Return,  // outer done
        ]
    );
}

#[test]
fn timed_chain_releases_held_guards_on_unwind() {
    let pool = Pool::new().unwrap();
    let lock = Semaphore::new(1);
    let never = Semaphore::new(0);
    let reacquired = Rc::new(Cell::new(false));

    {
        let lock = lock.clone();
        let never = never.clone();
        pool.sched(Task::new(async move {
            let stuck = Task::new(async move {
                let _guard = lock.wait().await;
                never.wait().await.forget();
                0
            });
            assert_eq!(timed(stuck, Duration::from_millis(50)).await, TIMEOUT_CODE);
            0
        }));
    }
    {
        let lock = lock.clone();
        let reacquired = Rc::clone(&reacquired);
        pool.sched(Task::new(async move {
            // Blocks until the unwind drops the guard held by the timed
            // task.
            lock.wait().await.forget();
            reacquired.set(true);
            0
        }));
    }

    assert_eq!(pool.run(), 0);
    assert!(reacquired.get());
    assert_eq!(pool.live_tasks(), 0);
}
