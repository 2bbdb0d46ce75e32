use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::{Duration, Instant},
};

use corio_runtime::{
    sched, sleep_ms, sleep_us, var_sleep_s, var_sleep_us, Pool, SleepHandle, Task, GENERIC_CODE,
};

#[test]
fn sleepers_wake_in_ascending_delay_order() {
    let pool = Pool::new().unwrap();
    let words = ["the", "quick", "brown", "fox", "jumps", "over", "lazy", "dogs"];
    let log = Rc::new(RefCell::new(Vec::new()));

    // Spawn in reverse so the ready-queue order disagrees with the delays.
    for (i, word) in words.iter().enumerate().rev() {
        let word: &'static str = *word;
        let log = Rc::clone(&log);
        pool.sched(Task::new(async move {
            sleep_ms((i as u64 + 1) * 10).await;
            log.borrow_mut().push(word);
            0
        }));
    }

    assert_eq!(pool.run(), 0);
    assert_eq!(log.borrow().join(" "), words.join(" "));
}

#[test]
fn sleep_takes_at_least_the_requested_time() {
    let pool = Pool::new().unwrap();
    let start = Instant::now();
    pool.sched(Task::new(async {
        assert_eq!(sleep_ms(25).await, 0);
        0
    }));
    assert_eq!(pool.run(), 0);
    assert!(start.elapsed() >= Duration::from_millis(25));
}

#[test]
fn timer_cache_stays_bounded() {
    let pool = Pool::new().unwrap();
    // More concurrent sleeps than the cache may retain.
    for _ in 0..80 {
        pool.sched(Task::new(async {
            sleep_ms(10).await;
            0
        }));
    }
    assert_eq!(pool.run(), 0);
    assert_eq!(pool.live_tasks(), 0);
    assert_eq!(pool.cached_timers(), 64);

    // The cached timers are actually reused.
    pool.sched(Task::new(async {
        sleep_us(100).await;
        0
    }));
    assert_eq!(pool.run(), 0);
    assert_eq!(pool.cached_timers(), 64);
}

#[test]
fn stopped_sleep_returns_early() {
    let pool = Pool::new().unwrap();
    let handle = SleepHandle::new();
    let finished = Rc::new(Cell::new(false));

    {
        let handle = handle.clone();
        let finished = Rc::clone(&finished);
        pool.sched(Task::new(async move {
            let start = Instant::now();
            assert_eq!(var_sleep_s(10, &handle).await, 0);
            assert!(start.elapsed() < Duration::from_secs(1));
            finished.set(true);
            0
        }));
    }
    pool.sched(Task::new(async move {
        sleep_ms(20).await;
        assert_eq!(handle.stop(), 0);
        // Stopping again is a no-op.
        assert_eq!(handle.stop(), 0);
        0
    }));

    assert_eq!(pool.run(), 0);
    assert!(finished.get());
}

#[test]
fn pre_stopped_handle_skips_the_sleep() {
    let pool = Pool::new().unwrap();
    let handle = SleepHandle::new();
    assert_eq!(handle.stop(), 0);

    pool.sched(Task::new(async move {
        let start = Instant::now();
        assert_eq!(var_sleep_s(10, &handle).await, 0);
        assert!(start.elapsed() < Duration::from_millis(100));
        0
    }));
    assert_eq!(pool.run(), 0);
}

#[test]
fn handle_cannot_drive_two_sleeps() {
    let pool = Pool::new().unwrap();
    let handle = SleepHandle::new();

    {
        let handle = handle.clone();
        pool.sched(Task::new(async move {
            let second = handle.clone();
            sched(Task::new(async move {
                // The first sleep is still armed.
                assert_eq!(var_sleep_us(1000, &second).await, GENERIC_CODE);
                0
            }));
            assert_eq!(var_sleep_us(5000, &handle).await, 0);
            0
        }));
    }
    assert_eq!(pool.run(), 0);
}
