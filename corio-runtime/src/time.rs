use std::{
    cell::Cell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::Duration,
};

use corio_driver::{AsRawFd, Interest, OwnedFd, RawFd};
use corio_log::error;

use crate::{pool::Pool, GENERIC_CODE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SleepState {
    Unarmed,
    Armed(RawFd),
    Elapsed,
}

/// Remote control of one interruptible sleep.
///
/// A handle drives a single `var_sleep_*` call: `Unarmed` until the sleep
/// starts, `Armed` while it runs, `Elapsed` afterwards. [`SleepHandle::stop`]
/// wakes the sleeper early (it observes a result of 0, as if the time had
/// passed); stopping a sleep that already elapsed or was already stopped
/// does nothing, and stopping a handle before the sleep starts makes that
/// sleep return immediately.
#[derive(Clone)]
pub struct SleepHandle {
    state: Rc<Cell<SleepState>>,
}

impl SleepHandle {
    /// Create a handle not yet tied to a sleep.
    pub fn new() -> Self {
        Self {
            state: Rc::new(Cell::new(SleepState::Unarmed)),
        }
    }

    /// End the sleep driven by this handle ahead of time.
    pub fn stop(&self) -> i32 {
        match self.state.get() {
            SleepState::Unarmed => {
                self.state.set(SleepState::Elapsed);
                0
            }
            SleepState::Armed(fd) => match corio_driver::expire_now(fd) {
                Ok(()) => {
                    self.state.set(SleepState::Elapsed);
                    0
                }
                Err(e) => {
                    error!("failed to expire a sleep timer early: {e}");
                    GENERIC_CODE
                }
            },
            SleepState::Elapsed => 0,
        }
    }

    pub(crate) fn share(&self) -> Rc<Cell<SleepState>> {
        Rc::clone(&self.state)
    }
}

impl Default for SleepHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Suspension on a pooled timerfd.
///
/// The first poll acquires and arms a timer and registers it read-readable
/// in the fd-wait table; the wakeup recycles the timer. When a timed-out
/// chain destroys the frame mid-sleep the drop glue recycles the timer too
/// (the wait-table entry was already revoked by the unwind).
struct SleepFuture {
    delay: Duration,
    timer: Option<OwnedFd>,
    handle: Option<Rc<Cell<SleepState>>>,
    done: bool,
}

impl SleepFuture {
    fn new(delay: Duration, handle: Option<Rc<Cell<SleepState>>>) -> Self {
        Self {
            delay,
            timer: None,
            handle,
            done: false,
        }
    }
}

impl Future for SleepFuture {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.timer.is_none() && !this.done {
            return Pool::with_current(|pool| {
                let timer = match pool.acquire_timer() {
                    Ok(timer) => timer,
                    Err(e) => {
                        error!("failed to acquire a timer: {e}");
                        return Poll::Ready(GENERIC_CODE);
                    }
                };
                if let Err(e) = corio_driver::arm(&timer, this.delay) {
                    error!("failed to arm a sleep timer: {e}");
                    pool.release_timer(timer);
                    return Poll::Ready(GENERIC_CODE);
                }
                let fd = timer.as_raw_fd();
                if let Err(e) = pool.suspend_on_fd(fd, Interest::READABLE) {
                    error!("failed to register a sleep timer: {e}");
                    pool.release_timer(timer);
                    return Poll::Ready(GENERIC_CODE);
                }
                if let Some(handle) = &this.handle {
                    handle.set(SleepState::Armed(fd));
                }
                this.timer = Some(timer);
                Poll::Pending
            });
        }
        Pool::with_current(|pool| {
            let timer = this.timer.take().expect("sleep resumed twice");
            let res = pool.finish_fd_wait(timer.as_raw_fd(), Interest::READABLE);
            if let Some(handle) = &this.handle {
                handle.set(SleepState::Elapsed);
            }
            pool.release_timer(timer);
            this.done = true;
            Poll::Ready(res)
        })
    }
}

impl Drop for SleepFuture {
    fn drop(&mut self) {
        let Some(timer) = self.timer.take() else {
            return;
        };
        // Destroyed mid-suspension: the wait-table entry is gone, only the
        // timer itself needs recycling. With no pool on this thread the
        // timer is simply closed.
        if let Some(handle) = &self.handle {
            handle.set(SleepState::Elapsed);
        }
        Pool::try_with_current(move |pool| pool.release_timer(timer));
    }
}

/// Suspend the current frame for at least `delay_us` microseconds.
pub async fn sleep_us(delay_us: u64) -> i32 {
    SleepFuture::new(Duration::from_micros(delay_us), None).await
}

/// Suspend the current frame for at least `delay_ms` milliseconds.
pub async fn sleep_ms(delay_ms: u64) -> i32 {
    sleep_us(delay_ms * 1000).await
}

/// Suspend the current frame for at least `delay_s` seconds.
pub async fn sleep_s(delay_s: u64) -> i32 {
    sleep_us(delay_s * 1_000_000).await
}

/// As [`sleep_us`], but interruptible through `handle`.
///
/// Returns 0 both when the time elapsed and when the sleep was stopped
/// early; the generic failure code when the handle is already driving
/// another sleep.
pub async fn var_sleep_us(delay_us: u64, handle: &SleepHandle) -> i32 {
    match handle.state.get() {
        SleepState::Elapsed => return 0,
        SleepState::Armed(_) => {
            error!("sleep handle is already driving another sleep");
            return GENERIC_CODE;
        }
        SleepState::Unarmed => {}
    }
    if delay_us == 0 {
        return 0;
    }
    SleepFuture::new(Duration::from_micros(delay_us), Some(handle.share())).await
}

/// As [`var_sleep_us`], in milliseconds.
pub async fn var_sleep_ms(delay_ms: u64, handle: &SleepHandle) -> i32 {
    var_sleep_us(delay_ms * 1000, handle).await
}

/// As [`var_sleep_us`], in seconds.
pub async fn var_sleep_s(delay_s: u64, handle: &SleepHandle) -> i32 {
    var_sleep_us(delay_s * 1_000_000, handle).await
}
