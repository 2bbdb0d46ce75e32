use std::{
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd},
    time::Duration,
};

use rustix::time::{
    timerfd_create, timerfd_settime, Itimerspec, TimerfdClockId, TimerfdFlags, TimerfdTimerFlags,
    Timespec,
};

/// Upper bound on idle timers kept around for reuse.
pub const MAX_TIMER_POOL: usize = 64;

/// Bounded LIFO cache of disarmed timerfds.
///
/// A sleep acquires a timer, arms it and registers it read-readable with the
/// multiplexer; on wakeup the timer comes back here, or is closed when the
/// cache is already full. Timers run on the monotonic clock.
pub struct TimerPool {
    idle: Vec<OwnedFd>,
}

impl TimerPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self { idle: Vec::new() }
    }

    /// Pop a cached timer, or create a fresh one when the cache is empty.
    pub fn acquire(&mut self) -> io::Result<OwnedFd> {
        if let Some(timer) = self.idle.pop() {
            return Ok(timer);
        }
        Ok(timerfd_create(
            TimerfdClockId::Monotonic,
            TimerfdFlags::CLOEXEC,
        )?)
    }

    /// Hand a timer back; closes it instead when the cache is full.
    pub fn release(&mut self, timer: OwnedFd) {
        if self.idle.len() < MAX_TIMER_POOL {
            self.idle.push(timer);
        }
    }

    /// Number of timers currently cached.
    pub fn cached(&self) -> usize {
        self.idle.len()
    }
}

impl Default for TimerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Arm `timer` to fire once after `delay`.
///
/// A zero delay is rounded up to one nanosecond: an all-zero expiration
/// would disarm the timer instead of firing it immediately.
pub fn arm(timer: impl AsFd, delay: Duration) -> io::Result<()> {
    let mut value = Timespec {
        tv_sec: delay.as_secs() as _,
        tv_nsec: delay.subsec_nanos() as _,
    };
    if value.tv_sec == 0 && value.tv_nsec == 0 {
        value.tv_nsec = 1;
    }
    timerfd_settime(
        timer,
        TimerfdTimerFlags::empty(),
        &Itimerspec {
            it_interval: Timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        },
    )?;
    Ok(())
}

/// Re-arm a running timer to fire immediately.
///
/// Used to abort a sleep early: the sleeper wakes through the ordinary
/// readiness path instead of being torn out of the wait table.
///
/// The raw fd must belong to a timer that is still armed and registered,
/// which the sleep bookkeeping guarantees.
pub fn expire_now(fd: RawFd) -> io::Result<()> {
    // SAFETY: see above; the fd stays open for the duration of the call.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    arm(fd, Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn pool_is_bounded() {
        let mut pool = TimerPool::new();
        let timers: Vec<_> = (0..MAX_TIMER_POOL + 8)
            .map(|_| pool.acquire().unwrap())
            .collect();
        assert_eq!(pool.cached(), 0);
        for timer in timers {
            pool.release(timer);
        }
        assert_eq!(pool.cached(), MAX_TIMER_POOL);
    }

    #[test]
    fn armed_timer_fires() {
        let mut pool = TimerPool::new();
        let timer = pool.acquire().unwrap();
        arm(&timer, Duration::from_millis(1)).unwrap();
        // A blocking read on the timerfd returns the expiration count once
        // the timer elapses.
        let mut file = std::fs::File::from(timer);
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(u64::from_ne_bytes(buf), 1);
    }
}
