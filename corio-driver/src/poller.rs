use std::{
    io,
    os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd},
    time::Duration,
};

use corio_log::trace;
use rustix::{
    event::epoll::{self, CreateFlags, EventData, EventVec},
    io::Errno,
};

use crate::Interest;

const EVENT_CAPACITY: usize = 1024;

/// Thin wrapper over an epoll instance.
///
/// Subscriptions are keyed by raw fd; the fd itself is stored as the epoll
/// user data, so a delivered event maps straight back to the waiter table.
/// The poller never owns the registered fds.
pub struct Poller {
    epoll: OwnedFd,
    events: EventVec,
}

impl Poller {
    /// Create a new epoll instance.
    pub fn new() -> io::Result<Self> {
        trace!("new epoll poller");
        Ok(Self {
            epoll: epoll::create(CreateFlags::CLOEXEC)?,
            events: EventVec::with_capacity(EVENT_CAPACITY),
        })
    }

    /// Register `fd` for the conditions in `interest`.
    pub fn subscribe(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        // SAFETY: the caller keeps the fd open for as long as it is
        // registered; `unsubscribe` is called before it is closed.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        epoll::add(
            &self.epoll,
            fd,
            EventData::new_u64(fd.as_raw_fd() as u64),
            interest.to_epoll(),
        )?;
        Ok(())
    }

    /// Replace the subscription mask of an already registered `fd`.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        // SAFETY: as in `subscribe`.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        epoll::modify(
            &self.epoll,
            fd,
            EventData::new_u64(fd.as_raw_fd() as u64),
            interest.to_epoll(),
        )?;
        Ok(())
    }

    /// Drop the subscription of `fd` entirely.
    pub fn unsubscribe(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: as in `subscribe`.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        epoll::delete(&self.epoll, fd)?;
        Ok(())
    }

    /// Wait for readiness and append the delivered `(fd, mask)` pairs to
    /// `out`, in the order the OS reported them. Returns how many were
    /// delivered.
    ///
    /// `None` blocks until at least one event arrives; `Some(Duration::ZERO)`
    /// only drains what is already pending.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<(RawFd, Interest)>,
    ) -> io::Result<usize> {
        let timeout = match timeout {
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        loop {
            self.events.clear();
            match epoll::wait(&self.epoll, &mut self.events, timeout) {
                Ok(()) => break,
                Err(Errno::INTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let mut delivered = 0;
        for event in self.events.iter() {
            out.push((
                event.data.u64() as RawFd,
                Interest::from_epoll(event.flags),
            ));
            delivered += 1;
        }
        Ok(delivered)
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}
