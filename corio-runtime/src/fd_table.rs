use std::{
    collections::{HashMap, VecDeque},
    io,
    time::Duration,
};

use corio_driver::{Interest, Poller, RawFd};
use corio_log::{debug, error};
use smallvec::SmallVec;

use crate::WAKEUP_CODE;

/// The fd-wait table: who waits on which fd, for which conditions.
///
/// Two invariants are maintained at all times: the OS subscription of an fd
/// equals the union of its waiters' masks, and no two waiters of one fd
/// share a mask bit. An fd whose last waiter leaves is unsubscribed and
/// forgotten.
pub(crate) struct FdTable {
    poller: Poller,
    entries: HashMap<RawFd, FdEntry>,
    /// Frames made runnable by delivered readiness (or by `wakeup`),
    /// paired with the status to inject on resumption.
    ready: VecDeque<(usize, i32)>,
    scratch: Vec<(RawFd, Interest)>,
}

struct FdEntry {
    mask: Interest,
    waiters: SmallVec<[(Interest, usize); 2]>,
}

impl FdTable {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            entries: HashMap::new(),
            ready: VecDeque::new(),
            scratch: Vec::new(),
        })
    }

    /// No subscriptions and nothing pre-delivered: the pool is quiescent.
    pub(crate) fn is_idle(&self) -> bool {
        self.entries.is_empty() && self.ready.is_empty()
    }

    pub(crate) fn pop_ready(&mut self) -> Option<(usize, i32)> {
        self.ready.pop_front()
    }

    pub(crate) fn purge_ready(&mut self, key: usize) {
        self.ready.retain(|&(k, _)| k != key);
    }

    /// Register frame `key` as a waiter of `fd` for `interest`.
    ///
    /// Rejected when the mask is empty or overlaps an existing waiter's
    /// mask: per fd there is one waiter per event kind.
    pub(crate) fn insert_wait(
        &mut self,
        key: usize,
        fd: RawFd,
        interest: Interest,
    ) -> io::Result<()> {
        if interest.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "the wait mask cannot be empty",
            ));
        }
        match self.entries.get_mut(&fd) {
            Some(entry) => {
                if entry.mask.intersects(interest) {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "another task already waits on this fd for these events",
                    ));
                }
                self.poller.modify(fd, entry.mask | interest)?;
                entry.mask |= interest;
                entry.waiters.push((interest, key));
            }
            None => {
                self.poller.subscribe(fd, interest)?;
                let mut waiters = SmallVec::new();
                waiters.push((interest, key));
                self.entries.insert(
                    fd,
                    FdEntry {
                        mask: interest,
                        waiters,
                    },
                );
            }
        }
        Ok(())
    }

    /// Subtract a waiter's mask from `fd`'s subscription, unsubscribing it
    /// entirely when no mask bits remain.
    pub(crate) fn remove_wait(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let Some(entry) = self.entries.get_mut(&fd) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "the fd has no wait entry",
            ));
        };
        let residual = entry.mask & !interest;
        if residual.is_empty() {
            self.entries.remove(&fd);
            self.poller.unsubscribe(fd)?;
        } else {
            self.poller.modify(fd, residual)?;
            entry.mask = residual;
            entry.waiters.retain(|&mut (mask, _)| !interest.contains(mask));
        }
        Ok(())
    }

    /// Abort every wait on `fd`: the waiters resume with the wakeup status
    /// and the fd leaves the table, so its owner can safely close it.
    pub(crate) fn wakeup(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(entry) = self.entries.remove(&fd) else {
            return Ok(());
        };
        // A waiter whose readiness was already delivered sits in the queue;
        // it must not be resumed twice.
        self.ready
            .retain(|&(key, _)| !entry.waiters.iter().any(|&(_, waiter)| waiter == key));
        for &(_, waiter) in &entry.waiters {
            self.ready.push_back((waiter, WAKEUP_CODE));
        }
        self.poller.unsubscribe(fd)?;
        Ok(())
    }

    /// Ask the multiplexer for readiness and dispatch it to the waiters, in
    /// the order the OS reported it. Returns how many frames were made
    /// runnable.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events = std::mem::take(&mut self.scratch);
        events.clear();
        let res = self.poller.wait(timeout, &mut events);
        let mut woken = 0;
        if res.is_ok() {
            for &(fd, reported) in events.iter() {
                woken += self.dispatch(fd, reported);
            }
        }
        self.scratch = events;
        res?;
        Ok(woken)
    }

    fn dispatch(&mut self, fd: RawFd, reported: Interest) -> usize {
        let Some(entry) = self.entries.get(&fd) else {
            error!("readiness delivered for fd {fd} which has no wait entry");
            return 0;
        };
        // Error and hangup conditions end any wait on the fd, whatever mask
        // it asked for.
        let mut effective = reported;
        if reported.intersects(Interest::ERROR | Interest::HANGUP) {
            effective |= Interest::READABLE | Interest::WRITABLE;
        }
        let mut woken = 0;
        for &(mask, waiter) in &entry.waiters {
            if mask.intersects(effective) {
                self.ready.push_back((waiter, 0));
                woken += 1;
            }
        }
        woken
    }

    pub(crate) fn dump(&self) {
        for (fd, entry) in &self.entries {
            debug!("fd {fd}: subscribed {:?}", entry.mask);
            for (mask, waiter) in &entry.waiters {
                debug!("fd {fd}: task {waiter} waits for {mask:?}");
            }
        }
        debug!("fd readiness queue: {:?}", self.ready);
    }
}
