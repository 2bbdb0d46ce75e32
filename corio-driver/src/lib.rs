//! OS layer of corio: the epoll multiplexer, the reusable timerfd pool and
//! the event-mask type shared by both.
//!
//! Everything here is Linux-only by design; the scheduler above is written
//! against the level-triggered readiness semantics of epoll and the
//! fd-surfaced one-shot timers of timerfd.

#![warn(missing_docs)]

#[doc(no_inline)]
pub use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

#[doc(hidden)]
pub use libc;
use rustix::event::epoll::EventFlags;

mod macros;
mod poller;
mod timer;

pub use poller::Poller;
pub use timer::{arm, expire_now, TimerPool, MAX_TIMER_POOL};

bitflags::bitflags! {
    /// Readiness conditions a waiter may subscribe to on a file descriptor.
    ///
    /// The bit values match the corresponding `EPOLL*` constants, so a mask
    /// converts to and from the OS representation without translation
    /// tables.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u32 {
        /// The fd has data to read.
        const READABLE = 0x001;
        /// Urgent out-of-band data is pending.
        const PRIORITY = 0x002;
        /// The fd accepts writes without blocking.
        const WRITABLE = 0x004;
        /// An error condition is pending.
        const ERROR = 0x008;
        /// The peer hung up.
        const HANGUP = 0x010;
    }
}

impl Interest {
    pub(crate) fn to_epoll(self) -> EventFlags {
        let mut flags = EventFlags::empty();
        if self.contains(Self::READABLE) {
            flags |= EventFlags::IN;
        }
        if self.contains(Self::PRIORITY) {
            flags |= EventFlags::PRI;
        }
        if self.contains(Self::WRITABLE) {
            flags |= EventFlags::OUT;
        }
        if self.contains(Self::ERROR) {
            flags |= EventFlags::ERR;
        }
        if self.contains(Self::HANGUP) {
            flags |= EventFlags::HUP;
        }
        flags
    }

    pub(crate) fn from_epoll(flags: EventFlags) -> Self {
        let mut interest = Self::empty();
        if flags.contains(EventFlags::IN) {
            interest |= Self::READABLE;
        }
        if flags.contains(EventFlags::PRI) {
            interest |= Self::PRIORITY;
        }
        if flags.contains(EventFlags::OUT) {
            interest |= Self::WRITABLE;
        }
        if flags.contains(EventFlags::ERR) {
            interest |= Self::ERROR;
        }
        if flags.contains(EventFlags::HUP) {
            interest |= Self::HANGUP;
        }
        interest
    }
}
