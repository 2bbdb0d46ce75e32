//! Readiness awaiters and the non-blocking syscall helpers built on them.
//!
//! The helpers follow one discipline: suspend until the fd reports the
//! matching readiness, perform the syscall once, return its result. Negative
//! results are either the reserved codes (a forced wakeup or a timeout
//! observed while suspended) or the generic failure code for a syscall
//! error.

use std::{
    future::Future,
    mem,
    net::SocketAddr,
    pin::Pin,
    ptr,
    task::{Context, Poll},
};

use corio_driver::{syscall, Interest, RawFd};
use corio_log::{error, warn};
use socket2::SockAddr;

use crate::{pool::Pool, GENERIC_CODE};

/// Suspend the current frame until `fd` reports any overlap with
/// `interest`.
///
/// Resolves to 0 on readiness, [`WAKEUP_CODE`](crate::WAKEUP_CODE) when the
/// wait was aborted by [`stopfd`], or the generic failure code when the
/// registration is invalid (empty mask, or another task already waits on
/// this fd for one of the requested events).
pub fn wait_event(fd: RawFd, interest: Interest) -> WaitEvent {
    WaitEvent {
        fd,
        interest,
        started: false,
    }
}

/// Future of [`wait_event`].
pub struct WaitEvent {
    fd: RawFd,
    interest: Interest,
    started: bool,
}

impl Future for WaitEvent {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pool::with_current(|pool| {
            if !this.started {
                match pool.suspend_on_fd(this.fd, this.interest) {
                    Ok(()) => {
                        this.started = true;
                        Poll::Pending
                    }
                    Err(e) => {
                        error!("cannot wait on fd {}: {e}", this.fd);
                        Poll::Ready(GENERIC_CODE)
                    }
                }
            } else {
                Poll::Ready(pool.finish_fd_wait(this.fd, this.interest))
            }
        })
    }
}

/// Eject `fd` from the pool before closing it.
///
/// Every waiter resumes with [`WAKEUP_CODE`](crate::WAKEUP_CODE) and the fd
/// is unsubscribed, so no waiter will ever touch the closed descriptor. The
/// caller does not suspend.
pub fn stopfd(fd: RawFd) -> i32 {
    Pool::with_current(|pool| pool.wakeup_fd(fd))
}

/// Wait until `fd` is readable, then read into `buf`. Returns the byte
/// count.
pub async fn read(fd: RawFd, buf: &mut [u8]) -> i32 {
    let res = wait_event(fd, Interest::READABLE).await;
    if res < 0 {
        return res;
    }
    match syscall!(read(fd, buf.as_mut_ptr().cast(), buf.len())) {
        Ok(n) => n as i32,
        Err(e) => {
            warn!("read on fd {fd} failed: {e}");
            GENERIC_CODE
        }
    }
}

/// Wait until `fd` is writable, then write `buf`. Returns the byte count.
pub async fn write(fd: RawFd, buf: &[u8]) -> i32 {
    let res = wait_event(fd, Interest::WRITABLE).await;
    if res < 0 {
        return res;
    }
    match syscall!(write(fd, buf.as_ptr().cast(), buf.len())) {
        Ok(n) => n as i32,
        Err(e) => {
            warn!("write on fd {fd} failed: {e}");
            GENERIC_CODE
        }
    }
}

/// Read until `buf` is full. A zero-byte read means the peer closed and
/// fails the whole transfer. Returns the full length.
pub async fn read_sz(fd: RawFd, buf: &mut [u8]) -> i32 {
    let total = buf.len();
    let mut filled = 0;
    while filled < total {
        let res = wait_event(fd, Interest::READABLE).await;
        if res < 0 {
            return res;
        }
        match syscall!(read(fd, buf[filled..].as_mut_ptr().cast(), total - filled)) {
            Ok(0) => {
                warn!("peer closed fd {fd} mid-read");
                return GENERIC_CODE;
            }
            Ok(n) => filled += n as usize,
            Err(e) => {
                warn!("read on fd {fd} failed: {e}");
                return GENERIC_CODE;
            }
        }
    }
    total as i32
}

/// Write all of `buf`. Returns the full length.
pub async fn write_sz(fd: RawFd, buf: &[u8]) -> i32 {
    let total = buf.len();
    let mut written = 0;
    while written < total {
        let res = wait_event(fd, Interest::WRITABLE).await;
        if res < 0 {
            return res;
        }
        match syscall!(write(fd, buf[written..].as_ptr().cast(), total - written)) {
            Ok(n) => written += n as usize,
            Err(e) => {
                warn!("write on fd {fd} failed: {e}");
                return GENERIC_CODE;
            }
        }
    }
    total as i32
}

/// Wait until `fd` has a pending connection, then accept it. Returns the
/// new fd.
pub async fn accept(fd: RawFd) -> i32 {
    let res = wait_event(fd, Interest::READABLE).await;
    if res < 0 {
        return res;
    }
    match syscall!(accept(fd, ptr::null_mut(), ptr::null_mut())) {
        Ok(conn) => conn as i32,
        Err(e) => {
            warn!("accept on fd {fd} failed: {e}");
            GENERIC_CODE
        }
    }
}

/// Connect `fd` to `addr` without blocking the pool.
///
/// The socket is flipped non-blocking around the `connect` call; an
/// in-progress connection waits for writability and reports the final
/// outcome from `SO_ERROR`.
pub async fn connect(fd: RawFd, addr: SocketAddr) -> i32 {
    let addr = SockAddr::from(addr);
    let flags = match syscall!(fcntl(fd, libc::F_GETFL, 0)) {
        Ok(flags) => flags,
        Err(e) => {
            warn!("fcntl on fd {fd} failed: {e}");
            return GENERIC_CODE;
        }
    };
    if let Err(e) = syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)) {
        warn!("fcntl on fd {fd} failed: {e}");
        return GENERIC_CODE;
    }
    let res = syscall!(connect(fd, addr.as_ptr().cast(), addr.len()));
    if let Err(e) = syscall!(fcntl(fd, libc::F_SETFL, flags)) {
        warn!("failed to restore the flags of fd {fd}: {e}");
    }
    match res {
        Ok(_) => 0,
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
            let res = wait_event(fd, Interest::WRITABLE).await;
            if res < 0 {
                return res;
            }
            let mut err: libc::c_int = 0;
            let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
            let fetched = syscall!(getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&mut err as *mut libc::c_int).cast(),
                &mut len,
            ));
            if fetched.is_err() || err != 0 {
                warn!("connect on fd {fd} failed with SO_ERROR {err}");
                return GENERIC_CODE;
            }
            0
        }
        Err(e) => {
            warn!("connect on fd {fd} failed: {e}");
            GENERIC_CODE
        }
    }
}
