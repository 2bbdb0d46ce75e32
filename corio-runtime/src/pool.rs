use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::Future,
    io,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::Duration,
};

use corio_driver::{Interest, OwnedFd, RawFd, TimerPool};
use corio_log::{debug, error};
use slab::Slab;

use crate::{fd_table::FdTable, mods, mods::ModNode, task::Task, GENERIC_CODE, TIMEOUT_CODE};

scoped_tls::scoped_thread_local!(static CURRENT: Pool);

/// One suspended coroutine invocation.
///
/// A frame is reachable from exactly one place at a time: the ready queue,
/// the fd-wait table, a semaphore's waiter list, or its caller's await. The
/// arena key is only handed around under that invariant.
pub(crate) struct Frame {
    /// Taken out while the frame is being polled, so awaiters may borrow the
    /// arena freely.
    pub(crate) fut: Option<Pin<Box<dyn Future<Output = i32>>>>,
    pub(crate) caller: Option<usize>,
    pub(crate) mods: Option<Rc<ModNode>>,
    /// Status injected before resumption: 0, [`TIMEOUT_CODE`] or
    /// [`crate::WAKEUP_CODE`].
    pub(crate) call_res: i32,
    /// Return slot filled by a completed callee.
    pub(crate) child_ret: Option<i32>,
    pub(crate) child_panic: Option<Box<dyn Any + Send>>,
}

impl Frame {
    fn new(
        fut: Pin<Box<dyn Future<Output = i32>>>,
        caller: Option<usize>,
        mods: Option<Rc<ModNode>>,
    ) -> Self {
        Self {
            fut: Some(fut),
            caller,
            mods,
            call_res: 0,
            child_ret: None,
            child_panic: None,
        }
    }
}

/// What the driver should do next.
enum Continuation {
    Resume(usize),
    Idle,
}

/// Decision left behind by the awaiter that suspended the current frame.
#[derive(Clone, Copy)]
pub(crate) enum Transfer {
    /// Pick the next runnable through the scheduling policy.
    Pass,
    /// Transfer directly to a freshly created callee.
    Call(usize),
    /// Leave the run loop.
    Stop,
}

/// A single-threaded cooperative coroutine pool.
///
/// The pool owns the frame arena, the ready queue, the fd-wait table and the
/// timer cache. It cannot be sent to other threads; while [`Pool::run`] is
/// executing it is reachable from awaiters through a scoped thread-local.
pub struct Pool {
    pub(crate) frames: RefCell<Slab<Frame>>,
    pub(crate) ready: RefCell<VecDeque<usize>>,
    pub(crate) fds: RefCell<FdTable>,
    timers: RefCell<TimerPool>,
    ret_val: Cell<i32>,
    forced: Cell<bool>,
    current: Cell<Option<usize>>,
    transfer: Cell<Transfer>,
}

impl Pool {
    /// Create an empty pool.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            frames: RefCell::new(Slab::new()),
            ready: RefCell::new(VecDeque::new()),
            fds: RefCell::new(FdTable::new()?),
            timers: RefCell::new(TimerPool::new()),
            ret_val: Cell::new(0),
            forced: Cell::new(false),
            current: Cell::new(None),
            transfer: Cell::new(Transfer::Pass),
        })
    }

    /// Schedule `task` as a root at the tail of the ready queue.
    ///
    /// This is a spawn edge: the task keeps whatever modifier chain it
    /// carries and inherits nothing from the scheduling context.
    pub fn sched(&self, task: Task) {
        let (fut, pmods) = task.into_parts();
        let key = self
            .frames
            .borrow_mut()
            .insert(Frame::new(fut, None, pmods));
        self.ready.borrow_mut().push_back(key);
    }

    /// Drive the pool until there is nothing left to run.
    ///
    /// Returns 0, or the value of the most recent [`force_stop`] if one
    /// interrupted this run. A later `run` on the same pool picks up where
    /// the forced stop left off.
    ///
    /// [`force_stop`]: crate::force_stop
    pub fn run(&self) -> i32 {
        self.forced.set(false);
        CURRENT.set(self, || {
            let mut next = self.next_task();
            while let Continuation::Resume(key) = next {
                next = self.resume(key);
            }
        });
        self.ret_val.get()
    }

    /// Whether the last [`Pool::run`] exit was forced by
    /// [`force_stop`](crate::force_stop).
    pub fn stopped(&self) -> bool {
        self.forced.get()
    }

    /// Reset the stop value so the next quiescent [`Pool::run`] returns 0.
    pub fn clear_stop(&self) {
        self.forced.set(false);
        self.ret_val.set(0);
    }

    /// Number of live task frames.
    pub fn live_tasks(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Number of idle timers currently cached.
    pub fn cached_timers(&self) -> usize {
        self.timers.borrow().cached()
    }

    /// Log the scheduler state through the diagnostic channel.
    pub fn dump_state(&self) {
        debug!("pool: {} frames alive", self.frames.borrow().len());
        debug!("pool: ready queue {:?}", self.ready.borrow());
        debug!("pool: {} idle timers", self.timers.borrow().cached());
        debug!(
            "pool: ret_val {} (forced: {})",
            self.ret_val.get(),
            self.forced.get()
        );
        self.fds.borrow().dump();
    }

    /// Run `f` against the pool the current thread is executing.
    ///
    /// ## Panics
    ///
    /// Panics when called outside [`Pool::run`].
    pub(crate) fn with_current<T, F: FnOnce(&Self) -> T>(f: F) -> T {
        #[cold]
        fn not_in_pool() -> ! {
            panic!("not inside a running corio pool")
        }

        if CURRENT.is_set() {
            CURRENT.with(f)
        } else {
            not_in_pool()
        }
    }

    /// As [`Pool::with_current`], but returns `None` outside a run loop.
    pub(crate) fn try_with_current<T, F: FnOnce(&Self) -> T>(f: F) -> Option<T> {
        if CURRENT.is_set() {
            Some(CURRENT.with(f))
        } else {
            None
        }
    }

    /// Arena key of the frame being polled right now.
    pub(crate) fn current_frame(&self) -> usize {
        self.current.get().expect("no task is currently running")
    }

    fn resume(&self, key: usize) -> Continuation {
        let fut = self
            .frames
            .borrow_mut()
            .get_mut(key)
            .and_then(|frame| frame.fut.take());
        let Some(mut fut) = fut else {
            error!("resumed task {key} which no longer exists");
            return self.next_task();
        };

        self.current.set(Some(key));
        self.transfer.set(Transfer::Pass);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut cx = Context::from_waker(Waker::noop());
            fut.as_mut().poll(&mut cx)
        }));
        self.current.set(None);

        match polled {
            Ok(Poll::Pending) => {
                if let Some(frame) = self.frames.borrow_mut().get_mut(key) {
                    frame.fut = Some(fut);
                }
                match self.transfer.get() {
                    Transfer::Call(callee) => Continuation::Resume(callee),
                    Transfer::Stop => Continuation::Idle,
                    Transfer::Pass => self.next_task(),
                }
            }
            Ok(Poll::Ready(ret)) => {
                drop(fut);
                self.complete(key, ret)
            }
            Err(payload) => {
                drop(fut);
                self.complete_panic(key, payload)
            }
        }
    }

    /// Return protocol of a finished frame: return hooks on the callee,
    /// result delivery and re-entry hooks on the caller, then a direct
    /// transfer back to it. A root without a caller falls through to the
    /// scheduling policy.
    fn complete(&self, key: usize, ret: i32) -> Continuation {
        mods::on_return(self, key);
        let caller = self.frames.borrow().get(key).and_then(|frame| frame.caller);
        let frame = self.frames.borrow_mut().try_remove(key);
        drop(frame);
        match caller {
            Some(caller_key) => {
                if let Some(frame) = self.frames.borrow_mut().get_mut(caller_key) {
                    frame.child_ret = Some(ret);
                }
                mods::on_reentry(self, caller_key);
                Continuation::Resume(caller_key)
            }
            None => self.next_task(),
        }
    }

    /// A panicking body unwinds to the closest awaiter; with no awaiter it
    /// unwinds out of [`Pool::run`].
    fn complete_panic(&self, key: usize, payload: Box<dyn Any + Send>) -> Continuation {
        mods::on_return(self, key);
        let caller = self.frames.borrow().get(key).and_then(|frame| frame.caller);
        let frame = self.frames.borrow_mut().try_remove(key);
        drop(frame);
        match caller {
            Some(caller_key) => {
                if let Some(frame) = self.frames.borrow_mut().get_mut(caller_key) {
                    frame.child_panic = Some(payload);
                }
                mods::on_reentry(self, caller_key);
                Continuation::Resume(caller_key)
            }
            None => panic::resume_unwind(payload),
        }
    }

    /// Scheduling policy: ready queue first, then readiness already
    /// delivered by the multiplexer, then the multiplexer itself (drain
    /// without blocking before waiting for real). With no subscriptions
    /// left the pool is quiescent.
    fn next_task(&self) -> Continuation {
        if let Some(key) = self.ready.borrow_mut().pop_front() {
            return Continuation::Resume(key);
        }
        loop {
            if let Some((key, res)) = self.fds.borrow_mut().pop_ready() {
                if let Some(frame) = self.frames.borrow_mut().get_mut(key) {
                    frame.call_res = res;
                }
                return Continuation::Resume(key);
            }
            if self.fds.borrow().is_idle() {
                debug!("no runnable task and no subscription left, leaving the loop");
                return Continuation::Idle;
            }
            match self.fds.borrow_mut().poll(Some(Duration::ZERO)) {
                Ok(0) => {
                    if let Err(e) = self.fds.borrow_mut().poll(None) {
                        error!("multiplexer wait failed, stopping the scheduler: {e}");
                        return Continuation::Idle;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("multiplexer drain failed, stopping the scheduler: {e}");
                    return Continuation::Idle;
                }
            }
        }
    }

    /// Call edge: insert the callee with the caller's chain appended to its
    /// own, fire the leave/call hooks and ask the driver to transfer
    /// control directly.
    pub(crate) fn begin_call(
        &self,
        fut: Pin<Box<dyn Future<Output = i32>>>,
        pmods: Option<Rc<ModNode>>,
    ) {
        let caller = self.current_frame();
        let inherited = self
            .frames
            .borrow()
            .get(caller)
            .and_then(|frame| frame.mods.clone());
        let chain = mods::attach(pmods, inherited);
        let callee = self
            .frames
            .borrow_mut()
            .insert(Frame::new(fut, Some(caller), chain));
        mods::on_leave(self, caller);
        mods::on_call(self, callee);
        self.transfer.set(Transfer::Call(callee));
    }

    /// Second half of the call edge, on the caller's side: take the
    /// delivered result, re-raising a callee panic.
    pub(crate) fn finish_call(&self) -> i32 {
        let key = self.current_frame();
        let (payload, ret) = {
            let mut frames = self.frames.borrow_mut();
            match frames.get_mut(key) {
                Some(frame) => (frame.child_panic.take(), frame.child_ret.take()),
                None => (None, None),
            }
        };
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
        match ret {
            Some(ret) => ret,
            None => {
                error!("task {key} resumed without a delivered result");
                GENERIC_CODE
            }
        }
    }

    /// Register the current frame in the fd-wait table and fire the fd-wait
    /// hooks. The frame suspends afterwards.
    pub(crate) fn suspend_on_fd(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let key = self.current_frame();
        self.fds.borrow_mut().insert_wait(key, fd, interest)?;
        mods::on_fd_wait(self, key, fd, interest);
        Ok(())
    }

    /// Resumption of an fd wait: fire the unwait hooks, drop the wait entry
    /// on a normal wakeup and hand back the injected status.
    pub(crate) fn finish_fd_wait(&self, fd: RawFd, interest: Interest) -> i32 {
        let key = self.current_frame();
        let res = self
            .frames
            .borrow()
            .get(key)
            .map_or(GENERIC_CODE, |frame| frame.call_res);
        mods::on_fd_unwait(self, key);
        if res == 0 {
            if let Err(e) = self.fds.borrow_mut().remove_wait(fd, interest) {
                error!("failed to drop the wait entry of fd {fd}: {e}");
            }
        }
        res
    }

    /// `stopfd`: resume every waiter of `fd` with the wakeup status and
    /// forget the fd, so the owner may close it.
    pub(crate) fn wakeup_fd(&self, fd: RawFd) -> i32 {
        match self.fds.borrow_mut().wakeup(fd) {
            Ok(()) => 0,
            Err(e) => {
                error!("failed to wake the waiters of fd {fd}: {e}");
                GENERIC_CODE
            }
        }
    }

    /// Re-enqueue the current frame at the tail; the driver then picks the
    /// head of the queue.
    pub(crate) fn yield_current(&self) {
        let key = self.current_frame();
        self.ready.borrow_mut().push_back(key);
    }

    /// Record the stop value, park the current frame at the ready-queue
    /// tail and make the driver leave the run loop.
    pub(crate) fn force_stop_current(&self, ret: i32) {
        let key = self.current_frame();
        self.ret_val.set(ret);
        self.forced.set(true);
        self.ready.borrow_mut().push_back(key);
        self.transfer.set(Transfer::Stop);
    }

    /// Destroy a suspended frame, returning its caller. Used by the timeout
    /// unwind, which walks a chain leaf to root.
    ///
    /// Any external registration of the frame must have been revoked
    /// beforehand; queued readiness for it is purged here so a recycled
    /// arena key can never be resumed in its place.
    pub(crate) fn destroy_frame(&self, key: usize) -> Option<usize> {
        let frame = self.frames.borrow_mut().try_remove(key);
        let Some(frame) = frame else {
            error!("tried to destroy task {key} which no longer exists");
            return None;
        };
        self.ready.borrow_mut().retain(|&k| k != key);
        self.fds.borrow_mut().purge_ready(key);
        let caller = frame.caller;
        // Dropping the frame runs the suspended future's destructors, which
        // may re-enter the pool (releasing semaphore guards, recycling
        // timers); no arena borrow is held at this point.
        drop(frame);
        caller
    }

    /// Complete the root of a timed-out chain as if its final return had
    /// just run, with the timeout status as its result.
    pub(crate) fn finish_timed_root(&self, root: usize) {
        mods::on_return(self, root);
        let caller = self
            .frames
            .borrow()
            .get(root)
            .and_then(|frame| frame.caller);
        self.destroy_frame(root);
        if let Some(caller_key) = caller {
            if let Some(frame) = self.frames.borrow_mut().get_mut(caller_key) {
                frame.child_ret = Some(TIMEOUT_CODE);
            }
            mods::on_reentry(self, caller_key);
            self.ready.borrow_mut().push_back(caller_key);
        }
    }

    pub(crate) fn acquire_timer(&self) -> io::Result<OwnedFd> {
        self.timers.borrow_mut().acquire()
    }

    pub(crate) fn release_timer(&self, timer: OwnedFd) {
        self.timers.borrow_mut().release(timer);
    }
}
