use std::{
    cell::Cell,
    future::{Future, IntoFuture},
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::Duration,
};

use corio_log::warn;

use crate::{
    mods::{self, ModNode, Moment},
    pool::Pool,
    sem::Semaphore,
};

/// Identity of a task frame, as handed to trace callbacks.
///
/// Stable for the lifetime of the frame; may be reused afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) usize);

/// A coroutine that has not started yet: a suspended body plus the modifier
/// chain it will carry.
///
/// A task runs once it is awaited (a call edge, inheriting the awaiting
/// frame's modifiers) or passed to [`sched`]/[`Pool::sched`] (a spawn edge,
/// inheriting nothing). Dropping a task that was never armed either way is
/// a programming error and is reported through the diagnostic channel.
pub struct Task {
    pub(crate) fut: Option<Pin<Box<dyn Future<Output = i32>>>>,
    pub(crate) mods: Option<Rc<ModNode>>,
    pub(crate) armed: bool,
}

impl Task {
    /// Wrap a coroutine body.
    pub fn new<F: Future<Output = i32> + 'static>(fut: F) -> Self {
        Self {
            fut: Some(Box::pin(fut)),
            mods: None,
            armed: false,
        }
    }

    /// Builder form of [`timed`](crate::timed).
    pub fn timed(self, timeout: Duration) -> Self {
        mods::timed(self, timeout)
    }

    /// Builder form of [`trace`](crate::trace).
    pub fn traced(self, f: impl Fn(Moment, TaskId) + 'static) -> Self {
        mods::trace(self, f)
    }

    pub(crate) fn into_parts(mut self) -> (Pin<Box<dyn Future<Output = i32>>>, Option<Rc<ModNode>>) {
        self.armed = true;
        let fut = self.fut.take().expect("task already consumed");
        (fut, self.mods.take())
    }

    pub(crate) fn prepend(mut self, node: Rc<ModNode>) -> Self {
        self.mods = mods::attach(Some(node), self.mods.take());
        self
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if !self.armed && self.fut.is_some() {
            warn!("task dropped without ever being scheduled or awaited");
        }
    }
}

impl IntoFuture for Task {
    type Output = i32;
    type IntoFuture = Call;

    fn into_future(self) -> Call {
        Call {
            pending: Some(self.into_parts()),
        }
    }
}

/// The call edge: awaiting this suspends the caller, transfers control
/// directly to the callee and resumes the caller with the callee's result
/// once it returns.
pub struct Call {
    #[allow(clippy::type_complexity)]
    pending: Option<(Pin<Box<dyn Future<Output = i32>>>, Option<Rc<ModNode>>)>,
}

impl Future for Call {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pool::with_current(|pool| match this.pending.take() {
            Some((fut, pmods)) => {
                pool.begin_call(fut, pmods);
                Poll::Pending
            }
            None => Poll::Ready(pool.finish_call()),
        })
    }
}

/// Schedule `task` on the pool the current coroutine runs on.
///
/// The spawn edge does not suspend: the current frame keeps running and the
/// sibling starts at the tail of the ready queue.
pub fn sched(task: Task) {
    Pool::with_current(|pool| pool.sched(task));
}

/// Re-enqueue the current frame at the tail of the ready queue and run the
/// head.
pub fn yield_now() -> Yield {
    Yield { yielded: false }
}

/// Future of [`yield_now`].
pub struct Yield {
    yielded: bool,
}

impl Future for Yield {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        this.yielded = true;
        Pool::with_current(|pool| pool.yield_current());
        Poll::Pending
    }
}

/// Make the driving [`Pool::run`] return `ret`.
///
/// The current frame parks at the tail of the ready queue; the next `run`
/// resumes it as if nothing had happened. The stop value sticks until
/// [`Pool::clear_stop`].
pub fn force_stop(ret: i32) -> ForceStop {
    ForceStop {
        ret,
        stopped: false,
    }
}

/// Future of [`force_stop`].
pub struct ForceStop {
    ret: i32,
    stopped: bool,
}

impl Future for ForceStop {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.stopped {
            return Poll::Ready(());
        }
        this.stopped = true;
        Pool::with_current(|pool| pool.force_stop_current(this.ret));
        Poll::Pending
    }
}

/// Run every task as a sibling and resolve to the bitwise OR of their
/// results once the last one finished.
pub fn when_all(tasks: Vec<Task>) -> Task {
    Task::new(async move {
        // Seeded so that the n-th sibling's release is the one that wakes
        // the join below.
        let joined = Semaphore::new(1 - tasks.len() as i64);
        let ret = Rc::new(Cell::new(0));
        for task in tasks {
            let joined = joined.clone();
            let ret = Rc::clone(&ret);
            sched(Task::new(async move {
                let res = task.await;
                ret.set(ret.get() | res);
                joined.rel();
                0
            }));
        }
        joined.wait().await.forget();
        ret.get()
    })
}
