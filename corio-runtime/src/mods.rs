//! Modifier chains: observers attached to a task frame and inherited along
//! call edges.
//!
//! A chain is a singly linked list of reference-counted nodes. Awaiting a
//! sub-task extends the callee's own chain with the caller's chain, so the
//! nodes end up shared by every frame of the call chain; a node dies with
//! the last frame referencing it. Chains are append-only and can never form
//! a cycle.

use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    time::Duration,
};

use corio_driver::{Interest, RawFd};
use corio_log::{debug, error};

use crate::{
    pool::Pool,
    sem::SemInner,
    task::{Task, TaskId},
    time::SleepHandle,
    GENERIC_CODE,
};

/// A lifecycle event observed by the modifiers of a call chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Moment {
    /// A frame was entered through a call edge.
    Call,
    /// A caller is about to transfer control to its callee.
    Leave,
    /// A frame reached its final return.
    Return,
    /// A caller resumes after its callee returned.
    Reentry,
    /// A frame suspended on fd readiness.
    FdWait,
    /// A frame came back from an fd wait.
    FdUnwait,
    /// A frame suspended on a semaphore.
    SemWait,
    /// A frame came back from a semaphore wait.
    SemUnwait,
}

pub(crate) struct ModNode {
    pub(crate) kind: ModKind,
    pub(crate) next: RefCell<Option<Rc<ModNode>>>,
}

pub(crate) enum ModKind {
    Timeout(TimeoutMod),
    Trace(Box<dyn Fn(Moment, TaskId)>),
}

/// State of one whole-call-chain timeout.
pub(crate) struct TimeoutMod {
    timeout: Duration,
    /// Set once, by the first call hook; that frame is the chain's root.
    started: Cell<bool>,
    state: RefCell<TimeoutState>,
    root: Cell<Option<usize>>,
    /// The most deeply nested frame; the unwind starts here.
    leaf: Cell<Option<usize>>,
    sleep: SleepHandle,
}

enum TimeoutState {
    Running,
    WaitingFd { fd: RawFd, interest: Interest },
    WaitingSem { sem: Weak<RefCell<SemInner>>, waiter: usize },
    Fired,
    Cancelled,
}

/// Append `other` at the tail of `origin`. Both halves keep their relative
/// order; the nodes are shared, not copied.
pub(crate) fn attach(
    origin: Option<Rc<ModNode>>,
    other: Option<Rc<ModNode>>,
) -> Option<Rc<ModNode>> {
    let Some(origin) = origin else {
        return other;
    };
    let Some(other) = other else {
        return Some(origin);
    };
    let mut curr = Rc::clone(&origin);
    loop {
        let next = curr.next.borrow().clone();
        match next {
            Some(next) => curr = next,
            None => {
                *curr.next.borrow_mut() = Some(other);
                break;
            }
        }
    }
    Some(origin)
}

fn for_each(pool: &Pool, key: usize, mut f: impl FnMut(&Rc<ModNode>)) {
    let mut curr = pool
        .frames
        .borrow()
        .get(key)
        .and_then(|frame| frame.mods.clone());
    while let Some(node) = curr {
        f(&node);
        curr = node.next.borrow().clone();
    }
}

pub(crate) fn on_call(pool: &Pool, key: usize) {
    for_each(pool, key, |node| match &node.kind {
        ModKind::Timeout(t) => {
            if !t.started.get() {
                t.started.set(true);
                t.root.set(Some(key));
                *t.state.borrow_mut() = TimeoutState::Running;
                // The sleeper is a sibling root: it must not inherit the
                // chain it polices.
                pool.sched(Task::new(run_sleeper(Rc::clone(node))));
            }
            // The root is set once; the leaf follows every newly entered
            // frame, because an abort unwinds from the innermost frame back
            // to the root.
            t.leaf.set(Some(key));
        }
        ModKind::Trace(f) => f(Moment::Call, TaskId(key)),
    });
}

pub(crate) fn on_leave(pool: &Pool, key: usize) {
    for_each(pool, key, |node| match &node.kind {
        ModKind::Timeout(_) => {}
        ModKind::Trace(f) => f(Moment::Leave, TaskId(key)),
    });
}

pub(crate) fn on_return(pool: &Pool, key: usize) {
    for_each(pool, key, |node| match &node.kind {
        ModKind::Timeout(t) => {
            t.leaf.set(Some(key));
            if t.root.get() == Some(key) {
                t.sleep.stop();
                *t.state.borrow_mut() = TimeoutState::Cancelled;
            }
        }
        ModKind::Trace(f) => f(Moment::Return, TaskId(key)),
    });
}

pub(crate) fn on_reentry(pool: &Pool, key: usize) {
    for_each(pool, key, |node| match &node.kind {
        ModKind::Timeout(t) => t.leaf.set(Some(key)),
        ModKind::Trace(f) => f(Moment::Reentry, TaskId(key)),
    });
}

pub(crate) fn on_fd_wait(pool: &Pool, key: usize, fd: RawFd, interest: Interest) {
    for_each(pool, key, |node| match &node.kind {
        ModKind::Timeout(t) => {
            *t.state.borrow_mut() = TimeoutState::WaitingFd { fd, interest };
        }
        ModKind::Trace(f) => f(Moment::FdWait, TaskId(key)),
    });
}

pub(crate) fn on_fd_unwait(pool: &Pool, key: usize) {
    for_each(pool, key, |node| match &node.kind {
        ModKind::Timeout(t) => {
            *t.state.borrow_mut() = TimeoutState::Running;
        }
        ModKind::Trace(f) => f(Moment::FdUnwait, TaskId(key)),
    });
}

pub(crate) fn on_sem_wait(pool: &Pool, key: usize, sem: &Rc<RefCell<SemInner>>, waiter: usize) {
    for_each(pool, key, |node| match &node.kind {
        ModKind::Timeout(t) => {
            *t.state.borrow_mut() = TimeoutState::WaitingSem {
                sem: Rc::downgrade(sem),
                waiter,
            };
        }
        ModKind::Trace(f) => f(Moment::SemWait, TaskId(key)),
    });
}

pub(crate) fn on_sem_unwait(pool: &Pool, key: usize) {
    for_each(pool, key, |node| match &node.kind {
        ModKind::Timeout(t) => {
            *t.state.borrow_mut() = TimeoutState::Running;
        }
        ModKind::Trace(f) => f(Moment::SemUnwait, TaskId(key)),
    });
}

async fn run_sleeper(node: Rc<ModNode>) -> i32 {
    let ModKind::Timeout(t) = &node.kind else {
        return GENERIC_CODE;
    };
    if crate::time::var_sleep_us(t.timeout.as_micros() as u64, &t.sleep).await < 0 {
        error!("timeout sleeper failed to arm its timer");
        return GENERIC_CODE;
    }
    Pool::with_current(|pool| fire(pool, t))
}

/// The timer elapsed (or was stopped). Either the chain already concluded,
/// or the whole chain is torn down: detach the leaf from whatever it is
/// suspended on, destroy the frames leaf to root, and complete the root
/// with the timeout status.
fn fire(pool: &Pool, t: &TimeoutMod) -> i32 {
    let state = std::mem::replace(&mut *t.state.borrow_mut(), TimeoutState::Fired);
    match state {
        TimeoutState::Cancelled => {
            // The chain returned before the timer; nothing to do.
            *t.state.borrow_mut() = TimeoutState::Cancelled;
            return 0;
        }
        TimeoutState::WaitingFd { fd, interest } => {
            if let Err(e) = pool.fds.borrow_mut().remove_wait(fd, interest) {
                debug!("timed-out leaf had no wait entry on fd {fd}: {e}");
            }
        }
        TimeoutState::WaitingSem { sem, waiter } => match sem.upgrade() {
            Some(sem) => sem.borrow_mut().remove_waiter(waiter),
            None => error!("semaphore dropped while a timed task was waiting on it"),
        },
        // Suspended on a callee only; no external registration to revoke.
        TimeoutState::Running | TimeoutState::Fired => {}
    }

    let Some(root) = t.root.get() else {
        error!("timeout fired on a chain that never started");
        return GENERIC_CODE;
    };
    let mut leaf = t.leaf.get();
    loop {
        match leaf {
            Some(key) if key == root => break,
            Some(key) => leaf = pool.destroy_frame(key),
            None => {
                error!("timed call chain unwound past its root");
                return GENERIC_CODE;
            }
        }
    }
    pool.finish_timed_root(root);
    0
}

/// Attach a whole-call-chain timeout to `task`.
///
/// When the task (or anything it awaits) is still suspended once `timeout`
/// elapses, the entire chain is destroyed and the task's result becomes
/// [`TIMEOUT_CODE`](crate::TIMEOUT_CODE). The countdown starts when the
/// task is first awaited.
pub fn timed(task: Task, timeout: Duration) -> Task {
    task.prepend(Rc::new(ModNode {
        kind: ModKind::Timeout(TimeoutMod {
            timeout,
            started: Cell::new(false),
            state: RefCell::new(TimeoutState::Running),
            root: Cell::new(None),
            leaf: Cell::new(None),
            sleep: SleepHandle::new(),
        }),
        next: RefCell::new(None),
    }))
}

/// Attach a tracing observer to `task`: `f` is invoked for every lifecycle
/// event of every frame in the task's call chain.
pub fn trace(task: Task, f: impl Fn(Moment, TaskId) + 'static) -> Task {
    task.prepend(Rc::new(ModNode {
        kind: ModKind::Trace(Box::new(f)),
        next: RefCell::new(None),
    }))
}
