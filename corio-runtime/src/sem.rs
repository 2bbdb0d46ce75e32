use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use corio_log::error;

use crate::{mods, pool::Pool};

pub(crate) struct SemInner {
    counter: i64,
    waiters: VecDeque<usize>,
}

impl SemInner {
    /// Splice a waiter out of the queue, wherever it sits. Used when a
    /// timeout destroys a frame that is still enqueued here.
    pub(crate) fn remove_waiter(&mut self, key: usize) {
        self.waiters.retain(|&k| k != key);
    }
}

/// A counting semaphore for cooperative tasks.
///
/// Waiters resume in the order they suspended. A negative initial counter
/// absorbs that many releases before the semaphore starts handing out
/// permits. The handle is cheaply cloneable; clones share the same counter,
/// and a suspended waiter keeps the shared state alive.
///
/// Releasing never suspends the releaser: the woken waiter only runs once
/// the releaser next suspends.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<RefCell<SemInner>>,
}

impl Semaphore {
    /// Create a semaphore with the given initial counter.
    pub fn new(counter: i64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SemInner {
                counter,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Wait for a permit.
    ///
    /// Decrements and proceeds when the counter is positive; suspends
    /// otherwise. Resolves to a [`SemGuard`] that releases on drop — call
    /// [`SemGuard::forget`] when the semaphore is used for signalling
    /// rather than mutual exclusion.
    pub fn wait(&self) -> SemWait {
        SemWait {
            sem: self.clone(),
            queued: false,
        }
    }

    /// Release one permit.
    ///
    /// A negative counter just climbs towards zero. At zero, the oldest
    /// waiter (if any) is moved to the ready-queue tail without touching
    /// the counter; otherwise the counter increments.
    pub fn rel(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.counter < 0 {
            inner.counter += 1;
        } else if let Some(key) = inner.waiters.pop_front() {
            drop(inner);
            Self::wake(key);
        } else {
            inner.counter += 1;
        }
    }

    /// Release every waiter and bring the counter back to zero.
    ///
    /// A no-op when the counter is positive.
    pub fn rel_all(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.counter > 0 {
            return;
        }
        inner.counter = 0;
        let waiters: Vec<usize> = inner.waiters.drain(..).collect();
        drop(inner);
        for key in waiters {
            Self::wake(key);
        }
    }

    /// Current counter value.
    pub fn count(&self) -> i64 {
        self.inner.borrow().counter
    }

    fn wake(key: usize) {
        let woken = Pool::try_with_current(|pool| {
            mods::on_sem_unwait(pool, key);
            pool.ready.borrow_mut().push_back(key);
        });
        if woken.is_none() {
            error!("semaphore released a waiter outside a running pool");
        }
    }
}

/// Future of [`Semaphore::wait`].
pub struct SemWait {
    sem: Semaphore,
    queued: bool,
}

impl Future for SemWait {
    type Output = SemGuard;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.queued {
            // Woken by a release; the releaser did not increment for us.
            return Poll::Ready(SemGuard {
                sem: Some(this.sem.clone()),
            });
        }
        {
            let mut inner = this.sem.inner.borrow_mut();
            if inner.counter > 0 {
                inner.counter -= 1;
                drop(inner);
                return Poll::Ready(SemGuard {
                    sem: Some(this.sem.clone()),
                });
            }
        }
        Pool::with_current(|pool| {
            let key = pool.current_frame();
            this.sem.inner.borrow_mut().waiters.push_back(key);
            mods::on_sem_wait(pool, key, &this.sem.inner, key);
        });
        this.queued = true;
        Poll::Pending
    }
}

/// Scope guard handed out by [`Semaphore::wait`]; dropping it releases.
pub struct SemGuard {
    sem: Option<Semaphore>,
}

impl SemGuard {
    /// Defuse the guard: the permit stays consumed.
    pub fn forget(mut self) {
        self.sem = None;
    }
}

impl Drop for SemGuard {
    fn drop(&mut self) {
        if let Some(sem) = self.sem.take() {
            sem.rel();
        }
    }
}
