//! The coroutine pool of corio.
//!
//! A [`Pool`] drives integer-returning coroutines on a single thread.
//! Awaiting a [`Task`] transfers control directly to the callee (a *call
//! edge*); [`sched`] places a sibling at the tail of the ready queue (a
//! *spawn edge*). Suspension happens only at the explicit await points
//! exported here: sub-task awaits, [`yield_now`], the sleeps, semaphore
//! waits, fd waits and [`force_stop`].
//!
//! Modifiers observe the lifecycle of a call chain and are inherited along
//! call edges but not spawn edges: [`timed`] aborts a whole chain when it
//! overruns, [`trace`] forwards every lifecycle event to a callback.
//!
//! ```no_run
//! use corio_runtime::{Pool, Task};
//!
//! let pool = Pool::new().unwrap();
//! pool.sched(Task::new(async {
//!     corio_runtime::sleep_ms(10).await;
//!     42
//! }));
//! assert_eq!(pool.run(), 0);
//! ```

#![warn(missing_docs)]

mod fd_table;
mod io;
mod mods;
mod pool;
mod sem;
mod task;
mod time;

pub use corio_driver::{Interest, RawFd};

pub use crate::{
    io::{accept, connect, read, read_sz, stopfd, wait_event, write, write_sz, WaitEvent},
    mods::{timed, trace, Moment},
    pool::Pool,
    sem::{SemGuard, SemWait, Semaphore},
    task::{force_stop, sched, when_all, yield_now, Call, ForceStop, Task, TaskId, Yield},
    time::{sleep_ms, sleep_s, sleep_us, var_sleep_ms, var_sleep_s, var_sleep_us, SleepHandle},
};

/// Generic failure: a syscall failed, an invariant was violated, or a peer
/// closed mid-transfer.
pub const GENERIC_CODE: i32 = -1;

/// The call chain was aborted by its timeout modifier.
pub const TIMEOUT_CODE: i32 = -2;

/// The suspension was aborted externally by [`stopfd`].
pub const WAKEUP_CODE: i32 = -4;
