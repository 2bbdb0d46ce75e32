//! corio — a single-threaded cooperative coroutine pool.
//!
//! Coroutines return `i32` and run on a [`Pool`]. Awaiting a [`Task`]
//! transfers control directly to it and inherits the caller's modifiers;
//! [`sched`] starts a sibling at the tail of the ready queue with no
//! inheritance. The scheduler multiplexes fd readiness (epoll) and timers
//! (timerfd) under the tasks, so sleeps, semaphores and socket helpers all
//! suspend cooperatively.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use corio::{timed, Pool, Task, TIMEOUT_CODE};
//!
//! let pool = Pool::new().unwrap();
//! pool.sched(Task::new(async {
//!     let slow = Task::new(async {
//!         corio::sleep_s(10).await;
//!         0
//!     });
//!     let res = timed(slow, Duration::from_millis(50)).await;
//!     assert_eq!(res, TIMEOUT_CODE);
//!     0
//! }));
//! assert_eq!(pool.run(), 0);
//! ```

#![warn(missing_docs)]

pub use corio_runtime::*;
