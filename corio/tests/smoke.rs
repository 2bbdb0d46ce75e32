use std::{cell::Cell, os::fd::AsRawFd, rc::Rc, time::Duration};

use corio::{sched, timed, Pool, Task, TIMEOUT_CODE};
use socket2::{Domain, Socket, Type};

#[test]
fn echo_over_a_socket_pair() {
    let pool = Pool::new().unwrap();
    let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
    let (fd_a, fd_b) = (a.as_raw_fd(), b.as_raw_fd());
    let echoed = Rc::new(Cell::new(false));

    pool.sched(Task::new(async move {
        let mut buf = [0u8; 4];
        assert_eq!(corio::read_sz(fd_b, &mut buf).await, 4);
        assert_eq!(corio::write_sz(fd_b, &buf).await, 4);
        0
    }));
    {
        let echoed = Rc::clone(&echoed);
        pool.sched(Task::new(async move {
            assert_eq!(corio::write_sz(fd_a, b"ping").await, 4);
            let mut buf = [0u8; 4];
            assert_eq!(corio::read_sz(fd_a, &mut buf).await, 4);
            assert_eq!(&buf, b"ping");
            echoed.set(true);
            0
        }));
    }

    assert_eq!(pool.run(), 0);
    assert!(echoed.get());
}

#[test]
fn facade_exposes_the_timeout_path() {
    let pool = Pool::new().unwrap();
    let result = Rc::new(Cell::new(0));

    {
        let result = Rc::clone(&result);
        pool.sched(Task::new(async move {
            sched(Task::new(async {
                corio::yield_now().await;
                0
            }));
            let slow = Task::new(async {
                corio::sleep_s(5).await;
                0
            });
            result.set(timed(slow, Duration::from_millis(20)).await);
            0
        }));
    }

    assert_eq!(pool.run(), 0);
    assert_eq!(result.get(), TIMEOUT_CODE);
}
