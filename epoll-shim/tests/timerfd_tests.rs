//! timerfd tests

use std::thread;
use std::time::{Duration, Instant};

use epoll_shim::flags::timerfd::{TFD_NONBLOCK, TFD_TIMER_ABSTIME, TFD_TIMER_CANCEL_ON_SET};
use epoll_shim::*;

fn read_expirations(fd: i32) -> Result<u64> {
    let mut buf = [0u8; 8];
    assert_eq!(read(fd, &mut buf)?, 8);
    Ok(u64::from_ne_bytes(buf))
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn test_one_shot_becomes_readable_through_multiplexer() {
    let tfd = timerfd_create(libc::CLOCK_MONOTONIC, TFD_NONBLOCK).unwrap();
    let epfd = epoll_create1(0).unwrap();
    epoll_ctl(epfd, EPOLL_CTL_ADD, tfd, Some(&EpollEvent::new(EpollFlags::EPOLLIN, 77))).unwrap();

    let start = Instant::now();
    timerfd_settime(tfd, 0, &TimerSpec::new(ms(50), Duration::ZERO)).unwrap();
    let mut events = [EpollEvent::default(); 2];
    assert_eq!(epoll_wait(epfd, &mut events, 5000).unwrap(), 1);
    assert!(start.elapsed() >= ms(45));
    assert_eq!(events[0].data(), 77);
    assert_eq!(events[0].flags(), EpollFlags::EPOLLIN);

    assert_eq!(read_expirations(tfd).unwrap(), 1);
    assert_eq!(read_expirations(tfd), Err(SyscallError::WouldBlock));
    assert_eq!(epoll_wait(epfd, &mut events, 0).unwrap(), 0);
    // Fired one-shot timers report disarmed.
    assert_eq!(timerfd_gettime(tfd).unwrap(), TimerSpec::DISARMED);

    close(tfd).unwrap();
    close(epfd).unwrap();
}

#[test]
fn test_periodic_timer_counts_expirations() {
    let tfd = timerfd_create(libc::CLOCK_MONOTONIC, 0).unwrap();
    timerfd_settime(tfd, 0, &TimerSpec::new(ms(10), ms(10))).unwrap();

    // Blocking read waits for the first expiration.
    assert!(read_expirations(tfd).unwrap() >= 1);
    thread::sleep(ms(60));
    assert!(read_expirations(tfd).unwrap() >= 2);

    let spec = timerfd_gettime(tfd).unwrap();
    assert_eq!(spec.interval, ms(10));
    assert!(spec.is_armed());
    assert!(spec.value <= ms(10));
    close(tfd).unwrap();
}

#[test]
fn test_settime_returns_previous_setting_and_disarms() {
    let tfd = timerfd_create(libc::CLOCK_MONOTONIC, TFD_NONBLOCK).unwrap();
    assert_eq!(timerfd_gettime(tfd).unwrap(), TimerSpec::DISARMED);

    let old = timerfd_settime(tfd, 0, &TimerSpec::new(Duration::from_secs(60), ms(500))).unwrap();
    assert_eq!(old, TimerSpec::DISARMED);

    let old = timerfd_settime(tfd, 0, &TimerSpec::DISARMED).unwrap();
    assert_eq!(old.interval, ms(500));
    assert!(old.value > Duration::from_secs(59));
    assert_eq!(timerfd_gettime(tfd).unwrap(), TimerSpec::DISARMED);
    assert_eq!(read_expirations(tfd), Err(SyscallError::WouldBlock));
    close(tfd).unwrap();
}

#[test]
fn test_absolute_deadline_in_the_past_fires_at_once() {
    let tfd = timerfd_create(libc::CLOCK_MONOTONIC, TFD_NONBLOCK).unwrap();
    timerfd_settime(tfd, TFD_TIMER_ABSTIME, &TimerSpec::new(Duration::from_nanos(1), Duration::ZERO)).unwrap();

    let mut fds = [libc::pollfd {
        fd: tfd,
        events: libc::POLLIN,
        revents: 0,
    }];
    assert_eq!(poll(&mut fds, 1000).unwrap(), 1);
    assert_eq!(read_expirations(tfd).unwrap(), 1);
    close(tfd).unwrap();
}

#[test]
fn test_bad_arguments() {
    assert_eq!(timerfd_create(9999, 0), Err(SyscallError::InvalidArgument));
    assert_eq!(timerfd_create(libc::CLOCK_MONOTONIC, 0x10), Err(SyscallError::InvalidArgument));

    let tfd = timerfd_create(libc::CLOCK_MONOTONIC, TFD_NONBLOCK).unwrap();
    let spec = TimerSpec::new(ms(10), Duration::ZERO);
    assert_eq!(timerfd_settime(tfd, 0x100, &spec), Err(SyscallError::InvalidArgument));
    // Cancel-on-set is only meaningful for absolute wall-clock timers.
    assert_eq!(
        timerfd_settime(tfd, TFD_TIMER_ABSTIME | TFD_TIMER_CANCEL_ON_SET, &spec),
        Err(SyscallError::InvalidArgument)
    );
    let mut short = [0u8; 4];
    assert_eq!(read(tfd, &mut short), Err(SyscallError::InvalidArgument));

    let efd = eventfd(0, 0).unwrap();
    assert_eq!(timerfd_gettime(efd), Err(SyscallError::InvalidArgument));
    close(efd).unwrap();
    close(tfd).unwrap();
}
