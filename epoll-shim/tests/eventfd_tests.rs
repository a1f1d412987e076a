//! eventfd tests

use std::thread;
use std::time::Duration;

use epoll_shim::flags::eventfd::{EFD_NONBLOCK, EFD_SEMAPHORE};
use epoll_shim::*;

fn read_u64(fd: i32) -> Result<u64> {
    let mut buf = [0u8; 8];
    let n = read(fd, &mut buf)?;
    assert_eq!(n, 8);
    Ok(u64::from_ne_bytes(buf))
}

#[test]
fn test_counter_accumulates_and_resets() {
    let efd = eventfd(3, EFD_NONBLOCK).unwrap();
    eventfd_write(efd, 4).unwrap();
    assert_eq!(write(efd, &5u64.to_ne_bytes()).unwrap(), 8);

    assert_eq!(read_u64(efd).unwrap(), 12);
    assert_eq!(read_u64(efd), Err(SyscallError::WouldBlock));
    close(efd).unwrap();
}

#[test]
fn test_semaphore_reads_one_at_a_time() {
    let efd = eventfd(2, EFD_SEMAPHORE | EFD_NONBLOCK).unwrap();
    assert_eq!(eventfd_read(efd).unwrap(), 1);
    assert_eq!(eventfd_read(efd).unwrap(), 1);
    assert_eq!(eventfd_read(efd), Err(SyscallError::WouldBlock));
    close(efd).unwrap();
}

#[test]
fn test_bad_arguments() {
    assert_eq!(eventfd(0, 0x4000_0000), Err(SyscallError::InvalidArgument));

    let efd = eventfd(1, EFD_NONBLOCK).unwrap();
    let mut short = [0u8; 4];
    assert_eq!(read(efd, &mut short), Err(SyscallError::InvalidArgument));
    assert_eq!(write(efd, &[0u8; 4]), Err(SyscallError::InvalidArgument));
    assert_eq!(eventfd_write(efd, u64::MAX), Err(SyscallError::InvalidArgument));
    // The counter survived the failed calls.
    assert_eq!(eventfd_read(efd).unwrap(), 1);
    close(efd).unwrap();
}

#[test]
fn test_write_past_maximum_would_block() {
    let efd = eventfd(0, EFD_NONBLOCK).unwrap();
    eventfd_write(efd, u64::MAX - 2).unwrap();
    assert_eq!(eventfd_write(efd, 2), Err(SyscallError::WouldBlock));
    eventfd_write(efd, 1).unwrap();
    assert_eq!(eventfd_read(efd).unwrap(), u64::MAX - 1);
    close(efd).unwrap();
}

#[test]
fn test_blocking_read_woken_by_writer() {
    let efd = eventfd(0, 0).unwrap();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        eventfd_write(efd, 9).unwrap();
    });
    assert_eq!(eventfd_read(efd).unwrap(), 9);
    writer.join().unwrap();
    close(efd).unwrap();
}

#[test]
fn test_poll_reports_counter_state() {
    let efd = eventfd(0, EFD_NONBLOCK).unwrap();
    let mut fds = [libc::pollfd {
        fd: efd,
        events: libc::POLLIN | libc::POLLOUT,
        revents: 0,
    }];
    assert_eq!(poll(&mut fds, 0).unwrap(), 1);
    assert_eq!(fds[0].revents, libc::POLLOUT);

    eventfd_write(efd, 1).unwrap();
    assert_eq!(poll(&mut fds, 0).unwrap(), 1);
    assert_eq!(fds[0].revents, libc::POLLIN | libc::POLLOUT);

    fds[0].events = libc::POLLIN;
    eventfd_read(efd).unwrap();
    assert_eq!(poll(&mut fds, 0).unwrap(), 0);
    assert_eq!(fds[0].revents, 0);
    close(efd).unwrap();
}

#[test]
fn test_poll_woken_by_other_thread() {
    let efd = eventfd(0, 0).unwrap();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        eventfd_write(efd, 1).unwrap();
    });
    let mut fds = [libc::pollfd {
        fd: efd,
        events: libc::POLLIN,
        revents: 0,
    }];
    assert_eq!(poll(&mut fds, 5000).unwrap(), 1);
    assert_eq!(fds[0].revents, libc::POLLIN);
    writer.join().unwrap();
    close(efd).unwrap();
}

#[test]
fn test_read_on_closed_descriptor() {
    let efd = eventfd(0, EFD_NONBLOCK).unwrap();
    close(efd).unwrap();
    assert_eq!(eventfd_read(1 << 20), Err(SyscallError::BadDescriptor));
}
