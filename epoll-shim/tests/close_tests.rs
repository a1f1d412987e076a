//! close tests

use std::os::fd::RawFd;

use epoll_shim::flags::eventfd::EFD_NONBLOCK;
use epoll_shim::*;

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn add(epfd: RawFd, fd: RawFd, data: u64) -> Result<()> {
    epoll_ctl(epfd, EPOLL_CTL_ADD, fd, Some(&EpollEvent::new(EpollFlags::EPOLLIN, data)))
}

#[test]
fn test_closing_pipe_purges_every_multiplexer() {
    let first = epoll_create1(0).unwrap();
    let second = epoll_create1(0).unwrap();
    let (reader, writer) = pipe();
    add(first, reader, 1).unwrap();
    add(second, reader, 2).unwrap();

    close(reader).unwrap();
    assert!(epoll::watched_fds(first).unwrap().is_empty());
    assert!(epoll::watched_fds(second).unwrap().is_empty());

    let mut events = [EpollEvent::default(); 4];
    assert_eq!(epoll_wait(first, &mut events, 0).unwrap(), 0);

    for fd in [writer, first, second] {
        close(fd).unwrap();
    }
}

#[test]
fn test_closing_shim_descriptor_purges_every_multiplexer() {
    let first = epoll_create1(0).unwrap();
    let second = epoll_create1(0).unwrap();
    let efd = eventfd(1, EFD_NONBLOCK).unwrap();
    add(first, efd, 1).unwrap();
    add(second, efd, 2).unwrap();

    let mut events = [EpollEvent::default(); 4];
    assert_eq!(epoll_wait(second, &mut events, 0).unwrap(), 1);

    close(efd).unwrap();
    assert!(epoll::watched_fds(first).unwrap().is_empty());
    assert!(epoll::watched_fds(second).unwrap().is_empty());
    assert_eq!(epoll_wait(second, &mut events, 0).unwrap(), 0);

    close(first).unwrap();
    close(second).unwrap();
}

#[test]
fn test_reused_number_can_be_registered_again() {
    let epfd = epoll_create1(0).unwrap();
    let (reader, writer) = pipe();
    add(epfd, reader, 1).unwrap();
    close(reader).unwrap();
    close(writer).unwrap();

    // The lowest free numbers are handed out again.
    let (reader, writer) = pipe();
    add(epfd, reader, 2).unwrap();
    write(writer, b"x").unwrap();
    let mut events = [EpollEvent::default(); 4];
    assert_eq!(epoll_wait(epfd, &mut events, 1000).unwrap(), 1);
    assert_eq!(events[0].data(), 2);

    for fd in [reader, writer, epfd] {
        close(fd).unwrap();
    }
}

#[test]
fn test_closing_multiplexer_leaves_watched_descriptors_usable() {
    let epfd = epoll_create1(0).unwrap();
    let efd = eventfd(0, EFD_NONBLOCK).unwrap();
    add(epfd, efd, 1).unwrap();
    close(epfd).unwrap();

    eventfd_write(efd, 3).unwrap();
    assert_eq!(eventfd_read(efd).unwrap(), 3);
    close(efd).unwrap();
}

#[test]
fn test_close_of_unknown_descriptor() {
    assert_eq!(close(1 << 20), Err(SyscallError::BadDescriptor));
}
