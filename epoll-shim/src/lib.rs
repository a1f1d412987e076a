//! epoll-shim
//!
//! This crate provides Linux's readiness-notification interface (`epoll`)
//! and the descriptor-backed notification primitives (`eventfd`,
//! `timerfd`, `signalfd`) on kernels that only offer `kqueue`.
//!
//! # Architecture
//!
//! The shim is organized into several layers:
//!
//! - **sys**: the kqueue interface (native, or an epoll-backed stand-in on
//!   Linux hosts so the engine can be exercised there)
//! - **table**: process-wide table of shim descriptors, indexed by the
//!   queue identity each one owns
//! - **file**: the shared descriptor record and its behavior table
//! - **epoll**: registration control, event translation and waiting
//! - **eventfd / timerfd / signalfd**: the primitives, each a queue that
//!   is readable exactly while the primitive is
//!
//! Descriptors returned by the shim are real kernel handles. Pass them
//! back through [`read`], [`write`] and [`close`] here rather than the
//! libc calls, so the shim sees every state change.
//!
//! # Usage
//!
//! ```rust
//! use epoll_shim::{EpollEvent, EpollFlags, EPOLL_CTL_ADD};
//!
//! let epfd = epoll_shim::epoll_create1(0).unwrap();
//! let efd = epoll_shim::eventfd(0, 0).unwrap();
//! let interest = EpollEvent::new(EpollFlags::EPOLLIN, 7);
//! epoll_shim::epoll_ctl(epfd, EPOLL_CTL_ADD, efd, Some(&interest)).unwrap();
//!
//! epoll_shim::eventfd_write(efd, 1).unwrap();
//! let mut events = [EpollEvent::default(); 4];
//! let n = epoll_shim::epoll_wait(epfd, &mut events, 1000).unwrap();
//! assert_eq!(n, 1);
//! assert_eq!(events[0].data(), 7);
//!
//! epoll_shim::close(efd).unwrap();
//! epoll_shim::close(epfd).unwrap();
//! ```

#[macro_use]
mod logging;

pub mod config;
pub mod epoll;
pub mod eventfd;
pub mod file;
pub mod pollable;
pub mod signalfd;
pub mod sys;
pub mod table;
pub mod timerfd;
pub mod wake;

#[cfg(all(feature = "ffi", any(target_os = "freebsd", target_os = "macos", target_os = "ios")))]
mod ffi;

use core::time::Duration;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

// Re-export commonly used items
pub use shim_api::epoll::{EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD};
pub use shim_api::flags;
pub use shim_api::{
    EpollEvent, EpollFlags, EpollOp, Itimerspec, Result, SignalfdSiginfo, SyscallError, TimerSpec, EPOLL_CLOEXEC,
};

pub use eventfd::{eventfd, eventfd_read, eventfd_write};
pub use signalfd::signalfd;
pub use timerfd::{timerfd_create, timerfd_gettime, timerfd_settime, Clock};

use crate::epoll::node::{epoll_to_poll, poll_to_epoll};
use crate::file::FileDescription;
use crate::table::shim_ctx;

/// Create a multiplexer; `size` is only checked for being positive
pub fn epoll_create(size: i32) -> Result<RawFd> {
    if size <= 0 {
        return Err(SyscallError::InvalidArgument);
    }
    epoll::create(0)
}

/// Create a multiplexer; `flags` may hold `EPOLL_CLOEXEC`
pub fn epoll_create1(flags: i32) -> Result<RawFd> {
    epoll::create(flags)
}

/// Add, modify or delete the registration of `fd`; `event` is ignored by
/// `EPOLL_CTL_DEL`
pub fn epoll_ctl(epfd: RawFd, op: i32, fd: RawFd, event: Option<&EpollEvent>) -> Result<()> {
    epoll::ctl(epfd, op, fd, event)
}

fn timeout_from_ms(timeout_ms: i32) -> Option<Duration> {
    u64::try_from(timeout_ms).ok().map(Duration::from_millis)
}

/// Wait up to `timeout_ms` milliseconds; negative waits forever
pub fn epoll_wait(epfd: RawFd, events: &mut [EpollEvent], timeout_ms: i32) -> Result<usize> {
    epoll::wait(epfd, events, timeout_from_ms(timeout_ms), None)
}

/// `epoll_wait` with the signal mask replaced while blocked
pub fn epoll_pwait(
    epfd: RawFd,
    events: &mut [EpollEvent],
    timeout_ms: i32,
    sigmask: Option<&libc::sigset_t>,
) -> Result<usize> {
    epoll::wait(epfd, events, timeout_from_ms(timeout_ms), sigmask)
}

/// `epoll_pwait` with a full-resolution timeout; `None` waits forever
pub fn epoll_pwait2(
    epfd: RawFd,
    events: &mut [EpollEvent],
    timeout: Option<Duration>,
    sigmask: Option<&libc::sigset_t>,
) -> Result<usize> {
    epoll::wait(epfd, events, timeout, sigmask)
}

fn find_desc(fd: RawFd) -> Result<Option<Arc<FileDescription>>> {
    Ok(shim_ctx()?.find_desc(fd))
}

/// Read from a shim descriptor, or from any other descriptor
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    match find_desc(fd)? {
        Some(desc) => desc.read(buf),
        None => sys::read(fd, buf).map_err(SyscallError::from),
    }
}

/// Write to a shim descriptor, or to any other descriptor
pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    match find_desc(fd)? {
        Some(desc) => desc.write(buf),
        None => sys::write(fd, buf).map_err(SyscallError::from),
    }
}

/// Close any descriptor
///
/// Every multiplexer watching `fd` forgets it before the descriptor goes
/// away. A shim descriptor's queue is closed once the last in-flight
/// operation on it has finished.
pub fn close(fd: RawFd) -> Result<()> {
    match shim_ctx()?.remove_desc(fd) {
        Some(desc) => {
            drop(desc);
            Ok(())
        }
        None => {
            // SAFETY: the caller gives up fd.
            if unsafe { libc::close(fd) } < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(())
        }
    }
}

/// `poll(2)` that understands shim descriptors
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> Result<usize> {
    ppoll(fds, timeout_from_ms(timeout_ms), None)
}

/// `ppoll(2)` that understands shim descriptors
///
/// Shim entries get their readiness from the descriptor itself; the
/// blocking part watches their queues next to the other entries.
pub fn ppoll(fds: &mut [libc::pollfd], timeout: Option<Duration>, sigmask: Option<&libc::sigset_t>) -> Result<usize> {
    let shim = shim_ctx()?;
    let descs: Vec<Option<Arc<FileDescription>>> = fds.iter().map(|pfd| shim.find_desc(pfd.fd)).collect();
    if descs.iter().all(Option::is_none) {
        return sys::ppoll(fds, timeout, sigmask).map_err(SyscallError::from);
    }

    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    let mut work: Vec<libc::pollfd> = fds
        .iter()
        .zip(&descs)
        .map(|(pfd, desc)| match desc {
            Some(desc) => sys::pollfd(desc.fd(), libc::POLLIN),
            None => sys::pollfd(pfd.fd, pfd.events),
        })
        .collect();
    // Writability of shim descriptors is not signalled on their queues.
    let wants_write = fds
        .iter()
        .zip(&descs)
        .any(|(pfd, desc)| desc.is_some() && pfd.events & (libc::POLLOUT | libc::POLLWRNORM) != 0);

    loop {
        let mut shim_ready = false;
        for (pfd, desc) in fds.iter_mut().zip(&descs) {
            if let Some(desc) = desc {
                let interest = poll_to_epoll(pfd.events) | EpollFlags::ALWAYS_REPORTED;
                pfd.revents = epoll_to_poll(desc.poll_events() & interest);
                shim_ready |= pfd.revents != 0;
            }
        }

        let remaining = match deadline {
            _ if shim_ready => Some(Duration::ZERO),
            None => None,
            Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
        };
        let budget = match (remaining, wants_write) {
            (Some(left), true) => Some(left.min(config::config().blocked_write_retry)),
            (None, true) => Some(config::config().blocked_write_retry),
            (left, false) => left,
        };
        for pfd in work.iter_mut() {
            pfd.revents = 0;
        }
        match sys::ppoll(&mut work, budget, sigmask) {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => return Err(SyscallError::Interrupted),
            Err(err) => return Err(err.into()),
        }
        for ((pfd, desc), polled) in fds.iter_mut().zip(&descs).zip(&work) {
            if desc.is_none() {
                pfd.revents = polled.revents;
            }
        }

        let ready = fds.iter().filter(|pfd| pfd.revents != 0).count();
        if ready > 0 {
            return Ok(ready);
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Ok(0);
        }
    }
}

/// `fcntl(2)` with `F_GETFL` / `F_SETFL` routed to shim descriptors
///
/// Only `O_NONBLOCK` is kept by shim descriptors; other commands act on
/// the descriptor itself.
pub fn fcntl(fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> Result<libc::c_int> {
    if let Some(desc) = find_desc(fd)? {
        match cmd {
            libc::F_GETFL => return Ok(desc.status_flags() | libc::O_RDWR),
            libc::F_SETFL => {
                desc.set_status_flags(arg);
                return Ok(0);
            }
            _ => {}
        }
    }
    // SAFETY: fcntl with an integer argument has no memory effects.
    let rc = unsafe { libc::fcntl(fd, cmd, arg) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(rc)
}
