//! Host event-queue backend and thin syscall helpers
//!
//! The engine talks to the kernel's filter-keyed event queue through the
//! portable [`Kevent`] record. On FreeBSD and macOS this is `kqueue(2)`
//! itself; on Linux an epoll-backed stand-in provides the same interface so
//! the engine runs unchanged there.

use bitflags::bitflags;
use core::time::Duration;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[cfg(any(target_os = "freebsd", target_os = "macos", target_os = "ios"))]
mod kqueue;
#[cfg(any(target_os = "freebsd", target_os = "macos", target_os = "ios"))]
pub use kqueue::{close_queue, kevent, kevent_receipt, kqueue};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod emulated;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use emulated::{close_queue, kevent, kevent_receipt, kqueue};

/// Event filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Filter {
    Read,
    Write,
    Except,
    User,
    Timer,
    Signal,
}

bitflags! {
    /// Action and status flags of a queue change or event
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EvFlags: u16 {
        const ADD = 0x0001;
        const DELETE = 0x0002;
        const ENABLE = 0x0004;
        const DISABLE = 0x0008;
        const ONESHOT = 0x0010;
        const CLEAR = 0x0020;
        const RECEIPT = 0x0040;
        const DISPATCH = 0x0080;
        const ERROR = 0x4000;
        const EOF = 0x8000;
    }
}

impl EvFlags {
    /// Flags that describe how a registration reports, as opposed to actions
    pub const MODE: EvFlags = EvFlags::ONESHOT.union(EvFlags::CLEAR).union(EvFlags::DISPATCH);
}

/// Trigger a user event
pub const NOTE_TRIGGER: u32 = 0x0100_0000;

/// One change or event on a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kevent {
    pub ident: usize,
    pub filter: Filter,
    pub flags: EvFlags,
    pub fflags: u32,
    pub data: i64,
    pub udata: u64,
}

impl Kevent {
    pub const EMPTY: Kevent = Kevent::new(0, Filter::Read, EvFlags::empty());

    pub const fn new(ident: usize, filter: Filter, flags: EvFlags) -> Self {
        Self {
            ident,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: 0,
        }
    }

    pub const fn with_fflags(mut self, fflags: u32) -> Self {
        self.fflags = fflags;
        self
    }

    pub const fn with_data(mut self, data: i64) -> Self {
        self.data = data;
        self
    }

    /// Errno attached to a receipt, if the change failed
    pub fn error(&self) -> Option<i32> {
        if self.flags.contains(EvFlags::ERROR) && self.data != 0 {
            Some(self.data as i32)
        } else {
            None
        }
    }
}

/// Apply changes without fetching events; stops at the first failing change
pub fn apply(kq: RawFd, changes: &[Kevent]) -> io::Result<()> {
    kevent(kq, changes, &mut [], Some(Duration::ZERO)).map(drop)
}

/// Fetch pending events without blocking
pub fn drain(kq: RawFd, events: &mut [Kevent]) -> io::Result<usize> {
    kevent(kq, &[], events, Some(Duration::ZERO))
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as _,
    }
}

/// Milliseconds for `poll(2)`, rounded up so short waits do not spin
pub fn poll_timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// `ppoll(2)`: poll with a timeout and an atomically substituted signal mask
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub fn ppoll(
    fds: &mut [libc::pollfd],
    timeout: Option<Duration>,
    sigmask: Option<&libc::sigset_t>,
) -> io::Result<usize> {
    let ts = timeout.map(timespec);
    let ts_ptr = ts.as_ref().map_or(core::ptr::null(), |ts| ts as *const libc::timespec);
    let mask_ptr = sigmask.map_or(core::ptr::null(), |m| m as *const libc::sigset_t);
    // SAFETY: pointers are valid for the duration of the call.
    let n = cvt(unsafe { libc::ppoll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ts_ptr, mask_ptr) })?;
    Ok(n as usize)
}

/// `ppoll(2)` approximation: the mask swap and the poll are two calls here
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn ppoll(
    fds: &mut [libc::pollfd],
    timeout: Option<Duration>,
    sigmask: Option<&libc::sigset_t>,
) -> io::Result<usize> {
    let mut saved: libc::sigset_t = unsafe { core::mem::zeroed() };
    if let Some(mask) = sigmask {
        // SAFETY: both sets are valid sigset_t values.
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, mask, &mut saved) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    // SAFETY: fds is a valid, exclusively borrowed slice.
    let res = cvt(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, poll_timeout_ms(timeout)) });
    if sigmask.is_some() {
        // SAFETY: restores the mask saved above.
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &saved, core::ptr::null_mut()) };
    }
    Ok(res? as usize)
}

/// Non-blocking readiness check of a single descriptor
pub fn poll_now(fd: RawFd, events: libc::c_short) -> io::Result<libc::c_short> {
    let mut pfd = [libc::pollfd {
        fd,
        events,
        revents: 0,
    }];
    // SAFETY: one valid pollfd.
    cvt(unsafe { libc::poll(pfd.as_mut_ptr(), 1, 0) })?;
    Ok(pfd[0].revents)
}

/// Block until `fd` is readable or the timeout passes
pub fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let mut pfd = [libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }];
    Ok(ppoll(&mut pfd, timeout, None)? > 0)
}

pub fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    // SAFETY: fcntl on an integer descriptor has no memory effects.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let new = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if new != flags {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, new) })?;
    }
    Ok(())
}

pub fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<()> {
    // SAFETY: fcntl on an integer descriptor has no memory effects.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let new = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if new != flags {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, new) })?;
    }
    Ok(())
}

/// Whether `fd` names an open descriptor in this process
pub fn is_fd_open(fd: RawFd) -> bool {
    // SAFETY: F_GETFD only inspects the descriptor table.
    fd >= 0 && unsafe { libc::fcntl(fd, libc::F_GETFD) } >= 0
}

/// Non-blocking, close-on-exec pipe as (read end, write end)
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for two descriptors.
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    // SAFETY: pipe(2) just returned these and nothing else owns them.
    let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for end in [&reader, &writer] {
        set_cloexec(end.as_raw_fd(), true)?;
        set_nonblocking(end.as_raw_fd(), true)?;
    }
    Ok((reader, writer))
}

/// Read into `buf`, mapping the return value
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for buf.len() bytes.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Write `buf`, mapping the return value
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for buf.len() bytes.
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Current reading of `clock` since its epoch
pub fn clock_now(clock: libc::clockid_t) -> io::Result<Duration> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid out-parameter.
    cvt(unsafe { libc::clock_gettime(clock, &mut ts) })?;
    Ok(Duration::new(ts.tv_sec.max(0) as u64, ts.tv_nsec.max(0) as u32))
}

/// Build a `pollfd` entry with no reported events
pub fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}
