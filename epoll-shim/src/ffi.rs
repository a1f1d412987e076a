//! C ABI exports
//!
//! Errors set `errno` and return -1, as the libc calls they stand in for.
//! Only built on kqueue hosts; on Linux these names belong to libc.

use core::time::Duration;
use std::os::fd::RawFd;

use libc::{c_int, c_uint, c_void, size_t, ssize_t};

use shim_api::{EpollEvent, Itimerspec, Result, SyscallError, TimerSpec};

fn set_errno(errno: c_int) {
    // SAFETY: __error returns the calling thread's errno slot.
    unsafe { *libc::__error() = errno };
}

fn ret_int(res: Result<c_int>) -> c_int {
    res.unwrap_or_else(|err| {
        set_errno(err.to_errno());
        -1
    })
}

fn ret_size(res: Result<usize>) -> ssize_t {
    match res {
        Ok(n) => n as ssize_t,
        Err(err) => {
            set_errno(err.to_errno());
            -1
        }
    }
}

/// Borrow a caller-provided event array
///
/// # Safety
/// `events` must point to `maxevents` writable records.
unsafe fn events_mut<'a>(events: *mut EpollEvent, maxevents: c_int) -> Result<&'a mut [EpollEvent]> {
    if maxevents <= 0 {
        return Err(SyscallError::InvalidArgument);
    }
    if events.is_null() {
        return Err(SyscallError::BadAddress);
    }
    Ok(unsafe { core::slice::from_raw_parts_mut(events, maxevents as usize) })
}

#[unsafe(no_mangle)]
pub extern "C" fn epoll_create(size: c_int) -> c_int {
    ret_int(crate::epoll_create(size))
}

#[unsafe(no_mangle)]
pub extern "C" fn epoll_create1(flags: c_int) -> c_int {
    ret_int(crate::epoll_create1(flags))
}

/// # Safety
/// `event` is null or points to a valid record.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn epoll_ctl(epfd: c_int, op: c_int, fd: c_int, event: *mut EpollEvent) -> c_int {
    // SAFETY: caller contract.
    let event = unsafe { event.as_ref() };
    ret_int(crate::epoll_ctl(epfd, op, fd, event).map(|()| 0))
}

/// # Safety
/// `events` points to `maxevents` writable records.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn epoll_wait(epfd: c_int, events: *mut EpollEvent, maxevents: c_int, timeout: c_int) -> c_int {
    // SAFETY: caller contract.
    let res = unsafe { events_mut(events, maxevents) }.and_then(|events| crate::epoll_wait(epfd, events, timeout));
    ret_int(res.map(|n| n as c_int))
}

/// # Safety
/// `events` points to `maxevents` writable records; `sigmask` is null or
/// points to a valid set.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn epoll_pwait(
    epfd: c_int,
    events: *mut EpollEvent,
    maxevents: c_int,
    timeout: c_int,
    sigmask: *const libc::sigset_t,
) -> c_int {
    // SAFETY: caller contract.
    let sigmask = unsafe { sigmask.as_ref() };
    let res = unsafe { events_mut(events, maxevents) }
        .and_then(|events| crate::epoll_pwait(epfd, events, timeout, sigmask));
    ret_int(res.map(|n| n as c_int))
}

/// # Safety
/// As `epoll_pwait`; `timeout` is null (wait forever) or a valid timespec.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn epoll_pwait2(
    epfd: c_int,
    events: *mut EpollEvent,
    maxevents: c_int,
    timeout: *const libc::timespec,
    sigmask: *const libc::sigset_t,
) -> c_int {
    // SAFETY: caller contract.
    let (timeout, sigmask) = unsafe { (timeout.as_ref(), sigmask.as_ref()) };
    let timeout = match timeout {
        None => Ok(None),
        Some(ts) if ts.tv_sec < 0 || !(0..1_000_000_000).contains(&(ts.tv_nsec as i64)) => {
            Err(SyscallError::InvalidArgument)
        }
        Some(ts) => Ok(Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))),
    };
    let res = timeout.and_then(|timeout| {
        // SAFETY: caller contract.
        let events = unsafe { events_mut(events, maxevents) }?;
        crate::epoll_pwait2(epfd, events, timeout, sigmask)
    });
    ret_int(res.map(|n| n as c_int))
}

#[unsafe(no_mangle)]
pub extern "C" fn eventfd(initval: c_uint, flags: c_int) -> c_int {
    ret_int(crate::eventfd(initval, flags))
}

/// # Safety
/// `value` points to a writable u64.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn eventfd_read(fd: c_int, value: *mut u64) -> c_int {
    if value.is_null() {
        set_errno(libc::EFAULT);
        return -1;
    }
    ret_int(crate::eventfd_read(fd).map(|v| {
        // SAFETY: checked non-null; caller contract.
        unsafe { *value = v };
        0
    }))
}

#[unsafe(no_mangle)]
pub extern "C" fn eventfd_write(fd: c_int, value: u64) -> c_int {
    ret_int(crate::eventfd_write(fd, value).map(|()| 0))
}

#[unsafe(no_mangle)]
pub extern "C" fn timerfd_create(clockid: libc::clockid_t, flags: c_int) -> c_int {
    ret_int(crate::timerfd_create(clockid, flags))
}

/// # Safety
/// `new_value` points to a valid record; `old_value` is null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn timerfd_settime(
    fd: c_int,
    flags: c_int,
    new_value: *const Itimerspec,
    old_value: *mut Itimerspec,
) -> c_int {
    // SAFETY: caller contract.
    let Some(new_value) = (unsafe { new_value.as_ref() }) else {
        set_errno(libc::EFAULT);
        return -1;
    };
    let res = TimerSpec::try_from(new_value)
        .and_then(|spec| crate::timerfd_settime(fd, flags, &spec))
        .map(|old| {
            // SAFETY: caller contract.
            if let Some(slot) = unsafe { old_value.as_mut() } {
                *slot = Itimerspec::from(old);
            }
            0
        });
    ret_int(res)
}

/// # Safety
/// `curr_value` points to a writable record.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn timerfd_gettime(fd: c_int, curr_value: *mut Itimerspec) -> c_int {
    // SAFETY: caller contract.
    let Some(slot) = (unsafe { curr_value.as_mut() }) else {
        set_errno(libc::EFAULT);
        return -1;
    };
    ret_int(crate::timerfd_gettime(fd).map(|spec| {
        *slot = Itimerspec::from(spec);
        0
    }))
}

/// # Safety
/// `mask` points to a valid signal set.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signalfd(fd: c_int, mask: *const libc::sigset_t, flags: c_int) -> c_int {
    // SAFETY: caller contract.
    let Some(mask) = (unsafe { mask.as_ref() }) else {
        set_errno(libc::EFAULT);
        return -1;
    };
    ret_int(crate::signalfd(fd as RawFd, mask, flags))
}

#[unsafe(no_mangle)]
pub extern "C" fn epoll_shim_close(fd: c_int) -> c_int {
    ret_int(crate::close(fd).map(|()| 0))
}

/// # Safety
/// `buf` points to `nbytes` writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn epoll_shim_read(fd: c_int, buf: *mut c_void, nbytes: size_t) -> ssize_t {
    if buf.is_null() && nbytes > 0 {
        set_errno(libc::EFAULT);
        return -1;
    }
    let buf: &mut [u8] = if nbytes == 0 {
        &mut []
    } else {
        // SAFETY: caller contract.
        unsafe { core::slice::from_raw_parts_mut(buf.cast(), nbytes) }
    };
    ret_size(crate::read(fd, buf))
}

/// # Safety
/// `buf` points to `nbytes` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn epoll_shim_write(fd: c_int, buf: *const c_void, nbytes: size_t) -> ssize_t {
    if buf.is_null() && nbytes > 0 {
        set_errno(libc::EFAULT);
        return -1;
    }
    let buf: &[u8] = if nbytes == 0 {
        &[]
    } else {
        // SAFETY: caller contract.
        unsafe { core::slice::from_raw_parts(buf.cast(), nbytes) }
    };
    ret_size(crate::write(fd, buf))
}

/// # Safety
/// `fds` points to `nfds` valid entries.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn epoll_shim_poll(fds: *mut libc::pollfd, nfds: libc::nfds_t, timeout: c_int) -> c_int {
    // SAFETY: caller contract.
    let Some(fds) = (unsafe { pollfds_mut(fds, nfds) }) else {
        set_errno(libc::EFAULT);
        return -1;
    };
    ret_int(crate::poll(fds, timeout).map(|n| n as c_int))
}

/// # Safety
/// `fds` points to `nfds` valid entries; `tmo_p` and `sigmask` are null or
/// valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn epoll_shim_ppoll(
    fds: *mut libc::pollfd,
    nfds: libc::nfds_t,
    tmo_p: *const libc::timespec,
    sigmask: *const libc::sigset_t,
) -> c_int {
    // SAFETY: caller contract.
    let Some(fds) = (unsafe { pollfds_mut(fds, nfds) }) else {
        set_errno(libc::EFAULT);
        return -1;
    };
    // SAFETY: caller contract.
    let (tmo, sigmask) = unsafe { (tmo_p.as_ref(), sigmask.as_ref()) };
    let timeout = match tmo {
        None => None,
        Some(ts) if ts.tv_sec < 0 || ts.tv_nsec < 0 || ts.tv_nsec >= 1_000_000_000 => {
            set_errno(libc::EINVAL);
            return -1;
        }
        Some(ts) => Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)),
    };
    ret_int(crate::ppoll(fds, timeout, sigmask).map(|n| n as c_int))
}

/// Non-variadic `fcntl`; the argument is taken as an int
#[unsafe(no_mangle)]
pub extern "C" fn epoll_shim_fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    ret_int(crate::fcntl(fd, cmd, arg))
}

/// # Safety
/// `fds` is null with `nfds == 0`, or points to `nfds` entries.
unsafe fn pollfds_mut<'a>(fds: *mut libc::pollfd, nfds: libc::nfds_t) -> Option<&'a mut [libc::pollfd]> {
    if nfds == 0 {
        return Some(&mut []);
    }
    if fds.is_null() {
        return None;
    }
    // SAFETY: caller contract.
    Some(unsafe { core::slice::from_raw_parts_mut(fds, nfds as usize) })
}
