//! epoll on top of a kqueue
//!
//! Every multiplexer is a shim descriptor whose queue identity is the
//! integer handed to the caller. Registrations become queue filters where
//! the queue can watch the descriptor kind, and entries of a poll fallback
//! list otherwise. Waiting drains the queue, probes the fallback list, and
//! blocks in `ppoll` on the queue plus the fallback descriptors.

pub mod ctx;
pub mod node;

use core::time::Duration;
use std::os::fd::RawFd;
use std::sync::MutexGuard;
use std::time::Instant;

use shim_api::{EpollEvent, EpollFlags, EpollOp, Result, SyscallError, EPOLL_CLOEXEC};

use crate::file::{DescKind, FileDescription, Payload};
use crate::pollable::{PollableDesc, PollableRef};
use crate::sys;
use crate::table::shim_ctx;
use ctx::EpollFdCtx;

/// Create a multiplexer; `flags` may only hold `EPOLL_CLOEXEC`
pub fn create(flags: i32) -> Result<RawFd> {
    if flags & !EPOLL_CLOEXEC != 0 {
        return Err(SyscallError::InvalidArgument);
    }
    let fd = shim_ctx()?.create_with(DescKind::Epoll, 0, flags & EPOLL_CLOEXEC != 0, |kq| {
        Ok(Payload::Epoll(EpollFdCtx::new(kq)?))
    })?;
    shim_debug!("epoll {}: created", fd);
    Ok(fd)
}

/// Check the event spec of a control call before anything is touched
fn validate(op: EpollOp, event: Option<&EpollEvent>) -> Result<(EpollFlags, u64)> {
    let Some(event) = event else {
        return match op {
            EpollOp::Delete => Ok((EpollFlags::empty(), 0)),
            _ => Err(SyscallError::BadAddress),
        };
    };
    if op == EpollOp::Delete {
        return Ok((EpollFlags::empty(), 0));
    }
    let raw = event.events;
    let flags = EpollFlags::from_bits(raw).ok_or(SyscallError::InvalidArgument)?;
    if flags.contains(EpollFlags::EPOLLEXCLUSIVE)
        && (op == EpollOp::Modify || !EpollFlags::EXCLUSIVE_COMPATIBLE.contains(flags))
    {
        return Err(SyscallError::InvalidArgument);
    }
    Ok((flags, event.data()))
}

/// Add, modify or delete the registration of `fd` in multiplexer `epfd`
pub fn ctl(epfd: RawFd, op: i32, fd: RawFd, event: Option<&EpollEvent>) -> Result<()> {
    let op = EpollOp::try_from(op)?;
    let shim = shim_ctx()?;
    let desc = shim.find_typed(epfd, DescKind::Epoll)?;
    if !sys::is_fd_open(fd) {
        return Err(SyscallError::BadDescriptor);
    }
    if fd == epfd {
        return Err(SyscallError::InvalidArgument);
    }
    let (flags, data) = validate(op, event)?;

    let pollable: Option<PollableRef> = match op {
        EpollOp::Add => shim.find_desc(fd).map(PollableDesc::new),
        _ => None,
    };
    if let Some(pollable) = &pollable {
        if pollable.is_multiplexer() {
            if flags.contains(EpollFlags::EPOLLEXCLUSIVE) {
                return Err(SyscallError::InvalidArgument);
            }
            // Watching a multiplexer that already watches us closes a loop.
            if pollable.watches(epfd) {
                shim_debug!("epoll {}: refusing fd {}, it would form a cycle", epfd, fd);
                return Err(SyscallError::InvalidArgument);
            }
        }
    }

    let mut guard = desc.lock();
    let ctx = guard.as_epoll()?;
    match op {
        EpollOp::Add => ctx.add(fd, flags, data, pollable)?,
        EpollOp::Modify => ctx.modify(fd, flags, data)?,
        EpollOp::Delete => ctx.delete(fd)?,
    }
    settle_pollfd_list(&desc, guard, fd)
}

/// Bring fallback list membership of `fd` up to date
///
/// Joining the list must not happen under a thread already blocked on an
/// older snapshot, so those threads are woken and waited for first.
/// Leaving it happens at once; the list-change pulse moves pollers off the
/// old snapshot. The wake is dropped by whoever is last out, a poller or a
/// parked control call, on every path.
fn settle_pollfd_list<'a>(desc: &'a FileDescription, mut guard: MutexGuard<'a, Payload>, fd: RawFd) -> Result<()> {
    let mut is_parked = false;
    let res = loop {
        let ctx = guard.as_epoll()?;
        if !ctx.pollfd_list_stale(fd) {
            break Ok(());
        }
        if ctx.nr_polling_threads == 0 || ctx.pollfd_list_shrinks(fd) {
            ctx.sync_pollfd_list(fd);
            break Ok(());
        }
        if !is_parked {
            ctx.nr_parked_ctls += 1;
            is_parked = true;
        }
        if let Err(err) = ctx.trigger_wake() {
            break Err(err);
        }
        shim_trace!("epoll {}: waiting for {} pollers", ctx.kq(), ctx.nr_polling_threads);
        guard = desc.wait(guard);
    };

    let ctx = guard.as_epoll()?;
    if is_parked {
        ctx.nr_parked_ctls -= 1;
    }
    let released = ctx.release_wake();
    res.and(released)
}

/// Drop every registration of `fd` from one multiplexer; used when `fd`
/// is closed
pub fn forget_fd(desc: &FileDescription, fd: RawFd) {
    let mut guard = desc.lock();
    let Ok(ctx) = guard.as_epoll() else {
        return;
    };
    if !ctx.is_registered(fd) {
        return;
    }
    if let Err(err) = ctx.delete(fd) {
        shim_warn!("epoll {}: purging closed fd {} failed: {}", ctx.kq(), fd, err);
        return;
    }
    // Leaving the list needs no coordination with pollers.
    ctx.sync_pollfd_list(fd);
    if let Err(err) = ctx.release_wake() {
        shim_warn!("epoll {}: clearing wake failed: {}", ctx.kq(), err);
    }
}

/// Wait for readiness on `epfd`
///
/// `None` blocks until something is ready, `Some(ZERO)` never blocks.
/// With `sigmask` the signal mask is swapped for the blocking part only.
pub fn wait(
    epfd: RawFd,
    events: &mut [EpollEvent],
    timeout: Option<Duration>,
    sigmask: Option<&libc::sigset_t>,
) -> Result<usize> {
    if events.is_empty() {
        return Err(SyscallError::InvalidArgument);
    }
    let desc = shim_ctx()?.find_typed(epfd, DescKind::Epoll)?;
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

    let mut guard = desc.lock();
    loop {
        let mut snapshot = {
            let ctx = guard.as_epoll()?;
            let n = ctx.collect(events)?;
            if n > 0 {
                return Ok(n);
            }
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(0);
                    }
                    Some(deadline - now)
                }
            };
            if ctx.wake_pending() {
                // A control call is rebuilding the fallback list.
                None
            } else {
                let budget = match (remaining, ctx.wait_cap()) {
                    (Some(left), Some(cap)) => Some(left.min(cap)),
                    (left, cap) => left.or(cap),
                };
                ctx.nr_polling_threads += 1;
                Some((ctx.take_wait_fds(), budget))
            }
        };

        drop(guard);
        let res = match &mut snapshot {
            Some((fds, budget)) => sys::ppoll(fds, *budget, sigmask),
            None => {
                std::thread::yield_now();
                Ok(0)
            }
        };
        guard = desc.lock();

        if let Some((fds, _)) = snapshot {
            let ctx = guard.as_epoll()?;
            ctx.nr_polling_threads -= 1;
            ctx.restore_scratch(fds);
            if ctx.nr_polling_threads == 0 {
                desc.notify_pollers_gone();
                ctx.release_wake()?;
            }
        }
        match res {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => return Err(SyscallError::Interrupted),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Descriptors currently registered in `epfd`, ascending
pub fn watched_fds(epfd: RawFd) -> Result<Vec<RawFd>> {
    let desc = shim_ctx()?.find_typed(epfd, DescKind::Epoll)?;
    let mut guard = desc.lock();
    Ok(guard.as_epoll()?.watched_fds())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_bad_specs() {
        let ev = EpollEvent::new(EpollFlags::EPOLLIN, 1);
        assert_eq!(validate(EpollOp::Add, Some(&ev)), Ok((EpollFlags::EPOLLIN, 1)));
        assert_eq!(validate(EpollOp::Add, None), Err(SyscallError::BadAddress));
        assert!(validate(EpollOp::Delete, None).is_ok());

        let unknown = EpollEvent {
            events: 0x0800_0000,
            data: 0,
        };
        assert_eq!(validate(EpollOp::Add, Some(&unknown)), Err(SyscallError::InvalidArgument));

        let exclusive = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLEXCLUSIVE, 0);
        assert!(validate(EpollOp::Add, Some(&exclusive)).is_ok());
        assert_eq!(validate(EpollOp::Modify, Some(&exclusive)), Err(SyscallError::InvalidArgument));

        let bad_exclusive = EpollEvent::new(EpollFlags::EPOLLPRI | EpollFlags::EPOLLEXCLUSIVE, 0);
        assert_eq!(validate(EpollOp::Add, Some(&bad_exclusive)), Err(SyscallError::InvalidArgument));
    }

    #[test]
    fn test_create_rejects_unknown_flags() {
        assert_eq!(create(0x4), Err(SyscallError::InvalidArgument));
    }

    #[test]
    fn test_wait_needs_room_for_events() {
        let epfd = create(EPOLL_CLOEXEC).unwrap();
        assert_eq!(wait(epfd, &mut [], Some(Duration::ZERO), None), Err(SyscallError::InvalidArgument));
        let mut events = [EpollEvent::default(); 2];
        assert_eq!(wait(epfd, &mut events, Some(Duration::ZERO), None), Ok(0));
        assert!(shim_ctx().unwrap().remove_desc(epfd).is_some());
    }

    fn thread_cpu_time() -> Duration {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    }

    #[test]
    fn test_parked_control_call_releases_wake_after_purge() {
        let epfd = create(0).unwrap();
        let desc = shim_ctx().unwrap().find_desc(epfd).unwrap();
        let (reader, _writer) = sys::pipe().unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&reader);

        // Stand in for a thread blocked on an old snapshot.
        desc.lock().as_epoll().unwrap().nr_polling_threads = 1;
        let adder = std::thread::spawn(move || {
            let ev = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI, 0);
            ctl(epfd, shim_api::epoll::EPOLL_CTL_ADD, fd, Some(&ev))
        });
        while !desc.lock().as_epoll().unwrap().wake_pending() {
            std::thread::sleep(Duration::from_millis(1));
        }

        // The descriptor goes away while the add is parked.
        forget_fd(&desc, fd);
        {
            let mut guard = desc.lock();
            let ctx = guard.as_epoll().unwrap();
            ctx.nr_polling_threads = 0;
            ctx.release_wake().unwrap();
        }
        desc.notify_pollers_gone();
        assert_eq!(adder.join().unwrap(), Ok(()));
        assert!(!desc.lock().as_epoll().unwrap().wake_pending());

        let cpu = thread_cpu_time();
        let mut events = [EpollEvent::default(); 2];
        assert_eq!(wait(epfd, &mut events, Some(Duration::from_millis(200)), None), Ok(0));
        assert!(thread_cpu_time() - cpu < Duration::from_millis(100));

        drop(desc);
        assert!(shim_ctx().unwrap().remove_desc(epfd).is_some());
    }
}
