//! SignalFd descriptors
//!
//! A signal descriptor watches a set of signals the caller keeps blocked.
//! The queue carries one signal filter per member, which wakes readers
//! when a member is raised, and a user event triggered while any member is
//! pending. Reads dequeue pending members without blocking.

use std::io;
use std::os::fd::RawFd;

use shim_api::flags::signalfd::{SFD_ALL, SFD_CLOEXEC, SFD_NONBLOCK};
use shim_api::{EpollFlags, Result, SignalfdSiginfo, SyscallError};

use crate::file::{DescKind, FileOps, Payload};
use crate::sys::{self, EvFlags, Filter, Kevent};
use crate::table::shim_ctx;
use crate::wake::Wake;

/// Highest signal number probed in a mask
const MAX_SIGNAL: libc::c_int = 128;

fn empty_set() -> libc::sigset_t {
    // SAFETY: sigemptyset initializes the zeroed set.
    unsafe {
        let mut set: libc::sigset_t = core::mem::zeroed();
        libc::sigemptyset(&mut set);
        set
    }
}

/// Signal numbers in `mask`; `SIGKILL` and `SIGSTOP` cannot be caught and
/// are skipped
fn members(mask: &libc::sigset_t) -> Vec<libc::c_int> {
    (1..=MAX_SIGNAL)
        .filter(|&signo| signo != libc::SIGKILL && signo != libc::SIGSTOP)
        // SAFETY: sigismember only reads the set; out-of-range numbers fail.
        .filter(|&signo| unsafe { libc::sigismember(mask, signo) } == 1)
        .collect()
}

fn pending_set() -> io::Result<libc::sigset_t> {
    let mut set = empty_set();
    // SAFETY: set is a valid out-parameter.
    if unsafe { libc::sigpending(&mut set) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(set)
}

/// Dequeue one pending member of `mask` without blocking
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn dequeue(mask: &libc::sigset_t, _members: &[libc::c_int]) -> io::Result<Option<SignalfdSiginfo>> {
    let zero = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: all-zero is a valid siginfo_t and the kernel fills it.
    let mut info: libc::siginfo_t = unsafe { core::mem::zeroed() };
    // SAFETY: mask, info and zero are valid for the call.
    let signo = unsafe { libc::sigtimedwait(mask, &mut info, &zero) };
    if signo < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(None),
            _ => Err(err),
        };
    }
    let mut record = SignalfdSiginfo::new(signo as u32);
    record.ssi_errno = info.si_errno;
    record.ssi_code = info.si_code;
    // SAFETY: the kernel filled info; the accessors read its union.
    unsafe {
        record.ssi_pid = info.si_pid() as u32;
        record.ssi_uid = info.si_uid() as u32;
        record.ssi_status = info.si_status();
    }
    Ok(Some(record))
}

/// Dequeue one pending member of `mask` without blocking
#[cfg(any(target_os = "macos", target_os = "ios"))]
fn dequeue(_mask: &libc::sigset_t, members: &[libc::c_int]) -> io::Result<Option<SignalfdSiginfo>> {
    let pending = pending_set()?;
    // SAFETY: sigismember only reads the set.
    let Some(&signo) = members.iter().find(|&&signo| unsafe { libc::sigismember(&pending, signo) } == 1) else {
        return Ok(None);
    };
    let mut single = empty_set();
    let mut taken: libc::c_int = 0;
    // SAFETY: single is initialized; sigwait returns at once for a pending signal.
    let rc = unsafe {
        libc::sigaddset(&mut single, signo);
        libc::sigwait(&single, &mut taken)
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(Some(SignalfdSiginfo::new(taken as u32)))
}

/// SignalFd instance structure
pub struct SignalFdCtx {
    kq: RawFd,
    wake: Wake,
    mask: libc::sigset_t,
    /// Signals with a filter on the queue
    members: Vec<libc::c_int>,
}

impl SignalFdCtx {
    pub fn new(kq: RawFd, mask: &libc::sigset_t) -> Result<Self> {
        let mut ctx = Self {
            kq,
            wake: Wake::on_queue(kq)?,
            mask: empty_set(),
            members: Vec::new(),
        };
        ctx.set_mask(mask)?;
        Ok(ctx)
    }

    /// Replace the watched set, adjusting the queue's signal filters
    pub fn set_mask(&mut self, mask: &libc::sigset_t) -> Result<()> {
        let wanted = members(mask);
        let mut changes: Vec<Kevent> = self
            .members
            .iter()
            .filter(|signo| !wanted.contains(signo))
            .map(|&signo| Kevent::new(signo as usize, Filter::Signal, EvFlags::DELETE))
            .collect();
        changes.extend(
            wanted
                .iter()
                .filter(|signo| !self.members.contains(signo))
                .map(|&signo| Kevent::new(signo as usize, Filter::Signal, EvFlags::ADD)),
        );
        if !changes.is_empty() {
            sys::kevent_receipt(self.kq, &mut changes)?;
            if let Some(errno) = changes
                .iter()
                .filter(|kev| kev.flags.contains(EvFlags::ADD))
                .find_map(Kevent::error)
            {
                return Err(SyscallError::from_errno(errno));
            }
        }
        self.mask = *mask;
        self.members = wanted;
        shim_trace!("signalfd {}: watching {:?}", self.kq, self.members);
        self.refresh()
    }

    fn is_pending(&self) -> Result<bool> {
        let pending = pending_set()?;
        Ok(self
            .members
            .iter()
            // SAFETY: sigismember only reads the set.
            .any(|&signo| unsafe { libc::sigismember(&pending, signo) } == 1))
    }

    /// Consume queue activity and republish readiness
    fn refresh(&mut self) -> Result<()> {
        let mut kevs = [Kevent::EMPTY; 16];
        while sys::drain(self.kq, &mut kevs)? == kevs.len() {}
        let res = if self.is_pending()? {
            self.wake.trigger()
        } else {
            self.wake.clear()
        };
        res.map_err(SyscallError::from)
    }
}

impl FileOps for SignalFdCtx {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < SignalfdSiginfo::SIZE {
            return Err(SyscallError::InvalidArgument);
        }
        let mut copied = 0;
        for chunk in buf.chunks_exact_mut(SignalfdSiginfo::SIZE) {
            let Some(record) = dequeue(&self.mask, &self.members)? else {
                break;
            };
            chunk.copy_from_slice(record.as_bytes());
            copied += SignalfdSiginfo::SIZE;
        }
        self.refresh()?;
        if copied == 0 {
            return Err(SyscallError::WouldBlock);
        }
        Ok(copied)
    }

    fn poll(&mut self) -> EpollFlags {
        if let Err(err) = self.refresh() {
            shim_debug!("signalfd {}: refresh failed: {}", self.kq, err);
        }
        if self.wake.is_triggered() {
            EpollFlags::EPOLLIN | EpollFlags::EPOLLRDNORM
        } else {
            EpollFlags::empty()
        }
    }
}

/// Create a signal descriptor (`fd == -1`) or replace the mask of one
pub fn signalfd(fd: RawFd, mask: &libc::sigset_t, flags: i32) -> Result<RawFd> {
    if flags & !SFD_ALL != 0 {
        return Err(SyscallError::InvalidArgument);
    }
    let shim = shim_ctx()?;
    if fd != -1 {
        let desc = shim.find_typed(fd, DescKind::Signal)?;
        let mut guard = desc.lock();
        return match &mut *guard {
            Payload::Signal(ctx) => ctx.set_mask(mask).map(|()| fd),
            _ => Err(SyscallError::InvalidArgument),
        };
    }
    let fd = shim.create_with(
        DescKind::Signal,
        flags & SFD_NONBLOCK,
        flags & SFD_CLOEXEC != 0,
        |kq| Ok(Payload::Signal(SignalFdCtx::new(kq, mask)?)),
    )?;
    shim_debug!("signalfd {}: created", fd);
    Ok(fd)
}
