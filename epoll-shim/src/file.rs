//! Shared record behind every shim descriptor
//!
//! A `FileDescription` owns one queue identity (the integer handed to the
//! caller) and one payload. Table lookups hand out `Arc` clones; the queue
//! is closed when the last clone drops.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};

use shim_api::{EpollFlags, Result, SyscallError};

use crate::config::config;
use crate::epoll::ctx::EpollFdCtx;
use crate::eventfd::EventFdCtx;
use crate::signalfd::SignalFdCtx;
use crate::sys;
use crate::timerfd::TimerFdCtx;

/// Behavior table of a descriptor kind, called under the descriptor mutex
pub trait FileOps: Send {
    /// One non-blocking read attempt; `WouldBlock` when nothing is ready
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(SyscallError::InvalidArgument)
    }

    /// One non-blocking write attempt
    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(SyscallError::InvalidArgument)
    }

    /// Current readiness
    fn poll(&mut self) -> EpollFlags;

    /// The wall clock was stepped
    fn realtime_step(&mut self) {}

    /// Last reference is going away
    fn close(&mut self) {}
}

/// Which payload a description carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescKind {
    Epoll,
    Event,
    Timer,
    Signal,
}

pub enum Payload {
    Uninit,
    Epoll(EpollFdCtx),
    Event(EventFdCtx),
    Timer(TimerFdCtx),
    Signal(SignalFdCtx),
}

impl Payload {
    pub fn ops_mut(&mut self) -> Option<&mut dyn FileOps> {
        match self {
            Payload::Uninit => None,
            Payload::Epoll(ctx) => Some(ctx),
            Payload::Event(ctx) => Some(ctx),
            Payload::Timer(ctx) => Some(ctx),
            Payload::Signal(ctx) => Some(ctx),
        }
    }

    pub fn as_epoll(&mut self) -> Result<&mut EpollFdCtx> {
        match self {
            Payload::Epoll(ctx) => Ok(ctx),
            _ => Err(SyscallError::InvalidArgument),
        }
    }
}

pub struct FileDescription {
    /// Queue identity; -1 once disowned
    fd: AtomicI32,
    kind: DescKind,
    /// Status flags, only `O_NONBLOCK` is kept
    flags: AtomicI32,
    state: Mutex<Payload>,
    /// Signalled when the last fallback poller of a multiplexer leaves
    cond: Condvar,
}

impl FileDescription {
    pub(crate) fn new(fd: RawFd, kind: DescKind, flags: i32) -> Self {
        Self {
            fd: AtomicI32::new(fd),
            kind,
            flags: AtomicI32::new(flags & libc::O_NONBLOCK),
            state: Mutex::new(Payload::Uninit),
            cond: Condvar::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> DescKind {
        self.kind
    }

    pub fn status_flags(&self) -> i32 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn set_status_flags(&self, flags: i32) {
        self.flags.store(flags & libc::O_NONBLOCK, Ordering::Relaxed);
    }

    pub fn is_nonblocking(&self) -> bool {
        self.status_flags() & libc::O_NONBLOCK != 0
    }

    pub fn lock(&self) -> MutexGuard<'_, Payload> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, Payload>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Release the payload mutex until `notify_pollers_gone`
    pub(crate) fn wait<'a>(&'a self, guard: MutexGuard<'a, Payload>) -> MutexGuard<'a, Payload> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_pollers_gone(&self) {
        self.cond.notify_all();
    }

    /// Forget the queue identity so dropping does not close it; used when
    /// the caller closed the integer behind the shim's back
    pub(crate) fn disown(&self) {
        self.fd.store(-1, Ordering::Release);
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let res = match self.lock().ops_mut() {
                Some(ops) => ops.read(buf),
                None => Err(SyscallError::BadDescriptor),
            };
            match res {
                Err(SyscallError::WouldBlock) if !self.is_nonblocking() => {
                    sys::wait_readable(self.fd(), Some(config().blocked_read_retry))?;
                }
                other => return other,
            }
        }
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        loop {
            let res = match self.lock().ops_mut() {
                Some(ops) => ops.write(buf),
                None => Err(SyscallError::BadDescriptor),
            };
            match res {
                // Room is not signalled on the queue, so re-poll.
                Err(SyscallError::WouldBlock) if !self.is_nonblocking() => {
                    sys::ppoll(&mut [], Some(config().blocked_write_retry), None)?;
                }
                other => return other,
            }
        }
    }

    pub fn poll_events(&self) -> EpollFlags {
        self.lock().ops_mut().map(|ops| ops.poll()).unwrap_or_default()
    }

    pub fn realtime_step(&self) {
        if let Some(ops) = self.lock().ops_mut() {
            ops.realtime_step();
        }
    }
}

impl Drop for FileDescription {
    fn drop(&mut self) {
        let payload = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(ops) = payload.ops_mut() {
            ops.close();
        }
        *payload = Payload::Uninit;

        let fd = *self.fd.get_mut();
        if fd >= 0 {
            shim_debug!("closing queue {} ({:?})", fd, self.kind);
            if let Err(err) = sys::close_queue(fd) {
                shim_warn!("close of queue {} failed: {}", fd, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninitialized_payload_is_not_readable() {
        let kq = sys::kqueue().unwrap();
        let desc = FileDescription::new(kq, DescKind::Event, libc::O_NONBLOCK);
        let mut buf = [0u8; 8];
        assert_eq!(desc.read(&mut buf), Err(SyscallError::BadDescriptor));
        assert!(desc.poll_events().is_empty());
    }

    #[test]
    fn test_status_flags_keep_only_nonblock() {
        let kq = sys::kqueue().unwrap();
        let desc = FileDescription::new(kq, DescKind::Epoll, 0);
        assert!(!desc.is_nonblocking());
        desc.set_status_flags(libc::O_NONBLOCK | libc::O_APPEND);
        assert_eq!(desc.status_flags(), libc::O_NONBLOCK);
        assert_eq!(desc.kind(), DescKind::Epoll);
    }

    #[test]
    fn test_disowned_queue_is_left_open() {
        let kq = sys::kqueue().unwrap();
        let desc = FileDescription::new(kq, DescKind::Timer, 0);
        desc.disown();
        assert_eq!(desc.fd(), -1);
        drop(desc);
        assert!(sys::is_fd_open(kq));
        sys::close_queue(kq).unwrap();
    }

    #[test]
    fn test_blocking_read_rechecks_without_queue_activity() {
        use std::sync::Arc;
        use std::time::{Duration, Instant};

        // The counter publishes on a queue the reader is not waiting on.
        let kq = sys::kqueue().unwrap();
        let elsewhere = sys::kqueue().unwrap();
        let desc = Arc::new(FileDescription::new(kq, DescKind::Event, 0));
        *desc.lock() = Payload::Event(EventFdCtx::new(elsewhere, 0, 0).unwrap());

        let writer = {
            let desc = desc.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                desc.write(&5u64.to_ne_bytes()).unwrap();
            })
        };
        let start = Instant::now();
        let mut buf = [0u8; 8];
        assert_eq!(desc.read(&mut buf), Ok(8));
        assert_eq!(u64::from_ne_bytes(buf), 5);
        assert!(start.elapsed() < Duration::from_secs(5));

        writer.join().unwrap();
        drop(desc);
        sys::close_queue(elsewhere).unwrap();
    }
}
