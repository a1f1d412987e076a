//! EventFd descriptors
//!
//! This module implements the eventfd family on top of a kqueue:
//! - eventfd: Create an event file descriptor
//! - eventfd_read / eventfd_write: 8-byte counter transfers
//!
//! The counter lives in user space. Its queue carries one user event that
//! is triggered exactly while the counter is non-zero, so the descriptor
//! polls readable and can be watched by any multiplexer.

use std::os::fd::RawFd;

use shim_api::flags::eventfd::{EFD_ALL, EFD_CLOEXEC, EFD_NONBLOCK, EFD_SEMAPHORE};
use shim_api::{EpollFlags, Result, SyscallError};

use crate::file::{DescKind, FileOps, Payload};
use crate::table::shim_ctx;
use crate::wake::Wake;

/// Largest value the counter may hold
pub const EVENTFD_MAX: u64 = u64::MAX - 1;

/// EventFd instance structure
pub struct EventFdCtx {
    /// Readiness published on the descriptor's queue
    wake: Wake,
    /// Current counter value
    counter: u64,
    /// Reads take one unit at a time
    is_semaphore: bool,
}

impl EventFdCtx {
    pub fn new(kq: RawFd, initval: u32, flags: i32) -> Result<Self> {
        let mut ctx = Self {
            wake: Wake::on_queue(kq)?,
            counter: initval as u64,
            is_semaphore: flags & EFD_SEMAPHORE != 0,
        };
        ctx.publish(false)?;
        Ok(ctx)
    }

    /// Mirror the counter onto the queue; `fresh` re-signals an already
    /// readable counter so edge-triggered watchers see the new write
    fn publish(&mut self, fresh: bool) -> Result<()> {
        let res = if self.counter == 0 {
            self.wake.clear()
        } else if fresh {
            self.wake.retrigger()
        } else {
            self.wake.trigger()
        };
        res.map_err(SyscallError::from)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Take the counter (or one unit in semaphore mode)
    pub fn take(&mut self) -> Result<u64> {
        if self.counter == 0 {
            return Err(SyscallError::WouldBlock);
        }
        let value = if self.is_semaphore { 1 } else { self.counter };
        self.counter -= value;
        self.publish(false)?;
        Ok(value)
    }

    /// Add to the counter; `WouldBlock` if it would pass the maximum
    pub fn add(&mut self, value: u64) -> Result<()> {
        if value == u64::MAX {
            return Err(SyscallError::InvalidArgument);
        }
        if self.counter > EVENTFD_MAX - value {
            return Err(SyscallError::WouldBlock);
        }
        if value == 0 {
            return Ok(());
        }
        self.counter += value;
        self.publish(true)
    }
}

impl FileOps for EventFdCtx {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 8 {
            return Err(SyscallError::InvalidArgument);
        }
        let value = self.take()?;
        buf[..8].copy_from_slice(&value.to_ne_bytes());
        Ok(8)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let bytes: [u8; 8] = buf
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or(SyscallError::InvalidArgument)?;
        self.add(u64::from_ne_bytes(bytes))?;
        Ok(8)
    }

    fn poll(&mut self) -> EpollFlags {
        let mut events = EpollFlags::empty();
        if self.counter > 0 {
            events |= EpollFlags::EPOLLIN | EpollFlags::EPOLLRDNORM;
        }
        if self.counter < EVENTFD_MAX {
            events |= EpollFlags::EPOLLOUT | EpollFlags::EPOLLWRNORM;
        }
        events
    }
}

/// Create an event file descriptor
pub fn eventfd(initval: u32, flags: i32) -> Result<RawFd> {
    if flags & !EFD_ALL != 0 {
        return Err(SyscallError::InvalidArgument);
    }
    let fd = shim_ctx()?.create_with(
        DescKind::Event,
        flags & EFD_NONBLOCK,
        flags & EFD_CLOEXEC != 0,
        |kq| Ok(Payload::Event(EventFdCtx::new(kq, initval, flags)?)),
    )?;
    shim_debug!("eventfd {}: created, initval {}, flags {:#x}", fd, initval, flags);
    Ok(fd)
}

/// Read the counter of an event file descriptor
pub fn eventfd_read(fd: RawFd) -> Result<u64> {
    let desc = shim_ctx()?.find_typed(fd, DescKind::Event)?;
    let mut buf = [0u8; 8];
    desc.read(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Add to the counter of an event file descriptor
pub fn eventfd_write(fd: RawFd, value: u64) -> Result<()> {
    let desc = shim_ctx()?.find_typed(fd, DescKind::Event)?;
    desc.write(&value.to_ne_bytes()).map(drop)
}
