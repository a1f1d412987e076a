//! epoll ABI: event record, interest bits and control operations

use bitflags::bitflags;
use core::fmt;
use static_assertions::const_assert_eq;

use crate::error::{Result, SyscallError};

bitflags! {
    /// Interest and readiness bits carried in `epoll_event.events`
    ///
    /// Values are the Linux ones, independent of the host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EpollFlags: u32 {
        const EPOLLIN = 0x001;
        const EPOLLPRI = 0x002;
        const EPOLLOUT = 0x004;
        const EPOLLERR = 0x008;
        const EPOLLHUP = 0x010;
        const EPOLLRDNORM = 0x040;
        const EPOLLRDBAND = 0x080;
        const EPOLLWRNORM = 0x100;
        const EPOLLWRBAND = 0x200;
        const EPOLLMSG = 0x400;
        const EPOLLRDHUP = 0x2000;
        const EPOLLEXCLUSIVE = 1 << 28;
        const EPOLLWAKEUP = 1 << 29;
        const EPOLLONESHOT = 1 << 30;
        const EPOLLET = 1 << 31;
    }
}

impl EpollFlags {
    /// Bits that select how an event is delivered rather than what is watched
    pub const DELIVERY_MODE: EpollFlags = EpollFlags::EPOLLET
        .union(EpollFlags::EPOLLONESHOT)
        .union(EpollFlags::EPOLLEXCLUSIVE)
        .union(EpollFlags::EPOLLWAKEUP);

    /// Conditions reported whether or not they were requested
    pub const ALWAYS_REPORTED: EpollFlags = EpollFlags::EPOLLERR.union(EpollFlags::EPOLLHUP);

    /// Bits allowed together with `EPOLLEXCLUSIVE`
    pub const EXCLUSIVE_COMPATIBLE: EpollFlags = EpollFlags::EPOLLIN
        .union(EpollFlags::EPOLLOUT)
        .union(EpollFlags::EPOLLERR)
        .union(EpollFlags::EPOLLHUP)
        .union(EpollFlags::EPOLLWAKEUP)
        .union(EpollFlags::EPOLLET)
        .union(EpollFlags::EPOLLEXCLUSIVE);

    /// Bits that need read-side observation
    pub const READ_SIDE: EpollFlags = EpollFlags::EPOLLIN
        .union(EpollFlags::EPOLLRDNORM)
        .union(EpollFlags::EPOLLRDHUP);

    /// Bits that need write-side observation
    pub const WRITE_SIDE: EpollFlags = EpollFlags::EPOLLOUT
        .union(EpollFlags::EPOLLWRNORM)
        .union(EpollFlags::EPOLLWRBAND);

    /// Bits that need out-of-band observation
    pub const EXCEPT_SIDE: EpollFlags = EpollFlags::EPOLLPRI.union(EpollFlags::EPOLLRDBAND);
}

/// `EPOLL_CTL_ADD`
pub const EPOLL_CTL_ADD: i32 = 1;
/// `EPOLL_CTL_DEL`
pub const EPOLL_CTL_DEL: i32 = 2;
/// `EPOLL_CTL_MOD`
pub const EPOLL_CTL_MOD: i32 = 3;

/// `epoll_create1` close-on-exec flag, the host's `O_CLOEXEC`
pub const EPOLL_CLOEXEC: i32 = libc::O_CLOEXEC;

/// Registration control operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpollOp {
    Add,
    Delete,
    Modify,
}

impl TryFrom<i32> for EpollOp {
    type Error = SyscallError;

    fn try_from(op: i32) -> Result<Self> {
        match op {
            EPOLL_CTL_ADD => Ok(EpollOp::Add),
            EPOLL_CTL_DEL => Ok(EpollOp::Delete),
            EPOLL_CTL_MOD => Ok(EpollOp::Modify),
            _ => Err(SyscallError::InvalidArgument),
        }
    }
}

impl From<EpollOp> for i32 {
    fn from(op: EpollOp) -> i32 {
        match op {
            EpollOp::Add => EPOLL_CTL_ADD,
            EpollOp::Delete => EPOLL_CTL_DEL,
            EpollOp::Modify => EPOLL_CTL_MOD,
        }
    }
}

/// `struct epoll_event`
///
/// Packed on x86_64 to match the Linux layout there.
#[repr(C)]
#[cfg_attr(target_arch = "x86_64", repr(packed))]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EpollEvent {
    pub events: u32,
    pub data: u64,
}

#[cfg(target_arch = "x86_64")]
const_assert_eq!(core::mem::size_of::<EpollEvent>(), 12);
#[cfg(not(target_arch = "x86_64"))]
const_assert_eq!(core::mem::size_of::<EpollEvent>(), 16);

impl EpollEvent {
    pub const fn new(events: EpollFlags, data: u64) -> Self {
        Self {
            events: events.bits(),
            data,
        }
    }

    /// Event bits, keeping unknown bits so validation can see them
    pub fn flags(&self) -> EpollFlags {
        EpollFlags::from_bits_retain(self.events)
    }

    pub fn data(&self) -> u64 {
        self.data
    }
}

impl fmt::Debug for EpollEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let events = self.events;
        let data = self.data;
        f.debug_struct("EpollEvent")
            .field("events", &EpollFlags::from_bits_retain(events))
            .field("data", &data)
            .finish()
    }
}
