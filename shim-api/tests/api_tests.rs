//! Layout and value checks for the shared ABI types

use shim_api::flags::{eventfd, timerfd};
use shim_api::{EpollEvent, EpollFlags, EpollOp, SignalfdSiginfo, SyscallError, TimerSpec};
use std::time::Duration;

#[test]
fn test_epoll_event_layout() {
    #[cfg(target_arch = "x86_64")]
    assert_eq!(std::mem::size_of::<EpollEvent>(), 12);
    #[cfg(not(target_arch = "x86_64"))]
    assert_eq!(std::mem::size_of::<EpollEvent>(), 16);

    let ev = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, u64::MAX);
    assert_eq!(ev.flags(), EpollFlags::EPOLLIN | EpollFlags::EPOLLET);
    assert_eq!(ev.data(), u64::MAX);
}

#[test]
fn test_linux_flag_values() {
    assert_eq!(EpollFlags::EPOLLIN.bits(), 0x1);
    assert_eq!(EpollFlags::EPOLLRDHUP.bits(), 0x2000);
    assert_eq!(EpollFlags::EPOLLET.bits(), 0x8000_0000);
    assert_eq!(eventfd::EFD_SEMAPHORE, 1);
    assert_eq!(timerfd::TFD_TIMER_ABSTIME, 1);
    assert_eq!(timerfd::TFD_TIMER_CANCEL_ON_SET, 2);
}

#[test]
fn test_unknown_op_is_invalid() {
    assert_eq!(EpollOp::try_from(42), Err(SyscallError::InvalidArgument));
}

#[test]
fn test_siginfo_size() {
    assert_eq!(SignalfdSiginfo::SIZE, 128);
}

#[test]
fn test_timer_spec_default_is_disarmed() {
    assert_eq!(TimerSpec::default(), TimerSpec::DISARMED);
    assert!(TimerSpec::new(Duration::from_secs(1), Duration::ZERO).is_armed());
}
