//! TimerFd descriptors
//!
//! This module implements the timerfd family on top of a kqueue:
//! - timerfd_create: Create a timer file descriptor
//! - timerfd_settime: Arm or disarm a timer
//! - timerfd_gettime: Get the current setting of a timer
//!
//! Expirations are counted in user space against the selected clock. The
//! queue holds a one-shot relative timer for the next expiration, which
//! wakes blocked readers and watchers; readiness itself is published with
//! the queue's user event.

use core::time::Duration;
use std::os::fd::RawFd;

use shim_api::flags::timerfd::{
    TFD_CLOEXEC, TFD_CREATE_ALL, TFD_NONBLOCK, TFD_SETTIME_ALL, TFD_TIMER_ABSTIME, TFD_TIMER_CANCEL_ON_SET,
};
use shim_api::{EpollFlags, Result, SyscallError, TimerSpec};

use crate::file::{DescKind, FileOps, Payload};
use crate::sys::{self, EvFlags, Filter, Kevent};
use crate::table::shim_ctx;
use crate::wake::{Wake, WAKE_IDENT};

/// Identifier of the expiration timer inside the descriptor's queue
const TIMER_IDENT: usize = WAKE_IDENT + 1;

/// Linux value of `CLOCK_BOOTTIME`, accepted on every host
#[cfg(any(target_os = "linux", target_os = "android"))]
const CLOCK_BOOTTIME: libc::clockid_t = libc::CLOCK_BOOTTIME;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const CLOCK_BOOTTIME: libc::clockid_t = 7 as libc::clockid_t;

/// Clock a timer counts against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    Realtime,
    Monotonic,
    Boottime,
}

impl Clock {
    pub fn from_clockid(clockid: libc::clockid_t) -> Result<Self> {
        if clockid == libc::CLOCK_REALTIME {
            Ok(Clock::Realtime)
        } else if clockid == libc::CLOCK_MONOTONIC {
            Ok(Clock::Monotonic)
        } else if clockid == CLOCK_BOOTTIME {
            Ok(Clock::Boottime)
        } else {
            Err(SyscallError::InvalidArgument)
        }
    }

    fn host_clock(self) -> libc::clockid_t {
        match self {
            Clock::Realtime => libc::CLOCK_REALTIME,
            Clock::Monotonic => libc::CLOCK_MONOTONIC,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Clock::Boottime => libc::CLOCK_BOOTTIME,
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            Clock::Boottime => libc::CLOCK_MONOTONIC,
        }
    }

    pub fn now(self) -> Result<Duration> {
        sys::clock_now(self.host_clock()).map_err(SyscallError::from)
    }
}

/// Current arming of a timer
#[derive(Debug, Clone, Copy)]
struct Armed {
    /// Next expiration as a reading of the timer's clock
    next: Duration,
    interval: Duration,
    is_abstime: bool,
    cancel_on_set: bool,
}

/// TimerFd instance structure
pub struct TimerFdCtx {
    kq: RawFd,
    clock: Clock,
    wake: Wake,
    armed: Option<Armed>,
    /// Expirations not yet read
    expirations: u64,
    /// The wall clock was stepped under a cancel-on-set timer
    is_cancelled: bool,
    /// Counted by the wall-clock-step detector
    is_monitoring: bool,
}

/// `a + b * n` without overflowing
fn advance(start: Duration, interval: Duration, n: u128) -> Duration {
    let nanos = start.as_nanos().saturating_add(interval.as_nanos().saturating_mul(n));
    let secs = (nanos / 1_000_000_000).min(u64::MAX as u128) as u64;
    Duration::new(secs, (nanos % 1_000_000_000) as u32)
}

impl TimerFdCtx {
    pub fn new(kq: RawFd, clock: Clock) -> Result<Self> {
        Ok(Self {
            kq,
            clock,
            wake: Wake::on_queue(kq)?,
            armed: None,
            expirations: 0,
            is_cancelled: false,
            is_monitoring: false,
        })
    }

    fn arm_queue(&self, after: Duration) -> Result<()> {
        let nanos = after.as_nanos().clamp(1, i64::MAX as u128) as i64;
        let kev = Kevent::new(TIMER_IDENT, Filter::Timer, EvFlags::ADD | EvFlags::ONESHOT).with_data(nanos);
        sys::apply(self.kq, &[kev]).map_err(SyscallError::from)
    }

    fn disarm_queue(&self) {
        let mut del = [Kevent::new(TIMER_IDENT, Filter::Timer, EvFlags::DELETE)];
        // Nothing to delete once the one-shot timer fired.
        let _ = sys::kevent_receipt(self.kq, &mut del);
    }

    fn publish(&mut self) -> Result<()> {
        let res = if self.expirations > 0 || self.is_cancelled {
            self.wake.trigger()
        } else {
            self.wake.clear()
        };
        res.map_err(SyscallError::from)
    }

    /// Keep the wall-clock-step detector informed about this timer
    fn update_monitoring(&mut self) {
        let wants = self.clock == Clock::Realtime && self.armed.is_some_and(|armed| armed.is_abstime);
        if wants == self.is_monitoring {
            return;
        }
        match shim_ctx() {
            Ok(shim) => {
                shim.update_realtime_change_monitoring(if wants { 1 } else { -1 });
                self.is_monitoring = wants;
            }
            Err(err) => {
                shim_warn!("timerfd {}: wall-clock-step monitoring unavailable: {}", self.kq, err);
            }
        }
    }

    /// Count elapsed expirations and re-arm the queue timer
    fn refresh(&mut self) -> Result<()> {
        let mut kevs = [Kevent::EMPTY; 4];
        while sys::drain(self.kq, &mut kevs)? == kevs.len() {}

        let Some(mut armed) = self.armed else {
            return self.publish();
        };
        let now = self.clock.now()?;
        if now >= armed.next {
            if armed.interval.is_zero() {
                self.expirations = self.expirations.saturating_add(1);
                self.armed = None;
            } else {
                let overrun = (now - armed.next).as_nanos() / armed.interval.as_nanos();
                let fired = overrun.saturating_add(1);
                self.expirations = self.expirations.saturating_add(fired.min(u64::MAX as u128) as u64);
                armed.next = advance(armed.next, armed.interval, fired);
                self.armed = Some(armed);
            }
        }
        if let Some(armed) = self.armed {
            self.arm_queue(armed.next.saturating_sub(now))?;
        } else {
            self.update_monitoring();
        }
        self.publish()
    }

    /// Current setting; `value` is the time left until the next expiration
    pub fn gettime(&mut self) -> Result<TimerSpec> {
        self.refresh()?;
        let Some(armed) = self.armed else {
            return Ok(TimerSpec::DISARMED);
        };
        let left = armed.next.saturating_sub(self.clock.now()?);
        // An armed timer never reports zero, which would read as disarmed.
        let left = left.max(Duration::from_nanos(1));
        Ok(TimerSpec::new(left, armed.interval))
    }

    /// Arm or disarm; returns the previous setting
    pub fn settime(&mut self, flags: i32, spec: TimerSpec) -> Result<TimerSpec> {
        if flags & !TFD_SETTIME_ALL != 0 {
            return Err(SyscallError::InvalidArgument);
        }
        let is_abstime = flags & TFD_TIMER_ABSTIME != 0;
        let cancel_on_set = flags & TFD_TIMER_CANCEL_ON_SET != 0;
        if cancel_on_set && !(is_abstime && self.clock == Clock::Realtime) {
            return Err(SyscallError::InvalidArgument);
        }

        let old = self.gettime()?;
        self.disarm_queue();
        self.expirations = 0;
        self.is_cancelled = false;
        self.armed = if spec.is_armed() {
            let next = if is_abstime {
                spec.value
            } else {
                self.clock.now()?.saturating_add(spec.value)
            };
            Some(Armed {
                next,
                interval: spec.interval,
                is_abstime,
                cancel_on_set,
            })
        } else {
            None
        };
        self.update_monitoring();
        shim_trace!("timerfd {}: settime {:?} abstime={}", self.kq, spec, is_abstime);
        self.refresh()?;
        Ok(old)
    }
}

impl FileOps for TimerFdCtx {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 8 {
            return Err(SyscallError::InvalidArgument);
        }
        self.refresh()?;
        if self.is_cancelled {
            self.is_cancelled = false;
            self.expirations = 0;
            self.publish()?;
            return Err(SyscallError::Cancelled);
        }
        if self.expirations == 0 {
            return Err(SyscallError::WouldBlock);
        }
        let expirations = core::mem::take(&mut self.expirations);
        self.publish()?;
        buf[..8].copy_from_slice(&expirations.to_ne_bytes());
        Ok(8)
    }

    fn poll(&mut self) -> EpollFlags {
        if let Err(err) = self.refresh() {
            shim_debug!("timerfd {}: refresh failed: {}", self.kq, err);
        }
        if self.expirations > 0 || self.is_cancelled {
            EpollFlags::EPOLLIN | EpollFlags::EPOLLRDNORM
        } else {
            EpollFlags::empty()
        }
    }

    fn realtime_step(&mut self) {
        let Some(armed) = self.armed else {
            return;
        };
        if !armed.is_abstime || self.clock != Clock::Realtime {
            return;
        }
        if armed.cancel_on_set {
            shim_debug!("timerfd {}: wall clock stepped, cancelling", self.kq);
            self.is_cancelled = true;
        }
        // The relative queue timer was derived from the old wall clock.
        if let Err(err) = self.refresh() {
            shim_warn!("timerfd {}: re-arming after clock step failed: {}", self.kq, err);
        }
    }

    fn close(&mut self) {
        self.armed = None;
        self.update_monitoring();
    }
}

/// Create a timer file descriptor
pub fn timerfd_create(clockid: libc::clockid_t, flags: i32) -> Result<RawFd> {
    let clock = Clock::from_clockid(clockid)?;
    if flags & !TFD_CREATE_ALL != 0 {
        return Err(SyscallError::InvalidArgument);
    }
    let fd = shim_ctx()?.create_with(
        DescKind::Timer,
        flags & TFD_NONBLOCK,
        flags & TFD_CLOEXEC != 0,
        |kq| Ok(Payload::Timer(TimerFdCtx::new(kq, clock)?)),
    )?;
    shim_debug!("timerfd {}: created on {:?}", fd, clock);
    Ok(fd)
}

fn with_timer<R>(fd: RawFd, f: impl FnOnce(&mut TimerFdCtx) -> Result<R>) -> Result<R> {
    let desc = shim_ctx()?.find_typed(fd, DescKind::Timer)?;
    let mut guard = desc.lock();
    match &mut *guard {
        Payload::Timer(ctx) => f(ctx),
        _ => Err(SyscallError::InvalidArgument),
    }
}

/// Arm or disarm a timer; returns the previous setting
pub fn timerfd_settime(fd: RawFd, flags: i32, new: &TimerSpec) -> Result<TimerSpec> {
    with_timer(fd, |ctx| ctx.settime(flags, *new))
}

/// Get the current setting of a timer
pub fn timerfd_gettime(fd: RawFd) -> Result<TimerSpec> {
    with_timer(fd, TimerFdCtx::gettime)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(clock: Clock) -> TimerFdCtx {
        TimerFdCtx::new(sys::kqueue().unwrap(), clock).unwrap()
    }

    fn close(mut ctx: TimerFdCtx) {
        ctx.close();
        let kq = ctx.kq;
        drop(ctx);
        sys::close_queue(kq).unwrap();
    }

    #[test]
    fn test_clock_ids() {
        assert_eq!(Clock::from_clockid(libc::CLOCK_MONOTONIC), Ok(Clock::Monotonic));
        assert_eq!(Clock::from_clockid(libc::CLOCK_REALTIME), Ok(Clock::Realtime));
        assert_eq!(Clock::from_clockid(CLOCK_BOOTTIME), Ok(Clock::Boottime));
        assert_eq!(Clock::from_clockid(42 as libc::clockid_t), Err(SyscallError::InvalidArgument));
    }

    #[test]
    fn test_advance_is_saturating() {
        let start = Duration::from_secs(1);
        assert_eq!(advance(start, Duration::from_millis(500), 3), Duration::from_millis(2500));
        assert_eq!(advance(Duration::MAX, Duration::from_secs(1), 1).as_secs(), u64::MAX);
    }

    #[test]
    fn test_disarmed_timer_is_not_readable() {
        let mut ctx = ctx(Clock::Monotonic);
        let mut buf = [0u8; 8];
        assert_eq!(ctx.read(&mut buf), Err(SyscallError::WouldBlock));
        assert_eq!(ctx.gettime(), Ok(TimerSpec::DISARMED));
        close(ctx);
    }

    #[test]
    fn test_expired_one_shot_reads_once() {
        let mut ctx = ctx(Clock::Monotonic);
        let now = Clock::Monotonic.now().unwrap();
        // Absolute time in the past: expired on arming.
        let spec = TimerSpec::new(now.saturating_sub(Duration::from_millis(1)).max(Duration::from_nanos(1)), Duration::ZERO);
        assert_eq!(ctx.settime(TFD_TIMER_ABSTIME, spec), Ok(TimerSpec::DISARMED));
        assert_eq!(ctx.poll(), EpollFlags::EPOLLIN | EpollFlags::EPOLLRDNORM);

        let mut buf = [0u8; 8];
        assert_eq!(ctx.read(&mut buf), Ok(8));
        assert_eq!(u64::from_ne_bytes(buf), 1);
        assert_eq!(ctx.read(&mut buf), Err(SyscallError::WouldBlock));
        assert_eq!(ctx.gettime(), Ok(TimerSpec::DISARMED));
        close(ctx);
    }

    #[test]
    fn test_settime_returns_previous_setting() {
        let mut ctx = ctx(Clock::Monotonic);
        let spec = TimerSpec::new(Duration::from_secs(60), Duration::from_secs(5));
        ctx.settime(0, spec).unwrap();
        let old = ctx.settime(0, TimerSpec::DISARMED).unwrap();
        assert_eq!(old.interval, Duration::from_secs(5));
        assert!(old.value > Duration::from_secs(50) && old.value <= Duration::from_secs(60));
        close(ctx);
    }

    #[test]
    fn test_cancel_on_set_needs_absolute_realtime() {
        let mut ctx = ctx(Clock::Monotonic);
        let spec = TimerSpec::new(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(
            ctx.settime(TFD_TIMER_ABSTIME | TFD_TIMER_CANCEL_ON_SET, spec),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(ctx.settime(0x40, spec), Err(SyscallError::InvalidArgument));
        close(ctx);
    }
}
