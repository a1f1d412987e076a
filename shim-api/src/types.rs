//! Records exchanged with timer and signal descriptors

use core::time::Duration;
use static_assertions::const_assert_eq;

use crate::error::{Result, SyscallError};

/// Timer setting as seen from Rust callers
///
/// `value` is relative to now, or an absolute clock reading when the timer
/// is armed with `TFD_TIMER_ABSTIME`. A zero `value` disarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerSpec {
    pub interval: Duration,
    pub value: Duration,
}

impl TimerSpec {
    pub const DISARMED: TimerSpec = TimerSpec {
        interval: Duration::ZERO,
        value: Duration::ZERO,
    };

    pub const fn new(value: Duration, interval: Duration) -> Self {
        Self { interval, value }
    }

    pub fn is_armed(&self) -> bool {
        !self.value.is_zero()
    }
}

/// `struct itimerspec`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Itimerspec {
    pub it_interval: libc::timespec,
    pub it_value: libc::timespec,
}

fn duration_from_timespec(ts: &libc::timespec) -> Result<Duration> {
    if ts.tv_sec < 0 || ts.tv_nsec < 0 || ts.tv_nsec >= 1_000_000_000 {
        return Err(SyscallError::InvalidArgument);
    }
    Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

fn timespec_from_duration(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as _,
    }
}

impl TryFrom<&Itimerspec> for TimerSpec {
    type Error = SyscallError;

    fn try_from(its: &Itimerspec) -> Result<Self> {
        Ok(TimerSpec {
            interval: duration_from_timespec(&its.it_interval)?,
            value: duration_from_timespec(&its.it_value)?,
        })
    }
}

impl From<TimerSpec> for Itimerspec {
    fn from(spec: TimerSpec) -> Self {
        Itimerspec {
            it_interval: timespec_from_duration(spec.interval),
            it_value: timespec_from_duration(spec.value),
        }
    }
}

/// `struct signalfd_siginfo`, one record per dequeued signal
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalfdSiginfo {
    pub ssi_signo: u32,
    pub ssi_errno: i32,
    pub ssi_code: i32,
    pub ssi_pid: u32,
    pub ssi_uid: u32,
    pub ssi_fd: i32,
    pub ssi_tid: u32,
    pub ssi_band: u32,
    pub ssi_overrun: u32,
    pub ssi_trapno: u32,
    pub ssi_status: i32,
    pub ssi_int: i32,
    pub ssi_ptr: u64,
    pub ssi_utime: u64,
    pub ssi_stime: u64,
    pub ssi_addr: u64,
    pub ssi_addr_lsb: u16,
    pub __pad2: u16,
    pub ssi_syscall: i32,
    pub ssi_call_addr: u64,
    pub ssi_arch: u32,
    pub __pad: [u8; 28],
}

const_assert_eq!(core::mem::size_of::<SignalfdSiginfo>(), 128);

impl SignalfdSiginfo {
    pub const SIZE: usize = core::mem::size_of::<SignalfdSiginfo>();

    pub fn new(signo: u32) -> Self {
        Self {
            ssi_signo: signo,
            ..Default::default()
        }
    }

    /// Raw record as written by `read(2)`
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C), no padding holes (checked size), plain integers.
        unsafe { core::slice::from_raw_parts((self as *const Self).cast::<u8>(), Self::SIZE) }
    }

    /// Parse a record produced by `as_bytes`
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut info = Self::default();
        // SAFETY: every bit pattern is a valid SignalfdSiginfo.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (&mut info as *mut Self).cast::<u8>(),
                Self::SIZE,
            );
        }
        Some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_itimerspec_rejects_bad_nanoseconds() {
        let its = Itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: 1,
                tv_nsec: 1_000_000_000,
            },
        };
        assert_eq!(TimerSpec::try_from(&its), Err(SyscallError::InvalidArgument));
    }

    #[test]
    fn test_itimerspec_conversion() {
        let spec = TimerSpec::new(Duration::from_millis(1500), Duration::from_millis(250));
        let its = Itimerspec::from(spec);
        assert_eq!(its.it_value.tv_sec, 1);
        assert_eq!(its.it_value.tv_nsec, 500_000_000);
        assert_eq!(TimerSpec::try_from(&its), Ok(spec));
        assert!(spec.is_armed());
        assert!(!TimerSpec::DISARMED.is_armed());
    }

    #[test]
    fn test_siginfo_bytes() {
        let info = SignalfdSiginfo::new(libc::SIGUSR1 as u32);
        let bytes = info.as_bytes();
        assert_eq!(bytes.len(), 128);
        let parsed = SignalfdSiginfo::from_bytes(bytes).unwrap();
        assert_eq!(parsed.ssi_signo, libc::SIGUSR1 as u32);
        assert!(SignalfdSiginfo::from_bytes(&bytes[..64]).is_none());
    }
}
