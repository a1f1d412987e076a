//! Creation and settime flags for the descriptor-backed primitives
//!
//! Close-on-exec and non-blocking bits reuse the host's `O_CLOEXEC` and
//! `O_NONBLOCK` so a caller may pass either spelling.

/// EventFd flags (Linux compatible)
pub mod eventfd {
    /// Semaphore mode flag
    pub const EFD_SEMAPHORE: i32 = 0x1;
    /// Close-on-exec flag
    pub const EFD_CLOEXEC: i32 = libc::O_CLOEXEC;
    /// Non-blocking flag
    pub const EFD_NONBLOCK: i32 = libc::O_NONBLOCK;

    /// Every flag `eventfd` accepts
    pub const EFD_ALL: i32 = EFD_SEMAPHORE | EFD_CLOEXEC | EFD_NONBLOCK;
}

/// TimerFd flags (Linux compatible)
pub mod timerfd {
    /// Close-on-exec flag
    pub const TFD_CLOEXEC: i32 = libc::O_CLOEXEC;
    /// Non-blocking flag
    pub const TFD_NONBLOCK: i32 = libc::O_NONBLOCK;

    /// Absolute timer flag for `timerfd_settime`
    pub const TFD_TIMER_ABSTIME: i32 = 1 << 0;
    /// Cancel an absolute realtime timer when the wall clock is stepped
    pub const TFD_TIMER_CANCEL_ON_SET: i32 = 1 << 1;

    /// Every flag `timerfd_create` accepts
    pub const TFD_CREATE_ALL: i32 = TFD_CLOEXEC | TFD_NONBLOCK;
    /// Every flag `timerfd_settime` accepts
    pub const TFD_SETTIME_ALL: i32 = TFD_TIMER_ABSTIME | TFD_TIMER_CANCEL_ON_SET;
}

/// SignalFd flags (Linux compatible)
pub mod signalfd {
    /// Close-on-exec flag
    pub const SFD_CLOEXEC: i32 = libc::O_CLOEXEC;
    /// Non-blocking flag
    pub const SFD_NONBLOCK: i32 = libc::O_NONBLOCK;

    /// Every flag `signalfd` accepts
    pub const SFD_ALL: i32 = SFD_CLOEXEC | SFD_NONBLOCK;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values_do_not_overlap() {
        assert_eq!(eventfd::EFD_SEMAPHORE & (eventfd::EFD_CLOEXEC | eventfd::EFD_NONBLOCK), 0);
        assert_ne!(timerfd::TFD_TIMER_ABSTIME, timerfd::TFD_TIMER_CANCEL_ON_SET);
        assert_eq!(signalfd::SFD_ALL, libc::O_CLOEXEC | libc::O_NONBLOCK);
    }
}
