//! Unified logging support for epoll-shim
//!
//! The shim logs through these macros so that builds without the `log`
//! feature carry no facade and need no `#[cfg]` at each call site.

/// Unified trace-level logging
macro_rules! shim_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::trace!(target: "epoll_shim", $($arg)*);
    }
}

/// Unified debug-level logging
macro_rules! shim_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::debug!(target: "epoll_shim", $($arg)*);
    }
}

/// Unified info-level logging
#[allow(unused_macros)]
macro_rules! shim_info {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::info!(target: "epoll_shim", $($arg)*);
    }
}

/// Unified warn-level logging
macro_rules! shim_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::warn!(target: "epoll_shim", $($arg)*);
    }
}

/// Unified error-level logging
macro_rules! shim_error {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::error!(target: "epoll_shim", $($arg)*);
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_macros_expand_in_statement_position() {
        let fd = 3;
        shim_trace!("trace fd={}", fd);
        shim_debug!("debug fd={}", fd);
        shim_info!("info fd={}", fd);
        shim_warn!("warn fd={}", fd);
        shim_error!("error fd={}", fd);
    }
}
