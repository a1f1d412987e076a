//! Bridge that lets one shim descriptor be watched by a multiplexer
//!
//! Shim descriptors are kqueues underneath, so a watcher can only learn
//! "something happened" natively. The bridge asks the descriptor itself for
//! accurate readiness. Holding a `PollableRef` keeps the description alive.

use std::cell::Cell;
use std::os::fd::RawFd;
use std::sync::Arc;

use shim_api::EpollFlags;

use crate::config::config;
use crate::file::{DescKind, FileDescription, Payload};

pub trait Pollable: Send + Sync {
    /// Queue identity of the watched descriptor
    fn fd(&self) -> RawFd;

    /// Current readiness as epoll bits
    fn poll(&self) -> EpollFlags;

    /// Whether the watched descriptor is itself a multiplexer
    fn is_multiplexer(&self) -> bool {
        false
    }

    /// Whether blocking on this source needs more than its queue identity
    fn needs_fallback(&self) -> bool {
        false
    }

    /// Descriptors to include in a blocking `ppoll` on behalf of this source
    fn wait_fds(&self, _out: &mut Vec<libc::pollfd>) {}

    /// Whether `fd` is watched by this source, directly or through nesting
    fn watches(&self, _fd: RawFd) -> bool {
        false
    }
}

/// Counted handle; clone to take a reference, drop to release it
pub type PollableRef = Arc<dyn Pollable>;

const LOCK_ATTEMPTS: usize = 256;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Option<DepthGuard> {
        DEPTH.with(|depth| {
            if depth.get() >= config().max_nesting_depth {
                return None;
            }
            depth.set(depth.get() + 1);
            Some(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

pub struct PollableDesc {
    desc: Arc<FileDescription>,
}

impl PollableDesc {
    pub fn new(desc: Arc<FileDescription>) -> PollableRef {
        Arc::new(PollableDesc { desc })
    }

    /// Run `f` on the payload; gives up on deep nesting or a lock that stays
    /// contended, which only happens when two multiplexers watch each other
    fn with_payload<R>(&self, f: impl FnOnce(&mut Payload) -> R) -> Option<R> {
        let _depth = DepthGuard::enter()?;
        for _ in 0..LOCK_ATTEMPTS {
            if let Some(mut guard) = self.desc.try_lock() {
                return Some(f(&mut guard));
            }
            std::thread::yield_now();
        }
        shim_trace!("fd {}: payload busy, bridged readiness skipped", self.desc.fd());
        None
    }
}

impl Pollable for PollableDesc {
    fn fd(&self) -> RawFd {
        self.desc.fd()
    }

    fn poll(&self) -> EpollFlags {
        self.with_payload(|payload| payload.ops_mut().map(|ops| ops.poll()).unwrap_or_default())
            .unwrap_or_default()
    }

    fn is_multiplexer(&self) -> bool {
        self.desc.kind() == DescKind::Epoll
    }

    fn needs_fallback(&self) -> bool {
        if !self.is_multiplexer() {
            return false;
        }
        self.with_payload(|payload| match payload {
            Payload::Epoll(ctx) => ctx.needs_fallback(),
            _ => false,
        })
        .unwrap_or(false)
    }

    fn wait_fds(&self, out: &mut Vec<libc::pollfd>) {
        if !self.is_multiplexer() {
            return;
        }
        self.with_payload(|payload| {
            if let Payload::Epoll(ctx) = payload {
                ctx.append_wait_fds(out);
            }
        });
    }

    /// Unknown counts as watched, so a cycle check fails closed
    fn watches(&self, fd: RawFd) -> bool {
        if !self.is_multiplexer() {
            return false;
        }
        self.with_payload(|payload| match payload {
            Payload::Epoll(ctx) => ctx.watches(fd),
            _ => false,
        })
        .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_guard_limits_nesting() {
        let max = config().max_nesting_depth;
        let mut guards = Vec::new();
        for _ in 0..max {
            guards.push(DepthGuard::enter().unwrap());
        }
        assert!(DepthGuard::enter().is_none());
        guards.pop();
        assert!(DepthGuard::enter().is_some());
    }

    #[test]
    fn test_busy_multiplexer_counts_as_watching() {
        let epfd = crate::epoll::create(0).unwrap();
        let shim = crate::table::shim_ctx().unwrap();
        let pollable = PollableDesc::new(shim.find_desc(epfd).unwrap());
        assert!(pollable.is_multiplexer());
        assert!(!pollable.watches(1 << 20));

        let desc = shim.find_desc(epfd).unwrap();
        let guard = desc.lock();
        assert!(pollable.watches(1 << 20));
        drop(guard);

        drop(pollable);
        assert!(shim.remove_desc(epfd).is_some());
    }
}
