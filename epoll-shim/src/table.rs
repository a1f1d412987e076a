//! Global descriptor table and wall-clock-step detection
//!
//! Slot `n` holds the description whose queue identity is `n`, so the
//! integer a caller gets back is also a real kernel handle that other
//! multiplexers can watch. Lock order: the table lock before any
//! descriptor mutex, and at most one descriptor mutex while traversing.

use lazy_static::lazy_static;
use spin::{RwLock, RwLockWriteGuard};
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use shim_api::{Result, SyscallError};

use crate::config::config;
use crate::epoll;
use crate::file::{DescKind, FileDescription, Payload};
use crate::sys;

type Slots = Vec<Option<Arc<FileDescription>>>;

/// Wall-clock-step bookkeeping
struct RealtimeMonitor {
    /// Armed absolute realtime timers
    nr_interested: usize,
    /// Bumped on every start and stop; a detector exits once it differs
    generation: u64,
}

pub struct ShimCtx {
    descs: RwLock<Slots>,
    realtime: Mutex<RealtimeMonitor>,
    realtime_cond: Condvar,
}

lazy_static! {
    static ref SHIM_CTX: Result<ShimCtx> = ShimCtx::new();
}

/// Process-wide shim state; a failed first initialization is returned to
/// every later caller
pub fn shim_ctx() -> Result<&'static ShimCtx> {
    SHIM_CTX.as_ref().map_err(|err| *err)
}

/// A created but not yet visible description; holds the table write lock
pub struct PendingDesc {
    guard: RwLockWriteGuard<'static, Slots>,
    fd: RawFd,
    desc: Arc<FileDescription>,
}

impl PendingDesc {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn desc(&self) -> &Arc<FileDescription> {
        &self.desc
    }
}

impl ShimCtx {
    fn new() -> Result<Self> {
        let mut slots = Slots::new();
        slots
            .try_reserve(config().initial_table_capacity)
            .map_err(|_| SyscallError::OutOfMemory)?;
        Ok(ShimCtx {
            descs: RwLock::new(slots),
            realtime: Mutex::new(RealtimeMonitor {
                nr_interested: 0,
                generation: 0,
            }),
            realtime_cond: Condvar::new(),
        })
    }

    /// Create a queue and reserve its slot; the description stays invisible
    /// until `install_desc`
    pub fn create_desc(&'static self, kind: DescKind, flags: i32) -> Result<PendingDesc> {
        let fd = sys::kqueue()?;
        let desc = Arc::new(FileDescription::new(fd, kind, flags));
        let idx = fd as usize;

        let mut guard = self.descs.write();
        if guard.len() <= idx {
            let extra = idx + 1 - guard.len();
            if guard.try_reserve(extra).is_err() {
                drop(guard);
                return Err(SyscallError::OutOfMemory);
            }
            guard.resize_with(idx + 1, || None);
        }
        if let Some(stale) = guard[idx].take() {
            // The previous occupant's integer was closed behind our back and
            // the kernel reused it; it must not close the new queue.
            shim_warn!("fd {}: discarding stale {:?} description", fd, stale.kind());
            stale.disown();
        }
        shim_debug!("fd {}: created {:?} description", fd, kind);
        Ok(PendingDesc { guard, fd, desc })
    }

    /// Publish a fully initialized description
    pub fn install_desc(&self, pending: PendingDesc) -> RawFd {
        let PendingDesc { mut guard, fd, desc } = pending;
        guard[fd as usize] = Some(desc);
        fd
    }

    /// Abandon a description whose initialization failed
    pub fn drop_desc(&self, pending: PendingDesc) {
        let PendingDesc { guard, fd, desc } = pending;
        drop(guard);
        shim_debug!("fd {}: initialization failed, dropping", fd);
        drop(desc);
    }

    /// Create, initialize and publish a description in one step
    ///
    /// `init` runs while the slot is reserved; on failure nothing becomes
    /// visible and the queue is closed.
    pub fn create_with(
        &'static self,
        kind: DescKind,
        flags: i32,
        cloexec: bool,
        init: impl FnOnce(RawFd) -> Result<Payload>,
    ) -> Result<RawFd> {
        let pending = self.create_desc(kind, flags)?;
        let fd = pending.fd();
        let payload = sys::set_cloexec(fd, cloexec)
            .map_err(SyscallError::from)
            .and_then(|()| init(fd));
        match payload {
            Ok(payload) => {
                *pending.desc().lock() = payload;
                Ok(self.install_desc(pending))
            }
            Err(err) => {
                self.drop_desc(pending);
                Err(err)
            }
        }
    }

    /// Lookup that also checks the payload kind
    ///
    /// A descriptor that is open but not a shim descriptor of `kind` is an
    /// invalid argument; one that is not open at all is a bad descriptor.
    pub fn find_typed(&self, fd: RawFd, kind: DescKind) -> Result<Arc<FileDescription>> {
        match self.find_desc(fd) {
            Some(desc) if desc.kind() == kind => Ok(desc),
            Some(_) => Err(SyscallError::InvalidArgument),
            None if sys::is_fd_open(fd) => Err(SyscallError::InvalidArgument),
            None => Err(SyscallError::BadDescriptor),
        }
    }

    pub fn find_desc(&self, fd: RawFd) -> Option<Arc<FileDescription>> {
        if fd < 0 {
            return None;
        }
        self.descs.read().get(fd as usize).and_then(|slot| slot.clone())
    }

    /// Detach `fd` from the table and purge it from every multiplexer
    ///
    /// Returns the detached description, if `fd` was a shim descriptor.
    pub fn remove_desc(&self, fd: RawFd) -> Option<Arc<FileDescription>> {
        if fd < 0 {
            return None;
        }
        let mut guard = self.descs.write();
        let removed = guard.get_mut(fd as usize).and_then(Option::take);
        let guard = guard.downgrade();

        for desc in guard.iter().flatten() {
            if desc.kind() == DescKind::Epoll {
                epoll::forget_fd(desc, fd);
            }
        }
        drop(guard);

        if removed.is_some() {
            shim_debug!("fd {}: removed from table", fd);
        }
        removed
    }

    /// Visit every live description under the read lock
    pub fn for_each_desc(&self, mut f: impl FnMut(&Arc<FileDescription>)) {
        for desc in self.descs.read().iter().flatten() {
            f(desc);
        }
    }

    /// Track armed absolute realtime timers; the detector runs while the
    /// count is non-zero
    pub fn update_realtime_change_monitoring(&'static self, delta: isize) {
        let mut monitor = self.realtime.lock().unwrap_or_else(PoisonError::into_inner);
        let before = monitor.nr_interested;
        let after = before.saturating_add_signed(delta);
        monitor.nr_interested = after;

        if before == 0 && after > 0 {
            monitor.generation = monitor.generation.wrapping_add(1);
            let generation = monitor.generation;
            let spawned = std::thread::Builder::new()
                .name("epoll-shim-realtime".into())
                .spawn(move || self.realtime_detector(generation));
            if let Err(err) = spawned {
                shim_error!("wall-clock-step detector did not start: {}", err);
            }
        } else if before > 0 && after == 0 {
            monitor.generation = monitor.generation.wrapping_add(1);
            self.realtime_cond.notify_all();
        }
    }

    fn realtime_detector(&'static self, generation: u64) {
        let cfg = config();
        let threshold = cfg.realtime_step_threshold.as_nanos() as i128;
        let mut last = match realtime_offset() {
            Some(offset) => offset,
            None => {
                shim_warn!("wall-clock-step detector cannot read clocks");
                return;
            }
        };
        shim_debug!("wall-clock-step detector {} running", generation);

        let mut monitor = self.realtime.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if monitor.generation != generation {
                break;
            }
            monitor = self
                .realtime_cond
                .wait_timeout(monitor, cfg.realtime_check_interval)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            if monitor.generation != generation {
                break;
            }
            let Some(offset) = realtime_offset() else {
                continue;
            };
            let stepped = (offset - last).abs() > threshold;
            last = offset;
            if stepped {
                drop(monitor);
                shim_debug!("wall clock stepped, notifying timers");
                self.for_each_desc(|desc| {
                    if desc.kind() == DescKind::Timer {
                        desc.realtime_step();
                    }
                });
                monitor = self.realtime.lock().unwrap_or_else(PoisonError::into_inner);
            }
        }
        shim_debug!("wall-clock-step detector {} stopped", generation);
    }

    #[cfg(test)]
    fn realtime_interest(&self) -> (usize, u64) {
        let monitor = self.realtime.lock().unwrap_or_else(PoisonError::into_inner);
        (monitor.nr_interested, monitor.generation)
    }
}

/// REALTIME minus MONOTONIC in nanoseconds
fn realtime_offset() -> Option<i128> {
    let real = sys::clock_now(libc::CLOCK_REALTIME).ok()?;
    let mono = sys::clock_now(libc::CLOCK_MONOTONIC).ok()?;
    Some(real.as_nanos() as i128 - mono.as_nanos() as i128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_makes_description_visible() {
        let ctx = shim_ctx().unwrap();
        let pending = ctx.create_desc(DescKind::Event, 0).unwrap();
        let fd = pending.fd();
        assert_eq!(pending.desc().fd(), fd);
        assert_eq!(ctx.install_desc(pending), fd);

        let found = ctx.find_desc(fd).unwrap();
        assert_eq!(found.kind(), DescKind::Event);
        drop(found);

        let removed = ctx.remove_desc(fd).unwrap();
        assert_eq!(removed.fd(), fd);
        assert!(ctx.find_desc(fd).is_none());
    }

    #[test]
    fn test_dropped_pending_description_is_never_visible() {
        let ctx = shim_ctx().unwrap();
        let pending = ctx.create_desc(DescKind::Timer, 0).unwrap();
        let fd = pending.fd();
        // Keeps the queue open so its number cannot be reused meanwhile.
        let held = pending.desc().clone();
        ctx.drop_desc(pending);
        assert!(ctx.find_desc(fd).is_none());
        drop(held);
    }

    #[test]
    fn test_lookup_of_negative_or_unknown_fd() {
        let ctx = shim_ctx().unwrap();
        assert!(ctx.find_desc(-1).is_none());
        assert!(ctx.remove_desc(-1).is_none());
        assert!(ctx.find_desc(1 << 20).is_none());
    }

    #[test]
    fn test_realtime_monitoring_counts_interest() {
        let ctx = shim_ctx().unwrap();
        let (count, generation) = ctx.realtime_interest();
        assert_eq!(count, 0);

        ctx.update_realtime_change_monitoring(1);
        assert_eq!(ctx.realtime_interest(), (1, generation.wrapping_add(1)));
        ctx.update_realtime_change_monitoring(1);
        assert_eq!(ctx.realtime_interest(), (2, generation.wrapping_add(1)));

        ctx.update_realtime_change_monitoring(-2);
        assert_eq!(ctx.realtime_interest(), (0, generation.wrapping_add(2)));
    }
}
