//! Per-multiplexer state: interest set, ready list, poll fallback list

use core::time::Duration;
use std::collections::{BTreeMap, VecDeque};
use std::os::fd::RawFd;

use shim_api::{EpollEvent, EpollFlags, Result, SyscallError};

use super::node::{self, RegisteredFDsNode};
use crate::config::config;
use crate::file::FileOps;
use crate::pollable::PollableRef;
use crate::sys::{self, Filter, Kevent};
use crate::wake::{Pulse, Wake};

pub struct EpollFdCtx {
    kq: RawFd,
    registered_fds: BTreeMap<RawFd, RegisteredFDsNode>,
    /// Nodes observed with `poll`, in registration order
    poll_fds: Vec<RawFd>,
    /// Nodes with undelivered readiness, in the order it was seen
    ready: VecDeque<RawFd>,
    kevs: Vec<Kevent>,
    changes: Vec<Kevent>,
    pollfds: Vec<libc::pollfd>,
    /// Threads blocked in the fallback `ppoll` with the mutex released
    pub(crate) nr_polling_threads: usize,
    /// Control calls parked until those threads are gone
    pub(crate) nr_parked_ctls: usize,
    wake: Wake,
    /// Announces fallback list changes to anyone blocked on this queue
    pulse: Option<Pulse>,
}

impl EpollFdCtx {
    pub fn new(kq: RawFd) -> Result<Self> {
        let wake = Wake::new(kq)?;
        let pulse = match Pulse::on_queue(kq) {
            Ok(pulse) => Some(pulse),
            Err(err) => {
                shim_debug!("epoll {}: no list-change pulse ({})", kq, err);
                None
            }
        };
        Ok(Self {
            kq,
            registered_fds: BTreeMap::new(),
            poll_fds: Vec::new(),
            ready: VecDeque::new(),
            kevs: vec![Kevent::EMPTY; config().drain_batch.max(1)],
            changes: Vec::new(),
            pollfds: Vec::new(),
            nr_polling_threads: 0,
            nr_parked_ctls: 0,
            wake,
            pulse,
        })
    }

    pub fn kq(&self) -> RawFd {
        self.kq
    }

    pub fn add(&mut self, fd: RawFd, flags: EpollFlags, data: u64, pollable: Option<PollableRef>) -> Result<()> {
        if self.registered_fds.contains_key(&fd) {
            return Err(SyscallError::AlreadyExists);
        }
        let caps = &config().capabilities;
        let node_type = node::classify(fd, pollable.as_ref(), caps)?;
        let mut node = RegisteredFDsNode::new(fd, node_type, pollable);
        node.set_interest(flags, data);
        if let Err(err) = node.sync_registrations(self.kq, &mut self.changes, caps.for_node(node_type), false) {
            node.withdraw(self.kq, &mut self.changes);
            return Err(err);
        }
        shim_trace!(
            "epoll {}: add fd {} as {:?}, events {:?}, fallback {}",
            self.kq,
            fd,
            node_type,
            flags,
            node.needs_pollfd
        );
        self.registered_fds.insert(fd, node);
        Ok(())
    }

    pub fn modify(&mut self, fd: RawFd, flags: EpollFlags, data: u64) -> Result<()> {
        let kq = self.kq;
        let node = self.registered_fds.get_mut(&fd).ok_or(SyscallError::NotFound)?;
        if node.is_exclusive {
            return Err(SyscallError::InvalidArgument);
        }
        node.set_interest(flags, data);
        let caps = config().capabilities.for_node(node.node_type);
        shim_trace!("epoll {}: modify fd {}, events {:?}", kq, fd, flags);
        node.sync_registrations(kq, &mut self.changes, caps, true)
    }

    pub fn delete(&mut self, fd: RawFd) -> Result<()> {
        let mut node = self.registered_fds.remove(&fd).ok_or(SyscallError::NotFound)?;
        node.withdraw(self.kq, &mut self.changes);
        shim_trace!("epoll {}: delete fd {}", self.kq, fd);
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registered_fds.contains_key(&fd)
    }

    /// Registered descriptors in ascending order
    pub fn watched_fds(&self) -> Vec<RawFd> {
        self.registered_fds.keys().copied().collect()
    }

    /// Whether `fd` is watched here, directly or through nested multiplexers
    pub fn watches(&self, fd: RawFd) -> bool {
        self.registered_fds.contains_key(&fd)
            || self
                .registered_fds
                .values()
                .filter_map(|node| node.pollable.as_ref())
                .any(|pollable| pollable.is_multiplexer() && pollable.watches(fd))
    }

    pub fn needs_fallback(&self) -> bool {
        !self.poll_fds.is_empty()
    }

    fn wants_pollfd(&self, fd: RawFd) -> bool {
        self.registered_fds.get(&fd).is_some_and(|node| node.needs_pollfd)
    }

    /// Whether fallback list membership of `fd` disagrees with its node
    pub fn pollfd_list_stale(&self, fd: RawFd) -> bool {
        self.wants_pollfd(fd) != self.poll_fds.contains(&fd)
    }

    /// Whether updating `fd` only takes it off the fallback list
    pub fn pollfd_list_shrinks(&self, fd: RawFd) -> bool {
        !self.wants_pollfd(fd) && self.poll_fds.contains(&fd)
    }

    /// Make fallback list membership of `fd` follow its node
    ///
    /// Every change is announced on the queue, so threads blocked here or
    /// on a multiplexer watching this one rebuild their wait set.
    pub fn sync_pollfd_list(&mut self, fd: RawFd) {
        let wanted = self.wants_pollfd(fd);
        let position = self.poll_fds.iter().position(|&listed| listed == fd);
        match (wanted, position) {
            (true, None) => self.poll_fds.push(fd),
            (false, Some(idx)) => {
                self.poll_fds.remove(idx);
            }
            _ => return,
        }
        if let Some(pulse) = &self.pulse {
            if let Err(err) = pulse.fire() {
                shim_warn!("epoll {}: list-change pulse failed: {}", self.kq, err);
            }
        }
    }

    pub fn wake_pending(&self) -> bool {
        self.wake.is_triggered()
    }

    pub fn trigger_wake(&mut self) -> Result<()> {
        self.wake.trigger().map_err(SyscallError::from)
    }

    pub fn clear_wake(&mut self) -> Result<()> {
        self.wake.clear().map_err(SyscallError::from)
    }

    /// Clear the wake once no poller and no parked control call needs it
    pub fn release_wake(&mut self) -> Result<()> {
        if self.nr_polling_threads == 0 && self.nr_parked_ctls == 0 {
            self.clear_wake()
        } else {
            Ok(())
        }
    }

    fn mark_ready(&mut self, fd: RawFd) {
        if let Some(node) = self.registered_fds.get_mut(&fd) {
            if !node.is_ready_queued {
                node.is_ready_queued = true;
                self.ready.push_back(fd);
            }
        }
    }

    /// Fold one fetched queue event into its node
    fn dispatch(&mut self, kev: &Kevent) {
        // Wake and pulse; watched descriptors only carry fd filters.
        if kev.filter == Filter::User {
            return;
        }
        let fd = kev.ident as RawFd;
        let Some(node) = self.registered_fds.get_mut(&fd) else {
            return;
        };
        if node.is_dormant {
            return;
        }
        let bits = match &node.pollable {
            Some(pollable) => {
                node.got_evfilt_read = true;
                pollable.poll()
            }
            None => match kev.filter {
                Filter::Read => {
                    node.got_evfilt_read = true;
                    node.translate_read(kev)
                }
                Filter::Write => {
                    node.got_evfilt_write = true;
                    node.translate_write(kev)
                }
                Filter::Except => {
                    node.got_evfilt_except = true;
                    EpollFlags::EPOLLPRI
                }
                _ => EpollFlags::empty(),
            },
        };
        if node.accumulate(bits) {
            self.mark_ready(fd);
        }
    }

    /// Non-blocking probe of every node on the fallback list
    fn probe_fallback(&mut self) {
        for idx in 0..self.poll_fds.len() {
            let fd = self.poll_fds[idx];
            let Some(node) = self.registered_fds.get_mut(&fd) else {
                continue;
            };
            if node.is_dormant || !node.needs_pollfd {
                continue;
            }
            let bits = match &node.pollable {
                Some(pollable) => pollable.poll(),
                None => match sys::poll_now(fd, node::epoll_to_poll(node.fallback_events())) {
                    // Closed behind our back; the next close() purges it.
                    Ok(revents) if revents & libc::POLLNVAL != 0 => EpollFlags::empty(),
                    Ok(revents) => node::poll_to_epoll(revents),
                    Err(_) => EpollFlags::empty(),
                },
            };
            if node.accumulate_polled(bits) {
                self.mark_ready(fd);
            }
        }
    }

    /// Pull everything observable right now into the ready list
    fn refresh(&mut self) -> Result<()> {
        let mut kevs = core::mem::take(&mut self.kevs);
        let res = sys::drain(self.kq, &mut kevs);
        if let Ok(n) = res {
            for kev in &kevs[..n] {
                self.dispatch(kev);
            }
        }
        self.kevs = kevs;
        res?;
        self.probe_fallback();
        Ok(())
    }

    /// Hand out ready nodes, one record each
    fn deliver(&mut self, events: &mut [EpollEvent]) -> usize {
        let mut n = 0;
        while n < events.len() {
            let Some(fd) = self.ready.pop_front() else {
                break;
            };
            let Some(node) = self.registered_fds.get_mut(&fd) else {
                continue;
            };
            node.is_ready_queued = false;
            node.got_evfilt_read = false;
            node.got_evfilt_write = false;
            node.got_evfilt_except = false;
            let revents = core::mem::take(&mut node.revents);
            if revents.is_empty() || node.is_dormant {
                continue;
            }
            events[n] = EpollEvent::new(revents, node.data);
            n += 1;

            if node.is_oneshot {
                node.is_dormant = true;
                node.needs_pollfd = false;
                node.withdraw(self.kq, &mut self.changes);
                // Leaving the list never needs the pollers out of the way.
                self.sync_pollfd_list(fd);
            }
        }
        n
    }

    /// Refresh, then deliver up to `events.len()` records
    pub fn collect(&mut self, events: &mut [EpollEvent]) -> Result<usize> {
        self.refresh()?;
        let n = self.deliver(events);
        shim_trace!("epoll {}: {} events, {} still queued", self.kq, n, self.ready.len());
        Ok(n)
    }

    /// Descriptors a thread blocked on this multiplexer must watch
    pub fn append_wait_fds(&self, out: &mut Vec<libc::pollfd>) {
        out.push(sys::pollfd(self.kq, libc::POLLIN));
        if let Some(fd) = self.wake.poll_fd() {
            out.push(sys::pollfd(fd, libc::POLLIN));
        }
        for fd in &self.poll_fds {
            let Some(node) = self.registered_fds.get(fd) else {
                continue;
            };
            if node.is_dormant || !node.needs_pollfd {
                continue;
            }
            match &node.pollable {
                // Already reported; its queue may stay readable.
                Some(_) if node.is_edge_triggered && !node.last_polled.is_empty() => {}
                Some(pollable) => pollable.wait_fds(out),
                None => {
                    let events = node.wait_events();
                    if events != 0 {
                        out.push(sys::pollfd(*fd, events));
                    }
                }
            }
        }
    }

    /// Snapshot for a blocking `ppoll`; return it with `restore_scratch`
    pub fn take_wait_fds(&mut self) -> Vec<libc::pollfd> {
        let mut fds = core::mem::take(&mut self.pollfds);
        fds.clear();
        self.append_wait_fds(&mut fds);
        fds
    }

    pub fn restore_scratch(&mut self, mut fds: Vec<libc::pollfd>) {
        fds.clear();
        if fds.capacity() > config().scratch_retain {
            fds.shrink_to(config().scratch_retain);
        }
        if fds.capacity() > self.pollfds.capacity() {
            self.pollfds = fds;
        }
    }

    /// Upper bound for a blocking wait
    ///
    /// Writability of shim descriptors is never signalled on a queue, so
    /// waiters re-probe it periodically.
    pub fn wait_cap(&self) -> Option<Duration> {
        let polls_writability = self.poll_fds.iter().filter_map(|fd| self.registered_fds.get(fd)).any(|node| {
            node.needs_pollfd
                && !node.is_dormant
                && node.pollable.as_ref().is_some_and(|p| !p.is_multiplexer())
                && node.events.intersects(EpollFlags::WRITE_SIDE)
                && !node.last_polled.intersects(EpollFlags::WRITE_SIDE)
        });
        polls_writability.then(|| config().blocked_write_retry)
    }

    fn has_pending(&self) -> bool {
        self.ready
            .iter()
            .filter_map(|fd| self.registered_fds.get(fd))
            .any(|node| !node.revents.is_empty() && !node.is_dormant)
    }
}

impl FileOps for EpollFdCtx {
    fn poll(&mut self) -> EpollFlags {
        if let Err(err) = self.refresh() {
            shim_debug!("epoll {}: refresh failed: {}", self.kq, err);
        }
        if self.has_pending() {
            EpollFlags::EPOLLIN
        } else {
            EpollFlags::empty()
        }
    }

    fn close(&mut self) {
        shim_debug!("epoll {}: closing with {} registrations", self.kq, self.registered_fds.len());
        self.ready.clear();
        self.poll_fds.clear();
        self.registered_fds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn ctx() -> EpollFdCtx {
        EpollFdCtx::new(sys::kqueue().unwrap()).unwrap()
    }

    fn close(ctx: EpollFdCtx) {
        let kq = ctx.kq();
        drop(ctx);
        sys::close_queue(kq).unwrap();
    }

    #[test]
    fn test_add_modify_delete_bookkeeping() {
        let mut ctx = ctx();
        let (reader, _writer) = sys::pipe().unwrap();
        let fd = reader.as_raw_fd();

        ctx.add(fd, EpollFlags::EPOLLIN, 7, None).unwrap();
        assert_eq!(ctx.add(fd, EpollFlags::EPOLLIN, 7, None), Err(SyscallError::AlreadyExists));
        assert_eq!(ctx.watched_fds(), vec![fd]);

        ctx.modify(fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLET, 8).unwrap();
        ctx.delete(fd).unwrap();
        assert_eq!(ctx.delete(fd), Err(SyscallError::NotFound));
        assert_eq!(ctx.modify(fd, EpollFlags::EPOLLIN, 0), Err(SyscallError::NotFound));
        assert!(ctx.watched_fds().is_empty());
        close(ctx);
    }

    #[test]
    fn test_level_triggered_pipe_reports_until_drained() {
        let mut ctx = ctx();
        let (reader, writer) = sys::pipe().unwrap();
        ctx.add(reader.as_raw_fd(), EpollFlags::EPOLLIN, 42, None).unwrap();

        let mut events = [EpollEvent::default(); 4];
        assert_eq!(ctx.collect(&mut events).unwrap(), 0);

        sys::write(writer.as_raw_fd(), b"x").unwrap();
        for _ in 0..2 {
            assert_eq!(ctx.collect(&mut events).unwrap(), 1);
            assert_eq!(events[0].data(), 42);
            assert_eq!(events[0].flags(), EpollFlags::EPOLLIN);
        }

        let mut buf = [0u8; 4];
        sys::read(reader.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(ctx.collect(&mut events).unwrap(), 0);
        close(ctx);
    }

    #[test]
    fn test_oneshot_goes_dormant_until_modified() {
        let mut ctx = ctx();
        let (reader, writer) = sys::pipe().unwrap();
        let fd = reader.as_raw_fd();
        ctx.add(fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT, 1, None).unwrap();
        sys::write(writer.as_raw_fd(), b"x").unwrap();

        let mut events = [EpollEvent::default(); 4];
        assert_eq!(ctx.collect(&mut events).unwrap(), 1);
        assert_eq!(ctx.collect(&mut events).unwrap(), 0);

        ctx.modify(fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT, 2).unwrap();
        assert_eq!(ctx.collect(&mut events).unwrap(), 1);
        assert_eq!(events[0].data(), 2);
        close(ctx);
    }

    #[test]
    fn test_fallback_list_follows_node() {
        let mut ctx = ctx();
        let (reader, _writer) = sys::pipe().unwrap();
        let fd = reader.as_raw_fd();
        ctx.add(fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI, 0, None).unwrap();
        assert!(ctx.pollfd_list_stale(fd));
        ctx.sync_pollfd_list(fd);
        assert!(ctx.needs_fallback());

        let fds = ctx.take_wait_fds();
        assert_eq!(fds[0].fd, ctx.kq());
        assert!(fds.iter().any(|p| p.fd == fd && p.events & libc::POLLPRI != 0));
        ctx.restore_scratch(fds);

        ctx.delete(fd).unwrap();
        assert!(ctx.pollfd_list_shrinks(fd));
        ctx.sync_pollfd_list(fd);
        assert!(!ctx.needs_fallback());
        close(ctx);
    }

    #[test]
    fn test_wake_is_not_reported_as_event() {
        let mut ctx = ctx();
        ctx.trigger_wake().unwrap();
        assert!(ctx.wake_pending());
        let mut events = [EpollEvent::default(); 4];
        assert_eq!(ctx.collect(&mut events).unwrap(), 0);
        ctx.clear_wake().unwrap();
        assert!(!ctx.wake_pending());
        close(ctx);
    }

    #[test]
    fn test_list_changes_make_queue_readable() {
        let mut ctx = ctx();
        let (reader, _writer) = sys::pipe().unwrap();
        let fd = reader.as_raw_fd();
        let mut events = [EpollEvent::default(); 4];

        ctx.add(fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI, 0, None).unwrap();
        ctx.sync_pollfd_list(fd);
        assert!(sys::wait_readable(ctx.kq(), Some(Duration::ZERO)).unwrap());
        assert_eq!(ctx.collect(&mut events).unwrap(), 0);
        assert!(!sys::wait_readable(ctx.kq(), Some(Duration::ZERO)).unwrap());

        // Removal must also move pollers off their snapshot.
        ctx.delete(fd).unwrap();
        ctx.sync_pollfd_list(fd);
        assert!(sys::wait_readable(ctx.kq(), Some(Duration::ZERO)).unwrap());
        assert_eq!(ctx.collect(&mut events).unwrap(), 0);
        assert!(!sys::wait_readable(ctx.kq(), Some(Duration::ZERO)).unwrap());
        close(ctx);
    }
}
