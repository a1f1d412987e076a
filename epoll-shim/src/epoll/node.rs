//! Registration state of one watched descriptor

use bitflags::bitflags;
use std::io;
use std::os::fd::RawFd;

use shim_api::{EpollFlags, Result, SyscallError};

use crate::config::{Capabilities, FilterCaps};
use crate::pollable::PollableRef;
use crate::sys::{self, EvFlags, Filter, Kevent};

/// How the queue can observe a watched descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Fifo,
    Socket,
    /// Another multiplexer (shim or foreign queue)
    Kqueue,
    Other,
    /// Observed with `poll` only
    Poll,
}

bitflags! {
    /// Half-close state seen so far
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EofState: u8 {
        const READ = 0x1;
        const WRITE = 0x2;
    }
}

/// Errors meaning "this filter cannot watch this kind", handled by polling
fn is_unsupported(errno: i32) -> bool {
    [
        libc::EINVAL,
        libc::ENODEV,
        libc::EOPNOTSUPP,
        libc::ENOTSUP,
        libc::ENOTTY,
        libc::EPERM,
    ]
    .contains(&errno)
}

const POLL_MAP: [(EpollFlags, libc::c_short); 9] = [
    (EpollFlags::EPOLLIN, libc::POLLIN),
    (EpollFlags::EPOLLPRI, libc::POLLPRI),
    (EpollFlags::EPOLLOUT, libc::POLLOUT),
    (EpollFlags::EPOLLERR, libc::POLLERR),
    (EpollFlags::EPOLLHUP, libc::POLLHUP),
    (EpollFlags::EPOLLRDNORM, libc::POLLRDNORM),
    (EpollFlags::EPOLLRDBAND, libc::POLLRDBAND),
    (EpollFlags::EPOLLWRNORM, libc::POLLWRNORM),
    (EpollFlags::EPOLLWRBAND, libc::POLLWRBAND),
];

pub fn epoll_to_poll(flags: EpollFlags) -> libc::c_short {
    let mut events = POLL_MAP
        .iter()
        .filter(|(epoll, _)| flags.contains(*epoll))
        .fold(0, |acc, (_, poll)| acc | poll);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if flags.contains(EpollFlags::EPOLLRDHUP) {
        events |= libc::POLLRDHUP;
    }
    events
}

pub fn poll_to_epoll(revents: libc::c_short) -> EpollFlags {
    let mut flags = POLL_MAP
        .iter()
        .filter(|(_, poll)| revents & poll != 0)
        .fold(EpollFlags::empty(), |acc, (epoll, _)| acc | *epoll);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if revents & libc::POLLRDHUP != 0 {
        flags |= EpollFlags::EPOLLRDHUP;
    }
    flags
}

/// Classify a descriptor about to be watched
///
/// Shim descriptors are known from the table; everything else from `fstat`.
pub fn classify(fd: RawFd, pollable: Option<&PollableRef>, caps: &Capabilities) -> Result<NodeType> {
    if let Some(pollable) = pollable {
        return Ok(if pollable.is_multiplexer() {
            NodeType::Kqueue
        } else {
            NodeType::Other
        });
    }

    // SAFETY: all-zero is a valid stat buffer and fstat fills it.
    let mut st: libc::stat = unsafe { core::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let fmt = st.st_mode as u32 & libc::S_IFMT as u32;
    let node_type = if fmt == libc::S_IFREG as u32 || fmt == libc::S_IFDIR as u32 {
        return Err(SyscallError::PermissionDenied);
    } else if fmt == libc::S_IFIFO as u32 {
        NodeType::Fifo
    } else if fmt == libc::S_IFSOCK as u32 {
        if is_stream_socket(fd) {
            NodeType::Socket
        } else {
            NodeType::Other
        }
    } else if fmt == libc::S_IFCHR as u32 && caps.char_device_fallback {
        NodeType::Poll
    } else {
        NodeType::Other
    };
    Ok(node_type)
}

fn is_stream_socket(fd: RawFd) -> bool {
    let mut ty: libc::c_int = 0;
    let mut len = core::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: ty and len describe a valid int-sized buffer.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            (&mut ty as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    rc == 0 && (ty == libc::SOCK_STREAM || ty == libc::SOCK_SEQPACKET)
}

pub struct RegisteredFDsNode {
    pub fd: RawFd,
    pub data: u64,
    /// Requested condition bits, without delivery-mode bits
    pub events: EpollFlags,
    pub is_edge_triggered: bool,
    pub is_oneshot: bool,
    pub is_exclusive: bool,
    /// One-shot node that fired; silent until modified
    pub is_dormant: bool,
    pub has_evfilt_read: bool,
    pub has_evfilt_write: bool,
    pub has_evfilt_except: bool,
    pub got_evfilt_read: bool,
    pub got_evfilt_write: bool,
    pub got_evfilt_except: bool,
    /// Mode the native registrations were made with
    registered_mode: EvFlags,
    pub node_type: NodeType,
    pub eof_state: EofState,
    pub revents: EpollFlags,
    pub needs_pollfd: bool,
    pub is_ready_queued: bool,
    /// Fallback readiness at the previous probe, for edge emulation
    pub last_polled: EpollFlags,
    pub pollable: Option<PollableRef>,
}

impl RegisteredFDsNode {
    pub fn new(fd: RawFd, node_type: NodeType, pollable: Option<PollableRef>) -> Self {
        Self {
            fd,
            data: 0,
            events: EpollFlags::empty(),
            is_edge_triggered: false,
            is_oneshot: false,
            is_exclusive: false,
            is_dormant: false,
            has_evfilt_read: false,
            has_evfilt_write: false,
            has_evfilt_except: false,
            got_evfilt_read: false,
            got_evfilt_write: false,
            got_evfilt_except: false,
            registered_mode: EvFlags::empty(),
            node_type,
            eof_state: EofState::empty(),
            revents: EpollFlags::empty(),
            needs_pollfd: false,
            is_ready_queued: false,
            last_polled: EpollFlags::empty(),
            pollable,
        }
    }

    /// Replace interest and payload; re-arms a fired one-shot node
    pub fn set_interest(&mut self, flags: EpollFlags, data: u64) {
        self.events = flags - EpollFlags::DELIVERY_MODE;
        self.is_edge_triggered = flags.contains(EpollFlags::EPOLLET);
        self.is_oneshot = flags.contains(EpollFlags::EPOLLONESHOT);
        self.is_exclusive = flags.contains(EpollFlags::EPOLLEXCLUSIVE);
        self.data = data;
        self.is_dormant = false;
        self.revents = EpollFlags::empty();
        self.last_polled = EpollFlags::empty();
    }

    fn mode(&self) -> EvFlags {
        let mut mode = EvFlags::empty();
        if self.is_edge_triggered {
            mode |= EvFlags::CLEAR;
        }
        if self.is_oneshot {
            mode |= EvFlags::DISPATCH;
        }
        mode
    }

    fn has_filter(&mut self, filter: Filter) -> &mut bool {
        match filter {
            Filter::Write => &mut self.has_evfilt_write,
            Filter::Except => &mut self.has_evfilt_except,
            _ => &mut self.has_evfilt_read,
        }
    }

    /// Interest bits that no native registration covers
    pub fn fallback_events(&self) -> EpollFlags {
        let mut events = EpollFlags::empty();
        if !self.has_evfilt_read {
            events |= self.events & EpollFlags::READ_SIDE;
        }
        if !self.has_evfilt_write {
            events |= self.events & EpollFlags::WRITE_SIDE;
        }
        if !self.has_evfilt_except {
            events |= self.events & EpollFlags::EXCEPT_SIDE;
        }
        events
    }

    /// Bring native registrations in line with the requested interest,
    /// issuing only the changes that differ from the current ones
    ///
    /// With `rearm`, kept filters are added again so that a condition that
    /// is already true produces a fresh edge.
    pub fn sync_registrations(
        &mut self,
        kq: RawFd,
        changes: &mut Vec<Kevent>,
        caps: FilterCaps,
        rearm: bool,
    ) -> Result<()> {
        let active = !self.is_dormant && !self.events.is_empty();
        let (want_read, want_write, want_except) = if self.pollable.is_some() {
            // Queue activity is only a hint; the bridge says what is ready.
            (active, false, false)
        } else {
            (
                active && caps.read && self.events.intersects(EpollFlags::READ_SIDE),
                active && caps.write && self.events.intersects(EpollFlags::WRITE_SIDE),
                active && caps.except && self.events.intersects(EpollFlags::EXCEPT_SIDE),
            )
        };
        let mode = self.mode();
        let ident = self.fd as usize;

        changes.clear();
        for (filter, want, has) in [
            (Filter::Read, want_read, self.has_evfilt_read),
            (Filter::Write, want_write, self.has_evfilt_write),
            (Filter::Except, want_except, self.has_evfilt_except),
        ] {
            if has && (!want || self.registered_mode != mode) {
                changes.push(Kevent::new(ident, filter, EvFlags::DELETE));
            }
            if want && (!has || rearm || self.registered_mode != mode) {
                changes.push(Kevent::new(ident, filter, EvFlags::ADD | mode));
            }
        }

        let mut hard_error = None;
        if !changes.is_empty() {
            sys::kevent_receipt(kq, changes)?;
            for kev in changes.iter() {
                let has = self.has_filter(kev.filter);
                if kev.flags.contains(EvFlags::DELETE) {
                    *has = false;
                    continue;
                }
                match kev.error() {
                    None => *has = true,
                    Some(errno) if is_unsupported(errno) => {
                        *has = false;
                        shim_trace!("fd {}: {:?} filter rejected (errno {}), polling instead", self.fd, kev.filter, errno);
                    }
                    Some(errno) => {
                        *has = false;
                        hard_error.get_or_insert(errno);
                    }
                }
            }
        }
        self.registered_mode = mode;

        self.needs_pollfd = active
            && match &self.pollable {
                Some(pollable) => {
                    self.events.intersects(EpollFlags::WRITE_SIDE)
                        || pollable.is_multiplexer()
                        || pollable.needs_fallback()
                }
                None => !self.fallback_events().is_empty(),
            };

        match hard_error {
            Some(errno) => Err(SyscallError::from_errno(errno)),
            None => Ok(()),
        }
    }

    /// Delete every native registration, ignoring failures
    pub fn withdraw(&mut self, kq: RawFd, changes: &mut Vec<Kevent>) {
        let ident = self.fd as usize;
        changes.clear();
        for (filter, has) in [
            (Filter::Read, self.has_evfilt_read),
            (Filter::Write, self.has_evfilt_write),
            (Filter::Except, self.has_evfilt_except),
        ] {
            if has {
                changes.push(Kevent::new(ident, filter, EvFlags::DELETE));
            }
        }
        if !changes.is_empty() {
            // A closed descriptor has already lost its registrations.
            let _ = sys::kevent_receipt(kq, changes);
        }
        self.has_evfilt_read = false;
        self.has_evfilt_write = false;
        self.has_evfilt_except = false;
    }

    /// Peer closed both directions of a stream socket
    fn peer_hung_up(&self) -> bool {
        matches!(sys::poll_now(self.fd, libc::POLLOUT), Ok(revents) if revents & libc::POLLHUP != 0)
    }

    pub fn translate_read(&mut self, kev: &Kevent) -> EpollFlags {
        if !kev.flags.contains(EvFlags::EOF) {
            return EpollFlags::EPOLLIN;
        }
        self.eof_state |= EofState::READ;
        match self.node_type {
            // Writer gone: hang-up once drained.
            NodeType::Fifo if kev.data == 0 => EpollFlags::EPOLLHUP,
            NodeType::Fifo => EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP,
            NodeType::Socket => {
                let mut bits = EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
                if kev.fflags != 0 {
                    bits |= EpollFlags::EPOLLERR;
                }
                if self.peer_hung_up() {
                    self.eof_state |= EofState::WRITE;
                }
                if self.eof_state.is_all() {
                    bits |= EpollFlags::EPOLLHUP;
                }
                bits
            }
            _ => EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP,
        }
    }

    pub fn translate_write(&mut self, kev: &Kevent) -> EpollFlags {
        if !kev.flags.contains(EvFlags::EOF) {
            return EpollFlags::EPOLLOUT;
        }
        self.eof_state |= EofState::WRITE;
        match self.node_type {
            // No reader left on the pipe.
            NodeType::Fifo => EpollFlags::EPOLLOUT | EpollFlags::EPOLLERR,
            NodeType::Socket => {
                let mut bits = EpollFlags::EPOLLOUT | EpollFlags::EPOLLHUP;
                if kev.fflags != 0 {
                    bits |= EpollFlags::EPOLLERR;
                }
                self.eof_state |= EofState::READ;
                bits
            }
            _ => EpollFlags::EPOLLOUT | EpollFlags::EPOLLHUP,
        }
    }

    /// Merge observed bits, masked to what the caller asked for plus the
    /// always-reported conditions; true if anything was added
    pub fn accumulate(&mut self, bits: EpollFlags) -> bool {
        let bits = bits & (self.events | EpollFlags::ALWAYS_REPORTED);
        if bits.is_empty() || self.is_dormant {
            return false;
        }
        self.revents |= bits;
        true
    }

    /// Merge fallback readiness; edge-triggered nodes only see new bits
    pub fn accumulate_polled(&mut self, bits: EpollFlags) -> bool {
        let previous = core::mem::replace(&mut self.last_polled, bits);
        if self.is_edge_triggered {
            self.accumulate(bits - previous)
        } else {
            self.accumulate(bits)
        }
    }

    /// Events a blocked poller should wait for on this node's own fd; zero
    /// means the node has nothing left to wait for
    pub fn wait_events(&self) -> libc::c_short {
        let mut events = self.fallback_events();
        if self.is_edge_triggered {
            // Hang-up and error persist; polling for them again would spin.
            if self.last_polled.intersects(EpollFlags::ALWAYS_REPORTED) {
                return 0;
            }
            events -= self.last_polled;
        }
        epoll_to_poll(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn node(node_type: NodeType, events: EpollFlags) -> RegisteredFDsNode {
        let mut node = RegisteredFDsNode::new(3, node_type, None);
        node.set_interest(events, 0);
        node
    }

    #[test]
    fn test_poll_bit_mapping() {
        let flags = EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT | EpollFlags::EPOLLPRI;
        assert_eq!(poll_to_epoll(epoll_to_poll(flags)), flags);
        assert_eq!(
            poll_to_epoll(libc::POLLHUP | libc::POLLERR),
            EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR
        );
    }

    #[test]
    fn test_fifo_eof_without_data_is_hangup() {
        let mut n = node(NodeType::Fifo, EpollFlags::EPOLLIN);
        let eof = Kevent::new(3, Filter::Read, EvFlags::EOF);
        assert_eq!(n.translate_read(&eof), EpollFlags::EPOLLHUP);
        assert_eq!(
            n.translate_read(&eof.with_data(4)),
            EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP
        );
        assert!(n.eof_state.contains(EofState::READ));
    }

    #[test]
    fn test_fifo_write_eof_is_error() {
        let mut n = node(NodeType::Fifo, EpollFlags::EPOLLOUT);
        let eof = Kevent::new(3, Filter::Write, EvFlags::EOF);
        assert!(n.translate_write(&eof).contains(EpollFlags::EPOLLERR));
    }

    #[test]
    fn test_accumulate_masks_unrequested_bits() {
        let mut n = node(NodeType::Other, EpollFlags::EPOLLIN);
        assert!(!n.accumulate(EpollFlags::EPOLLOUT));
        assert!(n.accumulate(EpollFlags::EPOLLOUT | EpollFlags::EPOLLHUP));
        assert_eq!(n.revents, EpollFlags::EPOLLHUP);
    }

    #[test]
    fn test_polled_edges_only_report_new_bits() {
        let mut n = node(NodeType::Poll, EpollFlags::EPOLLIN | EpollFlags::EPOLLET);
        assert!(n.accumulate_polled(EpollFlags::EPOLLIN));
        n.revents = EpollFlags::empty();
        assert!(!n.accumulate_polled(EpollFlags::EPOLLIN));
        assert!(!n.accumulate_polled(EpollFlags::empty()));
        assert!(n.accumulate_polled(EpollFlags::EPOLLIN));
    }

    #[test]
    fn test_set_interest_strips_delivery_bits() {
        let n = node(
            NodeType::Fifo,
            EpollFlags::EPOLLIN | EpollFlags::EPOLLET | EpollFlags::EPOLLONESHOT,
        );
        assert_eq!(n.events, EpollFlags::EPOLLIN);
        assert!(n.is_edge_triggered && n.is_oneshot);
        assert_eq!(n.mode(), EvFlags::CLEAR | EvFlags::DISPATCH);
    }

    #[test]
    fn test_classify_rejects_regular_files() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let caps = crate::config::config().capabilities.clone();
        assert!(classify(file.as_raw_fd(), None, &caps).is_ok());

        let dir = std::fs::File::open(".").unwrap();
        assert_eq!(
            classify(dir.as_raw_fd(), None, &caps),
            Err(SyscallError::PermissionDenied)
        );
    }

    #[test]
    fn test_classify_pipes_and_sockets() {
        let caps = crate::config::config().capabilities.clone();
        let (reader, _writer) = sys::pipe().unwrap();
        assert_eq!(classify(reader.as_raw_fd(), None, &caps), Ok(NodeType::Fifo));

        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        assert_eq!(classify(a.as_raw_fd(), None, &caps), Ok(NodeType::Socket));
    }

    #[test]
    fn test_sync_registers_and_withdraws() {
        let kq = sys::kqueue().unwrap();
        let (reader, _writer) = sys::pipe().unwrap();
        let mut n = RegisteredFDsNode::new(reader.as_raw_fd(), NodeType::Fifo, None);
        n.set_interest(EpollFlags::EPOLLIN, 1);
        let mut changes = Vec::new();
        n.sync_registrations(kq, &mut changes, FilterCaps::READ_WRITE, false).unwrap();
        assert!(n.has_evfilt_read && !n.has_evfilt_write);
        assert!(!n.needs_pollfd);

        n.set_interest(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI, 1);
        n.sync_registrations(kq, &mut changes, FilterCaps::READ_WRITE, false).unwrap();
        // No except filter for pipes: PRI goes to the poll fallback.
        assert!(n.needs_pollfd);
        assert_eq!(n.fallback_events(), EpollFlags::EPOLLPRI);

        n.withdraw(kq, &mut changes);
        assert!(!n.has_evfilt_read);
        sys::close_queue(kq).unwrap();
    }
}
