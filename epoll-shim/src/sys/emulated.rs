//! kqueue interface built from epoll, eventfd, timerfd and signalfd
//!
//! Each queue is a real epoll descriptor, so it can be polled and nested
//! exactly like a kqueue. Filter state lives in a per-queue table here;
//! `ONESHOT`, `DISPATCH` and mixed `CLEAR` semantics are applied while
//! translating epoll readiness back into [`Kevent`] records.

use core::time::Duration;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use spin::Mutex;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use super::{EvFlags, Filter, Kevent, NOTE_TRIGGER};

const TAG_SHIFT: u32 = 56;
const IDENT_MASK: u64 = (1 << TAG_SHIFT) - 1;

const TAG_FD: u8 = 0;
const TAG_USER: u8 = 1;
const TAG_TIMER: u8 = 2;
const TAG_SIGNAL: u8 = 3;

const EP_READ: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
const EP_WRITE: u32 = libc::EPOLLOUT as u32;
const EP_EXCEPT: u32 = libc::EPOLLPRI as u32;
const EP_HUP: u32 = libc::EPOLLHUP as u32;
const EP_ERR: u32 = libc::EPOLLERR as u32;
const EP_ET: u32 = libc::EPOLLET as u32;

fn token(tag: u8, ident: usize) -> u64 {
    ((tag as u64) << TAG_SHIFT) | (ident as u64 & IDENT_MASK)
}

fn split_token(token: u64) -> (u8, usize) {
    ((token >> TAG_SHIFT) as u8, (token & IDENT_MASK) as usize)
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Bytes ready to read on `fd`; 0 when the descriptor does not say
fn fionread(fd: RawFd) -> i64 {
    let mut n: libc::c_int = 0;
    // SAFETY: FIONREAD writes one int.
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n as *mut libc::c_int) };
    if rc < 0 { 0 } else { n as i64 }
}

fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32, data: u64) -> Result<(), i32> {
    let mut ev = libc::epoll_event { events, u64: data };
    // SAFETY: ev is a valid epoll_event for the duration of the call.
    if unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) } < 0 {
        Err(errno())
    } else {
        Ok(())
    }
}

/// Registration state of one filter
#[derive(Debug, Clone, Copy)]
struct Note {
    mode: EvFlags,
    enabled: bool,
    udata: u64,
}

impl Note {
    fn from_change(kev: &Kevent) -> Self {
        Note {
            mode: kev.flags & EvFlags::MODE,
            enabled: !kev.flags.contains(EvFlags::DISABLE),
            udata: kev.udata,
        }
    }

    /// Apply one-shot or dispatch after the note fired; true if it changed
    fn consume(slot: &mut Option<Note>) -> bool {
        match slot {
            Some(note) if note.mode.contains(EvFlags::ONESHOT) => {
                *slot = None;
                true
            }
            Some(note) if note.mode.contains(EvFlags::DISPATCH) => {
                note.enabled = false;
                true
            }
            _ => false,
        }
    }
}

/// Read, write and except filters of one watched descriptor
#[derive(Debug, Default)]
struct FdNotes {
    read: Option<Note>,
    write: Option<Note>,
    except: Option<Note>,
    registered: bool,
}

impl FdNotes {
    fn slot(&mut self, filter: Filter) -> &mut Option<Note> {
        match filter {
            Filter::Write => &mut self.write,
            Filter::Except => &mut self.except,
            _ => &mut self.read,
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none() && self.except.is_none()
    }

    /// epoll interest for the enabled notes; edge-triggered only when every
    /// enabled note asked for `CLEAR`
    fn interest(&self) -> u32 {
        let mut mask = 0;
        let mut all_clear = true;
        for (note, bits) in [(self.read, EP_READ), (self.write, EP_WRITE), (self.except, EP_EXCEPT)] {
            if let Some(note) = note.filter(|n| n.enabled) {
                mask |= bits;
                all_clear &= note.mode.contains(EvFlags::CLEAR);
            }
        }
        if mask != 0 && all_clear {
            mask |= EP_ET;
        }
        mask
    }

    fn sync(&mut self, kq: RawFd, fd: RawFd) -> Result<(), i32> {
        let mask = self.interest();
        if mask == 0 {
            if self.registered {
                // The descriptor may already be closed, which removed it.
                let _ = epoll_ctl(kq, libc::EPOLL_CTL_DEL, fd, 0, 0);
                self.registered = false;
            }
            return Ok(());
        }
        let data = token(TAG_FD, fd as usize);
        let op = if self.registered {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        match epoll_ctl(kq, op, fd, mask, data) {
            Err(libc::ENOENT) if self.registered => epoll_ctl(kq, libc::EPOLL_CTL_ADD, fd, mask, data)?,
            res => res?,
        }
        self.registered = true;
        Ok(())
    }
}

/// A user, timer or signal filter backed by its own descriptor
struct AuxNote {
    fd: OwnedFd,
    note: Note,
}

#[derive(Default)]
struct Queue {
    fds: HashMap<RawFd, FdNotes>,
    users: HashMap<usize, AuxNote>,
    timers: HashMap<usize, AuxNote>,
    signals: HashMap<usize, AuxNote>,
    backlog: VecDeque<Kevent>,
}

lazy_static! {
    static ref QUEUES: Mutex<HashMap<RawFd, Arc<Mutex<Queue>>>> = Mutex::new(HashMap::new());
}

fn lookup(kq: RawFd) -> io::Result<Arc<Mutex<Queue>>> {
    QUEUES
        .lock()
        .get(&kq)
        .cloned()
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
}

/// Create a close-on-exec queue
pub fn kqueue() -> io::Result<RawFd> {
    // SAFETY: plain syscall.
    let kq = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if kq < 0 {
        return Err(io::Error::last_os_error());
    }
    QUEUES.lock().insert(kq, Arc::new(Mutex::new(Queue::default())));
    Ok(kq)
}

pub fn close_queue(kq: RawFd) -> io::Result<()> {
    let queue = QUEUES.lock().remove(&kq);
    drop(queue);
    // SAFETY: the caller owns kq.
    if unsafe { libc::close(kq) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn apply_fd(q: &mut Queue, kq: RawFd, kev: &Kevent) -> Result<(), i32> {
    let fd = kev.ident as RawFd;

    if kev.flags.contains(EvFlags::DELETE) {
        let notes = q.fds.get_mut(&fd).ok_or(libc::ENOENT)?;
        if notes.slot(kev.filter).take().is_none() {
            return Err(libc::ENOENT);
        }
        // A closed descriptor has already left the epoll set.
        let _ = notes.sync(kq, fd);
        if notes.is_empty() {
            q.fds.remove(&fd);
        }
        return Ok(());
    }

    if kev.flags.contains(EvFlags::ADD) {
        let notes = q.fds.entry(fd).or_default();
        let previous = notes.slot(kev.filter).replace(Note::from_change(kev));
        if let Err(err) = notes.sync(kq, fd) {
            *notes.slot(kev.filter) = previous;
            if notes.is_empty() {
                q.fds.remove(&fd);
            }
            return Err(err);
        }
        return Ok(());
    }

    if kev.flags.intersects(EvFlags::ENABLE | EvFlags::DISABLE) {
        let notes = q.fds.get_mut(&fd).ok_or(libc::ENOENT)?;
        let note = notes.slot(kev.filter).as_mut().ok_or(libc::ENOENT)?;
        note.enabled = kev.flags.contains(EvFlags::ENABLE);
        notes.sync(kq, fd)?;
    }
    Ok(())
}

fn new_aux(
    kq: RawFd,
    raw: libc::c_int,
    interest: u32,
    tag: u8,
    ident: usize,
    kev: &Kevent,
) -> Result<AuxNote, i32> {
    if raw < 0 {
        return Err(errno());
    }
    // SAFETY: raw was just returned by the kernel and is owned here.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    epoll_ctl(kq, libc::EPOLL_CTL_ADD, fd.as_raw_fd(), interest, token(tag, ident))?;
    Ok(AuxNote {
        fd,
        note: Note::from_change(kev),
    })
}

fn set_aux_enabled(kq: RawFd, aux: &mut AuxNote, interest: u32, tag: u8, ident: usize, enabled: bool) -> Result<(), i32> {
    aux.note.enabled = enabled;
    let events = if enabled { interest } else { 0 };
    epoll_ctl(kq, libc::EPOLL_CTL_MOD, aux.fd.as_raw_fd(), events, token(tag, ident))
}

fn apply_user(q: &mut Queue, kq: RawFd, kev: &Kevent) -> Result<(), i32> {
    let ident = kev.ident;
    if kev.flags.contains(EvFlags::DELETE) {
        return q.users.remove(&ident).map(drop).ok_or(libc::ENOENT);
    }
    if kev.flags.contains(EvFlags::ADD) {
        match q.users.get_mut(&ident) {
            Some(aux) => aux.note = Note::from_change(kev),
            None => {
                // SAFETY: plain syscall.
                let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
                let aux = new_aux(kq, raw, libc::EPOLLIN as u32, TAG_USER, ident, kev)?;
                q.users.insert(ident, aux);
            }
        }
    }
    let aux = q.users.get_mut(&ident).ok_or(libc::ENOENT)?;
    if kev.flags.intersects(EvFlags::ENABLE | EvFlags::DISABLE) {
        let enabled = kev.flags.contains(EvFlags::ENABLE);
        set_aux_enabled(kq, aux, libc::EPOLLIN as u32, TAG_USER, ident, enabled)?;
    }
    if kev.fflags & NOTE_TRIGGER != 0 {
        match super::write(aux.fd.as_raw_fd(), &1u64.to_ne_bytes()) {
            Ok(_) => {}
            // Counter saturated: already triggered.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }
    Ok(())
}

fn arm_timerfd(fd: RawFd, nanos: i64, periodic: bool) -> Result<(), i32> {
    let period = Duration::from_nanos(nanos.max(1) as u64);
    let value = libc::timespec {
        tv_sec: period.as_secs() as libc::time_t,
        tv_nsec: period.subsec_nanos() as _,
    };
    let zero = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    let spec = libc::itimerspec {
        it_interval: if periodic { value } else { zero },
        it_value: value,
    };
    // SAFETY: spec is valid; the old value is not requested.
    if unsafe { libc::timerfd_settime(fd, 0, &spec, core::ptr::null_mut()) } < 0 {
        return Err(errno());
    }
    Ok(())
}

fn apply_timer(q: &mut Queue, kq: RawFd, kev: &Kevent) -> Result<(), i32> {
    let ident = kev.ident;
    if kev.flags.contains(EvFlags::DELETE) {
        return q.timers.remove(&ident).map(drop).ok_or(libc::ENOENT);
    }
    if kev.flags.contains(EvFlags::ADD) {
        if !q.timers.contains_key(&ident) {
            // SAFETY: plain syscall.
            let raw = unsafe {
                libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
            };
            let aux = new_aux(kq, raw, libc::EPOLLIN as u32, TAG_TIMER, ident, kev)?;
            q.timers.insert(ident, aux);
        }
        let aux = q.timers.get_mut(&ident).ok_or(libc::ENOENT)?;
        aux.note = Note::from_change(kev);
        arm_timerfd(aux.fd.as_raw_fd(), kev.data, !kev.flags.contains(EvFlags::ONESHOT))?;
    }
    if kev.flags.intersects(EvFlags::ENABLE | EvFlags::DISABLE) {
        let aux = q.timers.get_mut(&ident).ok_or(libc::ENOENT)?;
        let enabled = kev.flags.contains(EvFlags::ENABLE);
        set_aux_enabled(kq, aux, libc::EPOLLIN as u32, TAG_TIMER, ident, enabled)?;
    }
    Ok(())
}

fn apply_signal(q: &mut Queue, kq: RawFd, kev: &Kevent) -> Result<(), i32> {
    let ident = kev.ident;
    let interest = (libc::EPOLLIN | libc::EPOLLET) as u32;
    if kev.flags.contains(EvFlags::DELETE) {
        return q.signals.remove(&ident).map(drop).ok_or(libc::ENOENT);
    }
    if kev.flags.contains(EvFlags::ADD) {
        match q.signals.get_mut(&ident) {
            Some(aux) => aux.note = Note::from_change(kev),
            None => {
                // SAFETY: set is initialized by sigemptyset before use.
                let raw = unsafe {
                    let mut set: libc::sigset_t = core::mem::zeroed();
                    libc::sigemptyset(&mut set);
                    if libc::sigaddset(&mut set, ident as libc::c_int) < 0 {
                        return Err(libc::EINVAL);
                    }
                    libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC)
                };
                let aux = new_aux(kq, raw, interest, TAG_SIGNAL, ident, kev)?;
                q.signals.insert(ident, aux);
            }
        }
    }
    if kev.flags.intersects(EvFlags::ENABLE | EvFlags::DISABLE) {
        let aux = q.signals.get_mut(&ident).ok_or(libc::ENOENT)?;
        let enabled = kev.flags.contains(EvFlags::ENABLE);
        set_aux_enabled(kq, aux, interest, TAG_SIGNAL, ident, enabled)?;
    }
    Ok(())
}

fn apply_change(q: &mut Queue, kq: RawFd, kev: &Kevent) -> Result<(), i32> {
    match kev.filter {
        Filter::Read | Filter::Write | Filter::Except => apply_fd(q, kq, kev),
        Filter::User => apply_user(q, kq, kev),
        Filter::Timer => apply_timer(q, kq, kev),
        Filter::Signal => apply_signal(q, kq, kev),
    }
}

fn translate_fd(q: &mut Queue, kq: RawFd, fd: RawFd, bits: u32, out: &mut Vec<Kevent>) {
    let Some(notes) = q.fds.get_mut(&fd) else {
        return;
    };
    let ident = fd as usize;
    let mut changed = false;

    if let Some(note) = notes.read.filter(|n| n.enabled) {
        if bits & (EP_READ | EP_HUP | EP_ERR) != 0 {
            let mut kev = Kevent::new(ident, Filter::Read, EvFlags::empty()).with_data(fionread(fd));
            if bits & (libc::EPOLLRDHUP as u32 | EP_HUP) != 0 {
                kev.flags |= EvFlags::EOF;
            }
            kev.udata = note.udata;
            out.push(kev);
            changed |= Note::consume(&mut notes.read);
        }
    }
    if let Some(note) = notes.write.filter(|n| n.enabled) {
        if bits & (EP_WRITE | EP_HUP | EP_ERR) != 0 {
            let mut kev = Kevent::new(ident, Filter::Write, EvFlags::empty());
            if bits & (EP_HUP | EP_ERR) != 0 {
                kev.flags |= EvFlags::EOF;
            }
            kev.udata = note.udata;
            out.push(kev);
            changed |= Note::consume(&mut notes.write);
        }
    }
    if let Some(note) = notes.except.filter(|n| n.enabled) {
        if bits & EP_EXCEPT != 0 {
            let mut kev = Kevent::new(ident, Filter::Except, EvFlags::empty());
            kev.udata = note.udata;
            out.push(kev);
            changed |= Note::consume(&mut notes.except);
        }
    }

    if changed {
        let _ = notes.sync(kq, fd);
        if notes.is_empty() {
            q.fds.remove(&fd);
        }
    }
}

fn finish_aux(
    map: &mut HashMap<usize, AuxNote>,
    kq: RawFd,
    ident: usize,
    interest: u32,
    tag: u8,
) {
    let Some(aux) = map.get_mut(&ident) else {
        return;
    };
    if aux.note.mode.contains(EvFlags::ONESHOT) {
        map.remove(&ident);
    } else if aux.note.mode.contains(EvFlags::DISPATCH) {
        let _ = set_aux_enabled(kq, aux, interest, tag, ident, false);
    }
}

fn translate(q: &mut Queue, kq: RawFd, data: u64, bits: u32, out: &mut Vec<Kevent>) {
    let (tag, ident) = split_token(data);
    match tag {
        TAG_FD => translate_fd(q, kq, ident as RawFd, bits, out),
        TAG_USER => {
            let Some(aux) = q.users.get(&ident).filter(|a| a.note.enabled) else {
                return;
            };
            let mut kev = Kevent::new(ident, Filter::User, EvFlags::empty());
            kev.udata = aux.note.udata;
            if aux.note.mode.contains(EvFlags::CLEAR) {
                let mut buf = [0u8; 8];
                let _ = super::read(aux.fd.as_raw_fd(), &mut buf);
            }
            out.push(kev);
            finish_aux(&mut q.users, kq, ident, libc::EPOLLIN as u32, TAG_USER);
        }
        TAG_TIMER => {
            let Some(aux) = q.timers.get(&ident).filter(|a| a.note.enabled) else {
                return;
            };
            let mut buf = [0u8; 8];
            if super::read(aux.fd.as_raw_fd(), &mut buf).is_err() {
                return;
            }
            let mut kev = Kevent::new(ident, Filter::Timer, EvFlags::empty())
                .with_data(u64::from_ne_bytes(buf).min(i64::MAX as u64) as i64);
            kev.udata = aux.note.udata;
            out.push(kev);
            finish_aux(&mut q.timers, kq, ident, libc::EPOLLIN as u32, TAG_TIMER);
        }
        TAG_SIGNAL => {
            let Some(aux) = q.signals.get(&ident).filter(|a| a.note.enabled) else {
                return;
            };
            let mut kev = Kevent::new(ident, Filter::Signal, EvFlags::empty()).with_data(1);
            kev.udata = aux.note.udata;
            out.push(kev);
            finish_aux(&mut q.signals, kq, ident, (libc::EPOLLIN | libc::EPOLLET) as u32, TAG_SIGNAL);
        }
        _ => {}
    }
}

fn collect(q: &mut Queue, kq: RawFd, events: &mut [Kevent]) -> io::Result<usize> {
    let mut n = 0;
    while n < events.len() {
        match q.backlog.pop_front() {
            Some(kev) => {
                events[n] = kev;
                n += 1;
            }
            None => break,
        }
    }
    if n == events.len() {
        return Ok(n);
    }

    let mut raw = vec![libc::epoll_event { events: 0, u64: 0 }; events.len() - n];
    // SAFETY: raw holds raw.len() writable records.
    let got = unsafe { libc::epoll_wait(kq, raw.as_mut_ptr(), raw.len() as libc::c_int, 0) };
    if got < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fresh = Vec::with_capacity(got as usize);
    for ev in &raw[..got as usize] {
        let (data, bits) = (ev.u64, ev.events);
        translate(q, kq, data, bits, &mut fresh);
    }
    for kev in fresh {
        if n < events.len() {
            events[n] = kev;
            n += 1;
        } else {
            q.backlog.push_back(kev);
        }
    }
    Ok(n)
}

/// Apply `changes` and fetch up to `events.len()` events
pub fn kevent(
    kq: RawFd,
    changes: &[Kevent],
    events: &mut [Kevent],
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let queue = lookup(kq)?;
    {
        let mut q = queue.lock();
        for kev in changes {
            apply_change(&mut q, kq, kev).map_err(io::Error::from_raw_os_error)?;
        }
    }
    if events.is_empty() {
        return Ok(0);
    }

    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    loop {
        let n = collect(&mut queue.lock(), kq, events)?;
        if n > 0 {
            return Ok(n);
        }
        let remaining = match (timeout, deadline) {
            (Some(_), Some(deadline)) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(0);
                }
                Some(deadline - now)
            }
            _ => None,
        };
        super::wait_readable(kq, remaining)?;
    }
}

/// Apply each change in receipt mode, writing its errno back into `data`
/// with `ERROR` set; `data == 0` marks success
pub fn kevent_receipt(kq: RawFd, changes: &mut [Kevent]) -> io::Result<()> {
    let queue = lookup(kq)?;
    let mut q = queue.lock();
    for kev in changes.iter_mut() {
        let res = apply_change(&mut q, kq, kev);
        kev.flags |= EvFlags::ERROR;
        kev.data = match res {
            Ok(()) => 0,
            Err(errno) => errno as i64,
        };
    }
    Ok(())
}
