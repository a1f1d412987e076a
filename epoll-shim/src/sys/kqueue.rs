//! kqueue(2) backend

use core::time::Duration;
use std::io;
use std::os::fd::RawFd;

use super::{EvFlags, Filter, Kevent, NOTE_TRIGGER};

#[cfg(target_os = "freebsd")]
const EVFILT_EXCEPT: i16 = -15;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const EVFILT_EXCEPT: i16 = -15;

/// Out-of-band data note for `EVFILT_EXCEPT`
const NOTE_OOB: u32 = 0x0002;

const FLAG_MAP: [(EvFlags, u16); 10] = [
    (EvFlags::ADD, libc::EV_ADD as u16),
    (EvFlags::DELETE, libc::EV_DELETE as u16),
    (EvFlags::ENABLE, libc::EV_ENABLE as u16),
    (EvFlags::DISABLE, libc::EV_DISABLE as u16),
    (EvFlags::ONESHOT, libc::EV_ONESHOT as u16),
    (EvFlags::CLEAR, libc::EV_CLEAR as u16),
    (EvFlags::RECEIPT, libc::EV_RECEIPT as u16),
    (EvFlags::DISPATCH, libc::EV_DISPATCH as u16),
    (EvFlags::ERROR, libc::EV_ERROR as u16),
    (EvFlags::EOF, libc::EV_EOF as u16),
];

fn raw_filter(filter: Filter) -> i16 {
    match filter {
        Filter::Read => libc::EVFILT_READ as i16,
        Filter::Write => libc::EVFILT_WRITE as i16,
        Filter::Except => EVFILT_EXCEPT,
        Filter::User => libc::EVFILT_USER as i16,
        Filter::Timer => libc::EVFILT_TIMER as i16,
        Filter::Signal => libc::EVFILT_SIGNAL as i16,
    }
}

fn filter_from_raw(raw: i16) -> Option<Filter> {
    [
        Filter::Read,
        Filter::Write,
        Filter::Except,
        Filter::User,
        Filter::Timer,
        Filter::Signal,
    ]
    .into_iter()
    .find(|f| raw_filter(*f) == raw)
}

fn raw_flags(flags: EvFlags) -> u16 {
    FLAG_MAP
        .iter()
        .filter(|(ours, _)| flags.contains(*ours))
        .fold(0, |acc, (_, raw)| acc | raw)
}

fn flags_from_raw(raw: u16) -> EvFlags {
    FLAG_MAP
        .iter()
        .filter(|(_, bit)| raw & bit != 0)
        .fold(EvFlags::empty(), |acc, (ours, _)| acc | *ours)
}

/// Timer data is always nanoseconds on our side
fn raw_fflags(kev: &Kevent) -> u32 {
    match kev.filter {
        Filter::User if kev.fflags & NOTE_TRIGGER != 0 => libc::NOTE_TRIGGER,
        Filter::User => 0,
        Filter::Timer => libc::NOTE_NSECONDS,
        Filter::Except => NOTE_OOB,
        _ => kev.fflags,
    }
}

fn to_raw(kev: &Kevent) -> libc::kevent {
    // SAFETY: kevent is plain old data; all-zero is a valid value.
    let mut raw: libc::kevent = unsafe { core::mem::zeroed() };
    raw.ident = kev.ident as _;
    raw.filter = raw_filter(kev.filter) as _;
    raw.flags = raw_flags(kev.flags) as _;
    raw.fflags = raw_fflags(kev) as _;
    raw.data = kev.data as _;
    raw.udata = kev.udata as usize as _;
    raw
}

fn from_raw(raw: &libc::kevent) -> Option<Kevent> {
    let filter = filter_from_raw(raw.filter as i16)?;
    Some(Kevent {
        ident: raw.ident as usize,
        filter,
        flags: flags_from_raw(raw.flags as u16),
        fflags: raw.fflags as u32,
        data: raw.data as i64,
        udata: raw.udata as usize as u64,
    })
}

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as _,
    }
}

/// Create a close-on-exec queue
pub fn kqueue() -> io::Result<RawFd> {
    // SAFETY: no arguments.
    let kq = unsafe { libc::kqueue() };
    if kq < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Err(err) = super::set_cloexec(kq, true) {
        // SAFETY: kq was created above and is not shared yet.
        unsafe { libc::close(kq) };
        return Err(err);
    }
    Ok(kq)
}

pub fn close_queue(kq: RawFd) -> io::Result<()> {
    // SAFETY: the caller owns kq.
    if unsafe { libc::close(kq) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Apply `changes` and fetch up to `events.len()` events
pub fn kevent(
    kq: RawFd,
    changes: &[Kevent],
    events: &mut [Kevent],
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let raw_changes: Vec<libc::kevent> = changes.iter().map(to_raw).collect();
    // SAFETY: all-zero kevent records are valid output slots.
    let mut raw_events: Vec<libc::kevent> = vec![unsafe { core::mem::zeroed() }; events.len()];
    let ts = timeout.map(timespec);
    let ts_ptr = ts.as_ref().map_or(core::ptr::null(), |ts| ts as *const libc::timespec);

    // SAFETY: every pointer refers to a live buffer of the stated length.
    let n = unsafe {
        libc::kevent(
            kq,
            raw_changes.as_ptr(),
            raw_changes.len() as _,
            raw_events.as_mut_ptr(),
            raw_events.len() as _,
            ts_ptr,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut count = 0;
    for raw in &raw_events[..n as usize] {
        if let Some(kev) = from_raw(raw) {
            events[count] = kev;
            count += 1;
        }
    }
    Ok(count)
}

/// Apply each change in receipt mode, writing its errno back into `data`
/// with `ERROR` set; `data == 0` marks success
pub fn kevent_receipt(kq: RawFd, changes: &mut [Kevent]) -> io::Result<()> {
    if changes.is_empty() {
        return Ok(());
    }
    let mut raw: Vec<libc::kevent> = changes
        .iter()
        .map(|kev| {
            let mut raw = to_raw(kev);
            raw.flags |= libc::EV_RECEIPT as u16 as _;
            raw
        })
        .collect();
    let ts = timespec(Duration::ZERO);
    let ptr = raw.as_mut_ptr();

    // SAFETY: the change list doubles as the receipt list, as kevent(2) allows.
    let n = unsafe { libc::kevent(kq, ptr, raw.len() as _, ptr, raw.len() as _, &ts) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    for kev in changes.iter_mut() {
        kev.flags |= EvFlags::ERROR;
        kev.data = 0;
    }
    for receipt in &raw[..n as usize] {
        let ident = receipt.ident as usize;
        let filter = filter_from_raw(receipt.filter as i16);
        if let Some(kev) = changes
            .iter_mut()
            .find(|kev| kev.ident == ident && Some(kev.filter) == filter && kev.data == 0)
        {
            kev.data = receipt.data as i64;
        }
    }
    Ok(())
}
