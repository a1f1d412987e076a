//! Wake signals carried by a queue
//!
//! A multiplexer uses [`Wake`] to kick threads out of the fallback `ppoll`
//! when its fallback list is about to change. The counter, timer and signal
//! descriptors use the queue-backed form to publish their readiness: the
//! queue stays readable for exactly as long as the wake is triggered.
//!
//! [`Pulse`] is the one-off variant: it makes the queue readable until the
//! next fetch, which is how a multiplexer tells whoever watches its queue
//! that the set of descriptors to block on has changed.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::sys::{self, EvFlags, Filter, Kevent, NOTE_TRIGGER};

/// Identifier of the wake's user event inside its queue
pub const WAKE_IDENT: usize = 0;

/// Identifier of a multiplexer's list-change pulse
pub const PULSE_IDENT: usize = WAKE_IDENT + 1;

enum WakeInner {
    /// User event on the owner's queue
    Queue(RawFd),
    /// Private pipe polled next to the queue
    Pipe { reader: OwnedFd, writer: OwnedFd },
}

pub struct Wake {
    inner: WakeInner,
    is_triggered: bool,
}

impl Wake {
    /// User event on `kq`, falling back to a pipe if the queue refuses it
    pub fn new(kq: RawFd) -> io::Result<Self> {
        match Self::on_queue(kq) {
            Ok(wake) => Ok(wake),
            Err(err) => {
                shim_debug!("kq {}: user events unavailable ({}), using a wake pipe", kq, err);
                let (reader, writer) = sys::pipe()?;
                Ok(Wake {
                    inner: WakeInner::Pipe { reader, writer },
                    is_triggered: false,
                })
            }
        }
    }

    /// User event on `kq`, with no fallback
    pub fn on_queue(kq: RawFd) -> io::Result<Self> {
        let mut add = [Kevent::new(WAKE_IDENT, Filter::User, EvFlags::ADD)];
        sys::kevent_receipt(kq, &mut add)?;
        if let Some(errno) = add[0].error() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(Wake {
            inner: WakeInner::Queue(kq),
            is_triggered: false,
        })
    }

    pub fn is_triggered(&self) -> bool {
        self.is_triggered
    }

    pub fn trigger(&mut self) -> io::Result<()> {
        if self.is_triggered {
            return Ok(());
        }
        self.fire()?;
        self.is_triggered = true;
        Ok(())
    }

    /// Trigger again even if already triggered, so that edge observers of
    /// the queue see a fresh activation
    pub fn retrigger(&mut self) -> io::Result<()> {
        if self.is_triggered {
            self.reset()?;
        }
        self.fire()?;
        self.is_triggered = true;
        Ok(())
    }

    pub fn clear(&mut self) -> io::Result<()> {
        if !self.is_triggered {
            return Ok(());
        }
        self.reset()?;
        self.is_triggered = false;
        Ok(())
    }

    fn fire(&self) -> io::Result<()> {
        match &self.inner {
            WakeInner::Queue(kq) => sys::apply(
                *kq,
                &[Kevent::new(WAKE_IDENT, Filter::User, EvFlags::empty()).with_fflags(NOTE_TRIGGER)],
            ),
            WakeInner::Pipe { writer, .. } => match sys::write(writer.as_raw_fd(), &[1]) {
                Ok(_) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(err) => Err(err),
            },
        }
    }

    /// Untrigger: a user event without clear mode stays active until it is
    /// deleted, so delete and re-add it
    fn reset(&self) -> io::Result<()> {
        match &self.inner {
            WakeInner::Queue(kq) => {
                let mut changes = [
                    Kevent::new(WAKE_IDENT, Filter::User, EvFlags::DELETE),
                    Kevent::new(WAKE_IDENT, Filter::User, EvFlags::ADD),
                ];
                sys::kevent_receipt(*kq, &mut changes)?;
                match changes[1].error() {
                    Some(errno) => Err(io::Error::from_raw_os_error(errno)),
                    None => Ok(()),
                }
            }
            WakeInner::Pipe { reader, .. } => {
                let mut buf = [0u8; 64];
                loop {
                    match sys::read(reader.as_raw_fd(), &mut buf) {
                        Ok(0) => return Ok(()),
                        Ok(_) => continue,
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// Extra descriptor a blocked poller must include, if any
    pub fn poll_fd(&self) -> Option<RawFd> {
        match &self.inner {
            WakeInner::Queue(_) => None,
            WakeInner::Pipe { reader, .. } => Some(reader.as_raw_fd()),
        }
    }
}

/// User event in clear mode: each `fire` is seen by one fetch
pub struct Pulse {
    kq: RawFd,
}

impl Pulse {
    pub fn on_queue(kq: RawFd) -> io::Result<Self> {
        let mut add = [Kevent::new(PULSE_IDENT, Filter::User, EvFlags::ADD | EvFlags::CLEAR)];
        sys::kevent_receipt(kq, &mut add)?;
        if let Some(errno) = add[0].error() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(Pulse { kq })
    }

    pub fn fire(&self) -> io::Result<()> {
        sys::apply(
            self.kq,
            &[Kevent::new(PULSE_IDENT, Filter::User, EvFlags::empty()).with_fflags(NOTE_TRIGGER)],
        )
    }
}
