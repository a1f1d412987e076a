//! epoll-shim API
//!
//! Linux ABI surface shared by the shim: the `epoll_event` record and its
//! flag bits, the flag values accepted by `eventfd`, `timerfd` and
//! `signalfd`, the records those descriptors produce, and the error type
//! every shim operation returns.
//!
//! Nothing in this crate touches the host kernel; it only fixes layouts and
//! values so the engine and its C exports agree on them.

pub mod epoll;
pub mod error;
pub mod flags;
pub mod types;

pub use epoll::{EpollEvent, EpollFlags, EpollOp, EPOLL_CLOEXEC};
pub use error::{Result, SyscallError};
pub use types::{Itimerspec, SignalfdSiginfo, TimerSpec};
