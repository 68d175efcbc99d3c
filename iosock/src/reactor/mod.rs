//! OS readiness multiplexing.
//!
//! [`Reactor`] is the small contract the dispatcher needs from epoll or
//! kqueue: register a descriptor under a `u64` key with an [`Interest`],
//! change or drop it, wait for [`Readiness`] and wake a blocked waiter.
//!
//! Registrations are edge-triggered. A readiness edge is reported once; the
//! consumer drains the descriptor until `EWOULDBLOCK` before waiting again.

#[cfg(epoll)]
mod epoll;
#[cfg(kqueue)]
mod kqueue;
#[cfg(epoll)]
mod notifier;
mod util;

#[cfg(test)]
pub(crate) mod tests;

#[cfg(epoll)]
pub use epoll::OsReactor;
#[cfg(kqueue)]
pub use kqueue::OsReactor;

#[cfg(not(any(epoll, kqueue)))]
compile_error!("iosock supports epoll (Linux, Android) and kqueue (BSD, macOS) targets only");

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Key reserved for the internal wakeup; never reported to callers.
pub const NOTIFY_KEY: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
  Read,
  Write,
  ReadAndWrite,
}

impl Interest {
  pub fn is_readable(&self) -> bool {
    matches!(self, Self::Read | Self::ReadAndWrite)
  }

  pub fn is_writable(&self) -> bool {
    matches!(self, Self::Write | Self::ReadAndWrite)
  }
}

/// What the OS reported for one registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
  pub readable: bool,
  pub writable: bool,
  pub error: bool,
  /// Peer closed its side (or both sides are gone).
  pub hangup: bool,
}

pub trait Reactor: Send + Sync + Sized {
  type NativeEvent: Copy + Send;

  fn new() -> io::Result<Self>;

  /// Registers `fd`. Fails with `EEXIST` when it already is.
  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()>;

  /// Replaces the interest of a registered `fd`.
  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()>;

  /// Unregisters `fd`.
  fn delete(&self, fd: RawFd) -> io::Result<()>;

  /// Blocks until events arrive, `timeout` elapses or [`notify`](Self::notify)
  /// is called. Returns how many entries of `events` were filled.
  fn wait(&self, events: &mut [Self::NativeEvent], timeout: Option<Duration>) -> io::Result<usize>;

  fn notify(&self) -> io::Result<()>;

  fn event_key(event: &Self::NativeEvent) -> u64;

  fn event_readiness(event: &Self::NativeEvent) -> Readiness;
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
  pub key: u64,
  pub readiness: Readiness,
}

/// Reusable buffer of native events.
pub struct Events {
  events: Vec<<OsReactor as Reactor>::NativeEvent>,
  len: usize,
}

// SAFETY: kevent carries `udata` as a raw pointer that only ever holds a key
// and is never dereferenced.
unsafe impl Send for Events {}

impl Events {
  pub fn with_capacity(capacity: usize) -> Self {
    // SAFETY: epoll_event and kevent are plain C structs, zero is valid.
    Self { events: vec![unsafe { std::mem::zeroed() }; capacity.max(1)], len: 0 }
  }

  pub fn wait(&mut self, reactor: &OsReactor, timeout: Option<Duration>) -> io::Result<usize> {
    self.len = 0;
    self.len = reactor.wait(&mut self.events, timeout)?;
    Ok(self.len)
  }

  pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
    self.events[..self.len]
      .iter()
      .filter(|native| OsReactor::event_key(native) != NOTIFY_KEY)
      .map(|native| Event {
        key: OsReactor::event_key(native),
        readiness: OsReactor::event_readiness(native),
      })
  }
}
