use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use super::{Interest, NOTIFY_KEY, Reactor, Readiness, util};

/// Identifier of the EVFILT_USER event used for wakeups.
const NOTIFY_IDENT: usize = NOTIFY_KEY as usize;

pub struct OsReactor {
  kq_fd: OwnedFd,
}

fn change(ident: usize, filter: i16, flags: u16, key: u64) -> libc::kevent {
  // SAFETY: kevent is a plain C struct; fields not set below stay zero.
  let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
  kev.ident = ident as _;
  kev.filter = filter as _;
  kev.flags = flags as _;
  kev.udata = key as usize as _;
  kev
}

impl OsReactor {
  fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
    if changes.is_empty() {
      return Ok(());
    }
    syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      changes.as_ptr(),
      changes.len() as _,
      ptr::null_mut(),
      0,
      ptr::null(),
    ))?;
    Ok(())
  }

  fn remove_filter(&self, fd: RawFd, filter: i16) -> io::Result<()> {
    match self.apply(&[change(fd as usize, filter, libc::EV_DELETE as u16, 0)]) {
      Err(err) if !util::is_not_found_error(&err) => Err(err),
      _ => Ok(()),
    }
  }

  fn register(&self, fd: RawFd, key: u64, interest: Interest, modify: bool) -> io::Result<()> {
    let flags = (libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR) as u16;
    let mut changes = Vec::with_capacity(2);
    if interest.is_readable() {
      changes.push(change(fd as usize, libc::EVFILT_READ as i16, flags, key));
    }
    if interest.is_writable() {
      changes.push(change(fd as usize, libc::EVFILT_WRITE as i16, flags, key));
    }
    self.apply(&changes)?;

    if modify {
      if !interest.is_readable() {
        self.remove_filter(fd, libc::EVFILT_READ as i16)?;
      }
      if !interest.is_writable() {
        self.remove_filter(fd, libc::EVFILT_WRITE as i16)?;
      }
    }
    Ok(())
  }
}

impl Reactor for OsReactor {
  type NativeEvent = libc::kevent;

  fn new() -> io::Result<Self> {
    // SAFETY: kqueue returned a descriptor nobody else owns.
    let kq_fd = unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) };
    syscall!(fcntl(kq_fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
    let reactor = Self { kq_fd };

    let flags = (libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR) as u16;
    reactor.apply(&[change(NOTIFY_IDENT, libc::EVFILT_USER as i16, flags, NOTIFY_KEY)])?;
    Ok(reactor)
  }

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.register(fd, key, interest, false)
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.register(fd, key, interest, true)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    let read = self.remove_filter(fd, libc::EVFILT_READ as i16);
    let write = self.remove_filter(fd, libc::EVFILT_WRITE as i16);
    read.and(write)
  }

  fn wait(&self, events: &mut [Self::NativeEvent], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout = util::timeout_to_timespec(timeout);
    let timeout_ptr = timeout.as_ref().map_or(ptr::null(), |ts| ts as *const libc::timespec);

    let count = syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      ptr::null(),
      0,
      events.as_mut_ptr(),
      events.len().min(i32::MAX as usize) as _,
      timeout_ptr,
    ))?;
    Ok(count as usize)
  }

  fn notify(&self) -> io::Result<()> {
    let mut kev = change(NOTIFY_IDENT, libc::EVFILT_USER as i16, 0, NOTIFY_KEY);
    kev.fflags = libc::NOTE_TRIGGER as _;
    self.apply(&[kev])
  }

  fn event_key(event: &Self::NativeEvent) -> u64 {
    event.udata as usize as u64
  }

  fn event_readiness(event: &Self::NativeEvent) -> Readiness {
    let filter = event.filter as i16;
    let flags = event.flags as u16;
    let eof = flags & libc::EV_EOF as u16 != 0;
    Readiness {
      readable: filter == libc::EVFILT_READ as i16,
      writable: filter == libc::EVFILT_WRITE as i16,
      // With EV_EOF, `fflags` carries the pending socket error if any.
      error: flags & libc::EV_ERROR as u16 != 0 || (eof && event.fflags != 0),
      hangup: eof,
    }
  }
}
