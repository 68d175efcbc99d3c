use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use super::notifier::Notifier;
use super::{Interest, NOTIFY_KEY, Reactor, Readiness, util};

pub struct OsReactor {
  epoll_fd: OwnedFd,
  notifier: Notifier,
}

impl OsReactor {
  fn ctl(&self, op: libc::c_int, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    let mut event = libc::epoll_event { events: flags(interest), u64: key };
    syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event as *mut libc::epoll_event))?;
    Ok(())
  }
}

fn flags(interest: Interest) -> u32 {
  let mut events = libc::EPOLLET as u32;
  if interest.is_readable() {
    events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
  }
  if interest.is_writable() {
    events |= libc::EPOLLOUT as u32;
  }
  events
}

impl Reactor for OsReactor {
  type NativeEvent = libc::epoll_event;

  fn new() -> io::Result<Self> {
    // SAFETY: epoll_create1 returned a descriptor nobody else owns.
    let epoll_fd = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
    let reactor = Self { epoll_fd, notifier: Notifier::new()? };

    // Level-triggered on purpose: the pipe is drained after every wakeup.
    let mut event = libc::epoll_event { events: libc::EPOLLIN as u32, u64: NOTIFY_KEY };
    syscall!(epoll_ctl(
      reactor.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      reactor.notifier.read_fd(),
      &mut event as *mut libc::epoll_event,
    ))?;

    Ok(reactor)
  }

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_ADD, fd, key, interest)
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_MOD, fd, key, interest)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    match syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, ptr::null_mut())) {
      Ok(_) => Ok(()),
      Err(err) if err.raw_os_error() == Some(libc::EBADF) => {
        Err(io::Error::from_raw_os_error(libc::ENOENT))
      }
      Err(err) => Err(err),
    }
  }

  fn wait(&self, events: &mut [Self::NativeEvent], timeout: Option<Duration>) -> io::Result<usize> {
    let count = syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      events.as_mut_ptr(),
      events.len().min(i32::MAX as usize) as i32,
      util::timeout_to_millis(timeout),
    ))? as usize;

    if events[..count].iter().any(|event| Self::event_key(event) == NOTIFY_KEY) {
      self.notifier.drain();
    }
    Ok(count)
  }

  fn notify(&self) -> io::Result<()> {
    self.notifier.notify()
  }

  fn event_key(event: &Self::NativeEvent) -> u64 {
    event.u64
  }

  fn event_readiness(event: &Self::NativeEvent) -> Readiness {
    let events = event.events;
    Readiness {
      readable: events & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0,
      writable: events & libc::EPOLLOUT as u32 != 0,
      error: events & libc::EPOLLERR as u32 != 0,
      hangup: events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
    }
  }
}
