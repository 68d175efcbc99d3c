//! Wakeup for a thread blocked in `epoll_wait`, built on a non-blocking pipe.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub struct Notifier {
  read_fd: OwnedFd,
  write_fd: OwnedFd,
}

impl Notifier {
  pub fn new() -> io::Result<Self> {
    let mut fds = [0i32; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;

    // SAFETY: pipe2 just returned two fresh descriptors we now own.
    Ok(Self {
      read_fd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
      write_fd: unsafe { OwnedFd::from_raw_fd(fds[1]) },
    })
  }

  /// Descriptor to register for read readiness.
  pub fn read_fd(&self) -> RawFd {
    self.read_fd.as_raw_fd()
  }

  pub fn notify(&self) -> io::Result<()> {
    let byte: u8 = 1;
    match syscall!(write(
      self.write_fd.as_raw_fd(),
      &byte as *const u8 as *const libc::c_void,
      1,
    )) {
      // A full pipe already guarantees a pending wakeup.
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      other => other.map(|_| ()),
    }
  }

  /// Empties the pipe so the next `notify` produces a new wakeup.
  pub fn drain(&self) {
    let mut sink = [0u8; 64];
    while let Ok(read) = syscall!(read(
      self.read_fd.as_raw_fd(),
      sink.as_mut_ptr() as *mut libc::c_void,
      sink.len(),
    )) {
      if read <= 0 {
        break;
      }
    }
  }
}
