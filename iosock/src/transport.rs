//! The byte-moving capability a [`Socket`](crate::Socket) delegates to.
//!
//! [`Plain`] talks to the kernel directly. A secure or instrumented variant
//! implements [`Transport`] and is injected with
//! [`Socket::with_transport`](crate::Socket::with_transport); the socket keeps
//! its queueing, congestion and rate accounting either way.

use std::io;
use std::mem::MaybeUninit;

use socket2::{SockAddr, Socket};

pub trait Transport: Send + Sync + 'static {
  fn send(&self, socket: &Socket, data: &[u8], flags: i32) -> io::Result<usize>;

  fn send_to(
    &self,
    socket: &Socket,
    data: &[u8],
    address: &SockAddr,
    flags: i32,
  ) -> io::Result<usize>;

  fn recv(&self, socket: &Socket, buffer: &mut [u8], flags: i32) -> io::Result<usize>;

  /// Receives and reports the sender, when the OS provides one.
  fn recv_from(
    &self,
    socket: &Socket,
    buffer: &mut [u8],
    flags: i32,
  ) -> io::Result<(usize, Option<SockAddr>)>;

  fn is_secure(&self) -> bool {
    false
  }
}

/// Unencrypted transport, straight to the socket syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct Plain;

#[cfg(linux)]
const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL;
#[cfg(not(linux))]
const SEND_FLAGS: i32 = 0;

impl Transport for Plain {
  fn send(&self, socket: &Socket, data: &[u8], flags: i32) -> io::Result<usize> {
    socket.send_with_flags(data, flags | SEND_FLAGS)
  }

  fn send_to(
    &self,
    socket: &Socket,
    data: &[u8],
    address: &SockAddr,
    flags: i32,
  ) -> io::Result<usize> {
    socket.send_to_with_flags(data, address, flags | SEND_FLAGS)
  }

  fn recv(&self, socket: &Socket, buffer: &mut [u8], flags: i32) -> io::Result<usize> {
    socket.recv_with_flags(uninit(buffer), flags)
  }

  fn recv_from(
    &self,
    socket: &Socket,
    buffer: &mut [u8],
    flags: i32,
  ) -> io::Result<(usize, Option<SockAddr>)> {
    socket
      .recv_from_with_flags(uninit(buffer), flags)
      .map(|(read, address)| (read, Some(address)))
  }
}

/// Views an initialized buffer the way `socket2` wants receive buffers.
pub(crate) fn uninit(buffer: &mut [u8]) -> &mut [MaybeUninit<u8>] {
  // SAFETY: `MaybeUninit<u8>` has the layout of `u8` and the kernel only ever
  // writes initialized bytes into the buffer.
  unsafe { &mut *(buffer as *mut [u8] as *mut [MaybeUninit<u8>]) }
}
