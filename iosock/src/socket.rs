//! Connection and datagram endpoints.
//!
//! A [`Socket`] wraps a `socket2::Socket` and adds what the dispatcher needs:
//! a FIFO of pending sends that [`write`](Socket::write) fills and
//! [`flush`](Socket::flush) drains, the queued byte counter feeding
//! [`Congestion`], byte-rate accounting and cached addresses. Every byte goes
//! through the socket's [`Transport`].

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use socket2::{Domain, SockAddr, Type};
use tracing::{debug, trace};

use crate::byte_rate::ByteRate;
use crate::config::SocketParams;
use crate::congestion::Congestion;
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::sync::Mutex;
use crate::transport::{Plain, Transport};

/// Largest backlog handed to `listen(2)`.
pub const BACKLOG_MAX: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
  Stream,
  Datagram,
  /// A handle of another kind adopted with [`Socket::from_socket2`].
  Other,
}

impl SocketType {
  fn os_type(self) -> Result<Type> {
    match self {
      SocketType::Stream => Ok(Type::STREAM),
      SocketType::Datagram => Ok(Type::DGRAM),
      SocketType::Other => {
        Err(Error::Unsupported("creating a socket of type Other".into()))
      }
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
  Receive,
  Send,
  Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketState {
  Created,
  Bound,
  Connected,
  Listening,
  Closed,
}

impl SocketState {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => SocketState::Created,
      1 => SocketState::Bound,
      2 => SocketState::Connected,
      3 => SocketState::Listening,
      _ => SocketState::Closed,
    }
  }
}

/// Link from a socket to the dispatcher it is subscribed to.
pub(crate) trait Attachment: Send + Sync {
  /// Still receiving readiness for this socket.
  fn is_attached(&self) -> bool;

  /// Adds or withdraws write-readiness interest. Called with the send queue
  /// locked.
  fn want_write(&self, enabled: bool);

  /// Stops delivering events and callbacks for this socket. With `wait`, blocks
  /// until in-flight work for the socket has finished.
  fn detach(&self, socket: &Socket, wait: bool);

  /// Identity of the dispatcher that installed this link.
  fn owner(&self) -> *const ();
}

struct Sending {
  packet: Packet<'static>,
  address: Option<SocketAddr>,
  flags: i32,
}

#[derive(Default)]
struct Sendings {
  queue: VecDeque<Sending>,
  congestion: Congestion,
}

pub struct Socket {
  inner: socket2::Socket,
  kind: SocketType,
  domain: Domain,
  transport: Arc<dyn Transport>,
  state: AtomicU8,
  listening: AtomicBool,
  nonblocking: AtomicBool,
  send_shutdown: AtomicBool,
  address: Mutex<Option<SocketAddr>>,
  peer_address: Mutex<Option<SocketAddr>>,
  sendings: Mutex<Sendings>,
  queueing: AtomicU64,
  recv_rate: ByteRate,
  send_rate: ByteRate,
  recv_time: Mutex<Option<Instant>>,
  send_time: Mutex<Option<Instant>>,
  attachment: Mutex<Option<Arc<dyn Attachment>>>,
}

impl Socket {
  /// Dual-stack IPv6 socket, or IPv4 when the host has no IPv6.
  ///
  /// IPv4 addresses given to a dual-stack socket are mapped transparently and
  /// reported back unmapped.
  pub fn new(kind: SocketType) -> Result<Self> {
    match Self::create(kind, Domain::IPV6) {
      Ok(socket) => {
        socket.inner.set_only_v6(false).map_err(|e| Error::os("socket", e))?;
        Ok(socket)
      }
      Err(Error::Unsupported(reason)) if kind == SocketType::Other => {
        Err(Error::Unsupported(reason))
      }
      Err(err) => {
        debug!(error = %err, "no IPv6, falling back to IPv4");
        Self::create(kind, Domain::IPV4)
      }
    }
  }

  /// Socket of the family of `address`.
  pub fn for_address(kind: SocketType, address: &SocketAddr) -> Result<Self> {
    Self::create(kind, Domain::for_address(*address))
  }

  /// Adopts an existing OS socket.
  pub fn from_socket2(inner: socket2::Socket, kind: SocketType) -> Result<Self> {
    let domain = inner.local_addr().map_err(|e| Error::os("getsockname", e))?.domain();
    let nonblocking = inner.nonblocking().unwrap_or(false);
    let socket = Self::from_parts(inner, kind, domain, Arc::new(Plain), SocketState::Created);
    socket.nonblocking.store(nonblocking, Ordering::Release);
    Ok(socket)
  }

  /// Replaces the transport used for every send and receive.
  pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
    self.transport = transport;
    self
  }

  fn create(kind: SocketType, domain: Domain) -> Result<Self> {
    let inner = socket2::Socket::new(domain, kind.os_type()?, None)
      .map_err(|e| Error::os("socket", e))?;
    Ok(Self::from_parts(inner, kind, domain, Arc::new(Plain), SocketState::Created))
  }

  fn from_parts(
    inner: socket2::Socket,
    kind: SocketType,
    domain: Domain,
    transport: Arc<dyn Transport>,
    state: SocketState,
  ) -> Self {
    #[cfg(apple)]
    if let Err(err) = inner.set_nosigpipe(true) {
      tracing::warn!(error = %err, "SO_NOSIGPIPE failed");
    }

    Self {
      inner,
      kind,
      domain,
      transport,
      state: AtomicU8::new(state as u8),
      listening: AtomicBool::new(false),
      nonblocking: AtomicBool::new(false),
      send_shutdown: AtomicBool::new(false),
      address: Mutex::new(None),
      peer_address: Mutex::new(None),
      sendings: Mutex::new(Sendings::default()),
      queueing: AtomicU64::new(0),
      recv_rate: ByteRate::new(),
      send_rate: ByteRate::new(),
      recv_time: Mutex::new(None),
      send_time: Mutex::new(None),
      attachment: Mutex::new(None),
    }
  }

  pub fn kind(&self) -> SocketType {
    self.kind
  }

  pub fn state(&self) -> SocketState {
    SocketState::from_u8(self.state.load(Ordering::Acquire))
  }

  fn set_state(&self, state: SocketState) {
    self.state.store(state as u8, Ordering::Release);
  }

  pub fn is_secure(&self) -> bool {
    self.transport.is_secure()
  }

  pub fn listening(&self) -> bool {
    self.listening.load(Ordering::Acquire)
  }

  /// Underlying `socket2` handle for options this type does not cover.
  pub fn as_socket2(&self) -> &socket2::Socket {
    &self.inner
  }

  fn native(&self, address: &SocketAddr) -> SockAddr {
    match address {
      SocketAddr::V4(v4) if self.domain == Domain::IPV6 => {
        SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port()).into()
      }
      _ => (*address).into(),
    }
  }

  /// Local address, resolved once and cached.
  pub fn address(&self) -> Result<SocketAddr> {
    let mut cached = self.address.lock();
    if let Some(address) = *cached {
      return Ok(address);
    }
    let address = self
      .inner
      .local_addr()
      .map_err(|e| Error::os("getsockname", e))?
      .as_socket()
      .map(canonical)
      .ok_or_else(|| Error::Address("local address is not an IP endpoint".into()))?;
    *cached = Some(address);
    Ok(address)
  }

  pub fn peer_address(&self) -> Option<SocketAddr> {
    let mut cached = self.peer_address.lock();
    if cached.is_none() && self.state() == SocketState::Connected {
      *cached = self.inner.peer_addr().ok().and_then(|a| a.as_socket()).map(canonical);
    }
    *cached
  }

  /// Connects to `address`.
  ///
  /// Datagram sockets only set (or, with an unspecified address, clear) their
  /// default peer. Stream sockets wait at most `timeout`; a zero timeout starts
  /// the connection and returns, and an in-progress non-blocking connect
  /// counts as success, completion being signalled by write readiness.
  pub fn connect(&self, address: &SocketAddr, timeout: Duration) -> Result<()> {
    if self.kind == SocketType::Datagram && address.ip().is_unspecified() {
      self.disconnect().map_err(|e| Error::os("connect", e))?;
      *self.peer_address.lock() = None;
      if self.state() == SocketState::Connected {
        self.set_state(SocketState::Bound);
      }
      return Ok(());
    }

    let target = self.native(address);
    let result = if timeout.is_zero() || self.kind == SocketType::Datagram {
      self.inner.connect(&target)
    } else {
      let result = self.inner.connect_timeout(&target, timeout);
      // connect_timeout hands the socket back in blocking mode
      if self.nonblocking.load(Ordering::Acquire) {
        self.inner.set_nonblocking(true).map_err(|e| Error::os("connect", e))?;
      }
      result
    };

    match result {
      Ok(()) => {}
      Err(err)
        if err.raw_os_error() == Some(libc::EINPROGRESS)
          || err.kind() == io::ErrorKind::WouldBlock => {}
      Err(err) => return Err(Error::os("connect", err)),
    }

    *self.peer_address.lock() = Some(canonical(*address));
    *self.address.lock() = None;
    self.set_state(SocketState::Connected);
    trace!(fd = self.as_raw_fd(), %address, "connected");
    Ok(())
  }

  /// Dissolves a datagram association by connecting to `AF_UNSPEC`.
  fn disconnect(&self) -> io::Result<()> {
    // SAFETY: an all-zero sockaddr is a valid value.
    let mut address: libc::sockaddr = unsafe { mem::zeroed() };
    address.sa_family = libc::AF_UNSPEC as libc::sa_family_t;
    match syscall!(connect(
      self.as_raw_fd(),
      &address as *const libc::sockaddr,
      mem::size_of::<libc::sockaddr>() as libc::socklen_t,
    )) {
      Ok(_) => Ok(()),
      // BSDs report EAFNOSUPPORT but dissolve the association anyway
      Err(err) if err.raw_os_error() == Some(libc::EAFNOSUPPORT) => Ok(()),
      Err(err) => Err(err),
    }
  }

  /// Binds to `address`. A multicast address on a datagram socket also joins
  /// that group.
  pub fn bind(&self, address: &SocketAddr) -> Result<()> {
    self.inner.bind(&self.native(address)).map_err(|e| Error::os("bind", e))?;
    *self.address.lock() = None;
    if self.state() == SocketState::Created {
      self.set_state(SocketState::Bound);
    }
    if self.kind == SocketType::Datagram && address.ip().is_multicast() {
      self.join_group(&address.ip(), 0)?;
    }
    Ok(())
  }

  /// Binds to `ip` on an ephemeral port.
  pub fn bind_any(&self, ip: IpAddr) -> Result<()> {
    self.bind(&SocketAddr::new(ip, 0))
  }

  pub fn listen(&self, backlog: u32) -> Result<()> {
    let backlog = backlog.min(BACKLOG_MAX) as i32;
    self.inner.listen(backlog).map_err(|e| Error::os("listen", e))?;
    self.listening.store(true, Ordering::Release);
    self.set_state(SocketState::Listening);
    Ok(())
  }

  /// Takes the next pending connection, `None` when none is ready.
  pub fn accept(&self) -> Result<Option<Socket>> {
    match self.inner.accept() {
      Ok((inner, address)) => {
        let socket = Socket::from_parts(
          inner,
          SocketType::Stream,
          self.domain,
          self.transport.clone(),
          SocketState::Connected,
        );
        *socket.peer_address.lock() = address.as_socket().map(canonical);
        trace!(fd = socket.as_raw_fd(), peer = ?socket.peer_address(), "accepted");
        Ok(Some(socket))
      }
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
      Err(err) => Err(Error::os("accept", err)),
    }
  }

  /// Reads into `buffer`. `Ok(0)` on a stream socket means the peer closed.
  pub fn receive(&self, buffer: &mut [u8], flags: i32) -> Result<usize> {
    let read = self
      .transport
      .recv(&self.inner, buffer, flags)
      .map_err(|e| Error::os("receive", e))?;
    self.received(read);
    Ok(read)
  }

  /// Reads into `buffer` and reports the sender.
  pub fn receive_from(&self, buffer: &mut [u8], flags: i32) -> Result<(usize, SocketAddr)> {
    let (read, address) = self
      .transport
      .recv_from(&self.inner, buffer, flags)
      .map_err(|e| Error::os("receive", e))?;
    self.received(read);
    let address = address
      .and_then(|a| a.as_socket())
      .map(canonical)
      .or_else(|| self.peer_address())
      .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    Ok((read, address))
  }

  fn received(&self, count: usize) {
    self.recv_rate.add(count as u64);
    *self.recv_time.lock() = Some(Instant::now());
  }

  pub fn send(&self, data: &[u8], flags: i32) -> Result<usize> {
    self.send_to(data, None, flags)
  }

  /// Best-effort immediate send; may be partial. `None` (or an unspecified
  /// address) sends to the connected peer.
  pub fn send_to(&self, data: &[u8], address: Option<&SocketAddr>, flags: i32) -> Result<usize> {
    if self.send_shutdown.load(Ordering::Acquire) {
      return Err(Error::Shutdown);
    }
    let result = match address {
      Some(address) if !address.ip().is_unspecified() => {
        self.transport.send_to(&self.inner, data, &self.native(address), flags)
      }
      _ => self.transport.send(&self.inner, data, flags),
    };
    let sent = result.map_err(|e| Error::os("send", e))?;
    self.send_rate.add(sent as u64);
    *self.send_time.lock() = Some(Instant::now());
    Ok(sent)
  }

  /// Sends what the OS takes right now and queues the rest.
  ///
  /// When data is already queued the whole packet is appended so ordering
  /// holds. Returns the bytes accepted immediately. A hard error half-closes
  /// the send direction of a stream socket.
  pub fn write(&self, packet: &Packet<'_>, address: Option<&SocketAddr>, flags: i32) -> Result<usize> {
    if self.send_shutdown.load(Ordering::Acquire) {
      return Err(Error::Shutdown);
    }

    let mut sendings = self.sendings.lock();
    if !sendings.queue.is_empty() {
      self.enqueue(&mut sendings, packet.clone().into_owned(), address, flags);
      return Ok(0);
    }

    let sent = match self.send_to(packet.data(), address, flags) {
      Ok(sent) => sent,
      Err(Error::WouldBlock) => 0,
      Err(err) => {
        drop(sendings);
        return Err(self.write_failed(err));
      }
    };

    if sent < packet.len() {
      self.enqueue(&mut sendings, (packet + sent).into_owned(), address, flags);
    }
    Ok(sent)
  }

  fn enqueue(
    &self,
    sendings: &mut Sendings,
    packet: Packet<'static>,
    address: Option<&SocketAddr>,
    flags: i32,
  ) {
    let was_empty = sendings.queue.is_empty();
    let len = packet.len() as u64;
    let queueing = self.queueing.fetch_add(len, Ordering::AcqRel) + len;
    sendings.congestion.update(queueing);
    sendings.queue.push_back(Sending { packet, address: address.copied(), flags });
    trace!(fd = self.as_raw_fd(), bytes = len, queueing, "queued");
    if was_empty {
      self.watch_write(true);
    }
  }

  /// Drains the pending queue in order.
  ///
  /// Returns `true` when this call emptied a non-empty queue, at which point
  /// write interest is withdrawn.
  pub fn flush(&self) -> Result<bool> {
    self.flush_queue(false)
  }

  fn flush_queue(&self, deleting: bool) -> Result<bool> {
    let mut guard = self.sendings.lock();
    let sendings = &mut *guard;
    if sendings.queue.is_empty() {
      return Ok(false);
    }

    while let Some(front) = sendings.queue.front_mut() {
      let sent = match self.send_to(front.packet.data(), front.address.as_ref(), front.flags) {
        Ok(sent) => sent,
        Err(Error::WouldBlock) => return Ok(false),
        Err(err) => {
          drop(guard);
          return Err(self.write_failed(err));
        }
      };

      let queueing = self.queueing.fetch_sub(sent as u64, Ordering::AcqRel) - sent as u64;
      sendings.congestion.update(queueing);

      if sent < front.packet.len() {
        front.packet += sent;
        return Ok(false);
      }
      sendings.queue.pop_front();
    }

    debug_assert_eq!(self.queueing.load(Ordering::Acquire), 0);
    trace!(fd = self.as_raw_fd(), "send queue drained");
    if !deleting {
      self.watch_write(false);
    }
    Ok(true)
  }

  fn write_failed(&self, err: Error) -> Error {
    if self.kind == SocketType::Stream {
      if let Err(shutdown) = self.shutdown(ShutdownType::Send) {
        trace!(error = %shutdown, "half-close after write failure");
      }
    }
    err
  }

  fn watch_write(&self, enabled: bool) {
    if let Some(attachment) = self.attachment.lock().as_ref() {
      attachment.want_write(enabled);
    }
  }

  /// Bytes accepted by [`write`](Self::write) but not yet handed to the OS.
  pub fn queueing(&self) -> u64 {
    self.queueing.load(Ordering::Acquire)
  }

  /// How long the send queue has kept growing, zero unless above `threshold`.
  pub fn congested(&self, threshold: Duration) -> Duration {
    self.sendings.lock().congestion.congested_for(threshold)
  }

  /// Half or full close. The socket keeps accepting sends when the OS call
  /// fails.
  pub fn shutdown(&self, how: ShutdownType) -> Result<()> {
    let native = match how {
      ShutdownType::Receive => std::net::Shutdown::Read,
      ShutdownType::Send => std::net::Shutdown::Write,
      ShutdownType::Both => std::net::Shutdown::Both,
    };
    self.inner.shutdown(native).map_err(|e| Error::os("shutdown", e))?;
    match how {
      ShutdownType::Receive => {}
      ShutdownType::Send => self.send_shutdown.store(true, Ordering::Release),
      ShutdownType::Both => {
        self.send_shutdown.store(true, Ordering::Release);
        self.set_state(SocketState::Closed);
      }
    }
    Ok(())
  }

  /// Bytes readable without blocking.
  pub fn available(&self) -> Result<usize> {
    let mut available: libc::c_int = 0;
    syscall!(ioctl(self.as_raw_fd(), libc::FIONREAD, &mut available as *mut libc::c_int))
      .map_err(|e| Error::os("ioctl", e))?;
    Ok(available.max(0) as usize)
  }

  pub fn recv_byte_rate(&self) -> u64 {
    self.recv_rate.rate()
  }

  pub fn send_byte_rate(&self) -> u64 {
    self.send_rate.rate()
  }

  pub fn recv_time(&self) -> Option<Instant> {
    *self.recv_time.lock()
  }

  pub fn send_time(&self) -> Option<Instant> {
    *self.send_time.lock()
  }

  /// Pending `SO_ERROR`, cleared by the read.
  pub fn take_error(&self) -> Result<Option<io::Error>> {
    self.inner.take_error().map_err(|e| Error::os("getsockopt", e))
  }

  pub fn set_nonblocking(&self, enabled: bool) -> Result<()> {
    self.inner.set_nonblocking(enabled).map_err(|e| Error::os("fcntl", e))?;
    self.nonblocking.store(enabled, Ordering::Release);
    Ok(())
  }

  pub fn nonblocking(&self) -> bool {
    self.nonblocking.load(Ordering::Acquire)
  }

  pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
    self.inner.set_send_buffer_size(size).map_err(|e| Error::os("setsockopt", e))
  }

  pub fn send_buffer_size(&self) -> Result<usize> {
    self.inner.send_buffer_size().map_err(|e| Error::os("getsockopt", e))
  }

  pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
    self.inner.set_recv_buffer_size(size).map_err(|e| Error::os("setsockopt", e))
  }

  pub fn recv_buffer_size(&self) -> Result<usize> {
    self.inner.recv_buffer_size().map_err(|e| Error::os("getsockopt", e))
  }

  pub fn set_keep_alive(&self, enabled: bool) -> Result<()> {
    self.inner.set_keepalive(enabled).map_err(|e| Error::os("setsockopt", e))
  }

  pub fn keep_alive(&self) -> Result<bool> {
    self.inner.keepalive().map_err(|e| Error::os("getsockopt", e))
  }

  pub fn set_reuse_address(&self, enabled: bool) -> Result<()> {
    self.inner.set_reuse_address(enabled).map_err(|e| Error::os("setsockopt", e))
  }

  pub fn reuse_address(&self) -> Result<bool> {
    self.inner.reuse_address().map_err(|e| Error::os("getsockopt", e))
  }

  pub fn set_broadcast(&self, enabled: bool) -> Result<()> {
    self.inner.set_broadcast(enabled).map_err(|e| Error::os("setsockopt", e))
  }

  pub fn broadcast(&self) -> Result<bool> {
    self.inner.broadcast().map_err(|e| Error::os("getsockopt", e))
  }

  pub fn set_linger(&self, linger: Option<Duration>) -> Result<()> {
    self.inner.set_linger(linger).map_err(|e| Error::os("setsockopt", e))
  }

  pub fn linger(&self) -> Result<Option<Duration>> {
    self.inner.linger().map_err(|e| Error::os("getsockopt", e))
  }

  pub fn set_no_delay(&self, enabled: bool) -> Result<()> {
    self.set_int_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, enabled as libc::c_int)
  }

  pub fn no_delay(&self) -> Result<bool> {
    self.int_option(libc::IPPROTO_TCP, libc::TCP_NODELAY).map(|v| v != 0)
  }

  pub fn set_reuse_port(&self, enabled: bool) -> Result<()> {
    self.set_int_option(libc::SOL_SOCKET, libc::SO_REUSEPORT, enabled as libc::c_int)
  }

  pub fn reuse_port(&self) -> Result<bool> {
    self.int_option(libc::SOL_SOCKET, libc::SO_REUSEPORT).map(|v| v != 0)
  }

  pub fn set_oob_inline(&self, enabled: bool) -> Result<()> {
    self.set_int_option(libc::SOL_SOCKET, libc::SO_OOBINLINE, enabled as libc::c_int)
  }

  pub fn oob_inline(&self) -> Result<bool> {
    self.int_option(libc::SOL_SOCKET, libc::SO_OOBINLINE).map(|v| v != 0)
  }

  /// `setsockopt` pass-through for integer options.
  pub fn set_int_option(&self, level: i32, name: i32, value: libc::c_int) -> Result<()> {
    syscall!(setsockopt(
      self.as_raw_fd(),
      level,
      name,
      &value as *const libc::c_int as *const libc::c_void,
      mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
    .map_err(|e| Error::os("setsockopt", e))
  }

  /// `getsockopt` pass-through for integer options.
  pub fn int_option(&self, level: i32, name: i32) -> Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
      self.as_raw_fd(),
      level,
      name,
      &mut value as *mut libc::c_int as *mut libc::c_void,
      &mut len,
    ))
    .map_err(|e| Error::os("getsockopt", e))?;
    Ok(value)
  }

  /// Joins a multicast group. `interface` is an interface index for IPv6
  /// groups and is ignored for IPv4 ones (the OS picks the interface).
  pub fn join_group(&self, group: &IpAddr, interface: u32) -> Result<()> {
    match group {
      IpAddr::V4(v4) => self.inner.join_multicast_v4(v4, &Ipv4Addr::UNSPECIFIED),
      IpAddr::V6(v6) => self.inner.join_multicast_v6(v6, interface),
    }
    .map_err(|e| Error::os("join group", e))
  }

  pub fn leave_group(&self, group: &IpAddr, interface: u32) -> Result<()> {
    match group {
      IpAddr::V4(v4) => self.inner.leave_multicast_v4(v4, &Ipv4Addr::UNSPECIFIED),
      IpAddr::V6(v6) => self.inner.leave_multicast_v6(v6, interface),
    }
    .map_err(|e| Error::os("leave group", e))
  }

  /// Applies every option set in `params`.
  pub fn apply_params(&self, params: &SocketParams) -> Result<()> {
    if let Some(size) = params.send_buffer_size {
      self.set_send_buffer_size(size)?;
    }
    if let Some(size) = params.recv_buffer_size {
      self.set_recv_buffer_size(size)?;
    }
    if let Some(enabled) = params.no_delay {
      if self.kind == SocketType::Stream {
        self.set_no_delay(enabled)?;
      }
    }
    if let Some(enabled) = params.keep_alive {
      self.set_keep_alive(enabled)?;
    }
    if let Some(linger) = params.linger {
      self.set_linger(linger)?;
    }
    if let Some(enabled) = params.reuse_address {
      self.set_reuse_address(enabled)?;
    }
    Ok(())
  }

  /// Installs the dispatcher link. `register` receives whether sends are
  /// pending and must arm the reactor; both happen under the send queue lock
  /// so no write can slip in between.
  pub(crate) fn attach(
    &self,
    attachment: Arc<dyn Attachment>,
    register: impl FnOnce(bool) -> io::Result<()>,
  ) -> Result<()> {
    let sendings = self.sendings.lock();
    let mut slot = self.attachment.lock();
    if slot.as_ref().is_some_and(|current| current.is_attached()) {
      return Err(Error::Unsupported("socket is already subscribed".into()));
    }
    register(!sendings.queue.is_empty()).map_err(|e| Error::os("subscribe", e))?;
    *slot = Some(attachment);
    Ok(())
  }

  pub(crate) fn detach(&self) -> Option<Arc<dyn Attachment>> {
    self.attachment.lock().take()
  }

  /// Like [`detach`](Self::detach), but leaves a link installed by another
  /// dispatcher in place.
  pub(crate) fn detach_from(&self, owner: *const ()) -> Option<Arc<dyn Attachment>> {
    let mut slot = self.attachment.lock();
    if slot.as_ref().is_some_and(|current| std::ptr::eq(current.owner(), owner)) {
      slot.take()
    } else {
      None
    }
  }
}

fn canonical(address: SocketAddr) -> SocketAddr {
  SocketAddr::new(address.ip().to_canonical(), address.port())
}

impl AsRawFd for Socket {
  fn as_raw_fd(&self) -> RawFd {
    self.inner.as_raw_fd()
  }
}

impl std::fmt::Debug for Socket {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Socket")
      .field("fd", &self.as_raw_fd())
      .field("kind", &self.kind)
      .field("state", &self.state())
      .field("queueing", &self.queueing())
      .finish()
  }
}

impl Drop for Socket {
  fn drop(&mut self) {
    if let Some(attachment) = self.detach() {
      attachment.detach(self, false);
    }
    if let Err(err) = self.flush_queue(true) {
      trace!(fd = self.as_raw_fd(), error = %err, "final flush failed");
    }
    let dropped = self.queueing();
    if dropped > 0 {
      debug!(fd = self.as_raw_fd(), bytes = dropped, "closing with unsent bytes");
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  /// Transport that accepts at most `budget` bytes, then reports
  /// `WouldBlock`, so the pending queue can be driven deterministically.
  pub(crate) struct GatedTransport {
    pub budget: AtomicUsize,
    pub sent: Mutex<Vec<u8>>,
  }

  impl GatedTransport {
    pub fn closed() -> Arc<Self> {
      Arc::new(Self { budget: AtomicUsize::new(0), sent: Mutex::new(Vec::new()) })
    }

    pub fn open(&self, bytes: usize) {
      self.budget.fetch_add(bytes, Ordering::SeqCst);
    }

    fn take(&self, data: &[u8]) -> io::Result<usize> {
      let budget = self.budget.load(Ordering::SeqCst);
      if budget == 0 {
        return Err(io::ErrorKind::WouldBlock.into());
      }
      let accepted = budget.min(data.len());
      self.budget.fetch_sub(accepted, Ordering::SeqCst);
      self.sent.lock().extend_from_slice(&data[..accepted]);
      Ok(accepted)
    }
  }

  impl Transport for GatedTransport {
    fn send(&self, _: &socket2::Socket, data: &[u8], _: i32) -> io::Result<usize> {
      self.take(data)
    }

    fn send_to(&self, _: &socket2::Socket, data: &[u8], _: &SockAddr, _: i32) -> io::Result<usize> {
      self.take(data)
    }

    fn recv(&self, socket: &socket2::Socket, buffer: &mut [u8], flags: i32) -> io::Result<usize> {
      Plain.recv(socket, buffer, flags)
    }

    fn recv_from(
      &self,
      socket: &socket2::Socket,
      buffer: &mut [u8],
      flags: i32,
    ) -> io::Result<(usize, Option<SockAddr>)> {
      Plain.recv_from(socket, buffer, flags)
    }
  }

  fn gated() -> (Socket, Arc<GatedTransport>) {
    let gate = GatedTransport::closed();
    let socket = Socket::new(SocketType::Datagram).unwrap().with_transport(gate.clone());
    (socket, gate)
  }

  #[test]
  fn test_salut_queue_then_flush() {
    let (socket, gate) = gated();
    let target: SocketAddr = "127.0.0.1:9".parse().unwrap();

    let sent = socket.write(&Packet::from("Salut"), Some(&target), 0).unwrap();
    assert_eq!(sent, 0);
    assert_eq!(socket.queueing(), 5);

    gate.open(5);
    assert!(socket.flush().unwrap());
    assert_eq!(socket.queueing(), 0);
    assert_eq!(&gate.sent.lock()[..], b"Salut");
    assert!(!socket.flush().unwrap());
  }

  #[test]
  fn test_partial_send_keeps_order() {
    let (socket, gate) = gated();
    gate.open(2);

    assert_eq!(socket.write(&Packet::from("abcd"), None, 0).unwrap(), 2);
    assert_eq!(socket.write(&Packet::from("efgh"), None, 0).unwrap(), 0);
    assert_eq!(socket.queueing(), 6);

    gate.open(3);
    assert!(!socket.flush().unwrap());
    assert_eq!(socket.queueing(), 3);

    gate.open(3);
    assert!(socket.flush().unwrap());
    assert_eq!(&gate.sent.lock()[..], b"abcdefgh");
  }

  #[test]
  fn test_write_bufferizes_transient_packets() {
    let (socket, gate) = gated();
    {
      let transient = b"transient".to_vec();
      socket.write(&Packet::from(&transient), None, 0).unwrap();
    }
    gate.open(64);
    assert!(socket.flush().unwrap());
    assert_eq!(&gate.sent.lock()[..], b"transient");
  }

  #[test]
  fn test_congestion_grows_while_queueing() {
    let (socket, _gate) = gated();
    socket.write(&Packet::from("x"), None, 0).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    socket.write(&Packet::from("yy"), None, 0).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    assert!(socket.congested(Duration::from_millis(1)) >= Duration::from_millis(5));
  }

  #[test]
  fn test_send_after_shutdown_fails() {
    let receiver = Socket::new(SocketType::Datagram).unwrap();
    receiver.bind_any(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
    let target = receiver.address().unwrap();

    let socket = Socket::new(SocketType::Datagram).unwrap();
    socket.connect(&target, Duration::ZERO).unwrap();
    socket.shutdown(ShutdownType::Send).unwrap();
    assert!(matches!(socket.send(b"x", 0), Err(Error::Shutdown)));
    assert!(matches!(socket.write(&Packet::from("x"), None, 0), Err(Error::Shutdown)));
  }

  #[test]
  fn test_failed_shutdown_keeps_sending() {
    let receiver = Socket::new(SocketType::Datagram).unwrap();
    receiver.bind_any(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
    let target = receiver.address().unwrap();

    // Unconnected datagram sockets report ENOTCONN.
    let socket = Socket::new(SocketType::Datagram).unwrap();
    socket.bind_any(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
    let err = socket.shutdown(ShutdownType::Both).unwrap_err();
    assert_eq!(err.code(), Some(libc::ENOTCONN));
    assert_ne!(socket.state(), SocketState::Closed);

    assert_eq!(socket.send_to(b"still", Some(&target), 0).unwrap(), 5);
    let mut buffer = [0u8; 8];
    let (read, _) = receiver.receive_from(&mut buffer, 0).unwrap();
    assert_eq!(&buffer[..read], b"still");
  }

  #[test]
  fn test_listen_and_state() {
    let socket = Socket::new(SocketType::Stream).unwrap();
    assert_eq!(socket.state(), SocketState::Created);
    socket.bind_any(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
    assert_eq!(socket.state(), SocketState::Bound);
    socket.listen(10_000).unwrap();
    assert!(socket.listening());
    assert_eq!(socket.state(), SocketState::Listening);

    socket.set_nonblocking(true).unwrap();
    assert!(socket.accept().unwrap().is_none());
  }

  #[test]
  fn test_dual_stack_reports_ipv4() {
    let socket = Socket::new(SocketType::Datagram).unwrap();
    socket.bind_any(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
    let address = socket.address().unwrap();
    assert!(address.is_ipv4());
    assert_ne!(address.port(), 0);
  }

  #[test]
  fn test_options_round_trip() {
    let socket = Socket::new(SocketType::Stream).unwrap();
    socket.set_no_delay(true).unwrap();
    assert!(socket.no_delay().unwrap());
    socket.set_keep_alive(true).unwrap();
    assert!(socket.keep_alive().unwrap());
    socket.set_reuse_address(true).unwrap();
    assert!(socket.reuse_address().unwrap());
    socket.set_linger(None).unwrap();
    assert_eq!(socket.linger().unwrap(), None);

    socket.apply_params(&SocketParams::default().with_recv_buffer_size(1 << 16)).unwrap();
    assert!(socket.recv_buffer_size().unwrap() >= 1 << 16);
  }

  #[test]
  fn test_other_type_cannot_be_created() {
    assert!(matches!(Socket::new(SocketType::Other), Err(Error::Unsupported(_))));
  }
}
