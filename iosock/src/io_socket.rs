//! Event-driven dispatcher multiplexing many sockets.
//!
//! One polling thread waits on the [`OsReactor`] and fans readiness out to a
//! [`ThreadPool`]; every subscription sticks to one worker so its reads,
//! decoding and flushes run in order. Results never run on workers: they are
//! queued as callbacks on the [`Handler`], which the consumer thread drains.
//!
//! ```text
//! poll thread ──readiness──▶ worker (per-socket affinity) ──callbacks──▶ Handler ──▶ consumer
//! ```
//!
//! Reactor registrations are edge-triggered, so a worker always drains a
//! socket until it would block. Write interest is only armed while the socket
//! has queued sends; the socket flips it under its send queue lock.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace, warn};

use crate::alloc::{self, AllocatorRef};
use crate::buffer::Buffer;
use crate::config::IoConfig;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::packet::Packet;
use crate::reactor::{Event, Events, Interest, OsReactor, Reactor, Readiness};
use crate::socket::{Attachment, Socket, SocketType};
use crate::sync::{Mutex, MutexGuard};
use crate::thread_pool::{Affinity, ThreadPool};

const ACTIVE: u8 = 0;
/// Torn down by a worker after an error or a hang-up; final callbacks still run.
const CLOSED: u8 = 1;
/// Removed by the consumer; nothing runs anymore.
const UNSUBSCRIBED: u8 = 2;

/// Turns received bytes into records.
///
/// Runs on a worker thread. `buffer` holds everything received and not yet
/// consumed; the decoder clips the bytes of every complete record off its
/// front and pushes the records, as owned packets, into `records`. Leaving
/// the bytes in place waits for more data. An error tears the subscription
/// down and reaches `on_error`.
pub trait Decoder: Send {
  fn decode(
    &mut self,
    buffer: &mut Buffer,
    address: SocketAddr,
    socket: &Socket,
    records: &mut Vec<Packet<'static>>,
  ) -> Result<()>;

  /// Called once when the subscription goes away.
  fn on_release(&mut self, _socket: &Socket) {}
}

type OnReceived = Box<dyn FnMut(Packet<'static>, SocketAddr) + Send>;
type OnFlush = Box<dyn FnMut() + Send>;
type OnError = Box<dyn FnMut(Error) + Send>;
type OnDisconnection = Box<dyn FnMut() + Send>;
type OnAccept = Box<dyn FnMut(Arc<Socket>) + Send>;

/// Consumer-side reactions of a subscription. All of them run on the thread
/// that flushes the [`Handler`].
#[derive(Default)]
pub struct Callbacks {
  on_received: Option<OnReceived>,
  on_flush: Option<OnFlush>,
  on_error: Option<OnError>,
  on_disconnection: Option<OnDisconnection>,
  on_accept: Option<OnAccept>,
}

impl Callbacks {
  pub fn new() -> Self {
    Self::default()
  }

  /// A record (or, without a decoder, the raw bytes) and its sender.
  pub fn on_received<F>(mut self, callback: F) -> Self
  where
    F: FnMut(Packet<'static>, SocketAddr) + Send + 'static,
  {
    self.on_received = Some(Box::new(callback));
    self
  }

  /// The send queue has been drained.
  pub fn on_flush<F>(mut self, callback: F) -> Self
  where
    F: FnMut() + Send + 'static,
  {
    self.on_flush = Some(Box::new(callback));
    self
  }

  pub fn on_error<F>(mut self, callback: F) -> Self
  where
    F: FnMut(Error) + Send + 'static,
  {
    self.on_error = Some(Box::new(callback));
    self
  }

  /// The peer closed a stream cleanly.
  pub fn on_disconnection<F>(mut self, callback: F) -> Self
  where
    F: FnMut() + Send + 'static,
  {
    self.on_disconnection = Some(Box::new(callback));
    self
  }

  /// A listening socket accepted a connection.
  pub fn on_accept<F>(mut self, callback: F) -> Self
  where
    F: FnMut(Arc<Socket>) + Send + 'static,
  {
    self.on_accept = Some(Box::new(callback));
    self
  }
}

impl std::fmt::Debug for Callbacks {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Callbacks")
      .field("on_received", &self.on_received.is_some())
      .field("on_flush", &self.on_flush.is_some())
      .field("on_error", &self.on_error.is_some())
      .field("on_disconnection", &self.on_disconnection.is_some())
      .field("on_accept", &self.on_accept.is_some())
      .finish()
  }
}

pub struct IoSocket {
  shared: Arc<Shared>,
  poller: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
  reactor: OsReactor,
  handler: Handler,
  pool: Arc<ThreadPool>,
  config: IoConfig,
  allocator: AllocatorRef,
  subscriptions: Mutex<HashMap<u64, Arc<Subscription>>>,
  next_key: AtomicU64,
  running: AtomicBool,
}

enum Closing {
  Disconnection,
  Failure(Error),
}

struct Activity {
  decoder: Option<Box<dyn Decoder>>,
  /// Bytes received on a stream and not consumed by the decoder yet. For
  /// datagrams, the receive buffer kept between wakeups.
  buffer: Buffer,
}

struct Subscription {
  key: u64,
  fd: RawFd,
  listener: bool,
  datagram: bool,
  socket: Weak<Socket>,
  io: Weak<Shared>,
  handler: Handler,
  affinity: Affinity,
  state: AtomicU8,
  activity: Mutex<Activity>,
  callbacks: Mutex<Callbacks>,
}

impl IoSocket {
  pub fn new(handler: Handler, pool: Arc<ThreadPool>) -> Result<Self> {
    Self::with_config(handler, pool, IoConfig::default())
  }

  pub fn with_config(handler: Handler, pool: Arc<ThreadPool>, config: IoConfig) -> Result<Self> {
    Self::with_allocator(handler, pool, config, alloc::system())
  }

  /// Receive buffers come from `allocator`, typically a shared
  /// [`BufferPool`](crate::alloc::BufferPool).
  pub fn with_allocator(
    handler: Handler,
    pool: Arc<ThreadPool>,
    config: IoConfig,
    allocator: AllocatorRef,
  ) -> Result<Self> {
    let reactor = OsReactor::new().map_err(|e| Error::os("reactor", e))?;
    let shared = Arc::new(Shared {
      reactor,
      handler,
      pool,
      config,
      allocator,
      subscriptions: Mutex::new(HashMap::new()),
      next_key: AtomicU64::new(1),
      running: AtomicBool::new(true),
    });

    let polling = Arc::clone(&shared);
    let poller = thread::Builder::new()
      .name("iosock-poll".into())
      .spawn(move || polling.poll())
      .map_err(|e| Error::os("spawn", e))?;

    debug!(threads = shared.pool.threads(), "io socket started");
    Ok(Self { shared, poller: Mutex::new(Some(poller)) })
  }

  /// Starts delivering events of a connected or datagram socket.
  ///
  /// The socket is switched to non-blocking mode. Without a decoder the raw
  /// received bytes reach `on_received`. Dropping the socket unsubscribes it.
  pub fn subscribe(
    &self,
    socket: &Arc<Socket>,
    decoder: Option<Box<dyn Decoder>>,
    callbacks: Callbacks,
  ) -> Result<()> {
    self.register(socket, false, decoder, callbacks)
  }

  /// Accepts connections of a listening socket as they arrive.
  pub fn subscribe_listener<A, E>(&self, socket: &Arc<Socket>, on_accept: A, on_error: E) -> Result<()>
  where
    A: FnMut(Arc<Socket>) + Send + 'static,
    E: FnMut(Error) + Send + 'static,
  {
    if !socket.listening() {
      return Err(Error::Unsupported("socket is not listening".into()));
    }
    let callbacks = Callbacks::new().on_accept(on_accept).on_error(on_error);
    self.register(socket, true, None, callbacks)
  }

  fn register(
    &self,
    socket: &Arc<Socket>,
    listener: bool,
    decoder: Option<Box<dyn Decoder>>,
    callbacks: Callbacks,
  ) -> Result<()> {
    let shared = &self.shared;
    if !shared.running.load(Ordering::Acquire) {
      return Err(Error::Closed);
    }
    socket.set_nonblocking(true)?;

    let key = shared.next_key.fetch_add(1, Ordering::Relaxed);
    let fd = socket.as_raw_fd();
    let subscription = Arc::new(Subscription {
      key,
      fd,
      listener,
      datagram: socket.kind() == SocketType::Datagram,
      socket: Arc::downgrade(socket),
      io: Arc::downgrade(shared),
      handler: shared.handler.clone(),
      affinity: Affinity::new(),
      state: AtomicU8::new(ACTIVE),
      activity: Mutex::new(Activity { decoder, buffer: Buffer::new_in(0, shared.allocator.clone()) }),
      callbacks: Mutex::new(callbacks),
    });

    // Registered before arming so the very first event finds it.
    shared.subscriptions.lock().insert(key, Arc::clone(&subscription));
    let attached = socket.attach(subscription.clone(), |pending| {
      let interest = if pending && !listener { Interest::ReadAndWrite } else { Interest::Read };
      shared.reactor.add(fd, key, interest)
    });

    if let Err(err) = attached {
      subscription.state.store(UNSUBSCRIBED, Ordering::Release);
      shared.subscriptions.lock().remove(&key);
      return Err(err);
    }
    debug!(key, fd, listener, "subscribed");
    Ok(())
  }

  /// Stops every event and callback for `socket`.
  ///
  /// Waits for a worker currently busy with the socket, so once this returns
  /// no callback for it runs, even those already queued on the handler.
  /// Must not be called from a [`Decoder`]. Returns `false` when the socket
  /// was not subscribed to this dispatcher.
  pub fn unsubscribe(&self, socket: &Socket) -> bool {
    match socket.detach_from(Arc::as_ptr(&self.shared).cast()) {
      Some(attachment) => {
        attachment.detach(socket, true);
        true
      }
      None => false,
    }
  }

  pub fn subscribers(&self) -> usize {
    self.shared.subscriptions.lock().len()
  }

  pub fn handler(&self) -> &Handler {
    &self.shared.handler
  }

  pub fn thread_pool(&self) -> &Arc<ThreadPool> {
    &self.shared.pool
  }

  pub fn is_running(&self) -> bool {
    self.shared.running.load(Ordering::Acquire)
  }

  /// Stops the polling thread and releases every subscription. Idempotent.
  pub fn stop(&self) {
    self.shared.running.store(false, Ordering::Release);
    if let Err(err) = self.shared.reactor.notify() {
      warn!(error = %err, "could not wake the polling thread");
    }
    if let Some(poller) = self.poller.lock().take() {
      if poller.join().is_err() {
        error!("polling thread panicked");
      }
    }

    let released: Vec<Arc<Subscription>> =
      self.shared.subscriptions.lock().drain().map(|(_, subscription)| subscription).collect();
    for subscription in &released {
      subscription.release(&self.shared);
    }
    if !released.is_empty() {
      debug!(subscriptions = released.len(), "io socket stopped");
    }
  }
}

impl Drop for IoSocket {
  fn drop(&mut self) {
    self.stop();
  }
}

impl std::fmt::Debug for IoSocket {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IoSocket")
      .field("subscribers", &self.subscribers())
      .field("running", &self.is_running())
      .finish()
  }
}

impl Shared {
  fn poll(self: Arc<Self>) {
    let mut events = Events::with_capacity(self.config.event_capacity);
    while self.running.load(Ordering::Acquire) {
      match events.wait(&self.reactor, Some(self.config.poll_timeout)) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => {
          error!(error = %err, "reactor wait failed");
          self.fail_all(&err);
          return;
        }
      }
      for event in events.iter() {
        self.dispatch(event);
      }
    }
    trace!("polling thread exits");
  }

  fn dispatch(&self, event: Event) {
    let Some(subscription) = self.subscriptions.lock().get(&event.key).cloned() else {
      trace!(key = event.key, "event for a released subscription");
      return;
    };
    let worker = Arc::clone(&subscription);
    let readiness = event.readiness;
    if !self.pool.queue(&subscription.affinity, move || worker.process(readiness)) {
      warn!(key = event.key, "thread pool is gone, event dropped");
    }
  }

  /// The reactor is unusable: every subscription ends with an error.
  fn fail_all(&self, cause: &io::Error) {
    self.running.store(false, Ordering::Release);
    let failed: Vec<Arc<Subscription>> =
      self.subscriptions.lock().drain().map(|(_, subscription)| subscription).collect();

    for subscription in failed {
      let Some(socket) = subscription.socket.upgrade() else { continue };
      let mut activity = subscription.activity.lock();
      let err = match cause.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::from(cause.kind()),
      };
      subscription.close(self, &socket, &mut activity, Closing::Failure(Error::os("poll", err)));
    }
  }

  /// Unregisters a subscription. The caller keeps the socket alive so the
  /// descriptor cannot be reused meanwhile.
  fn forget(&self, subscription: &Subscription) {
    if let Err(err) = self.reactor.delete(subscription.fd) {
      trace!(fd = subscription.fd, error = %err, "reactor delete");
    }
    let mut subscriptions = self.subscriptions.lock();
    if subscriptions.remove(&subscription.key).is_some() {
      debug!(key = subscription.key, fd = subscription.fd, subscribers = subscriptions.len(), "unsubscribed");
    }
  }
}

/// What the accept loop does after `accept` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
  /// Only the failed connection is affected; keep accepting.
  Transient,
  /// Out of descriptors or memory; retry on the next readiness report.
  Exhausted,
  Fatal,
}

impl AcceptFailure {
  fn of(err: &Error) -> Self {
    match err.code() {
      Some(libc::ECONNABORTED | libc::ECONNRESET | libc::EINTR | libc::EPROTO) => Self::Transient,
      Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => Self::Exhausted,
      _ => Self::Fatal,
    }
  }
}

impl Subscription {
  fn is_active(&self) -> bool {
    self.state.load(Ordering::Acquire) == ACTIVE
  }

  /// Worker side of one readiness report.
  fn process(self: &Arc<Self>, readiness: Readiness) {
    // Upgraded before locking: the socket is released after the guard.
    let Some(socket) = self.socket.upgrade() else { return };
    let Some(io) = self.io.upgrade() else { return };
    let mut activity = self.activity.lock();
    if !self.is_active() {
      return;
    }

    if readiness.error {
      match socket.take_error() {
        Ok(Some(err)) => {
          self.close(&io, &socket, &mut activity, Closing::Failure(Error::os("socket", err)));
          return;
        }
        Ok(None) => {}
        Err(err) => {
          self.close(&io, &socket, &mut activity, Closing::Failure(err));
          return;
        }
      }
    }

    if self.listener {
      if readiness.readable || readiness.hangup {
        self.accept_pending(&io, &socket);
      }
      return;
    }

    if readiness.readable || readiness.hangup {
      let closing = if self.datagram {
        self.read_datagrams(&io, &socket, &mut activity)
      } else {
        self.read_stream(&io, &socket, &mut activity)
      };
      if let Some(closing) = closing {
        self.close(&io, &socket, &mut activity, closing);
        return;
      }
    }

    if readiness.writable {
      match socket.flush() {
        Ok(true) => self.schedule(|callbacks| {
          if let Some(on_flush) = callbacks.on_flush.as_mut() {
            on_flush();
          }
        }),
        Ok(false) => {}
        Err(err) => self.close(&io, &socket, &mut activity, Closing::Failure(err)),
      }
    }
  }

  fn accept_pending(self: &Arc<Self>, io: &Shared, listener: &Socket) {
    loop {
      match listener.accept() {
        Ok(Some(accepted)) => {
          let accepted = Arc::new(accepted);
          self.schedule(move |callbacks| {
            if let Some(on_accept) = callbacks.on_accept.as_mut() {
              on_accept(accepted);
            }
          });
        }
        Ok(None) => return,
        Err(err) => {
          // The listener itself stays subscribed.
          warn!(fd = self.fd, error = %err, "accept failed");
          let failure = AcceptFailure::of(&err);
          self.schedule(move |callbacks| {
            if let Some(on_error) = callbacks.on_error.as_mut() {
              on_error(err);
            }
          });
          match failure {
            AcceptFailure::Transient => {}
            AcceptFailure::Exhausted => {
              // Pending connections produce no new edge; re-arming reports them again.
              if let Err(err) = io.reactor.modify(self.fd, self.key, Interest::Read) {
                warn!(fd = self.fd, error = %err, "could not re-arm listener");
              }
              return;
            }
            AcceptFailure::Fatal => return,
          }
        }
      }
    }
  }

  fn read_stream(self: &Arc<Self>, io: &Shared, socket: &Socket, activity: &mut Activity) -> Option<Closing> {
    let address =
      socket.peer_address().unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    loop {
      let wanted = socket.available().unwrap_or(0).max(io.config.min_recv_size);
      let start = activity.buffer.len();
      activity.buffer.resize(start + wanted, true);

      match socket.receive(&mut activity.buffer[start..], 0) {
        Ok(0) => {
          activity.buffer.resize(start, true);
          return Some(Closing::Disconnection);
        }
        Ok(read) => {
          activity.buffer.resize(start + read, true);
          trace!(fd = self.fd, bytes = read, "received");
          let Activity { decoder, buffer } = &mut *activity;
          if let Err(err) = self.deliver(io, socket, decoder.as_deref_mut(), buffer, address) {
            return Some(Closing::Failure(err));
          }
        }
        Err(Error::WouldBlock) => {
          activity.buffer.resize(start, true);
          return None;
        }
        Err(err) if err.code() == Some(libc::EINTR) => {
          activity.buffer.resize(start, true);
        }
        Err(err) => {
          activity.buffer.resize(start, true);
          return Some(Closing::Failure(err));
        }
      }
    }
  }

  /// Every datagram is decoded on its own; bytes a decoder leaves behind are
  /// dropped with the datagram.
  ///
  /// The receive buffer is reused until a record takes it over, so only a
  /// delivered datagram costs an allocation.
  fn read_datagrams(self: &Arc<Self>, io: &Shared, socket: &Socket, activity: &mut Activity) -> Option<Closing> {
    loop {
      let wanted = socket.available().unwrap_or(0).max(io.config.min_recv_size);
      activity.buffer.resize(wanted, false);

      match socket.receive_from(&mut activity.buffer, 0) {
        Ok((read, address)) => {
          activity.buffer.resize(read, true);
          trace!(fd = self.fd, bytes = read, %address, "datagram");
          let Activity { decoder, buffer } = &mut *activity;
          let delivered = self.deliver(io, socket, decoder.as_deref_mut(), buffer, address);
          activity.buffer.clear();
          if let Err(err) = delivered {
            return Some(Closing::Failure(err));
          }
        }
        Err(Error::WouldBlock) => return None,
        Err(err) if err.code() == Some(libc::EINTR) => {}
        Err(err) => return Some(Closing::Failure(err)),
      }
    }
  }

  fn deliver(
    self: &Arc<Self>,
    io: &Shared,
    socket: &Socket,
    decoder: Option<&mut (dyn Decoder + 'static)>,
    buffer: &mut Buffer,
    address: SocketAddr,
  ) -> Result<()> {
    let mut records = Vec::new();
    match decoder {
      Some(decoder) => decoder.decode(buffer, address, socket, &mut records)?,
      None => {
        let received = mem::replace(buffer, Buffer::new_in(0, io.allocator.clone()));
        records.push(Packet::from(received));
      }
    }

    for record in records {
      self.schedule(move |callbacks| {
        if let Some(on_received) = callbacks.on_received.as_mut() {
          on_received(record, address);
        }
      });
    }
    Ok(())
  }

  /// Worker-side teardown. Final callbacks still reach the consumer.
  fn close(self: &Arc<Self>, io: &Shared, socket: &Socket, activity: &mut Activity, closing: Closing) {
    if self.state.compare_exchange(ACTIVE, CLOSED, Ordering::AcqRel, Ordering::Acquire).is_err() {
      return;
    }
    io.forget(self);
    if let Some(decoder) = activity.decoder.as_mut() {
      decoder.on_release(socket);
    }

    match closing {
      Closing::Disconnection => {
        debug!(key = self.key, fd = self.fd, "peer disconnected");
        self.schedule(|callbacks| {
          if let Some(on_disconnection) = callbacks.on_disconnection.as_mut() {
            on_disconnection();
          }
        });
      }
      Closing::Failure(err) => {
        debug!(key = self.key, fd = self.fd, error = %err, "subscription failed");
        self.schedule(move |callbacks| {
          if let Some(on_error) = callbacks.on_error.as_mut() {
            on_error(err);
          }
        });
      }
    }
  }

  /// Dispatcher shutdown.
  fn release(&self, io: &Shared) {
    let Some(socket) = self.socket.upgrade() else { return };
    if self.state.swap(UNSUBSCRIBED, Ordering::AcqRel) != ACTIVE {
      return;
    }
    if let Err(err) = io.reactor.delete(self.fd) {
      trace!(fd = self.fd, error = %err, "reactor delete");
    }
    let mut activity = self.activity.lock();
    if let Some(decoder) = activity.decoder.as_mut() {
      decoder.on_release(&socket);
    }
  }

  /// Queues `callback` on the consumer thread. It is skipped if the socket
  /// gets unsubscribed before it runs.
  fn schedule<F>(self: &Arc<Self>, callback: F)
  where
    F: FnOnce(&mut Callbacks) + Send + 'static,
  {
    let subscription = Arc::clone(self);
    let queued = self.handler.queue(move || {
      if subscription.state.load(Ordering::Acquire) == UNSUBSCRIBED {
        return;
      }
      let mut callbacks = subscription.callbacks.lock();
      callback(&mut callbacks);
    });
    if !queued {
      warn!(key = self.key, "handler is gone, callback dropped");
    }
  }
}

impl Attachment for Subscription {
  fn is_attached(&self) -> bool {
    self.is_active()
  }

  fn want_write(&self, enabled: bool) {
    if self.listener || !self.is_active() {
      return;
    }
    let Some(io) = self.io.upgrade() else { return };
    let interest = if enabled { Interest::ReadAndWrite } else { Interest::Read };
    match io.reactor.modify(self.fd, self.key, interest) {
      Ok(()) => trace!(fd = self.fd, ?interest, "interest changed"),
      Err(err) => warn!(fd = self.fd, error = %err, "could not change interest"),
    }
  }

  fn owner(&self) -> *const () {
    self.io.as_ptr().cast()
  }

  fn detach(&self, socket: &Socket, wait: bool) {
    let previous = self.state.swap(UNSUBSCRIBED, Ordering::AcqRel);
    // Waiting for the activity lock lets an in-flight worker finish.
    let activity: Option<MutexGuard<'_, Activity>> =
      if wait { Some(self.activity.lock()) } else { self.activity.try_lock() };
    if previous != ACTIVE {
      return;
    }

    if let Some(io) = self.io.upgrade() {
      io.forget(self);
    }
    if let Some(mut activity) = activity {
      if let Some(decoder) = activity.decoder.as_mut() {
        decoder.on_release(socket);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::tests::CountingAllocator;
  use std::net::IpAddr;
  use std::sync::atomic::AtomicUsize;
  use std::time::{Duration, Instant};

  fn io_socket() -> IoSocket {
    IoSocket::new(Handler::new(), Arc::new(ThreadPool::new(2).unwrap())).unwrap()
  }

  fn udp() -> Arc<Socket> {
    let socket = Socket::for_address(SocketType::Datagram, &"127.0.0.1:0".parse().unwrap()).unwrap();
    socket.bind_any(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
    Arc::new(socket)
  }

  /// Flushes the handler until `done` holds or a few seconds pass.
  fn pump(handler: &Handler, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
      if done() {
        return true;
      }
      handler.flush_timeout(Duration::from_millis(10));
    }
    done()
  }

  #[test]
  fn test_subscriber_count() {
    let io = io_socket();
    let a = udp();
    let b = udp();
    io.subscribe(&a, None, Callbacks::new()).unwrap();
    io.subscribe(&b, None, Callbacks::new()).unwrap();
    assert_eq!(io.subscribers(), 2);

    assert!(io.unsubscribe(&a));
    assert!(!io.unsubscribe(&a));
    assert_eq!(io.subscribers(), 1);

    drop(b);
    assert_eq!(io.subscribers(), 0);
  }

  #[test]
  fn test_unsubscribe_ignores_other_dispatcher() {
    let first = io_socket();
    let second = io_socket();
    let socket = udp();
    first.subscribe(&socket, None, Callbacks::new()).unwrap();

    assert!(!second.unsubscribe(&socket));
    assert_eq!(first.subscribers(), 1);

    assert!(first.unsubscribe(&socket));
    assert_eq!(first.subscribers(), 0);
  }

  #[test]
  fn test_subscribe_twice_fails() {
    let io = io_socket();
    let socket = udp();
    io.subscribe(&socket, None, Callbacks::new()).unwrap();
    assert!(io.subscribe(&socket, None, Callbacks::new()).is_err());
    assert_eq!(io.subscribers(), 1);
  }

  #[test]
  fn test_datagram_without_decoder() {
    let io = io_socket();
    let receiver = udp();
    let target = receiver.address().unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let callbacks = Callbacks::new().on_received(move |packet, address| {
      sink.lock().push((packet.to_vec(), address));
    });
    io.subscribe(&receiver, None, callbacks).unwrap();

    let sender = udp();
    sender.send_to(b"hello", Some(&target), 0).unwrap();
    sender.send_to(b"world", Some(&target), 0).unwrap();

    assert!(pump(io.handler(), || received.lock().len() == 2));
    let received = received.lock();
    assert_eq!(received[0].0, b"hello");
    assert_eq!(received[1].0, b"world");
    assert_eq!(received[0].1, sender.address().unwrap());
  }

  #[test]
  fn test_datagram_buffer_reused_between_wakeups() {
    let counting = Arc::new(CountingAllocator::default());
    let allocator: AllocatorRef = counting.clone();
    let pool = Arc::new(ThreadPool::new(1).unwrap());
    let io = IoSocket::with_allocator(Handler::new(), pool, IoConfig::default(), allocator).unwrap();
    let receiver = udp();
    let target = receiver.address().unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let callbacks = Callbacks::new().on_received(move |_, _| {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    io.subscribe(&receiver, None, callbacks).unwrap();

    // One datagram per wakeup.
    let sender = udp();
    for round in 0..3 {
      sender.send_to(b"ping", Some(&target), 0).unwrap();
      assert!(pump(io.handler(), || received.load(Ordering::SeqCst) == round + 1));
    }

    // A block per delivered datagram plus the one waiting for the next wakeup.
    assert!(pump(io.handler(), || counting.allocs() == 4));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(counting.allocs(), 4);
  }

  #[test]
  fn test_accept_failure_classes() {
    let of = |code: i32| AcceptFailure::of(&Error::os("accept", io::Error::from_raw_os_error(code)));
    assert_eq!(of(libc::ECONNABORTED), AcceptFailure::Transient);
    assert_eq!(of(libc::EINTR), AcceptFailure::Transient);
    assert_eq!(of(libc::EMFILE), AcceptFailure::Exhausted);
    assert_eq!(of(libc::ENFILE), AcceptFailure::Exhausted);
    assert_eq!(of(libc::EBADF), AcceptFailure::Fatal);
  }

  struct Failing;

  impl Decoder for Failing {
    fn decode(
      &mut self,
      _: &mut Buffer,
      _: SocketAddr,
      _: &Socket,
      _: &mut Vec<Packet<'static>>,
    ) -> Result<()> {
      Err(Error::Decode("garbage".into()))
    }
  }

  #[test]
  fn test_decoder_error_tears_down() {
    let io = io_socket();
    let receiver = udp();
    let target = receiver.address().unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    let callbacks = Callbacks::new().on_error(move |err| {
      assert!(matches!(err, Error::Decode(_)));
      counter.fetch_add(1, Ordering::SeqCst);
    });
    io.subscribe(&receiver, Some(Box::new(Failing)), callbacks).unwrap();

    udp().send_to(b"x", Some(&target), 0).unwrap();
    assert!(pump(io.handler(), || errors.load(Ordering::SeqCst) == 1));
    assert_eq!(io.subscribers(), 0);
  }

  #[test]
  fn test_stop_rejects_subscriptions() {
    let io = io_socket();
    let socket = udp();
    io.subscribe(&socket, None, Callbacks::new()).unwrap();
    io.stop();
    assert!(!io.is_running());
    assert_eq!(io.subscribers(), 0);
    assert!(matches!(io.subscribe(&udp(), None, Callbacks::new()), Err(Error::Closed)));
    io.stop();
  }

  #[test]
  fn test_listener_requires_listening() {
    let io = io_socket();
    let socket = Arc::new(Socket::new(SocketType::Stream).unwrap());
    assert!(io.subscribe_listener(&socket, |_| {}, |_| {}).is_err());
  }
}
