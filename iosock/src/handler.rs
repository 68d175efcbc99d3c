//! Handoff of callbacks to the consumer thread.
//!
//! Workers [`queue`](Handler::queue) closures from any thread; the thread
//! that owns the sockets runs them by calling [`flush`](Handler::flush) or
//! [`flush_timeout`](Handler::flush_timeout) from its own loop.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct Handler {
  sender: Sender<Callback>,
  receiver: Receiver<Callback>,
}

impl Default for Handler {
  fn default() -> Self {
    Self::new()
  }
}

impl Handler {
  pub fn new() -> Self {
    let (sender, receiver) = crossbeam_channel::unbounded();
    Self { sender, receiver }
  }

  pub fn queue<F>(&self, callback: F) -> bool
  where
    F: FnOnce() + Send + 'static,
  {
    self.sender.send(Box::new(callback)).is_ok()
  }

  /// Runs every pending callback and returns how many ran.
  pub fn flush(&self) -> usize {
    let mut ran = 0;
    while let Ok(callback) = self.receiver.try_recv() {
      callback();
      ran += 1;
    }
    ran
  }

  /// Waits up to `timeout` for a first callback, then runs everything pending.
  pub fn flush_timeout(&self, timeout: Duration) -> usize {
    match self.receiver.recv_timeout(timeout) {
      Ok(callback) => {
        callback();
        1 + self.flush()
      }
      Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => 0,
    }
  }

  pub fn pending(&self) -> usize {
    self.receiver.len()
  }
}

impl std::fmt::Debug for Handler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Handler").field("pending", &self.pending()).finish()
  }
}
