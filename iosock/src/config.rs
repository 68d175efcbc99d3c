//! Tunables for the dispatcher and per-socket options.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Dispatcher settings used by [`IoSocket::with_config`](crate::IoSocket::with_config).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoConfig {
  /// Upper bound on readiness events fetched per reactor wait.
  pub event_capacity: usize,
  /// How long the polling thread blocks before rechecking for shutdown.
  pub poll_timeout: Duration,
  /// Floor of the receive buffer when `available()` reports less.
  pub min_recv_size: usize,
}

impl Default for IoConfig {
  fn default() -> Self {
    Self {
      event_capacity: 256,
      poll_timeout: Duration::from_millis(100),
      min_recv_size: 2048,
    }
  }
}

impl IoConfig {
  pub fn with_event_capacity(mut self, capacity: usize) -> Self {
    self.event_capacity = capacity.max(1);
    self
  }

  pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
    self.poll_timeout = timeout;
    self
  }

  pub fn with_min_recv_size(mut self, size: usize) -> Self {
    self.min_recv_size = size.max(1);
    self
  }
}

/// Socket options applied by [`Socket::apply_params`](crate::Socket::apply_params).
///
/// `None` leaves the OS default untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketParams {
  pub send_buffer_size: Option<usize>,
  pub recv_buffer_size: Option<usize>,
  pub no_delay: Option<bool>,
  pub keep_alive: Option<bool>,
  /// `Some(None)` disables lingering, `Some(Some(d))` lingers for `d`.
  pub linger: Option<Option<Duration>>,
  pub reuse_address: Option<bool>,
}

impl SocketParams {
  pub fn with_buffer_size(mut self, size: usize) -> Self {
    self.send_buffer_size = Some(size);
    self.recv_buffer_size = Some(size);
    self
  }

  pub fn with_send_buffer_size(mut self, size: usize) -> Self {
    self.send_buffer_size = Some(size);
    self
  }

  pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
    self.recv_buffer_size = Some(size);
    self
  }

  pub fn with_no_delay(mut self, enabled: bool) -> Self {
    self.no_delay = Some(enabled);
    self
  }

  pub fn with_keep_alive(mut self, enabled: bool) -> Self {
    self.keep_alive = Some(enabled);
    self
  }

  pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
    self.linger = Some(linger);
    self
  }

  pub fn with_reuse_address(mut self, enabled: bool) -> Self {
    self.reuse_address = Some(enabled);
    self
  }

  /// Reads parameters from `key=value` pairs.
  ///
  /// Recognized keys: `bufferSize`, `sendBufferSize`, `recvBufferSize`,
  /// `noDelay`, `keepAlive`, `linger` (seconds, negative disables) and
  /// `reuseAddress`. When `prefix` is given (e.g. `"net."`), a prefixed key
  /// overrides its unprefixed form. Unknown keys are ignored.
  pub fn from_pairs<'a, I>(pairs: I, prefix: Option<&str>) -> Result<Self>
  where
    I: IntoIterator<Item = (&'a str, &'a str)>,
  {
    let mut plain = Vec::new();
    let mut prefixed = Vec::new();
    for (key, value) in pairs {
      match prefix.and_then(|prefix| key.strip_prefix(prefix)) {
        Some(stripped) => prefixed.push((stripped, value)),
        None => plain.push((key, value)),
      }
    }

    let mut params = Self::default();
    for (key, value) in plain.into_iter().chain(prefixed) {
      params.set(key, value)?;
    }
    Ok(params)
  }

  fn set(&mut self, key: &str, value: &str) -> Result<()> {
    match key {
      "bufferSize" => {
        let size = parse(key, value)?;
        self.send_buffer_size = Some(size);
        self.recv_buffer_size = Some(size);
      }
      "sendBufferSize" => self.send_buffer_size = Some(parse(key, value)?),
      "recvBufferSize" => self.recv_buffer_size = Some(parse(key, value)?),
      "noDelay" => self.no_delay = Some(parse_bool(key, value)?),
      "keepAlive" => self.keep_alive = Some(parse_bool(key, value)?),
      "reuseAddress" => self.reuse_address = Some(parse_bool(key, value)?),
      "linger" => {
        let seconds: i64 = parse(key, value)?;
        self.linger = Some(u64::try_from(seconds).ok().map(Duration::from_secs));
      }
      _ => {}
    }
    Ok(())
  }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
  value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
  match value.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" => Ok(false),
    _ => Err(invalid(key, value)),
  }
}

fn invalid(key: &str, value: &str) -> Error {
  Error::Config { key: key.to_owned(), value: value.to_owned() }
}
