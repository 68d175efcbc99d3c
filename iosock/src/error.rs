use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy shared by sockets, the dispatcher and configuration parsing.
///
/// `WouldBlock` is not a failure: it is what a non-blocking call returns when
/// the kernel has nothing to give or no room to take.
#[derive(Debug, Error)]
pub enum Error {
  #[error("operation would block")]
  WouldBlock,

  #[error("invalid address: {0}")]
  Address(String),

  #[error("permission denied during {op}")]
  Permission { op: &'static str },

  #[error("unsupported: {0}")]
  Unsupported(String),

  #[error("{op} failed: {source}")]
  Socket {
    op: &'static str,
    code: i32,
    #[source]
    source: io::Error,
  },

  #[error("send direction is shut down")]
  Shutdown,

  #[error("subscription or dispatcher is closed")]
  Closed,

  #[error("decoder failed: {0}")]
  Decode(String),

  #[error("invalid parameter {key}: {value:?}")]
  Config { key: String, value: String },
}

impl Error {
  /// Classifies an OS error raised while running `op`.
  pub fn os(op: &'static str, err: io::Error) -> Self {
    if err.kind() == io::ErrorKind::WouldBlock {
      return Error::WouldBlock;
    }

    match err.raw_os_error() {
      Some(libc::EACCES | libc::EPERM) => Error::Permission { op },
      Some(libc::ENOPROTOOPT | libc::EOPNOTSUPP | libc::EPROTONOSUPPORT) => {
        Error::Unsupported(format!("{op}: {err}"))
      }
      Some(libc::EAFNOSUPPORT | libc::EADDRNOTAVAIL | libc::EDESTADDRREQ) => {
        Error::Address(format!("{op}: {err}"))
      }
      Some(code) => Error::Socket { op, code, source: err },
      None if err.kind() == io::ErrorKind::InvalidInput => {
        Error::Address(format!("{op}: {err}"))
      }
      None => Error::Socket { op, code: 0, source: err },
    }
  }

  /// The errno behind this error, when there is one.
  pub fn code(&self) -> Option<i32> {
    match self {
      Error::Socket { code, .. } if *code != 0 => Some(*code),
      Error::WouldBlock => Some(libc::EWOULDBLOCK),
      Error::Permission { .. } => Some(libc::EACCES),
      _ => None,
    }
  }

  pub fn is_would_block(&self) -> bool {
    matches!(self, Error::WouldBlock)
  }
}

impl From<io::Error> for Error {
  fn from(err: io::Error) -> Self {
    Error::os("io", err)
  }
}
