#![cfg_attr(docsrs, feature(doc_cfg))]

//! # iosock - sockets with non-blocking multiplexed I/O
//!
//! The network core of a server: a [`Socket`] abstraction with a sequential
//! non-blocking write path, an [`IoSocket`] dispatcher that multiplexes many
//! sockets on a few worker threads, and [`Packet`]/[`Buffer`] to move bytes
//! through the stack without copying them.
//!
//! ## Platform support
//!
//! | Platform            | Readiness mechanism |
//! |---------------------|---------------------|
//! | Linux, Android      | epoll               |
//! | macOS, iOS, BSDs    | kqueue              |
//! | Windows             | Not supported       |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use iosock::{Callbacks, Handler, IoSocket, Packet, Socket, SocketType, ThreadPool};
//!
//! # fn main() -> iosock::Result<()> {
//! let handler = Handler::new();
//! let pool = Arc::new(ThreadPool::new(0)?);
//! let io = IoSocket::new(handler.clone(), pool)?;
//!
//! let socket = Arc::new(Socket::new(SocketType::Datagram)?);
//! socket.bind(&"0.0.0.0:5000".parse().unwrap())?;
//!
//! let echo = Arc::clone(&socket);
//! io.subscribe(
//!   &socket,
//!   None,
//!   Callbacks::new().on_received(move |packet, from| {
//!     let _ = echo.write(&packet, Some(&from), 0);
//!   }),
//! )?;
//!
//! loop {
//!   // Callbacks run here, on the thread owning the sockets.
//!   handler.flush_timeout(Duration::from_millis(100));
//! }
//! # }
//! ```
//!
//! ## Threading
//!
//! Decoders run on worker threads and only ever see data owned by the
//! dispatcher. Every other callback runs on the thread draining the
//! [`Handler`]. [`Socket::write`] never blocks: what the kernel does not take
//! is queued, bufferized, and flushed when the socket becomes writable.
//!
//! ## Error Handling
//!
//! Fallible operations return [`Result`] with the crate [`Error`]. OS errors
//! keep their errno; [`Error::WouldBlock`] is the normal non-blocking outcome.

#[macro_use]
mod macros;
mod sync;

pub mod alloc;
pub mod buffer;
pub mod byte_rate;
pub mod config;
pub mod congestion;
pub mod error;
pub mod handler;
pub mod io_socket;
pub mod packet;
mod reactor;
pub mod socket;
pub mod thread_pool;
pub mod transport;

pub use alloc::{Allocator, AllocatorRef, BufferPool, SystemAllocator};
pub use buffer::Buffer;
pub use byte_rate::ByteRate;
pub use config::{IoConfig, SocketParams};
pub use congestion::Congestion;
pub use error::{Error, Result};
pub use handler::Handler;
pub use io_socket::{Callbacks, Decoder, IoSocket};
pub use packet::{ByteStore, Packet, Store};
pub use socket::{BACKLOG_MAX, ShutdownType, Socket, SocketState, SocketType};
pub use thread_pool::{Affinity, ThreadPool};
pub use transport::{Plain, Transport};
