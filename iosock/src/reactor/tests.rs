//! Behavior every [`Reactor`] backend must show, written once and
//! instantiated per backend with [`generate_tests!`](crate::generate_tests).

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{Interest, NOTIFY_KEY, Reactor, Readiness};

const SHORT: Option<Duration> = Some(Duration::from_millis(10));
const LONG: Option<Duration> = Some(Duration::from_secs(1));

/// Connected unix stream pair, both ends non-blocking.
pub fn socket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
  let mut fds = [0i32; 2];
  syscall!(socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()))?;
  // SAFETY: socketpair returned two descriptors nobody else owns.
  let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
  make_nonblocking(pair.0.as_raw_fd())?;
  make_nonblocking(pair.1.as_raw_fd())?;
  Ok(pair)
}

pub fn make_nonblocking(fd: RawFd) -> io::Result<()> {
  let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
  syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
  Ok(())
}

fn write_bytes(fd: RawFd, data: &[u8]) -> io::Result<usize> {
  syscall!(write(fd, data.as_ptr() as *const libc::c_void, data.len())).map(|n| n as usize)
}

fn read_all(fd: RawFd) -> usize {
  let mut sink = [0u8; 256];
  let mut total = 0;
  while let Ok(read) = syscall!(read(fd, sink.as_mut_ptr() as *mut libc::c_void, sink.len())) {
    if read <= 0 {
      break;
    }
    total += read as usize;
  }
  total
}

/// Waits once and folds the reports per key, dropping wakeups.
fn collect<R: Reactor>(reactor: &R, timeout: Option<Duration>) -> io::Result<Vec<(u64, Readiness)>> {
  // SAFETY: native events are plain C structs.
  let mut events: Vec<R::NativeEvent> = vec![unsafe { std::mem::zeroed() }; 16];
  let count = reactor.wait(&mut events, timeout)?;

  let mut found: Vec<(u64, Readiness)> = Vec::new();
  for event in &events[..count] {
    let key = R::event_key(event);
    if key == NOTIFY_KEY {
      continue;
    }
    let readiness = R::event_readiness(event);
    match found.iter_mut().find(|(existing, _)| *existing == key) {
      Some((_, merged)) => {
        merged.readable |= readiness.readable;
        merged.writable |= readiness.writable;
        merged.error |= readiness.error;
        merged.hangup |= readiness.hangup;
      }
      None => found.push((key, readiness)),
    }
  }
  Ok(found)
}

pub fn test_add_read_no_data<R: Reactor>(reactor: R) -> io::Result<()> {
  let (a, _b) = socket_pair()?;
  reactor.add(a.as_raw_fd(), 1, Interest::Read)?;

  assert!(collect(&reactor, SHORT)?.is_empty(), "nothing to read yet");
  Ok(())
}

pub fn test_read_becomes_ready<R: Reactor>(reactor: R) -> io::Result<()> {
  let (a, b) = socket_pair()?;
  reactor.add(a.as_raw_fd(), 7, Interest::Read)?;
  write_bytes(b.as_raw_fd(), b"ping")?;

  let found = collect(&reactor, LONG)?;
  assert_eq!(found.len(), 1);
  assert_eq!(found[0].0, 7);
  assert!(found[0].1.readable);
  assert!(!found[0].1.writable);
  Ok(())
}

pub fn test_write_immediately_ready<R: Reactor>(reactor: R) -> io::Result<()> {
  let (a, _b) = socket_pair()?;
  reactor.add(a.as_raw_fd(), 3, Interest::Write)?;

  let found = collect(&reactor, LONG)?;
  assert_eq!(found.len(), 1);
  assert_eq!(found[0].0, 3);
  assert!(found[0].1.writable);
  Ok(())
}

pub fn test_add_twice_fails<R: Reactor>(reactor: R) -> io::Result<()> {
  let (a, _b) = socket_pair()?;
  reactor.add(a.as_raw_fd(), 1, Interest::Read)?;

  // kqueue updates in place, epoll refuses.
  if let Err(err) = reactor.add(a.as_raw_fd(), 1, Interest::Read) {
    assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
  }
  Ok(())
}

pub fn test_modify_read_to_write<R: Reactor>(reactor: R) -> io::Result<()> {
  let (a, _b) = socket_pair()?;
  reactor.add(a.as_raw_fd(), 5, Interest::Read)?;
  assert!(collect(&reactor, SHORT)?.is_empty());

  reactor.modify(a.as_raw_fd(), 5, Interest::ReadAndWrite)?;
  let found = collect(&reactor, LONG)?;
  assert_eq!(found.len(), 1);
  assert!(found[0].1.writable);

  reactor.modify(a.as_raw_fd(), 5, Interest::Read)?;
  assert!(collect(&reactor, SHORT)?.is_empty(), "write interest withdrawn");
  Ok(())
}

pub fn test_delete_interest<R: Reactor>(reactor: R) -> io::Result<()> {
  let (a, b) = socket_pair()?;
  reactor.add(a.as_raw_fd(), 1, Interest::Read)?;
  reactor.delete(a.as_raw_fd())?;

  write_bytes(b.as_raw_fd(), b"ignored")?;
  assert!(collect(&reactor, SHORT)?.is_empty());
  Ok(())
}

pub fn test_delete_unregistered<R: Reactor>(reactor: R) -> io::Result<()> {
  let (a, _b) = socket_pair()?;
  match reactor.delete(a.as_raw_fd()) {
    Ok(()) => {}
    Err(err) => assert_eq!(err.raw_os_error(), Some(libc::ENOENT)),
  }
  Ok(())
}

pub fn test_notify_wakes_wait<R: Reactor + 'static>(reactor: R) -> io::Result<()> {
  let reactor = std::sync::Arc::new(reactor);
  let waker = std::sync::Arc::clone(&reactor);

  let started = std::time::Instant::now();
  let thread = std::thread::spawn(move || {
    std::thread::sleep(Duration::from_millis(20));
    waker.notify()
  });

  let found = collect(&*reactor, Some(Duration::from_secs(5)))?;
  assert!(found.is_empty(), "wakeups are not reported as events");
  assert!(started.elapsed() < Duration::from_secs(5));
  thread.join().expect("notifier thread panicked")?;

  // The wakeup was consumed, the next wait times out.
  assert!(collect(&*reactor, SHORT)?.is_empty());
  Ok(())
}

pub fn test_multiple_fds<R: Reactor>(reactor: R) -> io::Result<()> {
  let (a1, b1) = socket_pair()?;
  let (a2, b2) = socket_pair()?;
  let (a3, _b3) = socket_pair()?;
  reactor.add(a1.as_raw_fd(), 10, Interest::Read)?;
  reactor.add(a2.as_raw_fd(), 20, Interest::Read)?;
  reactor.add(a3.as_raw_fd(), 30, Interest::Read)?;

  write_bytes(b1.as_raw_fd(), b"one")?;
  write_bytes(b2.as_raw_fd(), b"two")?;

  let mut keys: Vec<u64> = collect(&reactor, LONG)?.into_iter().map(|(key, _)| key).collect();
  keys.sort_unstable();
  assert_eq!(keys, vec![10, 20]);
  Ok(())
}

pub fn test_peer_closed_hangup<R: Reactor>(reactor: R) -> io::Result<()> {
  let (a, b) = socket_pair()?;
  reactor.add(a.as_raw_fd(), 9, Interest::Read)?;
  drop(b);

  let found = collect(&reactor, LONG)?;
  assert_eq!(found.len(), 1);
  assert!(found[0].1.hangup, "peer close reported as hangup");
  Ok(())
}

pub fn test_edge_triggered_no_redelivery<R: Reactor>(reactor: R) -> io::Result<()> {
  let (a, b) = socket_pair()?;
  reactor.add(a.as_raw_fd(), 1, Interest::Read)?;

  write_bytes(b.as_raw_fd(), b"first")?;
  assert_eq!(collect(&reactor, LONG)?.len(), 1);
  // Unread data does not produce a second report.
  assert!(collect(&reactor, SHORT)?.is_empty());

  write_bytes(b.as_raw_fd(), b"second")?;
  assert_eq!(collect(&reactor, LONG)?.len(), 1, "new data is a new edge");
  assert_eq!(read_all(a.as_raw_fd()), "firstsecond".len());
  Ok(())
}

pub fn test_modify_rearms_pending_read<R: Reactor>(reactor: R) -> io::Result<()> {
  let (a, b) = socket_pair()?;
  reactor.add(a.as_raw_fd(), 4, Interest::Read)?;

  write_bytes(b.as_raw_fd(), b"left behind")?;
  assert_eq!(collect(&reactor, LONG)?.len(), 1);
  assert!(collect(&reactor, SHORT)?.is_empty());

  // Re-registering the same interest reports data that is still pending.
  reactor.modify(a.as_raw_fd(), 4, Interest::Read)?;
  let found = collect(&reactor, LONG)?;
  assert_eq!(found.len(), 1);
  assert_eq!(found[0].0, 4);
  assert!(found[0].1.readable);
  Ok(())
}

pub fn test_timeout_no_events<R: Reactor>(reactor: R) -> io::Result<()> {
  let started = std::time::Instant::now();
  assert!(collect(&reactor, Some(Duration::from_millis(30)))?.is_empty());
  assert!(started.elapsed() >= Duration::from_millis(25));
  Ok(())
}

/// Instantiates the conformance tests above for one backend.
///
/// Usage: `generate_tests!(OsReactor::new().unwrap());`
#[macro_export]
macro_rules! generate_tests {
  ($reactor:expr) => {
    $crate::generate_tests!(@each $reactor;
      add_read_no_data,
      read_becomes_ready,
      write_immediately_ready,
      add_twice_fails,
      modify_read_to_write,
      delete_interest,
      delete_unregistered,
      notify_wakes_wait,
      multiple_fds,
      peer_closed_hangup,
      edge_triggered_no_redelivery,
      modify_rearms_pending_read,
      timeout_no_events,
    );
  };
  (@each $reactor:expr; $($name:ident),* $(,)?) => {
    pastey::paste! {
      $(
        #[test]
        fn [<test_ $name>]() {
          let reactor = $reactor;
          $crate::reactor::tests::[<test_ $name>](reactor)
            .expect(concat!("test_", stringify!($name), " failed"));
        }
      )*
    }
  };
}
