use std::io;
use std::time::Duration;

/// `None` means wait forever.
#[cfg_attr(not(kqueue), allow(dead_code))]
pub fn timeout_to_timespec(timeout: Option<Duration>) -> Option<libc::timespec> {
  timeout.map(|duration| libc::timespec {
    tv_sec: duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
    tv_nsec: duration.subsec_nanos() as libc::c_long,
  })
}

/// Milliseconds for `epoll_wait`, `-1` meaning forever. Sub-millisecond
/// timeouts round up so a short wait never becomes a busy poll.
#[cfg_attr(not(epoll), allow(dead_code))]
pub fn timeout_to_millis(timeout: Option<Duration>) -> i32 {
  match timeout {
    None => -1,
    Some(duration) => {
      let mut millis = duration.as_millis();
      if Duration::from_millis(millis as u64) < duration {
        millis += 1;
      }
      millis.min(i32::MAX as u128) as i32
    }
  }
}

/// Deleting something that is not registered is not worth reporting.
#[cfg_attr(not(kqueue), allow(dead_code))]
pub fn is_not_found_error(err: &io::Error) -> bool {
  err.raw_os_error() == Some(libc::ENOENT)
}
