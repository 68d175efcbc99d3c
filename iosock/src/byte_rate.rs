use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free bytes-per-second counter.
///
/// Bytes are accumulated with [`add`](Self::add). The visible rate is
/// recomputed at most once per interval (one second by default): when read
/// after the interval elapsed it becomes `bytes * 1000 / elapsed_ms` and the
/// accumulator restarts from zero.
#[derive(Debug)]
pub struct ByteRate {
  bytes: AtomicU64,
  rate: AtomicU64,
  /// Nanoseconds since `base` of the last recomputation.
  time: AtomicU64,
  base: Instant,
  interval: Duration,
}

impl Default for ByteRate {
  fn default() -> Self {
    Self::new()
  }
}

impl ByteRate {
  pub fn new() -> Self {
    Self::with_interval(Duration::from_secs(1))
  }

  pub fn with_interval(interval: Duration) -> Self {
    Self {
      bytes: AtomicU64::new(0),
      rate: AtomicU64::new(0f64.to_bits()),
      time: AtomicU64::new(0),
      base: Instant::now(),
      interval,
    }
  }

  pub fn add(&self, bytes: u64) {
    self.bytes.fetch_add(bytes, Ordering::AcqRel);
  }

  /// Rate in bytes per second, truncated.
  pub fn rate(&self) -> u64 {
    self.exact() as u64
  }

  pub fn exact(&self) -> f64 {
    self.exact_at(Instant::now())
  }

  pub fn exact_at(&self, now: Instant) -> f64 {
    let now = now.saturating_duration_since(self.base).as_nanos() as u64;
    let last = self.time.load(Ordering::Acquire);
    let elapsed = now.saturating_sub(last);

    if elapsed > 0
      && elapsed >= self.interval.as_nanos() as u64
      && self
        .time
        .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
      let bytes = self.bytes.swap(0, Ordering::AcqRel);
      let rate = bytes as f64 * 1e9 / elapsed as f64;
      self.rate.store(rate.to_bits(), Ordering::Release);
    }

    f64::from_bits(self.rate.load(Ordering::Acquire))
  }

  /// Instant the counter was created; reference point for [`exact_at`](Self::exact_at).
  pub fn started(&self) -> Instant {
    self.base
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rate_updates_once_per_interval() {
    let rate = ByteRate::new();
    let start = rate.started();

    rate.add(1000);
    assert_eq!(rate.exact_at(start + Duration::from_millis(500)), 0.0);

    rate.add(1000);
    assert_eq!(rate.exact_at(start + Duration::from_millis(900)), 0.0);

    assert_eq!(rate.exact_at(start + Duration::from_millis(2000)), 1000.0);
  }

  #[test]
  fn test_rate_updates_at_interval_boundary() {
    let rate = ByteRate::new();
    let start = rate.started();

    rate.add(2000);
    assert_eq!(rate.exact_at(start + Duration::from_millis(999)), 0.0);
    assert_eq!(rate.exact_at(start + Duration::from_millis(1000)), 2000.0);
  }

  #[test]
  fn test_rate_holds_between_updates() {
    let rate = ByteRate::new();
    let start = rate.started();

    rate.add(4000);
    assert_eq!(rate.exact_at(start + Duration::from_secs(2)), 2000.0);

    rate.add(1_000_000);
    assert_eq!(rate.exact_at(start + Duration::from_millis(2500)), 2000.0);
    assert_eq!(rate.exact_at(start + Duration::from_secs(4)), 500_000.0);
  }

  #[test]
  fn test_shared_across_threads() {
    let rate = std::sync::Arc::new(ByteRate::with_interval(Duration::ZERO));
    let handles: Vec<_> = (0..4)
      .map(|_| {
        let rate = rate.clone();
        std::thread::spawn(move || {
          for _ in 0..1000 {
            rate.add(1);
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }
    assert!(rate.exact_at(rate.started() + Duration::from_secs(1)) > 0.0);
  }
}
