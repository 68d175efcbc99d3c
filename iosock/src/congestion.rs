use std::time::{Duration, Instant};

/// Tracks how long a send queue has kept growing.
///
/// Every change of the queued byte count is fed through [`update`]. The
/// congestion clock starts on the first sample that is larger than the
/// previous one and stops as soon as a sample does not grow anymore.
///
/// [`update`]: Congestion::update
#[derive(Debug, Default, Clone)]
pub struct Congestion {
  last_queueing: u64,
  since: Option<Instant>,
}

impl Congestion {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn update(&mut self, queueing: u64) {
    self.update_at(queueing, Instant::now());
  }

  pub fn update_at(&mut self, queueing: u64, now: Instant) {
    let growing = queueing > 0 && queueing > self.last_queueing;
    self.last_queueing = queueing;
    if !growing {
      self.since = None;
    } else if self.since.is_none() {
      self.since = Some(now);
    }
  }

  /// Elapsed congestion time if it exceeds `threshold`, zero otherwise.
  pub fn congested_for(&self, threshold: Duration) -> Duration {
    self.congested_for_at(threshold, Instant::now())
  }

  pub fn congested_for_at(&self, threshold: Duration, now: Instant) -> Duration {
    match self.since {
      Some(since) => {
        let elapsed = now.saturating_duration_since(since);
        if elapsed > threshold { elapsed } else { Duration::ZERO }
      }
      None => Duration::ZERO,
    }
  }

  pub fn is_congested(&self, threshold: Duration) -> bool {
    !self.congested_for(threshold).is_zero()
  }

  /// Last queued byte count seen.
  pub fn queueing(&self) -> u64 {
    self.last_queueing
  }
}
