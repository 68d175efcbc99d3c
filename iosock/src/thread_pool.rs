//! Fixed set of worker threads with sticky per-socket affinity.
//!
//! Every worker owns one `crossbeam-channel` queue. A job queued through an
//! [`Affinity`] always lands on the same worker, so work for one socket runs
//! in submission order without extra locking.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Upper bound of the default worker count.
const MAX_DEFAULT_THREADS: usize = 4;

/// Worker slot remembered between jobs. Zero means "not assigned yet".
#[derive(Debug, Default)]
pub struct Affinity(AtomicUsize);

impl Affinity {
  pub const fn new() -> Self {
    Self(AtomicUsize::new(0))
  }

  /// Worker index, once a job has been queued with this affinity.
  pub fn worker(&self) -> Option<usize> {
    match self.0.load(Ordering::Acquire) {
      0 => None,
      slot => Some(slot - 1),
    }
  }
}

struct Worker {
  sender: Option<Sender<Job>>,
  thread: Option<JoinHandle<()>>,
}

pub struct ThreadPool {
  workers: Vec<Worker>,
  next: AtomicUsize,
}

impl ThreadPool {
  /// Spawns `threads` workers, or [`default_threads`](Self::default_threads)
  /// when `threads` is zero.
  pub fn new(threads: usize) -> io::Result<Self> {
    let threads = if threads == 0 { Self::default_threads() } else { threads };

    let mut workers = Vec::with_capacity(threads);
    for index in 0..threads {
      let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
      let thread = thread::Builder::new().name(format!("iosock-worker-{index}")).spawn(move || {
        while let Ok(job) = receiver.recv() {
          job();
        }
      })?;
      workers.push(Worker { sender: Some(sender), thread: Some(thread) });
    }

    tracing::debug!(threads, "thread pool started");
    Ok(Self { workers, next: AtomicUsize::new(0) })
  }

  /// `min(available_parallelism, 4)`, at least one.
  pub fn default_threads() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get()).clamp(1, MAX_DEFAULT_THREADS)
  }

  pub fn threads(&self) -> usize {
    self.workers.len()
  }

  /// Runs `job` on the worker bound to `affinity`, binding one round-robin on
  /// first use. Returns `false` once the pool is shutting down.
  pub fn queue<F>(&self, affinity: &Affinity, job: F) -> bool
  where
    F: FnOnce() + Send + 'static,
  {
    let index = match affinity.worker() {
      Some(index) => index,
      None => {
        let chosen = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        match affinity.0.compare_exchange(0, chosen + 1, Ordering::AcqRel, Ordering::Acquire) {
          Ok(_) => chosen,
          // Another thread bound it first.
          Err(slot) => slot - 1,
        }
      }
    };
    self.send(index % self.workers.len(), Box::new(job))
  }

  /// Runs `job` on the next worker without any affinity.
  pub fn spawn<F>(&self, job: F) -> bool
  where
    F: FnOnce() + Send + 'static,
  {
    let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
    self.send(index, Box::new(job))
  }

  fn send(&self, index: usize, job: Job) -> bool {
    match &self.workers[index].sender {
      Some(sender) => sender.send(job).is_ok(),
      None => false,
    }
  }
}

impl Drop for ThreadPool {
  fn drop(&mut self) {
    // Closing the channels lets every worker finish its backlog and exit.
    for worker in &mut self.workers {
      worker.sender.take();
    }
    let current = thread::current().id();
    for worker in &mut self.workers {
      if let Some(thread) = worker.thread.take() {
        // The last reference can be released from a job on that very worker.
        if thread.thread().id() != current {
          let _ = thread.join();
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::Mutex;
  use std::sync::Arc;
  use std::time::Duration;

  #[test]
  fn test_default_threads_bounded() {
    let threads = ThreadPool::default_threads();
    assert!((1..=MAX_DEFAULT_THREADS).contains(&threads));
    assert_eq!(ThreadPool::new(0).unwrap().threads(), threads);
  }

  #[test]
  fn test_affinity_sticks() {
    let pool = ThreadPool::new(3).unwrap();
    let affinity = Affinity::new();
    assert_eq!(affinity.worker(), None);

    let names = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..10 {
      let names = Arc::clone(&names);
      pool.queue(&affinity, move || {
        names.lock().push(thread::current().name().map(str::to_owned));
      });
    }
    let worker = affinity.worker().unwrap();
    drop(pool);

    let names = names.lock();
    assert_eq!(names.len(), 10);
    assert!(names.iter().all(|name| name.as_deref() == Some(&*format!("iosock-worker-{worker}"))));
  }

  #[test]
  fn test_affinities_spread() {
    let pool = ThreadPool::new(2).unwrap();
    let first = Affinity::new();
    let second = Affinity::new();
    pool.queue(&first, || {});
    pool.queue(&second, || {});
    assert_ne!(first.worker(), second.worker());
  }

  #[test]
  fn test_same_affinity_in_order() {
    let pool = ThreadPool::new(4).unwrap();
    let affinity = Affinity::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for value in 0..200 {
      let seen = Arc::clone(&seen);
      pool.queue(&affinity, move || {
        if value % 50 == 0 {
          thread::sleep(Duration::from_millis(1));
        }
        seen.lock().push(value);
      });
    }
    drop(pool);

    assert_eq!(*seen.lock(), (0..200).collect::<Vec<_>>());
  }

  #[test]
  fn test_drop_runs_backlog() {
    let pool = ThreadPool::new(1).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
      let count = Arc::clone(&count);
      assert!(pool.spawn(move || {
        count.fetch_add(1, Ordering::SeqCst);
      }));
    }
    drop(pool);
    assert_eq!(count.load(Ordering::SeqCst), 50);
  }
}
