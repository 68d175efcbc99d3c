//! Storage strategies for [`Buffer`](crate::buffer::Buffer).
//!
//! Every buffer carries an [`AllocatorRef`] and returns its block to the same
//! allocator on release. [`SystemAllocator`] goes straight to the global heap;
//! [`BufferPool`] recycles blocks per power-of-two size class and can be
//! trimmed periodically so idle memory does not stay pinned forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::sync::Mutex;

/// Smallest block handed out for a non-empty request.
pub const MIN_CAPACITY: usize = 16;

/// Number of power-of-two classes tracked by [`BufferPool`] (16 B .. 2 GiB).
const CLASSES: usize = 28;

/// Allocation strategy.
///
/// `alloc` receives a capacity already rounded by [`round_capacity`] and must
/// return a block of exactly that length. `free` takes back a block previously
/// returned by `alloc`.
pub trait Allocator: Send + Sync {
  fn alloc(&self, capacity: usize) -> Box<[u8]>;
  fn free(&self, block: Box<[u8]>);
}

pub type AllocatorRef = Arc<dyn Allocator>;

/// Rounds a requested size to the capacity actually allocated.
///
/// `0` stays `0`, anything up to [`MIN_CAPACITY`] becomes `MIN_CAPACITY`,
/// everything else goes to the next power of two. Sizes past the largest
/// representable power of two are kept as-is.
pub fn round_capacity(size: usize) -> usize {
  match size {
    0 => 0,
    1..=MIN_CAPACITY => MIN_CAPACITY,
    _ => size.checked_next_power_of_two().unwrap_or(size),
  }
}

static SYSTEM: LazyLock<AllocatorRef> =
  LazyLock::new(|| Arc::new(SystemAllocator));

/// Process-wide default allocator.
pub fn system() -> AllocatorRef {
  Arc::clone(&SYSTEM)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
  fn alloc(&self, capacity: usize) -> Box<[u8]> {
    vec![0u8; capacity].into_boxed_slice()
  }

  fn free(&self, block: Box<[u8]>) {
    drop(block);
  }
}

#[derive(Default)]
struct SizeClass {
  blocks: Vec<Box<[u8]>>,
  /// Lowest free-list length seen since the last trim: that many blocks were
  /// never needed during the period.
  low_water: usize,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
  /// Allocations served from a free list.
  pub hits: u64,
  /// Allocations that had to reach the system heap.
  pub misses: u64,
  /// Blocks currently parked in the pool.
  pub pooled: usize,
  /// Blocks released back to the heap by [`BufferPool::trim`].
  pub trimmed: u64,
}

/// Recycling allocator with one free list per power-of-two capacity.
pub struct BufferPool {
  classes: Vec<Mutex<SizeClass>>,
  hits: AtomicU64,
  misses: AtomicU64,
  trimmed: AtomicU64,
}

impl Default for BufferPool {
  fn default() -> Self {
    Self::new()
  }
}

impl BufferPool {
  pub fn new() -> Self {
    Self {
      classes: (0..CLASSES).map(|_| Mutex::new(SizeClass::default())).collect(),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      trimmed: AtomicU64::new(0),
    }
  }

  fn class_of(capacity: usize) -> Option<usize> {
    if capacity < MIN_CAPACITY || !capacity.is_power_of_two() {
      return None;
    }
    let index = (capacity.trailing_zeros() - MIN_CAPACITY.trailing_zeros()) as usize;
    (index < CLASSES).then_some(index)
  }

  /// Releases the blocks that stayed unused since the previous call and
  /// returns how many were released.
  pub fn trim(&self) -> usize {
    let mut released = 0;
    for class in &self.classes {
      let mut class = class.lock();
      let idle = class.low_water.min(class.blocks.len());
      if idle > 0 {
        class.blocks.drain(..idle);
        class.blocks.shrink_to_fit();
        released += idle;
      }
      class.low_water = class.blocks.len();
    }
    if released > 0 {
      self.trimmed.fetch_add(released as u64, Ordering::Relaxed);
      debug!(released, "buffer pool trimmed");
    }
    released
  }

  pub fn stats(&self) -> PoolStats {
    PoolStats {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      pooled: self.classes.iter().map(|c| c.lock().blocks.len()).sum(),
      trimmed: self.trimmed.load(Ordering::Relaxed),
    }
  }

  /// Spawns a thread calling [`trim`](Self::trim) every `interval`.
  ///
  /// The thread stops when the returned handle is dropped.
  pub fn start_trimming(self: &Arc<Self>, interval: Duration) -> Trimmer {
    let (stop, stopped) = crossbeam_channel::bounded::<()>(1);
    let pool = Arc::clone(self);
    let thread = thread::Builder::new()
      .name("iosock-pool-trim".into())
      .spawn(move || trim_loop(&pool, &stopped, interval))
      .ok();
    Trimmer { stop: Some(stop), thread }
  }
}

fn trim_loop(pool: &BufferPool, stopped: &Receiver<()>, interval: Duration) {
  loop {
    match stopped.recv_timeout(interval) {
      Err(RecvTimeoutError::Timeout) => {
        pool.trim();
      }
      Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
    }
  }
}

impl Allocator for BufferPool {
  fn alloc(&self, capacity: usize) -> Box<[u8]> {
    if let Some(index) = Self::class_of(capacity) {
      let mut class = self.classes[index].lock();
      if let Some(mut block) = class.blocks.pop() {
        class.low_water = class.low_water.min(class.blocks.len());
        drop(class);
        self.hits.fetch_add(1, Ordering::Relaxed);
        block.fill(0);
        return block;
      }
    }
    self.misses.fetch_add(1, Ordering::Relaxed);
    vec![0u8; capacity].into_boxed_slice()
  }

  fn free(&self, block: Box<[u8]>) {
    match Self::class_of(block.len()) {
      Some(index) => {
        trace!(capacity = block.len(), "block returned to pool");
        self.classes[index].lock().blocks.push(block);
      }
      None => drop(block),
    }
  }
}

/// Handle of the background trimming thread started by
/// [`BufferPool::start_trimming`].
pub struct Trimmer {
  stop: Option<Sender<()>>,
  thread: Option<JoinHandle<()>>,
}

impl Trimmer {
  pub fn is_running(&self) -> bool {
    self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
  }
}

impl Drop for Trimmer {
  fn drop(&mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.try_send(());
    }
    if let Some(thread) = self.thread.take() {
      let _ = thread.join();
    }
  }
}
