//! Growable owned byte storage.
//!
//! A [`Buffer`] keeps a logical window `[offset, offset + size)` over a block
//! obtained from its [`Allocator`](crate::alloc::Allocator). Clipping the front
//! only moves the window; growth rounds the block to a power of two.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};

use crate::alloc::{self, AllocatorRef, round_capacity};

pub struct Buffer {
  block: Box<[u8]>,
  offset: usize,
  size: usize,
  fixed: bool,
  allocator: AllocatorRef,
}

impl Buffer {
  /// Buffer of `size` zeroed bytes from the system allocator.
  pub fn new(size: usize) -> Self {
    Self::new_in(size, alloc::system())
  }

  pub fn new_in(size: usize, allocator: AllocatorRef) -> Self {
    let block = match round_capacity(size) {
      0 => Box::default(),
      capacity => allocator.alloc(capacity),
    };
    Self { block, offset: 0, size, fixed: false, allocator }
  }

  pub fn from_slice(data: &[u8]) -> Self {
    Self::from_slice_in(data, alloc::system())
  }

  pub fn from_slice_in(data: &[u8], allocator: AllocatorRef) -> Self {
    let mut buffer = Self::new_in(data.len(), allocator);
    buffer.copy_from_slice(data);
    buffer
  }

  /// Wraps caller supplied storage. The size starts at the full block length
  /// and the buffer can never grow past it.
  pub fn fixed(block: Box<[u8]>) -> Self {
    let size = block.len();
    Self { block, offset: 0, size, fixed: true, allocator: alloc::system() }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.size
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.size == 0
  }

  /// Bytes available from the current start without reallocating.
  #[inline]
  pub fn capacity(&self) -> usize {
    self.block.len() - self.offset
  }

  #[inline]
  pub fn is_fixed(&self) -> bool {
    self.fixed
  }

  pub fn allocator(&self) -> &AllocatorRef {
    &self.allocator
  }

  #[inline]
  pub fn as_slice(&self) -> &[u8] {
    &self.block[self.offset..self.offset + self.size]
  }

  #[inline]
  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    &mut self.block[self.offset..self.offset + self.size]
  }

  /// Sets the logical size.
  ///
  /// Shrinking, or growing within capacity, never reallocates. A clipped front
  /// is reclaimed when it is in the way (or always when `preserve` is false).
  /// With `preserve` the current bytes survive a reallocation or reclaim.
  ///
  /// # Panics
  ///
  /// Growing a [`fixed`](Self::fixed) buffer past its block.
  pub fn resize(&mut self, size: usize, preserve: bool) -> &mut Self {
    if size <= self.capacity() {
      if self.offset > 0 && !preserve {
        self.offset = 0;
      }
      self.size = size;
      return self;
    }

    if self.offset > 0 {
      if preserve {
        self.block.copy_within(self.offset..self.offset + self.size, 0);
      }
      self.offset = 0;
      if size <= self.capacity() {
        self.size = size;
        return self;
      }
    }

    assert!(
      !self.fixed,
      "fixed buffer of {} bytes cannot grow to {size}",
      self.block.len()
    );

    let mut block = self.allocator.alloc(round_capacity(size));
    if preserve {
      block[..self.size].copy_from_slice(&self.block[..self.size]);
    }
    let old = mem::replace(&mut self.block, block);
    self.release(old);
    self.size = size;
    self
  }

  /// Drops `count` bytes from the front without copying.
  pub fn clip(&mut self, count: usize) -> &mut Self {
    if count >= self.size {
      return self.clear();
    }
    self.offset += count;
    self.size -= count;
    self
  }

  pub fn append(&mut self, data: &[u8]) -> &mut Self {
    let start = self.size;
    self.resize(start + data.len(), true);
    self.as_mut_slice()[start..].copy_from_slice(data);
    self
  }

  pub fn append_fill(&mut self, count: usize, byte: u8) -> &mut Self {
    let start = self.size;
    self.resize(start + count, true);
    self.as_mut_slice()[start..].fill(byte);
    self
  }

  pub fn clear(&mut self) -> &mut Self {
    self.resize(0, false)
  }

  fn release(&self, block: Box<[u8]>) {
    #[cfg(feature = "zeroize")]
    let block = {
      let mut block = block;
      zeroize::Zeroize::zeroize(&mut block[..]);
      block
    };

    if !block.is_empty() && !self.fixed {
      self.allocator.free(block);
    }
  }
}

impl Drop for Buffer {
  fn drop(&mut self) {
    let block = mem::take(&mut self.block);
    self.release(block);
  }
}

impl Default for Buffer {
  fn default() -> Self {
    Self::new(0)
  }
}

impl Clone for Buffer {
  fn clone(&self) -> Self {
    Self::from_slice_in(self.as_slice(), self.allocator.clone())
  }
}

impl Deref for Buffer {
  type Target = [u8];

  #[inline]
  fn deref(&self) -> &[u8] {
    self.as_slice()
  }
}

impl DerefMut for Buffer {
  #[inline]
  fn deref_mut(&mut self) -> &mut [u8] {
    self.as_mut_slice()
  }
}

impl AsRef<[u8]> for Buffer {
  fn as_ref(&self) -> &[u8] {
    self.as_slice()
  }
}

impl AsMut<[u8]> for Buffer {
  fn as_mut(&mut self) -> &mut [u8] {
    self.as_mut_slice()
  }
}

impl fmt::Debug for Buffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Buffer")
      .field("len", &self.size)
      .field("capacity", &self.capacity())
      .field("offset", &self.offset)
      .field("fixed", &self.fixed)
      .finish()
  }
}
