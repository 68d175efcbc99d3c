//! Zero-copy byte views.
//!
//! A [`Packet`] is an immutable `(data, len)` window. It either borrows memory
//! owned by the caller (*unbuffered*, bounded by `'a`) or holds an `Arc` to an
//! owned [`ByteStore`] (*buffered*, `'static`). Moving the window, slicing or
//! cloning a buffered packet never copies bytes; turning an unbuffered packet
//! into a buffered one ([`Packet::bufferize`]) is the only operation that
//! allocates.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, AddAssign, Deref, Sub, SubAssign};
use std::sync::Arc;

use crate::alloc::{self, AllocatorRef};
use crate::buffer::Buffer;

/// Owned, immutable byte storage a buffered [`Packet`] can point into.
pub trait ByteStore: Send + Sync + 'static {
  fn bytes(&self) -> &[u8];
}

pub type Store = Arc<dyn ByteStore>;

impl ByteStore for Buffer {
  fn bytes(&self) -> &[u8] {
    self.as_slice()
  }
}

impl ByteStore for Vec<u8> {
  fn bytes(&self) -> &[u8] {
    self
  }
}

impl ByteStore for Box<[u8]> {
  fn bytes(&self) -> &[u8] {
    self
  }
}

impl ByteStore for String {
  fn bytes(&self) -> &[u8] {
    self.as_bytes()
  }
}

impl ByteStore for &'static [u8] {
  fn bytes(&self) -> &[u8] {
    self
  }
}

#[cfg(feature = "bytes")]
impl ByteStore for bytes::Bytes {
  fn bytes(&self) -> &[u8] {
    self
  }
}

#[derive(Clone)]
enum Repr<'a> {
  Borrowed(&'a [u8]),
  Shared { store: Store, offset: usize, len: usize },
}

#[derive(Clone)]
pub struct Packet<'a> {
  repr: Repr<'a>,
}

impl<'a> Packet<'a> {
  /// Empty, unbuffered packet.
  pub const fn new() -> Self {
    Self { repr: Repr::Borrowed(&[]) }
  }

  /// Views caller owned bytes without copying.
  pub const fn borrowed(data: &'a [u8]) -> Self {
    Self { repr: Repr::Borrowed(data) }
  }

  /// Views the whole content of `store`.
  pub fn from_shared(store: Store) -> Packet<'static> {
    let len = store.bytes().len();
    Packet::with_range(store, 0, len)
  }

  /// Views `len` bytes of `store` starting at `offset`, clamped to the store.
  pub fn with_range(store: Store, offset: usize, len: usize) -> Packet<'static> {
    let total = store.bytes().len();
    if total == 0 {
      return Packet::new();
    }
    let offset = offset.min(total);
    let len = len.min(total - offset);
    Packet { repr: Repr::Shared { store, offset, len } }
  }

  #[inline]
  pub fn data(&self) -> &[u8] {
    match &self.repr {
      Repr::Borrowed(data) => *data,
      Repr::Shared { store, offset, len } => &store.bytes()[*offset..*offset + *len],
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    match &self.repr {
      Repr::Borrowed(data) => data.len(),
      Repr::Shared { len, .. } => *len,
    }
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Whether the packet holds a shared store (and is therefore `'static`-able
  /// without copying).
  pub fn is_buffered(&self) -> bool {
    matches!(self.repr, Repr::Shared { .. })
  }

  pub fn buffer(&self) -> Option<&Store> {
    match &self.repr {
      Repr::Shared { store, .. } => Some(store),
      Repr::Borrowed(_) => None,
    }
  }

  /// Number of packets (and other handles) sharing the store, `0` when
  /// unbuffered.
  pub fn store_count(&self) -> usize {
    self.buffer().map_or(0, Arc::strong_count)
  }

  /// Sub-view of `len` bytes starting `offset` bytes in, clamped to this view.
  pub fn slice(&self, offset: usize, len: usize) -> Packet<'a> {
    let mut packet = self.clone();
    packet.narrow(offset, len);
    packet
  }

  /// Moves the start forward by `count` bytes.
  pub fn clip(&mut self, count: usize) -> &mut Self {
    let len = self.len();
    self.narrow(count, len);
    self
  }

  /// Keeps at most the first `available` bytes.
  pub fn shrink(&mut self, available: usize) -> &mut Self {
    self.narrow(0, available);
    self
  }

  /// Drops the view and any store reference.
  pub fn reset(&mut self) -> &mut Self {
    self.repr = Repr::Borrowed(&[]);
    self
  }

  fn narrow(&mut self, start: usize, count: usize) {
    let current = self.len();
    let start = start.min(current);
    let count = count.min(current - start);
    match &mut self.repr {
      Repr::Borrowed(data) => {
        let view: &'a [u8] = *data;
        *data = &view[start..start + count];
      }
      Repr::Shared { offset, len, .. } => {
        *offset += start;
        *len = count;
      }
    }
  }

  /// Length of the common prefix of both views.
  pub fn identical_bytes(&self, other: &Packet<'_>) -> usize {
    self.data().iter().zip(other.data()).take_while(|(a, b)| a == b).count()
  }

  /// Copies the viewed bytes into a new [`Buffer`] unless the packet already
  /// holds a store, then returns the store.
  ///
  /// Empty packets have nothing worth sharing and stay unbuffered.
  pub fn bufferize(&mut self) -> Option<&Store> {
    self.bufferize_in(&alloc::system())
  }

  pub fn bufferize_in(&mut self, allocator: &AllocatorRef) -> Option<&Store> {
    if let Repr::Borrowed(data) = self.repr {
      if data.is_empty() {
        return None;
      }
      let store: Store = Arc::new(Buffer::from_slice_in(data, allocator.clone()));
      self.repr = Repr::Shared { store, offset: 0, len: data.len() };
    }
    self.buffer()
  }

  /// Bufferizes in place and returns a second packet sharing the same store.
  ///
  /// This is how a transient packet is handed to something that outlives the
  /// caller's memory: afterwards both packets point into one owned store.
  pub fn share(&mut self) -> Packet<'static> {
    self.bufferize();
    match &self.repr {
      Repr::Shared { store, offset, len } => Packet {
        repr: Repr::Shared { store: store.clone(), offset: *offset, len: *len },
      },
      Repr::Borrowed(_) => Packet::new(),
    }
  }

  /// Owned version of this packet; copies only when unbuffered.
  pub fn into_owned(mut self) -> Packet<'static> {
    self.share()
  }

  pub fn to_vec(&self) -> Vec<u8> {
    self.data().to_vec()
  }
}

impl Default for Packet<'_> {
  fn default() -> Self {
    Self::new()
  }
}

impl Deref for Packet<'_> {
  type Target = [u8];

  #[inline]
  fn deref(&self) -> &[u8] {
    self.data()
  }
}

impl AsRef<[u8]> for Packet<'_> {
  fn as_ref(&self) -> &[u8] {
    self.data()
  }
}

impl AddAssign<usize> for Packet<'_> {
  fn add_assign(&mut self, count: usize) {
    self.clip(count);
  }
}

impl SubAssign<usize> for Packet<'_> {
  fn sub_assign(&mut self, count: usize) {
    let len = self.len();
    self.shrink(len.saturating_sub(count));
  }
}

impl<'a> Add<usize> for &Packet<'a> {
  type Output = Packet<'a>;

  fn add(self, count: usize) -> Packet<'a> {
    let mut packet = self.clone();
    packet += count;
    packet
  }
}

impl<'a> Add<usize> for Packet<'a> {
  type Output = Packet<'a>;

  fn add(mut self, count: usize) -> Packet<'a> {
    self += count;
    self
  }
}

impl<'a> Sub<usize> for &Packet<'a> {
  type Output = Packet<'a>;

  fn sub(self, count: usize) -> Packet<'a> {
    let mut packet = self.clone();
    packet -= count;
    packet
  }
}

impl<'a> Sub<usize> for Packet<'a> {
  type Output = Packet<'a>;

  fn sub(mut self, count: usize) -> Packet<'a> {
    self -= count;
    self
  }
}

impl PartialEq for Packet<'_> {
  fn eq(&self, other: &Self) -> bool {
    self.len() == other.len() && self.data() == other.data()
  }
}

impl Eq for Packet<'_> {}

impl PartialEq<[u8]> for Packet<'_> {
  fn eq(&self, other: &[u8]) -> bool {
    self.data() == other
  }
}

impl PartialEq<&[u8]> for Packet<'_> {
  fn eq(&self, other: &&[u8]) -> bool {
    self.data() == *other
  }
}

impl<const N: usize> PartialEq<&[u8; N]> for Packet<'_> {
  fn eq(&self, other: &&[u8; N]) -> bool {
    self.data() == &other[..]
  }
}

impl PartialOrd for Packet<'_> {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

/// Shorter packets sort first; equal lengths compare bytewise.
impl Ord for Packet<'_> {
  fn cmp(&self, other: &Self) -> Ordering {
    self.len().cmp(&other.len()).then_with(|| self.data().cmp(other.data()))
  }
}

impl Hash for Packet<'_> {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.data().hash(state);
  }
}

impl fmt::Debug for Packet<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Packet")
      .field("len", &self.len())
      .field("buffered", &self.is_buffered())
      .finish()
  }
}

impl<'a> From<&'a [u8]> for Packet<'a> {
  fn from(data: &'a [u8]) -> Self {
    Packet::borrowed(data)
  }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Packet<'a> {
  fn from(data: &'a [u8; N]) -> Self {
    Packet::borrowed(data)
  }
}

impl<'a> From<&'a str> for Packet<'a> {
  fn from(data: &'a str) -> Self {
    Packet::borrowed(data.as_bytes())
  }
}

impl<'a> From<&'a Buffer> for Packet<'a> {
  fn from(buffer: &'a Buffer) -> Self {
    Packet::borrowed(buffer.as_slice())
  }
}

impl<'a> From<&'a Vec<u8>> for Packet<'a> {
  fn from(data: &'a Vec<u8>) -> Self {
    Packet::borrowed(data)
  }
}

impl From<Store> for Packet<'static> {
  fn from(store: Store) -> Self {
    Packet::from_shared(store)
  }
}

macro_rules! capture {
  ($($owned:ty),*) => {$(
    /// Captures the owned value as the packet's store, without copying.
    impl From<$owned> for Packet<'static> {
      fn from(owned: $owned) -> Self {
        Packet::from_shared(Arc::new(owned))
      }
    }
  )*};
}

capture!(Buffer, Vec<u8>, Box<[u8]>, String);

#[cfg(feature = "bytes")]
capture!(bytes::Bytes);
