//! Lock used throughout the crate.
//!
//! With the `parking_lot` feature this is `parking_lot::Mutex`. Otherwise a thin
//! wrapper over `std::sync::Mutex` that ignores poisoning: a panicking consumer
//! callback must not wedge every socket sharing the dispatcher.

#[cfg(feature = "parking_lot")]
pub use parking_lot::{Mutex, MutexGuard};

#[cfg(not(feature = "parking_lot"))]
pub use self::std_mutex::{Mutex, MutexGuard};

#[cfg(not(feature = "parking_lot"))]
mod std_mutex {
  use std::ops::{Deref, DerefMut};
  use std::sync::{self, TryLockError};

  #[derive(Default)]
  pub struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
  }

  pub struct MutexGuard<'a, T: ?Sized> {
    inner: sync::MutexGuard<'a, T>,
  }

  impl<T> Mutex<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
      Self { inner: sync::Mutex::new(value) }
    }
  }

  impl<T: ?Sized> Mutex<T> {
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
      MutexGuard { inner: self.inner.lock().unwrap_or_else(|e| e.into_inner()) }
    }

    /// Returns `None` only when another thread holds the lock.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
      match self.inner.try_lock() {
        Ok(inner) => Some(MutexGuard { inner }),
        Err(TryLockError::Poisoned(e)) => Some(MutexGuard { inner: e.into_inner() }),
        Err(TryLockError::WouldBlock) => None,
      }
    }
  }

  impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
      &self.inner
    }
  }

  impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
      &mut self.inner
    }
  }
}
