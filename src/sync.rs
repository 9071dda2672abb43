//! Blocking mutex that never allocates.
//!
//! `std::sync::Mutex` is off limits inside a global allocator on every
//! platform we care about, so the locks guarding central buckets and the page
//! cache are built on a futex word (Linux) or a spin/yield loop elsewhere.

use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicU32, Ordering},
};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
/// Locked, and at least one thread may be parked on the word.
const CONTENDED: u32 = 2;

/// Spins before parking; bucket critical sections are short.
const SPIN_LIMIT: u32 = 64;

struct RawLock {
  state: AtomicU32,
}

impl RawLock {
  const fn new() -> Self {
    Self {
      state: AtomicU32::new(UNLOCKED),
    }
  }

  #[inline]
  fn try_lock(&self) -> bool {
    self
      .state
      .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  #[inline]
  fn lock(&self) {
    if !self.try_lock() {
      self.lock_contended();
    }
  }

  #[cold]
  fn lock_contended(&self) {
    let mut spins = 0;
    while spins < SPIN_LIMIT {
      if self.state.load(Ordering::Relaxed) == UNLOCKED && self.try_lock() {
        return;
      }
      hint::spin_loop();
      spins += 1;
    }

    while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
      park(&self.state);
    }
  }

  #[inline]
  fn unlock(&self) {
    if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
      unpark_one(&self.state);
    }
  }
}

#[cfg(target_os = "linux")]
fn park(word: &AtomicU32) {
  unsafe {
    libc::syscall(
      libc::SYS_futex,
      word as *const AtomicU32,
      libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
      CONTENDED,
      core::ptr::null::<libc::timespec>(),
    );
  }
}

#[cfg(target_os = "linux")]
fn unpark_one(word: &AtomicU32) {
  unsafe {
    libc::syscall(
      libc::SYS_futex,
      word as *const AtomicU32,
      libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
      1,
    );
  }
}

#[cfg(not(target_os = "linux"))]
fn park(word: &AtomicU32) {
  while word.load(Ordering::Relaxed) == CONTENDED {
    std::thread::yield_now();
  }
}

#[cfg(not(target_os = "linux"))]
fn unpark_one(_word: &AtomicU32) {}

/// Mutual exclusion around `T`, released when the guard drops.
pub struct Mutex<T> {
  raw: RawLock,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
  pub const fn new(data: T) -> Self {
    Self {
      raw: RawLock::new(),
      data: UnsafeCell::new(data),
    }
  }

  pub fn lock(&self) -> MutexGuard<'_, T> {
    self.raw.lock();
    MutexGuard { mutex: self }
  }

  #[cfg(test)]
  pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
    if self.raw.try_lock() {
      Some(MutexGuard { mutex: self })
    } else {
      None
    }
  }
}

pub struct MutexGuard<'a, T> {
  mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.mutex.data.get() }
  }
}

impl<T> DerefMut for MutexGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.mutex.data.get() }
  }
}

impl<T> Drop for MutexGuard<'_, T> {
  fn drop(&mut self) {
    self.mutex.raw.unlock();
  }
}
