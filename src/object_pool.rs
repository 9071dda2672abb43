//! Fixed-size object pool for allocator metadata.
//!
//! Span records, page-map leaves and thread caches cannot come from the heap
//! they describe, so they are bump-allocated from slabs obtained straight from
//! the OS and recycled through an intrusive free list. Slabs are never
//! returned.

use core::{
  marker::PhantomData,
  ptr::{self, NonNull, null_mut},
};

use crate::{PAGE_SHIFT, PAGE_SIZE, align_up, os, span::pages_for};

/// Minimum slab requested from the OS.
const SLAB_BYTES: usize = 128 * 1024;

struct FreeSlot {
  next: *mut FreeSlot,
}

const fn max(a: usize, b: usize) -> usize {
  if a > b { a } else { b }
}

pub struct ObjectPool<T> {
  /// Bump cursor into the current slab.
  cursor: *mut u8,
  remaining: usize,
  free_list: *mut FreeSlot,
  #[cfg(test)]
  slabs: usize,
  _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for ObjectPool<T> {}

impl<T> Default for ObjectPool<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> ObjectPool<T> {
  const SLOT_ALIGN: usize = max(align_of::<T>(), align_of::<FreeSlot>());
  /// Every slot can hold a free-list link, whatever `T` is.
  const SLOT_SIZE: usize = align_up(
    max(size_of::<T>(), size_of::<FreeSlot>()),
    Self::SLOT_ALIGN,
  );
  const SLAB_PAGES: usize = pages_for(max(SLAB_BYTES, Self::SLOT_SIZE));
  const CHECK: () = assert!(Self::SLOT_ALIGN <= PAGE_SIZE);

  pub const fn new() -> Self {
    Self {
      cursor: null_mut(),
      remaining: 0,
      free_list: null_mut(),
      #[cfg(test)]
      slabs: 0,
      _marker: PhantomData,
    }
  }

  /// Hands out an uninitialized slot, or `None` if the OS is out of memory.
  pub fn take(&mut self) -> Option<NonNull<T>> {
    let () = Self::CHECK;

    if let Some(slot) = NonNull::new(self.free_list) {
      self.free_list = unsafe { slot.as_ref().next };
      return Some(slot.cast());
    }

    if self.remaining < Self::SLOT_SIZE {
      let slab = os::reserve(Self::SLAB_PAGES)?;
      self.cursor = slab.as_ptr();
      self.remaining = Self::SLAB_PAGES << PAGE_SHIFT;
      #[cfg(test)]
      {
        self.slabs += 1;
      }
    }

    let obj = self.cursor;
    self.cursor = unsafe { self.cursor.add(Self::SLOT_SIZE) };
    self.remaining -= Self::SLOT_SIZE;
    NonNull::new(obj.cast())
  }

  /// Moves `value` into a pooled slot.
  pub fn create(&mut self, value: T) -> Option<NonNull<T>> {
    let slot = self.take()?;
    unsafe { slot.as_ptr().write(value) };
    Some(slot)
  }

  /// Drops the object in place and recycles its slot.
  ///
  /// # Safety
  /// `obj` must come from this pool, be initialized, and not be used again.
  pub unsafe fn destroy(&mut self, obj: NonNull<T>) {
    unsafe {
      ptr::drop_in_place(obj.as_ptr());
      let slot = obj.cast::<FreeSlot>().as_ptr();
      (*slot).next = self.free_list;
      self.free_list = slot;
    }
  }

  /// Slabs reserved from the OS so far.
  #[cfg(test)]
  pub fn slabs(&self) -> usize {
    self.slabs
  }
}
