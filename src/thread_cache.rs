//! Per-thread front end: one free list per size class, no locks.
//!
//! Misses pull a batch from the central cache; the batch ceiling (`max_size`)
//! starts at one and grows by one every time it is used in full, up to the
//! class's `num_move_size`. Frees push locally and hand a `max_size` run back
//! once the list reaches the ceiling.

use core::ptr::{NonNull, null_mut};

use crate::{
  MAX_BYTES, NUM_CLASSES,
  heap::Heap,
  size_class,
  span::{FreeObject, ObjectRun},
};

struct FreeList {
  head: *mut FreeObject,
  len: usize,
  /// Slow-start batch ceiling. Never shrinks.
  max_size: usize,
}

impl FreeList {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
      max_size: 1,
    }
  }

  #[inline]
  unsafe fn push(&mut self, obj: NonNull<FreeObject>) {
    unsafe { (*obj.as_ptr()).next = self.head };
    self.head = obj.as_ptr();
    self.len += 1;
  }

  #[inline]
  fn pop(&mut self) -> Option<NonNull<FreeObject>> {
    let obj = NonNull::new(self.head)?;
    self.head = unsafe { obj.as_ref().next };
    self.len -= 1;
    Some(obj)
  }

  unsafe fn push_range(&mut self, run: ObjectRun) {
    unsafe { (*run.end.as_ptr()).next = self.head };
    self.head = run.start.as_ptr();
    self.len += run.count;
  }

  /// Detaches the first `n` objects (fewer if the list is shorter).
  fn pop_range(&mut self, n: usize) -> Option<ObjectRun> {
    let start = NonNull::new(self.head)?;
    let mut end = start;
    let mut count = 1;
    while count < n {
      let Some(next) = NonNull::new(unsafe { end.as_ref().next }) else {
        break;
      };
      end = next;
      count += 1;
    }
    unsafe {
      self.head = end.as_ref().next;
      (*end.as_ptr()).next = null_mut();
    }
    self.len -= count;
    Some(ObjectRun { start, end, count })
  }
}

pub struct ThreadCache {
  lists: [FreeList; NUM_CLASSES],
}

// Only ever used by one thread at a time; the pool that hands instances out
// moves them across the registry lock.
unsafe impl Send for ThreadCache {}

impl Default for ThreadCache {
  fn default() -> Self {
    Self::new()
  }
}

impl ThreadCache {
  pub const fn new() -> Self {
    Self {
      lists: [const { FreeList::new() }; NUM_CLASSES],
    }
  }

  /// Serves `size` bytes (`1..=MAX_BYTES`) from the local list, refilling
  /// from the central cache on a miss.
  pub(crate) fn allocate(&mut self, heap: &Heap, size: usize) -> Option<NonNull<u8>> {
    debug_assert!(size > 0 && size <= MAX_BYTES, "thread cache size {size}");
    let index = size_class::index(size);
    if let Some(obj) = self.lists[index].pop() {
      return Some(obj.cast());
    }
    self.fetch_from_central_cache(heap, index, size_class::round_up(size))
  }

  #[cold]
  fn fetch_from_central_cache(
    &mut self,
    heap: &Heap,
    index: usize,
    size: usize,
  ) -> Option<NonNull<u8>> {
    let list = &mut self.lists[index];
    let limit = size_class::num_move_size(size);
    let batch = list.max_size.min(limit);
    if batch == list.max_size && list.max_size < limit {
      list.max_size += 1;
    }

    let run = heap.central.fetch_range_obj(&heap.page_cache, batch, size)?;
    let first = run.start;
    if let Some(rest) = NonNull::new(unsafe { first.as_ref().next }) {
      unsafe {
        list.push_range(ObjectRun {
          start: rest,
          end: run.end,
          count: run.count - 1,
        });
      }
    }
    Some(first.cast())
  }

  /// Takes back an object of class size `size`.
  ///
  /// # Safety
  /// `ptr` must be a live object of class size `size` from `heap`.
  pub(crate) unsafe fn deallocate(&mut self, heap: &Heap, ptr: NonNull<u8>, size: usize) {
    let index = size_class::index(size);
    let list = &mut self.lists[index];
    unsafe { list.push(ptr.cast()) };
    if list.len >= list.max_size {
      self.list_too_long(heap, index, size);
    }
  }

  #[cold]
  fn list_too_long(&mut self, heap: &Heap, index: usize, size: usize) {
    let list = &mut self.lists[index];
    let cap = list.max_size;
    if let Some(run) = list.pop_range(cap) {
      unsafe {
        heap
          .central
          .release_list_to_spans(&heap.page_cache, run.start.as_ptr(), size)
      };
    }
  }

  /// Returns every cached object to the central cache. Caps are kept.
  pub fn flush(&mut self, heap: &Heap) {
    for index in 0..NUM_CLASSES {
      let list = &mut self.lists[index];
      let len = list.len;
      if let Some(run) = list.pop_range(len) {
        unsafe {
          heap.central.release_list_to_spans(
            &heap.page_cache,
            run.start.as_ptr(),
            size_class::class_size(index),
          )
        };
      }
    }
  }

  /// Objects cached for size class `index`.
  pub fn free_len(&self, index: usize) -> usize {
    self.lists[index].len
  }

  /// Current batch ceiling for size class `index`.
  pub fn soft_cap(&self, index: usize) -> usize {
    self.lists[index].max_size
  }
}
