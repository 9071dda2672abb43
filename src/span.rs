//! Spans: runs of contiguous pages, and the intrusive lists that hold them.
//!
//! All address arithmetic on span memory (carving into slots, slot
//! boundaries) stays inside this module.

use core::{
  marker::PhantomData,
  ptr::{NonNull, null_mut},
};

use crate::{PAGE_SHIFT, PAGE_SIZE};

/// A free object slot. The link lives in the first word of the slot itself.
#[repr(C)]
pub struct FreeObject {
  pub next: *mut FreeObject,
}

/// A detached, null-terminated chain of free objects.
#[derive(Clone, Copy, Debug)]
pub struct ObjectRun {
  pub start: NonNull<FreeObject>,
  pub end: NonNull<FreeObject>,
  pub count: usize,
}

/// Page-run metadata. Lives in an object pool, never inside the pages it
/// describes.
#[derive(Debug)]
pub struct Span {
  /// First page number (`address >> PAGE_SHIFT`).
  pub page_id: usize,
  pub page_count: usize,
  /// Size of the objects carved from this span; 0 while raw. For oversized
  /// spans, the byte length of the allocation.
  pub object_size: usize,
  /// Objects currently leased to thread caches.
  pub use_count: usize,
  /// Unleased objects.
  pub free_list: *mut FreeObject,
  pub prev: *mut Span,
  pub next: *mut Span,
  /// Owned by the central cache or an oversized allocation.
  pub in_use: bool,
  /// Backs one oversized allocation; its pages go straight back to the OS.
  pub oversized: bool,
}

impl Span {
  pub const fn new(page_id: usize, page_count: usize) -> Self {
    Self {
      page_id,
      page_count,
      object_size: 0,
      use_count: 0,
      free_list: null_mut(),
      prev: null_mut(),
      next: null_mut(),
      in_use: false,
      oversized: false,
    }
  }

  #[inline]
  pub fn start(&self) -> *mut u8 {
    (self.page_id << PAGE_SHIFT) as *mut u8
  }

  #[inline]
  pub fn byte_len(&self) -> usize {
    self.page_count << PAGE_SHIFT
  }

  /// Page number one past the end.
  #[inline]
  pub fn end_page(&self) -> usize {
    self.page_id + self.page_count
  }

  #[inline]
  pub fn last_page(&self) -> usize {
    self.end_page() - 1
  }

  /// Splits the whole span into `size`-byte slots linked in address order.
  /// A tail shorter than `size` is left unused. Returns the slot count.
  ///
  /// # Safety
  /// The span's pages must be mapped and exclusively owned by the caller.
  pub unsafe fn carve(&mut self, size: usize) -> usize {
    debug_assert!(size >= size_of::<FreeObject>());
    debug_assert!(self.use_count == 0 && self.free_list.is_null());

    let count = self.byte_len() / size;
    debug_assert!(
      count > 0,
      "span of {} pages cannot hold a {size}-byte object",
      self.page_count
    );

    let base = self.start();
    let mut tail: *mut FreeObject = null_mut();
    // Link back to front so the head ends up at the lowest address.
    for i in (0..count).rev() {
      let slot = unsafe { base.add(i * size) } as *mut FreeObject;
      unsafe { (*slot).next = tail };
      tail = slot;
    }

    self.free_list = tail;
    self.object_size = size;
    count
  }

  /// Detaches up to `batch` objects from the free list and leases them.
  ///
  /// Goes through the raw pointer: frees of other objects read the span's
  /// fixed fields without a lock while the bucket owner runs this.
  ///
  /// # Safety
  /// The caller holds the bucket lock of `span` and its free list is well
  /// formed.
  pub unsafe fn take_batch(span: NonNull<Span>, batch: usize) -> Option<ObjectRun> {
    debug_assert!(batch > 0);
    let span = span.as_ptr();
    unsafe {
      let start = NonNull::new((*span).free_list)?;
      let mut end = start;
      let mut count = 1;
      while count < batch {
        let Some(next) = NonNull::new((*end.as_ptr()).next) else {
          break;
        };
        end = next;
        count += 1;
      }
      (*span).free_list = (*end.as_ptr()).next;
      (*end.as_ptr()).next = null_mut();
      (*span).use_count += count;
      Some(ObjectRun { start, end, count })
    }
  }

  /// Takes a leased object back. Returns the leases still outstanding.
  ///
  /// # Safety
  /// The caller holds the bucket lock of `span`, and `obj` is one of its
  /// slots that is currently leased.
  pub unsafe fn give_back(span: NonNull<Span>, obj: NonNull<FreeObject>) -> usize {
    let span = span.as_ptr();
    unsafe {
      debug_assert!((*span).use_count > 0, "span {:#x}: use_count underflow", (*span).page_id);
      (*obj.as_ptr()).next = (*span).free_list;
      (*span).free_list = obj.as_ptr();
      (*span).use_count -= 1;
      (*span).use_count
    }
  }

  /// Whether `addr` is the first byte of one of this span's slots.
  #[cfg(test)]
  pub fn is_slot_start(&self, addr: usize) -> bool {
    let base = self.start() as usize;
    self.object_size != 0
      && addr >= base
      && addr < base + self.byte_len()
      && (addr - base) % self.object_size == 0
  }
}

/// Page number holding `addr`.
#[inline]
pub const fn page_of(addr: usize) -> usize {
  addr >> PAGE_SHIFT
}

/// Number of pages needed to hold `bytes`.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
  bytes.div_ceil(PAGE_SIZE)
}

/// Intrusive doubly linked list of spans, front insertion. The owning cache
/// guards it with a mutex.
pub struct SpanList {
  head: *mut Span,
  len: usize,
}

// Spans are only reached through the mutex that wraps the list.
unsafe impl Send for SpanList {}

impl Default for SpanList {
  fn default() -> Self {
    Self::new()
  }
}

impl SpanList {
  pub const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  /// # Safety
  /// `span` must be valid and not linked into any list.
  pub unsafe fn push_front(&mut self, span: NonNull<Span>) {
    let span = span.as_ptr();
    unsafe {
      debug_assert!((*span).prev.is_null() && (*span).next.is_null());
      (*span).prev = null_mut();
      (*span).next = self.head;
      if !self.head.is_null() {
        (*self.head).prev = span;
      }
    }
    self.head = span;
    self.len += 1;
  }

  pub fn pop_front(&mut self) -> Option<NonNull<Span>> {
    let span = NonNull::new(self.head)?;
    unsafe { self.erase(span) };
    Some(span)
  }

  /// Unlinks `span`.
  ///
  /// # Safety
  /// `span` must currently be linked into this list.
  pub unsafe fn erase(&mut self, span: NonNull<Span>) {
    let span = span.as_ptr();
    unsafe {
      let prev = (*span).prev;
      let next = (*span).next;
      if prev.is_null() {
        debug_assert!(self.head == span, "erase: span not in this list");
        self.head = next;
      } else {
        (*prev).next = next;
      }
      if !next.is_null() {
        (*next).prev = prev;
      }
      (*span).prev = null_mut();
      (*span).next = null_mut();
    }
    self.len -= 1;
  }

  pub fn iter(&self) -> SpanIter<'_> {
    SpanIter {
      cursor: self.head,
      _list: PhantomData,
    }
  }
}

pub struct SpanIter<'a> {
  cursor: *mut Span,
  _list: PhantomData<&'a SpanList>,
}

impl Iterator for SpanIter<'_> {
  type Item = NonNull<Span>;

  fn next(&mut self) -> Option<NonNull<Span>> {
    let span = NonNull::new(self.cursor)?;
    self.cursor = unsafe { (*span.as_ptr()).next };
    Some(span)
  }
}
