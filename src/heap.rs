//! The heap context: one page cache and one central cache, shared by every
//! thread cache that allocates from it.
//!
//! The process-wide allocator owns a single `Heap`; tests and embedders can
//! build private ones and drive them with their own [`ThreadCache`]s.

use core::ptr::NonNull;

use crate::{
  MAX_BYTES, PAGE_SHIFT,
  central_cache::CentralCache,
  page_cache::{PageCache, PageStats},
  size_class,
  span::{Span, pages_for},
  thread_cache::ThreadCache,
};

/// Copy of a span's bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanInfo {
  pub page_id: usize,
  pub page_count: usize,
  /// Class size, or the byte length for oversized spans; 0 while free.
  pub object_size: usize,
  pub use_count: usize,
  pub in_use: bool,
  pub oversized: bool,
}

impl SpanInfo {
  /// # Safety
  /// `span` must be a live record and no other thread may be writing it.
  unsafe fn read(span: NonNull<Span>) -> Self {
    let s = span.as_ptr();
    unsafe {
      Self {
        page_id: (*s).page_id,
        page_count: (*s).page_count,
        object_size: (*s).object_size,
        use_count: (*s).use_count,
        in_use: (*s).in_use,
        oversized: (*s).oversized,
      }
    }
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
  pub pages: PageStats,
  /// Pages of spans linked into central cache buckets.
  pub central_pages: usize,
}

impl Stats {
  /// Every page ever reserved is free, leased, oversized, or released.
  pub fn is_conserved(&self) -> bool {
    let p = &self.pages;
    p.free_pages + p.leased_pages + p.oversized_pages == p.reserved_pages - p.released_pages
  }
}

pub struct Heap {
  pub(crate) page_cache: PageCache,
  pub(crate) central: CentralCache,
}

impl Heap {
  /// `None` if the OS refuses the page map.
  pub fn new() -> Option<Self> {
    Some(Self {
      page_cache: PageCache::new()?,
      central: CentralCache::new(),
    })
  }

  /// At least `size` bytes; size 0 counts as 1. Requests above [`MAX_BYTES`]
  /// bypass both caches. `None` only when the OS is out of memory.
  pub fn allocate(&self, cache: &mut ThreadCache, size: usize) -> Option<NonNull<u8>> {
    let size = size.max(1);
    if size <= MAX_BYTES {
      cache.allocate(self, size)
    } else {
      self.allocate_oversized(size)
    }
  }

  /// Reserves a dedicated span for one allocation of `size` bytes.
  pub(crate) fn allocate_oversized(&self, size: usize) -> Option<NonNull<u8>> {
    if size > isize::MAX as usize {
      return None;
    }
    let pages = pages_for(size_class::round_up(size));
    let span = self.page_cache.lock().new_oversized_span(pages)?;
    NonNull::new(unsafe { span.as_ref() }.start())
  }

  /// Frees `ptr`. Aborts if no span owns it, or if its span is not handing
  /// out objects: a double free that already emptied the span, or a pointer
  /// into free pages.
  ///
  /// # Safety
  /// `ptr` must come from this heap and not have been freed since.
  pub unsafe fn deallocate(&self, cache: &mut ThreadCache, ptr: NonNull<u8>) {
    let span = self.page_cache.map_object_to_span(ptr.as_ptr());
    // Other frees into the same span run concurrently; only fields that stay
    // fixed while it is leased are read, and never through a reference.
    let (in_use, oversized, size) = unsafe {
      let s = span.as_ptr();
      ((*s).in_use, (*s).oversized, (*s).object_size)
    };
    if !in_use || (!oversized && (size == 0 || size > MAX_BYTES)) {
      bad_free();
    }

    if oversized {
      unsafe { self.page_cache.lock().release_span_to_page(span) };
      return;
    }

    #[cfg(feature = "debug-tripwire")]
    tripwire(span, ptr, size);

    unsafe { cache.deallocate(self, ptr, size) };
  }

  /// Bytes usable at `ptr`: its class size, or what is left of an oversized
  /// span past `ptr`. 0 for pointers the heap does not know.
  ///
  /// # Safety
  /// `ptr` must be a live block of this heap or lie outside its pages.
  pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
    let Some(span) = self.page_cache.lookup(ptr) else {
      return 0;
    };
    let s = span.as_ptr();
    let (oversized, size, page_id) = unsafe { ((*s).oversized, (*s).object_size, (*s).page_id) };
    if oversized {
      size - (ptr as usize - (page_id << PAGE_SHIFT))
    } else {
      size
    }
  }

  /// Bookkeeping of the span owning `ptr`.
  ///
  /// # Safety
  /// The heap must be quiescent: no other thread may allocate from it or
  /// free into it until this returns.
  pub unsafe fn span_info(&self, ptr: *const u8) -> Option<SpanInfo> {
    let _pages = self.page_cache.lock();
    let span = self.page_cache.lookup(ptr)?;
    Some(unsafe { SpanInfo::read(span) })
  }

  /// Page accounting. The page lock and the bucket locks are taken one after
  /// the other, never together.
  pub fn stats(&self) -> Stats {
    let pages = self.page_cache.lock().stats();
    Stats {
      pages,
      central_pages: self.central.held_pages(),
    }
  }
}

#[cold]
fn bad_free() -> ! {
  crate::os::abort_with_message("conmalloc: double free or pointer into free pages\n")
}

/// Catches interior pointers and frees into spans carved for another class.
#[cfg(feature = "debug-tripwire")]
#[inline]
fn tripwire(span: NonNull<Span>, ptr: NonNull<u8>, size: usize) {
  let base = unsafe { (*span.as_ptr()).page_id } << PAGE_SHIFT;
  if size != size_class::round_up(size) || (ptr.as_ptr() as usize - base) % size != 0 {
    tripwire_hit();
  }
}

#[cfg(feature = "debug-tripwire")]
#[cold]
fn tripwire_hit() -> ! {
  crate::os::abort_with_message("conmalloc: freed pointer does not match its span\n")
}
