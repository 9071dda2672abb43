//! Page cache: the owner of every span that is not leased to the central
//! cache.
//!
//! Free spans sit in buckets indexed by page count (`1..=MAX_PAGES`). Requests
//! are served from the exact bucket, else by cleaving a larger span, else by
//! growing the heap with a fresh `MAX_PAGES` region from the OS. Released
//! spans are coalesced with free neighbors in both directions.
//!
//! One lock guards all of it. Lookups through the page map do not take it.

use core::ptr::{NonNull, null_mut};

use crate::{
  MAX_PAGES, NUM_PAGE_BUCKETS, PAGE_SHIFT,
  object_pool::ObjectPool,
  os,
  page_map::{Leaf, PageMap},
  span::{Span, SpanList, page_of},
  sync::{Mutex, MutexGuard},
};

/// Page accounting snapshot. All counts are in pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageStats {
  /// Pages ever reserved from the OS, heap growth plus oversized spans.
  pub reserved_pages: usize,
  /// Pages handed back to the OS (oversized spans).
  pub released_pages: usize,
  /// Pages found in the free buckets.
  pub free_pages: usize,
  pub free_spans: usize,
  /// Pages of spans currently leased to the central cache.
  pub leased_pages: usize,
  /// Pages of live oversized allocations.
  pub oversized_pages: usize,
}

struct PageState {
  buckets: [SpanList; NUM_PAGE_BUCKETS],
  spans: ObjectPool<Span>,
  leaves: ObjectPool<Leaf>,
  grown_pages: usize,
  oversized_reserved: usize,
  oversized_released: usize,
  leased_pages: usize,
}

// Span records are only touched with the page lock held.
unsafe impl Send for PageState {}

impl PageState {
  const fn new() -> Self {
    Self {
      buckets: [const { SpanList::new() }; NUM_PAGE_BUCKETS],
      spans: ObjectPool::new(),
      leaves: ObjectPool::new(),
      grown_pages: 0,
      oversized_reserved: 0,
      oversized_released: 0,
      leased_pages: 0,
    }
  }
}

pub struct PageCache {
  map: PageMap,
  state: Mutex<PageState>,
}

impl PageCache {
  /// `None` if the page map root cannot be reserved.
  pub fn new() -> Option<Self> {
    Some(Self {
      map: PageMap::new()?,
      state: Mutex::new(PageState::new()),
    })
  }

  /// Takes the page lock.
  pub fn lock(&self) -> PageCacheGuard<'_> {
    PageCacheGuard {
      map: &self.map,
      state: self.state.lock(),
    }
  }

  /// Span owning the page that holds `ptr`, if any. Lock-free.
  #[inline]
  pub fn lookup(&self, ptr: *const u8) -> Option<NonNull<Span>> {
    self.map.get(page_of(ptr as usize))
  }

  /// Span owning `ptr`. Aborts if the pointer is not ours: either it was
  /// never allocated here or a double free already tore its mapping down.
  #[inline]
  pub fn map_object_to_span(&self, ptr: *const u8) -> NonNull<Span> {
    match self.lookup(ptr) {
      Some(span) => span,
      None => os::abort_with_message("conmalloc: pointer not owned by this heap\n"),
    }
  }
}

/// The page lock, held. Every span-level operation goes through it.
pub struct PageCacheGuard<'a> {
  map: &'a PageMap,
  state: MutexGuard<'a, PageState>,
}

impl PageCacheGuard<'_> {
  /// Returns a span of exactly `k` pages, marked in use and mapped page by
  /// page. `None` only when the OS is out of memory.
  pub fn new_span(&mut self, k: usize) -> Option<NonNull<Span>> {
    debug_assert!(k > 0);
    if k > MAX_PAGES {
      return self.new_oversized_span(k);
    }

    if let Some(span) = self.state.buckets[k].pop_front() {
      return Some(self.lease(span));
    }

    for n in k + 1..=MAX_PAGES {
      let Some(big) = self.state.buckets[n].pop_front() else {
        continue;
      };
      let page_id = unsafe { big.as_ref().page_id };
      let Some(head) = self.state.spans.create(Span::new(page_id, k)) else {
        unsafe { self.state.buckets[n].push_front(big) };
        return None;
      };

      // The tail keeps the existing record and moves to its new bucket.
      unsafe {
        let rest = &mut *big.as_ptr();
        rest.page_id += k;
        rest.page_count -= k;
        self.state.buckets[n - k].push_front(big);
      }
      self.map_boundaries(big);
      return Some(self.lease(head));
    }

    if !self.grow() {
      return None;
    }
    debug_assert!(!self.state.buckets[MAX_PAGES].is_empty());
    self.new_span(k)
  }

  /// Reserves `k` pages straight from the OS for one allocation. The span is
  /// never split or merged and every page is mapped.
  pub fn new_oversized_span(&mut self, k: usize) -> Option<NonNull<Span>> {
    let (mem, page_id) = self.reserve(k)?;
    let record = Span {
      in_use: true,
      oversized: true,
      object_size: k << PAGE_SHIFT,
      ..Span::new(page_id, k)
    };
    let Some(span) = self.state.spans.create(record) else {
      unsafe { os::release(mem, k) };
      return None;
    };

    self.map.set_range(page_id, k, span);
    self.state.oversized_reserved += k;
    Some(span)
  }

  /// Takes a span back. Oversized spans go to the OS with their mappings
  /// cleared; others merge with free neighbors and land in a bucket.
  ///
  /// # Safety
  /// `span` must have come from [`Self::new_span`] or
  /// [`Self::new_oversized_span`], with no objects leased and no list links.
  pub unsafe fn release_span_to_page(&mut self, span: NonNull<Span>) {
    let s = unsafe { &mut *span.as_ptr() };
    debug_assert!(s.in_use, "span {:#x} released twice", s.page_id);
    debug_assert!(s.use_count == 0, "span {:#x} still leased", s.page_id);

    if s.oversized {
      let (page_id, pages) = (s.page_id, s.page_count);
      self.map.clear_range(page_id, pages);
      unsafe {
        os::release(NonNull::new_unchecked(s.start()), pages);
        self.state.spans.destroy(span);
      }
      self.state.oversized_released += pages;
      return;
    }

    self.state.leased_pages -= s.page_count;
    s.object_size = 0;
    s.free_list = null_mut();

    while let Some(prev_page) = s.page_id.checked_sub(1) {
      let Some(prev) = self.map.get(prev_page) else {
        break;
      };
      let (prev_id, prev_pages, prev_in_use) = {
        let p = unsafe { prev.as_ref() };
        (p.page_id, p.page_count, p.in_use)
      };
      if prev_in_use || s.page_count + prev_pages > MAX_PAGES {
        break;
      }

      s.page_id = prev_id;
      s.page_count += prev_pages;
      unsafe {
        self.state.buckets[prev_pages].erase(prev);
        self.state.spans.destroy(prev);
      }
    }

    loop {
      let Some(next) = self.map.get(s.end_page()) else {
        break;
      };
      let (next_pages, next_in_use) = {
        let n = unsafe { next.as_ref() };
        (n.page_count, n.in_use)
      };
      if next_in_use || s.page_count + next_pages > MAX_PAGES {
        break;
      }

      s.page_count += next_pages;
      unsafe {
        self.state.buckets[next_pages].erase(next);
        self.state.spans.destroy(next);
      }
    }

    s.in_use = false;
    let pages = s.page_count;
    // Only whole regions go back to the kernel.
    #[cfg(feature = "release-mem")]
    if pages == MAX_PAGES {
      unsafe { os::advise_free(NonNull::new_unchecked(s.start()), pages) };
    }
    unsafe { self.state.buckets[pages].push_front(span) };
    self.map_boundaries(span);
  }

  /// Accounting snapshot, walking every free bucket.
  pub fn stats(&self) -> PageStats {
    let state = &*self.state;
    let mut free_pages = 0;
    let mut free_spans = 0;
    for (pages, bucket) in state.buckets.iter().enumerate() {
      free_spans += bucket.len();
      free_pages += pages * bucket.len();
    }

    PageStats {
      reserved_pages: state.grown_pages + state.oversized_reserved,
      released_pages: state.oversized_released,
      free_pages,
      free_spans,
      leased_pages: state.leased_pages,
      oversized_pages: state.oversized_reserved - state.oversized_released,
    }
  }

  /// Free spans currently holding exactly `pages` pages.
  #[cfg(test)]
  pub fn bucket_len(&self, pages: usize) -> usize {
    self.state.buckets[pages].len()
  }

  /// Hands a free span to the central cache.
  fn lease(&mut self, span: NonNull<Span>) -> NonNull<Span> {
    let s = unsafe { &mut *span.as_ptr() };
    s.in_use = true;
    s.object_size = 0;
    s.use_count = 0;
    s.free_list = null_mut();
    self.map.set_range(s.page_id, s.page_count, span);
    self.state.leased_pages += s.page_count;
    span
  }

  /// Maps the first and last page of a free span so neighbors can find it.
  fn map_boundaries(&self, span: NonNull<Span>) {
    let s = unsafe { span.as_ref() };
    self.map.set(s.page_id, span);
    self.map.set(s.last_page(), span);
  }

  /// Reserves `pages` pages and the page-map leaves covering them.
  fn reserve(&mut self, pages: usize) -> Option<(NonNull<u8>, usize)> {
    let mem = os::reserve(pages)?;
    let page_id = page_of(mem.as_ptr() as usize);
    if !self.map.ensure(page_id, pages, &mut self.state.leaves) {
      unsafe { os::release(mem, pages) };
      return None;
    }
    Some((mem, page_id))
  }

  /// Adds a fresh `MAX_PAGES` span to the top bucket.
  fn grow(&mut self) -> bool {
    let Some((mem, page_id)) = self.reserve(MAX_PAGES) else {
      return false;
    };
    let Some(span) = self.state.spans.create(Span::new(page_id, MAX_PAGES)) else {
      unsafe { os::release(mem, MAX_PAGES) };
      return false;
    };

    unsafe { self.state.buckets[MAX_PAGES].push_front(span) };
    self.map_boundaries(span);
    self.state.grown_pages += MAX_PAGES;
    true
  }
}
