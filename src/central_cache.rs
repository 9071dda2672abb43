//! Central cache: per size class, the spans whose objects are leased to
//! thread caches in batches.
//!
//! Each bucket has its own lock. A bucket lock and the page lock are never
//! held together: the bucket lock is dropped before the page cache is asked
//! for a span (or handed one back) and re-taken afterwards.

use core::ptr::{NonNull, null_mut};

use crate::{
  NUM_CLASSES,
  page_cache::PageCache,
  size_class,
  span::{FreeObject, ObjectRun, Span, SpanList},
  sync::{Mutex, MutexGuard},
};

pub struct CentralCache {
  buckets: [Mutex<SpanList>; NUM_CLASSES],
}

impl Default for CentralCache {
  fn default() -> Self {
    Self::new()
  }
}

impl CentralCache {
  pub const fn new() -> Self {
    Self {
      buckets: [const { Mutex::new(SpanList::new()) }; NUM_CLASSES],
    }
  }

  /// Finds a span in the bucket with unleased objects, or carves a fresh one.
  ///
  /// Takes the bucket guard by value because the lock is released while the
  /// page cache is consulted; the guard handed back is the re-acquired one.
  fn get_non_null_one_span<'a>(
    &'a self,
    list: MutexGuard<'a, SpanList>,
    index: usize,
    size: usize,
    pages: &PageCache,
  ) -> Option<(MutexGuard<'a, SpanList>, NonNull<Span>)> {
    if let Some(span) = list.iter().find(|s| unsafe { !(*s.as_ptr()).free_list.is_null() }) {
      return Some((list, span));
    }

    // Let frees into this bucket proceed while we grow it.
    drop(list);
    let span = pages.lock().new_span(size_class::num_move_page(size))?;

    // Nobody else can reach the span until it is linked below.
    unsafe { (*span.as_ptr()).carve(size) };

    let mut list = self.buckets[index].lock();
    unsafe { list.push_front(span) };
    Some((list, span))
  }

  /// Leases up to `batch_num` objects of class size `size`. Fewer may come
  /// back if the chosen span runs out; `None` only when the OS is exhausted.
  pub fn fetch_range_obj(
    &self,
    pages: &PageCache,
    batch_num: usize,
    size: usize,
  ) -> Option<ObjectRun> {
    debug_assert!(batch_num > 0);
    debug_assert_eq!(size, size_class::round_up(size), "{size} is not a class size");
    let index = size_class::index(size);
    let list = self.buckets[index].lock();
    let (_list, span) = self.get_non_null_one_span(list, index, size, pages)?;
    unsafe { Span::take_batch(span, batch_num) }
  }

  /// Returns a null-terminated chain of objects of class size `size` to
  /// their spans. Spans with nothing left leased go back to the page cache.
  ///
  /// # Safety
  /// Every node must be a leased object of this heap with class size `size`.
  pub unsafe fn release_list_to_spans(
    &self,
    pages: &PageCache,
    start: *mut FreeObject,
    size: usize,
  ) {
    let index = size_class::index(size);
    let mut list = self.buckets[index].lock();

    let mut cursor = start;
    while let Some(obj) = NonNull::new(cursor) {
      cursor = unsafe { obj.as_ref().next };

      let span = pages.map_object_to_span(obj.as_ptr().cast());
      debug_assert_eq!(unsafe { (*span.as_ptr()).object_size }, size);
      if unsafe { Span::give_back(span, obj) } > 0 {
        continue;
      }

      unsafe {
        list.erase(span);
        (*span.as_ptr()).free_list = null_mut();
      }
      drop(list);
      unsafe { pages.lock().release_span_to_page(span) };
      list = self.buckets[index].lock();
    }
  }

  /// Spans held for bucket `index`.
  #[cfg(test)]
  pub fn bucket_spans(&self, index: usize) -> usize {
    self.buckets[index].lock().len()
  }

  /// Pages held across all buckets. Locks one bucket at a time, so the total
  /// is only exact while the heap is quiescent.
  pub fn held_pages(&self) -> usize {
    self
      .buckets
      .iter()
      .map(|bucket| {
        let list = bucket.lock();
        list.iter().map(|s| unsafe { (*s.as_ptr()).page_count }).sum::<usize>()
      })
      .sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn chain(run: ObjectRun) -> Vec<usize> {
    let mut out = Vec::new();
    let mut cursor = run.start.as_ptr();
    while !cursor.is_null() {
      out.push(cursor as usize);
      cursor = unsafe { (*cursor).next };
    }
    out
  }

  #[test]
  fn partial_batches_are_normal() {
    let pages = PageCache::new().unwrap();
    let central = CentralCache::new();
    let size = 128 * 1024;
    // Two objects per span for this class.
    let run = central.fetch_range_obj(&pages, 5, size).unwrap();
    assert_eq!(run.count, 2);
    assert_eq!(chain(run).len(), 2);
    assert_eq!(run.end.as_ptr() as usize - run.start.as_ptr() as usize, size);
  }

  #[test]
  fn batches_come_from_one_span_until_it_runs_dry() {
    let pages = PageCache::new().unwrap();
    let central = CentralCache::new();
    let size = 64;
    let index = size_class::index(size);

    let a = central.fetch_range_obj(&pages, 10, size).unwrap();
    let b = central.fetch_range_obj(&pages, 10, size).unwrap();
    assert_eq!(central.bucket_spans(index), 1);
    assert_eq!(a.count + b.count, 20);

    let span = pages.map_object_to_span(b.start.as_ptr().cast());
    assert_eq!(unsafe { span.as_ref().use_count }, 20);
    assert_eq!(unsafe { span.as_ref().object_size }, size);
  }

  #[test]
  fn emptied_span_returns_to_page_cache() {
    let pages = PageCache::new().unwrap();
    let central = CentralCache::new();
    let size = 8 * 1024;
    let index = size_class::index(size);

    let per_span = size_class::num_move_page(size) * crate::PAGE_SIZE / size;
    let run = central.fetch_range_obj(&pages, per_span, size).unwrap();
    assert_eq!(run.count, per_span);
    assert_eq!(pages.lock().stats().leased_pages, size_class::num_move_page(size));

    unsafe { central.release_list_to_spans(&pages, run.start.as_ptr(), size) };
    assert_eq!(central.bucket_spans(index), 0);
    let stats = pages.lock().stats();
    assert_eq!(stats.leased_pages, 0);
    assert_eq!(stats.free_pages, stats.reserved_pages);
  }

  #[test]
  fn span_stays_while_any_object_is_leased() {
    let pages = PageCache::new().unwrap();
    let central = CentralCache::new();
    let size = 256;
    let index = size_class::index(size);

    let run = central.fetch_range_obj(&pages, 3, size).unwrap();
    let objs = chain(run);
    // Return only the first two.
    unsafe {
      (*(objs[1] as *mut FreeObject)).next = null_mut();
      central.release_list_to_spans(&pages, objs[0] as *mut FreeObject, size);
    }
    assert_eq!(central.bucket_spans(index), 1);
    assert_eq!(central.held_pages(), size_class::num_move_page(size));

    unsafe { central.release_list_to_spans(&pages, objs[2] as *mut FreeObject, size) };
    assert_eq!(central.bucket_spans(index), 0);
    assert_eq!(central.held_pages(), 0);
  }
}
