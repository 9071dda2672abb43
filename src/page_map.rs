//! Page number -> owning span, as a two-level radix tree.
//!
//! Covers a 48-bit address space: with 8 KiB pages that is 35 bits of page
//! number, split into 20 root bits and 15 leaf bits. The root (8 MiB of
//! virtual memory) is reserved once and only touched where leaves exist;
//! each leaf covers 256 MiB of address space and is taken from an
//! [`ObjectPool`] the first time a span lands in its range.
//!
//! Lookups are lock-free atomic loads. Updates are only made while holding
//! the page cache lock, which is why [`PageMap::ensure`] can install leaves
//! with a plain store.

use core::{
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
  PAGE_SHIFT,
  object_pool::ObjectPool,
  os,
  span::{Span, pages_for},
};

const ADDRESS_BITS: usize = 48;
const PAGE_ID_BITS: usize = ADDRESS_BITS - PAGE_SHIFT;
const LEAF_BITS: usize = 15;
const LEAF_LEN: usize = 1 << LEAF_BITS;
const ROOT_BITS: usize = PAGE_ID_BITS - LEAF_BITS;
const ROOT_LEN: usize = 1 << ROOT_BITS;
const ROOT_PAGES: usize = pages_for(ROOT_LEN * size_of::<AtomicPtr<Leaf>>());

/// One second-level node: an entry per page.
pub struct Leaf {
  entries: [AtomicPtr<Span>; LEAF_LEN],
}

pub struct PageMap {
  root: NonNull<AtomicPtr<Leaf>>,
}

unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

impl PageMap {
  /// Reserves the root table. `None` if the OS refuses.
  pub fn new() -> Option<Self> {
    // Fresh OS pages are zeroed: every root slot starts out null.
    let root = os::reserve(ROOT_PAGES)?;
    Some(Self { root: root.cast() })
  }

  #[inline(always)]
  fn split(page: usize) -> Option<(usize, usize)> {
    if page >> PAGE_ID_BITS != 0 {
      return None;
    }
    Some((page >> LEAF_BITS, page & (LEAF_LEN - 1)))
  }

  #[inline(always)]
  fn root_slot(&self, index: usize) -> &AtomicPtr<Leaf> {
    debug_assert!(index < ROOT_LEN);
    unsafe { &*self.root.as_ptr().add(index) }
  }

  #[inline]
  fn entry(&self, page: usize) -> Option<&AtomicPtr<Span>> {
    let (i1, i2) = Self::split(page)?;
    let leaf = self.root_slot(i1).load(Ordering::Acquire);
    if leaf.is_null() {
      return None;
    }
    Some(unsafe { &(*leaf).entries[i2] })
  }

  /// Span owning `page`, if any.
  #[inline]
  pub fn get(&self, page: usize) -> Option<NonNull<Span>> {
    NonNull::new(self.entry(page)?.load(Ordering::Acquire))
  }

  /// Makes sure leaves exist for `count` pages starting at `start`. Returns
  /// `false` when the range is outside the address space or a leaf cannot be
  /// allocated.
  pub fn ensure(&self, start: usize, count: usize, leaves: &mut ObjectPool<Leaf>) -> bool {
    debug_assert!(count > 0);
    let Some(last) = start.checked_add(count - 1) else {
      return false;
    };
    if Self::split(last).is_none() {
      return false;
    }

    let mut page = start;
    while page <= last {
      let i1 = page >> LEAF_BITS;
      let slot = self.root_slot(i1);
      if slot.load(Ordering::Acquire).is_null() {
        let Some(leaf) = leaves.take() else {
          return false;
        };
        unsafe { ptr::write_bytes(leaf.as_ptr(), 0, 1) };
        slot.store(leaf.as_ptr(), Ordering::Release);
      }
      page = (i1 + 1) << LEAF_BITS;
    }
    true
  }

  /// Points `page` at `span`. The page's leaf must have been ensured.
  #[inline]
  pub fn set(&self, page: usize, span: NonNull<Span>) {
    match self.entry(page) {
      Some(entry) => entry.store(span.as_ptr(), Ordering::Release),
      None => os::abort_with_message("conmalloc: page map update outside reserved range\n"),
    }
  }

  pub fn set_range(&self, start: usize, count: usize, span: NonNull<Span>) {
    for page in start..start + count {
      self.set(page, span);
    }
  }

  #[inline]
  fn clear(&self, page: usize) {
    if let Some(entry) = self.entry(page) {
      entry.store(null_mut(), Ordering::Release);
    }
  }

  pub fn clear_range(&self, start: usize, count: usize) {
    for page in start..start + count {
      self.clear(page);
    }
  }
}

impl Drop for PageMap {
  fn drop(&mut self) {
    // Leaves belong to the page cache's pool and outlive the map.
    unsafe { os::release(self.root.cast(), ROOT_PAGES) };
  }
}
