#![allow(clippy::missing_safety_doc)]

//! A three-tier concurrent memory pool allocator.
//!
//! Allocations up to [`MAX_BYTES`] are served from a per-thread cache without
//! locking. Misses refill from a central cache with one lock per size class,
//! which carves spans obtained from a page cache guarded by a single lock.
//! Larger requests get a dedicated span straight from the OS.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::Cell,
  ptr::{self, NonNull, null_mut},
};
use std::sync::OnceLock;

mod central_cache;
mod heap;
mod object_pool;
mod os;
mod page_cache;
mod page_map;
pub mod size_class;
mod span;
mod sync;
mod thread_cache;

pub use heap::{Heap, SpanInfo, Stats};
pub use page_cache::PageStats;
pub use thread_cache::ThreadCache;

use object_pool::ObjectPool;
use sync::Mutex;

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT; // 8KB

/// Largest request served through the thread and central caches.
pub const MAX_BYTES: usize = 256 * 1024;

/// Size-class buckets in the thread and central caches.
pub const NUM_CLASSES: usize = 208;

/// Largest span the page cache keeps in a bucket.
pub const MAX_PAGES: usize = 128;
/// Page cache buckets, indexed directly by page count (slot 0 unused).
pub const NUM_PAGE_BUCKETS: usize = MAX_PAGES + 1;

// =============================================================================
// Compile-time checks
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_BYTES % PAGE_SIZE == 0);
const _: () = assert!(MAX_BYTES >> PAGE_SHIFT <= MAX_PAGES);
const _: () = assert!(size_class::class_size(0) >= size_of::<span::FreeObject>());
const _: () = assert!(size_class::class_size(NUM_CLASSES - 1) == MAX_BYTES);
const _: () = assert!(size_class::index(MAX_BYTES) == NUM_CLASSES - 1);
const _: () = assert!(size_class::num_move_page(MAX_BYTES) <= MAX_PAGES);
const _: () = assert!(size_class::num_move_page(8) <= MAX_PAGES);

// =============================================================================
// Process-wide state
// =============================================================================

static HEAP: OnceLock<Option<Heap>> = OnceLock::new();

/// Thread caches are never returned; a thread that exits leaks its cache.
static THREAD_CACHES: Mutex<ObjectPool<ThreadCache>> = Mutex::new(ObjectPool::new());

fn heap() -> Option<&'static Heap> {
  HEAP.get_or_init(Heap::new).as_ref()
}

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static THREAD_CACHE: Cell<*mut ThreadCache> = const { Cell::new(null_mut()) };
}

/// Runs `f` on this thread's cache, taking one from the pool on first use.
/// `None` if the pool is out of memory or TLS is gone.
fn with_thread_cache<R, F: FnOnce(&mut ThreadCache) -> Option<R>>(f: F) -> Option<R> {
  THREAD_CACHE
    .try_with(|slot| {
      let mut cache = slot.get();
      if cache.is_null() {
        cache = THREAD_CACHES.lock().create(ThreadCache::new())?.as_ptr();
        slot.set(cache);
      }
      f(unsafe { &mut *cache })
    })
    .ok()
    .flatten()
}

// =============================================================================
// Public API
// =============================================================================

/// At least `size` usable bytes (0 is treated as 1), aligned to 8. Null only
/// when the OS is out of memory.
pub fn allocate(size: usize) -> *mut u8 {
  let Some(heap) = heap() else {
    return null_mut();
  };
  with_thread_cache(|cache| heap.allocate(cache, size)).map_or(null_mut(), NonNull::as_ptr)
}

/// Frees a block from [`allocate`]. Null is ignored; pointers this allocator
/// does not own abort the process.
pub unsafe fn deallocate(ptr: *mut u8) {
  let Some(ptr) = NonNull::new(ptr) else {
    return;
  };
  let Some(heap) = HEAP.get().and_then(Option::as_ref) else {
    os::abort_with_message("conmalloc: free before any allocation\n");
  };
  with_thread_cache(|cache| {
    unsafe { heap.deallocate(cache, ptr) };
    Some(())
  });
}

/// Usable bytes behind `ptr`; 0 for null or unknown pointers.
///
/// # Safety
/// `ptr` must be null, a live block from [`allocate`], or outside the
/// allocator's pages.
pub unsafe fn usable_size(ptr: *const u8) -> usize {
  match HEAP.get().and_then(Option::as_ref) {
    Some(heap) if !ptr.is_null() => unsafe { heap.usable_size(ptr) },
    _ => 0,
  }
}

/// Page accounting of the process-wide heap.
pub fn stats() -> Stats {
  HEAP
    .get()
    .and_then(Option::as_ref)
    .map(Heap::stats)
    .unwrap_or_default()
}

// =============================================================================
// GlobalAlloc
// =============================================================================

pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let align = layout.align();

    // Every class size that is a multiple of `align` keeps its slots aligned,
    // since spans start on a page boundary.
    if align <= PAGE_SIZE {
      return allocate(align_up(layout.size().max(1), align));
    }

    // Over-reserve a dedicated span and hand out an aligned interior pointer;
    // every page of the span maps back to it.
    let Some(heap) = heap() else {
      return null_mut();
    };
    let Some(size) = layout.size().checked_add(align) else {
      return null_mut();
    };
    match heap.allocate_oversized(size) {
      Some(base) => {
        let addr = base.as_ptr() as usize;
        unsafe { base.as_ptr().add(align_up(addr, align) - addr) }
      }
      None => null_mut(),
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { deallocate(ptr) };
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
      return unsafe {
        self.alloc(Layout::from_size_align_unchecked(
          new_size.max(1),
          layout.align(),
        ))
      };
    }

    if new_size == 0 {
      unsafe { self.dealloc(ptr, layout) };
      return null_mut();
    }

    // Same size class: the block already fits.
    let old_size = layout.size().max(1);
    if layout.align() <= PAGE_SIZE {
      let old = align_up(old_size, layout.align());
      let new = align_up(new_size, layout.align());
      if old <= MAX_BYTES && new <= MAX_BYTES && size_class::index(old) == size_class::index(new) {
        return ptr;
      }
    }

    let new_ptr =
      unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };

    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
      unsafe { self.dealloc(ptr, layout) };
    }

    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  allocate(size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { deallocate(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  let ptr = allocate(total);
  if !ptr.is_null() {
    unsafe { ptr::write_bytes(ptr, 0, total) };
  }
  ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  if ptr.is_null() {
    return allocate(size);
  }

  if size == 0 {
    unsafe { deallocate(ptr) };
    return null_mut();
  }

  let old = unsafe { usable_size(ptr) };
  if size <= old && (old > MAX_BYTES || size_class::round_up(size) == old) {
    return ptr;
  }

  let new_ptr = allocate(size);
  if !new_ptr.is_null() {
    unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old.min(size)) };
    unsafe { deallocate(ptr) };
  }

  new_ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> i32 {
  if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() {
    return libc::EINVAL;
  }

  let Ok(layout) = Layout::from_size_align(size.max(1), alignment) else {
    return libc::ENOMEM;
  };
  let ptr = unsafe { Allocator.alloc(layout) };

  if ptr.is_null() {
    return libc::ENOMEM;
  }

  unsafe { *memptr = ptr };
  0
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { usable_size(ptr) }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn align_up_rounds_to_power_of_two() {
    assert_eq!(align_up(0, 8), 0);
    assert_eq!(align_up(1, 8), 8);
    assert_eq!(align_up(8, 8), 8);
    assert_eq!(align_up(8193, PAGE_SIZE), 2 * PAGE_SIZE);
  }

  #[test]
  fn global_path_round_trip() {
    let ptr = allocate(41);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % 8, 0);
    assert_eq!(unsafe { usable_size(ptr) }, 48);
    unsafe {
      ptr.write_bytes(0xAB, 41);
      deallocate(ptr);
      deallocate(null_mut());
    }
    assert_eq!(unsafe { usable_size(null_mut()) }, 0);
  }

  #[test]
  fn layouts_honor_alignment() {
    let a = Allocator;
    let cases = [(1, 1), (24, 16), (100, 64), (3000, 4096), (10, PAGE_SIZE), (5, 1 << 16)];
    for (size, align) in cases {
      let layout = Layout::from_size_align(size, align).unwrap();
      let ptr = unsafe { a.alloc(layout) };
      assert!(!ptr.is_null());
      assert_eq!(ptr as usize % align, 0, "size {size} align {align}");
      assert!(unsafe { usable_size(ptr) } >= size);
      unsafe { a.dealloc(ptr, layout) };
    }
  }

  #[test]
  fn realloc_keeps_block_within_class() {
    let a = Allocator;
    let layout = Layout::from_size_align(200, 8).unwrap();
    let ptr = unsafe { a.alloc(layout) };
    unsafe { ptr.write_bytes(7, 200) };

    // 200 and 205 both round to 208.
    let same = unsafe { a.realloc(ptr, layout, 205) };
    assert_eq!(same, ptr);

    let grown = unsafe { a.realloc(same, Layout::from_size_align(205, 8).unwrap(), 5000) };
    assert!(!grown.is_null());
    assert_ne!(grown, same);
    assert!((0..200).all(|i| unsafe { *grown.add(i) } == 7));
    unsafe { a.dealloc(grown, Layout::from_size_align(5000, 8).unwrap()) };
  }

  #[test]
  fn alloc_zeroed_clears_recycled_blocks() {
    let a = Allocator;
    let layout = Layout::from_size_align(256, 8).unwrap();
    let dirty = unsafe { a.alloc(layout) };
    unsafe {
      dirty.write_bytes(0xFF, 256);
      a.dealloc(dirty, layout);
    }
    let clean = unsafe { a.alloc_zeroed(layout) };
    assert!((0..256).all(|i| unsafe { *clean.add(i) } == 0));
    unsafe { a.dealloc(clean, layout) };
  }
}
