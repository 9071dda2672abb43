//! Page provider: the only place that talks to the kernel for memory.
//!
//! Every region handed out is aligned to [`PAGE_SIZE`] (8 KiB, larger than the
//! 4 KiB the kernel guarantees), so `addr >> PAGE_SHIFT` is always a whole
//! page number.

use core::ptr::{NonNull, null_mut};

use crate::{PAGE_SHIFT, PAGE_SIZE, align_up};

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Reserves `pages` zero-initialized pages aligned to [`PAGE_SIZE`].
///
/// Returns `None` when the kernel refuses the mapping or the byte length
/// overflows.
pub fn reserve(pages: usize) -> Option<NonNull<u8>> {
  debug_assert!(pages > 0, "reserve: zero pages requested");
  let bytes = pages.checked_mul(PAGE_SIZE)?;
  // Over-map by one page so an aligned window always fits, then trim.
  let mapped = bytes.checked_add(PAGE_SIZE)?;

  let raw = unsafe { os_mmap(mapped) };
  if raw.is_null() {
    return None;
  }

  let start = raw as usize;
  let aligned = align_up(start, PAGE_SIZE);
  let head = aligned - start;
  let tail = mapped - head - bytes;
  unsafe {
    if head > 0 {
      os_munmap(raw, head);
    }
    if tail > 0 {
      os_munmap((aligned + bytes) as *mut u8, tail);
    }
  }

  NonNull::new(aligned as *mut u8)
}

/// Returns `pages` pages starting at `ptr` to the kernel.
///
/// # Safety
/// The range must have been obtained from [`reserve`] and must not be used
/// afterwards.
pub unsafe fn release(ptr: NonNull<u8>, pages: usize) {
  unsafe { os_munmap(ptr.as_ptr(), pages << PAGE_SHIFT) };
}

/// Lets the kernel drop the physical backing of a range that stays reserved.
/// The next touch observes zero-filled pages.
///
/// # Safety
/// The range must be mapped and owned by the caller.
#[cfg(feature = "release-mem")]
pub unsafe fn advise_free(ptr: NonNull<u8>, pages: usize) {
  let len = pages << PAGE_SHIFT;
  let ret = unsafe { libc::madvise(ptr.as_ptr().cast(), len, libc::MADV_DONTNEED) };
  debug_assert!(ret == 0, "madvise(MADV_DONTNEED) failed on {:p}", ptr);
}

/// Writes `msg` straight to stderr and aborts. Used when bookkeeping is found
/// corrupted; nothing here may allocate.
#[cold]
#[inline(never)]
pub fn abort_with_message(msg: &str) -> ! {
  unsafe {
    libc::write(2, msg.as_ptr().cast(), msg.len());
    libc::abort();
  }
}
