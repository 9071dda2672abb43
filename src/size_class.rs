//! Size-class mapping.
//!
//! Requested sizes are rounded up with a tiered alignment that keeps internal
//! fragmentation around 10%:
//!
//! | size range          | alignment | buckets    |
//! |---------------------|-----------|------------|
//! | `[1, 128]`          | 8         | `[0, 16)`    |
//! | `(128, 1024]`       | 16        | `[16, 72)`   |
//! | `(1024, 8K]`        | 128       | `[72, 128)`  |
//! | `(8K, 64K]`         | 1024      | `[128, 184)` |
//! | `(64K, 256K]`       | 8K        | `[184, 208)` |
//!
//! Everything here is a pure function; sizes above [`MAX_BYTES`] are routed to
//! the oversized path by the caller.

use crate::{MAX_BYTES, NUM_CLASSES, PAGE_SHIFT, PAGE_SIZE, align_up};

/// Upper bound of each tier, inclusive.
const TIER_LIMITS: [usize; 5] = [128, 1024, 8 * 1024, 64 * 1024, MAX_BYTES];
/// log2 of the alignment used inside each tier.
const TIER_SHIFTS: [usize; 5] = [3, 4, 7, 10, 13];
/// Number of buckets each tier contributes.
const TIER_BUCKETS: [usize; 5] = [16, 56, 56, 56, 24];

/// Smallest and largest batch moved between a thread cache and the central
/// cache in one go.
const MIN_BATCH: usize = 2;
const MAX_BATCH: usize = 512;

const fn tier_of(size: usize) -> usize {
  let mut tier = 0;
  while tier < TIER_LIMITS.len() - 1 && size > TIER_LIMITS[tier] {
    tier += 1;
  }
  tier
}

const fn tier_floor(tier: usize) -> usize {
  if tier == 0 { 0 } else { TIER_LIMITS[tier - 1] }
}

const fn tier_first_bucket(tier: usize) -> usize {
  let mut first = 0;
  let mut t = 0;
  while t < tier {
    first += TIER_BUCKETS[t];
    t += 1;
  }
  first
}

const fn count_buckets() -> usize {
  tier_first_bucket(TIER_BUCKETS.len())
}

// Tier widths must tile both the size range and the bucket range exactly.
const _: () = assert!(count_buckets() == NUM_CLASSES);
const _: () = {
  let mut tier = 0;
  while tier < TIER_LIMITS.len() {
    let span = TIER_LIMITS[tier] - tier_floor(tier);
    assert!(span == TIER_BUCKETS[tier] << TIER_SHIFTS[tier]);
    tier += 1;
  }
};

/// Alignment applied to `size`.
#[inline]
pub const fn alignment(size: usize) -> usize {
  if size > MAX_BYTES {
    PAGE_SIZE
  } else {
    1 << TIER_SHIFTS[tier_of(size)]
  }
}

/// Rounds `size` up to its class size. Sizes above [`MAX_BYTES`] round up to a
/// whole number of pages.
#[inline]
pub const fn round_up(size: usize) -> usize {
  align_up(size, alignment(size))
}

/// Bucket index of `size`, for `size` in `(0, MAX_BYTES]`.
#[inline]
pub const fn index(size: usize) -> usize {
  debug_assert!(size > 0 && size <= MAX_BYTES);
  let tier = tier_of(size);
  let shift = TIER_SHIFTS[tier];
  let offset = size - tier_floor(tier);
  tier_first_bucket(tier) + ((offset + (1 << shift) - 1) >> shift) - 1
}

/// Class size served by bucket `index`; inverse of [`index`].
#[inline]
pub const fn class_size(index: usize) -> usize {
  debug_assert!(index < NUM_CLASSES);
  let mut tier = 0;
  while tier < TIER_BUCKETS.len() - 1 && index >= tier_first_bucket(tier + 1) {
    tier += 1;
  }
  tier_floor(tier) + ((index - tier_first_bucket(tier) + 1) << TIER_SHIFTS[tier])
}

/// Most objects of `size` moved between a thread cache and the central cache
/// in one batch. Small objects move in large batches and vice versa.
#[inline]
pub const fn num_move_size(size: usize) -> usize {
  debug_assert!(size > 0);
  let num = MAX_BYTES / size;
  if num < MIN_BATCH {
    MIN_BATCH
  } else if num > MAX_BATCH {
    MAX_BATCH
  } else {
    num
  }
}

/// Pages the central cache requests when it needs a fresh span for `size`.
#[inline]
pub const fn num_move_page(size: usize) -> usize {
  let pages = (num_move_size(size) * size) >> PAGE_SHIFT;
  if pages == 0 { 1 } else { pages }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::MAX_PAGES;

  #[test]
  fn round_up_tiers() {
    assert_eq!(round_up(1), 8);
    assert_eq!(round_up(8), 8);
    assert_eq!(round_up(9), 16);
    assert_eq!(round_up(128), 128);
    assert_eq!(round_up(129), 144);
    assert_eq!(round_up(1024), 1024);
    assert_eq!(round_up(1025), 1152);
    assert_eq!(round_up(8 * 1024 + 1), 9 * 1024);
    assert_eq!(round_up(64 * 1024 + 1), 72 * 1024);
    assert_eq!(round_up(MAX_BYTES), MAX_BYTES);
    assert_eq!(round_up(300_000), 37 * PAGE_SIZE);
  }

  #[test]
  fn tier_boundaries_get_consecutive_buckets() {
    assert_eq!(index(1), 0);
    assert_eq!(index(128), 15);
    assert_eq!(index(129), 16);
    assert_eq!(index(1024), 71);
    assert_eq!(index(1025), 72);
    assert_eq!(index(8 * 1024), 127);
    assert_eq!(index(8 * 1024 + 1), 128);
    assert_eq!(index(64 * 1024), 183);
    assert_eq!(index(64 * 1024 + 1), 184);
    assert_eq!(index(MAX_BYTES), NUM_CLASSES - 1);
  }

  #[test]
  fn every_size_rounds_consistently() {
    for size in 1..=MAX_BYTES {
      let aligned = round_up(size);
      assert!(aligned >= size, "round_up({size}) = {aligned}");
      assert_eq!(aligned % alignment(size), 0, "size {size}");
      assert_eq!(index(size), index(aligned), "size {size} -> {aligned}");
      assert_eq!(class_size(index(size)), aligned, "size {size}");
    }
  }

  #[test]
  fn buckets_are_contiguous() {
    let mut expected = 0;
    let mut last = None;
    for size in 1..=MAX_BYTES {
      let idx = index(size);
      if last != Some(idx) {
        assert_eq!(idx, expected, "gap before size {size}");
        expected += 1;
        last = Some(idx);
      }
    }
    assert_eq!(expected, NUM_CLASSES);
  }

  #[test]
  fn class_sizes_increase() {
    for idx in 1..NUM_CLASSES {
      assert!(class_size(idx) > class_size(idx - 1));
      assert_eq!(index(class_size(idx)), idx);
    }
  }

  #[test]
  fn batch_limits() {
    assert_eq!(num_move_size(8), MAX_BATCH);
    assert_eq!(num_move_size(1024), 256);
    assert_eq!(num_move_size(MAX_BYTES), MIN_BATCH);
    assert_eq!(num_move_size(200 * 1024), MIN_BATCH);
  }

  #[test]
  fn move_pages_fit_page_cache_buckets() {
    assert_eq!(num_move_page(8), 1);
    assert_eq!(num_move_page(MAX_BYTES), 64);
    for idx in 0..NUM_CLASSES {
      let size = class_size(idx);
      let pages = num_move_page(size);
      assert!((1..=MAX_PAGES).contains(&pages), "class {size}: {pages} pages");
      // At least one object fits in the span carved for it.
      assert!(pages * PAGE_SIZE >= size);
    }
  }
}
