//! Multi-threaded stress: concurrent allocate/free through shared central and
//! page caches must never hand one block to two owners.

use std::ptr::NonNull;
use std::sync::{Arc, Barrier, mpsc};
use std::thread;

use conmalloc::{Heap, ThreadCache, size_class};

/// Wrapper to allow sending block pointers across thread boundaries.
#[derive(Clone, Copy)]
struct SendPtr(NonNull<u8>);
unsafe impl Send for SendPtr {}

fn tag(thread: usize, i: usize) -> u64 {
  ((thread as u64) << 32) | i as u64
}

/// Fills every live block with its owner's tag and checks all of them before
/// freeing. A block handed to two owners shows up as a foreign tag.
fn churn(heap: &Heap, thread: usize, size: usize, rounds: usize, live: usize) {
  let mut cache = ThreadCache::new();
  let words = size / 8;
  let mut held = Vec::with_capacity(live);

  for round in 0..rounds {
    for i in 0..live {
      let ptr = heap.allocate(&mut cache, size).expect("out of memory");
      let t = tag(thread, round * live + i);
      let words_ptr = ptr.as_ptr().cast::<u64>();
      for w in 0..words {
        unsafe { words_ptr.add(w).write(t) };
      }
      held.push((ptr, t));
    }

    thread::yield_now();

    for (ptr, t) in held.drain(..) {
      let words_ptr = ptr.as_ptr().cast::<u64>();
      for w in 0..words {
        assert_eq!(unsafe { words_ptr.add(w).read() }, t, "block {ptr:p} aliased");
      }
      unsafe { heap.deallocate(&mut cache, ptr) };
    }
  }

  cache.flush(heap);
}

#[test]
fn two_threads_same_class_never_alias() {
  let heap = Heap::new().unwrap();
  thread::scope(|s| {
    for t in 0..2 {
      let heap = &heap;
      s.spawn(move || churn(heap, t, 64, 200, 300));
    }
  });

  let stats = heap.stats();
  assert!(stats.is_conserved(), "{stats:?}");
  assert_eq!(stats.pages.leased_pages, 0);
  assert_eq!(stats.central_pages, 0);
}

#[test]
fn many_threads_mixed_classes() {
  const THREADS: usize = 8;
  let heap = Heap::new().unwrap();
  let barrier = Barrier::new(THREADS);

  thread::scope(|s| {
    for t in 0..THREADS {
      let (heap, barrier) = (&heap, &barrier);
      s.spawn(move || {
        barrier.wait();
        let size = [16, 48, 512, 4096, 24 * 1024, 160 * 1024][t % 6];
        churn(heap, t, size, 50, 64);
      });
    }
  });

  let stats = heap.stats();
  assert!(stats.is_conserved(), "{stats:?}");
  assert_eq!(stats.pages.leased_pages, 0);
}

#[test]
fn cross_thread_free() {
  const BLOCKS: usize = 5_000;
  let heap = Arc::new(Heap::new().unwrap());
  let (tx, rx) = mpsc::channel::<SendPtr>();

  let producer = {
    let heap = Arc::clone(&heap);
    thread::spawn(move || {
      let mut cache = ThreadCache::new();
      for i in 0..BLOCKS {
        let ptr = heap.allocate(&mut cache, 96).unwrap();
        unsafe { ptr.as_ptr().cast::<usize>().write(i) };
        tx.send(SendPtr(ptr)).unwrap();
      }
      cache.flush(&heap);
    })
  };

  let consumer = {
    let heap = Arc::clone(&heap);
    thread::spawn(move || {
      let mut cache = ThreadCache::new();
      for (i, SendPtr(ptr)) in rx.iter().enumerate() {
        assert_eq!(unsafe { ptr.as_ptr().cast::<usize>().read() }, i);
        unsafe { heap.deallocate(&mut cache, ptr) };
      }
      cache.flush(&heap);
    })
  };

  producer.join().unwrap();
  consumer.join().unwrap();

  let stats = heap.stats();
  assert_eq!(stats.pages.leased_pages, 0);
  assert!(stats.is_conserved());
}

#[test]
fn oversized_blocks_under_contention() {
  const THREADS: usize = 4;
  let heap = Heap::new().unwrap();

  thread::scope(|s| {
    for t in 0..THREADS {
      let heap = &heap;
      s.spawn(move || {
        let mut cache = ThreadCache::new();
        for i in 0..50 {
          let size = 300_000 + (t * 50 + i) * 1000;
          let ptr = heap.allocate(&mut cache, size).unwrap();
          unsafe {
            ptr.as_ptr().write(0x5A);
            ptr.as_ptr().add(size - 1).write(0xA5);
          }
          assert!(unsafe { heap.usable_size(ptr.as_ptr()) } >= size);
          unsafe { heap.deallocate(&mut cache, ptr) };
        }
      });
    }
  });

  let stats = heap.stats();
  assert_eq!(stats.pages.oversized_pages, 0);
  assert_eq!(stats.pages.reserved_pages, stats.pages.released_pages);
}

#[test]
fn global_entry_points_from_many_threads() {
  const THREADS: usize = 8;
  const ITERATIONS: usize = 10_000;
  let barrier = Arc::new(Barrier::new(THREADS));

  let handles: Vec<_> = (0..THREADS)
    .map(|t| {
      let barrier = Arc::clone(&barrier);
      thread::spawn(move || {
        barrier.wait();
        for i in 0..ITERATIONS {
          let size = 1 + (t * 131 + i * 17) % 2048;
          let p = conmalloc::allocate(size);
          assert!(!p.is_null(), "allocate returned null under contention");
          assert!(unsafe { conmalloc::usable_size(p) } >= size_class::round_up(size));
          unsafe {
            p.write_bytes(0xCC, size);
            conmalloc::deallocate(p);
          }
        }
      })
    })
    .collect();

  for h in handles {
    h.join().expect("thread panicked during allocate/free stress");
  }
}
