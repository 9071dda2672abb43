use conmalloc::Allocator;

#[global_allocator]
static GLOBAL: Allocator = Allocator;

#[test]
fn collections_work() {
  let b = Box::new(42u64);
  assert_eq!(*b, 42);
  drop(b);

  let mut v: Vec<u32> = Vec::new();
  for i in 0..100_000 {
    v.push(i);
  }
  assert_eq!(v.len(), 100_000);
  assert_eq!(v[99_999], 99_999);
  // The buffer grew through every tier and into the oversized path.
  assert!(v.capacity() * 4 > conmalloc::MAX_BYTES);
  drop(v);

  let s = String::from("hello, conmalloc global allocator!");
  assert_eq!(s, "hello, conmalloc global allocator!");
}

#[test]
fn zero_size_and_empty() {
  let mut v: Vec<()> = Vec::new();
  for _ in 0..100 {
    v.push(());
  }
  assert_eq!(v.len(), 100);

  let v: Vec<u8> = Vec::with_capacity(0);
  assert_eq!(v.capacity(), 0);
}

#[test]
fn aligned_alloc() {
  use std::alloc::{Layout, alloc, dealloc};

  for align in [16, 128, 4096, 8192, 1 << 16, 1 << 21] {
    unsafe {
      let layout = Layout::from_size_align(256, align).unwrap();
      let ptr = alloc(layout);
      assert!(!ptr.is_null(), "{align}-byte aligned allocation returned null");
      assert_eq!(ptr as usize % align, 0, "pointer is not {align}-byte aligned: {ptr:p}");
      ptr.write_bytes(0xEE, 256);
      dealloc(ptr, layout);
    }
  }
}

#[test]
fn threads_share_the_heap() {
  let handles: Vec<_> = (0..8)
    .map(|t| {
      std::thread::spawn(move || {
        let words: Vec<String> = (0..5_000).map(|i| format!("{t}-{i}")).collect();
        words.iter().map(String::len).sum::<usize>()
      })
    })
    .collect();
  for h in handles {
    assert!(h.join().unwrap() > 0);
  }

  let stats = conmalloc::stats();
  assert!(stats.pages.reserved_pages > 0);
}

#[test]
fn realloc_preserves_contents() {
  let mut v: Vec<u64> = (0..10).collect();
  for i in 10..50_000 {
    v.push(i);
  }
  assert!(v.iter().enumerate().all(|(i, &x)| x == i as u64));
  v.truncate(3);
  v.shrink_to_fit();
  assert_eq!(v, [0, 1, 2]);
}
