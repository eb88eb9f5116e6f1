//! Checks allocator traffic with a counting global allocator: sharing must
//! not allocate, copy-on-write must allocate exactly once, and every buffer
//! must be freed exactly once, no matter how its handles are spread out.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::thread;

use cowbytes::{ArcBytes, RcBytes};

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

static ALLOCS: AtomicUsize = AtomicUsize::new(0);
static REALLOCS: AtomicUsize = AtomicUsize::new(0);
static DEALLOCS: AtomicUsize = AtomicUsize::new(0);

/// Forwards to the system allocator and counts successful calls.
struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            ALLOCS.fetch_add(1, SeqCst);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            ALLOCS.fetch_add(1, SeqCst);
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new = System.realloc(ptr, layout, new_size);
        if !new.is_null() {
            REALLOCS.fetch_add(1, SeqCst);
        }
        new
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        DEALLOCS.fetch_add(1, SeqCst);
    }
}

fn reset() {
    ALLOCS.store(0, SeqCst);
    REALLOCS.store(0, SeqCst);
    DEALLOCS.store(0, SeqCst);
}

fn allocs() -> usize {
    ALLOCS.load(SeqCst)
}

fn reallocs() -> usize {
    REALLOCS.load(SeqCst)
}

fn deallocs() -> usize {
    DEALLOCS.load(SeqCst)
}

// A single `#[test]` so that no other test thread can touch the allocator
// while counts are being read. The harness itself is quiet in between.
#[test]
fn lifecycle() {
    fresh_buffers_allocate_once();
    clones_share_one_allocation();
    append_on_shared_buffer_copies_once();
    append_on_unique_buffer_uses_realloc();
    mutable_view_makes_clones_copy();
    atomic_handles_free_exactly_once();
    concurrent_clone_drop_storm_frees_once();
}

fn fresh_buffers_allocate_once() {
    reset();
    let empty = RcBytes::new();
    assert_eq!(allocs(), 1);
    let full = RcBytes::from(b"hello");
    assert_eq!(allocs(), 2);
    assert_eq!(deallocs(), 0);
    drop(empty);
    drop(full);
    assert_eq!(deallocs(), 2);
}

fn clones_share_one_allocation() {
    reset();
    let first = RcBytes::from(b"ab");
    assert_eq!(allocs(), 1);

    let second = first.clone();
    let third = second.clone();
    assert_eq!(allocs(), 1);
    assert_eq!(first.as_ptr(), second.as_ptr());
    assert_eq!(first.as_ptr(), third.as_ptr());

    // Dropping sharers does not free; dropping the last owner does, once.
    drop(first);
    drop(third);
    assert_eq!(deallocs(), 0);
    drop(second);
    assert_eq!(deallocs(), 1);
}

fn append_on_shared_buffer_copies_once() {
    reset();
    let mut first = RcBytes::from(b"ab");
    let second = first.clone();
    assert_eq!(allocs(), 1);

    // The append buys a single fresh buffer. The old one stays with
    // `second`, so nothing is freed yet.
    first.extend_from_slice(b"cd");
    assert_eq!(allocs(), 2);
    assert_eq!(reallocs(), 0);
    assert_eq!(deallocs(), 0);
    assert_eq!(first, b"abcd");
    assert_eq!(second, b"ab");

    drop(first);
    drop(second);
    assert_eq!(deallocs(), 2);
}

fn append_on_unique_buffer_uses_realloc() {
    reset();
    let mut bytes = RcBytes::from(b"abcd");
    assert_eq!(allocs(), 1);

    // Sole owner: growth goes through realloc instead of a copy.
    bytes.extend_from_slice(b"e");
    assert_eq!(allocs(), 1);
    assert_eq!(reallocs(), 1);
    assert_eq!(bytes.capacity(), 8);
    assert_eq!(bytes, b"abcde");

    drop(bytes);
    assert_eq!(deallocs(), 1);
}

fn mutable_view_makes_clones_copy() {
    reset();
    let mut bytes = RcBytes::from(b"fix");
    assert_eq!(allocs(), 1);

    // Handing out a view is free for a sole owner.
    *bytes.get_mut(0).unwrap() = b'm';
    assert_eq!(allocs(), 1);
    assert_eq!(reallocs(), 0);

    // But it withdraws the buffer, so the next clone pays for a copy.
    let copy = bytes.clone();
    assert_eq!(allocs(), 2);
    assert_ne!(copy.as_ptr(), bytes.as_ptr());

    // Appending reopens sharing; the clone after it is free again.
    bytes.push(b'!');
    let shared = bytes.clone();
    assert_eq!(allocs(), 2);
    assert_eq!(shared.as_ptr(), bytes.as_ptr());
    assert_eq!(shared, b"mix!");

    drop(shared);
    drop(bytes);
    assert_eq!(deallocs(), 1);
    drop(copy);
    assert_eq!(deallocs(), 2);
}

fn atomic_handles_free_exactly_once() {
    reset();
    let source = ArcBytes::from(b"atomic");
    let first = source.clone();
    let second = first.clone();
    assert_eq!(allocs(), 1);

    drop(first);
    drop(second);
    assert_eq!(deallocs(), 0);
    drop(source);
    assert_eq!(deallocs(), 1);
}

fn concurrent_clone_drop_storm_frees_once() {
    reset();
    let source = ArcBytes::from(b"storm payload");

    let workers: [_; 4] = std::array::from_fn(|_| {
        let seed = source.clone();
        thread::spawn(move || {
            for _ in 0..64 {
                let extra = seed.clone();
                assert_eq!(extra, b"storm payload");
                drop(extra);
            }
        })
    });
    for worker in workers {
        worker.join().unwrap();
    }

    // All sharers are gone; releasing the last handle frees the buffer
    // exactly once even after the clone/drop storm.
    assert_eq!(source, b"storm payload");
    let before = deallocs();
    drop(source);
    assert_eq!(deallocs(), before + 1);
}
