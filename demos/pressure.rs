//! A walkthrough of the out-of-memory protocol on a toy heap.
//!
//! The pool is given a deliberately tiny memory source. When it runs dry, a
//! reclaim handler steps in and raises the source's limit - standing in for
//! a real handler that would drop caches or otherwise free memory - and the
//! stalled allocation goes through on retry. Once the handler has nothing
//! left to give, exhaustion surfaces, and we treat it the only way it can be
//! treated: log and abort.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pool_allocator::{MemorySource, PoolAlloc, ToyHeap};

/// A toy heap whose limit lives behind a shared handle, so a reclaim handler
/// can raise it from outside the pool.
struct ThrottledHeap {
    inner: ToyHeap,
    limit: Arc<AtomicUsize>,
}

#[derive(Debug)]
struct Throttled;

impl MemorySource for ThrottledHeap {
    type Err = Throttled;

    unsafe fn raw_allocate(&mut self, size: usize) -> Result<NonNull<u8>, Throttled> {
        self.inner.limit = self.limit.load(Ordering::SeqCst);
        self.inner.raw_allocate(size).map_err(|_| Throttled)
    }

    unsafe fn raw_deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        self.inner.raw_deallocate(ptr, size)
    }
}

fn main() {
    env_logger::init();

    // Start with just enough memory for the first refill
    let limit = Arc::new(AtomicUsize::new(320));
    let source = ThrottledHeap {
        inner: ToyHeap::default(),
        limit: limit.clone(),
    };
    let mut pool = PoolAlloc::new(source);

    // The handler grants another 4 KiB each time it runs, up to the toy
    // heap's real capacity
    let grants = Arc::new(AtomicUsize::new(0));
    let handler_grants = grants.clone();
    let handler_limit = limit.clone();
    pool.set_reclaim_handler(Some(Box::new(move || {
        let current = handler_limit.load(Ordering::SeqCst);
        if current >= ToyHeap::capacity() {
            println!("reclaim handler: nothing left to free");
            return false;
        }
        let raised = (current + 4096).min(ToyHeap::capacity());
        handler_limit.store(raised, Ordering::SeqCst);
        handler_grants.fetch_add(1, Ordering::SeqCst);
        println!("reclaim handler: raised the limit to {} bytes", raised);
        true
    })));

    println!("Allocating 64-byte objects until the reclaim handler runs...");
    let mut held = Vec::new();
    for i in 0.. {
        match pool.allocate(64) {
            Ok(ptr) => held.push(ptr),
            Err(err) => {
                // Terminal exhaustion is not a recoverable condition; a real
                // program would abort here, and so do we.
                let (_, stats) = pool.stats();
                eprintln!("allocation {} failed: {}", i, err);
                eprintln!("final stats: {:?}", stats);
                std::process::abort();
            }
        }
        if grants.load(Ordering::SeqCst) >= 3 {
            break;
        }
    }

    let (validity, stats) = pool.stats();
    println!(
        "Held {} objects; handler ran {} times; stats: {:?}",
        held.len(),
        grants.load(Ordering::SeqCst),
        stats,
    );
    assert!(validity.is_valid());

    for ptr in held.drain(..) {
        unsafe { pool.deallocate(ptr, 64) };
    }
    let (validity, stats) = pool.stats();
    println!("All returned; free bytes now {}", stats.free_bytes);
    assert!(validity.is_valid());
}
