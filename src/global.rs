//! Thread-safe fronts for the pool: a spin-locked wrapper and a
//! `GlobalAlloc` implementation.
//!
//! ## [`LockedAlloc`](struct.LockedAlloc.html)
//!
//! A `LockedAlloc` wraps a [`PoolAlloc`](../pool/struct.PoolAlloc.html) in a
//! spin lock, making it thread-safe. One lock covers the whole surface -
//! allocate, deallocate, the reclaim-handler setter, stats - so the core can
//! stay lock-free internally.
//!
//! ## [`PooledMalloc`](struct.PooledMalloc.html)
//!
//! A `PooledMalloc` combines `LockedAlloc` with the `malloc`-backed
//! [`LibcSource`](../source/struct.LibcSource.html) and implements
//! [`core::alloc::GlobalAlloc`](https://doc.rust-lang.org/nightly/core/alloc/trait.GlobalAlloc.html),
//! so it can be installed with `#[global_allocator]`.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::MaybeUninit;
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::{Mutex, MutexGuard};

use crate::pool::{PoolAlloc, PoolStats, Validity};
use crate::primary::ReclaimHandler;
use crate::source::{LibcSource, MemorySource};
use crate::{ALIGN, MAX_BYTES};

/// The strongest alignment `malloc` guarantees on the platforms we support;
/// requests aligned beyond this are refused, since the source has no aligned
/// allocation primitive.
const MALLOC_ALIGN: usize = 16;

/// A thread-safe allocator, using a spin lock around a `PoolAlloc`.
///
/// Thread-safety is required for an allocator to be used as a global
/// allocator, so that was easy to add with a spin lock. The pool is built
/// lazily on first use, because a generic `S: Default` cannot be constructed
/// in a `const fn`.
///
/// A reclaim handler installed through this wrapper runs *with the lock
/// held*: it must not call back into this same allocator, or it will
/// deadlock.
pub struct LockedAlloc<S> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    pool: MaybeUninit<Mutex<PoolAlloc<S>>>,
}

impl<S: MemorySource + Default> Default for LockedAlloc<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> LockedAlloc<S> {
    pub const fn new() -> Self {
        LockedAlloc {
            init: AtomicU8::new(0),
            pool: MaybeUninit::uninit(),
        }
    }
}

impl<S: MemorySource + Default> LockedAlloc<S> {
    /// Lock and get the underlying pool, initializing it on first call.
    ///
    /// # Safety
    ///
    /// This is unsafe because it blocks allocation while the mutex guard is
    /// in place.
    pub unsafe fn get_pool(&self) -> MutexGuard<PoolAlloc<S>> {
        // The plan:
        // - If initialization hasn't started (0), claim it (1), build the
        //   pool, and publish (2)
        // - If it has started but not completed (1), spin until it's done (2)
        // - If it finished initializing (2), continue
        //
        // The ordering here is SeqCst because that's the safest, if not the
        // most efficient.
        let state = self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);

        match state {
            Err(2) => {
                // Fully initialized, no need to do anything
            }
            Ok(0) => {
                // We claimed initialization, so we do it now.
                let pool_loc: *const Mutex<PoolAlloc<S>> = self.pool.as_ptr();
                let pool_mut = pool_loc as *mut Mutex<PoolAlloc<S>>;
                pool_mut.write(Mutex::new(PoolAlloc::default()));

                // Let other threads know the mutex and pool are now ready
                self.init.store(2, Ordering::SeqCst);
            }
            Err(1) => {
                // Some other thread is currently initializing. We wait for it.
                loop {
                    core::hint::spin_loop();
                    match self.init.load(Ordering::SeqCst) {
                        1 => continue,
                        2 => break,
                        state => panic!("Unexpected state {}", state),
                    }
                }
            }
            Ok(v) => panic!("Unexpected OK state loaded: {}", v),
            Err(v) => panic!("Unexpected Err state loaded: {}", v),
        }

        let mutex = self.pool.as_ptr().as_ref().unwrap();
        mutex.lock()
    }

    /// Check invariants and gather counts, under the lock.
    pub fn stats(&self) -> (Validity, PoolStats) {
        unsafe { self.get_pool().stats() }
    }

    /// Install, replace, or remove the reclaim handler, under the lock.
    pub fn set_reclaim_handler(
        &self,
        handler: Option<ReclaimHandler>,
    ) -> Option<ReclaimHandler> {
        unsafe { self.get_pool().set_reclaim_handler(handler) }
    }
}

/// The `malloc`-backed pool, usable as the global allocator.
#[derive(Default)]
pub struct PooledMalloc {
    alloc: LockedAlloc<LibcSource>,
}

impl PooledMalloc {
    pub const fn new() -> Self {
        PooledMalloc {
            alloc: LockedAlloc::new(),
        }
    }

    pub fn stats(&self) -> (Validity, PoolStats) {
        self.alloc.stats()
    }

    pub fn set_reclaim_handler(
        &self,
        handler: Option<ReclaimHandler>,
    ) -> Option<ReclaimHandler> {
        self.alloc.set_reclaim_handler(handler)
    }
}

unsafe impl GlobalAlloc for PooledMalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut pool = self.alloc.get_pool();
        let result = if layout.align() <= ALIGN {
            pool.allocate(layout.size())
        } else if layout.align() <= MALLOC_ALIGN {
            // The pool only guarantees ALIGN; malloc guarantees a bit more,
            // so over-aligned requests skip the pool tier entirely.
            pool.primary.allocate(layout.size())
        } else {
            return null_mut();
        };

        match result {
            Ok(ptr) => ptr.as_ptr(),
            // Exhaustion is unrecoverable; null lets the runtime escalate
            // through handle_alloc_error.
            Err(_) => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let ptr = match NonNull::new(ptr) {
            Some(p) => p,
            None => return,
        };
        let mut pool = self.alloc.get_pool();
        if layout.align() <= ALIGN {
            pool.deallocate(ptr, layout.size());
        } else if layout.align() <= MALLOC_ALIGN {
            // Mirrors the routing in alloc exactly
            pool.primary.deallocate(ptr, layout.size());
        }
    }
}

// The pool forwards everything above MAX_BYTES, so the two-tier routing in
// alloc only matters if the threshold is a real threshold.
static_assertions::const_assert!(MAX_BYTES > ALIGN);

#[cfg(test)]
mod tests {
    use super::*;

    use alloc::boxed::Box;

    use test_log::test;

    use crate::source::ToyHeap;

    #[test]
    fn locked_alloc_initializes_lazily() {
        let locked: LockedAlloc<ToyHeap> = LockedAlloc::new();

        let ptr = unsafe { locked.get_pool().allocate(16) }.unwrap();
        unsafe { locked.get_pool().deallocate(ptr, 16) };

        let (validity, stats) = locked.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.free_blocks[1], 20);
    }

    #[test]
    fn handler_setter_goes_through_the_lock() {
        let locked: LockedAlloc<ToyHeap> = LockedAlloc::new();
        assert!(locked.set_reclaim_handler(Some(Box::new(|| false))).is_none());
        assert!(locked.set_reclaim_handler(None).is_some());
    }
}
