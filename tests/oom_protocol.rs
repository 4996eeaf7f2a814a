//! Tests of the exhaustion paths: the reclaim protocol, degraded recovery
//! from larger classes, and terminal exhaustion.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use pool_allocator::{MemorySource, PoolAlloc, ToyHeap};

use test_log::test;

/// A toy heap with a switch: while `failing` is set, every request errors.
///
/// The switch is shared, so a reclaim handler can model "freeing memory
/// elsewhere" by flipping it off.
struct FlakySource {
    inner: ToyHeap,
    failing: Arc<AtomicBool>,
}

#[derive(Debug)]
struct FlakyFailure;

impl FlakySource {
    fn new(failing: Arc<AtomicBool>) -> Self {
        FlakySource {
            inner: ToyHeap::default(),
            failing,
        }
    }
}

impl MemorySource for FlakySource {
    type Err = FlakyFailure;

    unsafe fn raw_allocate(&mut self, size: usize) -> Result<NonNull<u8>, FlakyFailure> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FlakyFailure);
        }
        self.inner.raw_allocate(size).map_err(|_| FlakyFailure)
    }

    unsafe fn raw_deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        self.inner.raw_deallocate(ptr, size)
    }
}

#[test]
fn terminal_exhaustion_surfaces_as_an_error() {
    let failing = Arc::new(AtomicBool::new(true));
    let mut pool = PoolAlloc::new(FlakySource::new(failing));

    // Empty arena, empty lists, failing source, no handler: nothing to be
    // done for either tier.
    assert!(pool.allocate(8).is_err());
    assert!(pool.allocate(200).is_err());
}

#[test]
fn handler_unblocks_a_small_allocation() {
    let failing = Arc::new(AtomicBool::new(true));
    let mut pool = PoolAlloc::new(FlakySource::new(failing.clone()));

    // The handler "frees memory elsewhere": the source works again after it
    // runs once.
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let switch = failing.clone();
    pool.set_reclaim_handler(Some(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        switch.store(false, Ordering::SeqCst);
        true
    })));

    let ptr = pool.allocate(8).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 8, 0);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // With the source healthy again, the handler stays quiet
    pool.allocate(8).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[test]
fn handler_unblocks_a_large_allocation() {
    let failing = Arc::new(AtomicBool::new(true));
    let mut pool = PoolAlloc::new(FlakySource::new(failing.clone()));

    let switch = failing.clone();
    pool.set_reclaim_handler(Some(Box::new(move || {
        switch.store(false, Ordering::SeqCst);
        true
    })));

    // Large requests forward to the first tier, protocol included
    assert!(pool.allocate(500).is_ok());
}

/// Builds the canonical degraded-recovery setup: a pool whose source is now
/// failing, with an empty arena, an empty 8-byte list, and blocks on the
/// 16-byte list.
fn starved_pool() -> (PoolAlloc<FlakySource>, Arc<AtomicBool>) {
    let failing = Arc::new(AtomicBool::new(false));
    let mut pool = PoolAlloc::new(FlakySource::new(failing.clone()));
    pool.primary.source.inner.limit = 320;

    // First growth: exactly 320 bytes; 160 carved into twenty 8-byte blocks
    pool.allocate(8).unwrap();
    // Second refill can't grow, so it carves the 160 remaining into ten
    // 16-byte blocks, leaving the arena empty
    pool.allocate(16).unwrap();
    let (_, stats) = pool.stats();
    assert_eq!(stats.arena_remaining, 0);
    assert_eq!(stats.free_blocks[0], 19);
    assert_eq!(stats.free_blocks[1], 9);

    // Drain the 8-byte class completely
    for _ in 0..19 {
        pool.allocate(8).unwrap();
    }
    let (_, stats) = pool.stats();
    assert_eq!(stats.free_blocks[0], 0);

    failing.store(true, Ordering::SeqCst);
    (pool, failing)
}

#[test]
fn degraded_recovery_cannibalizes_a_larger_class() {
    let (mut pool, _failing) = starved_pool();

    // The source is dead, but the 16-byte list still has blocks: an 8-byte
    // request sacrifices one of them and splits it.
    let ptr = pool.allocate(8).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 8, 0);

    let (validity, stats) = pool.stats();
    assert!(validity.is_valid());
    assert_eq!(stats.free_blocks[1], 8);
    // The 16-byte block became two 8-byte ones: one returned, one spare
    assert_eq!(stats.free_blocks[0], 1);
    // Cannibalized memory is not new memory
    assert_eq!(stats.heap_size, 320);
}

#[test]
fn degraded_recovery_never_scans_downward() {
    let (mut pool, _failing) = starved_pool();

    // Blocks exist in the 16-byte class, but a 48-byte request only scans
    // from 48 upward - smaller classes are off limits by design - so it
    // exhausts.
    assert!(pool.allocate(48).is_err());

    // The smaller classes were left untouched
    let (_, stats) = pool.stats();
    assert_eq!(stats.free_blocks[1], 9);
}

#[test]
fn recovery_keeps_going_while_any_block_remains() {
    let (mut pool, _failing) = starved_pool();

    // Each 16-byte block yields two 8-byte ones; nine blocks make eighteen
    // 8-byte allocations possible with a dead source.
    for _ in 0..18 {
        assert!(pool.allocate(8).is_ok());
    }

    let (_, stats) = pool.stats();
    assert_eq!(stats.free_blocks[0], 0);
    assert_eq!(stats.free_blocks[1], 0);

    // And the nineteenth fails: the pool is truly empty now
    assert!(pool.allocate(8).is_err());
}
