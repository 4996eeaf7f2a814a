//! The second-tier pool allocator: segregated free lists over a bump arena.
//!
//! [`PoolAlloc`](struct.PoolAlloc.html) serves requests of up to
//! [`MAX_BYTES`](../constant.MAX_BYTES.html) bytes from sixteen free lists,
//! one per size class (8, 16, ..., 128 bytes). A hit on a list is a pop, no
//! system call. A miss triggers a batched refill: a chunk of up to twenty
//! blocks is carved from the arena, one block is returned, and the rest are
//! threaded onto the list.
//!
//! The arena itself grows through the first tier. When even that fails, the
//! pool degrades gracefully: it cannibalizes a block from a larger class to
//! keep making progress, and only escalates to the full reclaim protocol once
//! nothing is left anywhere.

use core::ptr::{null_mut, NonNull};

use crate::freelist::FreeList;
use crate::primary::{ExhaustedError, PrimaryAlloc, ReclaimHandler};
use crate::source::MemorySource;
use crate::{ALIGN, MAX_BYTES, NUM_CLASSES};

/// How many blocks a refill asks the arena for. The chunk may come up short;
/// it is never empty on success.
const CHUNK_OBJS: usize = 20;

/// Round a small request up to its size class boundary.
fn round_up(bytes: usize) -> usize {
    (bytes + ALIGN - 1) & !(ALIGN - 1)
}

/// Index of the free list serving `bytes`-byte requests. `bytes` must be in
/// `1..=MAX_BYTES`.
fn class_index(bytes: usize) -> usize {
    (bytes + ALIGN - 1) / ALIGN - 1
}

/// The bump span: memory obtained in bulk, not yet handed out.
///
/// Covers `[cursor, cursor + remaining)`. Everything below the cursor has
/// already left the arena, either to a caller or onto a free list.
struct Arena {
    cursor: *mut u8,
    remaining: usize,
}

// An Arena is sendable: the span it points into is owned by the struct and
// moves with it. It is not Sync; concurrent access needs an external lock.
unsafe impl Send for Arena {}

impl Arena {
    const fn new() -> Self {
        Arena {
            cursor: null_mut(),
            remaining: 0,
        }
    }

    /// Carve `bytes` off the front of the span and advance.
    ///
    /// # Safety
    ///
    /// `bytes` must be nonzero and no more than `remaining`.
    unsafe fn carve(&mut self, bytes: usize) -> NonNull<u8> {
        debug_assert!(bytes > 0 && bytes <= self.remaining);
        let ptr = NonNull::new_unchecked(self.cursor);
        self.cursor = self.cursor.add(bytes);
        self.remaining -= bytes;
        ptr
    }

    /// Replace the span wholesale. The previous span must already be empty or
    /// salvaged; this does not free anything.
    fn install(&mut self, ptr: NonNull<u8>, len: usize) {
        self.cursor = ptr.as_ptr();
        self.remaining = len;
    }
}

/// The pool allocator.
///
/// Owns a [`PrimaryAlloc`](../primary/struct.PrimaryAlloc.html) for large
/// requests and arena growth, one [`FreeList`](../freelist/struct.FreeList.html)
/// per size class, and the bump arena. All state is instance-owned; nothing
/// here is thread-safe (see [`LockedAlloc`](../global/struct.LockedAlloc.html)).
///
/// Memory pulled into the arena is never returned to the source; freed small
/// blocks recirculate through the free lists for the allocator's lifetime.
pub struct PoolAlloc<S> {
    pub primary: PrimaryAlloc<S>,
    lists: [FreeList; NUM_CLASSES],
    arena: Arena,
    heap_size: usize,
}

impl<S: MemorySource + Default> Default for PoolAlloc<S> {
    fn default() -> Self {
        PoolAlloc::new(S::default())
    }
}

impl<S: MemorySource> PoolAlloc<S> {
    /// Create a pool with empty free lists and an empty arena.
    pub fn new(source: S) -> Self {
        const EMPTY: FreeList = FreeList::new();
        PoolAlloc {
            primary: PrimaryAlloc::new(source),
            lists: [EMPTY; NUM_CLASSES],
            arena: Arena::new(),
            heap_size: 0,
        }
    }

    /// Allocate `n` bytes (`n > 0`).
    ///
    /// Requests over `MAX_BYTES` are forwarded to the first tier verbatim,
    /// retry protocol and all. Small requests round up to their class and pop
    /// the class's free list, refilling it from the arena on a miss.
    ///
    /// The returned pointer is ALIGN-aligned and writable for the full
    /// rounded class size.
    pub fn allocate(&mut self, n: usize) -> Result<NonNull<u8>, ExhaustedError> {
        debug_assert!(n > 0);
        if n > MAX_BYTES {
            return self.primary.allocate(n);
        }
        if let Some(ptr) = self.lists[class_index(n)].pop() {
            return Ok(ptr);
        }
        self.refill(round_up(n))
    }

    /// Return a block to the pool.
    ///
    /// Small blocks go back onto their class's free list in O(1); they are
    /// never returned to the source. Large blocks go back to the first tier.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this pool with the same
    /// size `n`, and must not be used afterwards. No provenance check is
    /// made: a foreign pointer/size pair corrupts the free lists.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, n: usize) {
        debug_assert!(n > 0);
        if n > MAX_BYTES {
            self.primary.deallocate(ptr, n);
            return;
        }
        self.lists[class_index(n)].push(ptr);
    }

    /// Resize an allocation, preserving the first `min(old_n, new_n)` bytes.
    ///
    /// Two large sizes use the source's resize primitive. A resize within the
    /// same size class is free: the pointer comes back unchanged. Everything
    /// else is allocate-copy-deallocate.
    ///
    /// # Safety
    ///
    /// Same contract as `deallocate` for `(ptr, old_n)`. On success the old
    /// pointer is dead (unless returned unchanged); on error it remains
    /// valid.
    pub unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        old_n: usize,
        new_n: usize,
    ) -> Result<NonNull<u8>, ExhaustedError> {
        debug_assert!(old_n > 0 && new_n > 0);
        if old_n > MAX_BYTES && new_n > MAX_BYTES {
            return self.primary.reallocate(ptr, old_n, new_n);
        }
        if round_up(old_n) == round_up(new_n) {
            return Ok(ptr);
        }
        let new = self.allocate(new_n)?;
        let keep = if old_n < new_n { old_n } else { new_n };
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), keep);
        self.deallocate(ptr, old_n);
        Ok(new)
    }

    /// Allocate room for `count` values of `T`, the element-count adapter
    /// over `allocate`. A zero count is inert and yields `None`.
    ///
    /// `T` must not be more aligned than the pool's ALIGN granularity.
    pub fn allocate_array<T>(&mut self, count: usize) -> Result<Option<NonNull<T>>, ExhaustedError> {
        debug_assert!(core::mem::size_of::<T>() > 0);
        debug_assert!(core::mem::align_of::<T>() <= ALIGN);
        if count == 0 {
            return Ok(None);
        }
        let ptr = self.allocate(count * core::mem::size_of::<T>())?;
        Ok(Some(ptr.cast()))
    }

    /// Return an array allocation. A zero count is inert.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `allocate_array::<T>` on this pool with the
    /// same `count`.
    pub unsafe fn deallocate_array<T>(&mut self, ptr: NonNull<T>, count: usize) {
        if count == 0 {
            return;
        }
        self.deallocate(ptr.cast(), count * core::mem::size_of::<T>());
    }

    /// Install, replace, or remove the first tier's reclaim handler,
    /// returning the previous one.
    pub fn set_reclaim_handler(
        &mut self,
        handler: Option<ReclaimHandler>,
    ) -> Option<ReclaimHandler> {
        self.primary.set_reclaim_handler(handler)
    }

    /// Refill the free list for `size`-byte blocks (`size` a class boundary)
    /// and return one block.
    ///
    /// Asks the arena for a chunk of up to `CHUNK_OBJS` blocks; the first is
    /// the caller's, the rest become the new free list. A single-block chunk
    /// is returned whole with nothing threaded.
    fn refill(&mut self, size: usize) -> Result<NonNull<u8>, ExhaustedError> {
        debug_assert_eq!(size % ALIGN, 0);
        let (chunk, got) = self.chunk_alloc(size, CHUNK_OBJS)?;
        if got > 1 {
            unsafe {
                let rest = NonNull::new_unchecked(chunk.as_ptr().add(size));
                self.lists[class_index(size)].absorb_chunk(rest, got - 1, size);
            }
        }
        Ok(chunk)
    }

    /// Carve a chunk of up to `nobjs` blocks of `size` bytes out of the
    /// arena, growing or scavenging as needed. Returns the chunk and the
    /// number of blocks actually delivered - at least one.
    ///
    /// The cascade, per pass:
    ///
    /// 1. The span covers the full request: carve it.
    /// 2. The span covers at least one block: carve what fits.
    /// 3. Otherwise, grow. Any leftover sliver of the span is first salvaged
    ///    onto the free list matching its exact size. Then, in order:
    ///    a best-effort request to the first tier; failing that, cannibalize
    ///    a block from the nearest non-empty class at or above `size`
    ///    (classes below are necessarily empty already, so the scan only goes
    ///    up); failing that, the first tier again but under the full reclaim
    ///    protocol. Whatever arrives becomes the new span, and the pass
    ///    repeats - guaranteed to carve this time.
    fn chunk_alloc(
        &mut self,
        size: usize,
        nobjs: usize,
    ) -> Result<(NonNull<u8>, usize), ExhaustedError> {
        loop {
            let total = size * nobjs;
            if self.arena.remaining >= total {
                return Ok((unsafe { self.arena.carve(total) }, nobjs));
            }
            if self.arena.remaining >= size {
                let got = self.arena.remaining / size;
                return Ok((unsafe { self.arena.carve(got * size) }, got));
            }

            // Growth scales with both the immediate need and with history, so
            // the calls out to the source get rarer as the pool gets bigger.
            let bytes_to_get = 2 * total + round_up(self.heap_size >> 4);

            let leftover = self.arena.remaining;
            if leftover > 0 {
                // The sliver is a whole number of ALIGN units by
                // construction, so it fits some class exactly.
                debug_assert_eq!(leftover % ALIGN, 0);
                let sliver = unsafe { self.arena.carve(leftover) };
                unsafe { self.lists[class_index(leftover)].push(sliver) };
            }

            if let Some(span) = self.primary.try_allocate(bytes_to_get) {
                self.heap_size += bytes_to_get;
                self.arena.install(span, bytes_to_get);
                continue;
            }

            // Degraded recovery: sacrifice one block from a larger class.
            let mut class_bytes = size;
            let mut recovered = false;
            while class_bytes <= MAX_BYTES {
                if let Some(block) = self.lists[class_index(class_bytes)].pop() {
                    self.arena.install(block, class_bytes);
                    recovered = true;
                    break;
                }
                class_bytes += ALIGN;
            }
            if recovered {
                continue;
            }

            // Nothing reachable through the pool either. Last resort: the
            // first tier with the full reclaim protocol. An error here is
            // terminal exhaustion.
            let span = self.primary.allocate(bytes_to_get)?;
            self.heap_size += bytes_to_get;
            self.arena.install(span, bytes_to_get);
        }
    }

    /// Check the pool's invariants and gather counts.
    pub fn stats(&self) -> (Validity, PoolStats) {
        let mut validity = Validity::default();
        let mut stats = PoolStats::default();

        for (i, list) in self.lists.iter().enumerate() {
            let class_bytes = (i + 1) * ALIGN;
            for block in list.iter() {
                if block.as_ptr() as usize % ALIGN != 0 {
                    validity.misaligned_blocks += 1;
                }
                stats.free_blocks[i] += 1;
                stats.free_bytes += class_bytes;
            }
        }

        if self.arena.cursor as usize % ALIGN != 0 {
            validity.misaligned_cursor = true;
        }
        if self.arena.remaining % ALIGN != 0 {
            validity.ragged_arena = true;
        }

        stats.arena_remaining = self.arena.remaining;
        stats.heap_size = self.heap_size;

        (validity, stats)
    }
}

/// Validity contains a representation of all invalid states found in a pool.
#[derive(Default, Debug)]
pub struct Validity {
    /// Free blocks whose address is not a multiple of ALIGN.
    ///
    /// This likely indicates free-list corruption from a bad deallocate.
    pub misaligned_blocks: usize,

    /// The arena cursor is not ALIGN-aligned. This shouldn't occur.
    pub misaligned_cursor: bool,

    /// The arena's remaining span is not a whole number of ALIGN units.
    ///
    /// This would strand bytes the salvage step can't classify.
    pub ragged_arena: bool,
}

impl Validity {
    /// Returns a boolean - a simple check that nothing was flagged
    pub fn is_valid(&self) -> bool {
        self.misaligned_blocks == 0 && !self.misaligned_cursor && !self.ragged_arena
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug)]
pub struct PoolStats {
    /// Free block count per size class, smallest class first.
    pub free_blocks: [usize; NUM_CLASSES],
    /// Total bytes sitting on free lists.
    pub free_bytes: usize,
    /// Bytes left in the arena's current span.
    pub arena_remaining: usize,
    /// Total bytes ever pulled from the first tier by arena growth.
    pub heap_size: usize,
}
