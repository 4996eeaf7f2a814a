//! Raw memory sources: the seam between the allocator and the system.
//!
//! ## [`MemorySource`](trait.MemorySource.html)
//!
//! `MemorySource` is a simple trait interface meant to abstract over the raw
//! allocation primitive underneath the allocator, so that the rest of the
//! crate never calls the system directly.
//!
//! ## [`LibcSource`](struct.LibcSource.html)
//!
//! `LibcSource` is the production source, backed by `malloc`, `free`, and
//! `realloc` from libc.
//!
//! ## [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a static array that can pretend to be a heap, and implements
//! `MemorySource` for such a purpose. It is mainly useful for testing, and
//! carries a soft limit so tests can make it fail on demand.

use core::ptr::NonNull;

use errno::Errno;

use crate::ALIGN;

// Round up value to the nearest multiple of increment
pub(crate) fn round_to(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// An opaque supplier of raw memory.
///
/// The allocator only ever needs three capabilities from the system: get a
/// block, give a block back, and resize a block. A source with no native
/// resize primitive can rely on the provided allocate-copy-free default.
pub trait MemorySource {
    type Err;

    /// Request `size` fresh bytes.
    ///
    /// # Safety
    ///
    /// On success, the returned pointer must address at least `size` bytes of
    /// memory untracked by any other rust code, including the allocator
    /// itself. `size` must be nonzero.
    unsafe fn raw_allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Return a block previously obtained from this source.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `raw_allocate` or `raw_reallocate` on this
    /// same source, with `size` matching that request, and must not be used
    /// afterwards.
    unsafe fn raw_deallocate(&mut self, ptr: NonNull<u8>, size: usize);

    /// Resize a block, preserving the first `min(old_size, new_size)` bytes.
    ///
    /// # Safety
    ///
    /// Same contract as `raw_deallocate` for `(ptr, old_size)`; on success the
    /// old pointer is dead and the new one is live for `new_size` bytes.
    unsafe fn raw_reallocate(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, Self::Err> {
        let new = self.raw_allocate(new_size)?;
        let keep = if old_size < new_size { old_size } else { new_size };
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), keep);
        self.raw_deallocate(ptr, old_size);
        Ok(new)
    }
}

/// The production memory source: `malloc` and friends.
#[derive(Default, Clone, Copy)]
pub struct LibcSource;

impl LibcSource {
    pub const fn new() -> Self {
        LibcSource
    }
}

impl MemorySource for LibcSource {
    type Err = Errno;

    unsafe fn raw_allocate(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        let ptr = libc::malloc(size);
        match NonNull::new(ptr as *mut u8) {
            Some(p) => Ok(p),
            None => Err(errno::errno()),
        }
    }

    unsafe fn raw_deallocate(&mut self, ptr: NonNull<u8>, _size: usize) {
        libc::free(ptr.as_ptr() as *mut libc::c_void);
    }

    unsafe fn raw_reallocate(
        &mut self,
        ptr: NonNull<u8>,
        _old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, Errno> {
        let moved = libc::realloc(ptr.as_ptr() as *mut libc::c_void, new_size);
        match NonNull::new(moved as *mut u8) {
            Some(p) => Ok(p),
            None => Err(errno::errno()),
        }
    }
}

const TOY_HEAP_SIZE: usize = 256 * 1024;

/// A fixed-size in-memory "heap" for tests and demos.
///
/// Serves bump allocations out of an internal array; `raw_deallocate` only
/// tracks what was returned, it never actually reclaims. The `limit` field
/// starts at the full capacity and can be lowered to make the source fail
/// deterministically.
// The array comes first and the struct is 16-aligned so that every bump
// offset (always a multiple of ALIGN) yields an ALIGN-aligned pointer.
#[repr(C, align(16))]
pub struct ToyHeap {
    heap: [u8; TOY_HEAP_SIZE],
    /// Bytes handed out so far - the bump offset into `heap`.
    pub size: usize,
    /// Allocations fail once they would push `size` past this.
    pub limit: usize,
    /// Total bytes "returned", for accounting in tests.
    pub freed: usize,
    /// Number of raw_deallocate calls.
    pub frees: usize,
}

/// The toy heap ran out of array.
#[derive(Debug, PartialEq, Eq)]
pub struct ToyHeapExhausted;

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            heap: [0; TOY_HEAP_SIZE],
            size: 0,
            limit: TOY_HEAP_SIZE,
            freed: 0,
            frees: 0,
        }
    }
}

impl ToyHeap {
    /// Total capacity of the backing array.
    pub const fn capacity() -> usize {
        TOY_HEAP_SIZE
    }
}

impl MemorySource for ToyHeap {
    type Err = ToyHeapExhausted;

    unsafe fn raw_allocate(&mut self, size: usize) -> Result<NonNull<u8>, ToyHeapExhausted> {
        // Serve whole ALIGN units so the bump offset stays aligned.
        let allocating = round_to(size, ALIGN);
        if self.size + allocating > self.limit {
            return Err(ToyHeapExhausted);
        }
        let ptr = self.heap.as_mut_ptr().add(self.size);
        self.size += allocating;
        Ok(NonNull::new_unchecked(ptr))
    }

    unsafe fn raw_deallocate(&mut self, _ptr: NonNull<u8>, size: usize) {
        self.freed += round_to(size, ALIGN);
        self.frees += 1;
    }
}
