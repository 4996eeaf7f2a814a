//! The first-tier allocator: a raw source plus an out-of-memory protocol.
//!
//! [`PrimaryAlloc`](struct.PrimaryAlloc.html) forwards every request to its
//! [`MemorySource`](../source/trait.MemorySource.html). What it adds is the
//! retry protocol: when the source fails, an installed
//! [`MemoryReclaimer`](trait.MemoryReclaimer.html) is asked to free memory
//! elsewhere, and the request is retried for as long as the reclaimer claims
//! progress is possible. With no reclaimer, or once it gives up, the result
//! is an [`ExhaustedError`](struct.ExhaustedError.html) - which callers are
//! required to treat as fatal.

use alloc::boxed::Box;

use core::ptr::NonNull;

use thiserror::Error;

use crate::source::MemorySource;

/// A last-resort memory-pressure strategy.
///
/// `try_reclaim` is expected to release memory held elsewhere in the process
/// (dropping caches, say) and report whether it believes another allocation
/// attempt is worth making. Returning `true` without freeing anything will
/// loop forever; that is the reclaimer's contract to uphold, not ours.
pub trait MemoryReclaimer {
    fn try_reclaim(&mut self) -> bool;
}

impl<F: FnMut() -> bool> MemoryReclaimer for F {
    fn try_reclaim(&mut self) -> bool {
        self()
    }
}

/// The boxed form a reclaimer is stored in.
pub type ReclaimHandler = Box<dyn MemoryReclaimer + Send>;

/// The memory source failed and no reclaimer could help.
///
/// This is not a recoverable condition: an allocator is the last line of
/// defense, and a caller receiving this error is contractually expected to
/// treat it as fatal (log and abort, or let the runtime abort via
/// `handle_alloc_error`). It is surfaced as an error rather than an abort
/// so that the decision stays with the top level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("memory source exhausted while requesting {requested} bytes")]
pub struct ExhaustedError {
    /// The request size that could not be satisfied.
    pub requested: usize,
}

/// The first-tier allocator: a memory source and a reclaim handler slot.
///
/// Not thread-safe; all state is instance-owned and unprotected. Multi-
/// threaded callers must serialize externally (see
/// [`LockedAlloc`](../global/struct.LockedAlloc.html)).
pub struct PrimaryAlloc<S> {
    pub source: S,
    reclaimer: Option<ReclaimHandler>,
}

impl<S: MemorySource + Default> Default for PrimaryAlloc<S> {
    fn default() -> Self {
        PrimaryAlloc::new(S::default())
    }
}

impl<S: MemorySource> PrimaryAlloc<S> {
    /// Create a new `PrimaryAlloc` with no reclaim handler installed.
    pub fn new(source: S) -> Self {
        PrimaryAlloc {
            source,
            reclaimer: None,
        }
    }

    /// Allocate `n` bytes, retrying under the reclaim protocol.
    ///
    /// On source failure the installed reclaimer is consulted; each time it
    /// reports progress the source is tried again. The loop is unbounded by
    /// design - it ends only with a pointer, or with `ExhaustedError` once
    /// there is no reclaimer left to ask (or it gives up).
    pub fn allocate(&mut self, n: usize) -> Result<NonNull<u8>, ExhaustedError> {
        loop {
            if let Ok(ptr) = unsafe { self.source.raw_allocate(n) } {
                return Ok(ptr);
            }
            if let Some(ref mut handler) = self.reclaimer {
                if handler.try_reclaim() {
                    continue;
                }
            }
            return Err(ExhaustedError { requested: n });
        }
    }

    /// Allocate `n` bytes with a single best-effort attempt - no reclaim
    /// protocol, no error detail. The pool's arena-growth path wants exactly
    /// this: it has its own fallbacks to try before escalating.
    pub fn try_allocate(&mut self, n: usize) -> Option<NonNull<u8>> {
        unsafe { self.source.raw_allocate(n).ok() }
    }

    /// Return a block to the source unconditionally.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate`, `try_allocate`, or
    /// `reallocate` on this allocator with the same size `n`, and must not be
    /// used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, n: usize) {
        self.source.raw_deallocate(ptr, n);
    }

    /// Resize a block, preserving the first `min(old_n, new_n)` bytes, with
    /// the same retry protocol as `allocate`.
    ///
    /// # Safety
    ///
    /// Same contract as `deallocate` for `(ptr, old_n)`. On success the old
    /// pointer is dead; on error it remains valid.
    pub unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        old_n: usize,
        new_n: usize,
    ) -> Result<NonNull<u8>, ExhaustedError> {
        loop {
            if let Ok(moved) = self.source.raw_reallocate(ptr, old_n, new_n) {
                return Ok(moved);
            }
            if let Some(ref mut handler) = self.reclaimer {
                if handler.try_reclaim() {
                    continue;
                }
            }
            return Err(ExhaustedError { requested: new_n });
        }
    }

    /// Install, replace, or remove the reclaim handler, returning whatever
    /// was there before.
    pub fn set_reclaim_handler(
        &mut self,
        handler: Option<ReclaimHandler>,
    ) -> Option<ReclaimHandler> {
        core::mem::replace(&mut self.reclaimer, handler)
    }
}
