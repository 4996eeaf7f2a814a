#![no_std]

//! A two-tier pool allocator for small objects.
//!
//! The first tier ([`PrimaryAlloc`](primary/struct.PrimaryAlloc.html)) is a
//! thin wrapper around a raw memory source - `malloc` in production - that
//! adds an out-of-memory retry protocol driven by a replaceable
//! [`MemoryReclaimer`](primary/trait.MemoryReclaimer.html).
//!
//! The second tier ([`PoolAlloc`](pool/struct.PoolAlloc.html)) serves
//! allocations of up to [`MAX_BYTES`](constant.MAX_BYTES.html) bytes from
//! sixteen size-class-segregated free lists, refilling each list in batches
//! from a growable bump-pointer arena. Anything larger is forwarded to the
//! first tier untouched.
//!
//! Neither tier is thread-safe on its own; for multi-threaded use - including
//! use as the global allocator - [`LockedAlloc`](global/struct.LockedAlloc.html)
//! wraps a pool in a spin lock, and
//! [`PooledMalloc`](global/struct.PooledMalloc.html) is the concrete
//! `malloc`-backed front that implements
//! [`core::alloc::GlobalAlloc`](https://doc.rust-lang.org/nightly/core/alloc/trait.GlobalAlloc.html).
//!
//! Memory acquired by the arena is never returned to the operating system;
//! freed small blocks are recycled through the free lists for the lifetime of
//! the allocator.

extern crate alloc;

pub mod freelist;
pub mod global;
pub mod pool;
pub mod primary;
pub mod source;

pub use crate::global::{LockedAlloc, PooledMalloc};
pub use crate::pool::{PoolAlloc, PoolStats, Validity};
pub use crate::primary::{ExhaustedError, MemoryReclaimer, PrimaryAlloc, ReclaimHandler};
pub use crate::source::{LibcSource, MemorySource, ToyHeap};

/// Rounding granularity for the pool tier, in bytes. Every size class is a
/// multiple of this, and every pointer the pool hands out is aligned to it.
pub const ALIGN: usize = 8;

/// The largest request the pool tier serves itself; anything bigger goes
/// straight to the first tier.
pub const MAX_BYTES: usize = 128;

/// Number of size classes: one free list each for 8, 16, ..., 128 bytes.
pub const NUM_CLASSES: usize = MAX_BYTES / ALIGN;
