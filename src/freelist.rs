//! Intrusive free lists: one singly linked chain of same-size blocks.
//!
//! Every block on a [`FreeList`](struct.FreeList.html) has the same size -
//! the pool keeps one list per size class - so the list stores no sizes at
//! all. The link lives *inside* the free block: a
//! [`FreeLink`](struct.FreeLink.html) node is written over the first bytes of
//! the block's storage when it is pushed, and is dead the moment the block is
//! popped and handed back to a caller.

use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::ALIGN;

/// The link node written into a free block.
///
/// This only has meaning while the block is on a list; a block owned by a
/// caller is theirs in full, and the allocator never looks at it.
#[repr(C)]
pub struct FreeLink {
    next: Option<NonNull<FreeLink>>,
}

// A link must fit in - and be placeable at the start of - the smallest class.
const_assert!(core::mem::size_of::<FreeLink>() <= ALIGN);
const_assert!(core::mem::align_of::<FreeLink>() <= ALIGN);

/// The head of one size class's chain of free blocks.
///
/// Push and pop are O(1) and touch nothing but the head and the first node.
/// The list exclusively owns every block on it; ownership transfers out at
/// `pop` and back in at `push`.
pub struct FreeList {
    head: Option<NonNull<FreeLink>>,
}

// A FreeList is sendable: the whole chain of blocks is owned by the struct,
// and moves with it. It is not Sync; concurrent access needs an external
// lock.
unsafe impl Send for FreeList {}

impl Default for FreeList {
    fn default() -> Self {
        FreeList::new()
    }
}

impl FreeList {
    pub const fn new() -> Self {
        FreeList { head: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Push a block onto the list, taking ownership of it.
    ///
    /// # Safety
    ///
    /// `ptr` must point to unused, ALIGN-aligned memory of this list's class
    /// size, owned by the caller, and ownership of it must transfer to the
    /// list with this call.
    pub unsafe fn push(&mut self, ptr: NonNull<u8>) {
        let node: NonNull<FreeLink> = ptr.cast();
        core::ptr::write(node.as_ptr(), FreeLink { next: self.head });
        self.head = Some(node);
    }

    /// Pop the head block, transferring ownership to the caller.
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = self.head.take()?;
        self.head = unsafe { node.as_ref().next };
        Some(node.cast())
    }

    /// Thread `count` contiguous blocks of `block_size` bytes onto the list,
    /// in address order, ahead of whatever is already there.
    ///
    /// This is the refill step: a chunk carved from the arena becomes `count`
    /// linked blocks in one pass.
    ///
    /// # Safety
    ///
    /// `chunk` must point to `count * block_size` bytes of unused,
    /// ALIGN-aligned memory owned by the caller, `block_size` must be this
    /// list's class size, and `count` must be nonzero.
    pub unsafe fn absorb_chunk(&mut self, chunk: NonNull<u8>, count: usize, block_size: usize) {
        debug_assert!(count > 0);
        debug_assert_eq!(block_size % ALIGN, 0);

        // Link back to front, so each node points at the one after it and the
        // last one picks up the old head.
        let mut next = self.head;
        for i in (0..count).rev() {
            let ptr = chunk.as_ptr().add(i * block_size);
            let node: NonNull<FreeLink> = NonNull::new_unchecked(ptr).cast();
            core::ptr::write(node.as_ptr(), FreeLink { next });
            next = Some(node);
        }
        self.head = next;
    }

    pub fn iter(&self) -> FreeListIter {
        FreeListIter {
            next: self.head,
        }
    }

    /// Number of blocks on the list. O(n); this is for tests and stats.
    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

/// Walks a list without disturbing it, yielding each block's address.
pub struct FreeListIter {
    next: Option<NonNull<FreeLink>>,
}

impl Iterator for FreeListIter {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<NonNull<u8>> {
        let node = self.next.take()?;
        self.next = unsafe { node.as_ref().next };
        Some(node.cast())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    // A buffer aligned well enough to play the part of pool memory.
    #[repr(align(16))]
    struct Buffer([u8; 256]);

    #[test]
    fn push_pop_is_lifo() {
        let mut buf = Buffer([0; 256]);
        let base = buf.0.as_mut_ptr();
        let mut list = FreeList::new();
        assert!(list.is_empty());

        unsafe {
            let a = NonNull::new_unchecked(base);
            let b = NonNull::new_unchecked(base.add(16));
            list.push(a);
            list.push(b);

            assert_eq!(list.len(), 2);
            assert_eq!(list.pop(), Some(b));
            assert_eq!(list.pop(), Some(a));
        }
        assert_eq!(list.pop(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn absorb_chunk_threads_in_address_order() {
        let mut buf = Buffer([0; 256]);
        let base = buf.0.as_mut_ptr();
        let mut list = FreeList::new();

        unsafe {
            // An existing block, which should end up behind the chunk
            let old = NonNull::new_unchecked(base.add(240));
            list.push(old);

            let chunk = NonNull::new_unchecked(base);
            list.absorb_chunk(chunk, 5, 16);

            assert_eq!(list.len(), 6);
            let addresses: [usize; 6] = {
                let mut found = [0; 6];
                for (i, ptr) in list.iter().enumerate() {
                    found[i] = ptr.as_ptr() as usize - base as usize;
                }
                found
            };
            assert_eq!(addresses, [0, 16, 32, 48, 64, 240]);
        }
    }
}
