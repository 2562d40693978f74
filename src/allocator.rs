//! The shared allocator skeleton. Every strategy in this crate answers the
//! same two questions, "give me `size` bytes" and "take this pointer back",
//! and they all answer them with the same choreography; only five small
//! primitives differ. The skeleton owns the choreography, the strategies own
//! the primitives:
//!
//! ```text
//! allocate(size):  get_free_block(aligned) -> mark_used -> block address
//! free(pointer):   pointer_to_block -> mark_free -> put_free_block
//! ```
//!
//! A strategy may implement any primitive as a no-op when its bookkeeping
//! makes it redundant; the intrusive pool, for instance, has no mark at all
//! because being on its free list *is* the mark.

use core::ptr::NonNull;

use log::{debug, error};

use crate::align::Aligner;

/// Public contract shared by all four allocators.
pub trait Allocator {
    /// Reserves memory for at least `Aligner::align(size)` bytes and
    /// returns the payload address, or `None` when the request cannot be
    /// satisfied. The fixed-geometry strategies reserve exactly the aligned
    /// amount; the free list may hand over a bigger block when carving it
    /// would leave an unusably small remainder. A request of zero bytes
    /// always returns `None`. The returned pointer is distinct from every
    /// currently live pointer.
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Releases a pointer previously returned by [`allocate`]. Returns
    /// `true` on success and `false` when the pointer is unknown or its
    /// bookkeeping fails an integrity check, in which case the allocator
    /// state is unchanged. A null pointer is a legal no-op that returns
    /// `true`.
    ///
    /// # Safety
    ///
    /// A non-null `pointer` must either have been returned by this instance
    /// and not freed since, or be clearly foreign to it (outside the managed
    /// region); handing in a dangling pointer *into* the region may read
    /// bookkeeping bytes through it. Strategies without an integrity check
    /// cannot detect a double free; see the per-strategy documentation.
    ///
    /// [`allocate`]: Allocator::allocate
    unsafe fn free(&mut self, pointer: *mut u8) -> bool;
}

/// A located block: whatever a strategy uses to describe one of its
/// bookkeeping units, as long as it can tell where the payload starts.
pub(crate) trait BlockHandle {
    /// The address handed back to the caller of `allocate`.
    fn address(&self) -> NonNull<u8>;
}

/// The five primitives a strategy supplies to the skeleton.
///
/// All of them are unsafe for the same reason: they operate on the raw bytes
/// of the backing region and rely on the invariants established by the
/// strategy's `init`.
pub(crate) trait Strategy {
    type Handle: BlockHandle;
    type Aligner: Aligner;

    /// Finds a free block able to hold `size` bytes, where `size` has
    /// already been through the aligner. Does not reserve it yet.
    unsafe fn get_free_block(&mut self, size: usize) -> Option<Self::Handle>;

    /// Makes the block unavailable to later requests. Runs after
    /// `get_free_block` on the allocation path.
    unsafe fn mark_used(&mut self, block: &mut Self::Handle);

    /// Locates the block behind a pointer handed to `free`, or `None` if
    /// the pointer cannot belong to this allocator.
    unsafe fn pointer_to_block(&mut self, pointer: NonNull<u8>) -> Option<Self::Handle>;

    /// Marks the block free again. Runs before `put_free_block` on the
    /// release path.
    unsafe fn mark_free(&mut self, block: &mut Self::Handle);

    /// Returns the block to the pool of reusable blocks, coalescing with
    /// neighbours where the strategy supports it.
    unsafe fn put_free_block(&mut self, block: Self::Handle);
}

impl<S: Strategy> Allocator for S {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let aligned = S::Aligner::align(size);

        // SAFETY: the strategy's `init` contract guarantees exclusive access
        // to a valid region; primitives only touch bytes inside it.
        unsafe {
            let Some(mut block) = self.get_free_block(aligned) else {
                debug!("no free block can hold {size} bytes ({aligned} after alignment)");
                return None;
            };

            self.mark_used(&mut block);

            Some(block.address())
        }
    }

    unsafe fn free(&mut self, pointer: *mut u8) -> bool {
        let Some(pointer) = NonNull::new(pointer) else {
            return true;
        };

        unsafe {
            let Some(mut block) = self.pointer_to_block(pointer) else {
                error!("no block is associated with the pointer {pointer:p}");
                return false;
            };

            self.mark_free(&mut block);
            self.put_free_block(block);
        }

        true
    }
}
