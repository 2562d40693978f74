//! Fixed size bitmap pool. The region is divided into `N` slots, each
//! holding exactly one instance of a `Resource` type, and a bitmap tracks
//! which slots are free (set bit = free slot). Finding a slot is a linear
//! scan for the least significant set bit, giving O(n) allocation; release
//! only flips one bit, giving O(1).
//!
//! The bitmap lives out of band, inside the allocator itself, so the slot
//! bytes carry no bookkeeping at all. That also means a released slot's
//! state is fully visible to the allocator: a double free is detected here,
//! unlike in the [`FastPool`](crate::FastPool).

use core::{mem, ptr::NonNull};

use log::{error, warn};

use crate::{
    align::NullAligner,
    allocator::{BlockHandle, Strategy},
    bitvec::{StaticBitVec, Word},
    region::Region,
    InitError,
};

/// Number of `W` words needed for a bitmap of `slots` bits. Use it to size
/// the last const parameter of [`BitmapPool`]:
///
/// ```rust
/// use carve::{bitmap_words, BitmapPool};
///
/// struct Task {
///     _payload: [u64; 4],
/// }
///
/// type TaskPool = BitmapPool<Task, u8, 12, { bitmap_words::<u8>(12) }>;
/// ```
pub const fn bitmap_words<W: Word>(slots: usize) -> usize {
    slots.div_ceil(W::BITS)
}

/// A located slot: its bitmap index plus its byte address.
pub(crate) struct Slot {
    index: usize,
    address: NonNull<u8>,
}

impl BlockHandle for Slot {
    fn address(&self) -> NonNull<u8> {
        self.address
    }
}

/// Bitmap indexed pool of `N` slots of type `R`, with a bitmap stored in
/// `WORDS` words of type `W` (see [`bitmap_words`]).
///
/// Only requests of exactly `size_of::<R>()` bytes succeed; the convenience
/// entry point [`allocate_one`](Self::allocate_one) fixes the size and the
/// pointer type for you.
pub struct BitmapPool<R, W: Word, const N: usize, const WORDS: usize> {
    slots: Option<NonNull<R>>,
    bitmap: StaticBitVec<W, WORDS>,
}

// SAFETY: the pool exclusively owns its region pointer.
unsafe impl<R, W: Word, const N: usize, const WORDS: usize> Send for BitmapPool<R, W, N, WORDS> {}

impl<R, W: Word, const N: usize, const WORDS: usize> BitmapPool<R, W, N, WORDS> {
    const SLOT_SIZE: usize = mem::size_of::<R>();

    /// Builds an unconfigured pool.
    pub const fn new() -> Self {
        const {
            assert!(mem::size_of::<R>() > 0, "zero sized resources need no pool");
            assert!(N > 0);
            assert!(WORDS * W::BITS >= N, "bitmap words cannot cover N slots");
        }

        Self {
            slots: None,
            bitmap: StaticBitVec::zeroed(),
        }
    }

    /// Configures the pool over `[base, base + limit)` and marks every slot
    /// free.
    ///
    /// The region size must be a multiple of the slot size and hold at
    /// least `N` slots; surplus slots are left unused with a warning.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes, exclusively owned by
    /// this pool and outlive it.
    pub unsafe fn init(&mut self, base: NonNull<u8>, limit: usize) -> Result<(), InitError> {
        if limit % Self::SLOT_SIZE != 0 {
            return Err(InitError::SizeNotMultiple {
                unit: Self::SLOT_SIZE,
                provided: limit,
            });
        }

        if limit / Self::SLOT_SIZE < N {
            return Err(InitError::RegionTooSmall {
                required: N * Self::SLOT_SIZE,
                provided: limit,
            });
        }

        if base.as_ptr() as usize % mem::align_of::<R>() != 0 {
            return Err(InitError::MisalignedRegion {
                required: mem::align_of::<R>(),
            });
        }

        if limit / Self::SLOT_SIZE > N {
            warn!(
                "region holds {} slots but the pool only tracks {}; \
                 the surplus is wasted",
                limit / Self::SLOT_SIZE,
                N
            );
        }

        self.slots = Some(base.cast());
        self.bitmap.set_first(N);

        Ok(())
    }

    /// Allocates one resource slot. Equivalent to
    /// `allocate(size_of::<R>())` with a typed result.
    pub fn allocate_one(&mut self) -> Option<NonNull<R>> {
        use crate::allocator::Allocator;

        self.allocate(Self::SLOT_SIZE).map(NonNull::cast)
    }

    #[cfg(test)]
    pub(crate) fn free_slots(&self) -> usize {
        (0..N).filter(|&index| self.bitmap.get(index)).count()
    }

    #[cfg(test)]
    pub(crate) fn bitmap_snapshot(&self) -> StaticBitVec<W, WORDS> {
        self.bitmap
    }
}

impl<R, W: Word, const N: usize, const WORDS: usize> Strategy for BitmapPool<R, W, N, WORDS> {
    type Handle = Slot;
    type Aligner = NullAligner;

    unsafe fn get_free_block(&mut self, size: usize) -> Option<Slot> {
        let slots = self.slots?;

        if size != Self::SLOT_SIZE {
            error!(
                "pool request of {size} bytes does not match the slot size of {} bytes",
                Self::SLOT_SIZE
            );
            return None;
        }

        let index = self.bitmap.first_set()?;

        Some(Slot {
            index,
            address: NonNull::new_unchecked(
                slots.as_ptr().cast::<u8>().add(index * Self::SLOT_SIZE),
            ),
        })
    }

    unsafe fn mark_used(&mut self, block: &mut Slot) {
        self.bitmap.clear(block.index);
    }

    unsafe fn pointer_to_block(&mut self, pointer: NonNull<u8>) -> Option<Slot> {
        let slots = self.slots?;
        let region = Region::new(slots.cast(), N * Self::SLOT_SIZE);

        if !region.contains(pointer) {
            return None;
        }

        let offset = region.offset_of(pointer);
        if offset % Self::SLOT_SIZE != 0 {
            return None;
        }

        let index = offset / Self::SLOT_SIZE;

        // A slot whose bit is already set is not live; freeing it again
        // would corrupt the free count.
        if self.bitmap.get(index) {
            return None;
        }

        Some(Slot {
            index,
            address: pointer,
        })
    }

    unsafe fn mark_free(&mut self, block: &mut Slot) {
        self.bitmap.set(block.index);
    }

    unsafe fn put_free_block(&mut self, _block: Slot) {
        // Setting the bit already made the slot findable again.
    }
}
