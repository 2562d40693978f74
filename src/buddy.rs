//! Binary buddy allocator. The region is treated as one block of order
//! `MAX_ORDER` that can be split in half recursively down to blocks of
//! `BASIC_BLOCK_SIZE` bytes (order 0). A block of order `k` spans
//! `BASIC_BLOCK_SIZE * 2^k` bytes, and two sibling halves (buddies) merge
//! back into their parent as soon as both are free.
//!
//! The bookkeeping is an implicit perfect binary tree: node 0 is the whole
//! region, the children of node `i` are `2i + 1` and `2i + 2`, and nothing
//! is ever materialized per node except a single bit. Storing `left`/`right`
//! pointers per node would defeat the purpose of the encoding; the whole
//! tree for `MAX_ORDER = 3` fits in two bytes.
//!
//! One bit per node is not enough to store three states directly, so the
//! status of an inner node is derived from its own bit and its children's:
//!
//! ```text
//! own bit | children bits | status
//! --------+---------------+----------
//!    1    | both clear    | FREE
//!    0    | both set      | ALLOCATED
//!    0    | not both set  | SPLIT
//! ```
//!
//! For a leaf the bit alone decides: set means free. Under this encoding,
//! "is there a free block of order k" reduces to a find-first-set scan over
//! the contiguous index range of one tree depth, with one subtlety: the
//! children of an allocated block also carry set bits, so a candidate only
//! counts when its parent is not allocated.

use core::ptr::NonNull;

use log::warn;

use crate::{
    align::NullAligner,
    allocator::{BlockHandle, Strategy},
    bitvec::StaticBitVec,
    InitError, Pointer,
};

/// Number of `usize` words needed to store the tree bit-vector for a given
/// maximum order. Use it to size the third const parameter of
/// [`BuddyAllocator`]:
///
/// ```rust
/// use carve::{buddy_tree_words, BuddyAllocator};
///
/// type Buddy = BuddyAllocator<3, 16, { buddy_tree_words(3) }>;
/// ```
pub const fn buddy_tree_words(max_order: usize) -> usize {
    let nodes: usize = (1 << (max_order + 1)) - 1;
    nodes.div_ceil(usize::BITS as usize)
}

/// A located tree node: its index plus the byte address it maps to.
pub(crate) struct TreeBlock {
    index: usize,
    address: NonNull<u8>,
}

impl BlockHandle for TreeBlock {
    fn address(&self) -> NonNull<u8> {
        self.address
    }
}

/// Binary buddy allocator over a caller supplied region.
///
/// `MAX_ORDER` is the order of the whole region, `BASIC_BLOCK_SIZE` the
/// power-of-two size of an order 0 block, and `TREE_WORDS` the bit-vector
/// storage computed by [`buddy_tree_words`]; the three are checked against
/// each other at compile time.
pub struct BuddyAllocator<
    const MAX_ORDER: usize,
    const BASIC_BLOCK_SIZE: usize,
    const TREE_WORDS: usize,
> {
    base: Pointer<u8>,
    tree: StaticBitVec<usize, TREE_WORDS>,
}

// SAFETY: the allocator exclusively owns its region pointer; the bit-vector
// moves with the struct.
unsafe impl<const MAX_ORDER: usize, const BASIC_BLOCK_SIZE: usize, const TREE_WORDS: usize> Send
    for BuddyAllocator<MAX_ORDER, BASIC_BLOCK_SIZE, TREE_WORDS>
{
}

impl<const MAX_ORDER: usize, const BASIC_BLOCK_SIZE: usize, const TREE_WORDS: usize>
    BuddyAllocator<MAX_ORDER, BASIC_BLOCK_SIZE, TREE_WORDS>
{
    /// Nodes in a perfect binary tree of depth `MAX_ORDER + 1`.
    const NODE_COUNT: usize = (1 << (MAX_ORDER + 1)) - 1;

    /// Size of the order `MAX_ORDER` block, i.e. the managed bytes.
    const MAX_BLOCK_SIZE: usize = BASIC_BLOCK_SIZE << MAX_ORDER;

    /// Builds an unconfigured allocator with an all-clear tree.
    pub const fn new() -> Self {
        const {
            assert!(BASIC_BLOCK_SIZE.is_power_of_two());
            assert!(MAX_ORDER + 1 < usize::BITS as usize);
            assert!(TREE_WORDS * usize::BITS as usize >= (1 << (MAX_ORDER + 1)) - 1);
        }

        Self {
            base: None,
            tree: StaticBitVec::zeroed(),
        }
    }

    /// Configures the allocator over `[base, base + limit)` and marks the
    /// root block free.
    ///
    /// The region must hold the full order `MAX_ORDER` block; surplus bytes
    /// beyond the tree's coverage are left unused with a warning.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes, exclusively owned by
    /// this allocator and outlive it.
    pub unsafe fn init(&mut self, base: NonNull<u8>, limit: usize) -> Result<(), InitError> {
        if limit < Self::MAX_BLOCK_SIZE {
            return Err(InitError::RegionTooSmall {
                required: Self::MAX_BLOCK_SIZE,
                provided: limit,
            });
        }

        if limit > Self::MAX_BLOCK_SIZE {
            warn!(
                "region of {limit} bytes exceeds the maximum block of {} bytes; \
                 the surplus is wasted",
                Self::MAX_BLOCK_SIZE
            );
        }

        self.base = Some(base);
        self.tree.clear_all();
        self.tree.set(0);

        Ok(())
    }

    // Tree geometry. The index range of depth `d` is
    // `[2^d - 1, 2^(d+1) - 2]`, so the depth of index `i` is
    // `floor(log2(i + 1))`.

    pub(crate) const fn order_to_depth(order: usize) -> usize {
        MAX_ORDER - order
    }

    pub(crate) const fn depth_to_order(depth: usize) -> usize {
        MAX_ORDER - depth
    }

    pub(crate) const fn order_to_size(order: usize) -> usize {
        BASIC_BLOCK_SIZE << order
    }

    pub(crate) fn index_to_depth(index: usize) -> usize {
        (usize::BITS - 1 - (index + 1).leading_zeros()) as usize
    }

    const fn left_child(index: usize) -> usize {
        2 * index + 1
    }

    const fn right_child(index: usize) -> usize {
        2 * index + 2
    }

    fn parent(index: usize) -> usize {
        debug_assert!(!Self::is_root(index), "the root has no parent");
        (index - 1) / 2
    }

    const fn is_root(index: usize) -> bool {
        index == 0
    }

    const fn is_leaf(index: usize) -> bool {
        Self::left_child(index) >= Self::NODE_COUNT
    }

    fn is_left_child(index: usize) -> bool {
        debug_assert!(!Self::is_root(index));
        index & 1 == 1
    }

    /// The sibling that a block merges with when both are free.
    pub(crate) fn buddy_of(index: usize) -> usize {
        if Self::is_left_child(index) {
            index + 1
        } else {
            index - 1
        }
    }

    // Status of a node under the one-bit-per-node encoding.

    fn is_free(&self, index: usize) -> bool {
        if Self::is_leaf(index) {
            return self.tree.get(index);
        }

        self.tree.get(index)
            && !self.tree.get(Self::left_child(index))
            && !self.tree.get(Self::right_child(index))
    }

    fn is_allocated(&self, index: usize) -> bool {
        if Self::is_leaf(index) {
            return !self.tree.get(index);
        }

        !self.tree.get(index)
            && self.tree.get(Self::left_child(index))
            && self.tree.get(Self::right_child(index))
    }

    fn is_split(&self, index: usize) -> bool {
        if Self::is_leaf(index) {
            return false;
        }

        !self.tree.get(index)
            && !(self.tree.get(Self::left_child(index))
                && self.tree.get(Self::right_child(index)))
    }

    /// Order of the smallest block able to hold `size` bytes.
    fn size_to_order(size: usize) -> usize {
        let basic_blocks = size.div_ceil(BASIC_BLOCK_SIZE).next_power_of_two();
        basic_blocks.trailing_zeros() as usize
    }

    /// Splits a free non-leaf block in two and returns the left half.
    fn split(&mut self, index: usize) -> usize {
        debug_assert!(!Self::is_leaf(index), "cannot split an order 0 block");
        debug_assert!(self.is_free(index), "cannot split a block that is not free");

        self.tree.clear(index);
        self.tree.set(Self::left_child(index));
        self.tree.set(Self::right_child(index));

        Self::left_child(index)
    }

    /// Finds (or makes, by splitting) a free block of exactly `order`.
    ///
    /// The scan walks the set bits of the order's depth range. A set bit
    /// whose parent is allocated belongs to a merged half of that parent,
    /// so the sibling pair is skipped; exhausting the range falls back to
    /// splitting a block of the next order.
    fn free_block_of_order(&mut self, order: usize) -> Option<usize> {
        if order > MAX_ORDER {
            return None;
        }

        let depth = Self::order_to_depth(order);
        let mut lower = (1 << depth) - 1;
        let upper = lower + (1 << depth) - 1;

        while lower <= upper {
            let Some(index) = self.tree.first_set_in(lower, upper) else {
                break;
            };

            if Self::is_root(index) {
                return Some(index);
            }

            if self.is_allocated(Self::parent(index)) {
                lower = index + if Self::is_left_child(index) { 2 } else { 1 };
                continue;
            }

            debug_assert!(
                self.is_split(Self::parent(index)),
                "the parent of a free block must be split"
            );
            debug_assert!(self.is_free(index));

            return Some(index);
        }

        let bigger = self.free_block_of_order(order + 1)?;

        Some(self.split(bigger))
    }

    #[cfg(test)]
    pub(crate) fn tree_snapshot(&self) -> StaticBitVec<usize, TREE_WORDS> {
        self.tree
    }

    #[cfg(test)]
    pub(crate) fn root_is_free(&self) -> bool {
        self.is_free(0)
    }

    #[cfg(test)]
    pub(crate) fn status_is_consistent(&self) -> bool {
        (0..Self::NODE_COUNT).all(|index| {
            let statuses = [
                self.is_free(index),
                self.is_allocated(index),
                self.is_split(index),
            ];
            statuses.iter().filter(|&&status| status).count() == 1
        })
    }
}

impl<const MAX_ORDER: usize, const BASIC_BLOCK_SIZE: usize, const TREE_WORDS: usize> Strategy
    for BuddyAllocator<MAX_ORDER, BASIC_BLOCK_SIZE, TREE_WORDS>
{
    type Handle = TreeBlock;
    type Aligner = NullAligner;

    unsafe fn get_free_block(&mut self, size: usize) -> Option<TreeBlock> {
        let base = self.base?;

        if size > Self::MAX_BLOCK_SIZE {
            return None;
        }

        let order = Self::size_to_order(size);
        let index = self.free_block_of_order(order)?;

        // Byte offset of the block: its stride within the depth times the
        // block size of that order.
        let first_of_depth = (1 << Self::order_to_depth(order)) - 1;
        let offset = (index - first_of_depth) * Self::order_to_size(order);

        Some(TreeBlock {
            index,
            address: NonNull::new_unchecked(base.as_ptr().add(offset)),
        })
    }

    unsafe fn mark_used(&mut self, block: &mut TreeBlock) {
        self.tree.clear(block.index);

        // The children of an allocated block carry set bits, that is what
        // distinguishes ALLOCATED from SPLIT.
        if !Self::is_leaf(block.index) {
            self.tree.set(Self::left_child(block.index));
            self.tree.set(Self::right_child(block.index));
        }
    }

    unsafe fn pointer_to_block(&mut self, pointer: NonNull<u8>) -> Option<TreeBlock> {
        let base = self.base?;

        let address = pointer.as_ptr() as usize;
        let mut start = base.as_ptr() as usize;

        if address < start || address >= start + Self::MAX_BLOCK_SIZE {
            return None;
        }

        // Descend from the root towards the only allocated block that can
        // start at `pointer`. At a split node whose address matches we keep
        // descending into the left child (same start, smaller block), and
        // only split nodes may be descended through at all: a pointer that
        // would route into a free or allocated node's interior was never
        // handed out by us.
        let mut index = 0;
        let mut order = MAX_ORDER;

        loop {
            if address == start {
                if self.is_allocated(index) {
                    return Some(TreeBlock {
                        index,
                        address: pointer,
                    });
                }

                if self.is_split(index) {
                    index = Self::left_child(index);
                    order -= 1;
                    continue;
                }

                return None;
            }

            if order == 0 || !self.is_split(index) {
                return None;
            }

            let half = Self::order_to_size(order - 1);
            if address < start + half {
                index = Self::left_child(index);
            } else {
                start += half;
                index = Self::right_child(index);
            }
            order -= 1;
        }
    }

    unsafe fn mark_free(&mut self, block: &mut TreeBlock) {
        self.tree.set(block.index);

        if !Self::is_leaf(block.index) {
            self.tree.clear(Self::left_child(block.index));
            self.tree.clear(Self::right_child(block.index));
        }
    }

    unsafe fn put_free_block(&mut self, block: TreeBlock) {
        // Coalesce upwards: as long as the buddy is also free, both halves
        // dissolve into their parent.
        let mut index = block.index;

        while !Self::is_root(index) {
            let buddy = Self::buddy_of(index);

            if !self.is_free(buddy) {
                break;
            }

            let parent = Self::parent(index);

            self.tree.clear(index);
            self.tree.clear(buddy);
            self.tree.set(parent);

            index = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::Layout;

    use super::*;
    use crate::allocator::Allocator;

    /// MAX_ORDER = 3, BASIC_BLOCK_SIZE = 16: a 128 byte region split down
    /// to 16 byte leaves, 15 tree nodes.
    type Buddy128 = BuddyAllocator<3, 16, { buddy_tree_words(3) }>;

    fn with_buddy<F>(test: F)
    where
        F: FnOnce(&mut Buddy128, NonNull<u8>),
    {
        let layout = Layout::from_size_align(128, 16).unwrap();
        unsafe {
            let base = std::alloc::alloc(layout);
            assert!(!base.is_null());

            let mut buddy = Buddy128::new();
            buddy.init(NonNull::new(base).unwrap(), 128).unwrap();
            test(&mut buddy, NonNull::new(base).unwrap());

            std::alloc::dealloc(base, layout);
        }
    }

    #[test]
    fn geometry_helpers() {
        assert_eq!(Buddy128::order_to_size(0), 16);
        assert_eq!(Buddy128::order_to_size(1), 32);
        assert_eq!(Buddy128::order_to_size(3), 128);

        for order in 0..=3 {
            assert_eq!(
                Buddy128::depth_to_order(Buddy128::order_to_depth(order)),
                order
            );
        }

        assert_eq!(Buddy128::index_to_depth(0), 0);
        assert_eq!(Buddy128::index_to_depth(1), 1);
        assert_eq!(Buddy128::index_to_depth(2), 1);
        assert_eq!(Buddy128::index_to_depth(7), 3);
        assert_eq!(Buddy128::index_to_depth(14), 3);

        for index in 1..15 {
            assert_eq!(Buddy128::buddy_of(Buddy128::buddy_of(index)), index);
        }

        assert_eq!(buddy_tree_words(3), 1);
        assert_eq!(buddy_tree_words(7), 255_usize.div_ceil(usize::BITS as usize));
    }

    #[test]
    fn init_rejects_undersized_regions_only() {
        let layout = Layout::from_size_align(256, 16).unwrap();
        unsafe {
            let base = std::alloc::alloc(layout);
            let base = NonNull::new(base).unwrap();

            let mut buddy = Buddy128::new();
            assert_eq!(
                buddy.init(base, 127),
                Err(InitError::RegionTooSmall {
                    required: 128,
                    provided: 127,
                })
            );
            assert!(buddy.allocate(16).is_none());

            // Surplus bytes beyond the tree's coverage warn but succeed.
            buddy.init(base, 256).unwrap();
            assert!(buddy.allocate(16).is_some());

            std::alloc::dealloc(base.as_ptr(), layout);
        }
    }

    #[test]
    fn split_coalesce_walkthrough() {
        // The canonical walkthrough: mixed orders, leftmost placement,
        // exhaustion in the middle, and a full coalesce at the end.
        with_buddy(|buddy, base| unsafe {
            let at = |offset: usize| base.as_ptr() as usize + offset;

            let a = buddy.allocate(10).unwrap(); // order 0
            let b = buddy.allocate(12).unwrap(); // order 0
            let c = buddy.allocate(24).unwrap(); // order 1
            let d = buddy.allocate(13).unwrap(); // order 0

            assert_eq!(a.as_ptr() as usize, at(0));
            assert_eq!(b.as_ptr() as usize, at(16));
            assert_eq!(c.as_ptr() as usize, at(32));
            assert_eq!(d.as_ptr() as usize, at(64));

            // Half the region is gone, no order 2 block is left.
            assert!(buddy.allocate(64).is_none());

            let e = buddy.allocate(16).unwrap();
            assert_eq!(e.as_ptr() as usize, at(80));

            assert!(buddy.status_is_consistent());

            for pointer in [d, e, a, b, c] {
                assert!(buddy.free(pointer.as_ptr()));
                assert!(buddy.status_is_consistent());
            }

            assert!(buddy.root_is_free());
        });
    }

    #[test]
    fn exhaustion_and_reuse_of_a_freed_leaf() {
        with_buddy(|buddy, _base| unsafe {
            let blocks: Vec<_> = (0..8).map(|_| buddy.allocate(16).unwrap()).collect();

            // Eight order 0 blocks exhaust the region.
            assert!(buddy.allocate(16).is_none());

            assert!(buddy.free(blocks[3].as_ptr()));
            let reused = buddy.allocate(16).unwrap();
            assert_eq!(reused, blocks[3]);

            for &block in blocks.iter().filter(|&&block| block != reused) {
                assert!(buddy.free(block.as_ptr()));
            }
            assert!(buddy.free(reused.as_ptr()));
            assert!(buddy.root_is_free());
        });
    }

    #[test]
    fn reverse_order_frees_restore_the_root() {
        with_buddy(|buddy, _base| unsafe {
            let blocks: Vec<_> = (0..8).map(|_| buddy.allocate(16).unwrap()).collect();

            for block in blocks.iter().rev() {
                assert!(buddy.free(block.as_ptr()));
            }

            assert!(buddy.root_is_free());
        });
    }

    #[test]
    fn round_trip_restores_the_tree_bit_for_bit() {
        with_buddy(|buddy, _base| unsafe {
            let pristine = buddy.tree_snapshot();

            for size in [1, 16, 17, 32, 100, 128] {
                let pointer = buddy.allocate(size).unwrap();
                assert!(buddy.free(pointer.as_ptr()));
                assert_eq!(buddy.tree_snapshot(), pristine);
            }
        });
    }

    #[test]
    fn oversized_and_zero_requests_fail() {
        with_buddy(|buddy, _base| {
            assert!(buddy.allocate(0).is_none());
            assert!(buddy.allocate(129).is_none());
            assert!(buddy.allocate(usize::MAX).is_none());
        });
    }

    #[test]
    fn unknown_pointers_are_rejected() {
        with_buddy(|buddy, base| unsafe {
            assert!(buddy.free(core::ptr::null_mut()));

            // Inside the region but not a block start.
            let block = buddy.allocate(16).unwrap();
            assert!(!buddy.free(block.as_ptr().add(8)));

            // A block start that was never allocated.
            assert!(!buddy.free(base.as_ptr().add(48)));

            // Outside the region.
            assert!(!buddy.free(base.as_ptr().add(128)));

            // Double free: the descent finds no allocated node anymore.
            assert!(buddy.free(block.as_ptr()));
            assert!(!buddy.free(block.as_ptr()));
        });
    }

    #[test]
    fn at_most_max_order_zero_blocks_live_concurrently() {
        with_buddy(|buddy, _base| {
            let mut live = 0;
            while buddy.allocate(1).is_some() {
                live += 1;
            }
            assert_eq!(live, 8);
        });
    }

    #[test]
    fn random_workload_keeps_the_encoding_consistent() {
        // Deterministic xorshift workload. Every node must stay in exactly
        // one of the three statuses after every operation; in particular
        // two sibling free blocks never persist, so a scan can never
        // mistake their parent's pattern for an allocated block.
        with_buddy(|buddy, _base| unsafe {
            let mut state: u64 = 0x9E3779B97F4A7C15;
            let mut rand = move || {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state
            };

            let mut live: Vec<NonNull<u8>> = Vec::new();

            for _ in 0..2000 {
                if rand() % 2 == 0 {
                    let size = 1 + (rand() % 64) as usize;
                    if let Some(pointer) = buddy.allocate(size) {
                        assert!(!live.contains(&pointer));
                        live.push(pointer);
                    }
                } else if !live.is_empty() {
                    let victim = live.swap_remove((rand() % live.len() as u64) as usize);
                    assert!(buddy.free(victim.as_ptr()));
                }

                assert!(buddy.status_is_consistent());
            }

            for pointer in live {
                assert!(buddy.free(pointer.as_ptr()));
            }
            assert!(buddy.root_is_free());
        });
    }
}
