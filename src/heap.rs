//! The placement engine. This module owns the region and implements every
//! mutating operation: carving the initial sentinels, searching the
//! segregated directory, splitting oversized blocks, merging freed neighbors
//! and growing the region when nothing fits.
//!
//! All heap accesses go through [`Heap::word`] and [`Heap::put`], which read
//! and write aligned 4 byte words at offsets from the region base. Block
//! arithmetic itself is pure offset math in [`crate::block`], so the unsafe
//! surface of the whole crate is concentrated here and stays mechanical:
//! every offset we dereference was either produced by the layout formulas
//! from a tag we wrote earlier, or handed back by the caller for a block we
//! allocated.

use std::ptr::{self, NonNull};

use crate::{
    align::align,
    block::{pack, tag_allocated, tag_size, Block, DSIZE, FIRST_BLOCK, MIN_BLOCK_SIZE, PROLOGUE, WSIZE},
    directory::{size_class, DIRECTORY_SIZE, NIL, NUM_LISTS},
    region::{Region, MAX_HEAP},
    AllocError, Pointer,
};

/// Minimum region growth in bytes. Requests that miss the free lists extend
/// the heap by at least this much so that tiny allocations don't trigger a
/// provider call each.
pub(crate) const CHUNK_SIZE: usize = 32;

/// The heap: a region plus the discipline that keeps it structured. Not
/// thread safe and needs mutable borrows to operate, so the public API wraps
/// it in a lock; see [`crate::allocator::Segalloc`].
pub(crate) struct Heap {
    region: Region,
    initialized: bool,
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            region: Region::new(),
            initialized: false,
        }
    }

    /// Resets the region and lays out a fresh empty heap: zeroed directory,
    /// padding word, prologue, epilogue, and one initial free block of
    /// [`CHUNK_SIZE`] bytes.
    pub unsafe fn init(&mut self) -> Result<(), AllocError> {
        self.region.init()?;
        self.initialized = false;

        if self.region.sbrk(DIRECTORY_SIZE).is_none() {
            return Err(AllocError);
        }

        for class in 0..NUM_LISTS {
            self.put(class * WSIZE, NIL as u32);
        }

        if self.region.sbrk(4 * WSIZE).is_none() {
            return Err(AllocError);
        }

        // Padding word, then both prologue tags, then the epilogue header.
        // The first real block's payload lands on an 8 byte boundary.
        self.put(DIRECTORY_SIZE, 0);
        self.put(PROLOGUE.header(), pack(DSIZE, true));
        self.put(PROLOGUE.footer(DSIZE), pack(DSIZE, true));
        self.put(FIRST_BLOCK - WSIZE, pack(0, true));

        self.initialized = true;

        match self.extend(CHUNK_SIZE / WSIZE) {
            Some(_) => Ok(()),
            None => Err(AllocError),
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Current heap size in bytes, sentinels and directory included.
    #[inline]
    pub fn size(&self) -> usize {
        self.region.size()
    }

    /// Lowest address of the heap, or `None` before initialization.
    #[inline]
    pub fn heap_lo(&self) -> Pointer<u8> {
        self.region.heap_lo()
    }

    /// First address past the heap, or `None` before initialization.
    #[inline]
    pub fn heap_hi(&self) -> Pointer<u8> {
        self.region.heap_hi()
    }

    /// Reads the word at `offset` from the region base.
    #[inline]
    pub(crate) unsafe fn word(&self, offset: usize) -> u32 {
        self.region.start().as_ptr().add(offset).cast::<u32>().read()
    }

    /// Writes the word at `offset` from the region base.
    #[inline]
    pub(crate) unsafe fn put(&mut self, offset: usize, value: u32) {
        self.region.start().as_ptr().add(offset).cast::<u32>().write(value);
    }

    /// Total size of `block`, read from its header.
    #[inline]
    pub(crate) unsafe fn size_of(&self, block: Block) -> usize {
        tag_size(self.word(block.header()))
    }

    /// Allocation bit of `block`, read from its header.
    #[inline]
    pub(crate) unsafe fn is_allocated(&self, block: Block) -> bool {
        tag_allocated(self.word(block.header()))
    }

    /// The physically next block. Valid until the epilogue, whose size of 0
    /// would map the "next" block onto itself.
    #[inline]
    pub(crate) unsafe fn next_block(&self, block: Block) -> Block {
        Block::at_payload(block.payload() + self.size_of(block))
    }

    /// The physically previous block, located through its footer. The
    /// prologue guarantees this never reads below the payload region.
    #[inline]
    pub(crate) unsafe fn prev_block(&self, block: Block) -> Block {
        let size = tag_size(self.word(block.payload() - DSIZE));
        Block::at_payload(block.payload() - size)
    }

    /// Writes matching header and footer for a block of `size` bytes.
    #[inline]
    unsafe fn write_tags(&mut self, block: Block, size: usize, allocated: bool) {
        self.put(block.header(), pack(size, allocated));
        self.put(block.footer(size), pack(size, allocated));
    }

    /// Head of the free list for `class`, or [`NIL`].
    #[inline]
    pub(crate) unsafe fn head(&self, class: usize) -> usize {
        self.word(class * WSIZE) as usize
    }

    #[inline]
    unsafe fn set_head(&mut self, class: usize, offset: usize) {
        self.put(class * WSIZE, offset as u32);
    }

    /// Next free block link of a free block, or [`NIL`].
    #[inline]
    pub(crate) unsafe fn next_free(&self, block: Block) -> usize {
        self.word(block.next_link()) as usize
    }

    /// Previous free block link of a free block, or [`NIL`].
    #[inline]
    pub(crate) unsafe fn prev_free(&self, block: Block) -> usize {
        self.word(block.prev_link()) as usize
    }

    /// Pushes `block` at the head of the list its size maps to.
    unsafe fn insert(&mut self, block: Block) {
        let class = size_class(self.size_of(block));
        let head = self.head(class);

        self.put(block.prev_link(), NIL as u32);
        self.put(block.next_link(), head as u32);

        if head != NIL {
            self.put(Block::at_payload(head).prev_link(), block.payload() as u32);
        }

        self.set_head(class, block.payload());
    }

    /// Unlinks `block` from the list its size maps to. The class function is
    /// deterministic for a given size, so the block's list membership is
    /// uniquely determined by its header.
    unsafe fn remove(&mut self, block: Block) {
        let class = size_class(self.size_of(block));
        let prev = self.prev_free(block);
        let next = self.next_free(block);

        if prev == NIL {
            self.set_head(class, next);
        } else {
            self.put(Block::at_payload(prev).next_link(), next as u32);
        }

        if next != NIL {
            self.put(Block::at_payload(next).prev_link(), prev as u32);
        }
    }

    /// First fit within the single class that `asize` maps to. An empty or
    /// unlucky class is a miss even when larger classes could serve; the
    /// caller extends the heap instead.
    unsafe fn find_fit(&self, asize: usize) -> Option<Block> {
        let mut cursor = self.head(size_class(asize));

        while cursor != NIL {
            let block = Block::at_payload(cursor);

            if self.size_of(block) >= asize {
                return Some(block);
            }

            cursor = self.next_free(block);
        }

        None
    }

    /// Claims `asize` bytes out of the free `block`. When the surplus can
    /// hold a block of its own it is split off and reinserted, otherwise the
    /// whole block is handed out:
    ///
    /// ```text
    ///  before:  +--------------- free, size ---------------+
    ///  after:   +-- allocated, asize --+-- free, surplus --+
    /// ```
    unsafe fn place(&mut self, block: Block, asize: usize) -> Block {
        let size = self.size_of(block);

        self.remove(block);

        if size - asize >= MIN_BLOCK_SIZE {
            self.write_tags(block, asize, true);

            let remainder = self.next_block(block);
            self.write_tags(remainder, size - asize, false);
            // Both physical neighbors of the remainder are allocated here,
            // so it can go straight into its list.
            self.insert(remainder);
        } else {
            self.write_tags(block, size, true);
        }

        block
    }

    /// Merges the free `block` with whichever physical neighbors are free
    /// and inserts the result into its size class. The sentinels are
    /// permanently allocated, which spares us the boundary cases:
    ///
    /// ```text
    ///  +--------+--------+--------+        +--------------------------+
    ///  |  free  |  block |  free  |  --->  |        one free block    |
    ///  +--------+--------+--------+        +--------------------------+
    /// ```
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        let prev = self.prev_block(block);
        let next = self.next_block(block);

        let mut start = block;
        let mut size = self.size_of(block);

        if !self.is_allocated(next) {
            self.remove(next);
            size += self.size_of(next);
        }

        if !self.is_allocated(prev) {
            self.remove(prev);
            size += self.size_of(prev);
            start = prev;
        }

        self.write_tags(start, size, false);
        self.insert(start);

        start
    }

    /// Grows the region by `words` words and overlays a free block on the
    /// new bytes. The old epilogue slot becomes the new block's header and a
    /// fresh epilogue is written at the new end, so the heap walk formulas
    /// stay valid across growth. Returns the new block, merged with the old
    /// tail block if that one was free.
    unsafe fn extend(&mut self, words: usize) -> Option<Block> {
        // An even number of words keeps block sizes multiples of 8, and no
        // block may be smaller than MIN_BLOCK_SIZE. Clamp before asking the
        // provider so the tags never claim bytes past the break.
        let size = ((words + 1) & !1) * WSIZE;
        let size = size.max(MIN_BLOCK_SIZE);

        let address = self.region.sbrk(size)?;
        let block = self.block_of(address);

        self.write_tags(block, size, false);
        self.put(Block::at_payload(block.payload() + size).header(), pack(0, true));

        Some(self.coalesce(block))
    }

    /// Allocates a block whose payload can hold `size` bytes, growing the
    /// region when the segregated search misses. Returns the payload
    /// address, or `None` for zero sized requests and exhausted memory.
    pub unsafe fn allocate(&mut self, size: usize) -> Pointer<u8> {
        if !self.initialized {
            self.init().ok()?;
        }

        if size == 0 || size > MAX_HEAP {
            return None;
        }

        // Room for both boundary tags, rounded up. Requests at or below one
        // double word all map to the minimum block.
        let asize = if size <= DSIZE {
            MIN_BLOCK_SIZE
        } else {
            align(size + DSIZE)
        };

        let block = match self.find_fit(asize) {
            Some(block) => block,
            None => self.extend(asize.max(CHUNK_SIZE) / WSIZE)?,
        };

        let block = self.place(block, asize);

        Some(self.address_of(block))
    }

    /// Releases the block behind `address` and merges it with any free
    /// neighbor immediately.
    pub unsafe fn free(&mut self, address: NonNull<u8>) {
        let block = self.block_of(address);
        let size = self.size_of(block);

        self.write_tags(block, size, false);
        self.coalesce(block);

        #[cfg(feature = "verify-on-free")]
        if !self.check() {
            eprintln!("heap consistency check failed after free");
        }
    }

    /// Resizes the allocation behind `address` to `size` bytes. Shrinking
    /// and growing into a free right neighbor happen in place; otherwise the
    /// contents move to a fresh block and the old one is freed.
    pub unsafe fn reallocate(&mut self, address: Pointer<u8>, size: usize) -> Pointer<u8> {
        let Some(address) = address else {
            return self.allocate(size);
        };

        if (size as isize) < 0 {
            return None;
        }

        if size == 0 {
            self.free(address);
            return None;
        }

        let block = self.block_of(address);
        let current = self.size_of(block);
        let required = align(size) + DSIZE;

        if required == current {
            return Some(address);
        }

        if required < current {
            if current - required < MIN_BLOCK_SIZE {
                return Some(address);
            }

            self.write_tags(block, required, true);
            self.split_remainder(block, current - required);

            return Some(address);
        }

        // The block has to grow. Swallowing a free right neighbor preserves
        // the address, which callers holding interior pointers appreciate.
        let next = self.next_block(block);

        if !self.is_allocated(next) && current + self.size_of(next) >= required {
            let combined = current + self.size_of(next);

            self.remove(next);

            if combined - required < MIN_BLOCK_SIZE {
                self.write_tags(block, combined, true);
            } else {
                self.write_tags(block, required, true);
                self.split_remainder(block, combined - required);
            }

            return Some(address);
        }

        // No way around moving. Allocate first so that failure leaves the
        // original block untouched, then copy the surviving payload.
        let new_address = self.allocate(required)?;

        ptr::copy_nonoverlapping(
            address.as_ptr(),
            new_address.as_ptr(),
            (current - DSIZE).min(required - DSIZE),
        );

        self.free(address);

        Some(new_address)
    }

    /// Turns the tail of a freshly shrunk allocation into a free block. The
    /// remainder goes through [`Heap::coalesce`] because its right neighbor
    /// may itself be free, and two adjacent free blocks must never exist.
    unsafe fn split_remainder(&mut self, block: Block, surplus: usize) {
        let remainder = self.next_block(block);
        self.write_tags(remainder, surplus, false);
        self.coalesce(remainder);
    }

    /// Payload address of `block`.
    #[inline]
    pub(crate) unsafe fn address_of(&self, block: Block) -> NonNull<u8> {
        NonNull::new_unchecked(self.region.start().as_ptr().add(block.payload()))
    }

    /// Block whose payload the caller's `address` points to.
    #[inline]
    pub(crate) unsafe fn block_of(&self, address: NonNull<u8>) -> Block {
        Block::at_payload(address.as_ptr() as usize - self.region.start().as_ptr() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        let mut heap = Heap::new();
        unsafe { heap.init().unwrap() };
        heap
    }

    /// Number of blocks reachable from the whole directory.
    unsafe fn listed_free_blocks(heap: &Heap) -> usize {
        let mut count = 0;

        for class in 0..NUM_LISTS {
            let mut cursor = heap.head(class);
            while cursor != NIL {
                count += 1;
                cursor = heap.next_free(Block::at_payload(cursor));
            }
        }

        count
    }

    unsafe fn free_list_len(heap: &Heap, class: usize) -> usize {
        let mut count = 0;
        let mut cursor = heap.head(class);

        while cursor != NIL {
            count += 1;
            cursor = heap.next_free(Block::at_payload(cursor));
        }

        count
    }

    #[test]
    fn fresh_heap_layout() {
        let heap = heap();

        unsafe {
            // Directory, padding, prologue, epilogue and the initial chunk.
            assert_eq!(heap.size(), DIRECTORY_SIZE + 4 * WSIZE + CHUNK_SIZE);

            assert_eq!(heap.word(PROLOGUE.header()), pack(DSIZE, true));
            assert_eq!(heap.word(PROLOGUE.footer(DSIZE)), pack(DSIZE, true));

            let first = Block::at_payload(FIRST_BLOCK);
            assert_eq!(heap.size_of(first), CHUNK_SIZE);
            assert!(!heap.is_allocated(first));

            // The initial block ends at the epilogue.
            let epilogue = heap.next_block(first);
            assert_eq!(heap.size_of(epilogue), 0);
            assert!(heap.is_allocated(epilogue));
            assert_eq!(epilogue.payload(), heap.size());

            // And it is the only listed free block.
            assert_eq!(listed_free_blocks(&heap), 1);
            assert_eq!(heap.head(size_class(CHUNK_SIZE)), FIRST_BLOCK);
        }

        assert!(heap.check());
    }

    #[test]
    fn allocate_rounds_up_and_aligns() {
        let mut heap = heap();

        unsafe {
            for (requested, expected) in [(1, 16), (8, 16), (9, 24), (16, 24), (40, 48)] {
                let address = heap.allocate(requested).unwrap();
                let block = heap.block_of(address);

                assert_eq!(heap.size_of(block), expected);
                assert!(heap.is_allocated(block));
                assert_eq!(block.payload() % 8, 0);
                assert!(heap.check());
            }
        }
    }

    #[test]
    fn allocate_zero_returns_none() {
        let mut heap = heap();
        unsafe { assert!(heap.allocate(0).is_none()) };
    }

    #[test]
    fn write_free_and_coalesce_to_single_block() {
        let mut heap = heap();

        unsafe {
            let address = heap.allocate(40).unwrap();

            for i in 0..40 {
                address.as_ptr().add(i).write(0xAB);
            }
            for i in 0..40 {
                assert_eq!(address.as_ptr().add(i).read(), 0xAB);
            }

            heap.free(address);

            assert!(heap.check());
            assert_eq!(listed_free_blocks(&heap), 1);

            // Everything merged back into one block spanning the payload
            // region, which must hold at least the 48 bytes we carved out.
            let block = Block::at_payload(FIRST_BLOCK);
            assert!(!heap.is_allocated(block));
            assert!(heap.size_of(block) >= 48);
            assert_eq!(heap.size_of(block), heap.size() - FIRST_BLOCK);
        }
    }

    #[test]
    fn freeing_between_allocated_neighbors_then_merging_left() {
        let mut heap = heap();

        unsafe {
            let a = heap.allocate(16).unwrap();
            let b = heap.allocate(16).unwrap();
            let c = heap.allocate(16).unwrap();

            let b_block = heap.block_of(b);
            assert_eq!(heap.size_of(b_block), 24);

            heap.free(b);
            assert!(heap.check());

            // b sits between two allocated blocks, so it lands alone in the
            // class for 24 byte blocks.
            assert_eq!(free_list_len(&heap, size_class(24)), 1);
            assert_eq!(heap.head(size_class(24)), b_block.payload());
            let free_before = listed_free_blocks(&heap);

            // Freeing a merges it with b. One block replaces two, so the
            // total count of free blocks does not change.
            let a_block = heap.block_of(a);
            heap.free(a);
            assert!(heap.check());

            assert_eq!(free_list_len(&heap, size_class(24)), 0);
            assert_eq!(listed_free_blocks(&heap), free_before);
            assert!(!heap.is_allocated(a_block));
            assert_eq!(heap.size_of(a_block), 48);

            let _ = c;
        }
    }

    #[test]
    fn reallocate_shrinks_in_place_and_splits() {
        let mut heap = heap();

        unsafe {
            let p = heap.allocate(100).unwrap();
            let block = heap.block_of(p);
            assert_eq!(heap.size_of(block), 112);

            let q = heap.reallocate(Some(p), 50).unwrap();

            assert_eq!(q, p);
            assert_eq!(heap.size_of(block), 64);
            assert!(heap.check());

            // The surplus became a free block. It merged with the tail of
            // the initial extension, so exactly one free block remains.
            assert_eq!(listed_free_blocks(&heap), 1);
            let remainder = heap.next_block(block);
            assert!(!heap.is_allocated(remainder));
        }
    }

    #[test]
    fn reallocate_shrink_keeps_whole_block_for_tiny_surplus() {
        let mut heap = heap();

        unsafe {
            let p = heap.allocate(24).unwrap();
            let block = heap.block_of(p);
            assert_eq!(heap.size_of(block), 32);

            // 17 needs 32 bytes as well, so nothing to give back.
            let q = heap.reallocate(Some(p), 17).unwrap();

            assert_eq!(q, p);
            assert_eq!(heap.size_of(block), 32);
            assert!(heap.check());
        }
    }

    #[test]
    fn reallocate_grows_into_free_neighbor() {
        let mut heap = heap();

        unsafe {
            let p = heap.allocate(16).unwrap();
            let q = heap.allocate(16).unwrap();

            heap.free(q);
            assert!(heap.check());

            // q's old block is physically next to p and free, so growing p
            // must not move it.
            let r = heap.reallocate(Some(p), 64).unwrap();

            assert_eq!(r, p);
            assert_eq!(heap.size_of(heap.block_of(p)), 72);
            assert!(heap.check());
        }
    }

    #[test]
    fn reallocate_moves_and_copies_when_neighbors_cannot_help() {
        let mut heap = heap();

        unsafe {
            let p = heap.allocate(16).unwrap();

            for i in 0..16 {
                p.as_ptr().add(i).write(i as u8);
            }

            let r = heap.reallocate(Some(p), 4096).unwrap();

            assert_ne!(r, p);
            for i in 0..16 {
                assert_eq!(r.as_ptr().add(i).read(), i as u8);
            }
            assert!(heap.check());

            heap.free(r);
            assert!(heap.check());
        }
    }

    #[test]
    fn reallocate_null_allocates() {
        let mut heap = heap();

        unsafe {
            let p = heap.reallocate(None, 32).unwrap();
            assert_eq!(heap.size_of(heap.block_of(p)), 40);
            assert!(heap.check());
        }
    }

    #[test]
    fn reallocate_zero_frees() {
        let mut heap = heap();

        unsafe {
            let p = heap.allocate(32).unwrap();
            assert!(heap.reallocate(Some(p), 0).is_none());
            assert!(heap.check());
            assert_eq!(listed_free_blocks(&heap), 1);
        }
    }

    #[test]
    fn reallocate_negative_size_is_refused() {
        let mut heap = heap();

        unsafe {
            let p = heap.allocate(32).unwrap();
            let block = heap.block_of(p);

            assert!(heap.reallocate(Some(p), usize::MAX).is_none());

            // The block is still intact and allocated.
            assert!(heap.is_allocated(block));
            assert_eq!(heap.size_of(block), 40);
            assert!(heap.check());
        }
    }

    #[test]
    fn reallocate_same_size_returns_same_address() {
        let mut heap = heap();

        unsafe {
            let p = heap.allocate(24).unwrap();
            let q = heap.reallocate(Some(p), 24).unwrap();
            assert_eq!(q, p);
            assert!(heap.check());
        }
    }

    #[test]
    fn exhausted_region_fails_cleanly() {
        let mut heap = heap();

        unsafe {
            assert!(heap.allocate(MAX_HEAP + 1).is_none());
            assert!(heap.check());

            // A huge but in-range request still fails because the region
            // cannot cover the tags, and the heap stays usable.
            assert!(heap.allocate(MAX_HEAP).is_none());
            assert!(heap.check());

            let p = heap.allocate(64).unwrap();
            heap.free(p);
            assert!(heap.check());
        }
    }

    /// Pseudo random allocate/free/reallocate storm. After releasing every
    /// block the whole payload region must have collapsed back into exactly
    /// one free block.
    #[test]
    fn round_trip_collapses_to_one_block() {
        fn lcg(state: &mut u64) -> u64 {
            *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *state
        }

        let mut heap = heap();
        let sizes = [8usize, 24, 120, 1024, 8192];
        let mut rng = 0xDEAD_BEEF_u64;
        let mut live = Vec::new();

        unsafe {
            for i in 0..40 {
                let size = sizes[i % sizes.len()];
                live.push(heap.allocate(size).unwrap());
                assert!(heap.check());
            }

            // Free half in a shuffled order.
            for _ in 0..20 {
                let index = lcg(&mut rng) as usize % live.len();
                heap.free(live.swap_remove(index));
                assert!(heap.check());
            }

            // Reallocate the other half to random new sizes.
            for slot in live.iter_mut() {
                let size = sizes[lcg(&mut rng) as usize % sizes.len()];
                *slot = heap.reallocate(Some(*slot), size).unwrap();
                assert!(heap.check());
            }

            while let Some(address) = live.pop() {
                heap.free(address);
                assert!(heap.check());
            }

            assert_eq!(listed_free_blocks(&heap), 1);

            let block = Block::at_payload(FIRST_BLOCK);
            assert!(!heap.is_allocated(block));
            assert_eq!(heap.size_of(block), heap.size() - FIRST_BLOCK);
        }
    }

    #[test]
    fn init_resets_previous_state() {
        let mut heap = heap();

        unsafe {
            let p = heap.allocate(128).unwrap();
            let _ = p;

            heap.init().unwrap();

            assert_eq!(heap.size(), DIRECTORY_SIZE + 4 * WSIZE + CHUNK_SIZE);
            assert_eq!(listed_free_blocks(&heap), 1);
            assert!(heap.check());
        }
    }
}
