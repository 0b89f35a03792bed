use std::{
    cmp,
    ptr::{self, NonNull},
};

use crate::{
    block::{self, BlockPtr, CHUNK_SIZE, MIN_BLOCK_SIZE, WORD},
    freelist::{bin_index, BinDirectory, BIN_COUNT, DIRECTORY_SIZE},
    segment::Segment,
    OutOfMemory, Pointer,
};

/// The allocator core: one grow-only heap of blocks plus the segregated
/// free-list registry that indexes the free ones. The heap proper is
/// bracketed by two synthetic allocated pseudo blocks so that no real block
/// ever coalesces off either end:
///
/// ```text
/// segment.lo()
///  |
///  v
///  +------------+-----+----------+----------+------//------+----------+
///  | bin heads  | pad | prologue | block    |     ...      | epilogue |
///  | 7 x 8 B    | 4 B | 8 B      |          |              | size 0   |
///  +------------+-----+----------+----------+------//------+----------+
///                       always                               always
///                       allocated                            allocated
/// ```
///
/// The prologue is a size-8 block that is permanently allocated, so the
/// first real block's PREV_ALLOC bit is permanently set and backward
/// coalescing stops there. The epilogue is a bare size-0 header that is
/// permanently allocated; it terminates forward traversal and absorbs the
/// header of whatever block the next heap extension creates.
///
/// Allocation flow: adjust the request, first-fit over the bins, on a miss
/// extend the heap, then place (split or take whole). Release flow: mark
/// free, coalesce with both neighbours, insert. See [`crate::freelist`] for
/// the bin discipline and [`crate::check`] for the invariants this
/// structure maintains between public calls.
pub struct Heap {
    /// The byte region all blocks live in.
    pub(crate) segment: Segment,
    /// Segregated free-list registry, anchored at `segment.lo()`.
    pub(crate) bins: BinDirectory,
    /// The low pseudo block; heap walks start here.
    pub(crate) prologue: BlockPtr,
}

/// The heap owns its arena exclusively and hands out raw bytes, nothing in
/// it is tied to the creating thread.
unsafe impl Send for Heap {}

/// Rounds a requested byte count up to a legal block size: one extra word
/// for the header, 8-byte granularity, and never below [`MIN_BLOCK_SIZE`]
/// so the block can host link words and a footer once it is released.
#[inline]
fn adjust(size: usize) -> usize {
    cmp::max(MIN_BLOCK_SIZE, block::align(size + WORD))
}

impl Heap {
    /// Sets up an empty heap: reserves the arena, writes the bin heads, the
    /// prologue and the epilogue, then grows the heap by one chunk so the
    /// first small allocation doesn't need to extend.
    pub fn new() -> Result<Self, OutOfMemory> {
        let mut segment = Segment::reserve()?;

        // Head array, one padding word, prologue header + footer, epilogue.
        let bootstrap = DIRECTORY_SIZE + 4 * WORD;
        let base = segment.extend(bootstrap).ok_or(OutOfMemory)?;

        unsafe {
            let bins = BinDirectory::new(base);
            bins.initialize();

            // The padding word keeps the prologue payload 8-aligned.
            block::store_word(base.as_ptr().add(DIRECTORY_SIZE).cast(), 0);

            let payload = NonNull::new_unchecked(base.as_ptr().add(DIRECTORY_SIZE + 2 * WORD));
            let prologue = BlockPtr::from_payload(payload);
            prologue.write_header(2 * WORD, false, true);
            // The prologue is the one allocated block with a footer; it
            // simply mirrors the header.
            block::store_word(prologue.footer(), block::load_word(prologue.header()));

            let epilogue = prologue.next();
            epilogue.write_header(0, true, true);

            let mut heap = Heap {
                segment,
                bins,
                prologue,
            };

            heap.extend(CHUNK_SIZE / WORD).ok_or(OutOfMemory)?;

            Ok(heap)
        }
    }

    /// Allocates a block of at least `size` bytes and returns its payload
    /// address, 8-aligned. Returns `None` for zero-sized requests and when
    /// the heap cannot grow any further.
    pub fn allocate(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 {
            return None;
        }

        let asize = adjust(size);

        unsafe {
            let free_block = match self.find_fit(asize) {
                Some(found) => found,
                None => self.extend(cmp::max(asize, CHUNK_SIZE) / WORD)?,
            };

            self.place(free_block, asize);

            Some(free_block.payload())
        }
    }

    /// Releases a block previously returned by [`Self::allocate`]. A null
    /// `address` is a no-op.
    ///
    /// # Safety
    ///
    /// `address` must be null or a payload address obtained from this heap
    /// that has not been released since.
    pub unsafe fn release(&mut self, address: *mut u8) {
        let Some(payload) = NonNull::new(address) else {
            return;
        };

        let released = BlockPtr::from_payload(payload);
        let size = released.size();

        // Clear CURR_ALLOC, keep whatever PREV_ALLOC said, grow a footer.
        released.write_header(size, released.prev_allocated(), false);
        released.write_footer(size);
        released.next().set_prev_allocated(false);

        self.coalesce(released);
    }

    /// Resizes the allocation at `address` to `size` bytes by moving it:
    /// allocate, copy, release. Null `address` behaves like [`Self::allocate`],
    /// `size == 0` behaves like [`Self::release`] and yields `None`. When the
    /// new allocation fails the original block is left untouched and `None`
    /// is returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::release`].
    pub unsafe fn reallocate(&mut self, address: *mut u8, size: usize) -> Pointer<u8> {
        let Some(payload) = NonNull::new(address) else {
            return self.allocate(size);
        };

        if size == 0 {
            self.release(address);
            return None;
        }

        // Grab the new block before touching the old one, so exhaustion
        // leaves the caller's data where it was.
        let new_payload = self.allocate(size)?;

        let old_block = BlockPtr::from_payload(payload);
        let count = cmp::min(size, old_block.size() - WORD);
        ptr::copy_nonoverlapping(payload.as_ptr(), new_payload.as_ptr(), count);

        self.release(address);

        Some(new_payload)
    }

    /// Allocates `count * size` bytes and zeroes all of them. Returns
    /// `None` when the product is zero, overflows, or doesn't fit.
    pub fn zeroed_allocate(&mut self, count: usize, size: usize) -> Pointer<u8> {
        let total = count.checked_mul(size)?;
        let payload = self.allocate(total)?;

        unsafe { payload.as_ptr().write_bytes(0, total) };

        Some(payload)
    }

    /// First-fit search: scan the bin the request maps to, then every
    /// larger bin, in list order. No best-fit effort is made within a bin.
    unsafe fn find_fit(&self, asize: usize) -> Option<BlockPtr> {
        for bin in bin_index(asize)..BIN_COUNT {
            let mut current = self.bins.head(bin);

            while let Some(candidate) = current {
                if candidate.size() >= asize {
                    return Some(candidate);
                }
                current = self.bins.succ(candidate);
            }
        }

        None
    }

    /// Grows the heap by `words` words, rounded up to an even count to keep
    /// 8-byte alignment. The new region becomes a free block whose header
    /// overwrites the old epilogue slot; a fresh epilogue is written past
    /// it. Returns the fully coalesced block, or `None` when the segment is
    /// exhausted.
    unsafe fn extend(&mut self, words: usize) -> Option<BlockPtr> {
        let size = (words + words % 2) * WORD;

        let address = self.segment.extend(size)?;

        let grown = BlockPtr::from_payload(NonNull::new_unchecked(address.as_ptr()));
        // The old epilogue header still records whether the last real block
        // is allocated; the new block inherits that bit.
        let prev_allocated = grown.prev_allocated();
        grown.write_header(size, prev_allocated, false);
        grown.write_footer(size);

        grown.next().write_header(0, false, true);

        Some(self.coalesce(grown))
    }

    /// Merges `block` (already marked free, not yet linked) with whichever
    /// neighbours are free and inserts the result into its bin. Returns the
    /// surviving block, which is `block` itself unless the lower neighbour
    /// absorbed it.
    unsafe fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        let next = block.next();

        let merged = match (block.prev_allocated(), next.is_allocated()) {
            // Nothing to merge.
            (true, true) => {
                self.bins.insert(block);
                block
            }
            // Absorb the block above.
            (true, false) => {
                self.bins.remove(next);

                let size = block.size() + next.size();
                block.write_header(size, true, false);
                block.write_footer(size);

                self.bins.insert(block);
                block
            }
            // The block below absorbs us. Its own PREV_ALLOC survives.
            (false, true) => {
                let prev = block.prev();
                self.bins.remove(prev);

                let size = prev.size() + block.size();
                let prev_allocated = prev.prev_allocated();
                prev.write_header(size, prev_allocated, false);
                prev.write_footer(size);

                self.bins.insert(prev);
                prev
            }
            // Both neighbours fold in.
            (false, false) => {
                let prev = block.prev();
                self.bins.remove(prev);
                self.bins.remove(next);

                let size = prev.size() + block.size() + next.size();
                let prev_allocated = prev.prev_allocated();
                prev.write_header(size, prev_allocated, false);
                prev.write_footer(size);

                self.bins.insert(prev);
                prev
            }
        };

        merged.next().set_prev_allocated(false);

        merged
    }

    /// Carves an `asize`-byte allocated block out of the free `block`. The
    /// prefix becomes the allocation; the rest, if it can stand on its own,
    /// becomes a free residual. Splitting prefers an in-place list
    /// substitution: when the residual still maps to the old block's bin it
    /// simply takes over its PRED/SUCC position, no bin surgery at all.
    unsafe fn place(&mut self, block: BlockPtr, asize: usize) {
        let csize = block.size();
        let residual_size = csize - asize;

        if residual_size < MIN_BLOCK_SIZE {
            // Too small to stand alone: the whole block is handed out and
            // the trailing bytes ride along as slack.
            self.bins.remove(block);
            block.write_header(csize, block.prev_allocated(), true);
            block.next().set_prev_allocated(true);
            return;
        }

        let residual =
            BlockPtr::from_payload(NonNull::new_unchecked(block.payload().as_ptr().add(asize)));
        residual.write_header(residual_size, true, false);
        residual.write_footer(residual_size);

        if bin_index(residual_size) == bin_index(csize) {
            self.bins.replace(block, residual);
        } else {
            self.bins.remove(block);
            self.bins.insert(residual);
        }

        block.write_header(asize, block.prev_allocated(), true);
        residual.next().set_prev_allocated(false);
    }
}

#[cfg(test)]
impl Heap {
    /// All free blocks in heap address order, found by walking the blocks
    /// rather than the bins. The checker cross-checks both views; tests
    /// that only care about the heap shape use this one.
    pub(crate) fn free_blocks(&self) -> Vec<BlockPtr> {
        let mut free = Vec::new();

        unsafe {
            let mut current = self.prologue.next();
            while !current.is_epilogue() {
                if !current.is_allocated() {
                    free.push(current);
                }
                current = current.next();
            }
        }

        free
    }
}
