use std::ptr::NonNull;

use crate::block::{load_word, store_word, BlockPtr, MIN_BLOCK_SIZE, WORD};

/// Number of size-class bins.
pub(crate) const BIN_COUNT: usize = 7;

/// Bytes reserved per bin head at the bottom of the heap. One pointer-sized
/// slot each; 8 bytes keeps everything after the head array double-word
/// aligned on every target.
pub(crate) const HEAD_SIZE: usize = 8;

/// Total size of the head array.
pub(crate) const DIRECTORY_SIZE: usize = BIN_COUNT * HEAD_SIZE;

/// Maps a block size in bytes to its bin. The boundaries were tuned against
/// allocation traces, they're deliberately not powers of two: the small end
/// gets two narrow bins because small blocks dominate most workloads, and
/// everything above 4500 bytes shares the last bin.
pub(crate) fn bin_index(size: usize) -> usize {
    match size {
        0..=50 => 0,
        51..=100 => 1,
        101..=1000 => 2,
        1001..=2000 => 3,
        2001..=3000 => 4,
        3001..=4500 => 5,
        _ => 6,
    }
}

/// The segregated free-list registry. Each bin holds an unordered doubly
/// linked list of the free blocks whose size maps to it; the seven head
/// slots live in the first bytes of the heap itself, right below the
/// prologue:
///
/// ```text
/// heap base -> +--------------+
///              | head[0]      | ---> smallest blocks (<= 50 bytes)
///              | head[1]      | ---> 51..=100
///              |    ...       |
///              | head[6]      | ---> everything above 4500 bytes
///              +--------------+
///              | padding      |
///              | prologue     |
///              | blocks ...   |
/// ```
///
/// Free blocks don't link to each other with full pointers. The first two
/// payload words of a free block hold 32-bit offsets from the heap base:
/// the PRED word stores the offset of the predecessor's PRED word (which is
/// its payload address) and the SUCC word stores the offset of the
/// successor's SUCC word (payload + 4):
///
/// ```text
///     head[i]                 free block A              free block B
///        |                +----------------+        +----------------+
///        |                |     header     |        |     header     |
///        +--------------> | PRED = 0       |   +--> | PRED = off(A)  |
///                         | SUCC = off(B)+4| --+    | SUCC = 0       |
///                         |      ...       |        |      ...       |
///                         |     footer     |        |     footer     |
///                         +----------------+        +----------------+
/// ```
///
/// Half-size links are what keep the minimum block at 16 bytes: two 8-byte
/// pointers plus header and footer would push it to 24. Offset zero is the
/// reserved "none" sentinel; it can never collide with a real link because
/// the head array itself occupies the bottom of the heap, so no block
/// payload ever sits at offset zero.
#[derive(Clone, Copy)]
pub(crate) struct BinDirectory {
    /// Bottom of the heap. Offsets are measured from here and the head
    /// array is written here.
    base: NonNull<u8>,
}

impl BinDirectory {
    /// Anchors the directory at the bottom of the heap. Nothing is written
    /// until [`Self::initialize`].
    pub fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }

    /// Clears every head slot. Must run once before any insertion, on
    /// memory that already belongs to the heap.
    pub unsafe fn initialize(&self) {
        self.base.as_ptr().write_bytes(0, DIRECTORY_SIZE);
    }

    #[inline]
    unsafe fn head_slot(&self, bin: usize) -> *mut usize {
        self.base.as_ptr().add(bin * HEAD_SIZE).cast()
    }

    /// First block of `bin`, or `None` when the bin is empty.
    pub unsafe fn head(&self, bin: usize) -> Option<BlockPtr> {
        let address = self.head_slot(bin).read();

        NonNull::new(address as *mut u8).map(|payload| BlockPtr::from_payload(payload))
    }

    unsafe fn set_head(&self, bin: usize, block: Option<BlockPtr>) {
        let address = block.map_or(0, |b| b.payload().as_ptr() as usize);
        self.head_slot(bin).write(address);
    }

    /// Offset of `address` from the heap base. The heap never outgrows
    /// 2^32 bytes, the cast is exact.
    #[inline]
    fn offset_of(&self, address: *mut u8) -> u32 {
        (address as usize - self.base.as_ptr() as usize) as u32
    }

    #[inline]
    unsafe fn at_offset(&self, offset: u32) -> *mut u8 {
        self.base.as_ptr().add(offset as usize)
    }

    /// The PRED word is the first payload word of a free block.
    #[inline]
    unsafe fn pred_slot(block: BlockPtr) -> *mut u32 {
        block.payload().as_ptr().cast()
    }

    /// The SUCC word is the second payload word of a free block.
    #[inline]
    unsafe fn succ_slot(block: BlockPtr) -> *mut u32 {
        block.payload().as_ptr().add(WORD).cast()
    }

    /// Predecessor of `block` in its bin list.
    pub unsafe fn pred(&self, block: BlockPtr) -> Option<BlockPtr> {
        match load_word(Self::pred_slot(block)) {
            0 => None,
            offset => {
                let payload = NonNull::new_unchecked(self.at_offset(offset));
                Some(BlockPtr::from_payload(payload))
            }
        }
    }

    /// Successor of `block` in its bin list.
    pub unsafe fn succ(&self, block: BlockPtr) -> Option<BlockPtr> {
        match load_word(Self::succ_slot(block)) {
            0 => None,
            offset => {
                // The stored offset aims at the successor's SUCC word, one
                // word above its payload.
                let payload = NonNull::new_unchecked(self.at_offset(offset - WORD as u32));
                Some(BlockPtr::from_payload(payload))
            }
        }
    }

    unsafe fn set_pred(&self, block: BlockPtr, pred: Option<BlockPtr>) {
        let offset = pred.map_or(0, |p| self.offset_of(p.payload().as_ptr()));
        store_word(Self::pred_slot(block), offset);
    }

    unsafe fn set_succ(&self, block: BlockPtr, succ: Option<BlockPtr>) {
        let offset = succ.map_or(0, |s| {
            self.offset_of(s.payload().as_ptr()) + WORD as u32
        });
        store_word(Self::succ_slot(block), offset);
    }

    /// Prepends `block` to the bin its size maps to. Newest blocks sit at
    /// the head, so reuse is LIFO within a bin.
    pub unsafe fn insert(&self, block: BlockPtr) {
        debug_assert!(block.size() >= MIN_BLOCK_SIZE);
        debug_assert!(!block.is_allocated());

        let bin = bin_index(block.size());

        match self.head(bin) {
            None => {
                self.set_pred(block, None);
                self.set_succ(block, None);
            }
            Some(old_head) => {
                self.set_pred(old_head, Some(block));
                self.set_succ(block, Some(old_head));
                self.set_pred(block, None);
            }
        }

        self.set_head(bin, Some(block));
    }

    /// Splices `block` out of its bin. The block must currently be linked;
    /// unlinking a block that is in no list means the heap is corrupt and
    /// the unwraps here are where that bug dies.
    pub unsafe fn remove(&self, block: BlockPtr) {
        let bin = bin_index(block.size());

        if self.head(bin) == Some(block) {
            match self.succ(block) {
                None => self.set_head(bin, None),
                Some(next) => {
                    self.set_head(bin, Some(next));
                    self.set_pred(next, None);
                }
            }
        } else if self.succ(block).is_none() {
            self.set_succ(self.pred(block).unwrap(), None);
        } else {
            let pred = self.pred(block).unwrap();
            let succ = self.succ(block).unwrap();
            self.set_pred(succ, Some(pred));
            self.set_succ(pred, Some(succ));
        }

        self.set_pred(block, None);
        self.set_succ(block, None);
    }

    /// Substitutes `new` for `old` in place: `new` inherits `old`'s exact
    /// position in the list without any traversal. Used by block splitting
    /// when the shrunken residual still maps to the same bin. Both blocks
    /// must map to that one bin and `new` must carry a valid free header
    /// already.
    pub unsafe fn replace(&self, old: BlockPtr, new: BlockPtr) {
        debug_assert_eq!(bin_index(old.size()), bin_index(new.size()));

        let bin = bin_index(new.size());

        // New block takes over the old link words verbatim.
        store_word(Self::pred_slot(new), load_word(Self::pred_slot(old)));
        store_word(Self::succ_slot(new), load_word(Self::succ_slot(old)));

        // Then both neighbours (and the head slot, if the old block was the
        // head) are re-aimed at the new block.
        if self.head(bin) == Some(old) {
            if let Some(succ) = self.succ(new) {
                self.set_pred(succ, Some(new));
            }
            self.set_head(bin, Some(new));
        } else if self.succ(new).is_none() {
            self.set_succ(self.pred(new).unwrap(), Some(new));
        } else {
            self.set_pred(self.succ(new).unwrap(), Some(new));
            self.set_succ(self.pred(new).unwrap(), Some(new));
        }

        self.set_pred(old, None);
        self.set_succ(old, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_boundaries() {
        // Every boundary of the size-class table, both sides.
        assert_eq!(bin_index(16), 0);
        assert_eq!(bin_index(50), 0);
        assert_eq!(bin_index(51), 1);
        assert_eq!(bin_index(100), 1);
        assert_eq!(bin_index(101), 2);
        assert_eq!(bin_index(1000), 2);
        assert_eq!(bin_index(1001), 3);
        assert_eq!(bin_index(2000), 3);
        assert_eq!(bin_index(2001), 4);
        assert_eq!(bin_index(3000), 4);
        assert_eq!(bin_index(3001), 5);
        assert_eq!(bin_index(4500), 5);
        assert_eq!(bin_index(4501), 6);
        assert_eq!(bin_index(1 << 20), 6);
    }

    /// A fake heap: head array at the bottom, then room for a few blocks.
    #[repr(align(8))]
    struct Arena([u8; 512]);

    impl Arena {
        fn new() -> Self {
            Arena([0; 512])
        }

        fn directory(&mut self) -> BinDirectory {
            let directory = BinDirectory::new(NonNull::new(self.0.as_mut_ptr()).unwrap());
            unsafe { directory.initialize() };
            directory
        }

        /// Writes a free block of `size` bytes whose payload sits
        /// `payload_offset` bytes above the base.
        unsafe fn free_block(&mut self, payload_offset: usize, size: usize) -> BlockPtr {
            let payload = NonNull::new(self.0.as_mut_ptr().add(payload_offset)).unwrap();
            let block = BlockPtr::from_payload(payload);
            block.write_header(size, true, false);
            block.write_footer(size);
            block
        }
    }

    unsafe fn collect(directory: &BinDirectory, bin: usize) -> Vec<BlockPtr> {
        let mut blocks = Vec::new();
        let mut current = directory.head(bin);
        while let Some(block) = current {
            blocks.push(block);
            current = directory.succ(block);
        }
        blocks
    }

    #[test]
    fn lifo_insertion() {
        unsafe {
            let mut arena = Arena::new();
            let directory = arena.directory();

            let a = arena.free_block(64, 24);
            let b = arena.free_block(96, 24);
            let c = arena.free_block(128, 24);

            directory.insert(a);
            directory.insert(b);
            directory.insert(c);

            // All three sizes map to bin 0 and the newest sits at the head.
            assert_eq!(collect(&directory, 0), vec![c, b, a]);

            // Link-back symmetry.
            assert_eq!(directory.pred(b), Some(c));
            assert_eq!(directory.succ(b), Some(a));
            assert_eq!(directory.pred(c), None);
            assert_eq!(directory.succ(a), None);
        }
    }

    #[test]
    fn remove_head_interior_and_tail() {
        unsafe {
            let mut arena = Arena::new();
            let directory = arena.directory();

            let a = arena.free_block(64, 24);
            let b = arena.free_block(96, 24);
            let c = arena.free_block(128, 24);
            let d = arena.free_block(160, 24);

            for block in [a, b, c, d] {
                directory.insert(block);
            }

            // List is d, c, b, a. Interior first.
            directory.remove(c);
            assert_eq!(collect(&directory, 0), vec![d, b, a]);

            // Tail.
            directory.remove(a);
            assert_eq!(collect(&directory, 0), vec![d, b]);

            // Head.
            directory.remove(d);
            assert_eq!(collect(&directory, 0), vec![b]);
            assert_eq!(directory.pred(b), None);

            // Last one standing.
            directory.remove(b);
            assert_eq!(directory.head(0), None);
        }
    }

    #[test]
    fn removed_blocks_drop_their_links() {
        unsafe {
            let mut arena = Arena::new();
            let directory = arena.directory();

            let a = arena.free_block(64, 24);
            let b = arena.free_block(96, 24);

            directory.insert(a);
            directory.insert(b);
            directory.remove(b);

            assert_eq!(directory.pred(b), None);
            assert_eq!(directory.succ(b), None);
        }
    }

    #[test]
    fn replace_keeps_list_position() {
        unsafe {
            let mut arena = Arena::new();
            let directory = arena.directory();

            let a = arena.free_block(64, 24);
            let b = arena.free_block(96, 24);
            let c = arena.free_block(128, 24);

            for block in [a, b, c] {
                directory.insert(block);
            }

            // Replace the interior block with a physically distinct one of
            // the same bin.
            let b2 = arena.free_block(192, 32);
            directory.replace(b, b2);

            assert_eq!(collect(&directory, 0), vec![c, b2, a]);
            assert_eq!(directory.pred(a), Some(b2));
            assert_eq!(directory.succ(c), Some(b2));
            assert_eq!(directory.pred(b), None);
            assert_eq!(directory.succ(b), None);

            // Replace the head.
            let c2 = arena.free_block(224, 32);
            directory.replace(c, c2);
            assert_eq!(collect(&directory, 0), vec![c2, b2, a]);

            // Replace the tail.
            let a2 = arena.free_block(256, 32);
            directory.replace(a, a2);
            assert_eq!(collect(&directory, 0), vec![c2, b2, a2]);
        }
    }

    #[test]
    fn replace_singleton() {
        unsafe {
            let mut arena = Arena::new();
            let directory = arena.directory();

            let a = arena.free_block(64, 24);
            directory.insert(a);

            let b = arena.free_block(96, 24);
            directory.replace(a, b);

            assert_eq!(collect(&directory, 0), vec![b]);
            assert_eq!(directory.pred(b), None);
            assert_eq!(directory.succ(b), None);
        }
    }

    #[test]
    fn bins_are_independent() {
        unsafe {
            let mut arena = Arena::new();
            let directory = arena.directory();

            let small = arena.free_block(64, 24);
            let medium = arena.free_block(96, 64);
            let large = arena.free_block(192, 200);

            directory.insert(small);
            directory.insert(medium);
            directory.insert(large);

            assert_eq!(collect(&directory, 0), vec![small]);
            assert_eq!(collect(&directory, 1), vec![medium]);
            assert_eq!(collect(&directory, 2), vec![large]);
            for bin in 3..BIN_COUNT {
                assert_eq!(directory.head(bin), None);
            }
        }
    }
}
