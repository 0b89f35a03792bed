//! Heap-wide consistency checking. The checker is the last line of defence
//! against a corrupt heap, so it never allocates: it walks raw words,
//! returns plain enum values and leaves all formatting to the abort path.
//!
//! Two independent views of the heap are verified against each other: the
//! address-ordered block walk from prologue to epilogue, and the seven bin
//! lists. A free block that shows up in one view but not the other is how
//! most list-surgery bugs surface, which is what the final free-count
//! cross-check exists for.

use std::{fmt, process};

use crate::{
    block::{BlockPtr, ALIGNMENT, WORD},
    freelist::{bin_index, BIN_COUNT},
    heap::Heap,
};

/// One variant per consistency check. The payload is the address of the
/// offending block (or the bin / counters involved) so the abort diagnostic
/// can point somewhere useful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckError {
    /// The prologue is not an allocated size-8 block.
    BadPrologue,
    /// The epilogue is not marked allocated.
    BadEpilogue,
    /// A payload address is not 8-byte aligned.
    Misaligned { address: usize },
    /// A block lies outside the in-use heap.
    OutOfBounds { address: usize },
    /// A block's CURR_ALLOC disagrees with its successor's PREV_ALLOC.
    PrevAllocMismatch { address: usize },
    /// Two neighbouring blocks are both free: coalescing missed them.
    AdjacentFree { address: usize },
    /// A free block's header and footer disagree on size or state.
    FooterMismatch { address: usize },
    /// A free block is linked into a bin its size doesn't map to.
    WrongBin { address: usize, bin: usize },
    /// PRED/SUCC linkage is not symmetric around a free block.
    BrokenLink { address: usize },
    /// A bin list loops back on itself.
    Cycle { bin: usize },
    /// The heap walk and the bin lists disagree on how many free blocks
    /// exist.
    FreeCountMismatch { heap: usize, bins: usize },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CheckError::BadPrologue => {
                write!(f, "prologue is not an allocated size-8 block")
            }
            CheckError::BadEpilogue => {
                write!(f, "epilogue is not an allocated size-0 block")
            }
            CheckError::Misaligned { address } => {
                write!(f, "block {address:#x} is not 8-byte aligned")
            }
            CheckError::OutOfBounds { address } => {
                write!(f, "block {address:#x} lies outside the heap")
            }
            CheckError::PrevAllocMismatch { address } => write!(
                f,
                "PREV_ALLOC after block {address:#x} disagrees with its allocation state"
            ),
            CheckError::AdjacentFree { address } => {
                write!(f, "block {address:#x} and its successor are both free")
            }
            CheckError::FooterMismatch { address } => {
                write!(f, "free block {address:#x}: header and footer disagree")
            }
            CheckError::WrongBin { address, bin } => {
                write!(f, "free block {address:#x} does not belong in bin {bin}")
            }
            CheckError::BrokenLink { address } => {
                write!(f, "free block {address:#x}: PRED/SUCC links are not symmetric")
            }
            CheckError::Cycle { bin } => write!(f, "bin {bin} contains a cycle"),
            CheckError::FreeCountMismatch { heap, bins } => write!(
                f,
                "{heap} free blocks reachable in the heap, {bins} across the bins"
            ),
        }
    }
}

impl Heap {
    /// Verifies every structural invariant the allocator maintains between
    /// public operations. Cheap enough to run after every call in tests,
    /// way too expensive for release builds.
    pub(crate) fn consistency(&self) -> Result<(), CheckError> {
        unsafe {
            if self.prologue.size() != 2 * WORD || !self.prologue.is_allocated() {
                return Err(CheckError::BadPrologue);
            }

            // Address-ordered walk, counting free blocks as we go.
            let mut heap_free = 0;
            let mut block = self.prologue;

            while !block.is_epilogue() {
                self.check_block(block)?;

                if !block.is_allocated() {
                    heap_free += 1;
                    self.check_free_block(block)?;
                }

                block = block.next();
            }

            if !block.is_allocated() {
                return Err(CheckError::BadEpilogue);
            }

            // Bin walk. Cycle detection runs first per bin so the counting
            // loop below is guaranteed to terminate.
            let mut bin_free = 0;

            for bin in 0..BIN_COUNT {
                self.check_cycle(bin)?;

                let mut current = self.bins.head(bin);
                while let Some(candidate) = current {
                    if bin_index(candidate.size()) != bin {
                        return Err(CheckError::WrongBin {
                            address: candidate.payload().as_ptr() as usize,
                            bin,
                        });
                    }

                    bin_free += 1;
                    current = self.bins.succ(candidate);
                }
            }

            if heap_free != bin_free {
                return Err(CheckError::FreeCountMismatch {
                    heap: heap_free,
                    bins: bin_free,
                });
            }

            Ok(())
        }
    }

    /// Aborts the process with a diagnostic when any invariant is broken.
    /// `line` is the caller's source line, threaded through so a trace of
    /// calls can tell which operation corrupted the heap. A corrupt heap is
    /// a bug in the allocator itself, nothing recoverable.
    pub fn check_heap(&self, line: u32) {
        if let Err(violation) = self.consistency() {
            eprintln!("heap check failed (called from line {line}): {violation}");
            process::abort();
        }
    }

    /// Checks the invariants every block must satisfy.
    unsafe fn check_block(&self, block: BlockPtr) -> Result<(), CheckError> {
        let address = block.payload().as_ptr() as usize;

        if address % ALIGNMENT != 0 {
            return Err(CheckError::Misaligned { address });
        }

        if !self.segment.contains(block.payload().as_ptr()) {
            return Err(CheckError::OutOfBounds { address });
        }

        let next = block.next();

        if next.prev_allocated() != block.is_allocated() {
            return Err(CheckError::PrevAllocMismatch { address });
        }

        if !block.is_allocated() && !next.is_allocated() {
            return Err(CheckError::AdjacentFree { address });
        }

        Ok(())
    }

    /// Checks the extra invariants of a free block: boundary-tag agreement
    /// and link symmetry.
    unsafe fn check_free_block(&self, block: BlockPtr) -> Result<(), CheckError> {
        let address = block.payload().as_ptr() as usize;

        if block.footer_size() != block.size() || block.footer_allocated() {
            return Err(CheckError::FooterMismatch { address });
        }

        if let Some(succ) = self.bins.succ(block) {
            if self.bins.pred(succ) != Some(block) {
                return Err(CheckError::BrokenLink { address });
            }
        }

        if let Some(pred) = self.bins.pred(block) {
            if self.bins.succ(pred) != Some(block) {
                return Err(CheckError::BrokenLink { address });
            }
        }

        Ok(())
    }

    /// Tortoise and hare over one bin: the slow cursor advances one link,
    /// the fast cursor two, and if they ever meet the list loops.
    unsafe fn check_cycle(&self, bin: usize) -> Result<(), CheckError> {
        let mut slow = self.bins.head(bin);
        let mut fast = slow.and_then(|block| self.bins.succ(block));

        while let (Some(tortoise), Some(hare)) = (slow, fast) {
            if tortoise == hare {
                return Err(CheckError::Cycle { bin });
            }

            slow = self.bins.succ(tortoise);
            fast = self
                .bins
                .succ(hare)
                .and_then(|block| self.bins.succ(block));
        }

        Ok(())
    }
}
