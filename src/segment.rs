use std::ptr::NonNull;

use crate::{platform, OutOfMemory, Pointer};

/// Upper bound on the heap, in bytes. Free blocks link to each other with
/// 32-bit offsets from the segment base, so the heap must stay below 2^32
/// bytes; 32 MiB is plenty for the workloads this allocator targets while
/// keeping the reservation cheap (the kernel only backs pages we touch).
pub(crate) const MAX_HEAP: usize = 1 << 25;

/// The grow-only heap substrate. One contiguous region is reserved from the
/// platform when the heap is created and the in-use prefix grows upwards by
/// bumping a break cursor, the way `sbrk` moves a program break:
///
/// ```text
///             base                    base + len          base + capacity
///              |                           |                     |
///              v                           v                     v
///              +---------------------------+---------------------+
///              |      in-use heap          |  reserved, unused   |
///              +---------------------------+---------------------+
///                                          ^
///                                          |
///                       extend() hands out bytes from here
/// ```
///
/// Nothing is ever handed back before the segment itself is dropped, and the
/// region never moves, so every address below the break stays valid for the
/// lifetime of the segment. That property is what lets blocks address each
/// other with plain base-relative offsets.
pub(crate) struct Segment {
    /// First byte of the reservation.
    base: NonNull<u8>,
    /// Bytes handed out so far, our break cursor.
    len: usize,
    /// Total bytes reserved from the platform.
    capacity: usize,
}

impl Segment {
    /// Reserves the arena. The requested capacity is rounded up to a whole
    /// number of pages, not that the kernel would give us less anyway.
    pub fn reserve() -> Result<Self, OutOfMemory> {
        let page = platform::page_size();
        let capacity = (MAX_HEAP + page - 1) & !(page - 1);

        let base = unsafe { platform::reserve_arena(capacity) }.ok_or(OutOfMemory)?;

        Ok(Self {
            base,
            len: 0,
            capacity,
        })
    }

    /// Grows the in-use heap upward by `nbytes` and returns the address of
    /// the first new byte, or `None` when the reservation is exhausted. The
    /// break never moves on failure.
    pub fn extend(&mut self, nbytes: usize) -> Pointer<u8> {
        if self.capacity - self.len < nbytes {
            return None;
        }

        let address = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.len)) };
        self.len += nbytes;

        Some(address)
    }

    /// Address of the first byte of the heap.
    #[inline]
    pub fn lo(&self) -> NonNull<u8> {
        self.base
    }

    /// Address of the last in-use byte of the heap.
    #[inline]
    pub fn hi(&self) -> *const u8 {
        unsafe { self.base.as_ptr().add(self.len).sub(1) }
    }

    /// Whether `address` falls inside the in-use heap.
    #[inline]
    pub fn contains(&self, address: *const u8) -> bool {
        self.base.as_ptr() as *const u8 <= address && address <= self.hi()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe { platform::release_arena(self.base, self.capacity) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_bumping() {
        let mut segment = Segment::reserve().unwrap();

        let first = segment.extend(72).unwrap();
        assert_eq!(first, segment.lo());

        // Consecutive extensions must be contiguous.
        let second = segment.extend(64).unwrap();
        assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 72);

        assert_eq!(segment.hi() as usize - segment.lo().as_ptr() as usize, 135);
        assert!(segment.contains(first.as_ptr()));
        assert!(segment.contains(segment.hi()));
        assert!(!segment.contains(unsafe { segment.hi().add(1) }));
    }

    #[test]
    fn exhaustion() {
        let mut segment = Segment::reserve().unwrap();

        assert!(segment.extend(MAX_HEAP + 1).is_none());

        // A failed extension must not move the break.
        let address = segment.extend(8).unwrap();
        assert_eq!(address, segment.lo());

        // The reservation is page rounded, so asking for the remaining
        // capacity exactly still succeeds.
        let remaining = segment.capacity - 8;
        assert!(segment.extend(remaining).is_some());
        assert!(segment.extend(1).is_none());
    }
}
