use std::{
    alloc::{GlobalAlloc, Layout},
    ptr,
    sync::Mutex,
};

use crate::{block::ALIGNMENT, heap::Heap};

/// The thin global shim over [`Heap`]. One heap behind one [`Mutex`] is all
/// it takes to satisfy [`GlobalAlloc`]: the core is strictly single
/// threaded, the lock serialises every entry point, and the heap itself is
/// created lazily by the first allocation (creating it eagerly isn't
/// possible in a `const` global anyway).
///
/// Only alignments up to 8 bytes are supported; requests for more return
/// null and callers holding exotic alignment requirements need a different
/// allocator. That covers every primitive type and almost every struct a
/// program allocates.
///
/// # Examples
///
/// ```no_run
/// use segalloc::Segalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Segalloc = Segalloc::new();
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
pub struct Segalloc {
    heap: Mutex<Option<Heap>>,
}

impl Segalloc {
    /// Builds the shim without reserving anything; the arena appears when
    /// the first allocation does.
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(None),
        }
    }

    /// Runs `operation` on the heap, creating the heap first if this is the
    /// earliest call. Lock or reservation failure surfaces as `None`, which
    /// the callers below translate to a null pointer.
    fn with_heap<R>(&self, operation: impl FnOnce(&mut Heap) -> R) -> Option<R> {
        let mut guard = self.heap.lock().ok()?;

        let heap = match guard.as_mut() {
            Some(heap) => heap,
            None => guard.insert(Heap::new().ok()?),
        };

        Some(operation(heap))
    }
}

impl Default for Segalloc {
    fn default() -> Self {
        Segalloc::new()
    }
}

unsafe impl GlobalAlloc for Segalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.with_heap(|heap| heap.allocate(layout.size()))
            .flatten()
            .map_or(ptr::null_mut(), |payload| payload.as_ptr())
    }

    unsafe fn dealloc(&self, address: *mut u8, _layout: Layout) {
        self.with_heap(|heap| unsafe { heap.release(address) });
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.with_heap(|heap| heap.zeroed_allocate(layout.size(), 1))
            .flatten()
            .map_or(ptr::null_mut(), |payload| payload.as_ptr())
    }

    unsafe fn realloc(&self, address: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.with_heap(|heap| unsafe { heap.reallocate(address, new_size) })
            .flatten()
            .map_or(ptr::null_mut(), |payload| payload.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn alloc_and_dealloc() {
        let allocator = Segalloc::new();

        unsafe {
            let layout = Layout::array::<u8>(128).unwrap();
            let address = allocator.alloc(layout);
            assert!(!address.is_null());
            assert_eq!(address as usize % ALIGNMENT, 0);

            address.write_bytes(69, 128);
            for i in 0..128 {
                assert_eq!(*address.add(i), 69);
            }

            allocator.dealloc(address, layout);
        }
    }

    #[test]
    fn rejects_large_alignments() {
        let allocator = Segalloc::new();

        unsafe {
            let layout = Layout::from_size_align(64, 16).unwrap();
            assert!(allocator.alloc(layout).is_null());
            assert!(allocator.alloc_zeroed(layout).is_null());
        }
    }

    #[test]
    fn zeroed_through_the_trait() {
        let allocator = Segalloc::new();

        unsafe {
            let layout = Layout::array::<u8>(256).unwrap();

            // Dirty and return a block first so the zeroing is observable.
            let dirty = allocator.alloc(layout);
            dirty.write_bytes(0xFF, 256);
            allocator.dealloc(dirty, layout);

            let address = allocator.alloc_zeroed(layout);
            for i in 0..256 {
                assert_eq!(*address.add(i), 0);
            }

            allocator.dealloc(address, layout);
        }
    }

    #[test]
    fn realloc_through_the_trait() {
        let allocator = Segalloc::new();

        unsafe {
            let layout = Layout::array::<u8>(32).unwrap();
            let address = allocator.alloc(layout);
            address.write_bytes(42, 32);

            let grown = allocator.realloc(address, layout, 512);
            assert!(!grown.is_null());
            for i in 0..32 {
                assert_eq!(*grown.add(i), 42);
            }

            allocator.dealloc(grown, Layout::array::<u8>(512).unwrap());
        }
    }

    #[test]
    fn threads_share_the_shim() {
        let allocator = Segalloc::new();

        let num_threads: usize = 8;
        let num_allocs = if cfg!(miri) { 10 } else { 500 };

        thread::scope(|scope| {
            for t in 0..num_threads {
                let allocator = &allocator;
                scope.spawn(move || unsafe {
                    let layout = Layout::array::<u8>(64 + t).unwrap();

                    for _ in 0..num_allocs {
                        let address = allocator.alloc(layout);
                        assert!(!address.is_null());

                        // Stamp the block and make sure nobody else got
                        // handed the same bytes.
                        address.write_bytes(t as u8, layout.size());
                        for i in 0..layout.size() {
                            assert_eq!(*address.add(i), t as u8);
                        }

                        allocator.dealloc(address, layout);
                    }
                });
            }
        });
    }
}
