//! Platform entry points for the heap arena. The allocator's dealings with
//! the OS are deliberately minimal: one reservation when a heap is created,
//! one release when it is dropped. All growth happens inside the
//! reservation by bumping a break cursor, so nothing in this module runs on
//! the allocation path and there is no multi-region bookkeeping to abstract
//! over, just three free functions with a per-target backend.

use std::ptr::NonNull;

use crate::Pointer;

/// Reserves `length` bytes of read-write memory for a heap arena, or `None`
/// when the platform refuses. `length` must be a multiple of [`page_size`];
/// the returned address is page aligned and the memory reads as zero.
pub(crate) unsafe fn reserve_arena(length: usize) -> Pointer<u8> {
    sys::reserve_arena(length)
}

/// Hands a reserved arena back. `address` and `length` must be the exact
/// values of the matching [`reserve_arena`] call, and nothing may touch the
/// arena afterwards.
pub(crate) unsafe fn release_arena(address: NonNull<u8>, length: usize) {
    sys::release_arena(address, length)
}

/// Virtual memory page size in bytes. Queried per call; the only caller
/// reserves an arena once per heap, caching would buy nothing.
pub(crate) fn page_size() -> usize {
    sys::page_size()
}

#[cfg(all(unix, not(miri)))]
mod sys {
    use std::ptr::{self, NonNull};

    use crate::Pointer;

    pub unsafe fn reserve_arena(length: usize) -> Pointer<u8> {
        // Private, anonymous, read-write. The kernel backs only the pages
        // the heap actually touches, so reserving the whole arena up front
        // costs address space, not memory.
        let address = libc::mmap(
            ptr::null_mut(),
            length,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );

        if address == libc::MAP_FAILED {
            return None;
        }

        Some(NonNull::new_unchecked(address).cast())
    }

    pub unsafe fn release_arena(address: NonNull<u8>, length: usize) {
        // A failing munmap leaves the mapping in place; we run on the drop
        // path and have nobody to report that to.
        libc::munmap(address.cast().as_ptr(), length);
    }

    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
    }
}

#[cfg(all(windows, not(miri)))]
mod sys {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use crate::Pointer;

    pub unsafe fn reserve_arena(length: usize) -> Pointer<u8> {
        // Reserve and commit the whole arena in one call. Committed pages
        // still cost nothing until they are first touched.
        let address = Memory::VirtualAlloc(
            None,
            length,
            Memory::MEM_RESERVE | Memory::MEM_COMMIT,
            Memory::PAGE_READWRITE,
        );

        NonNull::new(address.cast())
    }

    pub unsafe fn release_arena(address: NonNull<u8>, _length: usize) {
        // MEM_RELEASE frees the entire allocation; the size must be zero.
        Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE);
    }

    pub fn page_size() -> usize {
        unsafe {
            let mut info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(info.as_mut_ptr());

            info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod sys {
    //! Miri has no FFI, so the arena is borrowed from the host global
    //! allocator instead. This doubles as a leak check for the arena
    //! itself: a heap that is never dropped shows up as a leaked
    //! reservation.

    use std::{alloc, ptr::NonNull};

    use crate::Pointer;

    fn arena_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    pub unsafe fn reserve_arena(length: usize) -> Pointer<u8> {
        // Zeroed, to match what a fresh mapping reads as.
        NonNull::new(alloc::alloc_zeroed(arena_layout(length)))
    }

    pub unsafe fn release_arena(address: NonNull<u8>, length: usize) {
        alloc::dealloc(address.as_ptr(), arena_layout(length));
    }

    pub fn page_size() -> usize {
        4096
    }
}
