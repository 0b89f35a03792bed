use std::ptr::NonNull;

use segalloc::Heap;

fn print_alloc(address: NonNull<u8>, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {address:?}");
}

fn main() {
    let mut heap = Heap::new().expect("could not reserve the heap arena");

    let size1 = 1;
    let addr1 = heap.allocate(size1).unwrap();
    print_alloc(addr1, size1);

    let size2 = 1024;
    let addr2 = heap.allocate(size2).unwrap();
    print_alloc(addr2, size2);

    let size3 = 4096;
    let addr3 = heap.allocate(size3).unwrap();
    print_alloc(addr3, size3);

    // The checker walks every block and every bin; a bug above would abort
    // right here with a diagnostic instead of corrupting memory silently.
    heap.check_heap(line!());

    println!("Deallocating everything...");
    unsafe {
        heap.release(addr1.as_ptr());
        heap.release(addr2.as_ptr());
        heap.release(addr3.as_ptr());
    }

    heap.check_heap(line!());

    println!("\nNow let's try a reallocation...");
    let mut address = heap.allocate(10).unwrap();
    print_alloc(address, 10);

    for grown_size in [100, 1000, 10_000] {
        address = unsafe { heap.reallocate(address.as_ptr(), grown_size).unwrap() };
        print_alloc(address, grown_size);
    }

    heap.check_heap(line!());
}
