use segalloc::Segalloc;

// NOTE: This demo doesn't run under Miri. The arena is borrowed from the
// host global allocator there, and when we ARE the global allocator that
// reservation re-enters our own `Mutex` and deadlocks. We cannot simulate
// ourselves within ourselves.

#[global_allocator]
static ALLOCATOR: Segalloc = Segalloc::new();

fn main() {
    // One buffer per size class: the seven bins span <= 50 bytes up to
    // anything above 4500.
    let bin_sizes: [usize; 7] = [32, 80, 512, 1500, 2500, 4000, 8192];

    let mut buffers: Vec<Vec<u8>> = bin_sizes
        .iter()
        .map(|&size| {
            let buffer = vec![size as u8; size];
            println!("{size:>5} byte buffer at {:?}", buffer.as_ptr());
            buffer
        })
        .collect();

    // Punch holes by dropping every other buffer, then allocate into the
    // gaps: first-fit should reuse the freed blocks instead of growing the
    // heap.
    for index in [0, 2, 4, 6] {
        buffers[index] = Vec::new();
    }

    for size in [24usize, 400, 2200, 6000] {
        let buffer = vec![7u8; size];
        println!("reused a gap for {size} bytes at {:?}", buffer.as_ptr());
        buffers.push(buffer);
    }

    // Growing a Vec one push at a time walks its backing block up through
    // the bins via realloc, copying the contents along.
    let mut grown: Vec<u8> = Vec::with_capacity(40);
    for step in 0..6000u32 {
        grown.push(step as u8);
    }
    assert!(grown.iter().enumerate().all(|(i, &b)| b == i as u8));
    println!("grown to {} bytes at {:?}", grown.capacity(), grown.as_ptr());

    // The shim serialises threads behind its lock.
    let handle = std::thread::spawn(|| {
        let squares: Vec<usize> = (0..32).map(|n| n * n).collect();
        println!("second thread Vec at {:?}", squares.as_ptr());
        squares.iter().sum::<usize>()
    });

    println!("sum of squares from the other thread: {}", handle.join().unwrap());
}
