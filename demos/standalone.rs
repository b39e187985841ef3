//! Walks through the basic allocate / reallocate / free cycle and shows
//! that the heap collapses back into a single free block at the end.

use segalloc::Segalloc;

fn main() {
    let allocator = Segalloc::new();
    allocator.init().expect("the region provider refused memory");

    let mut addresses = Vec::new();

    for size in [24usize, 120, 1024, 8192] {
        let address = allocator.allocate(size).expect("out of memory");

        unsafe { address.as_ptr().write_bytes(0xAB, size) };
        println!("allocated {size:>5} bytes at {address:?}");

        addresses.push((address, size));
    }

    // Grow the smallest allocation. Its right neighbor decides whether this
    // happens in place or by moving.
    let (first, _) = addresses[0];
    let grown = unsafe { allocator.reallocate(Some(first), 512) }.expect("out of memory");
    println!(
        "reallocated 24 -> 512 bytes, {}",
        if grown == first { "in place" } else { "moved" }
    );
    addresses[0] = (grown, 512);

    for (address, _) in addresses {
        unsafe { allocator.free(Some(address)) };
    }

    assert!(allocator.check());
    println!("heap consistent, {} bytes mapped", allocator.heap_size());
}
