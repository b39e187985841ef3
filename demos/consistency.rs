//! Runs the consistency checker after a burst of mixed operations. With the
//! `verify-on-free` feature enabled the same scan also runs automatically at
//! the end of every free.

use segalloc::Segalloc;

fn main() {
    let allocator = Segalloc::new();
    allocator.init().expect("the region provider refused memory");

    let mut live = Vec::new();
    let mut state = 0x2545F4914F6CDD1D_u64;

    for round in 0..200 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);

        match state % 3 {
            0 => {
                let size = 8 + (state >> 8) as usize % 4096;
                if let Some(address) = allocator.allocate(size) {
                    live.push(address);
                }
            }
            1 if !live.is_empty() => {
                let index = (state >> 16) as usize % live.len();
                unsafe { allocator.free(Some(live.swap_remove(index))) };
            }
            2 if !live.is_empty() => {
                let index = (state >> 16) as usize % live.len();
                let size = 8 + (state >> 24) as usize % 2048;
                if let Some(moved) = unsafe { allocator.reallocate(Some(live[index]), size) } {
                    live[index] = moved;
                }
            }
            _ => {}
        }

        let violations = allocator.verify();
        assert!(violations.is_empty(), "round {round}: {violations:?}");
    }

    while let Some(address) = live.pop() {
        unsafe { allocator.free(Some(address)) };
    }

    assert!(allocator.check());
    println!(
        "200 rounds survived, heap consistent at {} bytes",
        allocator.heap_size()
    );
}
