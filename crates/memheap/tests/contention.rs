//! Concurrent exercise of a single heap through the public API.

use std::{cell::UnsafeCell, thread};

use memheap::RegionHeap;

const POOL_SIZE: usize = 64 * 1024;
const THREADS: usize = 4;
const ROUNDS: usize = 400;

#[repr(align(16))]
struct Pool(UnsafeCell<[u8; POOL_SIZE]>);

unsafe impl Sync for Pool {}

static POOL: Pool = Pool(UnsafeCell::new([0; POOL_SIZE]));
static HEAP: RegionHeap = RegionHeap::new();

#[test]
fn concurrent_alloc_free_preserves_accounting_and_contents() {
    unsafe { HEAP.init("contended", POOL.0.get().cast(), POOL_SIZE).unwrap() };
    let initial = HEAP.available_bytes();

    thread::scope(|scope| {
        for t in 0..THREADS {
            scope.spawn(move || {
                let fill = t as u8 + 1;
                for round in 0..ROUNDS {
                    let size = 16 + (t * 37 + round * 13) % 240;
                    let Some(ptr) = HEAP.allocate(size) else {
                        continue;
                    };
                    unsafe {
                        ptr.write_bytes(fill, size);
                        // payload bytes belong to this thread until freed
                        for i in 0..size {
                            assert_eq!(ptr.add(i).read(), fill);
                        }
                        let Some(ptr) = HEAP.reallocate(ptr, size * 2) else {
                            memheap::free(ptr);
                            continue;
                        };
                        for i in 0..size {
                            assert_eq!(ptr.add(i).read(), fill);
                        }
                        memheap::free(ptr);
                    }
                }
            });
        }
    });

    assert_eq!(
        HEAP.available_bytes(),
        initial,
        "all blocks freed, so the pool must coalesce back to a single body",
    );
    assert!(HEAP.max_used_bytes() <= HEAP.pool_bytes());
}
