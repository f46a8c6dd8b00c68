#![no_main]

use arbitrary::Arbitrary;
use coal_alloc::Buddy;
use libfuzzer_sys::fuzz_target;

const MAX_REGION: usize = 1 << 20;
const MAX_ALLOC: usize = 1 << 16;

#[derive(Clone, Debug, Arbitrary)]
enum HeapOp {
    Allocate(usize),
    Deallocate(usize),
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    region_size: usize,
    ops: Vec<HeapOp>,
}

fuzz_target!(|args: Args| {
    let mut heap = match Buddy::try_new(args.region_size % MAX_REGION) {
        Ok(heap) => heap,
        Err(_) => return,
    };

    let mut outstanding = Vec::new();

    for op in args.ops {
        match op {
            HeapOp::Allocate(size) => {
                if let Ok(block) = heap.allocate(size % MAX_ALLOC) {
                    outstanding.push(block);
                }
            }

            HeapOp::Deallocate(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let idx = raw_idx % outstanding.len();
                let block = outstanding.swap_remove(idx);
                unsafe { heap.deallocate(block.cast()) };
            }
        }
    }
});
