extern crate std;

use core::ptr::NonNull;
use std::collections::HashSet;
use std::prelude::rust_2021::*;

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{AllocError, AllocInitError, Buddy, Global, LEAF_SIZE};

const HEAP_BYTES: usize = 64 * 1024;

fn new_heap(size: usize) -> Buddy<Global> {
    Buddy::try_new(size).unwrap()
}

fn addr_of(block: NonNull<[u8]>) -> usize {
    block.as_ptr() as *mut u8 as usize
}

/// Allocates leaves until the heap is exhausted.
fn drain_leaves(heap: &mut Buddy<Global>) -> Vec<NonNull<[u8]>> {
    let mut leaves = Vec::new();
    loop {
        match heap.allocate(LEAF_SIZE) {
            Ok(leaf) => leaves.push(leaf),
            Err(AllocError) => break leaves,
        }
    }
}

/// Tiles the heap with leaves, then frees exactly the leaves covering one
/// fully-free, `span`-aligned window.
///
/// Afterwards the window is the only free memory: one free block of
/// `span` bytes, every other free list empty. This pins down the heap
/// state precisely even though the metadata prefix and the region size
/// vary. Returns the window's base address.
fn open_window(heap: &mut Buddy<Global>, span: usize) -> usize {
    let base = heap.region().as_ptr() as *mut u8 as usize;
    let heap_size = heap.heap_size();

    let leaves = drain_leaves(heap);
    let addrs: HashSet<usize> = leaves.iter().map(|leaf| addr_of(*leaf)).collect();

    let mut window = None;
    let mut ofs = 0;
    while ofs + span <= heap_size {
        if (0..span / LEAF_SIZE).all(|i| addrs.contains(&(base + ofs + i * LEAF_SIZE))) {
            window = Some(base + ofs);
            break;
        }
        ofs += span;
    }
    let window = window.expect("no fully-free span of the requested size");

    for leaf in leaves {
        let addr = addr_of(leaf);
        if (window..window + span).contains(&addr) {
            unsafe { heap.deallocate(leaf.cast()) };
        }
    }

    window
}

/// Deterministic Fisher-Yates shuffle; tests must not depend on ambient
/// randomness.
fn shuffle<T>(items: &mut [T], mut seed: u64) {
    for i in (1..items.len()).rev() {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let j = (seed >> 33) as usize % (i + 1);
        items.swap(i, j);
    }
}

#[test]
fn create_and_destroy() {
    let heap = new_heap(HEAP_BYTES);
    drop(heap);
}

#[test]
fn region_too_small() {
    assert!(matches!(
        Buddy::try_new(64),
        Err(AllocInitError::InvalidConfig)
    ));
    assert!(matches!(
        Buddy::try_new(0),
        Err(AllocInitError::InvalidConfig)
    ));
}

#[test]
fn alloc_zero_size() {
    let mut heap = new_heap(HEAP_BYTES);
    heap.allocate(0).unwrap_err();
}

#[test]
fn alloc_alignment_and_size_floor() {
    let mut heap = new_heap(HEAP_BYTES);

    for size in [1, 15, 16, 17, 48, 100, 1024, 4000] {
        let block = heap.allocate(size).unwrap();

        assert_eq!(addr_of(block) % LEAF_SIZE, 0);
        assert!(block.len() >= size.max(LEAF_SIZE));
        assert!((block.len() / LEAF_SIZE).is_power_of_two());
        assert_eq!(block.len() % LEAF_SIZE, 0);

        unsafe { heap.deallocate(block.cast()) };
    }
}

#[test]
fn oversized_request_fails_without_side_effects() {
    let mut heap = new_heap(HEAP_BYTES);

    let heap_size = heap.heap_size();
    heap.allocate(heap_size * 2).unwrap_err();
    heap.allocate(usize::MAX).unwrap_err();

    // The failures must not have disturbed the heap.
    let block = heap.allocate(1024).unwrap();
    unsafe { heap.deallocate(block.cast()) };
}

#[test]
fn drained_heap_fails_and_recovers() {
    let mut heap = new_heap(HEAP_BYTES);

    let leaves = drain_leaves(&mut heap);
    assert!(!leaves.is_empty());
    heap.allocate(LEAF_SIZE).unwrap_err();

    for leaf in &leaves {
        unsafe { heap.deallocate(leaf.cast()) };
    }
    heap.allocate(LEAF_SIZE).unwrap();
}

#[test]
fn leaves_are_disjoint_and_in_bounds() {
    let mut heap = new_heap(50_000);

    let region = heap.region();
    let start = region.as_ptr() as *mut u8 as usize;
    let end = start + region.len();

    let leaves = drain_leaves(&mut heap);
    let addrs: HashSet<usize> = leaves.iter().map(|leaf| addr_of(*leaf)).collect();

    // Distinct, leaf-aligned, and inside the real region.
    assert_eq!(addrs.len(), leaves.len());
    for &addr in &addrs {
        assert_eq!(addr % LEAF_SIZE, 0);
        assert!(addr >= start && addr + LEAF_SIZE <= end);
    }
}

#[test]
fn split_ladder() {
    let mut heap = new_heap(HEAP_BYTES);
    let window = open_window(&mut heap, 1024);

    // Splitting the window block for a leaf keeps the left half of every
    // cut and frees the right halves at descending sizes.
    let a = heap.allocate(LEAF_SIZE).unwrap();
    assert_eq!(addr_of(a), window);
    assert_eq!(a.len(), LEAF_SIZE);

    // The leaf buddy shed by the final cut is the next allocation (LIFO).
    let b = heap.allocate(LEAF_SIZE).unwrap();
    assert_eq!(addr_of(b), window + 16);

    // Leaf lists are now empty; the next leaf comes from splitting the
    // 32-byte buddy.
    let c = heap.allocate(LEAF_SIZE).unwrap();
    assert_eq!(addr_of(c), window + 32);
    let d = heap.allocate(LEAF_SIZE).unwrap();
    assert_eq!(addr_of(d), window + 48);

    // The 64-byte buddy of the first cut is still intact.
    let e = heap.allocate(64).unwrap();
    assert_eq!(addr_of(e), window + 64);
    assert_eq!(e.len(), 64);

    // Free everything; the window must coalesce back into a single block.
    for block in [e, d, c, b, a] {
        unsafe { heap.deallocate(block.cast()) };
    }
    let whole = heap.allocate(1024).unwrap();
    assert_eq!(addr_of(whole), window);
    assert_eq!(whole.len(), 1024);
}

#[test]
fn mid_size_split_keeps_left_half() {
    let mut heap = new_heap(HEAP_BYTES);
    let window = open_window(&mut heap, 1024);

    // 48 bytes rounds up to a 64-byte block carved from the window base.
    let a = heap.allocate(48).unwrap();
    assert_eq!(addr_of(a), window);
    assert_eq!(a.len(), 64);

    // Its buddy is on the 64-byte free list.
    let b = heap.allocate(64).unwrap();
    assert_eq!(addr_of(b), window + 64);

    unsafe {
        heap.deallocate(a.cast());
        heap.deallocate(b.cast());
    }
    let whole = heap.allocate(1024).unwrap();
    assert_eq!(addr_of(whole), window);
}

#[test]
fn free_is_lifo_deterministic() {
    let mut heap = new_heap(HEAP_BYTES);
    let window = open_window(&mut heap, 1024);

    let a = heap.allocate(LEAF_SIZE).unwrap();
    assert_eq!(addr_of(a), window);
    unsafe { heap.deallocate(a.cast()) };

    // The freed leaf coalesced all the way back up, so the same address
    // comes back out.
    let b = heap.allocate(LEAF_SIZE).unwrap();
    assert_eq!(addr_of(b), window);
}

#[test]
fn coalesce_any_free_order() {
    for (label, reverse, seed) in [("insertion", false, None), ("reverse", true, None)]
        .into_iter()
        .chain([("shuffled", false, Some(0x5eed)), ("shuffled2", false, Some(17))])
    {
        let mut heap = new_heap(HEAP_BYTES);
        let window = open_window(&mut heap, 1024);

        let mut leaves = Vec::new();
        for i in 0..1024 / LEAF_SIZE {
            let leaf = heap.allocate(LEAF_SIZE).unwrap();
            assert_eq!(addr_of(leaf), window + i * LEAF_SIZE, "order: {label}");
            leaves.push(leaf);
        }

        if reverse {
            leaves.reverse();
        }
        if let Some(seed) = seed {
            shuffle(&mut leaves, seed);
        }

        for leaf in leaves {
            unsafe { heap.deallocate(leaf.cast()) };
        }

        // Full coalescence: the window is whole again.
        let whole = heap.allocate(1024).unwrap();
        assert_eq!(addr_of(whole), window, "order: {label}");
    }
}

#[test]
fn mixed_sizes_round_trip() {
    let mut heap = new_heap(HEAP_BYTES);
    let window = open_window(&mut heap, 4096);

    let mut blocks = Vec::new();
    for size in [16, 32, 500, 64, 16, 1024, 48, 128] {
        blocks.push(heap.allocate(size).unwrap());
    }
    shuffle(&mut blocks, 99);
    for block in blocks {
        unsafe { heap.deallocate(block.cast()) };
    }

    let whole = heap.allocate(4096).unwrap();
    assert_eq!(addr_of(whole), window);
}

#[test]
fn mass_is_conserved_across_churn() {
    // An odd-sized region exercises the reserved suffix as well.
    for size in [HEAP_BYTES, 50_000] {
        let mut heap = new_heap(size);

        let first = drain_leaves(&mut heap);
        let first_addrs: HashSet<usize> = first.iter().map(|leaf| addr_of(*leaf)).collect();

        let mut leaves = first;
        shuffle(&mut leaves, 7);
        for leaf in &leaves {
            unsafe { heap.deallocate(leaf.cast()) };
        }

        // Every byte that was free before is free again, and nothing more.
        let second = drain_leaves(&mut heap);
        let second_addrs: HashSet<usize> = second.iter().map(|leaf| addr_of(*leaf)).collect();
        assert_eq!(first_addrs, second_addrs);

        for leaf in &second {
            unsafe { heap.deallocate(leaf.cast()) };
        }
    }
}

#[test]
fn exact_power_of_two_region() {
    // With no unavailable suffix the right half of the heap is freed
    // whole; it must still be allocatable.
    let mut heap = new_heap(HEAP_BYTES);
    let half = heap.heap_size() / 2;

    let block = heap.allocate(half).unwrap();
    assert_eq!(block.len(), half);
    unsafe { heap.deallocate(block.cast()) };

    let again = heap.allocate(half).unwrap();
    assert_eq!(addr_of(again), addr_of(block));
}

#[test]
fn debug_reports_free_lists() {
    let mut heap = new_heap(HEAP_BYTES);
    let rendered = std::format!("{heap:?}");
    assert!(rendered.contains("free_blocks"));

    let block = heap.allocate(LEAF_SIZE).unwrap();
    let rendered = std::format!("{heap:?}");
    assert!(rendered.contains("free_blocks"));
    unsafe { heap.deallocate(block.cast()) };
}

enum HeapOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum HeapOp {
    /// Allocate a block of `size` bytes.
    Allocate { size: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at
    /// index `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 12;

impl Arbitrary for HeapOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g.choose(&[HeapOpTag::Allocate, HeapOpTag::Free]).unwrap() {
            HeapOpTag::Allocate => HeapOp::Allocate {
                size: {
                    // Try to distribute allocations evenly between powers of two.
                    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
                    usize::arbitrary(g) % 2_usize.pow(exp.into())
                },
            },
            HeapOpTag::Free => HeapOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

struct Allocation {
    id: u8,
    block: NonNull<[u8]>,
}

unsafe fn paint(block: NonNull<[u8]>, id: u8) {
    let slice = unsafe { core::slice::from_raw_parts_mut(block.as_ptr() as *mut u8, block.len()) };
    slice.fill(id);
}

unsafe fn verify(block: NonNull<[u8]>, id: u8) -> bool {
    let slice = unsafe { core::slice::from_raw_parts(block.as_ptr() as *const u8, block.len()) };
    slice.iter().all(|&byte| byte == id)
}

#[test]
fn allocations_are_mutually_exclusive() {
    fn prop(ops: Vec<HeapOp>) -> bool {
        let mut heap = new_heap(HEAP_BYTES);
        let mut outstanding: Vec<Allocation> = Vec::with_capacity(ops.len());

        for (id, op) in ops.into_iter().enumerate() {
            let id = id as u8;
            match op {
                HeapOp::Allocate { size } => {
                    let block = match heap.allocate(size) {
                        Ok(block) => block,
                        Err(AllocError) => continue,
                    };

                    unsafe { paint(block, id) };
                    outstanding.push(Allocation { id, block });
                }

                HeapOp::Free { index } => {
                    if outstanding.is_empty() {
                        continue;
                    }

                    let index = index % outstanding.len();
                    let a = outstanding.swap_remove(index);

                    // If any other allocation overlapped this block, the
                    // paint was clobbered.
                    if unsafe { !verify(a.block, a.id) } {
                        return false;
                    }

                    unsafe { heap.deallocate(a.block.cast()) };
                }
            }
        }

        // Freeing the remainder must not trip any internal consistency
        // check either.
        for a in outstanding {
            if unsafe { !verify(a.block, a.id) } {
                return false;
            }
            unsafe { heap.deallocate(a.block.cast()) };
        }

        true
    }

    let mut qc = QuickCheck::new();
    qc.quickcheck(prop as fn(_) -> bool);
}

#[cfg(feature = "spin")]
mod locked {
    use super::*;
    use crate::LockedBuddy;

    #[test]
    fn init_once_then_allocate() {
        let mut region = Box::new([0u8; 8192]);

        let heap = LockedBuddy::empty();
        heap.allocate(16).unwrap_err();

        unsafe {
            heap.init(NonNull::new(region.as_mut_ptr()).unwrap(), region.len())
                .unwrap();
        }

        let block = heap.allocate(100).unwrap();
        assert!(block.len() >= 100);
        unsafe { heap.deallocate(block.cast()) };
    }
}
