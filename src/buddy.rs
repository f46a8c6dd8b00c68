//! The buddy allocator.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case  |
//! |--------------------------|-----------|-------------|
//! | Allocate                 | O(1)      | O(levels)   |
//! | Deallocate               | O(1)      | O(levels)   |
//!
//! #### Fragmentation
//!
//! Internal fragmentation is at most 50%, as every allocation is served by
//! a power-of-two sized block. External fragmentation is bounded by eager
//! coalescing: whenever a block and its buddy are both free, they are
//! merged into their parent immediately.
//!
//! ## Layout of the managed region
//!
//! The allocator is handed one contiguous region and computes the smallest
//! power-of-two *virtual heap* covering it. The front of the region is
//! reserved for the allocator's own bookkeeping: a table with one record
//! per block size, a buddy-pair bit map per size, and a split bit map per
//! size that can split. The tail of the virtual heap past the end of the
//! real region is likewise reserved. Reserved blocks are never handed out.

use core::{
    alloc::Layout,
    fmt, mem,
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use log::{debug, error};

use crate::{
    bitmap::Bitmap, list::FreeList, polyfill::*, AllocError, AllocInitError, BackingAllocator,
    BasePtr, Raw, LEAF_SIZE,
};

/// Bookkeeping for a single block size.
///
/// Each bit of `buddies` covers a pair of adjacent blocks and holds the
/// XOR of their allocated states, so marking either block allocated or
/// free is a toggle, and after toggling for a freed block the bit reads
/// as "is the buddy still allocated". Bit `i` of `splits` records whether
/// block `i` has been cut into two blocks of the next smaller size;
/// leaf-sized blocks cannot split.
#[repr(C)]
struct Level {
    block_size: usize,
    free: FreeList,
    buddies: Bitmap,
    splits: Option<Bitmap>,
}

/// Which end of the virtual heap a reservation grows from.
#[derive(Copy, Clone)]
enum Side {
    Prefix,
    Suffix,
}

/// A binary-buddy allocator over a caller-provided region.
///
/// All bookkeeping lives inside the managed region; the allocator itself
/// is a handful of words. Blocks handed out are aligned to [`LEAF_SIZE`]
/// and sized a power-of-two multiple of it.
pub struct Buddy<A: BackingAllocator> {
    raw: RawBuddy,
    region: NonNull<u8>,
    region_layout: Layout,
    backing_allocator: A,
}

impl Buddy<Raw> {
    /// Constructs a new `Buddy` managing the `size` bytes at `region`.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is too small to hold the allocator's
    /// metadata plus at least one free block, or if the virtual heap would
    /// not fit at the region's address.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `size` bytes, and
    /// must not be accessed except through the allocator for the
    /// allocator's lifetime.
    pub unsafe fn new_raw(region: NonNull<u8>, size: usize) -> Result<Buddy<Raw>, AllocInitError> {
        let layout =
            Layout::from_size_align(size, 1).map_err(|_| AllocInitError::InvalidConfig)?;

        unsafe { RawBuddy::try_new(region, layout) }
            .map(|raw| raw.with_backing_allocator(region, layout, Raw))
    }

    /// Decomposes the allocator into its region pointer and size.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is
    /// called; the returned pointer becomes the sole owner of the region
    /// that was used to construct the allocator.
    pub unsafe fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        let this = mem::ManuallyDrop::new(self);

        (this.region, this.region_layout.size())
    }
}

#[cfg(any(feature = "alloc", test))]
impl Buddy<crate::Global> {
    /// Attempts to construct a new `Buddy` backed by the global allocator.
    ///
    /// The managed region of `size` bytes is obtained from the global
    /// allocator and released on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if the global allocation fails or if `size` cannot
    /// accommodate the allocator's metadata plus at least one free block.
    pub fn try_new(size: usize) -> Result<Buddy<crate::Global>, AllocInitError> {
        let layout = Layout::from_size_align(size, LEAF_SIZE)
            .map_err(|_| AllocInitError::InvalidConfig)?;
        if size == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        unsafe {
            let raw_region = alloc::alloc::alloc(layout);
            let region = NonNull::new(raw_region).ok_or(AllocInitError::AllocFailed(layout))?;

            match RawBuddy::try_new(region, layout) {
                Ok(raw) => Ok(raw.with_backing_allocator(region, layout, crate::Global)),
                Err(e) => {
                    alloc::alloc::dealloc(region.as_ptr(), layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator> Buddy<A> {
    /// Allocates a block of at least `size` bytes.
    ///
    /// The returned slice covers the whole block, whose length is `size`
    /// rounded up to the next power-of-two multiple of [`LEAF_SIZE`]. The
    /// block is aligned to [`LEAF_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero or if no free block is large
    /// enough. Zero-size requests are rejected rather than rounded up to a
    /// leaf. Failure leaves the heap unchanged.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.raw.allocate(size)
    }

    /// Returns a block to the allocator.
    ///
    /// The block's size is recovered from the split bit maps; merging with
    /// free buddies proceeds as far up as possible.
    ///
    /// # Safety
    ///
    /// `block` must denote a block of memory currently allocated by this
    /// allocator.
    pub unsafe fn deallocate(&mut self, block: NonNull<u8>) {
        unsafe { self.raw.deallocate(block) }
    }

    /// Returns the size in bytes of the virtual heap.
    ///
    /// This is the size of the real region rounded up to the next power of
    /// two; the tail past the real region is permanently reserved.
    pub fn heap_size(&self) -> usize {
        self.raw.heap_size()
    }

    /// Returns a pointer to the managed region.
    ///
    /// It is undefined behavior to dereference the returned pointer or
    /// upgrade it to a reference if there are any outstanding allocations.
    pub fn region(&mut self) -> NonNull<[u8]> {
        NonNull::new(ptr::slice_from_raw_parts_mut(
            self.region.as_ptr(),
            self.region_layout.size(),
        ))
        .unwrap()
    }
}

// The allocator has exclusive ownership of its region and metadata; the
// raw pointers inside are not shared with anything else.
unsafe impl<A: BackingAllocator + Send> Send for Buddy<A> {}

impl<A: BackingAllocator> Drop for Buddy<A> {
    fn drop(&mut self) {
        unsafe {
            self.backing_allocator
                .deallocate(self.region, self.region_layout)
        };
    }
}

impl<A: BackingAllocator> fmt::Debug for Buddy<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buddy")
            .field("base", &self.raw.base)
            .field("heap_size", &self.raw.heap_size())
            .field("free_blocks", &FreeCounts(&self.raw))
            .finish()
    }
}

/// Renders the per-size free-list populations as a `block size -> count`
/// map.
struct FreeCounts<'a>(&'a RawBuddy);

impl fmt::Debug for FreeCounts<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for level in 0..self.0.nsizes {
            let level = self.0.level(level);
            map.entry(&level.block_size, &unsafe {
                level.free.count(self.0.base)
            });
        }
        map.finish()
    }
}

/// The allocator state proper: the base of the virtual heap and the level
/// table carved from the front of the managed region.
///
/// Separate from [`Buddy`] so that construction can finish before a
/// backing allocator is attached.
struct RawBuddy {
    base: BasePtr,
    levels: NonNull<Level>,
    nsizes: usize,
}

impl RawBuddy {
    fn with_backing_allocator<A: BackingAllocator>(
        self,
        region: NonNull<u8>,
        region_layout: Layout,
        backing_allocator: A,
    ) -> Buddy<A> {
        Buddy {
            raw: self,
            region,
            region_layout,
            backing_allocator,
        }
    }

    /// Lays the allocator out inside `region` and reserves everything that
    /// must never be handed out.
    ///
    /// # Panics
    ///
    /// Panics if the bytes placed on free lists during reservation do not
    /// reconcile with the arithmetic expectation. Such a mismatch means
    /// the metadata sizing is wrong and the heap cannot be trusted.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `layout.size()`
    /// bytes.
    unsafe fn try_new(region: NonNull<u8>, layout: Layout) -> Result<RawBuddy, AllocInitError> {
        let start = region.addr().get();
        let end = start
            .checked_add(layout.size())
            .ok_or(AllocInitError::InvalidLocation)?;

        // Round the base up to leaf alignment.
        let base_addr = start
            .checked_add(LEAF_SIZE - 1)
            .ok_or(AllocInitError::InvalidLocation)?
            & !(LEAF_SIZE - 1);
        if end <= base_addr || end - base_addr < LEAF_SIZE {
            return Err(AllocInitError::InvalidConfig);
        }
        let managed = end - base_addr;

        // The number of block sizes needed to cover the managed span,
        // rounding the virtual heap up to the next power of two.
        let mut nsizes = (managed / LEAF_SIZE).log2() as usize + 1;
        if managed > LEAF_SIZE << (nsizes - 1) {
            nsizes += 1;
        }
        let heap_size = LEAF_SIZE
            .checked_shl((nsizes - 1) as u32)
            .ok_or(AllocInitError::InvalidLocation)?;
        base_addr
            .checked_add(heap_size)
            .ok_or(AllocInitError::InvalidLocation)?;

        let base = BasePtr::new(
            region.with_addr(NonZeroUsize::new(base_addr).unwrap()),
            heap_size,
        );
        let max_level = nsizes - 1;
        let num_blocks = |level: usize| 1usize << (max_level - level);

        // Carve the metadata out of the front of the region: the level
        // table first, then every buddy-pair map, then the split maps.
        let levels = base.ptr().cast::<Level>();
        let mut curs = base_addr + nsizes * mem::size_of::<Level>();
        if curs > end {
            return Err(AllocInitError::InvalidConfig);
        }

        for level in 0..nsizes {
            let pairs = (num_blocks(level) + 1) / 2;
            let bytes = Bitmap::map_layout(pairs).size();
            if curs + bytes > end {
                return Err(AllocInitError::InvalidConfig);
            }

            let map = base.with_addr(NonZeroUsize::new(curs).unwrap()).as_ptr();
            let buddies = unsafe { Bitmap::new(pairs, map) };
            unsafe {
                levels.as_ptr().add(level).write(Level {
                    block_size: LEAF_SIZE << level,
                    free: FreeList::new(),
                    buddies,
                    splits: None,
                });
            }
            curs += bytes;
        }

        for level in 1..nsizes {
            let bits = num_blocks(level);
            let bytes = Bitmap::map_layout(bits).size();
            if curs + bytes > end {
                return Err(AllocInitError::InvalidConfig);
            }

            let map = base.with_addr(NonZeroUsize::new(curs).unwrap()).as_ptr();
            let splits = unsafe { Bitmap::new(bits, map) };
            unsafe {
                (*levels.as_ptr().add(level)).splits = Some(splits);
            }
            curs += bytes;
        }

        let meta_end = (curs + LEAF_SIZE - 1) & !(LEAF_SIZE - 1);
        let meta_bytes = meta_end - base_addr;

        // The suffix of the virtual heap past the real region, grown to
        // leaf granularity.
        let unavail = (heap_size - managed + LEAF_SIZE - 1) & !(LEAF_SIZE - 1);
        let avail_end = base_addr + heap_size - unavail;
        if meta_end >= avail_end {
            return Err(AllocInitError::InvalidConfig);
        }
        // With a reserved suffix, the metadata must stay within the lower
        // half of the heap; past it, the two reservations' shed blocks
        // would overlap.
        if unavail != 0 && meta_bytes > heap_size / 2 {
            return Err(AllocInitError::InvalidConfig);
        }

        debug!(
            "buddy: managing {} bytes in {} sizes; {} metadata bytes, {} bytes unavailable",
            managed, nsizes, meta_bytes, unavail
        );

        let mut this = RawBuddy {
            base,
            levels,
            nsizes,
        };

        // Reserve the metadata prefix and the virtual suffix. Every free
        // byte enters a free list through one of these two calls.
        let freed_prefix = unsafe { this.mark(0, meta_bytes, Side::Prefix, unavail == 0) };
        let freed_suffix =
            unsafe { this.mark(heap_size - unavail, heap_size, Side::Suffix, false) };

        let freed = freed_prefix + freed_suffix;
        let expected = heap_size - meta_bytes - unavail;
        if freed != expected {
            error!(
                "buddy: {} bytes on free lists after reservation, expected {}",
                freed, expected
            );
            panic!("buddy heap accounting mismatch: {freed} free, {expected} expected");
        }

        Ok(this)
    }

    #[inline]
    fn max_level(&self) -> usize {
        self.nsizes - 1
    }

    #[inline]
    fn heap_size(&self) -> usize {
        self.level(self.max_level()).block_size
    }

    #[inline]
    fn level(&self, level: usize) -> &Level {
        debug_assert!(level < self.nsizes);

        unsafe { &*self.levels.as_ptr().add(level) }
    }

    #[inline]
    fn level_mut(&mut self, level: usize) -> &mut Level {
        debug_assert!(level < self.nsizes);

        unsafe { &mut *self.levels.as_ptr().add(level) }
    }

    /// Address of the block `ofs` bytes into the virtual heap.
    #[inline]
    fn addr_at(&self, ofs: usize) -> NonZeroUsize {
        NonZeroUsize::new(self.base.addr().get() + ofs).unwrap()
    }

    /// Index of the block containing `addr` at `level`.
    #[inline]
    fn index_of(&self, level: usize, addr: NonZeroUsize) -> usize {
        self.base.offset_to(addr) / self.level(level).block_size
    }

    /// Smallest level whose blocks hold at least `size` bytes, if any.
    fn level_for(&self, size: usize) -> Option<usize> {
        if size > self.heap_size() {
            return None;
        }

        let size = size.max(LEAF_SIZE).next_power_of_two();
        Some((size / LEAF_SIZE).log2() as usize)
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 {
            return Err(AllocError);
        }

        let target = self.level_for(size).ok_or(AllocError)?;

        // Smallest-fit: take the first size at or above the target with a
        // free block.
        let found = (target..self.nsizes)
            .find(|&level| !self.level(level).free.is_empty())
            .ok_or(AllocError)?;

        let base = self.base;
        let block = unsafe { self.level_mut(found).free.pop(base) }
            .expect("free list emptied during scan");
        let pair = self.index_of(found, block) / 2;
        self.level_mut(found).buddies.toggle(pair);

        // Walk back down, keeping the left half of every cut and handing
        // the right half to the next smaller size's free list.
        for level in (target + 1..=found).rev() {
            let index = self.index_of(level, block);
            self.level_mut(level).splits.as_mut().unwrap().set(index);

            let pair = self.index_of(level - 1, block) / 2;
            self.level_mut(level - 1).buddies.toggle(pair);

            let half_size = self.level(level - 1).block_size;
            let half = NonZeroUsize::new(block.get() + half_size).unwrap();
            unsafe { self.level_mut(level - 1).free.push(base, half) };
        }

        Ok(base.with_addr_and_size(block, self.level(target).block_size))
    }

    unsafe fn deallocate(&mut self, block: NonNull<u8>) {
        // Immediately drop and shadow the incoming pointer by converting it
        // to an address; every later access goes through the base pointer.
        let mut addr = block.addr();
        debug_assert!(
            self.base.contains_addr(addr),
            "block outside the managed region"
        );
        debug_assert_eq!(addr.get() % LEAF_SIZE, 0, "misaligned block");

        let base = self.base;
        let mut level = self.allocated_level(addr);
        debug_assert_eq!(
            self.base.offset_to(addr) % self.level(level).block_size,
            0,
            "block address inconsistent with its recovered size"
        );

        while level < self.max_level() {
            let index = self.index_of(level, addr);
            let pair = index / 2;

            self.level_mut(level).buddies.toggle(pair);
            if self.level(level).buddies.get(pair) {
                // The buddy is still allocated (or split, or reserved).
                break;
            }

            let buddy_index = index ^ 1;
            let buddy = self.addr_at(buddy_index * self.level(level).block_size);
            unsafe { self.level_mut(level).free.remove(base, buddy) };
            if buddy_index % 2 == 0 {
                // The merged block keeps the lower address.
                addr = buddy;
            }

            let parent = self.index_of(level + 1, addr);
            self.level_mut(level + 1)
                .splits
                .as_mut()
                .unwrap()
                .clear(parent);
            level += 1;
        }

        unsafe { self.level_mut(level).free.push(base, addr) };
    }

    /// Recovers the level a live block was allocated at.
    ///
    /// The block an allocation cut out is the only one at its address
    /// whose parent-level split bit is set; a block with no split parent
    /// is leaf-sized.
    fn allocated_level(&self, addr: NonZeroUsize) -> usize {
        for level in 0..self.max_level() {
            let parent = self.index_of(level + 1, addr);
            if self.level(level + 1).splits.as_ref().unwrap().get(parent) {
                return level;
            }
        }

        0
    }

    /// Marks the virtual-heap byte range `[start, stop)` as reserved.
    ///
    /// Free blocks adjacent to the reservation whose buddy lies inside it
    /// can never coalesce; they are pushed straight onto the free lists,
    /// and the total bytes pushed is returned. Near the top of the heap
    /// such a push would fabricate a block overlapping the reservation at
    /// the opposite end, so the top two sizes keep their fragments at
    /// smaller sizes instead; `shed_top` relaxes this by one size and is
    /// passed only when the opposite end carries no reservation.
    ///
    /// # Safety
    ///
    /// The level table and bit maps must be initialized, and `[start,
    /// stop)` must not cover any byte already placed on a free list.
    unsafe fn mark(&mut self, start: usize, stop: usize, side: Side, shed_top: bool) -> usize {
        assert_eq!(start % LEAF_SIZE, 0, "unaligned reservation");
        assert_eq!(stop % LEAF_SIZE, 0, "unaligned reservation");

        let base = self.base;
        let max_level = self.max_level();
        let mut freed = 0;

        for level in 0..self.nsizes {
            let block_size = self.level(level).block_size;
            // First block index inside the reservation, and the first index
            // past it.
            let bi = start / block_size;
            let bj = (stop + block_size - 1) / block_size;

            let can_shed = level + 1 < max_level || (shed_top && level + 1 == max_level);
            match side {
                Side::Prefix if bj % 2 == 1 => {
                    if can_shed {
                        let block = self.addr_at(bj * block_size);
                        unsafe { self.level_mut(level).free.push(base, block) };
                        freed += block_size;
                    } else {
                        // Neither half of this pair survives whole; cancel
                        // the interior toggle below so the bit stays even.
                        self.level_mut(level).buddies.set(bj / 2);
                    }
                }
                Side::Suffix if bi % 2 == 1 => {
                    if can_shed {
                        let block = self.addr_at((bi - 1) * block_size);
                        unsafe { self.level_mut(level).free.push(base, block) };
                        freed += block_size;
                    } else {
                        self.level_mut(level).buddies.set(bi / 2);
                    }
                }
                _ => {}
            }

            for index in bi..bj {
                if level > 0 {
                    self.level_mut(level).splits.as_mut().unwrap().set(index);
                }
                self.level_mut(level).buddies.toggle(index / 2);
            }
        }

        freed
    }
}
