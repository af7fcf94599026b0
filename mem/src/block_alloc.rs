use core::ptr;

use crate::RelPtr;
use crate::align_up;

/// Smallest block the allocator hands out; also the allocation alignment.
pub const BLOCK_MIN_SIZE: usize = 8;

/// Number of size classes: class `k` holds blocks of `8 << k` bytes,
/// topping out at 1 GiB.
const CLASS_COUNT: usize = 28;

#[repr(C)]
struct ArenaHdr {
    next: RelPtr<ArenaHdr>,
    /// Usable bytes following this header.
    size: u64,
    /// Bump offset into the usable area.
    used: u64,
}

#[repr(C)]
struct FreeBlock {
    next: RelPtr<FreeBlock>,
}

/// Size-classed block allocator over caller-donated arenas.
///
/// The allocator itself, its arena headers and its free-list links are all
/// expressed as relative pointers, so the whole thing can live inside the
/// shared region and survive remapping. It is single-writer by
/// construction: every agent owns its own allocator, and the dataplane
/// instance owns the bootstrap one.
///
/// Blocks are never coalesced; a freed block parks on the free list of its
/// size class and is reused verbatim. Larger free blocks are split in
/// halves down to the requested class when the exact class runs dry.
#[repr(C)]
pub struct BlockAllocator {
    arenas: RelPtr<ArenaHdr>,
    free_lists: [RelPtr<FreeBlock>; CLASS_COUNT],
}

#[inline]
fn class_of(size: usize) -> usize {
    let size = size.max(BLOCK_MIN_SIZE).next_power_of_two();
    size.trailing_zeros() as usize - 3
}

#[inline]
const fn class_size(class: usize) -> usize {
    BLOCK_MIN_SIZE << class
}

impl BlockAllocator {
    /// Initialize in place. The memory behind `self` may be garbage
    /// (freshly mapped region), so every field is written.
    pub fn init(&mut self) {
        self.arenas = RelPtr::null();
        for list in &mut self.free_lists {
            *list = RelPtr::null();
        }
    }

    /// Donate a contiguous byte range to the allocator.
    ///
    /// # Safety
    ///
    /// `buf..buf+len` must be valid for reads and writes for the lifetime
    /// of the allocator, exclusively owned by it, and must live in the
    /// same mapping as the allocator itself (offsets between the two must
    /// stay stable across remaps).
    pub unsafe fn put_arena(&mut self, buf: *mut u8, len: usize) {
        let aligned = align_up(buf as usize, BLOCK_MIN_SIZE);
        let waste = aligned - buf as usize;
        if len < waste + size_of::<ArenaHdr>() + BLOCK_MIN_SIZE {
            return;
        }
        let hdr = aligned as *mut ArenaHdr;
        unsafe {
            (*hdr).next = RelPtr::null();
            (*hdr).next.equate(&self.arenas);
            (*hdr).size = (len - waste - size_of::<ArenaHdr>()) as u64;
            (*hdr).used = 0;
            log::debug!("allocator arena donated: {} usable bytes", (*hdr).size);
            self.arenas.store(hdr);
        }
    }

    /// Allocate a block of at least `size` bytes, 8-byte aligned.
    /// Returns NULL when no arena can satisfy the rounded-up class size.
    pub fn balloc(&mut self, size: usize) -> *mut u8 {
        if class_of(size) >= CLASS_COUNT {
            return ptr::null_mut();
        }
        let class = class_of(size);

        if let Some(block) = self.pop_free(class) {
            return block;
        }
        if let Some(block) = self.bump(class_size(class)) {
            return block;
        }
        // Split the smallest larger free block down to the wanted class.
        for upper in class + 1..CLASS_COUNT {
            if let Some(block) = self.pop_free(upper) {
                let mut current = upper;
                while current > class {
                    current -= 1;
                    let half = class_size(current);
                    // SAFETY: `block` spans `class_size(upper)` bytes, so
                    // `block + half` stays inside it.
                    unsafe { self.push_free(block.add(half), current) };
                }
                return block;
            }
        }
        log::debug!("allocator exhausted for {size}-byte request");
        ptr::null_mut()
    }

    /// Return a block to its size-class free list.
    ///
    /// # Safety
    ///
    /// `ptr` must come from a `balloc` on this allocator and `size` must
    /// equal the size passed to that `balloc`. The free path trusts the
    /// caller; a double free corrupts the free list.
    pub unsafe fn bfree(&mut self, ptr: *mut u8, size: usize) {
        let class = class_of(size);
        unsafe { self.push_free(ptr, class) };
    }

    fn pop_free(&mut self, class: usize) -> Option<*mut u8> {
        let head = self.free_lists[class].load();
        if head.is_null() {
            return None;
        }
        // SAFETY: non-null free-list entries were written by `push_free`
        // and stay exclusively owned by the allocator until popped.
        unsafe {
            let next = (*head).next.load();
            self.free_lists[class].store(next);
        }
        Some(head as *mut u8)
    }

    unsafe fn push_free(&mut self, ptr: *mut u8, class: usize) {
        let block = ptr as *mut FreeBlock;
        unsafe {
            (*block).next = RelPtr::null();
            (*block).next.equate(&self.free_lists[class]);
            self.free_lists[class].store(block);
        }
    }

    fn bump(&mut self, block_size: usize) -> Option<*mut u8> {
        let mut arena = self.arenas.load();
        while !arena.is_null() {
            // SAFETY: arena headers are installed by `put_arena` and the
            // bump offset never exceeds `size`.
            unsafe {
                let free = ((*arena).size - (*arena).used) as usize;
                if free >= block_size {
                    let base = (arena as *mut u8).add(size_of::<ArenaHdr>());
                    let block = base.add((*arena).used as usize);
                    (*arena).used += block_size as u64;
                    return Some(block);
                }
                arena = (*arena).next.load();
            }
        }
        None
    }
}
