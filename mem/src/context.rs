use core::ptr;

use crate::{BlockAllocator, RelPtr};

pub const MEMORY_CONTEXT_NAME_LEN: usize = 64;

/// Named sub-allocator for leak attribution.
///
/// A context is a thin wrapper over a [`BlockAllocator`] that tracks
/// cumulative allocated and freed byte counts. Modules carry their own
/// context so that `balloc_size - bfree_size` pins outstanding memory on
/// the owner; after a correct teardown the difference is zero.
#[repr(C)]
pub struct MemoryContext {
    name: [u8; MEMORY_CONTEXT_NAME_LEN],
    allocator: RelPtr<BlockAllocator>,
    pub balloc_size: u64,
    pub bfree_size: u64,
}

impl MemoryContext {
    /// Initialize in place over `allocator`. Longer names are truncated.
    pub fn init(&mut self, name: &str, allocator: *mut BlockAllocator) {
        self.name = [0; MEMORY_CONTEXT_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(MEMORY_CONTEXT_NAME_LEN - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.allocator = RelPtr::null();
        self.allocator.store(allocator);
        self.balloc_size = 0;
        self.bfree_size = 0;
    }

    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Allocate `size` bytes; NULL on exhaustion. Accounts the requested
    /// size, not the rounded class size, so conservation checks line up
    /// with what callers pass to [`MemoryContext::bfree`].
    pub fn balloc(&mut self, size: usize) -> *mut u8 {
        let allocator = self.allocator.load();
        if allocator.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: `init` stored a valid allocator; contexts are
        // single-writer so no one else mutates it concurrently.
        let block = unsafe { (*allocator).balloc(size) };
        if !block.is_null() {
            self.balloc_size += size as u64;
        }
        block
    }

    /// Allocate and zero `size` bytes.
    pub fn balloc_zeroed(&mut self, size: usize) -> *mut u8 {
        let block = self.balloc(size);
        if !block.is_null() {
            // SAFETY: `block` spans at least `size` writable bytes.
            unsafe { ptr::write_bytes(block, 0, size) };
        }
        block
    }

    /// Return a block.
    ///
    /// # Safety
    ///
    /// Same contract as [`BlockAllocator::bfree`]: `ptr`/`size` must match
    /// a prior `balloc` on this context.
    pub unsafe fn bfree(&mut self, ptr: *mut u8, size: usize) {
        let allocator = self.allocator.load();
        debug_assert!(!allocator.is_null());
        unsafe { (*allocator).bfree(ptr, size) };
        self.bfree_size += size as u64;
    }

    /// Bytes currently outstanding on this context.
    pub fn outstanding(&self) -> u64 {
        self.balloc_size - self.bfree_size
    }
}
