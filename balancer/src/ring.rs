use slipstream_mem::{MemError, MemResult, MemoryContext, RelPtr};

pub const RING_VALUE_INVALID: u32 = u32::MAX;

/// Weighted multiset of real indices.
///
/// Real `i` of weight `w` appears `w` times; disabled reals contribute
/// nothing. `get(rnd)` indexes with `rnd % len`, so a uniformly
/// distributed `rnd` stream selects reals proportionally to weight.
/// Weight changes rebuild the array wholesale.
#[repr(C)]
pub struct Ring {
    mctx: RelPtr<MemoryContext>,
    len: u64,
    ids: RelPtr<u32>,
}

impl Ring {
    /// Build from `(real_index, effective_weight)` pairs; entries with
    /// zero weight are skipped.
    pub fn init(&mut self, mctx: *mut MemoryContext, weighted: &[(u32, u16)]) -> MemResult {
        self.mctx = RelPtr::null();
        self.mctx.store(mctx);
        self.ids = RelPtr::null();

        let len: usize = weighted.iter().map(|&(_, w)| w as usize).sum();
        self.len = len as u64;
        if len == 0 {
            return Ok(());
        }
        // SAFETY: live single-writer context.
        let ids = unsafe { (*mctx).balloc(len * size_of::<u32>()) } as *mut u32;
        if ids.is_null() {
            return Err(MemError::OutOfMemory);
        }
        let mut cursor = 0usize;
        for &(id, weight) in weighted {
            for _ in 0..weight {
                // SAFETY: cursor < len by construction.
                unsafe { *ids.add(cursor) = id };
                cursor += 1;
            }
        }
        self.ids.store(ids);
        Ok(())
    }

    pub fn free(&mut self) {
        let mctx = self.mctx.load();
        let ids = self.ids.load();
        if mctx.is_null() || ids.is_null() {
            return;
        }
        // SAFETY: allocation made in `init`.
        unsafe { (*mctx).bfree(ids as *mut u8, self.len as usize * size_of::<u32>()) };
        self.ids = RelPtr::null();
        self.len = 0;
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pick the real for `rnd`; the caller varies `rnd` per packet.
    #[inline]
    pub fn get(&self, rnd: u64) -> u32 {
        if self.len == 0 {
            return RING_VALUE_INVALID;
        }
        let idx = rnd % self.len;
        // SAFETY: idx < len.
        unsafe { *self.ids.load().add(idx as usize) }
    }
}
