use slipstream_mem::{MemError, MemResult, MemoryContext, RelPtr};

#[repr(C)]
struct Slot {
    value: i64,
    generation: u32,
}

/// Ring of generation-tagged cumulative-delta slots.
///
/// `put(from, timeout, k)` records `+k` at `from` and `-k` at
/// `from + timeout`; `advance_time` rolls a running sum slot by slot so
/// that [`IntervalCounter::current_count`] equals the number of intervals
/// covering `now`. The ring holds `2 * max_timeout` rounded up to a power
/// of two slots; a slot reused one lap later is disambiguated by its
/// generation tag `t >> range_bits` and restarts from zero.
#[repr(C)]
pub struct IntervalCounter {
    mctx: RelPtr<MemoryContext>,
    range_size: u32,
    range_bits: u32,
    values: RelPtr<Slot>,
    max_timeout: u32,
    now: u32,
}

impl IntervalCounter {
    pub fn init(&mut self, now: u32, max_timeout: u32, mctx: *mut MemoryContext) -> MemResult {
        let len = 2 * max_timeout.max(1);
        self.range_bits = 32 - len.leading_zeros();
        self.range_size = 1u32 << self.range_bits;

        self.mctx = RelPtr::null();
        self.mctx.store(mctx);

        let bytes = self.range_size as usize * size_of::<Slot>();
        // SAFETY: the caller hands a live single-writer context.
        let values = unsafe { (*mctx).balloc_zeroed(bytes) } as *mut Slot;
        if values.is_null() {
            return Err(MemError::OutOfMemory);
        }
        self.values = RelPtr::null();
        self.values.store(values);

        self.max_timeout = max_timeout;
        self.now = now;
        Ok(())
    }

    pub fn free(&mut self) {
        let mctx = self.mctx.load();
        let values = self.values.load();
        if mctx.is_null() || values.is_null() {
            return;
        }
        let bytes = self.range_size as usize * size_of::<Slot>();
        // SAFETY: `values` came from this context in `init`.
        unsafe { (*mctx).bfree(values as *mut u8, bytes) };
        self.values = RelPtr::null();
    }

    fn slot(&mut self, point: u32) -> *mut i64 {
        let values = self.values.load();
        let generation = point >> self.range_bits;
        // SAFETY: the ring spans `range_size` slots and the index is
        // masked into it.
        unsafe {
            let slot = values.add((point & (self.range_size - 1)) as usize);
            if (*slot).generation != generation {
                (*slot).value = 0;
                (*slot).generation = generation;
            }
            &mut (*slot).value
        }
    }

    /// Record `count` intervals `[from, from + timeout)`.
    pub fn put(&mut self, from: u32, timeout: u32, count: i32) {
        debug_assert!(timeout <= self.max_timeout);
        // SAFETY: `slot` returns a live ring entry.
        unsafe {
            *self.slot(from) += count as i64;
            *self.slot(from + timeout) -= count as i64;
        }
    }

    /// Roll the running sum forward to `to`.
    pub fn advance_time(&mut self, to: u32) {
        debug_assert!(self.now <= to);
        while self.now < to {
            let values = self.values.load();
            // SAFETY: masked index into the ring.
            let prev =
                unsafe { (*values.add((self.now & (self.range_size - 1)) as usize)).value };
            self.now += 1;
            unsafe { *self.slot(self.now) += prev };
        }
    }

    /// Number of intervals covering the current time.
    pub fn current_count(&self) -> u64 {
        let values = self.values.load();
        // SAFETY: masked index into the ring.
        let value = unsafe { (*values.add((self.now & (self.range_size - 1)) as usize)).value };
        debug_assert!(value >= 0);
        value as u64
    }

    pub fn now(&self) -> u32 {
        self.now
    }
}
