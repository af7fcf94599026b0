use slipstream_mem::{MemError, MemResult, MemoryContext, RelPtr};

pub const COUNTER_NAME_LEN: usize = 64;
/// Counter sizes are powers of two up to 16 words; pool `k` holds
/// size-`2^k` counters.
pub const COUNTER_MAX_SIZE_EXP: usize = 4;
pub const COUNTER_POOL_SIZE: usize = COUNTER_MAX_SIZE_EXP + 1;
/// One storage page: 4096 bytes of 64-bit words per worker.
pub const COUNTER_PAGE_WORDS: usize = 4096 / size_of::<u64>();
pub const COUNTER_INVALID: u64 = u64::MAX;

#[repr(C)]
struct CounterName {
    name: [u8; COUNTER_NAME_LEN],
    size: u64,
    generation: u64,
}

/// Resolved placement of a registered counter: its pool and the word
/// offset inside the pool's page space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CounterLink {
    pub offset: u64,
    pub pool_idx: u64,
}

/// Name-keyed counter allocation registry.
///
/// Registration assigns each `(name, size)` a stable id; re-registering
/// an existing pair returns the same id, which is what keeps counter
/// values alive across configuration generations (the storage spawn
/// shares the pages the id points into).
#[repr(C)]
pub struct CounterRegistry {
    mctx: RelPtr<MemoryContext>,
    pub generation: u64,
    capacity: u64,
    count: u64,
    counts: [u64; COUNTER_POOL_SIZE],
    names: RelPtr<CounterName>,
    links: RelPtr<CounterLink>,
}

const INITIAL_CAPACITY: u64 = 16;

impl CounterRegistry {
    pub fn init(&mut self, mctx: *mut MemoryContext, generation: u64) -> MemResult {
        self.mctx = RelPtr::null();
        self.mctx.store(mctx);
        self.generation = generation;
        self.capacity = INITIAL_CAPACITY;
        self.count = 0;
        self.counts = [0; COUNTER_POOL_SIZE];
        // SAFETY: live single-writer context.
        unsafe {
            let names = (*mctx).balloc_zeroed(Self::names_bytes(self.capacity));
            let links = (*mctx).balloc_zeroed(Self::links_bytes(self.capacity));
            if names.is_null() || links.is_null() {
                return Err(MemError::OutOfMemory);
            }
            self.names = RelPtr::null();
            self.names.store(names as *mut CounterName);
            self.links = RelPtr::null();
            self.links.store(links as *mut CounterLink);
        }
        Ok(())
    }

    /// Copy `src` into a fresh registry one generation up; ids, pools
    /// and offsets are preserved so links stay valid.
    pub fn copy_from(&mut self, src: &CounterRegistry, mctx: *mut MemoryContext) -> MemResult {
        self.init(mctx, src.generation + 1)?;
        while self.capacity < src.count {
            self.grow()?;
        }
        // SAFETY: both arrays sized at least `src.count`.
        unsafe {
            core::ptr::copy_nonoverlapping(src.names.load(), self.names.load(), src.count as usize);
            core::ptr::copy_nonoverlapping(src.links.load(), self.links.load(), src.count as usize);
        }
        self.count = src.count;
        self.counts = src.counts;
        Ok(())
    }

    fn names_bytes(capacity: u64) -> usize {
        capacity as usize * size_of::<CounterName>()
    }

    fn links_bytes(capacity: u64) -> usize {
        capacity as usize * size_of::<CounterLink>()
    }

    fn grow(&mut self) -> MemResult {
        let mctx = self.mctx.load();
        let new_capacity = self.capacity * 2;
        // SAFETY: arrays are copied before the old ones are freed.
        unsafe {
            let names = (*mctx).balloc_zeroed(Self::names_bytes(new_capacity)) as *mut CounterName;
            let links = (*mctx).balloc_zeroed(Self::links_bytes(new_capacity)) as *mut CounterLink;
            if names.is_null() || links.is_null() {
                return Err(MemError::OutOfMemory);
            }
            core::ptr::copy_nonoverlapping(self.names.load(), names, self.count as usize);
            core::ptr::copy_nonoverlapping(self.links.load(), links, self.count as usize);
            (*mctx).bfree(self.names.load() as *mut u8, Self::names_bytes(self.capacity));
            (*mctx).bfree(self.links.load() as *mut u8, Self::links_bytes(self.capacity));
            self.names.store(names);
            self.links.store(links);
        }
        self.capacity = new_capacity;
        Ok(())
    }

    /// Register a counter of `size` 64-bit words (1, 2, 4, 8 or 16).
    /// Returns its id, or [`COUNTER_INVALID`] on exhaustion/bad size.
    pub fn register(&mut self, name: &str, size: u64) -> u64 {
        if size == 0 || !size.is_power_of_two() || size > 1 << COUNTER_MAX_SIZE_EXP {
            return COUNTER_INVALID;
        }
        // Same (name, size) resolves to the existing id.
        for id in 0..self.count {
            // SAFETY: `id` bounded by count.
            let entry = unsafe { &*self.names.load().add(id as usize) };
            if entry.size == size && entry_name(entry) == name {
                return id;
            }
        }

        if self.count == self.capacity && self.grow().is_err() {
            return COUNTER_INVALID;
        }

        let pool_idx = size.trailing_zeros() as u64;
        let id = self.count;
        // SAFETY: arrays span `capacity` entries.
        unsafe {
            let entry = &mut *self.names.load().add(id as usize);
            entry.name = [0; COUNTER_NAME_LEN];
            let bytes = name.as_bytes();
            let len = bytes.len().min(COUNTER_NAME_LEN - 1);
            entry.name[..len].copy_from_slice(&bytes[..len]);
            entry.size = size;
            entry.generation = self.generation;

            *self.links.load().add(id as usize) = CounterLink {
                offset: self.counts[pool_idx as usize],
                pool_idx,
            };
        }
        self.counts[pool_idx as usize] += size;
        self.count += 1;
        id
    }

    pub fn link(&self, id: u64) -> Option<CounterLink> {
        if id >= self.count {
            return None;
        }
        // SAFETY: bounded above.
        Some(unsafe { *self.links.load().add(id as usize) })
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn pool_words(&self, pool_idx: usize) -> u64 {
        self.counts[pool_idx]
    }

    pub fn free(&mut self) {
        let mctx = self.mctx.load();
        if mctx.is_null() {
            return;
        }
        // SAFETY: sizes match the live capacity.
        unsafe {
            (*mctx).bfree(self.names.load() as *mut u8, Self::names_bytes(self.capacity));
            (*mctx).bfree(self.links.load() as *mut u8, Self::links_bytes(self.capacity));
        }
        self.names = RelPtr::null();
        self.links = RelPtr::null();
        self.count = 0;
    }
}

fn entry_name(entry: &CounterName) -> &str {
    let end = entry.name.iter().position(|&b| b == 0).unwrap_or(0);
    core::str::from_utf8(&entry.name[..end]).unwrap_or("")
}

#[repr(C)]
struct CounterStorageBlock {
    refcnt: u64,
    /// `instance_count` consecutive pages of [`COUNTER_PAGE_WORDS`]
    /// words; worker `w` owns words `w*PAGE .. (w+1)*PAGE`.
    pages: RelPtr<u64>,
}

#[repr(C)]
struct CounterStoragePool {
    block_count: u64,
    blocks: RelPtr<RelPtr<CounterStorageBlock>>,
}

/// Materialized per-worker counter pages for one registry.
///
/// Storages are reference counted and spawned from a predecessor: blocks
/// that already existed in the predecessor are shared (their refcount
/// bumped), so counters registered before the configuration swap keep
/// accumulating in place; blocks beyond the predecessor's coverage are
/// freshly zeroed.
#[repr(C)]
pub struct CounterStorage {
    mctx: RelPtr<MemoryContext>,
    pub registry: RelPtr<CounterRegistry>,
    instance_count: u64,
    refcnt: u64,
    pools: [CounterStoragePool; COUNTER_POOL_SIZE],
}

impl CounterStorage {
    /// # Safety
    ///
    /// `mctx` and `registry` must be live; `old` is either null or a
    /// storage spawned for a predecessor of `registry`.
    pub unsafe fn spawn(
        mctx: *mut MemoryContext,
        instance_count: u64,
        old: *mut CounterStorage,
        registry: *mut CounterRegistry,
    ) -> Result<*mut CounterStorage, MemError> {
        unsafe {
            let storage =
                (*mctx).balloc_zeroed(size_of::<CounterStorage>()) as *mut CounterStorage;
            if storage.is_null() {
                return Err(MemError::OutOfMemory);
            }
            (*storage).mctx = RelPtr::null();
            (*storage).mctx.store(mctx);
            (*storage).registry = RelPtr::null();
            (*storage).registry.store(registry);
            (*storage).instance_count = instance_count;
            (*storage).refcnt = 1;

            let page_bytes = instance_count as usize * COUNTER_PAGE_WORDS * size_of::<u64>();
            for pool_idx in 0..COUNTER_POOL_SIZE {
                let words = (*registry).pool_words(pool_idx);
                let block_count = words.div_ceil(COUNTER_PAGE_WORDS as u64);
                let pool = &mut (*storage).pools[pool_idx];
                pool.block_count = block_count;
                pool.blocks = RelPtr::null();
                if block_count == 0 {
                    continue;
                }
                let table = (*mctx)
                    .balloc_zeroed(block_count as usize * size_of::<RelPtr<CounterStorageBlock>>())
                    as *mut RelPtr<CounterStorageBlock>;
                if table.is_null() {
                    return Err(MemError::OutOfMemory);
                }
                pool.blocks.store(table);

                for block_idx in 0..block_count {
                    let shared = if !old.is_null()
                        && block_idx < (*old).pools[pool_idx].block_count
                    {
                        let old_block = (*(*old).pools[pool_idx]
                            .blocks
                            .load()
                            .add(block_idx as usize))
                        .load();
                        (*old_block).refcnt += 1;
                        Some(old_block)
                    } else {
                        None
                    };
                    let block = match shared {
                        Some(block) => block,
                        None => {
                            let block = (*mctx).balloc_zeroed(size_of::<CounterStorageBlock>())
                                as *mut CounterStorageBlock;
                            if block.is_null() {
                                return Err(MemError::OutOfMemory);
                            }
                            let pages = (*mctx).balloc_zeroed(page_bytes) as *mut u64;
                            if pages.is_null() {
                                return Err(MemError::OutOfMemory);
                            }
                            (*block).refcnt = 1;
                            (*block).pages = RelPtr::null();
                            (*block).pages.store(pages);
                            block
                        }
                    };
                    let slot = pool.blocks.load().add(block_idx as usize);
                    *slot = RelPtr::null();
                    (*slot).store(block);
                }
            }
            Ok(storage)
        }
    }

    /// Address of counter word 0 for `link` inside `worker`'s page.
    ///
    /// # Safety
    ///
    /// `link` must come from the storage's registry and `worker` be below
    /// the instance count. The returned pointer stays valid while the
    /// storage (or any sharer of the block) is alive.
    pub unsafe fn address(&self, link: CounterLink, worker: u64) -> *mut u64 {
        debug_assert!(worker < self.instance_count);
        let pool = &self.pools[link.pool_idx as usize];
        let block_idx = link.offset / COUNTER_PAGE_WORDS as u64;
        let word = link.offset % COUNTER_PAGE_WORDS as u64;
        // SAFETY: per contract, the block exists and pages span
        // `instance_count * COUNTER_PAGE_WORDS` words.
        unsafe {
            let block = (*pool.blocks.load().add(block_idx as usize)).load();
            (*block)
                .pages
                .load()
                .add((worker * COUNTER_PAGE_WORDS as u64 + word) as usize)
        }
    }

    /// Sum a counter's words across all workers (read-time accumulation;
    /// single-writer-per-worker makes relaxed reads sufficient).
    ///
    /// # Safety
    ///
    /// As for [`CounterStorage::address`].
    pub unsafe fn accumulate(&self, link: CounterLink, size: u64) -> Vec<u64> {
        let mut totals = vec![0u64; size as usize];
        for worker in 0..self.instance_count {
            // SAFETY: per contract.
            unsafe {
                let base = self.address(link, worker);
                for word in 0..size as usize {
                    totals[word] =
                        totals[word].wrapping_add(core::ptr::read_volatile(base.add(word)));
                }
            }
        }
        totals
    }

    /// Drop one reference; frees pools and unshared blocks at zero.
    ///
    /// # Safety
    ///
    /// `storage` must have been produced by `spawn` and not freed past
    /// its reference count.
    pub unsafe fn release(storage: *mut CounterStorage) {
        unsafe {
            (*storage).refcnt -= 1;
            if (*storage).refcnt > 0 {
                return;
            }
            let mctx = (*storage).mctx.load();
            let page_bytes =
                (*storage).instance_count as usize * COUNTER_PAGE_WORDS * size_of::<u64>();
            for pool_idx in 0..COUNTER_POOL_SIZE {
                let pool = &mut (*storage).pools[pool_idx];
                if pool.block_count == 0 {
                    continue;
                }
                for block_idx in 0..pool.block_count {
                    let block = (*pool.blocks.load().add(block_idx as usize)).load();
                    (*block).refcnt -= 1;
                    if (*block).refcnt == 0 {
                        (*mctx).bfree((*block).pages.load() as *mut u8, page_bytes);
                        (*mctx).bfree(block as *mut u8, size_of::<CounterStorageBlock>());
                    }
                }
                (*mctx).bfree(
                    pool.blocks.load() as *mut u8,
                    pool.block_count as usize * size_of::<RelPtr<CounterStorageBlock>>(),
                );
            }
            (*mctx).bfree(storage as *mut u8, size_of::<CounterStorage>());
        }
    }

    /// Take an extra reference (a new generation keeps the storage).
    ///
    /// # Safety
    ///
    /// `storage` must be live.
    pub unsafe fn acquire(storage: *mut CounterStorage) {
        unsafe { (*storage).refcnt += 1 };
    }
}
