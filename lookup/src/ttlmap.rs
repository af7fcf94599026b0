use core::alloc::Layout;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use slipstream_lib::fnv1a;
use slipstream_mem::{MemError, MemResult, MemoryContext, RelPtr, align_up};

const BUCKET_ALIGN: usize = 64;

/// Keys must be plain copyable values with a stable hash.
pub trait TtlKey: Copy + PartialEq {
    fn hash_key(&self) -> u64;
}

impl TtlKey for u32 {
    fn hash_key(&self) -> u64 {
        fnv1a(&self.to_ne_bytes())
    }
}

impl TtlKey for u64 {
    fn hash_key(&self) -> u64 {
        fnv1a(&self.to_ne_bytes())
    }
}

impl TtlKey for usize {
    fn hash_key(&self) -> u64 {
        fnv1a(&self.to_ne_bytes())
    }
}

/// Outcome of [`TtlMap::get`] when a slot was secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key present and fresh; the value is the stored one.
    Found,
    /// Entry created in a previously empty slot; value is uninitialized.
    Inserted,
    /// Entry created over a stale slot; value is leftover garbage.
    Replaced,
}

/// TTL hash map with bucket-level fine-grained locking.
///
/// A flat power-of-two array of buckets; each bucket starts with a single
/// 32-bit word carrying a sequence counter in the upper bits and a spin
/// bit in bit 0, followed by a small array of `(last_use, key, value)`
/// entries. The bucket layout is computed at init from the concrete key
/// and value sizes: as many entries as fit one cache line, or a single
/// entry in a 64-byte-multiple bucket when the pair is larger.
///
/// `last_use == 0` marks a free or tombstoned entry. Writers hold the
/// bucket spin bit for the duration of a scoped [`TtlSlot`] guard;
/// read-only lookups take a seqlock snapshot and retry on interference.
#[repr(C)]
pub struct TtlMap<K: TtlKey, V: Copy> {
    mctx: RelPtr<MemoryContext>,
    buckets: RelPtr<u8>,
    buckets_exp: u32,
    bucket_bytes: u32,
    entries_offset: u32,
    entries_per_bucket: u32,
    entry_bytes: u32,
    key_offset: u32,
    value_offset: u32,
    alloc_shift: u32,
    density: AtomicU32,
    _marker: PhantomData<(K, V)>,
}

// SAFETY: every mutation of bucket memory happens under the bucket's spin
// bit; concurrent readers use the seqlock protocol. The map header itself
// is immutable after init (except the relaxed density high-water).
unsafe impl<K: TtlKey, V: Copy> Sync for TtlMap<K, V> {}
unsafe impl<K: TtlKey, V: Copy> Send for TtlMap<K, V> {}

struct EntryLayout {
    entries_offset: u32,
    entries_per_bucket: u32,
    entry_bytes: u32,
    key_offset: u32,
    value_offset: u32,
    bucket_bytes: u32,
}

fn compute_layout<K, V>() -> EntryLayout {
    let last_use = Layout::new::<u32>();
    let (with_key, key_offset) = last_use.extend(Layout::new::<K>()).unwrap();
    let (with_value, value_offset) = with_key.extend(Layout::new::<V>()).unwrap();
    let entry = with_value.pad_to_align();

    let entries_offset = align_up(size_of::<AtomicU32>(), entry.align());
    let room = BUCKET_ALIGN.saturating_sub(entries_offset);
    let per_bucket = (room / entry.size()).max(1);
    let bucket_bytes = align_up(entries_offset + per_bucket * entry.size(), BUCKET_ALIGN);

    EntryLayout {
        entries_offset: entries_offset as u32,
        entries_per_bucket: per_bucket as u32,
        entry_bytes: entry.size() as u32,
        key_offset: key_offset as u32,
        value_offset: value_offset as u32,
        bucket_bytes: bucket_bytes as u32,
    }
}

impl<K: TtlKey, V: Copy> TtlMap<K, V> {
    /// Initialize with room for roughly `capacity` entries; the bucket
    /// count is `capacity / entries_per_bucket` rounded up to a power of
    /// two. Bucket memory is zeroed (every entry starts free).
    pub fn init(&mut self, mctx: *mut MemoryContext, capacity: usize) -> MemResult {
        let layout = compute_layout::<K, V>();
        let buckets = (capacity.max(1) / layout.entries_per_bucket as usize)
            .max(1)
            .next_power_of_two();

        self.mctx = RelPtr::null();
        self.mctx.store(mctx);
        self.buckets_exp = buckets.trailing_zeros();
        self.bucket_bytes = layout.bucket_bytes;
        self.entries_offset = layout.entries_offset;
        self.entries_per_bucket = layout.entries_per_bucket;
        self.entry_bytes = layout.entry_bytes;
        self.key_offset = layout.key_offset;
        self.value_offset = layout.value_offset;
        self.density = AtomicU32::new(0);

        let total = buckets * layout.bucket_bytes as usize;
        // Blocks are only 8-aligned; over-allocate to place buckets on a
        // cache-line boundary and remember the shift for free().
        // SAFETY: live single-writer context.
        let raw = unsafe { (*mctx).balloc_zeroed(total + BUCKET_ALIGN) };
        if raw.is_null() {
            return Err(MemError::OutOfMemory);
        }
        let aligned = align_up(raw as usize, BUCKET_ALIGN);
        self.alloc_shift = (aligned - raw as usize) as u32;
        self.buckets = RelPtr::null();
        self.buckets.store(aligned as *mut u8);
        Ok(())
    }

    /// Initialize an empty shell with no bucket storage (capacity 0);
    /// used for the idle generation of a resizable table.
    pub fn init_empty(&mut self) {
        let layout = compute_layout::<K, V>();
        self.mctx = RelPtr::null();
        self.buckets = RelPtr::null();
        self.buckets_exp = 0;
        self.bucket_bytes = layout.bucket_bytes;
        self.entries_offset = layout.entries_offset;
        self.entries_per_bucket = layout.entries_per_bucket;
        self.entry_bytes = layout.entry_bytes;
        self.key_offset = layout.key_offset;
        self.value_offset = layout.value_offset;
        self.alloc_shift = 0;
        self.density = AtomicU32::new(0);
    }

    pub fn free(&mut self) {
        let mctx = self.mctx.load();
        let buckets = self.buckets.load();
        if mctx.is_null() || buckets.is_null() {
            return;
        }
        let total = self.bucket_count() * self.bucket_bytes as usize;
        let raw = (buckets as usize - self.alloc_shift as usize) as *mut u8;
        // SAFETY: `raw`/size match the init-time allocation.
        unsafe { (*mctx).bfree(raw, total + BUCKET_ALIGN) };
        self.buckets = RelPtr::null();
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        if self.buckets.is_null() {
            0
        } else {
            1usize << self.buckets_exp
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.bucket_count() * self.entries_per_bucket as usize
    }

    /// Bucket occupancy high-water mark in eighths (0..=8). A value of 7
    /// or above is the resize trigger for tables built on this map.
    #[inline]
    pub fn density(&self) -> u32 {
        self.density.load(Ordering::Relaxed)
    }

    #[inline]
    fn bucket_for(&self, key: &K) -> *mut u8 {
        let mask = (1u64 << self.buckets_exp) - 1;
        let idx = key.hash_key() & mask;
        // SAFETY: masked index into the bucket array.
        unsafe { self.buckets.load().add(idx as usize * self.bucket_bytes as usize) }
    }

    #[inline]
    unsafe fn entry(&self, bucket: *mut u8, idx: u32) -> *mut u8 {
        unsafe {
            bucket.add(self.entries_offset as usize + (idx * self.entry_bytes) as usize)
        }
    }

    #[inline]
    unsafe fn entry_last_use(&self, entry: *mut u8) -> *mut u32 {
        entry as *mut u32
    }

    #[inline]
    unsafe fn entry_key(&self, entry: *mut u8) -> *mut K {
        unsafe { entry.add(self.key_offset as usize) as *mut K }
    }

    #[inline]
    unsafe fn entry_value(&self, entry: *mut u8) -> *mut V {
        unsafe { entry.add(self.value_offset as usize) as *mut V }
    }

    /// Find or create an entry for `key`.
    ///
    /// Returns a locked [`TtlSlot`] on success (`Found`, `Inserted` or
    /// `Replaced`); `None` means the bucket is full of fresh entries
    /// (transient overflow — the caller drops and counts). On `Found` the
    /// entry's `last_use` is refreshed to `now`; on `Inserted`/`Replaced`
    /// the slot is claimed and the value is the caller's to initialize.
    pub fn get(&self, key: &K, now: u32, timeout: u32) -> Option<TtlSlot<'_, V>> {
        let bucket = self.bucket_for(key);
        // SAFETY: bucket points at an initialized bucket; entry accessors
        // stay inside it; mutations happen under the spin bit we acquire.
        unsafe {
            let lock = &*(bucket as *const AtomicU32);
            lock_bucket(lock);

            let mut empty: Option<*mut u8> = None;
            let mut stale: Option<*mut u8> = None;
            let mut found: Option<*mut u8> = None;

            for idx in 0..self.entries_per_bucket {
                let entry = self.entry(bucket, idx);
                let last_use = *self.entry_last_use(entry);
                if last_use == 0 {
                    empty.get_or_insert(entry);
                    continue;
                }
                if *self.entry_key(entry) == *key {
                    if last_use + timeout > now {
                        found = Some(entry);
                        break;
                    }
                    stale = Some(entry);
                } else if last_use + timeout <= now {
                    stale.get_or_insert(entry);
                }
            }

            let (entry, status) = if let Some(entry) = found {
                (entry, TtlStatus::Found)
            } else if let Some(entry) = empty {
                (entry, TtlStatus::Inserted)
            } else if let Some(entry) = stale {
                (entry, TtlStatus::Replaced)
            } else {
                unlock_bucket(lock);
                return None;
            };

            *self.entry_key(entry) = *key;
            // Zero is the free marker, so a claim at t=0 registers as t=1.
            *self.entry_last_use(entry) = now.max(1);

            let mut used = 0;
            for idx in 0..self.entries_per_bucket {
                if *self.entry_last_use(self.entry(bucket, idx)) != 0 {
                    used += 1;
                }
            }
            let density = used * 8 / self.entries_per_bucket;
            self.density.fetch_max(density, Ordering::Relaxed);

            Some(TtlSlot {
                status,
                value: self.entry_value(entry),
                last_use: self.entry_last_use(entry),
                lock,
                _marker: PhantomData,
            })
        }
    }

    /// Read-only lookup: copies the value out under a consistent seqlock
    /// snapshot. Freshness beyond the tombstone check is the caller's
    /// concern (flow values carry their own timeout).
    pub fn lookup(&self, key: &K, _now: u32) -> Option<V> {
        if self.buckets.is_null() {
            return None;
        }
        let bucket = self.bucket_for(key);
        // SAFETY: read-only scan of an initialized bucket, validated by
        // the sequence word; volatile reads keep the racy copy out of the
        // compiler's hands.
        unsafe {
            let lock = &*(bucket as *const AtomicU32);
            loop {
                let seq_before = lock.load(Ordering::Acquire);
                if seq_before & 1 != 0 {
                    spin_loop();
                    continue;
                }
                let mut result = None;
                for idx in 0..self.entries_per_bucket {
                    let entry = self.entry(bucket, idx);
                    let last_use = ptr::read_volatile(self.entry_last_use(entry));
                    if last_use == 0 {
                        continue;
                    }
                    let entry_key = ptr::read_volatile(self.entry_key(entry));
                    if entry_key == *key {
                        result = Some(ptr::read_volatile(self.entry_value(entry)));
                        break;
                    }
                }
                let seq_after = lock.load(Ordering::Acquire);
                if seq_before == seq_after {
                    return result;
                }
            }
        }
    }
}

#[inline]
fn lock_bucket(lock: &AtomicU32) {
    loop {
        let seq = lock.load(Ordering::Relaxed);
        if seq & 1 == 0
            && lock
                .compare_exchange_weak(seq, seq + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }
        spin_loop();
    }
}

#[inline]
fn unlock_bucket(lock: &AtomicU32) {
    // From the odd (locked) value to the next even one; the sequence
    // advances by two per write section.
    lock.fetch_add(1, Ordering::Release);
}

/// Scoped handle over a locked map entry. The bucket spin bit is held for
/// the guard's lifetime and released exactly once on drop.
pub struct TtlSlot<'a, V> {
    status: TtlStatus,
    value: *mut V,
    last_use: *mut u32,
    lock: &'a AtomicU32,
    _marker: PhantomData<&'a mut V>,
}

impl<'a, V> TtlSlot<'a, V> {
    #[inline]
    pub fn status(&self) -> TtlStatus {
        self.status
    }

    #[inline]
    pub fn value(&mut self) -> &mut V {
        // SAFETY: the bucket lock is held; the pointer targets a live
        // entry inside the bucket.
        unsafe { &mut *self.value }
    }

    #[inline]
    pub fn value_copy(&self) -> V
    where
        V: Copy,
    {
        // SAFETY: as in `value`.
        unsafe { *self.value }
    }

    /// Tombstone the entry: it reads as free to every later operation.
    #[inline]
    pub fn remove(&mut self) {
        // SAFETY: the bucket lock is held.
        unsafe { *self.last_use = 0 };
    }
}

impl<'a, V> Drop for TtlSlot<'a, V> {
    fn drop(&mut self) {
        unlock_bucket(self.lock);
    }
}
