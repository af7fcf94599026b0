use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::{debug, info};

use slipstream_lib::Rcu;
use slipstream_lookup::{TtlMap, TtlSlot, TtlStatus};
use slipstream_mem::{MemError, MemResult, MemoryContext, RelPtr, align_up};

use crate::session::{SessionId, SessionState};

/// Worker capacity of one session table.
pub const MAX_WORKERS: usize = 16;

/// Bucket-occupancy level (out of 8) at which the table resizes.
pub const EXTEND_DENSITY: u32 = 7;

/// Per-worker resize bookkeeping, cache-line padded.
///
/// While a resize is in flight a worker keeps resolving lookups against
/// the previous map until its own clock passes `max_deadline_prev_gen`
/// — after that every session the old map could still hold has expired
/// for this worker.
#[repr(C, align(64))]
pub struct WorkerInfo {
    pub last_timestamp: AtomicU32,
    pub max_deadline_current_gen: AtomicU32,
    pub max_deadline_prev_gen: AtomicU32,
    pub density_factor: AtomicU32,
    pub active_sessions: AtomicU64,
}

impl WorkerInfo {
    fn reset(&self) {
        self.last_timestamp.store(0, Ordering::Relaxed);
        self.max_deadline_current_gen.store(0, Ordering::Relaxed);
        self.max_deadline_prev_gen.store(0, Ordering::Relaxed);
        self.density_factor.store(0, Ordering::Relaxed);
        self.active_sessions.store(0, Ordering::Relaxed);
    }

    pub fn use_prev_gen(&self) -> bool {
        self.last_timestamp.load(Ordering::SeqCst)
            < self.max_deadline_prev_gen.load(Ordering::SeqCst)
    }
}

#[repr(C)]
pub struct SessionTableGen {
    pub map: TtlMap<SessionId, SessionState>,
    pub worker_info: [WorkerInfo; MAX_WORKERS],
}

/// Flow-state table: two TTL map generations plus the RCU domain that
/// guards the generation switch.
///
/// Workers enter a read-side critical section per packet; the control
/// plane resizes by standing up a double-capacity map in the idle
/// generation slot, flipping `current_gen`, and reclaiming the old map
/// once every worker has aged past it.
#[repr(C)]
pub struct SessionTable {
    pub generations: [SessionTableGen; 2],
    current_gen: AtomicU64,
    pub rcu: Rcu,
    pub workers: u64,
    mctx: RelPtr<MemoryContext>,
    alloc_shift: u32,
}

/// Result of a session acquisition.
pub enum SessionLookup<'a> {
    /// Session existed (or survived in the previous map); the slot holds
    /// its live state under the bucket lock.
    Found(TtlSlot<'a, SessionState>),
    /// A fresh slot was claimed; the caller decides whether the packet
    /// may open a session.
    Created(TtlSlot<'a, SessionState>),
    /// Bucket full of fresh sessions.
    Overflow,
}

impl SessionTable {
    /// Allocate and initialize a table for `capacity` sessions.
    ///
    /// # Safety
    ///
    /// `mctx` must be a live single-writer context inside the shared
    /// region; workers must not exceed [`MAX_WORKERS`].
    pub unsafe fn create(
        mctx: *mut MemoryContext,
        capacity: usize,
        workers: usize,
    ) -> Result<*mut SessionTable, MemError> {
        debug_assert!(workers <= MAX_WORKERS);
        unsafe {
            let total = size_of::<SessionTable>() + 64;
            let raw = (*mctx).balloc_zeroed(total);
            if raw.is_null() {
                return Err(MemError::OutOfMemory);
            }
            let aligned = align_up(raw as usize, 64);
            let table = aligned as *mut SessionTable;
            (*table).alloc_shift = (aligned - raw as usize) as u32;
            (*table).mctx = RelPtr::null();
            (*table).mctx.store(mctx);
            (*table).workers = workers as u64;
            (*table).current_gen = AtomicU64::new(0);
            (*table).rcu.init();

            (*table).generations[0].map.init(mctx, capacity)?;
            (*table).generations[1].map.init_empty();
            for generation in &mut (*table).generations {
                for info in &generation.worker_info {
                    info.reset();
                }
            }
            Ok(table)
        }
    }

    /// # Safety
    ///
    /// `table` must come from `create` and have no live readers.
    pub unsafe fn destroy(table: *mut SessionTable) {
        unsafe {
            let mctx = (*table).mctx.load();
            for generation in &mut (*table).generations {
                if generation.map.capacity() > 0 {
                    generation.map.free();
                }
            }
            let raw = (table as usize - (*table).alloc_shift as usize) as *mut u8;
            (*mctx).bfree(raw, size_of::<SessionTable>() + 64);
        }
    }

    #[inline]
    fn generation(&self, table_gen: u64) -> &SessionTableGen {
        &self.generations[(table_gen & 1) as usize]
    }

    /// The generation selected by a `begin_cs` result.
    #[inline]
    pub fn generation_ref(&self, table_gen: u64) -> &SessionTableGen {
        self.generation(table_gen)
    }

    #[inline]
    fn prev_generation(&self, table_gen: u64) -> &SessionTableGen {
        &self.generations[((table_gen & 1) ^ 1) as usize]
    }

    pub fn capacity(&self) -> usize {
        let table_gen = self.current_gen.load(Ordering::SeqCst);
        self.generation(table_gen).map.capacity()
    }

    /// Enter the per-packet critical section; returns the table
    /// generation to use for every access until [`Self::end_cs`].
    #[inline]
    pub fn begin_cs(&self, worker: usize) -> u64 {
        self.rcu.read_begin(worker, &self.current_gen)
    }

    #[inline]
    pub fn end_cs(&self, worker: usize) {
        self.rcu.read_end(worker);
    }

    /// Publish the worker's clock; called at the head of every batch.
    pub fn update_worker_time(&self, worker: usize, now: u32) {
        let table_gen = self.current_gen.load(Ordering::SeqCst);
        self.generation(table_gen).worker_info[worker]
            .last_timestamp
            .store(now, Ordering::SeqCst);
    }

    /// Find or open the session `id`.
    ///
    /// On a miss in the current map during a resize window, the previous
    /// map is consulted and a surviving session migrates into the fresh
    /// slot. The worker's deadline high-water and density bookkeeping
    /// are updated on every success.
    pub fn get_or_create(
        &self,
        table_gen: u64,
        worker: usize,
        now: u32,
        timeout: u32,
        id: &SessionId,
    ) -> SessionLookup<'_> {
        let generation = self.generation(table_gen);
        let Some(mut slot) = generation.map.get(id, now, timeout) else {
            return SessionLookup::Overflow;
        };

        let info = &generation.worker_info[worker];
        let deadline = info.max_deadline_current_gen.load(Ordering::SeqCst);
        info.max_deadline_current_gen
            .store(deadline.max(now + timeout), Ordering::SeqCst);
        info.density_factor
            .fetch_max(generation.map.density(), Ordering::Relaxed);

        match slot.status() {
            TtlStatus::Found => SessionLookup::Found(slot),
            TtlStatus::Inserted | TtlStatus::Replaced => {
                if info.use_prev_gen() {
                    let prev = self.prev_generation(table_gen);
                    if let Some(state) = prev.map.lookup(id, now) {
                        // Still fresh for this worker's clock?
                        if state.last_packet_timestamp + state.timeout > now {
                            *slot.value() = state;
                            return SessionLookup::Found(slot);
                        }
                    }
                }
                SessionLookup::Created(slot)
            }
        }
    }

    /// Read-only resolution of an existing session's real.
    pub fn get_session_real(
        &self,
        table_gen: u64,
        worker: usize,
        id: &SessionId,
        now: u32,
    ) -> Option<u32> {
        let generation = self.generation(table_gen);
        if let Some(state) = generation.map.lookup(id, now) {
            return Some(state.real_id);
        }
        if generation.worker_info[worker].use_prev_gen() {
            let prev = self.prev_generation(table_gen);
            if let Some(state) = prev.map.lookup(id, now) {
                return Some(state.real_id);
            }
        }
        None
    }

    /// Free the previous-generation map if no worker can still resolve
    /// sessions out of it. Returns true when memory was reclaimed.
    pub fn free_unused(&mut self) -> bool {
        let table_gen = self.current_gen.load(Ordering::SeqCst);
        let workers = self.workers as usize;
        {
            let generation = self.generation(table_gen);
            for info in &generation.worker_info[..workers] {
                if info.use_prev_gen() {
                    debug!("previous session map still referenced; not freeing");
                    return false;
                }
            }
        }
        // Drain in-flight readers before tearing the old map down.
        self.rcu.update(&self.current_gen, table_gen);

        let prev_idx = ((table_gen & 1) ^ 1) as usize;
        if self.generations[prev_idx].map.capacity() == 0 {
            return false;
        }
        self.generations[prev_idx].map.free();
        debug!("reclaimed previous session map generation");
        true
    }

    /// Resize to double capacity when the density signal demands it (or
    /// unconditionally with `force`). Returns `Ok(true)` on resize,
    /// `Ok(false)` when no resize was needed or possible yet.
    pub fn extend(&mut self, force: bool) -> MemResult<bool> {
        let table_gen = self.current_gen.load(Ordering::SeqCst);
        let workers = self.workers as usize;

        let mut density = 0u32;
        let mut active = 0u64;
        {
            let generation = self.generation(table_gen);
            for info in &generation.worker_info[..workers] {
                if info.use_prev_gen() {
                    // A previous resize is still draining.
                    return Ok(false);
                }
                density = density.max(info.density_factor.load(Ordering::SeqCst));
                active += info.active_sessions.load(Ordering::SeqCst);
            }
        }

        let capacity = self.generation(table_gen).map.capacity();
        log::trace!(
            "session table density={density} active={active} capacity={capacity}"
        );
        if density < EXTEND_DENSITY && !force {
            return Ok(false);
        }

        info!("extending session table from {capacity} entries");
        self.free_unused();
        let mctx = self.mctx.load();

        let next_idx = ((table_gen & 1) ^ 1) as usize;
        self.generations[next_idx].map.init(mctx, capacity * 2)?;
        {
            let cur = self.generation(table_gen);
            let next = &self.generations[next_idx];
            for worker in 0..workers {
                let cur_info = &cur.worker_info[worker];
                let next_info = &next.worker_info[worker];
                next_info.reset();
                next_info.max_deadline_prev_gen.store(
                    cur_info.max_deadline_current_gen.load(Ordering::SeqCst),
                    Ordering::SeqCst,
                );
            }
        }
        // Flip the generation; the RCU update doubles as the barrier
        // that no reader still observes the old generation index.
        self.rcu.update(&self.current_gen, table_gen + 1);
        info!("session table extended to {} entries", capacity * 2);
        Ok(true)
    }
}
